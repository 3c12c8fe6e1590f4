//! External image builder contract.
//!
//! Building function images from source is the job of an external
//! collaborator; the lifecycle engine only depends on this seam. The
//! default implementation deploys prebuilt images as-is.

use anyhow::Result;
use async_trait::async_trait;

use crate::{functionconfig::FunctionConfig, logstream::DeployLogStream};

#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Image the deploy step should run.
    pub image: String,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        logger: &DeployLogStream,
        config: &FunctionConfig,
    ) -> Result<BuildResult>;
}

/// Deploys the image named by the spec without building anything.
pub struct PrebuiltImageBuilder;

#[async_trait]
impl ImageBuilder for PrebuiltImageBuilder {
    async fn build(
        &self,
        logger: &DeployLogStream,
        config: &FunctionConfig,
    ) -> Result<BuildResult> {
        if config.spec.image.is_empty() {
            anyhow::bail!("Function spec does not name an image");
        }
        logger.info(format!("Using prebuilt image {}", config.spec.image));
        Ok(BuildResult {
            image: config.spec.image.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functionconfig::{FunctionMeta, FunctionSpec};

    #[tokio::test]
    async fn test_prebuilt_builder_requires_image() {
        let logger = DeployLogStream::new("nuclio:echo");
        let mut config = FunctionConfig {
            meta: FunctionMeta::new("nuclio", "echo"),
            spec: FunctionSpec::default(),
        };

        assert!(PrebuiltImageBuilder
            .build(&logger, &config)
            .await
            .is_err());

        config.spec.image = "echo:1".to_string();
        let result = PrebuiltImageBuilder.build(&logger, &config).await.unwrap();
        assert_eq!(result.image, "echo:1");
    }
}
