//! Host networking helpers: port brokering, namespace resolution and the
//! addresses invocations should use.

use std::net::TcpListener;

use anyhow::{Context, Result};

pub const DEFAULT_NAMESPACE: &str = "nuclio";

/// Sentinel callers may pass to mean "whatever namespace the platform
/// itself lives in".
pub const SELF_NAMESPACE_SENTINEL: &str = "@nuclio.selfNamespace";

/// Default docker bridge gateway, reachable from inside containers.
pub const DOCKER_BRIDGE_IP: &str = "172.17.0.1";

pub const TEST_HOST_ENV: &str = "NUCLIO_TEST_HOST";

/// Ask the kernel for a free loopback TCP port.
///
/// The port is advisory: the listener is closed before returning, so
/// another process may grab it first. The container run that immediately
/// follows fails loudly on collision, prompting a retry at a higher layer.
pub fn allocate_free_local_port() -> Result<u16> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).context("Failed to bind loopback listener")?;
    let port = listener
        .local_addr()
        .context("Failed to read listener address")?
        .port();
    Ok(port)
}

pub fn running_in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}

pub fn resolve_default_namespace(namespace: &str) -> String {
    if namespace.is_empty() || namespace == SELF_NAMESPACE_SENTINEL {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace.to_string()
    }
}

/// Addresses invocations use when going through an external IP, in
/// precedence order: configured addresses, the test-host override, the
/// docker bridge when running containerized, and finally an empty string
/// for backwards compatibility.
pub fn external_ip_addresses(configured: &[String]) -> Vec<String> {
    if !configured.is_empty() {
        return configured.to_vec();
    }

    if let Ok(host) = std::env::var(TEST_HOST_ENV) {
        if !host.is_empty() {
            return vec![host];
        }
    }

    if running_in_container() {
        return vec![DOCKER_BRIDGE_IP.to_string()];
    }

    vec![String::new()]
}

pub fn default_invoke_ip_addresses() -> Vec<String> {
    vec![DOCKER_BRIDGE_IP.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_free_local_port() {
        let port = allocate_free_local_port().unwrap();
        assert!(port >= 1024);

        // the port is free again once the broker returns
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_resolve_default_namespace() {
        assert_eq!(resolve_default_namespace(""), "nuclio");
        assert_eq!(resolve_default_namespace("@nuclio.selfNamespace"), "nuclio");
        assert_eq!(resolve_default_namespace("team-a"), "team-a");
    }

    #[test]
    fn test_configured_external_addresses_win() {
        let configured = vec!["10.0.0.7".to_string()];
        assert_eq!(external_ip_addresses(&configured), configured);
    }

    #[test]
    fn test_default_invoke_addresses() {
        assert_eq!(default_invoke_ip_addresses(), vec!["172.17.0.1"]);
    }
}
