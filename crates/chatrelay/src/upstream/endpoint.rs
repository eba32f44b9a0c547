//! Gateway URL resolution and validation
//!
//! The gateway base URL comes from configuration or `LITELLM_BASE_URL`. Inside
//! a container a loopback address points at the container itself, so it is
//! replaced with the gateway service name. Selection is a pure function of its
//! inputs; `running_in_container` is the only probe of the host.

use std::path::Path;
use url::Url;

use crate::error::{ChatRelayError, Result};

/// Gateway address as seen from inside the compose network
pub const CONTAINER_GATEWAY_URL: &str = "http://llm_proxy:4000";

/// Gateway address published on the host
pub const LOCAL_GATEWAY_URL: &str = "http://localhost:41337";

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Pick the gateway base URL from the configured value and container state
pub fn resolve_base_url(configured: Option<&str>, in_container: bool) -> String {
    match configured.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) if in_container && is_loopback(url) => CONTAINER_GATEWAY_URL.to_string(),
        Some(url) => url.to_string(),
        None if in_container => CONTAINER_GATEWAY_URL.to_string(),
        None => LOCAL_GATEWAY_URL.to_string(),
    }
}

fn is_loopback(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1")
}

/// True when the process runs inside a Docker container
pub fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Validated chat completions endpoint of the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEndpoint {
    /// Full URL of the chat completions endpoint
    pub url: Url,
    /// Gateway host, for logging
    pub host: String,
}

impl GatewayEndpoint {
    /// Build the endpoint from a gateway base URL.
    ///
    /// Only http and https are accepted. Credentials embedded in the URL are
    /// stripped with a warning; use the API key setting instead.
    ///
    /// # Examples
    /// ```
    /// # use chatrelay::upstream::GatewayEndpoint;
    /// let endpoint = GatewayEndpoint::from_base_url("http://llm_proxy:4000/").unwrap();
    /// assert_eq!(endpoint.url.as_str(), "http://llm_proxy:4000/v1/chat/completions");
    /// ```
    pub fn from_base_url(base: &str) -> Result<Self> {
        let mut url = Url::parse(base.trim())
            .map_err(|e| ChatRelayError::Config(format!("Invalid gateway URL '{base}': {e}")))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ChatRelayError::Config(format!(
                "Unsupported gateway URL scheme '{scheme}': only http and https are allowed"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ChatRelayError::Config(format!("Gateway URL '{base}' has no host")))?
            .to_string();

        if !url.username().is_empty() || url.password().is_some() {
            tracing::warn!("Gateway URL contains credentials which have been stripped");
            url.set_username("")
                .map_err(|_| ChatRelayError::Config("Failed to strip username from URL".to_string()))?;
            url.set_password(None)
                .map_err(|_| ChatRelayError::Config("Failed to strip password from URL".to_string()))?;
        }

        url.set_fragment(None);
        url.set_query(None);
        let path = format!("{}{CHAT_COMPLETIONS_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);

        Ok(Self { url, host })
    }
}
