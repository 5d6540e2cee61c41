//! Endpoint context and configuration resolution.
//!
//! The context carries everything needed to sign and send one request:
//! the management server endpoint, the API key pair, and optional proxy
//! settings. It also names the caller's active zone and account, which the
//! resource adapters use for locality filtering and ownership checks.

use serde::{Deserialize, Serialize};

/// Page size used by every paginated listing.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Descriptive user agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "SortOfRemoteNG/1.0 cloudstack-client/0.1";

/// HTTP proxy that requests are routed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: Option<u16>,
}

/// Read-only context for a single CloudStack request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointContext {
    /// Management server endpoint, e.g. `https://cloud.example.com/client`.
    pub endpoint: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// The caller's active zone.
    #[serde(default)]
    pub region_id: Option<String>,
    /// The caller's account name.
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl std::fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointContext")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("proxy", &self.proxy)
            .field("region_id", &self.region_id)
            .field("account_number", &self.account_number)
            .finish()
    }
}

impl EndpointContext {
    pub fn new(endpoint: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            proxy: None,
            region_id: None,
            account_number: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }

    pub fn with_region(mut self, region_id: &str) -> Self {
        self.region_id = Some(region_id.to_string());
        self
    }

    pub fn with_account(mut self, account_number: &str) -> Self {
        self.account_number = Some(account_number.to_string());
        self
    }

    pub fn with_proxy(mut self, host: &str, port: Option<u16>) -> Self {
        self.proxy = Some(ProxyConfig {
            host: host.to_string(),
            port,
        });
        self
    }

    /// Load a context from `CLOUDSTACK_*` environment variables.
    pub fn from_environment() -> Option<Self> {
        let endpoint = std::env::var("CLOUDSTACK_ENDPOINT").ok()?;
        let api_key = std::env::var("CLOUDSTACK_API_KEY").ok()?;
        let api_secret = std::env::var("CLOUDSTACK_SECRET_KEY").ok()?;
        let mut ctx = Self::new(&endpoint, &api_key, &api_secret);
        ctx.region_id = std::env::var("CLOUDSTACK_REGION").ok();
        ctx.account_number = std::env::var("CLOUDSTACK_ACCOUNT").ok();
        if let Ok(host) = std::env::var("CLOUDSTACK_PROXY_HOST") {
            let port = std::env::var("CLOUDSTACK_PROXY_PORT")
                .ok()
                .and_then(|p| p.trim().parse::<u16>().ok());
            ctx.proxy = Some(ProxyConfig { host, port });
        }
        Some(ctx)
    }

    /// Copy of this context with carriage returns stripped from both keys.
    pub fn sanitized(&self) -> Self {
        let mut ctx = self.clone();
        ctx.api_key = ctx.api_key.replace('\r', "");
        ctx.api_secret = ctx.api_secret.replace('\r', "");
        ctx
    }

    /// Validate that the context can sign a request.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("No endpoint was configured".to_string());
        }
        let endpoint = url::Url::parse(self.endpoint.trim())
            .map_err(|e| format!("Invalid endpoint {}: {}", self.endpoint, e))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(format!("Unsupported endpoint scheme: {}", endpoint.scheme()));
        }
        if self.api_key.trim().is_empty() {
            return Err("No API key was configured".to_string());
        }
        if self.api_secret.trim().is_empty() {
            return Err("No secret key was configured".to_string());
        }
        if let Some(ref proxy) = self.proxy {
            if proxy.host.trim().is_empty() {
                return Err("Proxy host is empty".to_string());
            }
        }
        Ok(())
    }
}

// ── Context provider ────────────────────────────────────────────────────

/// Supplies the endpoint context; consulted once per request.
pub trait ContextProvider: Send + Sync {
    fn context(&self) -> Option<EndpointContext>;
}

impl ContextProvider for EndpointContext {
    fn context(&self) -> Option<EndpointContext> {
        Some(self.clone())
    }
}

impl ContextProvider for Option<EndpointContext> {
    fn context(&self) -> Option<EndpointContext> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_strips_carriage_returns() {
        let ctx = EndpointContext::new("https://cs.example.com/client", "key\r", "se\rcret\r");
        let clean = ctx.sanitized();
        assert_eq!(clean.api_key, "key");
        assert_eq!(clean.api_secret, "secret");
        assert_eq!(ctx.api_key, "key\r");
    }

    #[test]
    fn validate_requires_keys() {
        let ok = EndpointContext::new("https://cs.example.com", "k", "s");
        assert!(ok.validate().is_ok());
        assert!(EndpointContext::new("", "k", "s").validate().is_err());
        assert!(EndpointContext::new("https://x", " ", "s").validate().is_err());
        assert!(EndpointContext::new("https://x", "k", "").validate().is_err());
        assert!(EndpointContext::new("cs.example.com/client", "k", "s").validate().is_err());
        assert!(EndpointContext::new("ftp://cs.example.com", "k", "s").validate().is_err());
        let bad_proxy = ok.with_proxy("", Some(3128));
        assert!(bad_proxy.validate().is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let ctx = EndpointContext::new("https://x", "key", "topsecret");
        let dbg = format!("{:?}", ctx);
        assert!(dbg.contains("key"));
        assert!(!dbg.contains("topsecret"));
    }

    #[test]
    fn deserialize_applies_defaults() {
        let json = r#"{"endpoint":"https://x/client","apiKey":"k","apiSecret":"s","regionId":"zone-1"}"#;
        let ctx: EndpointContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.region_id.as_deref(), Some("zone-1"));
        assert_eq!(ctx.connect_timeout_secs, 10);
        assert_eq!(ctx.user_agent, DEFAULT_USER_AGENT);
        assert!(ctx.proxy.is_none());
    }

    #[test]
    fn option_provider() {
        let none: Option<EndpointContext> = None;
        assert!(none.context().is_none());
        let some = Some(EndpointContext::new("https://x", "k", "s"));
        assert_eq!(some.context().unwrap().api_key, "k");
    }
}
