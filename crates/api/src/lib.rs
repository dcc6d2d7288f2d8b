//! Flowsync API client utilities.
//!
//! This crate provides the HTTP plumbing around the engine:
//!
//! - [`ApiConfig`] / [`FlowsyncClient`]: environment-driven configuration and a `reqwest::Client`
//!   with bearer authentication
//! - [`watch`]: the Server-Sent-Events change subscription ([`ResourceWatchClient`])
//! - [`tools`]: JSON-RPC tool calls ([`HttpToolCaller`]) and a tool-backed workflow reader
//! - [`follow`]: the live loop that feeds remote changes into the reconciler
//!
//! # Example
//!
//! ```ignore
//! use flowsync_api::{FlowsyncClient, ResourceWatchClient, WatchOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = FlowsyncClient::from_env()?;
//! let watch = ResourceWatchClient::new(client);
//! watch
//!     .watch(&WatchOptions::new("/src/workflows/"), &CancellationToken::new(), |event| println!("{event:?}"))
//!     .await?;
//! ```

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use flowsync_engine::ToolConnection;
use reqwest::{Client, RequestBuilder, Url, header};
use tracing::debug;

pub mod follow;
pub mod sse;
pub mod tools;
pub mod watch;

pub use follow::{FollowSummary, follow_workflow, reconcile_events};
pub use tools::{DEFAULT_READ_TOOL_NAME, HttpToolCaller, ToolWorkflowReader};
pub use watch::{ResourceWatchClient, RetryConfig, WatchError, WatchOptions, WatchSession};

/// Environment variable overriding the API base URL.
pub const API_BASE_ENV: &str = "FLOWSYNC_API_BASE";
/// Environment variable holding the bearer token.
pub const API_TOKEN_ENV: &str = "FLOWSYNC_API_TOKEN";
/// Environment variable holding the workspace locator used in endpoint paths.
pub const LOCATOR_ENV: &str = "FLOWSYNC_LOCATOR";
/// Base URL used when [`API_BASE_ENV`] is unset.
pub const DEFAULT_API_BASE: &str = "https://api.decocms.com";

/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Where the service lives and how to authenticate against it.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub locator: Option<String>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("locator", &self.locator)
            .finish()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            token: None,
            locator: None,
        }
    }
}

impl ApiConfig {
    /// Reads [`API_BASE_ENV`], [`API_TOKEN_ENV`], and [`LOCATOR_ENV`]. Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Fails when the base URL is malformed or uses plain http for a non-localhost host.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            base_url: non_blank_env(API_BASE_ENV).unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token: non_blank_env(API_TOKEN_ENV),
            locator: non_blank_env(LOCATOR_ENV),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.base_url)
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// The configured locator, or an error naming the variable to set.
    pub fn require_locator(&self) -> Result<&str> {
        self.locator
            .as_deref()
            .ok_or_else(|| anyhow!("{LOCATOR_ENV} is not set; pass --locator or export it"))
    }

    /// Connection for the workspace's tool endpoint, `{base}/{locator}/mcp`.
    pub fn tool_connection(&self) -> Result<ToolConnection> {
        let mut connection = ToolConnection::new(format!("{}/{}/mcp", self.base(), self.require_locator()?));
        connection.token = self.token.clone();
        Ok(connection)
    }
}

fn non_blank_env(name: &str) -> Option<String> {
    env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// Thin wrapper around a configured `reqwest::Client`.
///
/// The client carries the bearer token as a default header. No overall request timeout is set
/// because watch responses are long-lived streams; only connecting is bounded.
#[derive(Debug, Clone)]
pub struct FlowsyncClient {
    config: ApiConfig,
    http: Client,
    user_agent: String,
}

impl FlowsyncClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        config.validate()?;

        let mut default_headers = header::HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value =
                header::HeaderValue::from_str(&format!("Bearer {token}")).context("API token contains invalid header characters")?;
            value.set_sensitive(true);
            default_headers.insert(header::AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;

        Ok(Self {
            config,
            http,
            user_agent: format!("flowsync/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS),
        })
    }

    /// Construct a client from [`ApiConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(ApiConfig::from_env()?)
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Build a request for a method and absolute URL with the configured User-Agent.
    pub fn request(&self, method: reqwest::Method, url: Url) -> RequestBuilder {
        debug!(url = %redacted_url(&url), "building request");
        self.http.request(method, url).header(header::USER_AGENT, &self.user_agent)
    }
}

/// URL rendered without its query string, for logs.
fn redacted_url(url: &Url) -> String {
    let mut display = url.clone();
    display.set_query(None);
    display.to_string()
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
pub fn validate_base_url(base: &str) -> Result<()> {
    let parsed_base_url = Url::parse(base).map_err(|error| anyhow!("Invalid {API_BASE_ENV} URL '{base}': {error}"))?;

    let host_name = parsed_base_url
        .host_str()
        .ok_or_else(|| anyhow!("{API_BASE_ENV} must include a host"))?;

    if LOCALHOST_DOMAINS
        .iter()
        .any(|&allowed| host_name.eq_ignore_ascii_case(allowed))
    {
        return Ok(());
    }

    if parsed_base_url.scheme() != "https" {
        return Err(anyhow!(
            "{API_BASE_ENV} must use https for non-localhost hosts; got '{}://'",
            parsed_base_url.scheme()
        ));
    }

    Ok(())
}
