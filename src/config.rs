//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Smallest RSA modulus accepted for local account keys.
const MIN_KEY_BITS: usize = 2048;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 3000)
    pub port: u16,
    /// Public authority (e.g., "social.example.com" or "localhost:3000")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the node
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Federation identifier (`apid`) of a local account.
    pub fn account_apid(&self, username: &str) -> String {
        format!("{}/accounts/{}", self.base_url(), username)
    }

    /// Whether `domain` is loopback, unspecified or a `.local(host)` name
    pub fn is_local_domain(&self) -> bool {
        is_local_server_domain(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Upper bound for every outbound fetch or delivery
    pub request_timeout_seconds: u64,
    /// Require a valid `Digest` header before checking the signature
    pub require_digest: bool,
    /// Maximum allowed distance between the `Date` header and now.
    ///
    /// Set to 0 to disable the freshness check.
    pub max_date_skew_seconds: u64,
    /// Permit actor fetches against loopback/private hosts (local test rigs)
    pub allow_private_hosts: bool,
    /// RSA modulus size for newly generated local keys
    pub key_bits: usize,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            require_digest: true,
            max_date_skew_seconds: 43_200,
            allow_private_hosts: false,
            key_bits: MIN_KEY_BITS,
            user_agent: format!("fedinode/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Local accounts ensured at startup
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccountsConfig {
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub fn filter_directive(&self) -> String {
        format!(
            "fedinode={},tower_http=debug",
            self.level.to_ascii_lowercase()
        )
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDINODE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.domain", "localhost:3000")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedinode.db")?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.require_digest", true)?
            .set_default("federation.max_date_skew_seconds", 43_200)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.key_bits", MIN_KEY_BITS as i64)?
            .set_default(
                "federation.user_agent",
                format!("fedinode/{}", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDINODE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("accounts.bootstrap"),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.federation.request_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < MIN_KEY_BITS {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if !LOG_LEVELS
            .iter()
            .any(|level| level.eq_ignore_ascii_case(&self.logging.level))
        {
            return Err(crate::error::AppError::Config(format!(
                "logging.level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        if !self.logging.is_json() && !self.logging.format.eq_ignore_ascii_case("pretty") {
            return Err(crate::error::AppError::Config(
                "logging.format must be pretty or json".to_string(),
            ));
        }

        if !self.server.is_local_domain() && !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
