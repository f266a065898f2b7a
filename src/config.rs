use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_MERCHANT_ORDER_PREFIX: &str = "OKPUJA";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_CART_RETENTION_KEEP: usize = 3;
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";
const DEFAULT_REDIRECT_PATH: &str = "/confirmbooking";

const PHONEPE_UAT_PG_URL: &str = "https://api-preprod.phonepe.com/apis/pg-sandbox";
const PHONEPE_UAT_OAUTH_URL: &str = "https://api-preprod.phonepe.com/apis/identity-manager";
const PHONEPE_PROD_PG_URL: &str = "https://api.phonepe.com/apis/pg";
const PHONEPE_PROD_OAUTH_URL: &str = "https://api.phonepe.com/apis/identity-manager";

/// Payment gateway (PhonePe) connection settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// "uat" or "production"
    #[serde(default = "default_gateway_environment")]
    #[validate(custom = "validate_gateway_environment")]
    pub environment: String,

    /// Overrides the payment API base URL derived from `environment`
    #[serde(default)]
    pub base_url: Option<String>,

    /// Overrides the OAuth base URL derived from `environment`
    #[serde(default)]
    pub oauth_url: Option<String>,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Upper bound for a single gateway HTTP call
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: default_gateway_environment(),
            base_url: None,
            oauth_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            client_version: default_client_version(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Payment API base, without trailing slash
    pub fn pg_base_url(&self) -> String {
        let base = match &self.base_url {
            Some(url) if !url.trim().is_empty() => url.trim(),
            _ if self.is_production() => PHONEPE_PROD_PG_URL,
            _ => PHONEPE_UAT_PG_URL,
        };
        base.trim_end_matches('/').to_string()
    }

    /// OAuth API base, without trailing slash
    pub fn oauth_base_url(&self) -> String {
        let base = match &self.oauth_url {
            Some(url) if !url.trim().is_empty() => url.trim(),
            _ if self.is_production() => PHONEPE_PROD_OAUTH_URL,
            _ => PHONEPE_UAT_OAUTH_URL,
        };
        base.trim_end_matches('/').to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Credentials used to authenticate inbound gateway webhooks
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Username configured on the gateway dashboard
    #[serde(default)]
    pub username: String,

    /// Password configured on the gateway dashboard
    #[serde(default)]
    pub password: String,

    /// Optional shared secret for HMAC-SHA256 body signatures
    #[serde(default)]
    pub hmac_secret: Option<String>,
}

impl WebhookConfig {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Background auto-completion poller settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PollerConfig {
    #[serde(default = "default_true_bool")]
    pub enabled: bool,

    /// Seconds between scheduled runs
    #[serde(default = "default_poller_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,

    /// Minimum order age before the poller looks at it
    #[serde(default = "default_poller_grace_secs")]
    pub grace_secs: u64,

    /// Orders examined per run, newest first
    #[serde(default = "default_poller_batch_size")]
    #[validate(range(min = 1, max = 500))]
    pub batch_size: u64,

    /// Unresolved checks before an order is handed to manual review
    #[serde(default = "default_poller_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: i32,

    /// How long a claimed order stays reserved for one instance
    #[serde(default = "default_poller_lease_secs")]
    #[validate(range(min = 1))]
    pub lease_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_poller_interval_secs(),
            grace_secs: default_poller_grace_secs(),
            batch_size: default_poller_batch_size(),
            max_attempts: default_poller_max_attempts(),
            lease_secs: default_poller_lease_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Secret shared with the session service that issues bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Frontend origin that receives post-payment redirects
    #[serde(default = "default_frontend_url")]
    pub frontend_base_url: String,

    /// Frontend path for the booking confirmation page
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,

    /// URL handed to the gateway as the browser return target
    #[serde(default)]
    pub redirect_callback_url: Option<String>,

    /// Upper bound for the whole redirect resolution
    #[serde(default = "default_redirect_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub redirect_timeout_secs: u64,

    /// Age limit for the system-wide "latest successful payment" fallback
    #[serde(default = "default_redirect_global_window_secs")]
    pub redirect_global_fallback_window_secs: u64,

    /// Prefix of generated merchant order ids
    #[serde(default = "default_merchant_order_prefix")]
    #[validate(custom = "validate_merchant_order_prefix")]
    pub merchant_order_prefix: String,

    /// Checkout validity window handed to the gateway
    #[serde(default = "default_payment_expiry_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub payment_expiry_minutes: i64,

    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Converted carts kept per user
    #[serde(default = "default_cart_retention_keep")]
    #[validate(range(min = 1))]
    pub cart_retention_keep: usize,

    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,

    #[serde(default)]
    #[validate]
    pub webhook: WebhookConfig,

    #[serde(default)]
    #[validate]
    pub poller: PollerConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            frontend_base_url: default_frontend_url(),
            redirect_path: default_redirect_path(),
            redirect_callback_url: None,
            redirect_timeout_secs: default_redirect_timeout_secs(),
            redirect_global_fallback_window_secs: default_redirect_global_window_secs(),
            merchant_order_prefix: default_merchant_order_prefix(),
            payment_expiry_minutes: default_payment_expiry_minutes(),
            default_currency: default_currency(),
            cart_retention_keep: DEFAULT_CART_RETENTION_KEEP,
            gateway: GatewayConfig::default(),
            webhook: WebhookConfig::default(),
            poller: PollerConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_secs)
    }

    /// Gateway bound used while resolving a redirect. Always leaves headroom
    /// (a quarter of the deadline, at most 2s) under `redirect_timeout` for the
    /// database work around the call.
    pub fn redirect_gateway_timeout(&self) -> Duration {
        let deadline = self.redirect_timeout();
        let headroom = (deadline / 4).min(Duration::from_secs(2));
        self.gateway.timeout().min(deadline - headroom)
    }

    /// Where the gateway should send the browser after checkout
    pub fn redirect_callback_url(&self) -> String {
        self.redirect_callback_url.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}/api/v1/payments/redirect",
                self.host, self.port
            )
        })
    }

    /// Frontend confirmation page, without query string
    pub fn frontend_redirect_base(&self) -> String {
        format!(
            "{}/{}",
            self.frontend_base_url.trim_end_matches('/'),
            self.redirect_path.trim_start_matches('/')
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if self.is_production() && !self.webhook.has_credentials() && self.webhook.hmac_secret.is_none() {
            let mut err = ValidationError::new("webhook_credentials_required");
            err.message = Some(
                "Set APP__WEBHOOK__USERNAME and APP__WEBHOOK__PASSWORD (or APP__WEBHOOK__HMAC_SECRET) in production".into(),
            );
            errors.add("webhook", err);
        }

        if self.is_production() && self.gateway.client_id.trim().is_empty() {
            let mut err = ValidationError::new("gateway_client_id_required");
            err.message = Some("Set APP__GATEWAY__CLIENT_ID in production".into());
            errors.add("gateway", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_true_bool() -> bool {
    true
}

fn default_auth_issuer() -> String {
    "okpuja-auth".to_string()
}

fn default_auth_audience() -> String {
    "okpuja-api".to_string()
}

fn default_frontend_url() -> String {
    DEFAULT_FRONTEND_URL.to_string()
}

fn default_redirect_path() -> String {
    DEFAULT_REDIRECT_PATH.to_string()
}

fn default_redirect_timeout_secs() -> u64 {
    8
}

fn default_redirect_global_window_secs() -> u64 {
    30 * 60
}

fn default_merchant_order_prefix() -> String {
    DEFAULT_MERCHANT_ORDER_PREFIX.to_string()
}

fn default_payment_expiry_minutes() -> i64 {
    20
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_cart_retention_keep() -> usize {
    DEFAULT_CART_RETENTION_KEEP
}

fn default_gateway_environment() -> String {
    "uat".to_string()
}

fn default_client_version() -> String {
    "1".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_poller_interval_secs() -> u64 {
    120
}

fn default_poller_grace_secs() -> u64 {
    180
}

fn default_poller_batch_size() -> u64 {
    5
}

fn default_poller_max_attempts() -> i32 {
    10
}

fn default_poller_lease_secs() -> u64 {
    60
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_gateway_environment(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "uat" | "sandbox" | "production" => Ok(()),
        _ => {
            let mut err = ValidationError::new("gateway_environment");
            err.message = Some("Must be one of: uat, sandbox, production".into());
            Err(err)
        }
    }
}

fn validate_merchant_order_prefix(prefix: &str) -> Result<(), ValidationError> {
    let ok = !prefix.is_empty()
        && prefix.len() <= 16
        && prefix.chars().all(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        let mut err = ValidationError::new("merchant_order_prefix");
        err.message = Some("Must be 1-16 ASCII alphanumeric characters".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("booking_reconciler={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET
    let config = Config::builder()
        .set_default("database_url", "sqlite://reconciler.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the session service signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://reconciler.db?mode=memory".into(),
            "a_signing_secret_that_is_long_enough_for_hs256".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn defaults_pass_field_validation() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cart_retention_keep, 3);
        assert_eq!(cfg.poller.batch_size, 5);
        assert_eq!(cfg.poller.grace_secs, 180);
    }

    #[test]
    fn production_requires_webhook_credentials() {
        let mut cfg = base_config();
        cfg.gateway.client_id = "M22KEWU5BO1I2".into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.webhook.username = "okpuja".into();
        cfg.webhook.password = "s3cret".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn zero_retention_is_rejected() {
        let mut cfg = base_config();
        cfg.cart_retention_keep = 0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("cart_retention_keep"));
    }

    #[test]
    fn gateway_urls_follow_environment() {
        let mut gateway = GatewayConfig::default();
        assert_eq!(gateway.pg_base_url(), PHONEPE_UAT_PG_URL);
        gateway.environment = "production".into();
        assert_eq!(gateway.pg_base_url(), PHONEPE_PROD_PG_URL);
        assert_eq!(gateway.oauth_base_url(), PHONEPE_PROD_OAUTH_URL);
        gateway.base_url = Some("http://127.0.0.1:9999/".into());
        assert_eq!(gateway.pg_base_url(), "http://127.0.0.1:9999");
    }

    #[test]
    fn frontend_redirect_base_joins_cleanly() {
        let mut cfg = base_config();
        cfg.frontend_base_url = "https://www.okpuja.com/".into();
        assert_eq!(
            cfg.frontend_redirect_base(),
            "https://www.okpuja.com/confirmbooking"
        );
    }

    #[test]
    fn redirect_gateway_timeout_fits_inside_redirect_deadline() {
        let mut cfg = base_config();
        cfg.redirect_timeout_secs = 8;
        cfg.gateway.timeout_secs = 10;
        assert_eq!(cfg.redirect_gateway_timeout(), Duration::from_secs(6));

        cfg.redirect_timeout_secs = 1;
        assert_eq!(cfg.redirect_gateway_timeout(), Duration::from_millis(750));

        cfg.redirect_timeout_secs = 30;
        cfg.gateway.timeout_secs = 5;
        assert_eq!(cfg.redirect_gateway_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn merchant_prefix_must_be_alphanumeric() {
        assert!(validate_merchant_order_prefix("OKPUJA").is_ok());
        assert!(validate_merchant_order_prefix("OK_PUJA").is_err());
        assert!(validate_merchant_order_prefix("").is_err());
    }
}
