use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Authentication mode (§6 "Environment variables",
/// `*_AUTH_MODE ∈ {local-trusted, external-secure}`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMode {
    /// Any loopback request is authenticated with full permissions.
    LocalTrusted,
    /// Bearer token / API key required for every request.
    ExternalSecure,
}

impl AuthMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local-trusted" => Some(AuthMode::LocalTrusted),
            "external-secure" => Some(AuthMode::ExternalSecure),
            _ => None,
        }
    }
}

/// Runtime configuration resolved once at startup from the environment and
/// passed by value to every component thereafter (§9 "Global mutable
/// state"). Unknown or missing values fall back to schema defaults —
/// configuration resolution never panics or aborts startup.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub auth_mode: AuthMode,
    pub log_level: String,
    pub templates_dir: PathBuf,
    pub shutdown_grace: Duration,
    pub event_bus_queue_depth: usize,
    pub event_bus_subscriber_buffer: usize,
    pub health_probe_ttl: Duration,
    pub health_probe_fanout: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            auth_mode: AuthMode::LocalTrusted,
            log_level: "info".to_string(),
            templates_dir: PathBuf::from("./templates"),
            shutdown_grace: Duration::from_millis(5_000),
            event_bus_queue_depth: 64,
            event_bus_subscriber_buffer: 16,
            health_probe_ttl: Duration::from_secs(5),
            health_probe_fanout: 8,
        }
    }
}

impl GatewayConfig {
    /// Builds the configuration from `GATEWAY_*` environment variables
    /// (§6), falling back to [`GatewayConfig::default`] for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_env_prefixed("GATEWAY")
    }

    /// Same as [`GatewayConfig::from_env`] but with a caller-chosen prefix,
    /// matching the distilled spec's `*_HOST`/`*_PORT`/... convention where
    /// the prefix is left to the deployment.
    pub fn from_env_prefixed(prefix: &str) -> Self {
        let defaults = Self::default();

        let host = env::var(format!("{prefix}_HOST")).unwrap_or(defaults.host);
        let port = env::var(format!("{prefix}_PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);
        let auth_mode = env::var(format!("{prefix}_AUTH_MODE"))
            .ok()
            .and_then(|v| AuthMode::parse(&v))
            .unwrap_or(defaults.auth_mode);
        let log_level = env::var(format!("{prefix}_LOG_LEVEL")).unwrap_or(defaults.log_level);
        let templates_dir = env::var(format!("{prefix}_TEMPLATES_DIR"))
            .map(PathBuf::from)
            .unwrap_or(defaults.templates_dir);

        Self {
            host,
            port,
            auth_mode,
            log_level,
            templates_dir,
            ..defaults
        }
    }
}
