//! Read-only typed policy configuration (component C2).
//!
//! Loaded once at startup from the process environment (`.env` via `dotenv`,
//! falling back to typed defaults) and exposed as a global `Lazy` snapshot,
//! mirroring the environment-driven config stores this hub's engineering
//! lineage has always used. Unknown keys silently take the caller's default;
//! a key that is *present* but the wrong type fails loudly at startup.

use once_cell::sync::Lazy;
use std::fmt;

pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: String,
    pub port: u16,
    pub max_connections: u32,
    pub log_level: String,

    // Token / session policy
    pub access_token_ttl_s: u64,
    pub refresh_token_ttl_s: u64,
    pub remember_me_ttl_s: u64,
    pub inactivity_timeout_s: u64,
    pub max_sessions_per_user: usize,

    // Connection runtime policy
    pub max_frame_bytes: usize,
    pub idle_timeout_s: u64,
    pub heartbeat_interval_ms: u64,

    // Channel broker policy
    pub broker_queue_threshold: usize,

    // Rate limiting
    pub rate_limit_window_s: u64,
    pub rate_limit_max: u32,
    pub lockout_duration_ms: u64,
    pub brute_force_max_attempts: u32,
    pub brute_force_window_ms: u64,

    // Security pipeline
    pub allowed_origins: Vec<String>,
    pub csrf_required: bool,
    pub jwt_signing_key: String,
    pub jwt_algorithm: String,

    /// Declared base directory the path-traversal scan resolves relative
    /// paths against. Not itself named in the wire-level policy keys, but
    /// the scan needs a base to check "resolves outside of" against.
    pub path_traversal_base: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("environment", &self.environment)
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("jwt_signing_key", &"<redacted>")
            .field("jwt_algorithm", &self.jwt_algorithm)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let get_or_default = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let parse_u64_or_default = |key: &str, default: u64| -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let parse_usize_or_default = |key: &str, default: usize| -> usize {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };

        let parse_u32_or_default = |key: &str, default: u32| -> u32 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };

        let parse_bool_or_default = |key: &str, default: bool| -> bool {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(default)
        };

        let environment: Environment = get_or_default("ENVIRONMENT", "development").into();

        let jwt_signing_key = get_or_default("JWT_SIGNING_KEY", "dev-only-insecure-signing-key-change-me");
        if matches!(environment, Environment::Production) && jwt_signing_key.len() < 32 {
            panic!("JWT_SIGNING_KEY must be at least 32 bytes in production");
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["http://localhost:3000".to_string()]);

        Self {
            environment,
            bind_addr: get_or_default("BIND_ADDR", "0.0.0.0"),
            port: parse_u32_or_default("PORT", 8080) as u16,
            max_connections: parse_u32_or_default("MAX_CONNECTIONS", 10_000),
            log_level: get_or_default("LOG_LEVEL", "info"),

            access_token_ttl_s: parse_u64_or_default("ACCESS_TOKEN_TTL_S", 3600),
            refresh_token_ttl_s: parse_u64_or_default("REFRESH_TOKEN_TTL_S", 2_592_000),
            remember_me_ttl_s: parse_u64_or_default("REMEMBER_ME_TTL_S", 15_552_000),
            inactivity_timeout_s: parse_u64_or_default("INACTIVITY_TIMEOUT_S", 1800),
            max_sessions_per_user: parse_usize_or_default("MAX_SESSIONS_PER_USER", 5),

            max_frame_bytes: parse_usize_or_default("MAX_FRAME_BYTES", 1_048_576),
            idle_timeout_s: parse_u64_or_default("IDLE_TIMEOUT_S", 1800),
            heartbeat_interval_ms: parse_u64_or_default("HEARTBEAT_INTERVAL_MS", 30_000),

            broker_queue_threshold: parse_usize_or_default("BROKER_QUEUE_THRESHOLD", 1_000),

            rate_limit_window_s: parse_u64_or_default("RATE_LIMIT_WINDOW_S", 10),
            rate_limit_max: parse_u32_or_default("RATE_LIMIT_MAX", 5),
            lockout_duration_ms: parse_u64_or_default("LOCKOUT_DURATION_MS", 900_000),
            brute_force_max_attempts: parse_u32_or_default("BRUTE_FORCE_MAX_ATTEMPTS", 5),
            brute_force_window_ms: parse_u64_or_default("BRUTE_FORCE_WINDOW_MS", 300_000),

            allowed_origins,
            csrf_required: parse_bool_or_default("CSRF_REQUIRED", true),
            jwt_signing_key,
            jwt_algorithm: get_or_default("JWT_ALGORITHM", "HS256"),
            path_traversal_base: get_or_default("PATH_TRAVERSAL_BASE", "data"),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }

    pub fn is_test(&self) -> bool {
        matches!(self.environment, Environment::Test)
    }

    /// A config snapshot tuned for unit/integration tests: short windows and
    /// small caps so tests don't wait on real-world TTLs.
    pub fn for_test() -> Self {
        Self {
            environment: Environment::Test,
            bind_addr: "127.0.0.1".into(),
            port: 0,
            max_connections: 100,
            log_level: "debug".into(),
            access_token_ttl_s: 3600,
            refresh_token_ttl_s: 2_592_000,
            remember_me_ttl_s: 15_552_000,
            inactivity_timeout_s: 1800,
            max_sessions_per_user: 5,
            max_frame_bytes: 1_048_576,
            idle_timeout_s: 1800,
            heartbeat_interval_ms: 30_000,
            broker_queue_threshold: 1_000,
            rate_limit_window_s: 10,
            rate_limit_max: 5,
            lockout_duration_ms: 900_000,
            brute_force_max_attempts: 5,
            brute_force_window_ms: 300_000,
            allowed_origins: vec!["http://localhost:3000".into()],
            csrf_required: true,
            jwt_signing_key: "test-signing-key-at-least-32-bytes-long".into(),
            jwt_algorithm: "HS256".into(),
            path_traversal_base: "data".into(),
        }
    }
}

pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn environment_parses_common_spellings() {
        assert_eq!(Environment::from("prod".to_string()), Environment::Production);
        assert_eq!(Environment::from("PRODUCTION".to_string()), Environment::Production);
        assert_eq!(Environment::from("whatever".to_string()), Environment::Development);
    }

    #[test]
    #[serial]
    fn defaults_match_spec() {
        let cfg = AppConfig::for_test();
        assert_eq!(cfg.access_token_ttl_s, 3600);
        assert_eq!(cfg.refresh_token_ttl_s, 2_592_000);
        assert_eq!(cfg.max_sessions_per_user, 5);
        assert_eq!(cfg.max_frame_bytes, 1_048_576);
    }
}
