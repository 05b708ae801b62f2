// Server Configuration
// All tunables come from the environment once at startup and are injected
// as a struct; there is no module-level mutable configuration.

use std::env;
use std::path::PathBuf;

/// Runtime environment switch (NODE_ENV-style)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnv {
    Development,
    Production,
}

impl RunEnv {
    pub fn is_production(&self) -> bool {
        matches!(self, RunEnv::Production)
    }
}

/// Server configuration - built once in main() and shared via AppState
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to bind (PORT, default 3000)
    pub port: u16,
    /// development: verbose errors; production: generic 500 bodies
    pub env: RunEnv,
    /// Skip per-IP rate limiting (DISABLE_RATE_LIMIT, for tests)
    pub disable_rate_limit: bool,
    /// Compiler binary name or path (UNOBENCH_TOOLCHAIN, default "g++")
    pub compiler: String,
    /// Directory of example sketches served by /api/examples
    pub examples_dir: PathBuf,
    /// Optional override for the bundled Arduino mock runtime source
    pub runtime_source: Option<PathBuf>,
    /// Request body cap for /api in bytes
    pub max_body_bytes: usize,
    /// Requests per IP per minute on /api
    pub rate_limit_per_minute: u32,
    /// Default simulation timeout in seconds (0 = run until stopped)
    pub default_timeout_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let run_env = match env::var("UNOBENCH_ENV").as_deref() {
            Ok("production") => RunEnv::Production,
            _ => RunEnv::Development,
        };

        Self {
            port,
            env: run_env,
            disable_rate_limit: env::var("DISABLE_RATE_LIMIT").is_ok(),
            compiler: env::var("UNOBENCH_TOOLCHAIN").unwrap_or_else(|_| "g++".to_string()),
            examples_dir: env::var("UNOBENCH_EXAMPLES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("demos")),
            runtime_source: env::var("UNOBENCH_RUNTIME").ok().map(PathBuf::from),
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 120,
            default_timeout_secs: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            env: RunEnv::Development,
            disable_rate_limit: true,
            compiler: "g++".to_string(),
            examples_dir: PathBuf::from("demos"),
            runtime_source: None,
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 120,
            default_timeout_secs: 30,
        }
    }
}
