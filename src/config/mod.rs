//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to subsystems at startup
//! ```
//!
//! Config is immutable once loaded; every field has a default so minimal
//! files work.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendConfig, BackendTlsConfig, CircuitBreakerConfig, GatewayConfig, KeepaliveConfig,
    LimitsConfig, ListenerConfig, ListenerTlsConfig, LogFormat, ObservabilityConfig,
    OracleConfig, PoolConfig, RetryConfig, RetryOn, TimeoutConfig,
};
