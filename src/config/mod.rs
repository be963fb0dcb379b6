pub mod loader;
pub mod schema;

pub use loader::{load_default, load_from_path, load_from_str, validate};
pub use schema::{
    Config, GatewayConfig, LifecycleConfig, LogFormat, PoolConfig, ServerConfig, TransportConfig,
};
