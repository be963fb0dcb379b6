pub mod managed;
pub mod manager;
pub mod registry;

pub use managed::ManagedServer;
pub use manager::ServerManager;
pub use registry::ServerRegistry;
