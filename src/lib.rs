pub mod common;
pub mod config;
pub mod config_validation;
pub mod connect;
pub mod error;
pub mod forward_proxy;
pub mod logging;
pub mod message;
pub mod proxy;
pub mod relay;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::ProxyServer;
