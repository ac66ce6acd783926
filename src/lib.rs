pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod request;
pub mod route;
pub mod session;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::Proxy;
pub use route::Router;
