pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod proxy;
pub mod rate_limiter;
pub mod redis;
pub mod server;
pub mod token_bucket;

pub use config::Config;
pub use error::GatekeeperError;
pub use limiter::Limiter;
pub use server::Server;
