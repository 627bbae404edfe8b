pub mod config;
pub mod listener;
pub mod session;

pub use config::ServerConfig;
pub use listener::Listener;
pub use session::Session;
