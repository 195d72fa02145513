pub mod auth;
pub mod bootstrap;
pub mod core;
pub mod error;
pub mod state;
pub mod upstream_client;

pub use auth::authenticate;
pub use core::FallbackController;
pub use error::{ErrorKind, ProxyError};
pub use state::AppState;
pub use upstream_client::ReqwestUpstreamClient;
