pub mod auth;
pub mod engine;
pub mod error;
pub mod state;

pub use auth::ApiKeyAuth;
pub use engine::{Engine, EngineReply};
pub use error::GatewayError;
pub use state::{AppState, ModelRouter};
