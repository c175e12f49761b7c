pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod key_generator;
pub mod lock;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;
pub mod token_bucket;
pub mod validation;

pub use config::Config;
pub use error::{TollgateError, TollgateResult};
pub use handlers::AppState;
pub use orchestrator::{Guarded, Invocation, RequestOrchestrator};
pub use server::create_app;
