pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod logging;
pub mod mapping;
pub mod models;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod server;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use logging::SharedLogger;
pub use mapping::ModelMapping;
pub use server::{build_router, AppState};
