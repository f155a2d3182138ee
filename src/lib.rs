pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod response;
pub mod server;
pub mod tier;

pub use config::{AdmissionConfig, Cli};
pub use error::{AdmissionError, Result};
pub use gate::{Admission, Gate};
pub use identity::Authentication;
pub use server::create_app;
