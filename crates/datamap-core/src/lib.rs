pub mod config;
pub mod error;
pub mod metadata;
pub mod params;
pub mod schema;
pub mod session;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
