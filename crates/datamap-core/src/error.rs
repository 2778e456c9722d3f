use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{engine} engine failed: {message}")]
    UpstreamEngine { engine: String, message: String },

    #[error("Generation failed for field '{field}': {message}")]
    Generation { field: String, message: String },

    #[error("Dependency cycle between generated fields: {}", fields.join(", "))]
    SchemaCycle { fields: Vec<String> },

    #[error("Pipeline failed: {0}")]
    Internal(String),
}

impl Error {
    pub fn upstream(engine: &str, err: impl std::fmt::Display) -> Self {
        Self::UpstreamEngine { engine: engine.to_string(), message: err.to_string() }
    }

    pub fn generation(field: &str, err: impl std::fmt::Display) -> Self {
        Self::Generation { field: field.to_string(), message: err.to_string() }
    }

    /// Recoverable errors degrade a map instead of failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UpstreamEngine { .. } | Self::Generation { .. } | Self::SchemaCycle { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
