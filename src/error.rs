// Framewise Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FramewiseError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{input}: {source}")]
    InInput {
        input: String,
        #[source]
        source: Box<FramewiseError>,
    },

    #[error("{0}")]
    Other(String),
}

impl FramewiseError {
    /// Attach the name of the pipeline input that produced this error.
    pub fn for_input(self, input: impl Into<String>) -> Self {
        FramewiseError::InInput {
            input: input.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping input wrappers.
    pub fn root(&self) -> &FramewiseError {
        match self {
            FramewiseError::InInput { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for FramewiseError {
    fn from(err: anyhow::Error) -> Self {
        FramewiseError::Other(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for FramewiseError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        FramewiseError::Worker(format!("lock poisoned: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FramewiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_wrapper_names_input_and_cause() {
        let err = FramewiseError::Decode("no frames".to_string()).for_input("clip.mp4");
        assert_eq!(err.to_string(), "clip.mp4: Decode error: no frames");
        assert!(matches!(err.root(), FramewiseError::Decode(_)));
    }
}
