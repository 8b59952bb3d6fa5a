use thiserror::Error;

/// Errors surfaced to whoever builds and drives a hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Soft failures while turning a frame into a reading. Never fatal to the receive loop.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload carries no known metric fields")]
    NoKnownFields,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("energy store {} exists but is empty", .0.display())]
    Empty(std::path::PathBuf),
}
