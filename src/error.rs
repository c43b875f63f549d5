use thiserror::Error;

/// Errors produced while setting up a viewer or loading its model.
///
/// None of these escape the session as panics: the session turns them into
/// [`ViewerSignal`](crate::ViewerSignal)s for the host.
#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("hardware-accelerated rendering is not available")]
    EnvironmentUnsupported,

    #[error("asset source is empty")]
    EmptySource,

    #[error("failed to load {locator}: {message}")]
    AssetLoad { locator: String, message: String },

    #[error("unsupported asset format `{0}`")]
    UnsupportedFormat(String),

    #[error("invalid asset data: {0}")]
    InvalidAsset(String),

    #[error("graphics engine error: {0}")]
    Engine(String),

    #[error("invalid viewer configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ViewerError {
    pub fn engine<T: ToString>(msg: T) -> Self {
        ViewerError::Engine(msg.to_string())
    }

    pub fn invalid_config<T: ToString>(msg: T) -> Self {
        ViewerError::InvalidConfig(msg.to_string())
    }

    /// Whether retrying the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ViewerError::EnvironmentUnsupported
                | ViewerError::EmptySource
                | ViewerError::InvalidConfig(_)
        )
    }
}
