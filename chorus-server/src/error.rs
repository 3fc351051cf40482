use chorus_core::{BackboneError, RelayError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors at the process edge.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backbone(#[from] BackboneError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
