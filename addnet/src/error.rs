//! Error type shared by every layer in the crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("{layer}: expected {what} = {expected}, got {actual}")]
    ShapeMismatch {
        layer: &'static str,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{layer}: cannot broadcast {from:?} to {to:?}")]
    Broadcast {
        layer: &'static str,
        from: Vec<usize>,
        to: Vec<usize>,
    },
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Fails with [`LayerError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn ensure_dim(
    layer: &'static str,
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayerError::ShapeMismatch { layer, what, expected, actual })
    }
}
