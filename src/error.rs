//! Crate error.

use crate::common::{InvalidIdSize, ParseIdError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]; construction fails this way only on an
    /// unrecoverable socket bind failure.
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error(transparent)]
    ParseId(#[from] ParseIdError),

    #[error("failed to parse stored document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored document contains no nodes")]
    EmptyDocument,
}
