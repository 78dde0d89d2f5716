//! Errors raised by wview tree navigation and mutation (spec §4.7, §4.8).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WviewError {
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("node of type '{typechar}' has no indexable children")]
    NotIndexable { typechar: char },

    #[error("impossible wview operation: {0}")]
    Api(String),

    #[error("changing this node to type '{attempted}' is not allowed by its parent ('{parent_typechar}')")]
    TypeChangeDenied { attempted: String, parent_typechar: char },

    #[error("malformed wire data: {0}")]
    Malformed(String),

    #[error(transparent)]
    Convert(#[from] anyser_core::ConvertError),

    #[error(transparent)]
    Scan(#[from] anyser_core::ScanError),
}

pub type Result<T> = std::result::Result<T, WviewError>;
