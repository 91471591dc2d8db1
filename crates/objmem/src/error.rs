//! Error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::TypeNumber;

/// Failures reported by [`Memory`](crate::Memory).
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Every remedy failed: dead chains, bump space, new segments, scavenging
    /// and a collection.
    #[error("heap exhausted allocating {size} bytes")]
    Exhausted { size: usize },

    #[error("object of {size} bytes exceeds the maximum object size")]
    ObjectTooLarge { size: usize },

    #[error("type number {0} is not registered")]
    UnregisteredType(TypeNumber),

    /// The heap was consumed by an image save.
    #[error("heap was consumed by an image save")]
    HeapConsumed,

    #[error("{0:#x} is not an object in this heap")]
    NotInHeap(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("type {0} is not registered")]
    NotRegistered(&'static str),

    #[error("cannot grow an object from {current} to {requested} bytes")]
    CannotGrow { current: usize, requested: usize },

    /// The requested size is below the smallest instance of the object's type.
    #[error("cannot shrink an object to {requested} bytes, its type needs {minimum}")]
    CannotShrink { minimum: usize, requested: usize },

    #[error("failed to reserve heap memory: {0}")]
    Reserve(#[source] io::Error),

    #[error("heap corrupt at {addr:#x}: {reason}")]
    Corrupt { addr: usize, reason: String },

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Failures while saving, restoring, flattening or unflattening an image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image exceeds the maximum size of {max} bytes")]
    TooLarge { max: usize },

    #[error("image truncated: header says {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("corrupt image at offset {offset:#x}: {reason}")]
    Corrupt { offset: usize, reason: String },

    #[error("image object at offset {offset:#x} has unknown type number {type_number}")]
    UnknownType {
        offset: usize,
        type_number: TypeNumber,
    },

    #[error("image does not start with a save array")]
    MissingSaveArray,
}

impl ImageError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            offset,
            reason: reason.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
