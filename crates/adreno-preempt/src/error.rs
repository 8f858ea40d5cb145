use thiserror::Error;

use crate::memory::AllocError;

pub type Result<T> = std::result::Result<T, PreemptError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreemptError {
    #[error("device memory allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("ring {ring} does not exist (device has {nr_rings} rings)")]
    NoSuchRing { ring: usize, nr_rings: usize },

    #[error("device has no rings")]
    NoRings,
}
