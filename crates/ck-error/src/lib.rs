#![forbid(unsafe_code)]
//! Error types for the corekern resource layer.
//!
//! # Error Taxonomy
//!
//! The layer distinguishes two severities, mirroring the trust model of a
//! single-fault-domain kernel:
//!
//! | Severity | Variant | Meaning |
//! |----------|---------|---------|
//! | Fatal | `CkError::Fatal(FatalReason)` | Programming-contract violation or unrecoverable exhaustion; the kernel halts |
//! | Recoverable | `CkError::CacheExhausted` | Typed exhaustion for callers that opted into `ExhaustionPolicy::Recoverable` |
//!
//! Fatal conditions are a distinct error kind rather than a process abort so
//! tests can assert on them without crashing the test process. They must
//! never be converted into recoverable errors: a caller that receives
//! `Fatal` has hit a kernel bug, not a runtime condition.
//!
//! Page allocator exhaustion is deliberately NOT an error: `alloc` returns
//! `Option<PageAddr>` and every caller handles `None`.

use thiserror::Error;

/// Why the kernel would halt.
///
/// Each variant names the violated contract; the offending address or
/// identity is carried for diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// Every buffer in the cache is referenced; no eviction candidate exists.
    #[error("buffer cache exhausted: no unreferenced buffer to evict")]
    BufferCacheExhausted,

    /// A page operation was given an address that is not page-aligned.
    #[error("page address {addr:#x} is not page-aligned")]
    MisalignedPage { addr: u64 },

    /// A page operation was given an address outside the allocatable range.
    #[error("page address {addr:#x} is outside the allocatable range")]
    PageOutOfRange { addr: u64 },

    /// A page with reference count zero was freed again.
    #[error("double free of page {addr:#x}")]
    DoubleFreedPage { addr: u64 },

    /// A free page was named as the target of a share or refcount update.
    #[error("refcount operation on free page {addr:#x}")]
    FreePageShared { addr: u64 },
}

/// Unified error type for corekern operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CkError {
    /// Kernel-fatal condition. Callers must treat this as a halt, not retry.
    #[error("fatal: {0}")]
    Fatal(FatalReason),

    /// Buffer cache exhaustion surfaced as a recoverable error.
    ///
    /// Only produced under `ExhaustionPolicy::Recoverable`; the default
    /// policy reports the same condition as `Fatal(BufferCacheExhausted)`.
    #[error("buffer cache exhausted")]
    CacheExhausted,
}

impl CkError {
    /// Whether this error is kernel-fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Result alias using `CkError`.
pub type Result<T> = std::result::Result<T, CkError>;
