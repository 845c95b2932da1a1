//! Error kinds surfaced by the memory core.

use std::error::Error;
use std::fmt;

/// Errors reported by allocation, protection, matching and finalization.
///
/// Recoverable conditions are returned as `Err`; contract violations
/// (protect-stack overflow, unprotect imbalance, mutating the nil cell)
/// panic with the corresponding message instead, since the original
/// call sites cannot continue and, for the overflow case, cannot even
/// allocate the report.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemError {
    /// No free cell remains even after a collection.
    ConsExhausted,
    /// A vector payload does not fit the remaining vector budget, or the
    /// OS refused a page or large-vector allocation.
    HeapExhausted,
    /// The requested vector byte count overflows the budget counter.
    OversizeVector,
    /// A finalizer target that is neither an environment nor an external
    /// pointer.
    InvalidFinalizerTarget,
    /// A finalizer action that is not a closure, builtin or special.
    InvalidFinalizerFunction,
    /// A formal or supplied argument matched more than once.
    MultipleMatch(String),
    /// A supplied argument bound nowhere, with no dots formal to gather it.
    UnusedArgument(String),
    /// A match tag that is neither a symbol nor a character string.
    InvalidPartialStringMatch,
    /// All slots of the bounded raw-allocation table are in use.
    ScratchTableFull,
    /// A pointer handed to `c_free` that `c_alloc` never produced.
    UnknownScratchPointer,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsExhausted => write!(f, "cons memory exhausted (limit reached?)"),
            Self::HeapExhausted => write!(f, "vector memory exhausted (limit reached?)"),
            Self::OversizeVector => write!(f, "requested vector size overflows the heap counter"),
            Self::InvalidFinalizerTarget => write!(f, "can only finalize reference objects"),
            Self::InvalidFinalizerFunction => {
                write!(f, "finalizer function must be a closure, builtin or special")
            }
            Self::MultipleMatch(what) => write!(f, "{what}"),
            Self::UnusedArgument(name) => write!(f, "unused argument ({name})"),
            Self::InvalidPartialStringMatch => write!(f, "invalid partial string match"),
            Self::ScratchTableFull => write!(f, "c_alloc: all pointers in use"),
            Self::UnknownScratchPointer => {
                write!(f, "c_free: attempt to free pointer not allocated by c_alloc")
            }
        }
    }
}

impl Error for MemError {}
