use std::{fmt, result};

/// Error conditions surfaced by the crate's internal `Result`-returning
/// helpers. Public operations (`insert`, `delete`, ...) collapse these down
/// to a `bool` per the precondition/transient/fatal taxonomy; `Error` itself
/// is only visible to callers that reach past that boundary (e.g. tests that
/// exercise `bwtree::ops` directly).
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Unique-mode insert where the key already has a value, or duplicate-mode
    /// insert of an (key, value) pair that is already present.
    DuplicateKey,
    /// Delete (or consolidation bookkeeping) targeting a (key, value) pair
    /// that is not present in the chain's logical view.
    MissingEntry,
    /// Materialisation found a chain that violates the node invariants
    /// (out-of-order keys, a delta with no matching base entry, etc).
    CorruptChain(String),
    /// The PID table's 24-bit address space is exhausted.
    PidSpaceExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            Error::DuplicateKey => write!(f, "duplicate key"),
            Error::MissingEntry => write!(f, "missing entry"),
            Error::CorruptChain(msg) => write!(f, "corrupt chain: {}", msg),
            Error::PidSpaceExhausted => write!(f, "pid space exhausted"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
