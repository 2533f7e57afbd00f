use thiserror::Error;

/// Failure outcomes of stack operations.
///
/// An empty stack is not a failure: `pop` reports it as `None`.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Error {
    /// The global allocator could not provide memory for a new node.
    ///
    /// Fatal to the `try_push` call that observed it; the stack itself is unaffected.
    #[error("failed to allocate a {size}-byte stack node")]
    OutOfMemory { size: usize },

    /// Every hazard slot in the registry is owned by a live participant.
    ///
    /// The calling thread cannot pop from a hazard-pointer stack until some other participant
    /// deregisters.
    #[error("all {capacity} hazard pointer slots are in use")]
    ResourceExhausted { capacity: usize },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
