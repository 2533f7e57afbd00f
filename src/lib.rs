//! Lock-free stacks with safe memory reclamation.
//!
//! Every stack in this crate is a Treiber stack: `push` links a freshly allocated node
//! in front of the head with a compare-and-swap retry loop, and `pop` unlinks the head node the
//! same way. The hard part is not the linking but deciding when a popped node's memory may be
//! freed, since another popper may have read the same head a moment earlier and be about to
//! dereference it. The stacks differ only in how they answer that question:
//!
//! * [`RefCountStack`] counts the threads inside `pop`, and frees nodes only when a thread finds
//!   itself alone. Simple, but reclamation can starve under sustained contention.
//! * [`HazardStack`] makes readers publish the address they are about to dereference in a
//!   [`HazardSlot`] of a bounded [`Registry`]. Nodes that are published somewhere are retired to
//!   the registry and reclaimed by a later pass.
//! * [`SplitCountStack`] keeps an external count of in-flight readers next to the head pointer,
//!   and an internal count in every node. Each node is freed by exactly one thread, the moment
//!   the last reference disappears, without any deferred list. This is the one to use unless you
//!   have a reason not to.
//! * [`baseline::UnsafeStack`] frees nodes immediately. It is only sound with a single popper and
//!   exists to illustrate the problem the others solve.
//!
//! All variants are lock-free but not wait-free: some thread always completes its operation,
//! while an individual thread may retry any number of times under contention. Operations are
//! linearizable on the head pointer. A value is popped at most once, and only if it was pushed.
//!
//! Failures are reported through [`Error`]. Popping from an empty stack is not a failure and
//! returns `None`.

#![deny(unsafe_op_in_unsafe_fn)]

mod error;
mod hazard;
mod hazard_stack;
mod node;
mod record;
mod refcount;
mod registry;
mod split;
mod sync;

pub mod baseline;

pub use error::{Error, Result};
pub use hazard::HazardSlot;
pub use hazard_stack::HazardStack;
pub use node::NodeCountsSnapshot;
pub use refcount::RefCountStack;
pub use registry::{Registry, DEFAULT_CAPACITY};
pub use split::{SplitCountStack, MAX_EXTERNAL_COUNT};
