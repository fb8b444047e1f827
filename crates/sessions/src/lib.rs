//! The Session data model and the `SessionService`/`MemoryService`
//! contracts consumed by the runner, plus an in-memory reference
//! implementation used to build and test it in isolation.

pub mod memory_store;
pub mod service;
pub mod session;

pub use memory_store::{InMemoryMemoryService, InMemorySessionService};
pub use service::{MemoryService, SessionService};
pub use session::{shard_for, Session, Summary};
