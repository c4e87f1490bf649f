//! # weir-core
//!
//! Core abstractions for the weir event reducer.
//!
//! This crate provides the foundational types and traits used across all weir
//! components:
//!
//! - **Identifiers**: Strongly-typed ids for events and aggregation members
//! - **Reduction Keys**: Validated correlation keys shared by fan-out siblings
//! - **Storage Contract**: Conditional-write (CAS) object storage interfaces
//! - **Error Types**: Shared error definitions and result types
//! - **Canonical JSON**: Deterministic serialization for composite payloads
//!
//! ## Crate Boundary
//!
//! `weir-core` is the **only** crate allowed to define shared primitives.
//! The reducer domain (`weir-reduce`) builds on these contracts and never
//! reaches around them to a concrete backend.
//!
//! ## Example
//!
//! ```rust
//! use weir_core::prelude::*;
//!
//! let key = ReductionKey::new("chain-7f3a").unwrap();
//! let event_id = EventId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod id;
pub mod key;
pub mod observability;
pub mod scoped_storage;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use weir_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventId, MemberId};
    pub use crate::key::ReductionKey;
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition,
        WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use canonical_json::to_canonical_bytes;
pub use error::{Error, Result};
pub use id::{EventId, MemberId};
pub use key::ReductionKey;
pub use observability::{LogFormat, init_logging};
pub use scoped_storage::ScopedStorage;
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition, WriteResult,
};
