//! Ports: the abstraction layer between the task engine and the outside
//! world.
//!
//! Each trait hides one external concern behind an interface the engine
//! and the workflows program against:
//! - [`DocumentStore`]: the versioned document index (the source of truth)
//! - [`ResourceAdapter`]: provider-side instance operations
//! - [`Clock`]: time, swappable for tests

pub mod adapter;
pub mod clock;
pub mod document_store;

pub use self::adapter::{AdapterRequest, AdapterRequestKind, ResourceAdapter};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{Document, DocumentStore, QueryPage};
