//! In-memory port implementations, for development and tests.

pub mod adapter;
pub mod memory;

pub use self::adapter::MockAdapter;
pub use self::memory::InMemoryStore;
