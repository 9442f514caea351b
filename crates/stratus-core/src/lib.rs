//! stratus-core
//!
//! Durable, replicated task services for cloud-resource provisioning,
//! rebuilt around a small reusable core:
//!
//! - **domain**: links, stages, callbacks, task state, merge policies
//! - **ports**: abstraction layer (DocumentStore, ResourceAdapter, Clock)
//! - **impls**: in-memory implementations for development and tests
//! - **query**: query spec builder + paged query helper
//! - **engine**: the task state machine engine (service host, task service,
//!   workflow trait, bounded retry)
//! - **counter**: sub-task counter (fan-out/fan-in barrier)
//! - **subscription**: extensibility hooks at declared sub-stages
//! - **workflows**: concrete task instantiations (compute, network,
//!   load balancer, placement selection, reservation)
//!
//! Every task is a persisted document patched forward by self-sent
//! operations; the document is the single source of truth for "what step
//! are we on". See the module docs for the individual contracts.

pub mod counter;
pub mod domain;
pub mod engine;
pub mod error;
pub mod impls;
pub mod ports;
pub mod query;
pub mod subscription;
pub mod workflows;

pub use error::EngineError;
