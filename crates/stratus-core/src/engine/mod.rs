//! The task state machine engine.
//!
//! A task is a persisted document patched forward by operations the task
//! sends to itself. The engine supplies the invariant machinery every
//! workflow shares:
//!
//! - creation at `CREATED`, asynchronous move to `STARTED`
//! - stage-transition validation (monotonic, duplicate-failure no-ops,
//!   late transient patches absorbed)
//! - per-field merge of patch into state, one store write per transition
//! - dispatch of the workflow's step handler after each transition
//! - failure conversion: a handler error or panic becomes a `FAILED`
//!   document, never a crashed process
//! - parent notification through the task's callback on terminal stages

pub mod host;
pub mod retry;
pub mod service;
pub mod workflow;

pub use self::host::{ServiceHost, ServiceHostBuilder};
pub use self::retry::RetryPolicy;
pub use self::service::{DynTaskService, TaskService};
pub use self::workflow::{StepAction, TaskWorkflow};
