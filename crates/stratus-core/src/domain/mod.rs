//! Domain model: links, stages, callbacks, task state, merge policies.

pub mod callback;
pub mod link;
pub mod merge;
pub mod stage;
pub mod task;

pub use callback::{CallbackTarget, ServiceTaskCallback};
pub use link::DocumentLink;
pub use merge::{Mergeable, merge_custom_properties, merge_if_some, merge_once};
pub use stage::{FailureInfo, SubStage, TaskInfo, TaskStage};
pub use task::{TaskCreate, TaskPatch, TaskState, TaskStatus};
