// ABOUTME: Execution engine for trailhead activity trees
// ABOUTME: Instance lifecycle, scheduling, bookmarks, properties, cancellation and persistence

pub mod bookmark;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod instance;
pub mod location;
pub mod persistence;
pub mod properties;
pub mod resolution;
pub mod result;
pub mod scheduler;
pub mod tree;

pub use bookmark::{
    Bookmark, BookmarkOptions, BookmarkRecord, BookmarkResumptionResult, BookmarkScope, HandleId,
};
pub use context::{
    AsyncActivity, CodeContext, CompletedChild, FaultContext, FaultDisposition, NativeActivity,
    NativeContext,
};
pub use error::{ExecutionError, Fault, FaultResult, Result};
pub use host::{EngineConfig, WorkflowEngine};
pub use instance::{ActivityState, InstanceId, InstanceInfo, Substate, TerminationRecord};
pub use persistence::PersistedState;
pub use properties::ExecutionProperty;
pub use result::{RunOutcome, WorkflowCompletion};
pub use scheduler::{AsyncOperation, ExternalHandle, OperationId};
pub use tree::InstanceTree;
