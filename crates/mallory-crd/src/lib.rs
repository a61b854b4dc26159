//! Mallory custom resources
//!
//! The declarative unit of work is an `Event` (`mallory.io/v1`): one
//! intruder identity plus an ordered list of operations to run under it.
//!
//! ```yaml
//! apiVersion: mallory.io/v1
//! kind: Event
//! metadata:
//!   name: probe-pods
//! spec:
//!   intruder:
//!     serviceAccount: default
//!   operations:
//!     - id: read-pod
//!       verb: get
//!       resource:
//!         apiVersion: v1
//!         kind: Pod
//!         metadata:
//!           name: web
//! ```

pub mod event;
pub mod verb;

pub use event::{
    EventResource, EventSpec, EventStatus, Intruder, Operation, RunResult, UserInfo, FINALIZER,
};
pub use verb::{UnknownVerb, Verb};

/// Event reasons recorded against an `EventResource`
pub mod reasons {
    /// An operation returned an error
    pub const OPERATION_FAILED: &str = "OperationFailed";
    /// An operation completed
    pub const OPERATION_SUCCEEDED: &str = "OperationSucceeded";
    /// An operation produced output
    pub const OPERATION_OUTPUT: &str = "OperationOutput";
}
