//! Mallory reconciliation core
//!
//! Runs the operations declared by an `Event` resource under an
//! impersonated intruder identity, records one audit event per outcome and
//! reverses everything it created once the resource is deleted.
//!
//! # Architecture
//!
//! ```text
//! reconcile ──▶ Lifecycle ──▶ OperationDispatcher ──▶ ClientFactory ──▶ ClusterApi
//!     │             │                  │
//!     │             │                  └──▶ bridge (exec / logs)
//!     │             └──▶ EventSink
//!     └──▶ EventStore (finalizers, status)
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod store;

pub use client::{ClientFactory, ClusterApi, KubeClientFactory, KubeClusterApi};
pub use config::{OperatorConfig, StreamLimits};
pub use dispatcher::OperationDispatcher;
pub use document::ResourceDocument;
pub use error::{Error, Result};
pub use events::{EventSink, KubeEventSink, OperationEvent};
pub use identity::IntruderIdentity;
pub use lifecycle::{error_policy, reconcile, Context, Lifecycle};
pub use store::{EventStore, KubeEventStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
