//! # propwatch - Background change detection for shared objects
//!
//! propwatch polls the observable members of registered entities on a
//! dedicated thread, diffs them against the last known values and delivers
//! change notifications on each entity's home execution context.
//!
//! ## Core Concepts
//!
//! - **Scope**: the single active monitor per process; owns the loop thread
//! - **Entity**: any `Arc`-shared type implementing [`Observable`]
//! - **Accessor**: a named getter for one observable member
//! - **Notification context**: runs reads and notifications where the entity
//!   expects them (e.g. a UI thread)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use propwatch::{add_subscriber, InlineContext, Scope};
//!
//! let scope = Scope::create(InlineContext)?;
//! let doc = Arc::new(Document::new());
//! add_subscriber(&doc); // registers with the active scope
//!
//! doc.set_title("draft");
//! // ...a later cycle calls doc.member_changed(..) for "title"
//!
//! scope.teardown()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod accessor;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod monitor;
pub mod scope;

pub use accessor::{Accessor, AccessorCache, Command, MemberKind, ParameterizedCommand};
pub use config::ScopeConfig;
pub use context::{
    Action, DispatchCompleter, DispatchHandle, HomeThreadContext, InlineContext,
    NotificationContext,
};
pub use entity::{
    add_subscriber, remove_subscriber, Affinity, ChangeKind, EntityKey, MemberChange, Observable,
    ObservableCore,
};
pub use error::{DispatchError, MonitorError, MonitorResult, ReadError};
pub use monitor::{CycleReport, Monitor, MonitorStats, StatsSnapshot};
pub use scope::{Scope, ScopeHandle, ScopeId, SuspendToken};
