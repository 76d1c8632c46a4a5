//! This module holds entities that represent the whole configurable
//! driver session with the cluster.
//! The following abstractions are involved:
//! - [Session](session::Session) - the main entity of the driver. It:
//!   - runs the reactor threads all connections and requests live on,
//!   - keeps the view of the cluster and a connection pool to every node,
//!   - executes [statements](crate::statement::Statement) with their execution profiles.
//! - [SessionBuilder](session_builder::SessionBuilder) - just a convenient builder for a `Session`.
//! - [ExecutionProfile](execution_profile::ExecutionProfile) - a named bundle of request options
//!   and policies, shared by the statements that choose it.
//! - [ResultFuture](result_future::ResultFuture) - the eventual result of an executed statement.

mod execution;

pub mod execution_profile;
pub use execution_profile::{ExecutionProfile, ExecutionProfileBuilder, ExecutionProfileHandle};

pub mod result_future;
pub use result_future::ResultFuture;

pub mod session;
pub use session::{ProfileCopyMode, Session, SessionConfig};

pub mod session_builder;
pub use session_builder::SessionBuilder;

pub use kestrel_cql::frame::Compression;
