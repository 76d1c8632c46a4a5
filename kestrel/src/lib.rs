//! Async request execution engine for CQL databases.
//!
//! The driver keeps a pool of multiplexed connections to every node of a cluster,
//! runs them on a fixed set of reactor threads, and executes statements against
//! the cluster: it picks the nodes from a load balancing policy, retries failed
//! attempts as a retry policy decides, and races speculative attempts when the
//! statement allows it.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use kestrel::client::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042".parse()?)
//!         .known_node("1.2.3.4:9876".parse()?)
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! `Session` is usually created using the [SessionBuilder].\
//! All configuration options for a `Session` can be specified while building.
//!
//! ### Executing statements
//! A [Statement](statement::Statement) carries the CQL text, its bound values and
//! the options that override its [execution profile](client::ExecutionProfile).
//! The easiest way to bind values is using a tuple:
//! ```rust
//! # use kestrel::client::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! use kestrel::statement::{Consistency, Statement};
//!
//! let statement = Statement::new("INSERT INTO ks.tab (a, b) VALUES(?, ?)")
//!     .bind(&(2_i32, "some text"))?
//!     .with_consistency(Consistency::Quorum)
//!     .with_idempotence(true);
//! let result = session.execute(statement).await?;
//! if let Some(history) = result.history() {
//!     println!("attempted {:?}", history.attempted_hosts());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! `Session::execute` returns a [ResultFuture](client::ResultFuture): it can be awaited,
//! or waited on from a thread without an async runtime.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod cluster;
pub mod errors;
pub(crate) mod network;
pub mod observability;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub(crate) mod utils;

pub use network::{ConnectionState, TlsContext, TlsError, TlsStream};

#[cfg(feature = "unstable-testing")]
#[doc(hidden)]
pub use network::StreamIdSet;

pub use kestrel_cql::frame::protocol_version::ProtocolVersion;

pub use client::{ExecutionProfile, ResultFuture, Session, SessionBuilder, SessionConfig};
pub use response::QueryResult;
