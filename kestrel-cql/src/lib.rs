//! CQL native protocol types for the kestrel driver.
//!
//! Covers the frame header, compression, the handful of requests and
//! responses the driver exchanges with a node, and the value seam used
//! to bind query parameters. Request parsing and response serialization
//! exist so test servers can speak the same protocol.

pub mod frame;

pub mod value;

pub use crate::frame::types::{Consistency, SerialConsistency};
