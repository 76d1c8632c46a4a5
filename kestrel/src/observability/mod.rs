//! This module holds entities that allow observing the driver's behaviour.
//! This includes:
//! - request execution history: every attempt of a request, the node it went to,
//!   its outcome and the retry decision that followed.
//!
//! Driver-side tracing is done with the [`tracing`] crate: each request runs in a
//! `Request` span, and each attempt in an `Executing request` span.

pub mod history;
