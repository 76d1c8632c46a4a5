//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [load_balancing]: which nodes a request is sent to, and in which order,
//! - [retry]: what to do when an attempt fails,
//! - [speculative_execution]: when to start additional attempts before the first one finishes,
//! - [reconnection]: how long to wait before reconnecting to a node that lost all its connections.

pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod speculative_execution;
