use std::net::SocketAddr;

use kestrel_cql::frame::frame_errors::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DoorkeeperError {
    #[error("Listen on {0} failed with {1}")]
    Listen(SocketAddr, std::io::Error),
    #[error("Accepting a driver connection on {0} failed with {1}")]
    DriverConnectionAttempt(SocketAddr, std::io::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Malformed frame from driver {0}: {1}")]
    MalformedFrame(SocketAddr, FrameError),
    #[error("Could not serialize a response to driver {0}: {1}")]
    ResponseSerialization(SocketAddr, std::num::TryFromIntError),
}

#[derive(Debug, Error)]
pub enum MockError {
    #[error("Doorkeeper failed: {0}")]
    Doorkeeper(#[from] DoorkeeperError),
    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),
    #[error("Could not await mock cluster finish: {0}")]
    AwaitFinishFailure(String),
    #[error("All error reporting channels have already been closed")]
    SanityCheckFailure,
}
