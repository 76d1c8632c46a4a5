mod execution_profiles;
mod negotiation;
mod prepared;
mod retries;
mod session;
mod speculative;
pub(crate) mod utils;
