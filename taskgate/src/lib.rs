//! TaskGate gateway process: transports, admin endpoints, and wiring.
//!
//! The admission layer itself lives in `taskgate-core`; this crate only
//! frames requests, exposes operational endpoints, and owns startup and
//! shutdown ordering.

pub mod admin;
pub mod cli;
pub mod error;
pub mod logging;
pub mod server;
pub mod transport;
