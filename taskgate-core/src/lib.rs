//! TaskGate Core: admission and reliability layer for an MCP task gateway.
//!
//! Every inbound request passes through the same chain, regardless of the
//! transport that carried it: request context, bearer authentication with a
//! TTL cache, a sliding-window rate limiter on a shared store, the tool
//! handler, and a retrying upstream client whose failures map onto a fixed
//! error taxonomy. The binary crate (`taskgate`) supplies the stdio and
//! HTTP/SSE transports on top of [`gateway::Gateway`].

pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod jsonrpc;
pub mod lifecycle;
pub mod ratelimit;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod upstream;

pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
