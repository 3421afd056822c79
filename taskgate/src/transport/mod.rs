//! Inbound transports.
//!
//! Both feed the same `Gateway::handle` pipeline. They differ only in how a
//! request is framed and where the credential comes from.

pub mod http;
pub mod stdio;

pub use stdio::StdioTransport;
