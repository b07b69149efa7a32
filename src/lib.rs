//! idlegate - HTTP/1.1 connection core
//!
//! A single mio event loop owns every client connection, feeds bytes to an
//! incremental request parser and hands complete requests to a bounded
//! worker pool. Connections that stop moving bytes are reclaimed by a
//! periodic idle sweep.

pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod server;
