//! HTTP/1.1 request handling for one connection.
//!
//! - **`parser`**: incremental, resumable request parser fed raw bytes
//! - **`request`** / **`response`**: owned message types and builders
//! - **`writer`**: serializes a response and writes it without blocking
//! - **`connection`**: per-connection state driven by the event loop
//! - **`handler`**: the application hook run on the worker pool
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← parse whatever the socket has
//!        └──────┬──────┘
//!               │ MessageComplete
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatched     │ ← handler runs on a worker
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← resumes on write readiness
//!        └──────┬───────────┘
//!               │ Response flushed
//!               ├─ Keep-Alive → Reading (parser reset)
//!               └─ Close → Draining → Closed
//! ```

pub mod connection;
pub mod handler;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
