//! Transport surface consumed by connections.

pub mod source;

pub use source::{ByteSource, Transfer};
