//! MBOX module
//!
//! Byte-exact message boundary scanning for MBOX archives.

pub mod scanner;

pub use scanner::{count_messages, is_boundary_line, BoundaryScanner, Message, BOUNDARY_MARKER};
