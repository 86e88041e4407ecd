//! Headless host integration: drive a pipeline over newline-delimited JSON.

pub mod stdio;

pub use stdio::{HostCommand, run_stdio_bridge};
