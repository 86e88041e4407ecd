//! The turn engine: ingestion, boundary detection, turns, barge-in and the
//! ordered event stream.

pub mod boundary;
pub mod buffer;
pub mod context;
pub mod interruption;
pub mod messages;
pub mod multiplexer;
pub mod runner;
pub mod turn;
