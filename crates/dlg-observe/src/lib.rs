//! Logging bootstrap for the delegate processes.

mod logger;
pub use logger::*;
