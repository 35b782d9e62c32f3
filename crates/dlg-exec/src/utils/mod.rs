pub mod limits;
pub use limits::{ProcessLimits, attach_limits};
