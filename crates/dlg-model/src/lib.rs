//! Value types exchanged between the delegate engine and its manager.
//!
//! Everything here is plain data: it is cloned freely, serialized on the wire
//! in the manager's camelCase shape, and never mutated once constructed.

mod domain;
pub use domain::*;

mod error;
pub use error::ModelError;
