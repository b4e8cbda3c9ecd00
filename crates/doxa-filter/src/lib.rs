//! The MongoDB-style filter/predicate engine and the
//! prototype-pollution guard shared by the filter engine and the
//! collection façade's update path.

pub mod matcher;
pub mod sanitize;

pub use matcher::{get_path, make_predicate, matches, Predicate};
pub use sanitize::{reject_forbidden_keys, reject_forbidden_path};
