//! Machine API resources (`machine.openshift.io/v1beta1`).
//!
//! Only the fields the operator reads or writes are modelled. Writes go through
//! JSON merge patches, so fields absent here are never dropped from the server.

pub mod machine;
pub mod machineset;
pub mod selector;

pub use machine::*;
pub use machineset::*;
pub use selector::*;
