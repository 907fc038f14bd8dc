//! # Label Propagation Primitives
//!
//! - **`diff`**: computes and applies the minimal label changes for a target
//! - **`provenance`**: records which keys on a target were written by propagation

pub mod diff;
pub mod provenance;

pub use diff::{compute_diff, reconcile_labels, LabelDiff, LabelGuard, LabelSet};
pub use provenance::{Provenance, DEFAULT_PROVENANCE_ANNOTATION};
