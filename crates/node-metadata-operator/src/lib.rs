/*
 * 5D Labs Agent Platform - Node Metadata Operator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::doc_markdown)]

//! Node metadata operator library
//!
//! Propagates the labels declared on a `MachineSet` template to every `Machine`
//! the set owns, and from each `Machine` to the `Node` backing it. Labels that
//! were never written by the operator are left alone: every object carries a
//! provenance annotation listing the keys the operator introduced, and only
//! those keys are ever removed.

pub mod config;
pub mod controller;
pub mod crds;
pub mod health;
pub mod labels;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod wait;

// Re-export commonly used types
pub use config::OperatorConfig;
pub use crds::{Machine, MachineSet};
pub use labels::{reconcile_labels, LabelDiff, LabelGuard, LabelSet, Provenance};
pub use reconciler::{LabelPropagator, ReconcileOutcome};
pub use store::{InMemoryStore, KubeStore, MachineSetId, ObjectKind, ObjectStore, TargetRef};
pub use types::{Error, ErrorKind, Result};
