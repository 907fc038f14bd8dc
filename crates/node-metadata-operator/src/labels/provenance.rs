//! Provenance records for propagated labels.
//!
//! Every Machine and Node the operator writes to carries an annotation naming
//! the `MachineSet` the labels came from and the keys that were introduced by
//! propagation. Removal decisions are based solely on this record.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Default annotation key holding the provenance record.
pub const DEFAULT_PROVENANCE_ANNOTATION: &str = "node-metadata-operator/propagated-labels";

/// Keys written to an object by propagation from a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Source identity, `<namespace>/<name>` of the `MachineSet`
    pub source: String,

    /// Label keys introduced by propagation from `source`
    #[serde(default)]
    pub keys: BTreeSet<String>,
}

impl Provenance {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            keys: BTreeSet::new(),
        }
    }

    /// Read the record stored under `annotation`, if any.
    ///
    /// A malformed value is logged and treated as absent so a corrupted
    /// annotation can never trigger removals.
    #[must_use]
    pub fn from_annotations(
        annotations: Option<&BTreeMap<String, String>>,
        annotation: &str,
    ) -> Option<Self> {
        let raw = annotations?.get(annotation)?;
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(annotation = %annotation, error = %e, "Ignoring malformed provenance annotation");
                None
            }
        }
    }

    /// Keys this record lets `source` remove. Empty when written by another source.
    #[must_use]
    pub fn owned_by(record: Option<&Self>, source: &str) -> BTreeSet<String> {
        record
            .filter(|r| r.source == source)
            .map(|r| r.keys.clone())
            .unwrap_or_default()
    }

    /// Serialized annotation value.
    pub fn to_annotation_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
