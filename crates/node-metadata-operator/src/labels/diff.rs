//! Label diff engine.
//!
//! Pure functions that compute and apply the minimal set of label changes
//! needed to bring a target label map in line with a desired one.

use std::collections::{BTreeMap, BTreeSet};

/// Label map as stored on Kubernetes objects.
pub type LabelSet = BTreeMap<String, String>;

/// Changes required to converge a target label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    /// Keys to create or overwrite, with their new values
    pub upserts: LabelSet,
    /// Keys to delete
    pub removals: BTreeSet<String>,
}

impl LabelDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Number of individual label changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }

    /// Apply this diff to `target` in place.
    pub fn apply(&self, target: &mut LabelSet) {
        for key in &self.removals {
            target.remove(key);
        }
        for (key, value) in &self.upserts {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Decides which label keys the operator may touch on a given target.
///
/// Keys in a protected domain are neither written nor removed. A key belongs to
/// a domain when its prefix (the part before `/`) equals the domain or is a
/// subdomain of it, so `kubernetes.io` covers `node-role.kubernetes.io/worker`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelGuard {
    protected_domains: Vec<String>,
}

impl LabelGuard {
    /// A guard that allows every key.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_protected_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected_domains: domains
                .into_iter()
                .map(Into::into)
                .map(|d| d.trim().trim_end_matches('/').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn is_protected(&self, key: &str) -> bool {
        let Some((prefix, _)) = key.split_once('/') else {
            return false;
        };
        let prefix = prefix.to_ascii_lowercase();

        self.protected_domains.iter().any(|domain| {
            prefix == *domain
                || prefix
                    .strip_suffix(domain.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
    }
}

/// Compute the changes that converge `current` towards `desired`.
///
/// `propagated` holds the keys previously written from the same source; only
/// those are eligible for removal when they drop out of `desired`.
#[must_use]
pub fn compute_diff(
    desired: &LabelSet,
    current: &LabelSet,
    propagated: &BTreeSet<String>,
    guard: &LabelGuard,
) -> LabelDiff {
    let upserts = desired
        .iter()
        .filter(|(key, _)| !guard.is_protected(key))
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let removals = current
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .filter(|key| propagated.contains(*key))
        .filter(|key| !guard.is_protected(key))
        .cloned()
        .collect();

    LabelDiff { upserts, removals }
}

/// Reconcile `target` against `desired` in place.
///
/// `propagated` is updated to the keys this source owns on the target after the
/// call: previously owned keys that are still desired, plus every key written
/// now. A key whose value already matched and was never owned stays unowned.
/// Returns the diff that was applied.
pub fn reconcile_labels(
    desired: &LabelSet,
    target: &mut LabelSet,
    propagated: &mut BTreeSet<String>,
    guard: &LabelGuard,
) -> LabelDiff {
    let diff = compute_diff(desired, target, propagated, guard);
    diff.apply(target);

    propagated.retain(|key| desired.contains_key(key) && !guard.is_protected(key));
    propagated.extend(diff.upserts.keys().cloned());

    diff
}
