//! Operator Configuration
//!
//! Loaded from a YAML file mounted into the operator pod. Every field has a
//! default so an empty file (or no file at all) yields a working operator.

use crate::labels::{LabelGuard, DEFAULT_PROVENANCE_ANNOTATION};
use crate::reconciler::PropagationSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main operator configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Restrict the operator to one namespace; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Requeue delay after a successful pass, in seconds
    #[serde(default = "default_resync_interval")]
    pub resync_interval_seconds: u64,

    /// Requeue delay after a failed pass, in seconds
    #[serde(default = "default_error_requeue")]
    pub error_requeue_seconds: u64,

    /// Label domains the operator must never write or remove on Nodes
    #[serde(default = "default_protected_domains")]
    pub protected_node_label_domains: Vec<String>,

    /// Annotation recording which labels were propagated
    #[serde(default = "default_provenance_annotation")]
    pub provenance_annotation: String,

    /// Health endpoint configuration
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_resync_interval() -> u64 {
    300
}

fn default_error_requeue() -> u64 {
    30
}

fn default_protected_domains() -> Vec<String> {
    vec!["kubernetes.io".to_string(), "k8s.io".to_string()]
}

fn default_provenance_annotation() -> String {
    DEFAULT_PROVENANCE_ANNOTATION.to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_interval_seconds: default_resync_interval(),
            error_requeue_seconds: default_error_requeue(),
            protected_node_label_domains: default_protected_domains(),
            provenance_annotation: default_provenance_annotation(),
            health: HealthConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        // An empty document deserializes to unit, not to an empty mapping.
        if config_str.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.resync_interval_seconds == 0 {
            return Err(anyhow::anyhow!("resyncIntervalSeconds must be greater than zero"));
        }
        if self.error_requeue_seconds == 0 {
            return Err(anyhow::anyhow!("errorRequeueSeconds must be greater than zero"));
        }
        if self
            .protected_node_label_domains
            .iter()
            .any(|d| d.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "protectedNodeLabelDomains must not contain empty entries"
            ));
        }

        let Some((prefix, name)) = self.provenance_annotation.split_once('/') else {
            return Err(anyhow::anyhow!(
                "provenanceAnnotation '{}' must be a prefixed key like 'example.com/name'",
                self.provenance_annotation
            ));
        };
        if prefix.is_empty() || name.is_empty() || name.contains('/') {
            return Err(anyhow::anyhow!(
                "provenanceAnnotation '{}' is not a valid annotation key",
                self.provenance_annotation
            ));
        }

        if let Some(ns) = &self.namespace {
            if ns.trim().is_empty() {
                return Err(anyhow::anyhow!("namespace must not be empty when set"));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }

    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    /// Settings handed to the label propagator.
    #[must_use]
    pub fn propagation_settings(&self) -> PropagationSettings {
        PropagationSettings {
            provenance_annotation: self.provenance_annotation.clone(),
            node_guard: LabelGuard::with_protected_domains(
                self.protected_node_label_domains.iter().cloned(),
            ),
        }
    }
}
