//! Hub template resolution.
//!
//! Nested policy templates may embed hub templates (`{{hub ... hub}}`)
//! that are resolved against the target cluster before a replica is
//! written. Resolution runs once per template-bearing nested object per
//! cluster; results are cluster-specific and never shared.
//!
//! The expression language is behind [`TemplateResolver`]. This module
//! owns the policy-level rules around it:
//!
//! - the disable-templates annotation turns processing off for a replica
//! - the trigger-update annotation never reaches a replica
//! - only kinds in [`TEMPLATE_CAPABLE_KINDS`] may use templates
//! - a resolution failure is annotated on the nested object and returned

mod hub;

use propagator_api::{annotations, ClusterDecision, Policy, PolicyTemplate, Resource};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::{PropagationError, PropagationResult};
use crate::telemetry::{EventRecorder, EventSubject, EventType, EVENT_REASON};

pub use hub::HubTemplateResolver;

/// Nested kinds allowed to carry hub templates. There is no discovery
/// mechanism for template-capable kinds, so this list is authoritative.
pub const TEMPLATE_CAPABLE_KINDS: &[&str] = &["ConfigurationPolicy"];

/// Hub template settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConfig {
    pub start_delim: String,
    pub stop_delim: String,
    /// Extra indentation for `indent`, relative to the wrapped object.
    pub additional_indentation: u32,
    /// Functions that must not be callable from hub templates.
    pub disabled_functions: Vec<String>,
    /// Namespace lookups are restricted to; set per root policy.
    pub lookup_namespace: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            start_delim: "{{hub".to_string(),
            stop_delim: "hub}}".to_string(),
            additional_indentation: 8,
            disabled_functions: vec!["fromSecret".to_string()],
            lookup_namespace: String::new(),
        }
    }
}

/// Values a hub template can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateContext {
    #[serde(rename = "ManagedClusterName")]
    pub managed_cluster_name: String,
}

/// Errors from a [`TemplateResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(String),

    #[error("function {0} is disabled in hub templates")]
    DisabledFunction(String),

    #[error("unknown field {0} in hub template")]
    UnknownField(String),

    #[error("unsupported hub template expression: {0}")]
    Unsupported(String),

    #[error("resolved template is not a valid object: {0}")]
    InvalidOutput(String),
}

/// Resolves the hub templates inside one raw nested object.
pub trait TemplateResolver: Send + Sync {
    fn resolve(
        &self,
        config: &TemplateConfig,
        raw: &[u8],
        context: &TemplateContext,
    ) -> Result<Vec<u8>, TemplateError>;
}

/// True when `raw` contains the template start delimiter.
pub fn has_template(raw: &[u8], start_delim: &str) -> bool {
    let delim = start_delim.as_bytes();
    !delim.is_empty() && raw.windows(delim.len()).any(|w| w == delim)
}

/// True when any nested template of the policy contains hub templates.
pub fn policy_has_templates(policy: &Policy, config: &TemplateConfig) -> bool {
    policy
        .spec
        .policy_templates
        .iter()
        .any(|t| has_template(&t.raw(), &config.start_delim))
}

/// Remove the root-only reprocessing marker.
pub fn strip_trigger_update(policy: &mut Policy) {
    policy
        .metadata
        .annotations
        .remove(annotations::TRIGGER_UPDATE);
}

/// Boolean literal parsing: 1/t/T/TRUE/true/True and 0/f/F/FALSE/false/False.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn templates_disabled(policy: &Policy) -> bool {
    policy
        .metadata
        .annotations
        .get(annotations::DISABLE_TEMPLATES)
        .and_then(|v| parse_bool(v))
        .unwrap_or(false)
}

/// Set an annotation on a nested object definition.
fn annotate_nested(template: &mut PolicyTemplate, key: &str, value: &str) {
    let Value::Object(object) = &mut template.object_definition else {
        return;
    };

    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };

    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if !annotations.is_object() {
        *annotations = Value::Object(Map::new());
    }
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Applies hub templates to replicas.
pub struct TemplateEngine<'a> {
    config: &'a TemplateConfig,
    resolver: &'a dyn TemplateResolver,
    recorder: &'a dyn EventRecorder,
}

impl<'a> TemplateEngine<'a> {
    pub fn new(
        config: &'a TemplateConfig,
        resolver: &'a dyn TemplateResolver,
        recorder: &'a dyn EventRecorder,
    ) -> Self {
        Self {
            config,
            resolver,
            recorder,
        }
    }

    /// Resolve the hub templates of `replica` for the decision's cluster.
    ///
    /// On a resolution failure the failing nested object carries the
    /// error under the hub-templates-error annotation, remaining nested
    /// objects are left untouched and the error is returned. The annotation
    /// exists only on `replica`; callers discard it on failure, so it never
    /// reaches the store.
    pub fn process(
        &self,
        replica: &mut Policy,
        decision: &ClusterDecision,
        root: &Policy,
    ) -> PropagationResult<()> {
        info!(
            policy_namespace = %root.namespace(),
            policy_name = %root.name(),
            cluster_name = %decision.cluster_name,
            "Processing templates"
        );

        if templates_disabled(replica) {
            info!("Detected annotation to disable templates, skipping template processing");
            return Ok(());
        }

        strip_trigger_update(replica);

        let config = TemplateConfig {
            lookup_namespace: root.namespace().to_string(),
            ..self.config.clone()
        };
        let context = TemplateContext {
            managed_cluster_name: decision.cluster_name.clone(),
        };

        for template in replica.spec.policy_templates.iter_mut() {
            let raw = template.raw();
            if !has_template(&raw, &config.start_delim) {
                continue;
            }

            if !template
                .kind()
                .is_some_and(|kind| TEMPLATE_CAPABLE_KINDS.contains(&kind))
            {
                error!(
                    kind = template.kind().unwrap_or_default(),
                    "Templates are restricted to only Configuration Policies"
                );
                self.recorder.record(
                    &EventSubject::of(root),
                    EventType::Warning,
                    EVENT_REASON,
                    &format!(
                        "Policy {}/{} has templates but it is not a ConfigurationPolicy.",
                        root.namespace(),
                        root.name()
                    ),
                );
                return Err(PropagationError::SpecValidity(
                    "templates are restricted to only Configuration Policies".to_string(),
                ));
            }

            debug!("Found object definition with templates");

            let resolved = self
                .resolver
                .resolve(&config, &raw, &context)
                .and_then(|bytes| {
                    serde_json::from_slice::<Value>(&bytes)
                        .map_err(|e| TemplateError::InvalidOutput(e.to_string()))
                });

            match resolved {
                Ok(object_definition) => template.object_definition = object_definition,
                Err(e) => {
                    let message = e.to_string();
                    error!(error = %message, "Failed to resolve templates");
                    self.recorder.record(
                        &EventSubject::of(root),
                        EventType::Warning,
                        EVENT_REASON,
                        &format!(
                            "Failed to resolve templates for cluster {}/{}: {}",
                            decision.cluster_namespace, decision.cluster_name, message
                        ),
                    );
                    annotate_nested(template, annotations::HUB_TEMPLATES_ERROR, &message);
                    return Err(PropagationError::TemplateResolution {
                        cluster: decision.key(),
                        message,
                    });
                }
            }
        }

        Ok(())
    }
}
