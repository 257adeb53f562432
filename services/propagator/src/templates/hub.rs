//! Built-in hub template resolver.
//!
//! Understands field references into [`TemplateContext`]; function calls
//! are rejected, and calls to disabled functions are reported as such.

use regex::{Captures, Regex};

use super::{TemplateConfig, TemplateContext, TemplateError, TemplateResolver};

/// Resolves `{{hub .Field hub}}` references.
#[derive(Debug, Clone, Default)]
pub struct HubTemplateResolver;

impl HubTemplateResolver {
    pub fn new() -> Self {
        Self
    }

    fn pattern(config: &TemplateConfig) -> Result<Regex, TemplateError> {
        Regex::new(&format!(
            r"(?s){}-?\s*(.*?)\s*-?{}",
            regex::escape(&config.start_delim),
            regex::escape(&config.stop_delim)
        ))
        .map_err(|e| TemplateError::Syntax(e.to_string()))
    }

    fn evaluate(
        config: &TemplateConfig,
        expression: &str,
        context: &TemplateContext,
    ) -> Result<String, TemplateError> {
        if let Some(field) = expression.strip_prefix('.') {
            return match field {
                "ManagedClusterName" => Ok(context.managed_cluster_name.clone()),
                _ => Err(TemplateError::UnknownField(expression.to_string())),
            };
        }

        let function = expression.split_whitespace().next().unwrap_or_default();
        if config.disabled_functions.iter().any(|f| f == function) {
            return Err(TemplateError::DisabledFunction(function.to_string()));
        }
        Err(TemplateError::Unsupported(expression.to_string()))
    }
}

impl TemplateResolver for HubTemplateResolver {
    fn resolve(
        &self,
        config: &TemplateConfig,
        raw: &[u8],
        context: &TemplateContext,
    ) -> Result<Vec<u8>, TemplateError> {
        let text = std::str::from_utf8(raw).map_err(|e| TemplateError::Syntax(e.to_string()))?;
        let pattern = Self::pattern(config)?;

        let mut failure = None;
        let resolved = pattern.replace_all(text, |caps: &Captures<'_>| {
            if failure.is_some() {
                return String::new();
            }
            match Self::evaluate(config, &caps[1], context) {
                Ok(value) => value,
                Err(e) => {
                    failure = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }

        // An unmatched start delimiter is an unterminated action.
        if resolved.contains(config.start_delim.as_str()) {
            return Err(TemplateError::Syntax(format!(
                "unterminated action, expected {}",
                config.stop_delim
            )));
        }

        Ok(resolved.into_owned().into_bytes())
    }
}
