//! Placeholder manifests embedded in a script's `fields`.
//!
//! ```yaml
//! fields:
//!   target_light:
//!     name: Kitchen light
//!     selector: { entity: { domain: light } }
//!     placeholder:
//!       search_terms: ["kitchen", { value: "ceiling", weight: 0.3 }]
//!       min_confidence: 80
//!       fallback_entity_id: light.kitchen_main
//!       limit: 5
//! ```

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ResolverSettings;
use crate::confidence::{ConfidenceThreshold, normalize_confidence};
use crate::error::InputError;
use crate::matcher::{SearchTerm, resolve_limit, search_terms_from_value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlaceholderOverride {
    /// Replacement search terms: string, list, or {term: weight} mapping
    #[serde(default)]
    #[schemars(with = "Option<serde_json::Value>")]
    pub search_terms: Option<Value>,
    /// Confidence as a ratio (0-1) or percentage (0-100)
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub min_confidence: Option<Value>,
    #[serde(default)]
    pub fallback_entity_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub entity_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderDefinition {
    pub id: String,
    pub search_terms: Option<Value>,
    pub min_confidence: Option<Value>,
    pub fallback_entity_id: Option<String>,
    pub limit: Option<usize>,
    pub entity_domains: Vec<String>,
}

/// A definition with every field validated and defaulted.
#[derive(Debug, Clone)]
pub struct PlaceholderContext {
    pub id: String,
    pub terms: Option<Vec<SearchTerm>>,
    pub threshold: ConfidenceThreshold,
    pub fallback_entity_id: Option<String>,
    pub limit: usize,
    pub entity_domains: Vec<String>,
}

impl PlaceholderDefinition {
    fn from_field(id: &str, field: &Value) -> Option<Result<Self, InputError>> {
        let placeholder = field.get("placeholder")?;
        let Some(placeholder) = placeholder.as_object() else {
            return Some(Err(InputError::new(
                format!("fields.{}.placeholder", id),
                "placeholder must be a mapping",
            )));
        };

        let search_terms = placeholder
            .get("search_terms")
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| field.get("name").filter(|v| v.is_string()).cloned());
        let limit = match placeholder.get("limit") {
            None | Some(Value::Null) => None,
            Some(raw) => match raw.as_u64() {
                Some(limit) => Some(limit as usize),
                None => {
                    return Some(Err(InputError::new(
                        format!("fields.{}.placeholder.limit", id),
                        "limit must be a positive integer",
                    )));
                }
            },
        };

        Some(Ok(Self {
            id: id.to_string(),
            search_terms,
            min_confidence: placeholder.get("min_confidence").cloned(),
            fallback_entity_id: placeholder
                .get("fallback_entity_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            limit,
            entity_domains: selector_domains(field),
        }))
    }

    /// Caller overrides win field-by-field.
    pub fn merge(&mut self, overrides: &PlaceholderOverride) {
        if let Some(terms) = &overrides.search_terms {
            self.search_terms = Some(terms.clone());
        }
        if let Some(confidence) = &overrides.min_confidence {
            self.min_confidence = Some(confidence.clone());
        }
        if let Some(fallback) = &overrides.fallback_entity_id {
            self.fallback_entity_id = Some(fallback.clone());
        }
        if let Some(limit) = overrides.limit {
            self.limit = Some(limit);
        }
        if let Some(domains) = &overrides.entity_domains {
            self.entity_domains = domains.clone();
        }
    }

    /// Validate against settings. `request_confidence` applies when the
    /// placeholder carries no threshold of its own.
    pub fn context(
        &self,
        settings: &ResolverSettings,
        request_confidence: Option<&Value>,
    ) -> Result<PlaceholderContext, InputError> {
        let prefixed = |error: InputError| {
            InputError::new(format!("placeholders.{}.{}", self.id, error.field), error.message)
        };

        let terms = match &self.search_terms {
            Some(raw) => Some(search_terms_from_value(raw).map_err(prefixed)?),
            None if self.fallback_entity_id.is_some() => None,
            None => {
                return Err(InputError::new(
                    format!("placeholders.{}", self.id),
                    "needs search_terms or a fallback_entity_id",
                ));
            }
        };
        let confidence = self
            .min_confidence
            .as_ref()
            .filter(|v| !v.is_null())
            .or(request_confidence);

        Ok(PlaceholderContext {
            id: self.id.clone(),
            terms,
            threshold: normalize_confidence(confidence, settings.default_confidence)
                .map_err(prefixed)?,
            fallback_entity_id: self.fallback_entity_id.clone(),
            limit: resolve_limit(self.limit, settings).map_err(prefixed)?,
            entity_domains: self.entity_domains.clone(),
        })
    }
}

fn selector_domains(field: &Value) -> Vec<String> {
    match field.pointer("/selector/entity/domain") {
        Some(Value::String(domain)) => vec![domain.clone()],
        Some(Value::Array(domains)) => domains
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct PlaceholderManifest {
    pub script_id: String,
    pub placeholders: Vec<PlaceholderDefinition>,
}

impl PlaceholderManifest {
    /// Read placeholders in declaration order from a stored script config.
    pub fn from_script_config(script_id: &str, config: &Value) -> Result<Self, InputError> {
        let placeholders = match config.get("fields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(fields)) => fields
                .iter()
                .filter_map(|(id, field)| PlaceholderDefinition::from_field(id, field))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(InputError::new("fields", "script fields must be a mapping"));
            }
        };

        Ok(Self {
            script_id: script_id.to_string(),
            placeholders,
        })
    }

    pub fn apply_overrides(
        &mut self,
        overrides: &BTreeMap<String, PlaceholderOverride>,
    ) -> Result<(), InputError> {
        for (id, placeholder_override) in overrides {
            let placeholder = self
                .placeholders
                .iter_mut()
                .find(|p| &p.id == id)
                .ok_or_else(|| {
                    InputError::new(
                        "placeholder_overrides",
                        format!("script {} has no placeholder '{}'", self.script_id, id),
                    )
                })?;
            placeholder.merge(placeholder_override);
        }
        Ok(())
    }
}

/// `script.morning` and `morning` both name the `morning` script.
pub fn script_object_id(script_id: &str) -> Result<&str, InputError> {
    let object_id = script_id.strip_prefix("script.").unwrap_or(script_id).trim();
    if object_id.is_empty() || object_id.contains('.') {
        return Err(InputError::new(
            "script_id",
            "expected a script id like 'script.morning'",
        ));
    }
    Ok(object_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> Value {
        json!({
            "alias": "Evening scene",
            "fields": {
                "target_light": {
                    "name": "Target light",
                    "selector": {"entity": {"domain": "light"}},
                    "placeholder": {
                        "search_terms": ["kitchen", {"value": "ceiling", "weight": 0.3}],
                        "min_confidence": 80
                    }
                },
                "brightness": {"name": "Brightness", "selector": {"number": {}}},
                "speaker": {
                    "name": "Living room speaker",
                    "selector": {"entity": {"domain": ["media_player", "speaker"]}},
                    "placeholder": {"fallback_entity_id": "media_player.den", "limit": 3}
                }
            }
        })
    }

    #[test]
    fn placeholders_keep_declaration_order() {
        let manifest = PlaceholderManifest::from_script_config("evening", &sample_config()).unwrap();
        let ids: Vec<&str> = manifest.placeholders.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["target_light", "speaker"]);
        assert_eq!(manifest.placeholders[0].entity_domains, vec!["light"]);
        assert_eq!(
            manifest.placeholders[1].entity_domains,
            vec!["media_player", "speaker"]
        );
    }

    #[test]
    fn field_name_is_the_default_search_term() {
        let manifest = PlaceholderManifest::from_script_config("evening", &sample_config()).unwrap();
        assert_eq!(
            manifest.placeholders[1].search_terms,
            Some(json!("Living room speaker"))
        );
    }

    #[test]
    fn overrides_win_field_by_field() {
        let mut manifest =
            PlaceholderManifest::from_script_config("evening", &sample_config()).unwrap();
        let overrides = BTreeMap::from([(
            "target_light".to_string(),
            PlaceholderOverride {
                min_confidence: Some(json!(0.5)),
                ..Default::default()
            },
        )]);
        manifest.apply_overrides(&overrides).unwrap();

        let placeholder = &manifest.placeholders[0];
        assert_eq!(placeholder.min_confidence, Some(json!(0.5)));
        assert!(placeholder.search_terms.is_some());

        let context = placeholder
            .context(&ResolverSettings::default(), None)
            .unwrap();
        assert!((context.threshold.percent - 50.0).abs() < 1e-9);
        assert_eq!(context.terms.unwrap().len(), 2);
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut manifest =
            PlaceholderManifest::from_script_config("evening", &sample_config()).unwrap();
        let overrides = BTreeMap::from([("nope".to_string(), PlaceholderOverride::default())]);
        let err = manifest.apply_overrides(&overrides).unwrap_err();
        assert_eq!(err.field, "placeholder_overrides");
    }

    #[test]
    fn context_requires_terms_or_fallback() {
        let definition = PlaceholderDefinition {
            id: "orphan".into(),
            search_terms: None,
            min_confidence: None,
            fallback_entity_id: None,
            limit: None,
            entity_domains: Vec::new(),
        };
        let err = definition
            .context(&ResolverSettings::default(), None)
            .unwrap_err();
        assert_eq!(err.field, "placeholders.orphan");
    }

    #[test]
    fn context_errors_name_the_placeholder() {
        let definition = PlaceholderDefinition {
            id: "lamp".into(),
            search_terms: Some(json!("lamp")),
            min_confidence: Some(json!(250)),
            fallback_entity_id: None,
            limit: None,
            entity_domains: Vec::new(),
        };
        let err = definition
            .context(&ResolverSettings::default(), None)
            .unwrap_err();
        assert_eq!(err.field, "placeholders.lamp.min_confidence");
    }

    #[test]
    fn script_ids_accept_both_forms() {
        assert_eq!(script_object_id("script.morning").unwrap(), "morning");
        assert_eq!(script_object_id("morning").unwrap(), "morning");
        assert!(script_object_id("light.morning").is_err());
        assert!(script_object_id("script.").is_err());
    }
}
