//! End-to-end flows: resolve targets, then act on Home Assistant.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{CachedSelection, SelectionCache, placeholder_key, quick_action_key};
use crate::client::HomeAssistantApi;
use crate::confidence::{ConfidenceThreshold, DecisionReason, is_obvious_match, normalize_confidence};
use crate::config::ResolverSettings;
use crate::elicitation::{
    ActionEnvelope, ElicitationState, Failure, FailureKind, Resolution, SlotDecision, SlotOutcome,
};
use crate::entity::EntityState;
use crate::error::{ClientError, InputError};
use crate::manifest::{PlaceholderContext, PlaceholderManifest, PlaceholderOverride, script_object_id};
use crate::matcher::{ScoredCandidate, SearchTerm, rank_entities, resolve_limit, search_terms_from_value};

const QUICK_ACTION_SLOT: &str = "target";

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct QuickActionRequest {
    /// Service domain, e.g. "light"
    pub domain: String,
    /// Service name, e.g. "turn_on"
    pub service: String,
    /// A string, a list of strings and/or {value, weight} records, or a {term: weight} mapping
    #[serde(default)]
    #[schemars(with = "Option<serde_json::Value>")]
    pub search_terms: Value,
    /// Restrict candidates to this entity domain (defaults to the service domain)
    #[serde(default)]
    pub entity_domain: Option<String>,
    /// Extra service data; `entity_id` is filled in with the resolved entity
    #[serde(default)]
    #[schemars(with = "Option<std::collections::HashMap<String, serde_json::Value>>")]
    pub service_data: Option<Map<String, Value>>,
    /// Confidence as a ratio (0-1) or percentage (0-100)
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub min_confidence: Option<Value>,
    /// Maximum candidates to rank (default: 5, max: 10)
    #[serde(default)]
    pub limit: Option<usize>,
    /// Entity chosen from a previous elicitation
    #[serde(default)]
    pub selected_entity_id: Option<String>,
    /// Must be true to act on `selected_entity_id`
    #[serde(default)]
    pub confirm: Option<bool>,
    /// Abandon the pending elicitation
    #[serde(default)]
    pub cancel: bool,
    /// Echo of `elicitation.elicitation_state` from the previous response
    #[serde(default)]
    #[schemars(with = "Option<std::collections::HashMap<String, serde_json::Value>>")]
    pub elicitation_state: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ScriptRequest {
    /// Script entity id, e.g. "script.evening_scene"
    pub script_id: String,
    /// Per-placeholder replacements for the script's own manifest
    #[serde(default)]
    pub placeholder_overrides: BTreeMap<String, PlaceholderOverride>,
    /// Placeholder id to the entity picked during elicitation
    #[serde(default)]
    pub selections: BTreeMap<String, String>,
    /// Must be true to act on `selections`
    #[serde(default)]
    pub confirm: Option<bool>,
    #[serde(default)]
    pub cancel: bool,
    /// Variables passed to the script alongside the resolved entities
    #[serde(default)]
    #[schemars(with = "std::collections::HashMap<String, serde_json::Value>")]
    pub variables: Map<String, Value>,
    /// Threshold for placeholders that do not declare their own
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub min_confidence: Option<Value>,
    #[serde(default)]
    #[schemars(with = "Option<std::collections::HashMap<String, serde_json::Value>>")]
    pub elicitation_state: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchRequest {
    /// A string, a list of strings and/or {value, weight} records, or a {term: weight} mapping
    #[schemars(with = "serde_json::Value")]
    pub search_terms: Value,
    #[serde(default)]
    pub entity_domain: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub min_confidence: Option<Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRequest {
    /// Jinja template, e.g. "{{ states('sun.sun') }}"
    pub template: String,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDecision {
    pub entity_id: String,
    pub reason: DecisionReason,
}

/// A ranking with the decision a quick action would take on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPreview {
    pub terms: Vec<SearchTerm>,
    pub threshold: ConfidenceThreshold,
    pub gap_points: f64,
    pub candidates: Vec<ScoredCandidate>,
    pub decision: Option<SearchDecision>,
}

// =============================================================================
// Executor
// =============================================================================

pub struct ActionExecutor {
    api: Arc<dyn HomeAssistantApi>,
    settings: ResolverSettings,
    cache: Mutex<SelectionCache>,
}

impl ActionExecutor {
    pub fn new(api: Arc<dyn HomeAssistantApi>, settings: ResolverSettings) -> Self {
        let cache = SelectionCache::new(settings.cache_capacity);
        Self {
            api,
            settings,
            cache: Mutex::new(cache),
        }
    }

    fn cached(&self, key: &str) -> Option<CachedSelection> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    fn remember(&self, key: String, selection: CachedSelection) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(%key, entity_id = %selection.entity_id, cached = cache.len(), "caching selection");
        cache.put(key, selection);
    }

    async fn snapshot(&self) -> Result<Vec<EntityState>, Failure> {
        self.api.get_states().await.map_err(transport_failure)
    }

    /// Look up a caller-named entity, failing with `entity_not_found` if absent.
    async fn verify_entity(
        &self,
        entity_id: &str,
        candidates: &[ScoredCandidate],
    ) -> Result<EntityState, Failure> {
        match self.api.get_entity_state(entity_id).await {
            Ok(Some(entity)) => Ok(entity),
            Ok(None) => {
                let mut failure = Failure::new(
                    FailureKind::EntityNotFound,
                    format!("Entity '{}' does not exist in Home Assistant", entity_id),
                )
                .with_candidates(candidates.to_vec());
                failure.entity_id = Some(entity_id.to_string());
                Err(failure)
            }
            Err(e) => Err(transport_failure(e)),
        }
    }

    // -------------------------------------------------------------------------
    // Search Preview
    // -------------------------------------------------------------------------

    pub async fn search_entities(&self, request: SearchRequest) -> Result<SearchPreview, Failure> {
        let terms = search_terms_from_value(&request.search_terms)?;
        let threshold =
            normalize_confidence(request.min_confidence.as_ref(), self.settings.default_confidence)?;
        let limit = resolve_limit(request.limit, &self.settings)?;

        let snapshot = self.snapshot().await?;
        let domains: Vec<String> = request.entity_domain.into_iter().collect();
        let candidates = rank_in_domains(&snapshot, &domains, &terms, limit);
        let decision = is_obvious_match(&candidates, &threshold, None, self.settings.gap_points)
            .map(|(candidate, reason)| SearchDecision {
                entity_id: candidate.entity_id.clone(),
                reason,
            });

        Ok(SearchPreview {
            terms,
            threshold,
            gap_points: self.settings.gap_points,
            candidates,
            decision,
        })
    }

    pub async fn render_template(&self, request: TemplateRequest) -> Result<Value, Failure> {
        if request.template.trim().is_empty() {
            return Err(InputError::new("template", "template must not be empty").into());
        }
        self.api
            .render_template(&request.template)
            .await
            .map_err(transport_failure)
    }

    // -------------------------------------------------------------------------
    // Quick Action
    // -------------------------------------------------------------------------

    /// Resolve one target entity from search terms and call a service on it.
    pub async fn quick_action(&self, request: QuickActionRequest) -> ActionEnvelope {
        let domain = request.domain.trim();
        let service = request.service.trim();
        tracing::info!(%domain, %service, "quick action requested");

        if domain.is_empty() {
            return InputError::new("domain", "domain is required").into();
        }
        if service.is_empty() {
            return InputError::new("service", "service is required").into();
        }
        let state = match ElicitationState::from_value(request.elicitation_state.as_ref()) {
            Ok(state) => state,
            Err(e) => return e.into(),
        };
        if request.cancel {
            return cancelled(&state, None, self.settings.max_rounds);
        }
        let threshold = match normalize_confidence(
            request.min_confidence.as_ref(),
            self.settings.default_confidence,
        ) {
            Ok(threshold) => threshold,
            Err(e) => return e.into(),
        };
        let limit = match resolve_limit(request.limit, &self.settings) {
            Ok(limit) => limit,
            Err(e) => return e.into(),
        };
        let terms = match &request.search_terms {
            Value::Null => None,
            raw => match search_terms_from_value(raw) {
                Ok(terms) => Some(terms),
                Err(e) => return e.into(),
            },
        };
        if terms.is_none() && request.selected_entity_id.is_none() {
            return InputError::new(
                "search_terms",
                "search_terms are required unless selected_entity_id is given",
            )
            .into();
        }
        if let Some(selected) = request.selected_entity_id.as_deref() {
            match request.confirm {
                Some(true) => {}
                Some(false) => return declined(&state, None, self.settings.max_rounds),
                None => {
                    return InputError::new(
                        "confirm",
                        format!("confirm must be true to act on selected_entity_id '{}'", selected),
                    )
                    .into();
                }
            }
        }

        let entity_domain = request
            .entity_domain
            .clone()
            .or_else(|| default_entity_domain(domain));
        let domains: Vec<String> = entity_domain.iter().cloned().collect();

        if let Some(selected) = request.selected_entity_id.as_deref() {
            if let Err(e) = check_selection_domain("selected_entity_id", selected, &domains) {
                return e.into();
            }
        }

        let cache_key = terms
            .as_ref()
            .map(|terms| quick_action_key(domain, service, terms, entity_domain.as_deref()));
        let candidates = match &terms {
            Some(terms) => match self.snapshot().await {
                Ok(snapshot) => rank_in_domains(&snapshot, &domains, terms, limit),
                Err(failure) => {
                    return ActionEnvelope::failed(
                        failure.with_action(domain, service, None),
                        Vec::new(),
                    );
                }
            },
            None => Vec::new(),
        };

        let resolution = if let Some(selected) = request.selected_entity_id.as_deref() {
            match self.verify_entity(selected, &candidates).await {
                Ok(entity) => manual_resolution(QUICK_ACTION_SLOT, &entity, &candidates),
                Err(failure) => {
                    return ActionEnvelope::failed(
                        failure.with_action(domain, service, Some(selected)),
                        Vec::new(),
                    );
                }
            }
        } else {
            let cached = cache_key.as_deref().and_then(|key| self.cached(key));
            let decision = SlotDecision {
                slot: QUICK_ACTION_SLOT,
                placeholder_id: None,
                candidates: &candidates,
                threshold,
                cached: cached.as_ref(),
                gap_points: self.settings.gap_points,
                max_rounds: self.settings.max_rounds,
            };
            match decision.decide(&state) {
                SlotOutcome::Resolved(resolution) => resolution,
                SlotOutcome::NeedsElicitation(elicitation) => {
                    tracing::info!(
                        rounds_used = elicitation.rounds_used,
                        reason = %elicitation.reason,
                        "quick action needs elicitation"
                    );
                    return ActionEnvelope::needs_elicitation(*elicitation, Vec::new());
                }
                SlotOutcome::Failed(failure) => {
                    return ActionEnvelope::failed(
                        (*failure).with_action(domain, service, None),
                        Vec::new(),
                    );
                }
            }
        };

        if let Some(key) = cache_key {
            let candidate = candidates.iter().find(|c| c.entity_id == resolution.entity_id);
            self.remember(key, resolution.to_cache_entry(candidate));
        }

        let mut data = request.service_data.unwrap_or_default();
        data.insert("entity_id".into(), Value::String(resolution.entity_id.clone()));
        let entity_id = resolution.entity_id.clone();
        self.execute(domain, service, Value::Object(data), Some(&entity_id), vec![resolution])
            .await
    }

    // -------------------------------------------------------------------------
    // Placeholder Script
    // -------------------------------------------------------------------------

    /// Resolve every placeholder a script declares, then run the script with
    /// the resolved entities as variables.
    pub async fn run_placeholder_script(&self, request: ScriptRequest) -> ActionEnvelope {
        let object_id = match script_object_id(&request.script_id) {
            Ok(object_id) => object_id.to_string(),
            Err(e) => return e.into(),
        };
        tracing::info!(script = %object_id, "placeholder script requested");

        let state = match ElicitationState::from_value(request.elicitation_state.as_ref()) {
            Ok(state) => state,
            Err(e) => return e.into(),
        };
        let pending = state.pending_placeholder.as_deref();
        if request.cancel {
            return cancelled(&state, pending, self.settings.max_rounds);
        }
        if !request.selections.is_empty() {
            match request.confirm {
                Some(true) => {}
                Some(false) => return declined(&state, pending, self.settings.max_rounds),
                None => {
                    return InputError::new("confirm", "confirm must be true to act on selections")
                        .into();
                }
            }
        }

        let config = match self.api.get_script_config(&object_id).await {
            Ok(config) => config,
            Err(ClientError::NotFound(_)) => {
                let mut failure = Failure::new(
                    FailureKind::EntityNotFound,
                    format!("Script '{}' does not exist", request.script_id),
                );
                failure.entity_id = Some(format!("script.{}", object_id));
                return ActionEnvelope::failed(failure, Vec::new());
            }
            Err(e) => return ActionEnvelope::failed(transport_failure(e), Vec::new()),
        };
        let contexts = match self.placeholder_contexts(&object_id, &config, &request) {
            Ok(contexts) => contexts,
            Err(e) => return e.into(),
        };

        let mut working = state.clone();
        let mut resolutions = Vec::with_capacity(contexts.len());
        let mut snapshot: Option<Vec<EntityState>> = None;

        for context in &contexts {
            if let Some(entity_id) = state.resolved_entities.get(&context.id) {
                resolutions.push(Resolution {
                    slot: context.id.clone(),
                    entity_id: entity_id.clone(),
                    friendly_name: None,
                    score: None,
                    reason: DecisionReason::PriorRound,
                });
                continue;
            }

            let outcome = self
                .resolve_placeholder(&object_id, context, &request, &working, &mut snapshot)
                .await;
            match outcome {
                SlotOutcome::Resolved(resolution) => {
                    working
                        .resolved_entities
                        .insert(resolution.slot.clone(), resolution.entity_id.clone());
                    resolutions.push(resolution);
                }
                SlotOutcome::NeedsElicitation(elicitation) => {
                    tracing::info!(
                        script = %object_id,
                        placeholder = %context.id,
                        rounds_used = elicitation.rounds_used,
                        "placeholder needs elicitation"
                    );
                    return ActionEnvelope::needs_elicitation(*elicitation, resolutions);
                }
                SlotOutcome::Failed(failure) => {
                    return ActionEnvelope::failed(*failure, resolutions);
                }
            }
        }

        let mut variables = request.variables;
        for resolution in &resolutions {
            variables.insert(
                resolution.slot.clone(),
                Value::String(resolution.entity_id.clone()),
            );
        }
        self.execute("script", &object_id, Value::Object(variables), None, resolutions)
            .await
    }

    fn placeholder_contexts(
        &self,
        object_id: &str,
        config: &Value,
        request: &ScriptRequest,
    ) -> Result<Vec<PlaceholderContext>, InputError> {
        let mut manifest = PlaceholderManifest::from_script_config(object_id, config)?;
        manifest.apply_overrides(&request.placeholder_overrides)?;

        if let Some(unknown) = request
            .selections
            .keys()
            .find(|id| !manifest.placeholders.iter().any(|p| &&p.id == id))
        {
            return Err(InputError::new(
                "selections",
                format!("script {} has no placeholder '{}'", object_id, unknown),
            ));
        }

        manifest
            .placeholders
            .iter()
            .map(|p| p.context(&self.settings, request.min_confidence.as_ref()))
            .collect()
    }

    async fn resolve_placeholder(
        &self,
        object_id: &str,
        context: &PlaceholderContext,
        request: &ScriptRequest,
        state: &ElicitationState,
        snapshot: &mut Option<Vec<EntityState>>,
    ) -> SlotOutcome {
        let key = placeholder_key(object_id, &context.id);
        let placeholder_id = Some(context.id.as_str());

        let candidates = match &context.terms {
            Some(terms) => {
                if snapshot.is_none() {
                    match self.snapshot().await {
                        Ok(states) => *snapshot = Some(states),
                        Err(failure) => {
                            return SlotOutcome::Failed(Box::new(
                                failure.with_placeholder(placeholder_id),
                            ));
                        }
                    }
                }
                let states = snapshot.as_deref().unwrap_or_default();
                rank_in_domains(states, &context.entity_domains, terms, context.limit)
            }
            None => Vec::new(),
        };

        if let Some(selected) = request.selections.get(&context.id) {
            let field = format!("selections.{}", context.id);
            if let Err(e) = check_selection_domain(&field, selected, &context.entity_domains) {
                return SlotOutcome::Failed(Box::new(
                    Failure::from(e).with_placeholder(placeholder_id),
                ));
            }
            return match self.verify_entity(selected, &candidates).await {
                Ok(entity) => {
                    let resolution = manual_resolution(&context.id, &entity, &candidates);
                    let candidate = candidates.iter().find(|c| c.entity_id == entity.entity_id);
                    self.remember(key, resolution.to_cache_entry(candidate));
                    SlotOutcome::Resolved(resolution)
                }
                Err(failure) => {
                    SlotOutcome::Failed(Box::new(failure.with_placeholder(placeholder_id)))
                }
            };
        }

        if candidates.is_empty() {
            if let Some(fallback) = &context.fallback_entity_id {
                return match self.verify_entity(fallback, &candidates).await {
                    Ok(entity) => {
                        tracing::info!(
                            placeholder = %context.id,
                            entity_id = %entity.entity_id,
                            "using fallback entity"
                        );
                        SlotOutcome::Resolved(Resolution {
                            slot: context.id.clone(),
                            entity_id: entity.entity_id.clone(),
                            friendly_name: Some(entity.friendly_name().to_string()),
                            score: None,
                            reason: DecisionReason::Fallback,
                        })
                    }
                    Err(failure) => {
                        SlotOutcome::Failed(Box::new(failure.with_placeholder(placeholder_id)))
                    }
                };
            }
        }

        let cached = self.cached(&key);
        let decision = SlotDecision {
            slot: &context.id,
            placeholder_id,
            candidates: &candidates,
            threshold: context.threshold,
            cached: cached.as_ref(),
            gap_points: self.settings.gap_points,
            max_rounds: self.settings.max_rounds,
        };
        let outcome = decision.decide(state);
        if let SlotOutcome::Resolved(resolution) = &outcome {
            let candidate = candidates.iter().find(|c| c.entity_id == resolution.entity_id);
            self.remember(key, resolution.to_cache_entry(candidate));
        }
        outcome
    }

    async fn execute(
        &self,
        domain: &str,
        service: &str,
        data: Value,
        entity_id: Option<&str>,
        resolutions: Vec<Resolution>,
    ) -> ActionEnvelope {
        match self.api.call_service(domain, service, data).await {
            Ok(result) => {
                tracing::info!(%domain, %service, "service call succeeded");
                ActionEnvelope::executed(result, resolutions)
            }
            Err(e) => {
                tracing::error!(%domain, %service, error = %e, "service call failed");
                let kind = match &e {
                    ClientError::Connect(_) | ClientError::Timeout(_) | ClientError::Transport(_) => {
                        FailureKind::Transport
                    }
                    _ => FailureKind::ServiceCallFailed,
                };
                let failure = Failure::new(kind, e.to_string()).with_action(domain, service, entity_id);
                ActionEnvelope::failed(failure, resolutions)
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `homeassistant.*` services act on any domain; everything else targets its own.
fn default_entity_domain(service_domain: &str) -> Option<String> {
    match service_domain {
        "homeassistant" => None,
        other => Some(other.to_string()),
    }
}

/// A caller-named entity must sit inside the domain filter the ranking used.
fn check_selection_domain(field: &str, entity_id: &str, domains: &[String]) -> Result<(), InputError> {
    if domains.is_empty() {
        return Ok(());
    }
    let entity_domain = entity_id.split_once('.').map(|(d, _)| d).unwrap_or_default();
    if domains.iter().any(|d| d == entity_domain) {
        Ok(())
    } else {
        Err(InputError::new(
            field,
            format!(
                "'{}' is outside the allowed domains: {}",
                entity_id,
                domains.join(", ")
            ),
        ))
    }
}

fn rank_in_domains(
    snapshot: &[EntityState],
    domains: &[String],
    terms: &[SearchTerm],
    limit: usize,
) -> Vec<ScoredCandidate> {
    let in_scope = snapshot
        .iter()
        .filter(|e| domains.is_empty() || domains.iter().any(|d| e.matches_domain(d)));
    rank_entities(in_scope, terms, limit)
}

fn manual_resolution(slot: &str, entity: &EntityState, candidates: &[ScoredCandidate]) -> Resolution {
    Resolution {
        slot: slot.to_string(),
        entity_id: entity.entity_id.clone(),
        friendly_name: Some(entity.friendly_name().to_string()),
        score: candidates
            .iter()
            .find(|c| c.entity_id == entity.entity_id)
            .map(|c| c.score),
        reason: DecisionReason::ManualSelection,
    }
}

fn transport_failure(error: ClientError) -> Failure {
    Failure::new(FailureKind::Transport, error.to_string())
}

fn cancelled(state: &ElicitationState, placeholder_id: Option<&str>, max_rounds: u32) -> ActionEnvelope {
    tracing::info!(rounds_used = state.rounds_used, "elicitation cancelled by caller");
    let failure = Failure::new(FailureKind::UserCancelled, "Cancelled by the caller")
        .with_placeholder(placeholder_id)
        .with_rounds(state.rounds_used, max_rounds);
    ActionEnvelope::failed(failure, Vec::new())
}

fn declined(state: &ElicitationState, placeholder_id: Option<&str>, max_rounds: u32) -> ActionEnvelope {
    let failure = Failure::new(
        FailureKind::UserDeclinedSelection,
        "Selection was not confirmed; nothing was executed",
    )
    .with_placeholder(placeholder_id)
    .with_rounds(state.rounds_used, max_rounds);
    ActionEnvelope::failed(failure, Vec::new())
}
