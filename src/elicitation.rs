//! Bounded clarification round-trips.
//!
//! A resolution attempt either resolves, asks the caller to clarify, or fails.
//! Asking is not terminal: the caller echoes back [`ElicitationState`] with a
//! selection, more terms, or a cancellation. Once `rounds_used` reaches the
//! configured maximum an unresolved slot fails instead of asking again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display};

use crate::cache::CachedSelection;
use crate::confidence::{ConfidenceThreshold, DecisionReason, is_obvious_match};
use crate::error::InputError;
use crate::matcher::ScoredCandidate;

/// State the caller threads back on every retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElicitationState {
    #[serde(default)]
    pub rounds_used: u32,
    /// Placeholders already settled in earlier rounds of the same request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_entities: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_placeholder: Option<String>,
}

impl ElicitationState {
    pub fn from_value(raw: Option<&Value>) -> Result<Self, InputError> {
        match raw {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| InputError::new("elicitation_state", e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    NeedsElicitation,
    Failed,
}

/// How one slot (a placeholder or a quick action's target) was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub slot: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub reason: DecisionReason,
}

impl Resolution {
    pub fn from_candidate(slot: &str, candidate: &ScoredCandidate, reason: DecisionReason) -> Self {
        Self {
            slot: slot.to_string(),
            entity_id: candidate.entity_id.clone(),
            friendly_name: Some(candidate.friendly_name.clone()),
            score: Some(candidate.score),
            reason,
        }
    }

    pub fn to_cache_entry(&self, candidate: Option<&ScoredCandidate>) -> CachedSelection {
        CachedSelection {
            entity_id: self.entity_id.clone(),
            score: self.score,
            match_type: candidate.map(|c| c.match_type),
        }
    }
}

// =============================================================================
// Elicitation Payload
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ElicitationReason {
    NoCandidates,
    BelowThreshold,
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AllowedResponse {
    SelectEntity {
        entity_ids: Vec<String>,
        requires_confirm: bool,
    },
    AddSearchTerms {
        example: Value,
    },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_id: Option<String>,
    pub reason: ElicitationReason,
    pub message: String,
    pub candidates: Vec<ScoredCandidate>,
    pub threshold: ConfidenceThreshold,
    pub gap_points: f64,
    pub rounds_used: u32,
    pub rounds_remaining: u32,
    pub allowed_responses: Vec<AllowedResponse>,
    /// Echo this back as `elicitation_state` on the next call.
    pub elicitation_state: ElicitationState,
}

// =============================================================================
// Failures
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    RoundsExhausted,
    UserDeclinedSelection,
    UserCancelled,
    EntityNotFound,
    Transport,
    ServiceCallFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<ScoredCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<ConfidenceThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            placeholder_id: None,
            candidates: Vec::new(),
            threshold: None,
            rounds_used: None,
            rounds_remaining: None,
            domain: None,
            service: None,
            entity_id: None,
        }
    }

    pub fn with_placeholder(mut self, placeholder_id: Option<&str>) -> Self {
        self.placeholder_id = placeholder_id.map(str::to_string);
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<ScoredCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_rounds(mut self, rounds_used: u32, max_rounds: u32) -> Self {
        self.rounds_used = Some(rounds_used);
        self.rounds_remaining = Some(max_rounds.saturating_sub(rounds_used));
        self
    }

    pub fn with_action(mut self, domain: &str, service: &str, entity_id: Option<&str>) -> Self {
        self.domain = Some(domain.to_string());
        self.service = Some(service.to_string());
        self.entity_id = entity_id.map(str::to_string);
        self
    }
}

impl From<InputError> for Failure {
    fn from(error: InputError) -> Self {
        let mut failure = Failure::new(FailureKind::InvalidInput, error.message);
        failure.field = Some(error.field);
        failure
    }
}

// =============================================================================
// Decision Step
// =============================================================================

pub enum SlotOutcome {
    Resolved(Resolution),
    NeedsElicitation(Box<ElicitationRequest>),
    Failed(Box<Failure>),
}

/// Everything needed to settle one slot from a fresh ranking.
pub struct SlotDecision<'a> {
    pub slot: &'a str,
    pub placeholder_id: Option<&'a str>,
    pub candidates: &'a [ScoredCandidate],
    pub threshold: ConfidenceThreshold,
    pub cached: Option<&'a CachedSelection>,
    pub gap_points: f64,
    pub max_rounds: u32,
}

impl SlotDecision<'_> {
    /// Resolve if the ranking is decisive, otherwise ask or, with no rounds
    /// left, fail. Never falls back to the best unconfident candidate.
    pub fn decide(&self, state: &ElicitationState) -> SlotOutcome {
        let cached_id = self.cached.map(|c| c.entity_id.as_str());
        if let Some((candidate, reason)) =
            is_obvious_match(self.candidates, &self.threshold, cached_id, self.gap_points)
        {
            tracing::debug!(
                slot = self.slot,
                entity_id = %candidate.entity_id,
                score = candidate.score,
                %reason,
                "resolved without elicitation"
            );
            return SlotOutcome::Resolved(Resolution::from_candidate(self.slot, candidate, reason));
        }

        if state.rounds_used >= self.max_rounds {
            tracing::warn!(
                slot = self.slot,
                rounds_used = state.rounds_used,
                "elicitation rounds exhausted"
            );
            let mut failure = Failure::new(
                FailureKind::RoundsExhausted,
                format!(
                    "Exceeded maximum elicitation rounds ({}) without a confident match for '{}'",
                    self.max_rounds, self.slot
                ),
            )
            .with_placeholder(self.placeholder_id)
            .with_candidates(self.candidates.to_vec())
            .with_rounds(state.rounds_used, self.max_rounds);
            failure.threshold = Some(self.threshold);
            return SlotOutcome::Failed(Box::new(failure));
        }

        let mut next_state = state.clone();
        next_state.rounds_used += 1;
        next_state.pending_placeholder = self.placeholder_id.map(str::to_string);

        SlotOutcome::NeedsElicitation(Box::new(self.request(next_state)))
    }

    fn request(&self, next_state: ElicitationState) -> ElicitationRequest {
        let reason = match self.candidates.first() {
            None => ElicitationReason::NoCandidates,
            Some(top) if !self.threshold.is_met_by(top.score) => ElicitationReason::BelowThreshold,
            Some(_) => ElicitationReason::Ambiguous,
        };
        let message = match reason {
            ElicitationReason::NoCandidates => {
                format!("No entities matched '{}'. Add or change search terms.", self.slot)
            }
            ElicitationReason::BelowThreshold => format!(
                "No candidate for '{}' reached {:.0}% confidence. Select one or refine the search terms.",
                self.slot, self.threshold.percent
            ),
            ElicitationReason::Ambiguous => format!(
                "Several candidates for '{}' are too close to call. Select one or refine the search terms.",
                self.slot
            ),
        };

        let mut allowed_responses = Vec::new();
        if !self.candidates.is_empty() {
            allowed_responses.push(AllowedResponse::SelectEntity {
                entity_ids: self.candidates.iter().map(|c| c.entity_id.clone()).collect(),
                requires_confirm: true,
            });
        }
        allowed_responses.push(AllowedResponse::AddSearchTerms {
            example: json!([{"value": "kitchen", "weight": 0.6}, {"value": "ceiling", "weight": 0.4}]),
        });
        allowed_responses.push(AllowedResponse::Cancel);

        ElicitationRequest {
            placeholder_id: self.placeholder_id.map(str::to_string),
            reason,
            message,
            candidates: self.candidates.to_vec(),
            threshold: self.threshold,
            gap_points: self.gap_points,
            rounds_used: next_state.rounds_used,
            rounds_remaining: self.max_rounds.saturating_sub(next_state.rounds_used),
            allowed_responses,
            elicitation_state: next_state,
        }
    }
}

// =============================================================================
// Response Envelope
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub success: bool,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_entities: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

impl ActionEnvelope {
    fn base(status: ResolutionStatus, resolutions: Vec<Resolution>) -> Self {
        let resolved_entities = resolutions
            .iter()
            .map(|r| (r.slot.clone(), r.entity_id.clone()))
            .collect();
        Self {
            success: status == ResolutionStatus::Resolved,
            status,
            result: None,
            resolved_entities,
            resolutions,
            elicitation: None,
            error: None,
            executed_at: None,
        }
    }

    pub fn executed(result: Value, resolutions: Vec<Resolution>) -> Self {
        let mut envelope = Self::base(ResolutionStatus::Resolved, resolutions);
        envelope.result = Some(result);
        envelope.executed_at = Some(chrono::Utc::now().to_rfc3339());
        envelope
    }

    pub fn needs_elicitation(request: ElicitationRequest, resolutions: Vec<Resolution>) -> Self {
        let mut envelope = Self::base(ResolutionStatus::NeedsElicitation, resolutions);
        envelope.elicitation = Some(request);
        envelope
    }

    pub fn failed(failure: Failure, resolutions: Vec<Resolution>) -> Self {
        let mut envelope = Self::base(ResolutionStatus::Failed, resolutions);
        envelope.error = Some(failure);
        envelope
    }
}

impl From<InputError> for ActionEnvelope {
    fn from(error: InputError) -> Self {
        ActionEnvelope::failed(error.into(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::normalize_confidence;
    use crate::matcher::MatchType;

    fn candidate(entity_id: &str, raw_score: f64) -> ScoredCandidate {
        ScoredCandidate {
            entity_id: entity_id.into(),
            friendly_name: entity_id.into(),
            domain: "light".into(),
            raw_score,
            score: raw_score.min(100.0),
            match_type: MatchType::Fuzzy,
            term_breakdown: Vec::new(),
        }
    }

    fn decision<'a>(candidates: &'a [ScoredCandidate]) -> SlotDecision<'a> {
        SlotDecision {
            slot: "target",
            placeholder_id: Some("target"),
            candidates,
            threshold: normalize_confidence(Some(&json!(60)), 0.75).unwrap(),
            cached: None,
            gap_points: 10.0,
            max_rounds: 2,
        }
    }

    #[test]
    fn ambiguous_ranking_asks_and_increments_rounds() {
        let candidates = [candidate("light.a", 61.0), candidate("light.b", 60.0)];
        let SlotOutcome::NeedsElicitation(request) =
            decision(&candidates).decide(&ElicitationState::default())
        else {
            panic!("expected elicitation");
        };
        assert_eq!(request.reason, ElicitationReason::Ambiguous);
        assert_eq!(request.rounds_used, 1);
        assert_eq!(request.rounds_remaining, 1);
        assert_eq!(request.elicitation_state.rounds_used, 1);
        assert_eq!(
            request.elicitation_state.pending_placeholder.as_deref(),
            Some("target")
        );
        assert!(matches!(
            &request.allowed_responses[0],
            AllowedResponse::SelectEntity { entity_ids, .. } if entity_ids.len() == 2
        ));
        assert_eq!(request.allowed_responses.last(), Some(&AllowedResponse::Cancel));
    }

    #[test]
    fn exhausted_rounds_fail_instead_of_guessing() {
        let candidates = [candidate("light.a", 61.0), candidate("light.b", 60.0)];
        let mut state = ElicitationState::default();

        for expected_round in 1..=2 {
            match decision(&candidates).decide(&state) {
                SlotOutcome::NeedsElicitation(request) => {
                    assert_eq!(request.rounds_used, expected_round);
                    state = request.elicitation_state;
                }
                _ => panic!("expected elicitation in round {expected_round}"),
            }
        }

        let SlotOutcome::Failed(failure) = decision(&candidates).decide(&state) else {
            panic!("expected terminal failure");
        };
        assert_eq!(failure.kind, FailureKind::RoundsExhausted);
        assert_eq!(failure.rounds_remaining, Some(0));
        assert_eq!(failure.candidates.len(), 2);
        assert!(failure.threshold.is_some());
    }

    #[test]
    fn decisive_ranking_resolves_even_on_last_round() {
        let candidates = [candidate("light.a", 71.0), candidate("light.b", 60.0)];
        let state = ElicitationState {
            rounds_used: 2,
            ..Default::default()
        };
        let SlotOutcome::Resolved(resolution) = decision(&candidates).decide(&state) else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.entity_id, "light.a");
        assert_eq!(resolution.reason, DecisionReason::GapSatisfied);
    }

    #[test]
    fn empty_ranking_reports_no_candidates() {
        let SlotOutcome::NeedsElicitation(request) =
            decision(&[]).decide(&ElicitationState::default())
        else {
            panic!("expected elicitation");
        };
        assert_eq!(request.reason, ElicitationReason::NoCandidates);
        assert!(!matches!(
            request.allowed_responses[0],
            AllowedResponse::SelectEntity { .. }
        ));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = ElicitationState {
            rounds_used: 1,
            ..Default::default()
        };
        state
            .resolved_entities
            .insert("first".into(), "light.a".into());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(ElicitationState::from_value(Some(&value)).unwrap(), state);
        assert!(ElicitationState::from_value(Some(&json!({"rounds_used": "x"}))).is_err());
    }

    #[test]
    fn envelope_lists_resolved_entities() {
        let resolution = Resolution {
            slot: "first".into(),
            entity_id: "light.a".into(),
            friendly_name: None,
            score: Some(100.0),
            reason: DecisionReason::SingleCandidate,
        };
        let envelope = ActionEnvelope::failed(
            Failure::new(FailureKind::UserCancelled, "cancelled"),
            vec![resolution],
        );
        assert!(!envelope.success);
        assert_eq!(envelope.resolved_entities["first"], "light.a");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["kind"], "user_cancelled");
    }
}
