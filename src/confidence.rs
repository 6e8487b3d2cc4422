//! Confidence thresholds and the auto-select decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};

use crate::error::InputError;
use crate::matcher::ScoredCandidate;

const SCORE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfidenceSource {
    Default,
    Float,
    Int,
}

/// A confidence bar expressed both ways; `percent == ratio * 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThreshold {
    pub ratio: f64,
    pub percent: f64,
    pub source: ConfidenceSource,
}

impl ConfidenceThreshold {
    fn from_ratio(ratio: f64, source: ConfidenceSource) -> Self {
        Self {
            ratio,
            percent: ratio * 100.0,
            source,
        }
    }

    fn from_percent(percent: f64, source: ConfidenceSource) -> Self {
        Self {
            ratio: percent / 100.0,
            percent,
            source,
        }
    }

    /// Inclusive: a score exactly on the bar meets it.
    pub fn is_met_by(&self, score: f64) -> bool {
        score + SCORE_TOLERANCE >= self.percent
    }
}

/// Interpret a caller's confidence override.
///
/// Integers are percentages in [0, 100]. Floats in [0, 1] are ratios and
/// floats in (1, 100] are percentages. Anything else is rejected.
pub fn normalize_confidence(
    raw: Option<&Value>,
    default_ratio: f64,
) -> Result<ConfidenceThreshold, InputError> {
    let out_of_range = || {
        InputError::new(
            "min_confidence",
            "expected a ratio in [0, 1] or a percentage in [0, 100]",
        )
    };

    let number = match raw {
        None | Some(Value::Null) => {
            return Ok(ConfidenceThreshold::from_ratio(
                default_ratio,
                ConfidenceSource::Default,
            ));
        }
        Some(Value::Number(number)) => number,
        Some(_) => return Err(InputError::new("min_confidence", "must be a number")),
    };

    if let Some(int) = number.as_i64() {
        if !(0..=100).contains(&int) {
            return Err(out_of_range());
        }
        return Ok(ConfidenceThreshold::from_percent(
            int as f64,
            ConfidenceSource::Int,
        ));
    }

    let float = number.as_f64().ok_or_else(out_of_range)?;
    if (0.0..=1.0).contains(&float) {
        Ok(ConfidenceThreshold::from_ratio(float, ConfidenceSource::Float))
    } else if float > 1.0 && float <= 100.0 {
        Ok(ConfidenceThreshold::from_percent(float, ConfidenceSource::Float))
    } else {
        Err(out_of_range())
    }
}

// =============================================================================
// Obvious-Match Decision
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionReason {
    SingleCandidate,
    CachePreference,
    GapSatisfied,
    ManualSelection,
    Fallback,
    /// Settled in an earlier elicitation round of the same request.
    PriorRound,
}

/// Decide whether the ranking is decisive enough to act without asking.
///
/// Checked in order: the top candidate must meet the threshold; a lone
/// candidate wins; a cached entity that meets the threshold and ties the top
/// score wins; otherwise the top needs a `gap_points` raw-score lead.
pub fn is_obvious_match<'a>(
    candidates: &'a [ScoredCandidate],
    threshold: &ConfidenceThreshold,
    cached_entity_id: Option<&str>,
    gap_points: f64,
) -> Option<(&'a ScoredCandidate, DecisionReason)> {
    let top = candidates.first()?;
    if !threshold.is_met_by(top.score) {
        return None;
    }

    if candidates.len() == 1 {
        return Some((top, DecisionReason::SingleCandidate));
    }

    if let Some(cached_id) = cached_entity_id {
        let cached = candidates.iter().find(|c| c.entity_id == cached_id);
        if let Some(cached) = cached {
            if threshold.is_met_by(cached.score)
                && (top.score - cached.score).abs() <= SCORE_TOLERANCE
            {
                return Some((cached, DecisionReason::CachePreference));
            }
        }
    }

    let runner_up = &candidates[1];
    if top.raw_score - runner_up.raw_score + SCORE_TOLERANCE >= gap_points {
        return Some((top, DecisionReason::GapSatisfied));
    }

    None
}
