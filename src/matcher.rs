//! Entity scoring and weighted multi-term ranking.
//!
//! Each search term is scored against every entity with [`score_entity`]; the
//! per-term scores are blended by normalized term weight into a single
//! `raw_score`, and the clamped `score` drives ranking and confidence
//! decisions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};

use crate::config::ResolverSettings;
use crate::entity::EntityState;
use crate::error::InputError;
use crate::similarity::{partial_ratio, ratio, token_sort_ratio};

const EXACT_ID_BONUS: f64 = 100.0;
const EXACT_NAME_BONUS: f64 = 95.0;
const EXACT_DOMAIN_BONUS: f64 = 90.0;
const ID_CONTAINS_BONUS: f64 = 85.0;
const NAME_CONTAINS_BONUS: f64 = 80.0;

const ID_WEIGHT: f64 = 0.7;
const NAME_WEIGHT: f64 = 0.8;
const DOMAIN_WEIGHT: f64 = 0.6;

const WEIGHT_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Search Terms
// =============================================================================

/// A caller-supplied term before weight normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Plain(String),
    Weighted(String, f64),
}

impl Term {
    pub fn value(&self) -> &str {
        match self {
            Term::Plain(value) | Term::Weighted(value, _) => value,
        }
    }

    /// Accepts a string, a list of strings and/or `{value, weight}` records,
    /// a single record, or a `{term: weight}` mapping.
    pub fn parse_many(raw: &Value) -> Result<Vec<Term>, InputError> {
        let terms = match raw {
            Value::String(value) => vec![Term::Plain(value.clone())],
            Value::Array(items) => items
                .iter()
                .map(Term::parse_one)
                .collect::<Result<Vec<_>, _>>()?,
            Value::Object(map) if map.contains_key("value") => vec![Term::parse_one(raw)?],
            Value::Object(map) => map
                .iter()
                .map(|(value, weight)| match weight {
                    Value::Null => Ok(Term::Plain(value.clone())),
                    other => Ok(Term::Weighted(value.clone(), parse_weight(other)?)),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(InputError::new(
                    "search_terms",
                    "expected a string, a list, or a mapping of term to weight",
                ));
            }
        };

        if terms.is_empty() {
            return Err(InputError::new("search_terms", "at least one term is required"));
        }
        for term in &terms {
            if term.value().trim().is_empty() {
                return Err(InputError::new("search_terms", "terms must not be empty"));
            }
        }
        Ok(terms)
    }

    fn parse_one(raw: &Value) -> Result<Term, InputError> {
        match raw {
            Value::String(value) => Ok(Term::Plain(value.clone())),
            Value::Object(map) => {
                let value = map.get("value").and_then(Value::as_str).ok_or_else(|| {
                    InputError::new("search_terms", "each record needs a string 'value'")
                })?;
                match map.get("weight") {
                    None | Some(Value::Null) => Ok(Term::Plain(value.to_string())),
                    Some(weight) => Ok(Term::Weighted(value.to_string(), parse_weight(weight)?)),
                }
            }
            _ => Err(InputError::new(
                "search_terms",
                "list items must be strings or {value, weight} records",
            )),
        }
    }
}

fn parse_weight(raw: &Value) -> Result<f64, InputError> {
    let weight = raw
        .as_f64()
        .ok_or_else(|| InputError::new("search_terms", "weight must be a number"))?;
    if !weight.is_finite() || weight < 0.0 {
        return Err(InputError::new("search_terms", "weight must be non-negative"));
    }
    Ok(weight)
}

/// A normalized, lower-cased term whose weight is its share of the blend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTerm {
    pub value: String,
    pub weight: f64,
}

/// Turn raw terms into a weight distribution summing to 1.0.
///
/// Implicit terms split whatever mass the explicit weights leave over; a
/// final pass rescales everything to absorb drift.
pub fn normalize_terms(terms: &[Term]) -> Result<Vec<SearchTerm>, InputError> {
    if terms.is_empty() {
        return Err(InputError::new("search_terms", "at least one term is required"));
    }

    let explicit_total: f64 = terms
        .iter()
        .filter_map(|term| match term {
            Term::Weighted(_, weight) => Some(*weight),
            Term::Plain(_) => None,
        })
        .sum();
    let implicit_count = terms
        .iter()
        .filter(|term| matches!(term, Term::Plain(_)))
        .count();
    let any_explicit = implicit_count < terms.len();

    let implicit_weight = if !any_explicit {
        1.0 / terms.len() as f64
    } else if implicit_count > 0 {
        (1.0 - explicit_total).max(0.0) / implicit_count as f64
    } else {
        0.0
    };

    let mut normalized: Vec<SearchTerm> = terms
        .iter()
        .map(|term| {
            let weight = match term {
                Term::Weighted(_, weight) => *weight,
                Term::Plain(_) => implicit_weight,
            };
            let value = term.value().trim().to_lowercase();
            if value.is_empty() {
                return Err(InputError::new("search_terms", "terms must not be empty"));
            }
            Ok(SearchTerm { value, weight })
        })
        .collect::<Result<_, _>>()?;

    let total: f64 = normalized.iter().map(|term| term.weight).sum();
    if total <= 0.0 {
        // Every weight was zero; treat them as equally important
        let uniform = 1.0 / normalized.len() as f64;
        normalized.iter_mut().for_each(|term| term.weight = uniform);
    } else if (total - 1.0).abs() > f64::EPSILON {
        normalized.iter_mut().for_each(|term| term.weight /= total);
    }

    debug_assert!(
        (normalized.iter().map(|term| term.weight).sum::<f64>() - 1.0).abs() <= WEIGHT_TOLERANCE
    );
    Ok(normalized)
}

/// Parse and normalize in one step.
pub fn search_terms_from_value(raw: &Value) -> Result<Vec<SearchTerm>, InputError> {
    normalize_terms(&Term::parse_many(raw)?)
}

/// Clamp a caller-supplied limit to the configured default and hard cap.
pub fn resolve_limit(requested: Option<usize>, settings: &ResolverSettings) -> Result<usize, InputError> {
    match requested {
        None => Ok(settings.default_limit.min(settings.max_limit)),
        Some(0) => Err(InputError::new("limit", "limit must be positive")),
        Some(limit) => Ok(limit.min(settings.max_limit)),
    }
}

// =============================================================================
// Entity Scorer
// =============================================================================

/// Strongest signal that contributed to a score, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchType {
    ExactId,
    ExactName,
    ExactDomain,
    IdContains,
    NameContains,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityScore {
    pub score: f64,
    pub match_type: MatchType,
}

/// Score one lower-cased query against one entity.
///
/// Categorical bonuses are added to the best weighted similarity, so an exact
/// match always outranks a fuzzy-only one and the sum can exceed 100.
pub fn score_entity(entity: &EntityState, query: &str) -> EntityScore {
    let entity_id = entity.entity_id.to_lowercase();
    let object_id = entity.object_id().to_lowercase();
    let friendly_name = entity.friendly_name().to_lowercase();
    let domain = entity.domain().to_lowercase();

    let mut score = 0.0;
    let mut match_type = MatchType::Fuzzy;

    if query == entity_id || query == object_id || query == object_id.replace('_', " ") {
        score += EXACT_ID_BONUS;
        match_type = MatchType::ExactId;
    } else if query == friendly_name {
        score += EXACT_NAME_BONUS;
        match_type = MatchType::ExactName;
    } else if query == domain {
        score += EXACT_DOMAIN_BONUS;
        match_type = MatchType::ExactDomain;
    }

    if entity_id.contains(query) {
        score += ID_CONTAINS_BONUS;
        match_type = match_type.min(MatchType::IdContains);
    }
    if friendly_name.contains(query) {
        score += NAME_CONTAINS_BONUS;
        match_type = match_type.min(MatchType::NameContains);
    }

    let id_similarity = ratio(query, &entity_id)
        .max(partial_ratio(query, &entity_id))
        .max(token_sort_ratio(query, &entity_id));
    let name_similarity = ratio(query, &friendly_name)
        .max(partial_ratio(query, &friendly_name))
        .max(token_sort_ratio(query, &friendly_name));
    let domain_similarity = ratio(query, &domain);

    score += (id_similarity * ID_WEIGHT)
        .max(name_similarity * NAME_WEIGHT)
        .max(domain_similarity * DOMAIN_WEIGHT);

    EntityScore { score, match_type }
}

// =============================================================================
// Weighted Multi-Term Matcher
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermContribution {
    pub term: String,
    pub weight: f64,
    pub raw_score: f64,
    pub contribution: f64,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub entity_id: String,
    pub friendly_name: String,
    pub domain: String,
    /// Unclamped weighted sum, kept for tie-breaks and gap decisions.
    pub raw_score: f64,
    /// `raw_score` clamped to [0, 100].
    pub score: f64,
    pub match_type: MatchType,
    pub term_breakdown: Vec<TermContribution>,
}

impl ScoredCandidate {
    pub fn score_entity(entity: &EntityState, terms: &[SearchTerm]) -> Self {
        let term_breakdown: Vec<TermContribution> = terms
            .iter()
            .map(|term| {
                let EntityScore { score, match_type } = score_entity(entity, &term.value);
                TermContribution {
                    term: term.value.clone(),
                    weight: term.weight,
                    raw_score: score,
                    contribution: score * term.weight,
                    match_type,
                }
            })
            .collect();

        let raw_score: f64 = term_breakdown.iter().map(|t| t.contribution).sum();
        // Terms that carry no weight say nothing about how the entity matched
        let match_type = term_breakdown
            .iter()
            .filter(|t| t.contribution > 0.0)
            .map(|t| t.match_type)
            .min()
            .unwrap_or(MatchType::Fuzzy);

        Self {
            entity_id: entity.entity_id.clone(),
            friendly_name: entity.friendly_name().to_string(),
            domain: entity.domain().to_string(),
            raw_score,
            score: raw_score.clamp(0.0, 100.0),
            match_type,
            term_breakdown,
        }
    }
}

/// Highest score first, then higher raw score, then entity id.
pub fn compare_candidates(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.raw_score.total_cmp(&a.raw_score))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Score every entity in the snapshot and keep the best `limit`.
pub fn rank_entities<'a, I>(entities: I, terms: &[SearchTerm], limit: usize) -> Vec<ScoredCandidate>
where
    I: IntoIterator<Item = &'a EntityState>,
{
    let mut candidates: Vec<ScoredCandidate> = entities
        .into_iter()
        .map(|entity| ScoredCandidate::score_entity(entity, terms))
        .filter(|candidate| candidate.raw_score > 0.0)
        .collect();

    candidates.sort_by(compare_candidates);
    candidates.truncate(limit);
    candidates
}
