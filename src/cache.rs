use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::matcher::{MatchType, SearchTerm};

/// A previously confirmed entity for a placeholder or quick action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSelection {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
}

impl CachedSelection {
    #[cfg(test)]
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            score: None,
            match_type: None,
        }
    }
}

/// Strict LRU map from a selection key to the last confirmed entity.
///
/// Reads and writes both refresh recency; there is no time-based expiry.
#[derive(Debug, Clone)]
pub struct SelectionCache {
    entries: HashMap<String, CachedSelection>,
    lru: VecDeque<String>,
    capacity: usize,
}

impl SelectionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<CachedSelection> {
        let hit = self.entries.get(key).cloned()?;
        self.bump_lru(key);
        Some(hit)
    }

    pub fn put(&mut self, key: impl Into<String>, selection: CachedSelection) {
        let key = key.into();
        self.entries.insert(key.clone(), selection);
        self.bump_lru(&key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                tracing::debug!(key = %oldest, "evicted cached selection");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn bump_lru(&mut self, key: &str) {
        self.lru.retain(|k| k != key);
        self.lru.push_back(key.to_string());
    }
}

/// `domain::service::term-signature[::entity_domain]`
pub fn quick_action_key(
    domain: &str,
    service: &str,
    terms: &[SearchTerm],
    entity_domain: Option<&str>,
) -> String {
    let mut signature: Vec<String> = terms
        .iter()
        .map(|term| format!("{}@{:.3}", term.value, term.weight))
        .collect();
    signature.sort();

    let mut key = format!("{}::{}::{}", domain, service, signature.join("|"));
    if let Some(entity_domain) = entity_domain {
        key.push_str("::");
        key.push_str(entity_domain);
    }
    key
}

pub fn placeholder_key(script_id: &str, placeholder_id: &str) -> String {
    format!("{}::{}", script_id, placeholder_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_drops_least_recently_used() {
        let mut cache = SelectionCache::new(2);
        cache.put("a", CachedSelection::new("light.a"));
        cache.put("b", CachedSelection::new("light.b"));
        assert_eq!(cache.get("a").unwrap().entity_id, "light.a");

        cache.put("c", CachedSelection::new("light.c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn rewriting_a_key_refreshes_it() {
        let mut cache = SelectionCache::new(2);
        cache.put("a", CachedSelection::new("light.a"));
        cache.put("b", CachedSelection::new("light.b"));
        cache.put("a", CachedSelection::new("light.a2"));
        cache.put("c", CachedSelection::new("light.c"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().entity_id, "light.a2");
    }

    #[test]
    fn quick_action_key_ignores_term_order() {
        let a = vec![
            SearchTerm { value: "kitchen".into(), weight: 0.5 },
            SearchTerm { value: "light".into(), weight: 0.5 },
        ];
        let b: Vec<SearchTerm> = a.iter().rev().cloned().collect();
        assert_eq!(
            quick_action_key("light", "turn_on", &a, Some("light")),
            quick_action_key("light", "turn_on", &b, Some("light"))
        );
        assert_eq!(
            quick_action_key("light", "turn_on", &a, None),
            "light::turn_on::kitchen@0.500|light@0.500"
        );
    }
}
