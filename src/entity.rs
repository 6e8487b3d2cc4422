use serde::{Deserialize, Serialize};

// =============================================================================
// Entity State Snapshot Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl EntityState {
    #[cfg(test)]
    pub fn new(entity_id: impl Into<String>, friendly_name: Option<&str>) -> Self {
        let mut attributes = serde_json::Map::new();
        if let Some(name) = friendly_name {
            attributes.insert("friendly_name".into(), name.into());
        }
        Self {
            entity_id: entity_id.into(),
            state: "unknown".into(),
            attributes,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let entity = serde_json::from_value::<EntityState>(value.clone()).ok()?;
        // Reject ids that are not `domain.object_id` shaped
        entity.entity_id.split_once('.')?;
        Some(entity)
    }

    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }

    pub fn object_id(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(_, object_id)| object_id)
            .unwrap_or(&self.entity_id)
    }

    pub fn friendly_name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(|v| v.as_str())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.entity_id)
    }

    pub fn matches_domain(&self, domain: &str) -> bool {
        self.domain() == domain
    }
}

/// Parse a `GET api/states` payload, skipping rows that are not entity states.
pub fn parse_states(data: &serde_json::Value) -> Vec<EntityState> {
    let Some(rows) = data.as_array() else {
        return Vec::new();
    };
    let states: Vec<EntityState> = rows.iter().filter_map(EntityState::from_json).collect();
    if states.len() != rows.len() {
        tracing::debug!(
            skipped = rows.len() - states.len(),
            "skipped malformed state rows"
        );
    }
    states
}
