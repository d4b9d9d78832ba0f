// Copyright 2025 Kladograph Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relationship predicates used by the coordinator.
pub mod predicates {
    pub const SENT_TO: &str = "sent_to";
    pub const FIRST_LOG: &str = "first_log";
    pub const RECEIVED_FROM: &str = "received_from";
    pub const SUMMARIZED_BY: &str = "summarized_by";
    pub const EXTRACTED_FROM: &str = "extracted_from";
}

/// Entity types the coordinator creates or inspects. Extracted entity types
/// (person, city, ...) are open-ended and never enumerated here.
pub mod entity_types {
    pub const TEXT_CHUNK: &str = "text_chunk";
    pub const CLUSTER_LEADER: &str = "cluster_leader";
    pub const SCATTER_JOB: &str = "scatter_job";
    pub const KLADOS_LOG: &str = "klados_log";
}

/// Property key holding the hierarchy depth. Directly-extracted entities are
/// layer 0; a cluster leader sits one layer above its members.
pub const LAYER_PROP: &str = "_kg_layer";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub predicate: String,
    pub peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_type: Option<String>,
}

impl Relationship {
    pub fn new(predicate: &str, peer: &str) -> Self {
        Self {
            predicate: predicate.to_string(),
            peer: peer.to_string(),
            peer_type: None,
        }
    }

    pub fn typed(predicate: &str, peer: &str, peer_type: &str) -> Self {
        Self {
            predicate: predicate.to_string(),
            peer: peer.to_string(),
            peer_type: Some(peer_type.to_string()),
        }
    }
}

/// Universal store node: opaque id, type tag, open property bag and an
/// unordered relationship set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Entity {
    /// Hierarchy depth, when the entity participates in clustering.
    pub fn layer(&self) -> Option<i64> {
        self.properties.get(LAYER_PROP).and_then(|v| v.as_i64())
    }

    pub fn label(&self) -> &str {
        self.properties
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn description(&self) -> &str {
        self.properties
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Text used for semantic comparison: label plus description.
    pub fn search_text(&self) -> String {
        let label = self.label();
        let desc = self.description();
        if desc.is_empty() {
            label.to_string()
        } else {
            format!("{} {}", label, desc)
        }
    }

    /// The cluster this entity belongs to, if any. Membership is a single
    /// outgoing `summarized_by` edge.
    pub fn summarized_by(&self) -> Option<&str> {
        self.relationships
            .iter()
            .find(|r| r.predicate == predicates::SUMMARIZED_BY)
            .map(|r| r.peer.as_str())
    }

    /// All peers reachable over `predicate`, in insertion order.
    pub fn peers(&self, predicate: &str) -> Vec<&str> {
        self.relationships
            .iter()
            .filter(|r| r.predicate == predicate)
            .map(|r| r.peer.as_str())
            .collect()
    }
}

/// Creation request: the store assigns the id.
#[derive(Debug, Clone, Serialize)]
pub struct NewEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
}

impl NewEntity {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            properties: Map::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn with_relationship(mut self, rel: Relationship) -> Self {
        self.relationships.push(rel);
        self
    }
}

/// One element of the additive-update payload `{updates: [...]}`. The server
/// contract: `properties` deep-merges into the existing bag (maps merge
/// recursively, everything else overwrites), `relationships_add` unions into
/// the relationship set, and concurrent writers are linearised server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditiveUpdate {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships_add: Vec<Relationship>,
}

impl AdditiveUpdate {
    pub fn props(entity_id: &str, properties: Value) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            properties: Some(properties),
            relationships_add: Vec::new(),
        }
    }

    pub fn relate(entity_id: &str, rels: Vec<Relationship>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            properties: None,
            relationships_add: rels,
        }
    }
}

/// A semantic-search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub peer_id: String,
    pub score: f64,
}

/// Deep-merge `patch` into `target`: objects merge key-by-key recursively,
/// any other value (including arrays) replaces the previous one.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                match t.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        t.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}
