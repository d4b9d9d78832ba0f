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

//! Embedded in-memory store implementing the Arke server contract: additive
//! deep-merge updates, relationship-set union, and a semantic index whose
//! visibility lags writes by a configurable delay. Used by tests and the
//! simulator; the delay makes the eventual-consistency window reproducible
//! under paused time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::models::{deep_merge, AdditiveUpdate, Entity, NewEntity, SearchHit};

struct MemInner {
    entities: BTreeMap<String, Entity>,
    indexed_from: HashMap<String, Instant>,
    next_id: u64,
}

pub struct MemStore {
    inner: Mutex<MemInner>,
    index_delay: Duration,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_index_delay(Duration::ZERO)
    }

    /// A store whose search index only sees entities `delay` after creation.
    pub fn with_index_delay(delay: Duration) -> Self {
        Self {
            inner: Mutex::new(MemInner {
                entities: BTreeMap::new(),
                indexed_from: HashMap::new(),
                next_id: 0,
            }),
            index_delay: delay,
        }
    }

    pub fn create(&self, new: NewEntity) -> String {
        let mut inner = self.inner.lock().expect("memstore lock poisoned");
        inner.next_id += 1;
        let id = format!("{}:{:06}", new.entity_type, inner.next_id);
        let visible_at = Instant::now() + self.index_delay;
        inner.indexed_from.insert(id.clone(), visible_at);
        inner.entities.insert(
            id.clone(),
            Entity {
                id: id.clone(),
                entity_type: new.entity_type,
                properties: new.properties,
                relationships: new.relationships,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        let inner = self.inner.lock().expect("memstore lock poisoned");
        inner.entities.get(id).cloned()
    }

    pub fn get_many(&self, ids: &[String]) -> Vec<Entity> {
        let inner = self.inner.lock().expect("memstore lock poisoned");
        ids.iter()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect()
    }

    /// Apply a batch of additive updates atomically. Unknown entity ids are
    /// skipped; the server behaves the same way for deleted targets.
    pub fn apply_additive(&self, updates: &[AdditiveUpdate]) {
        let mut inner = self.inner.lock().expect("memstore lock poisoned");
        for u in updates {
            let Some(entity) = inner.entities.get_mut(&u.entity_id) else {
                continue;
            };
            if let Some(patch) = &u.properties {
                let mut bag = Value::Object(std::mem::take(&mut entity.properties));
                deep_merge(&mut bag, patch);
                if let Value::Object(map) = bag {
                    entity.properties = map;
                }
            }
            for rel in &u.relationships_add {
                let dup = entity
                    .relationships
                    .iter()
                    .any(|r| r.predicate == rel.predicate && r.peer == rel.peer);
                if !dup {
                    entity.relationships.push(rel.clone());
                }
            }
        }
    }

    /// Remove a single relationship edge. Part of the relate/unrelate CRUD
    /// surface, not of the additive-merge endpoint.
    pub fn retract_relationship(&self, entity_id: &str, predicate: &str, peer: &str) {
        let mut inner = self.inner.lock().expect("memstore lock poisoned");
        if let Some(entity) = inner.entities.get_mut(entity_id) {
            entity
                .relationships
                .retain(|r| !(r.predicate == predicate && r.peer == peer));
        }
    }

    /// Delete an entity and purge edges pointing at it.
    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.lock().expect("memstore lock poisoned");
        inner.entities.remove(id);
        inner.indexed_from.remove(id);
        for entity in inner.entities.values_mut() {
            entity.relationships.retain(|r| r.peer != id);
        }
    }

    /// Layer-scoped semantic search. Scores are token-overlap (Jaccard) over
    /// label + description text; entities are invisible until the index delay
    /// has elapsed since their creation.
    pub fn search(&self, query: &str, layer: i64, limit: Option<usize>) -> Vec<SearchHit> {
        self.search_inner(query, layer, limit, None)
    }

    /// Search restricted to entities whose index entry appeared at or after
    /// `since`, on top of the usual visibility rules.
    pub fn search_indexed_since(
        &self,
        query: &str,
        layer: i64,
        limit: Option<usize>,
        since: Instant,
    ) -> Vec<SearchHit> {
        self.search_inner(query, layer, limit, Some(since))
    }

    fn search_inner(
        &self,
        query: &str,
        layer: i64,
        limit: Option<usize>,
        since: Option<Instant>,
    ) -> Vec<SearchHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let inner = self.inner.lock().expect("memstore lock poisoned");
        let mut hits: Vec<SearchHit> = inner
            .entities
            .values()
            .filter(|e| e.layer() == Some(layer))
            .filter(|e| {
                inner
                    .indexed_from
                    .get(&e.id)
                    .map(|t| *t <= now && since.map_or(true, |s| *t >= s))
                    .unwrap_or(false)
            })
            .filter_map(|e| {
                let score = jaccard(&query_tokens, &tokenize(&e.search_text()));
                if score > 0.0 {
                    Some(SearchHit {
                        peer_id: e.id.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        if let Some(k) = limit {
            hits.truncate(k);
        }
        hits
    }

    /// Ids of all clustering participants at `layer`, ascending. Logs and job
    /// collections carry no layer property and are excluded implicitly.
    pub fn entities_at_layer(&self, layer: i64) -> Vec<String> {
        let inner = self.inner.lock().expect("memstore lock poisoned");
        inner
            .entities
            .values()
            .filter(|e| e.layer() == Some(layer))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Incoming `summarized_by` members of a cluster leader, ascending by id.
    pub fn members_of(&self, cluster_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("memstore lock poisoned");
        inner
            .entities
            .values()
            .filter(|e| e.summarized_by() == Some(cluster_id))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Snapshot of every entity, for validators and tests.
    pub fn all_entities(&self) -> Vec<Entity> {
        let inner = self.inner.lock().expect("memstore lock poisoned");
        inner.entities.values().cloned().collect()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arke::models::{predicates, Relationship, LAYER_PROP};
    use serde_json::json;

    fn participant(label: &str, layer: i64) -> NewEntity {
        NewEntity::new("person")
            .with_prop("label", json!(label))
            .with_prop(LAYER_PROP, json!(layer))
    }

    #[tokio::test]
    async fn additive_update_unions_relationships_without_duplicates() {
        let store = MemStore::new();
        let a = store.create(participant("Ahab", 0));
        let c = store.create(NewEntity::new("cluster_leader").with_prop(LAYER_PROP, json!(1)));
        let rel = Relationship::new(predicates::SUMMARIZED_BY, &c);
        store.apply_additive(&[AdditiveUpdate::relate(&a, vec![rel.clone()])]);
        store.apply_additive(&[AdditiveUpdate::relate(&a, vec![rel])]);
        let got = store.get(&a).unwrap();
        assert_eq!(
            got.peers(predicates::SUMMARIZED_BY).len(),
            1,
            "relationship union must dedupe"
        );
        assert_eq!(store.members_of(&c), vec![a]);
    }

    #[tokio::test]
    async fn property_patches_deep_merge() {
        let store = MemStore::new();
        let id = store.create(
            NewEntity::new("klados_log")
                .with_prop("status", json!("running"))
                .with_prop("log_data", json!({"entry": {"started_at": "t0"}})),
        );
        store.apply_additive(&[AdditiveUpdate::props(
            &id,
            json!({"status": "done", "log_data": {"entry": {"completed_at": "t1"}}}),
        )]);
        let got = store.get(&id).unwrap();
        assert_eq!(got.properties["status"], json!("done"));
        assert_eq!(got.properties["log_data"]["entry"]["started_at"], json!("t0"));
        assert_eq!(got.properties["log_data"]["entry"]["completed_at"], json!("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn search_respects_index_visibility_lag() {
        let store = MemStore::with_index_delay(Duration::from_secs(1));
        store.create(participant("Pequod whaling ship", 0));
        assert!(
            store.search("Pequod", 0, Some(5)).is_empty(),
            "entity must be invisible before the index delay elapses"
        );
        tokio::time::advance(Duration::from_millis(1100)).await;
        let hits = store.search("Pequod", 0, Some(5));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_indexed_since_skips_previously_indexed_peers() {
        let store = MemStore::with_index_delay(Duration::from_secs(1));
        let early = store.create(participant("Pequod the whaler", 0));
        tokio::time::advance(Duration::from_secs(2)).await;
        let marker = Instant::now();
        let late = store.create(participant("Pequod the three-master", 0));
        tokio::time::advance(Duration::from_secs(2)).await;

        let all = store.search("Pequod", 0, None);
        assert_eq!(all.len(), 2, "unrestricted search sees both entities");

        let fresh = store.search_indexed_since("Pequod", 0, None, marker);
        assert_eq!(fresh.len(), 1, "only the entity indexed after the marker");
        assert_eq!(fresh[0].peer_id, late);
        assert!(fresh.iter().all(|h| h.peer_id != early));
    }

    #[tokio::test]
    async fn search_is_layer_scoped_and_ranked() {
        let store = MemStore::new();
        let close = store.create(participant("Captain Ahab", 0));
        store.create(participant("Captain Ahab", 1));
        let far = store.create(participant("Ahab of Nantucket whaling fame", 0));
        store.create(participant("Starbuck", 0));
        let hits = store.search("Captain Ahab", 0, None);
        assert_eq!(hits.len(), 2, "only layer-0 overlapping entities match");
        assert_eq!(hits[0].peer_id, close);
        assert_eq!(hits[1].peer_id, far);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn delete_purges_incoming_edges() {
        let store = MemStore::new();
        let a = store.create(participant("Ahab", 0));
        let c = store.create(NewEntity::new("cluster_leader").with_prop(LAYER_PROP, json!(1)));
        store.apply_additive(&[AdditiveUpdate::relate(
            &a,
            vec![Relationship::new(predicates::SUMMARIZED_BY, &c)],
        )]);
        store.delete(&c);
        assert!(store.get(&c).is_none());
        assert!(store.get(&a).unwrap().summarized_by().is_none());
    }
}
