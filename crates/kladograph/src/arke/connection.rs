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

use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::http::HttpArke;
use super::memstore::MemStore;
use super::models::{AdditiveUpdate, Entity, NewEntity, Relationship, SearchHit};

/// Opaque point in index time, captured when a worker arrives and used to
/// restrict fallback searches to peers indexed after it. The embedded store
/// compares visibility instants; the remote API is given an RFC3339 bound.
#[derive(Debug, Clone)]
pub enum IndexMarker {
    Local(tokio::time::Instant),
    Wall(String),
}

/// Store connection used by every worker. `Local` is the embedded in-memory
/// engine (tests, simulator); `Remote` talks to the Arke API over HTTP.
pub enum ArkeConnection {
    Local(Arc<MemStore>),
    Remote(HttpArke),
}

impl ArkeConnection {
    /// Connect from the environment: remote when `ARKE_API_BASE` is set,
    /// embedded otherwise. `KG_DISABLE_ARKE_ENV=1` forces the embedded store
    /// so tests cannot accidentally reach a real deployment.
    pub fn connect_from_env() -> Result<Self> {
        let allow_env = std::env::var("KG_DISABLE_ARKE_ENV").ok().as_deref() != Some("1");
        if allow_env && std::env::var("ARKE_API_BASE").is_ok() {
            return Ok(Self::Remote(HttpArke::from_env()?));
        }
        Ok(Self::Local(Arc::new(MemStore::new())))
    }

    /// The embedded store behind this connection, when there is one.
    pub fn local(&self) -> Option<&Arc<MemStore>> {
        match self {
            Self::Local(store) => Some(store),
            Self::Remote(_) => None,
        }
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        match self {
            Self::Local(store) => Ok(store.get(id)),
            Self::Remote(api) => api.get_entity(id).await,
        }
    }

    pub async fn get_entities(&self, ids: &[String]) -> Result<Vec<Entity>> {
        match self {
            Self::Local(store) => Ok(store.get_many(ids)),
            Self::Remote(api) => api.get_entities(ids).await,
        }
    }

    pub async fn create_entity(&self, new: NewEntity) -> Result<String> {
        match self {
            Self::Local(store) => Ok(store.create(new)),
            Self::Remote(api) => api.create_entity(&new).await,
        }
    }

    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        match self {
            Self::Local(store) => {
                store.delete(id);
                Ok(())
            }
            Self::Remote(api) => api.delete_entity(id).await,
        }
    }

    pub async fn apply_additive(&self, updates: &[AdditiveUpdate]) -> Result<()> {
        match self {
            Self::Local(store) => {
                store.apply_additive(updates);
                Ok(())
            }
            Self::Remote(api) => api.apply_additive(updates).await,
        }
    }

    pub async fn retract_relationship(&self, entity_id: &str, rel: &Relationship) -> Result<()> {
        match self {
            Self::Local(store) => {
                store.retract_relationship(entity_id, &rel.predicate, &rel.peer);
                Ok(())
            }
            Self::Remote(api) => api.retract_relationship(entity_id, rel).await,
        }
    }

    /// A marker for the current index position, to be passed back later as
    /// the `indexed_since` bound of a search.
    pub fn index_marker(&self) -> IndexMarker {
        match self {
            Self::Local(_) => IndexMarker::Local(tokio::time::Instant::now()),
            Self::Remote(_) => IndexMarker::Wall(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Layer-restricted semantic search. Callers exclude themselves from the
    /// result; the index may lag writes.
    pub async fn search(&self, query: &str, layer: i64, limit: Option<usize>) -> Result<Vec<SearchHit>> {
        self.search_indexed_since(query, layer, limit, None).await
    }

    /// Search variant restricted to peers whose index entry appeared at or
    /// after `since`. The marker must have been issued by this connection.
    pub async fn search_indexed_since(
        &self,
        query: &str,
        layer: i64,
        limit: Option<usize>,
        since: Option<&IndexMarker>,
    ) -> Result<Vec<SearchHit>> {
        match (self, since) {
            (Self::Local(store), None) => Ok(store.search(query, layer, limit)),
            (Self::Local(store), Some(IndexMarker::Local(t))) => {
                Ok(store.search_indexed_since(query, layer, limit, *t))
            }
            (Self::Remote(api), None) => api.search(query, layer, limit, None).await,
            (Self::Remote(api), Some(IndexMarker::Wall(ts))) => {
                api.search(query, layer, limit, Some(ts)).await
            }
            _ => Err(anyhow!("index marker was not issued by this connection")),
        }
    }

    /// All participant ids at a layer, ascending lexicographically.
    pub async fn entities_at_layer(&self, layer: i64) -> Result<Vec<String>> {
        match self {
            Self::Local(store) => Ok(store.entities_at_layer(layer)),
            Self::Remote(api) => api.entities_at_layer(layer).await,
        }
    }

    /// Members of a cluster: entities with an incoming `summarized_by` edge.
    pub async fn members_of(&self, cluster_id: &str) -> Result<Vec<String>> {
        match self {
            Self::Local(store) => Ok(store.members_of(cluster_id)),
            Self::Remote(api) => api.members_of(cluster_id).await,
        }
    }
}
