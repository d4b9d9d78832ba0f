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

//! HTTP client for the remote Arke entity store. Transient transport errors
//! (5xx, timeouts) are retried here with exponential backoff up to a fixed
//! cap and never surfaced below it; 4xx responses fail immediately.

use anyhow::{anyhow, Context, Result};
use log::warn;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::models::{AdditiveUpdate, Entity, NewEntity, Relationship, SearchHit};

const MAX_TRANSIENT_RETRIES: usize = 5;
const BACKOFF_BASE_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct HttpArke {
    client: Client,
    base: String,
    user_key: String,
    network: String,
}

impl HttpArke {
    pub fn new(base: &str, user_key: &str, network: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building arke http client")?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            user_key: user_key.to_string(),
            network: network.to_string(),
        })
    }

    /// Construct from `ARKE_API_BASE`, `ARKE_USER_KEY` and `ARKE_NETWORK`.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("ARKE_API_BASE").context("ARKE_API_BASE not set")?;
        let key = std::env::var("ARKE_USER_KEY").context("ARKE_USER_KEY not set")?;
        let network = std::env::var("ARKE_NETWORK").unwrap_or_else(|_| "test".to_string());
        if network != "test" && network != "main" {
            return Err(anyhow!(
                "ARKE_NETWORK must be 'test' or 'main', got '{}'",
                network
            ));
        }
        Self::new(&base, &key, &network)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let mut attempt = 0usize;
        loop {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.user_key)
                .header("x-arke-network", &self.network);
            if let Some(b) = body {
                req = req.json(b);
            }
            let outcome = req.send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if status == StatusCode::NO_CONTENT || status == StatusCode::ACCEPTED {
                            return Ok(Value::Null);
                        }
                        return resp.json::<Value>().await.context("decoding arke response");
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(Value::Null);
                    }
                    if status.is_server_error() && attempt < MAX_TRANSIENT_RETRIES {
                        warn!(
                            "arke {} {} returned {}, retrying (attempt {})",
                            method, path, status, attempt + 1
                        );
                    } else {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(anyhow!("arke {} {} failed: {} {}", method, path, status, text));
                    }
                }
                Err(e) if attempt < MAX_TRANSIENT_RETRIES => {
                    warn!(
                        "arke {} {} transport error: {}, retrying (attempt {})",
                        method,
                        path,
                        e,
                        attempt + 1
                    );
                }
                Err(e) => {
                    return Err(anyhow!(e)).context(format!("arke {} {} exhausted retries", method, path));
                }
            }
            let backoff = Duration::from_millis(BACKOFF_BASE_MS << attempt.min(6));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let v = self.send(Method::GET, &format!("/entities/{}", id), None).await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(v).context("decoding entity")?))
    }

    pub async fn get_entities(&self, ids: &[String]) -> Result<Vec<Entity>> {
        #[derive(Deserialize)]
        struct Batch {
            entities: Vec<Entity>,
        }
        let v = self
            .send(Method::POST, "/entities/batch-get", Some(&json!({ "ids": ids })))
            .await?;
        let batch: Batch = serde_json::from_value(v).context("decoding batch-get response")?;
        Ok(batch.entities)
    }

    pub async fn create_entity(&self, new: &NewEntity) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let v = self
            .send(Method::POST, "/entities", Some(&serde_json::to_value(new)?))
            .await?;
        let created: Created = serde_json::from_value(v).context("decoding create response")?;
        Ok(created.id)
    }

    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        self.send(Method::DELETE, &format!("/entities/{}", id), None)
            .await?;
        Ok(())
    }

    /// Single additive-merge request; the server responds 202 and linearises
    /// concurrent writers.
    pub async fn apply_additive(&self, updates: &[AdditiveUpdate]) -> Result<()> {
        self.send(
            Method::POST,
            "/entities/additive",
            Some(&json!({ "updates": updates })),
        )
        .await?;
        Ok(())
    }

    pub async fn retract_relationship(&self, entity_id: &str, rel: &Relationship) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/entities/{}/relationships", entity_id),
            Some(&json!({ "predicate": rel.predicate, "peer": rel.peer })),
        )
        .await?;
        Ok(())
    }

    /// `indexed_since` is an RFC3339 bound the index applies server-side:
    /// only entities whose index entry appeared at or after it are returned.
    pub async fn search(
        &self,
        query: &str,
        layer: i64,
        limit: Option<usize>,
        indexed_since: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        #[derive(Deserialize)]
        struct Hits {
            hits: Vec<SearchHit>,
        }
        let mut body = json!({ "query": query, "layer": layer, "limit": limit });
        if let Some(since) = indexed_since {
            body["indexed_since"] = json!(since);
        }
        let v = self.send(Method::POST, "/search", Some(&body)).await?;
        let hits: Hits = serde_json::from_value(v).context("decoding search response")?;
        Ok(hits.hits)
    }

    pub async fn entities_at_layer(&self, layer: i64) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Ids {
            ids: Vec<String>,
        }
        let v = self
            .send(Method::GET, &format!("/layers/{}/entities", layer), None)
            .await?;
        let ids: Ids = serde_json::from_value(v).context("decoding layer listing")?;
        Ok(ids.ids)
    }

    pub async fn members_of(&self, cluster_id: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Ids {
            ids: Vec<String>,
        }
        let v = self
            .send(Method::GET, &format!("/entities/{}/members", cluster_id), None)
            .await?;
        let ids: Ids = serde_json::from_value(v).context("decoding members listing")?;
        Ok(ids.ids)
    }

    /// Raw POST used by registration and invocation flows.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::PUT, path, Some(body)).await
    }
}
