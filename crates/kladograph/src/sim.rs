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

//! Discrete-event fixture for the cluster worker. Runs one worker per
//! synthetic entity against the embedded store with a laggy search index,
//! using seeded jitter and arrival offsets so a run is reproducible under
//! paused tokio time. Exposed from the library, like `test_utils`, so
//! integration tests can share it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time::sleep;

use crate::arke::{entity_types, predicates, ArkeConnection, MemStore, NewEntity, LAYER_PROP};
use crate::cluster::{ClusterOutcome, ClusterWorker};
use crate::config::ClusterConfig;
use crate::klados_log::LogWriter;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub k: usize,
    /// Entities arrive uniformly spread over this window.
    pub arrival_spread: Duration,
    /// Search-index visibility lag of the store.
    pub index_delay: Duration,
    pub recheck_delay: Duration,
    pub follower_wait_min: Duration,
    pub follower_wait_max: Duration,
    /// One layer-0 entity is created per label; token overlap between
    /// labels is what makes entities semantic neighbours.
    pub labels: Vec<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            k: 5,
            arrival_spread: Duration::from_millis(100),
            index_delay: Duration::from_secs(1),
            recheck_delay: Duration::from_secs(10),
            follower_wait_min: Duration::from_secs(30),
            follower_wait_max: Duration::from_secs(90),
            labels: Vec::new(),
        }
    }
}

pub struct SimReport {
    pub store: Arc<MemStore>,
    /// (entity id, terminal state) per worker, in arrival order.
    pub outcomes: Vec<(String, ClusterOutcome)>,
    pub violations: Vec<String>,
}

/// Drive one full layer-0 clustering pass and validate the membership
/// invariants afterwards. Call from a test with paused time; every sleep in
/// the workers auto-advances the clock.
pub async fn run(cfg: SimConfig) -> Result<SimReport> {
    let store = Arc::new(MemStore::with_index_delay(cfg.index_delay));
    let conn = Arc::new(ArkeConnection::Local(Arc::clone(&store)));
    let logs = LogWriter::new(Arc::clone(&conn));

    let cluster_cfg = ClusterConfig {
        k: cfg.k,
        recheck_delay: cfg.recheck_delay,
        follower_wait_min: cfg.follower_wait_min,
        follower_wait_max: cfg.follower_wait_max,
        seed: Some(cfg.seed),
        ..ClusterConfig::default()
    };

    let mut arrivals = StdRng::seed_from_u64(cfg.seed);
    let spread_ms = cfg.arrival_spread.as_millis() as u64;
    let mut handles = Vec::new();
    for (i, label) in cfg.labels.iter().enumerate() {
        let offset = if spread_ms > 0 {
            Duration::from_millis(arrivals.gen_range(0..=spread_ms))
        } else {
            Duration::ZERO
        };
        let conn = Arc::clone(&conn);
        let logs = logs.clone();
        let cluster_cfg = cluster_cfg.clone();
        let label = label.clone();
        handles.push(tokio::spawn(async move {
            sleep(offset).await;
            let id = conn
                .create_entity(
                    NewEntity::new("concept")
                        .with_prop("label", json!(label))
                        .with_prop(LAYER_PROP, json!(0)),
                )
                .await?;
            let mut worker =
                ClusterWorker::new(conn, logs, cluster_cfg, "kg-cluster", &id, 0, i as u64);
            let (outcome, _log) = worker.run(&[]).await?;
            Ok::<(String, ClusterOutcome), anyhow::Error>((id, outcome))
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    logs.flush().await;

    let violations = validate(&store);
    Ok(SimReport {
        store,
        outcomes,
        violations,
    })
}

/// Check the membership invariants over a finished store: at most one
/// `summarized_by` per entity, no orphan or dangling leaders, and every
/// membership edge climbing exactly one layer.
pub fn validate(store: &MemStore) -> Vec<String> {
    let mut violations = Vec::new();
    let entities = store.all_entities();
    for e in &entities {
        if e.entity_type == entity_types::KLADOS_LOG {
            continue;
        }
        let memberships = e.peers(predicates::SUMMARIZED_BY);
        if memberships.len() > 1 {
            violations.push(format!(
                "P1: {} has {} summarized_by edges",
                e.id,
                memberships.len()
            ));
        }
        for cluster_id in memberships {
            match store.get(cluster_id) {
                None => violations.push(format!(
                    "P2: {} points at deleted leader {}",
                    e.id, cluster_id
                )),
                Some(cluster) => {
                    let (Some(el), Some(cl)) = (e.layer(), cluster.layer()) else {
                        violations.push(format!(
                            "P3: membership edge {} -> {} with missing layer",
                            e.id, cluster_id
                        ));
                        continue;
                    };
                    if cl != el + 1 {
                        violations.push(format!(
                            "P3: {} at layer {} summarized_by {} at layer {}",
                            e.id, el, cluster_id, cl
                        ));
                    }
                }
            }
        }
        if e.entity_type == entity_types::CLUSTER_LEADER && store.members_of(&e.id).is_empty() {
            violations.push(format!("P2: leader {} has no members", e.id));
        }
    }
    violations
}
