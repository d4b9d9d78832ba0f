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

use std::time::Duration;

/// Tuning knobs for the clustering coordinator. Defaults match the deployed
/// service; each field can be overridden through a `KG_*` environment
/// variable.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Candidate limit for the initial semantic search.
    pub k: usize,
    /// Delay before re-checking peers that were visible but unclustered.
    pub recheck_delay: Duration,
    /// Follower-wait jitter bounds for a freshly-created leader.
    pub follower_wait_min: Duration,
    pub follower_wait_max: Duration,
    /// Total LLM attempts for the describe stage.
    pub describe_max_attempts: usize,
    /// Hard safety cap on cluster/describe recursion levels.
    pub max_depth: usize,
    /// Completion-oracle polling cadence and overall budget.
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Jitter seed; `None` draws from entropy. Set by the simulator.
    pub seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: 5,
            recheck_delay: Duration::from_secs(10),
            follower_wait_min: Duration::from_secs(30),
            follower_wait_max: Duration::from_secs(90),
            describe_max_attempts: 3,
            max_depth: 10,
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(30 * 60),
            seed: None,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl ClusterConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u64("KG_CLUSTER_K") {
            cfg.k = v as usize;
        }
        if let Some(v) = env_u64("KG_RECHECK_DELAY_MS") {
            cfg.recheck_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("KG_FOLLOWER_WAIT_MIN_MS") {
            cfg.follower_wait_min = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("KG_FOLLOWER_WAIT_MAX_MS") {
            cfg.follower_wait_max = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("KG_DESCRIBE_MAX_ATTEMPTS") {
            cfg.describe_max_attempts = v as usize;
        }
        if let Some(v) = env_u64("KG_MAX_RECURSION_DEPTH") {
            cfg.max_depth = v as usize;
        }
        if let Some(v) = env_u64("KG_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("KG_POLL_TIMEOUT_MS") {
            cfg.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("KG_JITTER_SEED") {
            cfg.seed = Some(v);
        }
        cfg
    }
}

/// Stage identities recorded on each log. In a deployed workflow these come
/// from the per-stage klados environment variables; the fallbacks keep local
/// runs and tests readable.
#[derive(Debug, Clone)]
pub struct StageIds {
    pub scatter: String,
    pub extract: String,
    pub dedupe: String,
    pub cluster: String,
    pub describe: String,
}

impl Default for StageIds {
    fn default() -> Self {
        Self {
            scatter: "kg-scatter".to_string(),
            extract: "kg-extractor".to_string(),
            dedupe: "kg-dedupe-resolver".to_string(),
            cluster: "kg-cluster".to_string(),
            describe: "kg-describe".to_string(),
        }
    }
}

impl StageIds {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            scatter: std::env::var("SCATTER_KLADOS").unwrap_or(d.scatter),
            extract: std::env::var("KG_EXTRACTOR_KLADOS").unwrap_or(d.extract),
            dedupe: std::env::var("KG_DEDUPE_RESOLVER_KLADOS").unwrap_or(d.dedupe),
            cluster: std::env::var("KG_CLUSTER_KLADOS").unwrap_or(d.cluster),
            describe: std::env::var("DESCRIBE_KLADOS").unwrap_or(d.describe),
        }
    }
}
