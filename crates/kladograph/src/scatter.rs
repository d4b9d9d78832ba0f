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

//! Entry-point fan-out. One invocation turns a list of entity ids into that
//! many parallel branches, each running cluster then describe then cluster
//! again one layer up until it joins, dissolves, or hits the recursion cap. The
//! scatter itself records a single `scatter` handoff and returns; branches
//! are detached tasks that seal their own logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use crate::arke::{entity_types, predicates, AdditiveUpdate, ArkeConnection, NewEntity, Relationship};
use crate::cluster::{ClusterOutcome, ClusterWorker};
use crate::config::{ClusterConfig, StageIds};
use crate::describe::DescribeWorker;
use crate::handoff::{Handoff, LogStatus, Received};
use crate::klados_log::LogWriter;
use crate::llm::LlmClient;

/// Result contract of a started scatter.
#[derive(Debug, Clone, Serialize)]
pub struct ScatterStarted {
    pub status: String,
    pub job_id: String,
    pub job_collection: String,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub branches_started: AtomicU64,
    pub branches_completed: AtomicU64,
    pub branches_failed: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.branches_started.load(Ordering::Relaxed),
            self.branches_completed.load(Ordering::Relaxed),
            self.branches_failed.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone)]
pub struct Pipeline {
    conn: Arc<ArkeConnection>,
    llm: Arc<LlmClient>,
    cfg: ClusterConfig,
    stages: StageIds,
    logs: LogWriter,
    pub metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        conn: Arc<ArkeConnection>,
        llm: Arc<LlmClient>,
        cfg: ClusterConfig,
        stages: StageIds,
    ) -> Self {
        let logs = LogWriter::new(Arc::clone(&conn));
        Self {
            conn,
            llm,
            cfg,
            stages,
            logs,
            metrics: Arc::new(PipelineMetrics::default()),
        }
    }

    pub fn log_writer(&self) -> &LogWriter {
        &self.logs
    }

    /// Create the job collection and root scatter log, fan out one branch
    /// per entity id and return immediately. No retries; a failure to start
    /// is surfaced to the caller.
    pub async fn run_scatter(
        &self,
        rhiza_id: &str,
        target_entity: &str,
        target_collection: &str,
        entity_ids: &[String],
    ) -> Result<ScatterStarted> {
        let job_collection = self
            .conn
            .create_entity(
                NewEntity::new(entity_types::SCATTER_JOB)
                    .with_prop("label", json!(format!("kg scatter for {}", target_entity)))
                    .with_prop("rhiza_id", json!(rhiza_id))
                    .with_prop("target_entity", json!(target_entity))
                    .with_prop("target_collection", json!(target_collection))
                    .with_prop("permissions", json!({"*": ["view", "invoke"]})),
            )
            .await?;

        let root_log = self
            .logs
            .create_log(
                &self.stages.scatter,
                &[],
                Received {
                    parent_logs: vec![],
                    scatter_total: Some(entity_ids.len()),
                    target_entity: Some(target_entity.to_string()),
                },
            )
            .await?;
        // Anchor the tree before any branch can race ahead of the observer.
        self.conn
            .apply_additive(&[AdditiveUpdate::relate(
                &job_collection,
                vec![Relationship::typed(
                    predicates::FIRST_LOG,
                    &root_log,
                    entity_types::KLADOS_LOG,
                )],
            )])
            .await?;

        self.logs
            .set_handoffs(&root_log, &[Handoff::scatter(entity_ids.to_vec())]);

        for (index, entity_id) in entity_ids.iter().enumerate() {
            let pipeline = self.clone();
            let entity_id = entity_id.clone();
            let parent = root_log.clone();
            pipeline
                .metrics
                .branches_started
                .fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                pipeline.run_branch(entity_id, parent, index as u64).await;
            });
        }

        self.logs.complete_log(&root_log, LogStatus::Done, None, vec![]);
        info!(
            "scatter {} started {} branches (collection {})",
            root_log,
            entity_ids.len(),
            job_collection
        );
        Ok(ScatterStarted {
            status: "started".to_string(),
            job_id: root_log,
            job_collection,
        })
    }

    /// One branch: cluster at the entity's layer; when a cluster survives,
    /// describe it and re-enter clustering with the leader one layer up.
    /// Stops on join, dissolve, error, or the recursion cap.
    async fn run_branch(&self, entity_id: String, parent_log: String, branch_index: u64) {
        let mut target = entity_id;
        let mut parent = parent_log;
        let mut layer = match self.conn.get_entity(&target).await {
            Ok(Some(e)) => e.layer().unwrap_or(0),
            _ => 0,
        };

        for depth in 0..self.cfg.max_depth {
            let salt = (branch_index << 8) | depth as u64;
            let mut worker = ClusterWorker::new(
                Arc::clone(&self.conn),
                self.logs.clone(),
                self.cfg.clone(),
                &self.stages.cluster,
                &target,
                layer,
                salt,
            );
            let (outcome, cluster_log) = match worker.run(&[parent.clone()]).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("branch for {} failed in cluster stage: {:#}", target, e);
                    self.metrics.branches_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let cluster = match outcome {
                ClusterOutcome::Terminated { cluster } => cluster,
                ClusterOutcome::Joined { .. } | ClusterOutcome::Dissolved => {
                    self.metrics
                        .branches_completed
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            let recurse = depth + 1 < self.cfg.max_depth;
            let describer = DescribeWorker::new(
                Arc::clone(&self.conn),
                self.logs.clone(),
                Arc::clone(&self.llm),
                self.cfg.clone(),
                &self.stages.describe,
            );
            match describer.run(&cluster, &[cluster_log], recurse).await {
                Ok((Some(next), describe_log)) if recurse => {
                    target = next;
                    parent = describe_log;
                    layer += 1;
                }
                Ok((Some(_), _)) => {
                    warn!(
                        "branch for {} stopped at recursion cap {}",
                        cluster, self.cfg.max_depth
                    );
                    self.metrics
                        .branches_completed
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok((None, _)) => {
                    self.metrics.branches_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!("branch for {} failed in describe stage: {:#}", cluster, e);
                    self.metrics.branches_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}
