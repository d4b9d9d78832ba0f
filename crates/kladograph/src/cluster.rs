//! Per-entity cluster worker. Each participating entity runs one of these
//! concurrently per layer and decides, against an eventually-consistent
//! store whose search index lags writes, whether to join an existing
//! cluster or found a new one. Duplicate leaders created in the visibility
//! window are repaired by the two-step fallback at follower-wait expiry.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time::sleep;

use crate::arke::{
    entity_types, predicates, AdditiveUpdate, ArkeConnection, IndexMarker, NewEntity, Relationship,
    SearchHit, LAYER_PROP,
};
use crate::config::ClusterConfig;
use crate::handoff::{Handoff, LogStatus, Received};
use crate::klados_log::LogWriter;

/// Terminal result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOutcome {
    /// Attached to an existing cluster; the branch ends here.
    Joined { cluster: String },
    /// Sole entity at its layer; the solo leader was deleted.
    Dissolved,
    /// Kept a surviving cluster; describe runs next.
    Terminated { cluster: String },
}

enum Decision {
    Join(String),
    Recheck,
    Lead,
}

pub struct ClusterWorker {
    conn: Arc<ArkeConnection>,
    logs: LogWriter,
    cfg: ClusterConfig,
    klados_id: String,
    entity_id: String,
    layer: i64,
    rng: StdRng,
}

impl ClusterWorker {
    /// `salt` decorrelates jitter between workers sharing one seed.
    pub fn new(
        conn: Arc<ArkeConnection>,
        logs: LogWriter,
        cfg: ClusterConfig,
        klados_id: &str,
        entity_id: &str,
        layer: i64,
        salt: u64,
    ) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        Self {
            conn,
            logs,
            cfg,
            klados_id: klados_id.to_string(),
            entity_id: entity_id.to_string(),
            layer,
            rng,
        }
    }

    /// Run the state machine to a terminal state. The worker owns exactly
    /// one log: on success it records the handoffs and seals `done`, on an
    /// unhandled error it seals `error` and emits nothing, so downstream
    /// work is never spawned for a failed branch.
    pub async fn run(&mut self, parent_log_ids: &[String]) -> Result<(ClusterOutcome, String)> {
        let log_id = self
            .logs
            .create_log(
                &self.klados_id,
                parent_log_ids,
                Received {
                    parent_logs: parent_log_ids.to_vec(),
                    target_entity: Some(self.entity_id.clone()),
                    scatter_total: None,
                },
            )
            .await?;
        match self.run_inner().await {
            Ok(outcome) => {
                let handoffs = match &outcome {
                    ClusterOutcome::Terminated { cluster } => vec![Handoff::Invoke {
                        outputs: vec![cluster.clone()],
                    }],
                    ClusterOutcome::Joined { .. } | ClusterOutcome::Dissolved => {
                        vec![Handoff::scatter(vec![])]
                    }
                };
                self.logs.set_handoffs(&log_id, &handoffs);
                self.logs.complete_log(&log_id, LogStatus::Done, None, vec![]);
                Ok((outcome, log_id))
            }
            Err(e) => {
                self.logs.complete_log(
                    &log_id,
                    LogStatus::Error,
                    Some(format!("{:#}", e)),
                    vec![],
                );
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<ClusterOutcome> {
        // Everything indexed from here on is "new since arrival" for the
        // semantic fallback.
        let arrival = self.conn.index_marker();
        let me = self
            .conn
            .get_entity(&self.entity_id)
            .await?
            .with_context(|| format!("entity {} not found", self.entity_id))?;
        let query = me.search_text();

        // SEARCHING
        let hits = self.search_peers(&query, Some(self.cfg.k), None).await?;
        match self.decide(&hits).await? {
            Decision::Join(cluster) => return Ok(ClusterOutcome::Joined { cluster }),
            Decision::Lead => {}
            Decision::Recheck => {
                // RECHECK_PENDING: peers were visible but none clustered yet.
                debug!(
                    "{} rechecking {} unclustered peers in {:?}",
                    self.entity_id,
                    hits.len(),
                    self.cfg.recheck_delay
                );
                sleep(self.cfg.recheck_delay).await;
                let hits = self.search_peers(&query, Some(self.cfg.k), None).await?;
                if let Decision::Join(cluster) = self.decide(&hits).await? {
                    return Ok(ClusterOutcome::Joined { cluster });
                }
                // Still nobody clustered: lead rather than loop. Fallback
                // convergence repairs any duplicate leaders this produces.
            }
        }
        self.lead(&query, &arrival).await
    }

    /// Layer-restricted search excluding self, optionally bounded to peers
    /// indexed at or after `since`. `limit` is widened by one slot so the
    /// caller still sees K peers when the index returns us.
    async fn search_peers(
        &self,
        query: &str,
        limit: Option<usize>,
        since: Option<&IndexMarker>,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self
            .conn
            .search_indexed_since(query, self.layer, limit.map(|k| k + 1), since)
            .await?;
        hits.retain(|h| h.peer_id != self.entity_id);
        if let Some(k) = limit {
            hits.truncate(k);
        }
        Ok(hits)
    }

    /// First clustered peer in score order wins; visible-but-unclustered
    /// peers ask for a recheck; an empty neighbourhood leads.
    async fn decide(&self, hits: &[SearchHit]) -> Result<Decision> {
        for hit in hits {
            let Some(peer) = self.conn.get_entity(&hit.peer_id).await? else {
                continue;
            };
            if let Some(cluster) = peer.summarized_by() {
                let cluster = cluster.to_string();
                if self.attach(&cluster).await? {
                    info!(
                        "{} joined {} via peer {}",
                        self.entity_id, cluster, hit.peer_id
                    );
                    return Ok(Decision::Join(cluster));
                }
                // The cluster vanished between the peer read and our attach;
                // keep scanning the remaining candidates.
            }
        }
        if hits.is_empty() {
            Ok(Decision::Lead)
        } else {
            Ok(Decision::Recheck)
        }
    }

    /// Attach our `summarized_by` to `cluster`, verifying the leader still
    /// exists afterwards. Returns false (and retracts the edge) when it was
    /// deleted out from under us.
    async fn attach(&self, cluster: &str) -> Result<bool> {
        let edge = Relationship::typed(
            predicates::SUMMARIZED_BY,
            cluster,
            entity_types::CLUSTER_LEADER,
        );
        self.conn
            .apply_additive(&[AdditiveUpdate::relate(&self.entity_id, vec![edge.clone()])])
            .await?;
        if self.conn.get_entity(cluster).await?.is_some() {
            return Ok(true);
        }
        self.conn
            .retract_relationship(&self.entity_id, &edge)
            .await?;
        Ok(false)
    }

    /// LEADING_WAITING: found a cluster at layer+1, hold it open for the
    /// jittered follower window, then either keep it or run the fallback.
    async fn lead(&mut self, query: &str, arrival: &IndexMarker) -> Result<ClusterOutcome> {
        let leader_id = self
            .conn
            .create_entity(
                NewEntity::new(entity_types::CLUSTER_LEADER)
                    .with_prop(LAYER_PROP, json!(self.layer + 1)),
            )
            .await?;
        self.conn
            .apply_additive(&[AdditiveUpdate::relate(
                &self.entity_id,
                vec![Relationship::typed(
                    predicates::SUMMARIZED_BY,
                    &leader_id,
                    entity_types::CLUSTER_LEADER,
                )],
            )])
            .await?;
        let wait = self.follower_wait();
        info!(
            "{} leading new cluster {} at layer {}, follower wait {:?}",
            self.entity_id,
            leader_id,
            self.layer + 1,
            wait
        );
        sleep(wait).await;

        let members = self.conn.members_of(&leader_id).await?;
        if members.len() > 1 {
            return Ok(ClusterOutcome::Terminated { cluster: leader_id });
        }
        self.fallback(&leader_id, query, arrival).await
    }

    fn follower_wait(&mut self) -> std::time::Duration {
        let min = self.cfg.follower_wait_min.as_millis() as u64;
        let max = self.cfg.follower_wait_max.as_millis() as u64;
        let ms = if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        };
        std::time::Duration::from_millis(ms)
    }

    /// Two-step convergence for a leader whose follower wait produced no
    /// members: semantic first, then lexicographic, then dissolve.
    async fn fallback(
        &mut self,
        leader_id: &str,
        query: &str,
        arrival: &IndexMarker,
    ) -> Result<ClusterOutcome> {
        // Step 1: uncapped semantic re-search over peers indexed since our
        // arrival; join the best-scoring peer's foreign cluster. Peers
        // indexed earlier were already visible to the SEARCHING pass; the
        // lexicographic sweep below covers them regardless.
        let hits = self.search_peers(query, None, Some(arrival)).await?;
        for hit in &hits {
            let Some(peer) = self.conn.get_entity(&hit.peer_id).await? else {
                continue;
            };
            if let Some(cluster) = peer.summarized_by() {
                if cluster != leader_id {
                    let cluster = cluster.to_string();
                    if self.leave_solo_and_join(leader_id, &cluster).await? {
                        info!(
                            "{} left solo cluster {} for {} (semantic fallback)",
                            self.entity_id, leader_id, cluster
                        );
                        return Ok(ClusterOutcome::Joined { cluster });
                    }
                }
            }
        }

        // Step 2: lexicographic sweep. The smallest id that reaches this
        // point keeps its cluster so later entities have a stable target.
        let ids = self.conn.entities_at_layer(self.layer).await?;
        for id in &ids {
            if *id == self.entity_id {
                break;
            }
            let Some(peer) = self.conn.get_entity(id).await? else {
                continue;
            };
            if let Some(cluster) = peer.summarized_by() {
                if cluster != leader_id {
                    let cluster = cluster.to_string();
                    if self.leave_solo_and_join(leader_id, &cluster).await? {
                        info!(
                            "{} left solo cluster {} for {} (lexicographic fallback)",
                            self.entity_id, leader_id, cluster
                        );
                        return Ok(ClusterOutcome::Joined { cluster });
                    }
                }
            }
        }

        // Step 3: dissolve when we are the sole entity at this layer,
        // otherwise remain leader and let successors find us.
        if ids.len() <= 1 {
            warn!(
                "{} is alone at layer {}, dissolving solo cluster {}",
                self.entity_id, self.layer, leader_id
            );
            self.conn
                .retract_relationship(
                    &self.entity_id,
                    &Relationship::new(predicates::SUMMARIZED_BY, leader_id),
                )
                .await?;
            self.conn.delete_entity(leader_id).await?;
            return Ok(ClusterOutcome::Dissolved);
        }
        Ok(ClusterOutcome::Terminated {
            cluster: leader_id.to_string(),
        })
    }

    /// Move membership from our solo cluster to `target`: attach, verify the
    /// target still exists, and only then drop the old edge and delete the
    /// solo leader. A vanished target leaves our cluster intact, as does a
    /// follower that attached to us while we were scanning.
    async fn leave_solo_and_join(&self, leader_id: &str, target: &str) -> Result<bool> {
        if !self.attach(target).await? {
            return Ok(false);
        }
        let members = self.conn.members_of(leader_id).await?;
        if members.iter().any(|m| m != &self.entity_id) {
            self.conn
                .retract_relationship(
                    &self.entity_id,
                    &Relationship::new(predicates::SUMMARIZED_BY, target),
                )
                .await?;
            return Ok(false);
        }
        self.conn
            .retract_relationship(
                &self.entity_id,
                &Relationship::new(predicates::SUMMARIZED_BY, leader_id),
            )
            .await?;
        self.conn.delete_entity(leader_id).await?;
        Ok(true)
    }
}
