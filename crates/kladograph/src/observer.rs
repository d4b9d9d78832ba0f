//! Workflow-tree completion oracle. Reads the log graph rooted at a job
//! collection and decides whether the workflow has finished. The oracle is
//! monotone: once a tree reports complete, adding further logs cannot flip it
//! back, and `error` counts as terminal so a failing branch still lets the
//! whole workflow settle in bounded time.

use std::collections::HashMap;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::time::{sleep, Duration, Instant};

use crate::arke::{predicates, ArkeConnection};
use crate::handoff::{Handoff, LogRecord};

/// Expected child count of a log, derived from its messages and handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Count(usize),
    /// A delegated scatter hides its fan-out; completeness cannot be decided
    /// until the delegate writes `outputs` back.
    Unknown,
}

/// Compute how many `sent_to` children a log must have before its subtree can
/// be considered covered. A `numCopies` message metadata entry overrides the
/// handoff-derived count wherever it appears, including gather logs that
/// carry no handoff list at all.
pub fn expected_children(log: &LogRecord) -> Expected {
    if let Some(n) = log.messages.iter().find_map(|m| m.num_copies) {
        return Expected::Count(n);
    }
    let mut total = 0usize;
    if let Some(handoffs) = &log.entry.handoffs {
        for h in handoffs {
            match h {
                Handoff::Invoke { .. } | Handoff::Pass { .. } | Handoff::Gather { .. } => total += 1,
                Handoff::Scatter {
                    outputs,
                    invocations,
                    delegated,
                } => {
                    if let Some(outs) = outputs {
                        total += outs.len();
                    } else if let Some(invs) = invocations {
                        total += invs.len();
                    } else if *delegated == Some(true) {
                        return Expected::Unknown;
                    } else {
                        total += 1;
                    }
                }
            }
        }
    }
    Expected::Count(total)
}

/// The reachable log graph of one workflow run.
pub struct WorkflowTree {
    pub root: String,
    pub logs: HashMap<String, LogRecord>,
    /// Ids referenced by a `sent_to` edge that could not be fetched yet.
    pub missing: Vec<String>,
}

pub struct Observer<'a> {
    conn: &'a ArkeConnection,
}

impl<'a> Observer<'a> {
    pub fn new(conn: &'a ArkeConnection) -> Self {
        Self { conn }
    }

    /// Resolve `first_log` from the job collection and DFS over `sent_to`.
    pub async fn load_tree(&self, job_collection: &str) -> Result<WorkflowTree> {
        let collection = self
            .conn
            .get_entity(job_collection)
            .await?
            .with_context(|| format!("job collection {} not found", job_collection))?;
        let root = collection
            .peers(predicates::FIRST_LOG)
            .first()
            .map(|s| s.to_string())
            .with_context(|| format!("job collection {} has no first_log", job_collection))?;

        let mut logs: HashMap<String, LogRecord> = HashMap::new();
        let mut missing = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if logs.contains_key(&id) {
                continue;
            }
            match self.conn.get_entity(&id).await? {
                Some(entity) => {
                    let record = LogRecord::from_entity(&entity)?;
                    stack.extend(record.children.iter().cloned());
                    logs.insert(id, record);
                }
                None => {
                    warn!("log {} referenced by sent_to is not readable yet", id);
                    missing.push(id);
                }
            }
        }
        Ok(WorkflowTree { root, logs, missing })
    }

    pub async fn is_complete(&self, job_collection: &str) -> Result<bool> {
        let tree = self.load_tree(job_collection).await?;
        Ok(evaluate(&tree))
    }

    /// Poll until the tree completes or the budget runs out. Returns whether
    /// completion was observed.
    pub async fn wait_for_completion(
        &self,
        job_collection: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_complete(job_collection).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(poll_interval).await;
        }
    }
}

/// Decide completeness from a loaded tree: every leaf log is terminal, and
/// every terminal log has at least its expected number of children with no
/// UNKNOWN anywhere.
pub fn evaluate(tree: &WorkflowTree) -> bool {
    if !tree.missing.is_empty() {
        return false;
    }
    for log in tree.logs.values() {
        if log.children.is_empty() && !log.status.is_terminal() {
            debug!("leaf log {} still {:?}", log.id, log.status);
            return false;
        }
        if log.status.is_terminal() {
            match expected_children(log) {
                Expected::Unknown => {
                    debug!("log {} has a delegated scatter, completeness unknown", log.id);
                    return false;
                }
                Expected::Count(n) => {
                    if log.children.len() < n {
                        debug!(
                            "log {} has {} of {} expected children",
                            log.id,
                            log.children.len(),
                            n
                        );
                        return false;
                    }
                }
            }
        }
    }
    true
}
