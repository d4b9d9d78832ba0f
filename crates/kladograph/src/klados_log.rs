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

//! Per-job progress logging. Every mutation is a single additive-merge
//! request handed to a background drainer; the worker's hot path never
//! awaits store acknowledgement. The additive service deep-merges property
//! maps, unions relationship sets and linearises concurrent writers, which
//! is what lets many branches append `sent_to` onto one hot parent log
//! without client-side compare-and-swap loops.

use std::sync::Arc;

use anyhow::Result;
use log::warn;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::arke::{entity_types, predicates, AdditiveUpdate, ArkeConnection, NewEntity, Relationship};
use crate::handoff::{Handoff, LogMessage, LogStatus, Received};

enum LogOp {
    Update(Vec<AdditiveUpdate>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LogWriter {
    conn: Arc<ArkeConnection>,
    tx: mpsc::UnboundedSender<LogOp>,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl LogWriter {
    /// Spawns the background drainer. The drainer exits when every clone of
    /// the writer has been dropped and the queue has emptied.
    pub fn new(conn: Arc<ArkeConnection>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let drain_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    LogOp::Update(batch) => {
                        // Transport failures are logged, never retried at
                        // this level; the worker's logical step already
                        // moved on.
                        if let Err(e) = drain_conn.apply_additive(&batch).await {
                            warn!("dropping additive log update: {:#}", e);
                        }
                    }
                    LogOp::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { conn, tx }
    }

    fn enqueue(&self, batch: Vec<AdditiveUpdate>) {
        if self.tx.send(LogOp::Update(batch)).is_err() {
            warn!("log drainer gone; update lost");
        }
    }

    /// Create a log entity in `running` state, wire `received_from` edges to
    /// the parents, and append a `sent_to` from each parent back to the new
    /// log. Creation is awaited because callers need the id; the parent
    /// pointer updates are fire-and-forget.
    pub async fn create_log(
        &self,
        klados_id: &str,
        parent_log_ids: &[String],
        received: Received,
    ) -> Result<String> {
        let mut new = NewEntity::new(entity_types::KLADOS_LOG)
            .with_prop("klados_id", json!(klados_id))
            .with_prop("status", json!(LogStatus::Running))
            .with_prop(
                "log_data",
                json!({"entry": {"started_at": now_rfc3339(), "received": received}}),
            );
        for parent in parent_log_ids {
            new = new.with_relationship(Relationship::typed(
                predicates::RECEIVED_FROM,
                parent,
                entity_types::KLADOS_LOG,
            ));
        }
        let log_id = self.conn.create_entity(new).await?;
        if !parent_log_ids.is_empty() {
            let batch = parent_log_ids
                .iter()
                .map(|parent| {
                    AdditiveUpdate::relate(
                        parent,
                        vec![Relationship::typed(
                            predicates::SENT_TO,
                            &log_id,
                            entity_types::KLADOS_LOG,
                        )],
                    )
                })
                .collect();
            self.enqueue(batch);
        }
        Ok(log_id)
    }

    /// Record the handoffs a worker emitted. Later calls replace the list.
    pub fn set_handoffs(&self, log_id: &str, handoffs: &[Handoff]) {
        self.enqueue(vec![AdditiveUpdate::props(
            log_id,
            json!({"log_data": {"entry": {"handoffs": handoffs}}}),
        )]);
    }

    /// Seal the log. Status transitions to done/error happen once; the
    /// merge is additive so a racing reader never observes a partially
    /// cleared entry.
    pub fn complete_log(
        &self,
        log_id: &str,
        status: LogStatus,
        error: Option<String>,
        messages: Vec<LogMessage>,
    ) {
        let mut props = json!({
            "status": status,
            "log_data": {"entry": {"completed_at": now_rfc3339()}}
        });
        if let Some(err) = error {
            props["log_data"]["entry"]["error"] = json!(err);
        }
        if !messages.is_empty() {
            props["messages"] = json!(messages);
        }
        self.enqueue(vec![AdditiveUpdate::props(log_id, props)]);
    }

    /// Wait until every update enqueued so far has been applied. Tests and
    /// shutdown paths only; the hot path must not call this.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogOp::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arke::MemStore;
    use crate::handoff::LogRecord;

    #[tokio::test]
    async fn create_then_complete_seals_log_once_drained() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let conn = Arc::new(ArkeConnection::Local(Arc::clone(&store)));
        let writer = LogWriter::new(Arc::clone(&conn));

        let root = writer.create_log("kg-scatter", &[], Received::default()).await?;
        let child = writer
            .create_log(
                "kg-cluster",
                &[root.clone()],
                Received {
                    parent_logs: vec![root.clone()],
                    target_entity: Some("person:000001".into()),
                    scatter_total: None,
                },
            )
            .await?;
        writer.set_handoffs(&child, &[Handoff::scatter(vec![])]);
        writer.complete_log(&child, LogStatus::Done, None, vec![]);
        writer.flush().await;

        let root_rec = LogRecord::from_entity(&store.get(&root).unwrap())?;
        assert_eq!(root_rec.children, vec![child.clone()], "parent gained sent_to");

        let child_rec = LogRecord::from_entity(&store.get(&child).unwrap())?;
        assert_eq!(child_rec.status, LogStatus::Done);
        assert!(child_rec.entry.completed_at.is_some());
        assert_eq!(child_rec.entry.handoffs.as_deref(), Some(&[Handoff::scatter(vec![])][..]));
        assert_eq!(
            child_rec.entry.received.as_ref().and_then(|r| r.target_entity.as_deref()),
            Some("person:000001")
        );
        Ok(())
    }
}
