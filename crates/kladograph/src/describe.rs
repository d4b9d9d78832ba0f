//! Describe stage: one call per surviving cluster. Reads the members, asks
//! the LLM for a label/title/description JSON object, retries malformed
//! responses with feedback, writes the result onto the cluster leader and
//! hands the leader off to the next clustering recursion one layer up.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::arke::{AdditiveUpdate, ArkeConnection};
use crate::config::ClusterConfig;
use crate::handoff::{Handoff, LogMessage, LogStatus, Received};
use crate::klados_log::LogWriter;
use crate::llm::LlmClient;

const SYSTEM_PROMPT: &str = "You are a knowledge-graph curator. You will be shown the members of an \
entity cluster. Respond with a single JSON object containing the keys \
\"label\" (a short name for the cluster), \"title\" (a one-line headline) \
and \"description\" (two to four sentences summarising what unites the \
members). Respond with the JSON object only, no surrounding prose.";

/// Echo at most this many characters of a malformed response back to the
/// model on retry.
const FEEDBACK_ECHO_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
struct ClusterDescription {
    label: String,
    #[serde(default)]
    title: Option<String>,
    description: String,
}

pub struct DescribeWorker {
    conn: Arc<ArkeConnection>,
    logs: LogWriter,
    llm: Arc<LlmClient>,
    cfg: ClusterConfig,
    klados_id: String,
}

impl DescribeWorker {
    pub fn new(
        conn: Arc<ArkeConnection>,
        logs: LogWriter,
        llm: Arc<LlmClient>,
        cfg: ClusterConfig,
        klados_id: &str,
    ) -> Self {
        Self {
            conn,
            logs,
            llm,
            cfg,
            klados_id: klados_id.to_string(),
        }
    }

    /// Describe `cluster_id`. Returns the leader id to feed into the next
    /// clustering recursion, or `None` when the LLM never produced parseable
    /// JSON (the log is sealed `error` in that case). The second element is
    /// this stage's log id. With `recurse` false the log records a
    /// terminating empty scatter instead of the invoke handoff, used when a
    /// branch has reached the recursion cap and will spawn nothing further.
    pub async fn run(
        &self,
        cluster_id: &str,
        parent_log_ids: &[String],
        recurse: bool,
    ) -> Result<(Option<String>, String)> {
        let log_id = self
            .logs
            .create_log(
                &self.klados_id,
                parent_log_ids,
                Received {
                    parent_logs: parent_log_ids.to_vec(),
                    target_entity: Some(cluster_id.to_string()),
                    scatter_total: None,
                },
            )
            .await?;
        let mut messages = Vec::new();
        match self.describe(cluster_id, &mut messages).await {
            Ok(Some(())) => {
                let handoffs = if recurse {
                    vec![Handoff::Invoke {
                        outputs: vec![cluster_id.to_string()],
                    }]
                } else {
                    vec![Handoff::scatter(vec![])]
                };
                self.logs.set_handoffs(&log_id, &handoffs);
                self.logs
                    .complete_log(&log_id, LogStatus::Done, None, messages);
                Ok((Some(cluster_id.to_string()), log_id))
            }
            Ok(None) => {
                warn!(
                    "describe for {} exhausted {} llm attempts",
                    cluster_id, self.cfg.describe_max_attempts
                );
                self.logs.complete_log(
                    &log_id,
                    LogStatus::Error,
                    Some(format!(
                        "llm returned unparseable JSON in all {} attempts",
                        self.cfg.describe_max_attempts
                    )),
                    messages,
                );
                Ok((None, log_id))
            }
            Err(e) => {
                self.logs
                    .complete_log(&log_id, LogStatus::Error, Some(format!("{:#}", e)), messages);
                Err(e)
            }
        }
    }

    async fn describe(&self, cluster_id: &str, messages: &mut Vec<LogMessage>) -> Result<Option<()>> {
        let member_ids = self.conn.members_of(cluster_id).await?;
        if member_ids.is_empty() {
            return Err(anyhow!("cluster {} has no members to describe", cluster_id));
        }
        let members = self.conn.get_entities(&member_ids).await?;

        let mut prompt = format!(
            "Cluster {} contains {} member entities:\n\n",
            cluster_id,
            members.len()
        );
        for (i, m) in members.iter().enumerate() {
            let desc = m.description();
            if desc.is_empty() {
                prompt.push_str(&format!("{}. {}\n", i + 1, m.label()));
            } else {
                prompt.push_str(&format!("{}. {} - {}\n", i + 1, m.label(), desc));
            }
        }
        prompt.push_str("\nDescribe this cluster as the JSON object specified.");

        for attempt in 1..=self.cfg.describe_max_attempts {
            let raw = self.llm.complete(SYSTEM_PROMPT, &prompt).await?;
            match parse_description(&raw) {
                Ok(desc) => {
                    info!(
                        "described cluster {} as '{}' on attempt {}",
                        cluster_id, desc.label, attempt
                    );
                    let mut props = json!({
                        "label": desc.label,
                        "description": desc.description,
                    });
                    if let Some(title) = desc.title {
                        props["title"] = json!(title);
                    }
                    self.conn
                        .apply_additive(&[AdditiveUpdate::props(cluster_id, props)])
                        .await
                        .context("storing cluster description")?;
                    return Ok(Some(()));
                }
                Err(e) => {
                    warn!(
                        "describe for {} attempt {} failed to parse: {}",
                        cluster_id, attempt, e
                    );
                    messages.push(LogMessage::text(format!(
                        "retry {}: JSON parse error: {}",
                        attempt, e
                    )));
                    let echoed: String = raw.chars().take(FEEDBACK_ECHO_CHARS).collect();
                    prompt.push_str(&format!(
                        "\n\nRETRY — JSON PARSE ERROR\nYour previous response could not be used: {}\n\
                         Previous response (truncated):\n{}\n\
                         Respond again with only the JSON object.",
                        e, echoed
                    ));
                }
            }
        }
        Ok(None)
    }
}

/// Strict parse of the model output into a description. Code fences are
/// stripped; everything else must be a JSON object with non-empty `label`
/// and `description`.
fn parse_description(raw: &str) -> Result<ClusterDescription> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    text = text.strip_suffix("```").unwrap_or(text).trim();
    let desc: ClusterDescription =
        serde_json::from_str(text).map_err(|e| anyhow!("invalid JSON: {}", e))?;
    if desc.label.trim().is_empty() {
        return Err(anyhow!("schema error: label is empty"));
    }
    if desc.description.trim().is_empty() {
        return Err(anyhow!("schema error: description is empty"));
    }
    Ok(desc)
}
