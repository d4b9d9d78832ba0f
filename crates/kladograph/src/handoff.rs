//! Typed records for the workflow log protocol. Logs are stored as ordinary
//! entities whose property bag carries these shapes under `log_data.entry`;
//! workers only ever write them through additive merges.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::arke::Entity;

/// An action a worker records at completion, describing what downstream work
/// exists. The completion oracle derives expected child counts from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Handoff {
    /// Single downstream call.
    Invoke { outputs: Vec<String> },
    /// Unchanged hand-through.
    Pass { outputs: Vec<String> },
    /// Fan-out. Exactly one of `outputs`, `invocations` or `delegated` is
    /// normally present; a delegated scatter may later gain `outputs`
    /// through an additive write.
    Scatter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocations: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delegated: Option<bool>,
    },
    /// Fan-in.
    Gather { outputs: Vec<String> },
}

impl Handoff {
    pub fn scatter(outputs: Vec<String>) -> Self {
        Handoff::Scatter {
            outputs: Some(outputs),
            invocations: None,
            delegated: None,
        }
    }

    pub fn delegated_scatter() -> Self {
        Handoff::Scatter {
            outputs: None,
            invocations: None,
            delegated: Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Done,
    Error,
}

impl LogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LogStatus::Done | LogStatus::Error)
    }
}

/// Provenance recorded when a log is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Received {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scatter_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<String>,
}

/// The nested `log_data.entry` record. Every field is optional so partial
/// additive merges never have to fabricate values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<Received>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoffs: Option<Vec<Handoff>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Free-form progress message. `num_copies` overrides the expected-children
/// count for the whole log when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub text: String,
    #[serde(
        rename = "numCopies",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub num_copies: Option<usize>,
}

impl LogMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            num_copies: None,
        }
    }
}

/// Typed view over a `klados_log` entity's property bag.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: String,
    pub klados_id: String,
    pub status: LogStatus,
    pub entry: LogEntry,
    pub messages: Vec<LogMessage>,
    /// Child log ids, from `sent_to` relationships.
    pub children: Vec<String>,
}

impl LogRecord {
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let klados_id = entity
            .properties
            .get("klados_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let status: LogStatus = entity
            .properties
            .get("status")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("log {} has a malformed status", entity.id))?
            .unwrap_or(LogStatus::Running);
        let entry: LogEntry = entity
            .properties
            .get("log_data")
            .and_then(|v| v.get("entry"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("log {} has a malformed log_data.entry", entity.id))?
            .unwrap_or_default();
        let messages: Vec<LogMessage> = entity
            .properties
            .get("messages")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("log {} has malformed messages", entity.id))?
            .unwrap_or_default();
        Ok(Self {
            id: entity.id.clone(),
            klados_id,
            status,
            entry,
            messages,
            children: entity
                .peers(crate::arke::predicates::SENT_TO)
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }
}
