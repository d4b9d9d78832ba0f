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

//! Workflow definition loading and rhiza registration. Definitions are JSON
//! files whose `$VAR` string values are substituted from the environment at
//! load time; a missing variable aborts with a readable error. Registration
//! state lives in a per-network dotfile next to the definition so repeated
//! registrations become updates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::arke::http::HttpArke;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KladosRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub klados: KladosRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub label: String,
    pub version: String,
    pub entry: String,
    pub flow: BTreeMap<String, FlowStep>,
}

/// Load a definition file and resolve every `$VAR` string value from the
/// environment.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow definition {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing workflow definition {}", path.display()))?;
    substitute_env(&mut value)?;
    serde_json::from_value(value)
        .with_context(|| format!("workflow definition {} has an invalid shape", path.display()))
}

fn substitute_env(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(var) = s.strip_prefix('$') {
                let resolved = std::env::var(var).map_err(|_| {
                    anyhow!(
                        "environment variable {} is not set (referenced by the workflow definition)",
                        var
                    )
                })?;
                *s = resolved;
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                substitute_env(v)?;
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_env(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Contents of `.rhiza-state-<workflow>-<network>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RhizaState {
    pub rhiza_id: String,
    pub collection_id: String,
    pub version: String,
}

pub fn state_file_path(dir: &Path, workflow: &str, network: &str) -> PathBuf {
    dir.join(format!(".rhiza-state-{}-{}", workflow, network))
}

pub fn load_state(dir: &Path, workflow: &str, network: &str) -> Result<Option<RhizaState>> {
    let path = state_file_path(dir, workflow, network);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("state file {} is malformed", path.display()))?;
    Ok(Some(state))
}

pub fn save_state(dir: &Path, workflow: &str, network: &str, state: &RhizaState) -> Result<()> {
    let path = state_file_path(dir, workflow, network);
    std::fs::write(&path, serde_json::to_string_pretty(state)?)
        .with_context(|| format!("writing state file {}", path.display()))?;
    Ok(())
}

/// What a registration run is about to do, used verbatim by `--dry-run`.
#[derive(Debug, Clone)]
pub enum RegistrationPlan {
    Create { label: String, version: String },
    Update { rhiza_id: String, from_version: String, to_version: String },
}

pub fn plan_registration(
    def: &WorkflowDefinition,
    existing: Option<&RhizaState>,
) -> RegistrationPlan {
    match existing {
        Some(state) => RegistrationPlan::Update {
            rhiza_id: state.rhiza_id.clone(),
            from_version: state.version.clone(),
            to_version: def.version.clone(),
        },
        None => RegistrationPlan::Create {
            label: def.label.clone(),
            version: def.version.clone(),
        },
    }
}

impl std::fmt::Display for RegistrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationPlan::Create { label, version } => {
                write!(f, "create rhiza '{}' at version {}", label, version)
            }
            RegistrationPlan::Update {
                rhiza_id,
                from_version,
                to_version,
            } => write!(
                f,
                "update rhiza {} from version {} to {}",
                rhiza_id, from_version, to_version
            ),
        }
    }
}

/// Execute a registration plan against the API and return the new state.
pub async fn register(
    api: &HttpArke,
    def: &WorkflowDefinition,
    plan: &RegistrationPlan,
) -> Result<RhizaState> {
    #[derive(Deserialize)]
    struct Registered {
        rhiza_id: String,
        collection_id: String,
    }
    let body = serde_json::to_value(def)?;
    let response = match plan {
        RegistrationPlan::Create { .. } => api.post("/rhizai", &body).await?,
        RegistrationPlan::Update { rhiza_id, .. } => {
            api.put(&format!("/rhizai/{}", rhiza_id), &body).await?
        }
    };
    let registered: Registered =
        serde_json::from_value(response).context("decoding registration response")?;
    Ok(RhizaState {
        rhiza_id: registered.rhiza_id,
        collection_id: registered.collection_id,
        version: def.version.clone(),
    })
}

/// Invocation request wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub rhiza_id: String,
    pub target_entity: String,
    pub target_collection: String,
    pub input: InvokeInput,
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvokeInput {
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvokeResponse {
    pub status: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_collection: Option<String>,
}

pub async fn invoke(api: &HttpArke, req: &InvokeRequest) -> Result<InvokeResponse> {
    let response = api.post("/invocations", &serde_json::to_value(req)?).await?;
    if response.is_null() {
        return Err(anyhow!("invocation returned no body"));
    }
    serde_json::from_value(response).context("decoding invocation response")
}

/// Convenience used by the CLI to build the scatter invocation from the
/// registered rhiza handle.
pub fn scatter_invocation(
    rhiza_id: &str,
    target_entity: &str,
    target_collection: &str,
    entity_ids: Vec<String>,
) -> InvokeRequest {
    InvokeRequest {
        rhiza_id: rhiza_id.to_string(),
        target_entity: target_entity.to_string(),
        target_collection: target_collection.to_string(),
        input: InvokeInput { entity_ids },
        confirm: true,
    }
}
