use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use kladograph::arke::http::HttpArke;
use kladograph::arke::ArkeConnection;
use kladograph::config::ClusterConfig;
use kladograph::observer::Observer;
use kladograph::workflow::{
    invoke, load_definition, load_state, plan_registration, register, save_state,
    scatter_invocation, state_file_path,
};

/// Register, invoke and inspect knowledge-graph clustering workflows.
#[derive(Parser)]
#[command(name = "kladograph", version)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Register (or update) the workflow definition as a rhiza.
    Register {
        /// Path to the workflow definition JSON file.
        #[arg(long)]
        workflow: PathBuf,
        /// Print the action plan and exit without mutating anything.
        #[arg(long)]
        dry_run: bool,
        /// Directory holding the per-network state file.
        #[arg(long, default_value = ".")]
        state_dir: PathBuf,
    },
    /// Start a scatter run over the given entity ids.
    Invoke {
        #[arg(long)]
        target_entity: String,
        #[arg(long)]
        target_collection: String,
        #[arg(required = true)]
        entity_ids: Vec<String>,
    },
    /// Report (or wait for) completion of a running workflow.
    Status {
        job_collection: String,
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn network() -> String {
    std::env::var("ARKE_NETWORK").unwrap_or_else(|_| "test".to_string())
}

async fn run(args: Args) -> Result<()> {
    match args.cmd {
        Cmd::Register {
            workflow,
            dry_run,
            state_dir,
        } => {
            let def = load_definition(&workflow)?;
            let network = network();
            let existing = load_state(&state_dir, &def.label, &network)?;
            let plan = plan_registration(&def, existing.as_ref());
            if dry_run {
                println!("dry run: would {}", plan);
                println!(
                    "state file: {}",
                    state_file_path(&state_dir, &def.label, &network).display()
                );
                return Ok(());
            }
            let api = HttpArke::from_env()?;
            let state = register(&api, &def, &plan).await?;
            save_state(&state_dir, &def.label, &network, &state)?;
            println!(
                "registered rhiza {} (collection {}, version {})",
                state.rhiza_id, state.collection_id, state.version
            );
        }
        Cmd::Invoke {
            target_entity,
            target_collection,
            entity_ids,
        } => {
            let rhiza_id =
                std::env::var("SCATTER_KG_RHIZA").context("SCATTER_KG_RHIZA not set")?;
            let api = HttpArke::from_env()?;
            let req =
                scatter_invocation(&rhiza_id, &target_entity, &target_collection, entity_ids);
            let resp = invoke(&api, &req).await?;
            if resp.status != "started" {
                return Err(anyhow!("invocation returned status '{}'", resp.status));
            }
            println!(
                "started job {} (collection {})",
                resp.job_id.unwrap_or_default(),
                resp.job_collection.unwrap_or_default()
            );
        }
        Cmd::Status {
            job_collection,
            wait,
        } => {
            let conn = ArkeConnection::connect_from_env()?;
            let observer = Observer::new(&conn);
            if wait {
                let cfg = ClusterConfig::from_env();
                let done = observer
                    .wait_for_completion(&job_collection, cfg.poll_interval, cfg.poll_timeout)
                    .await?;
                if !done {
                    return Err(anyhow!(
                        "workflow {} did not complete within the polling budget",
                        job_collection
                    ));
                }
                println!("complete");
            } else if observer.is_complete(&job_collection).await? {
                println!("complete");
            } else {
                println!("running");
            }
        }
    }
    Ok(())
}
