use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, routing::get, Router};
use clap::Parser;
use log::info;
use serde::Deserialize;

use kladograph::arke::ArkeConnection;
use kladograph::config::{ClusterConfig, StageIds};
use kladograph::llm::LlmClient;
use kladograph::observer::Observer;
use kladograph::scatter::{Pipeline, PipelineMetrics};

/// Run the scatter pipeline in-process against the configured store.
#[derive(Parser)]
#[command(name = "kladograph-runner", version)]
struct Args {
    /// Optional config file path (TOML). Defaults to kladograph.toml in cwd.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "kg-run")]
    target_entity: String,

    #[arg(long, default_value = "kg-run")]
    target_collection: String,

    #[arg(required = true)]
    entity_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    k: Option<usize>,
    recheck_delay_ms: Option<u64>,
    follower_wait_min_ms: Option<u64>,
    follower_wait_max_ms: Option<u64>,
    max_depth: Option<usize>,
    port: Option<u16>,
}

impl AppConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let cfg_path = path
            .cloned()
            .unwrap_or_else(|| PathBuf::from("kladograph.toml"));
        if cfg_path.exists() {
            let s = std::fs::read_to_string(&cfg_path)?;
            Ok(toml::from_str(&s)?)
        } else {
            Ok(AppConfig::default())
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(metrics): State<Arc<PipelineMetrics>>) -> String {
    let (started, completed, failed) = metrics.snapshot();
    format!(
        "# HELP kladograph_branches_started_total Branches fanned out by the scatter stage\n\
         # TYPE kladograph_branches_started_total counter\n\
         kladograph_branches_started_total {}\n\
         # HELP kladograph_branches_completed_total Branches that reached a clean terminal state\n\
         # TYPE kladograph_branches_completed_total counter\n\
         kladograph_branches_completed_total {}\n\
         # HELP kladograph_branches_failed_total Branches that sealed a log as error\n\
         # TYPE kladograph_branches_failed_total counter\n\
         kladograph_branches_failed_total {}\n",
        started, completed, failed
    )
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let app_cfg = AppConfig::load(args.config.as_ref())?;
    let mut cfg = ClusterConfig::from_env();
    if let Some(k) = app_cfg.k {
        cfg.k = k;
    }
    if let Some(ms) = app_cfg.recheck_delay_ms {
        cfg.recheck_delay = std::time::Duration::from_millis(ms);
    }
    if let Some(ms) = app_cfg.follower_wait_min_ms {
        cfg.follower_wait_min = std::time::Duration::from_millis(ms);
    }
    if let Some(ms) = app_cfg.follower_wait_max_ms {
        cfg.follower_wait_max = std::time::Duration::from_millis(ms);
    }
    if let Some(depth) = app_cfg.max_depth {
        cfg.max_depth = depth;
    }

    let conn = Arc::new(ArkeConnection::connect_from_env()?);
    let llm = Arc::new(LlmClient::from_env()?);
    let pipeline = Pipeline::new(Arc::clone(&conn), llm, cfg.clone(), StageIds::from_env());

    let port = app_cfg.port.unwrap_or(8085);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::clone(&pipeline.metrics));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics server listening on {}", addr);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let rhiza_id =
        std::env::var("SCATTER_KG_RHIZA").unwrap_or_else(|_| "local-run".to_string());
    let started = pipeline
        .run_scatter(
            &rhiza_id,
            &args.target_entity,
            &args.target_collection,
            &args.entity_ids,
        )
        .await?;
    info!(
        "scatter {} started, polling {} for completion",
        started.job_id, started.job_collection
    );

    let observer = Observer::new(&conn);
    let done = observer
        .wait_for_completion(&started.job_collection, cfg.poll_interval, cfg.poll_timeout)
        .await?;
    pipeline.log_writer().flush().await;

    let (b_started, b_completed, b_failed) = pipeline.metrics.snapshot();
    println!(
        "job {} complete={} branches started={} completed={} failed={}",
        started.job_id, done, b_started, b_completed, b_failed
    );
    if !done {
        std::process::exit(1);
    }
    Ok(())
}
