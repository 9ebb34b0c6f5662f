//! loam agent
//!
//! Reconciles a declarative set of pod manifests against the local init
//! system, gated by a metadata constraint manager.
//!
//! ## Architecture
//!
//! - **Recovery**: rebuilds the allocation set from the unit directories
//! - **Evaluator**: diffs desired pods against allocations and executes
//!   phased instruction batches
//! - **Metadata Manager**: merges node metadata and evaluates eligibility
//! - **Sink**: feeds manager outcomes into the evaluator

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loam_agent::allocation::{discover_pod_files, Recovery};
use loam_agent::config::Config;
use loam_agent::metadata::{Manager, SimpleProducer, Source, SourceConsumer, SourceMode};
use loam_agent::provision::{Evaluator, EvaluatorConfig, Sink};
use loam_agent::systemd::MockSystemd;
use loam_manifest::Constraint;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting loam agent");

    let config = Config::from_env()?;
    info!(
        agent_id = %config.agent_id,
        local_dir = %config.system_paths.local.display(),
        runtime_dir = %config.system_paths.runtime.display(),
        "Configuration loaded"
    );

    // Rebuild the allocation set from the unit directories. Per-file
    // failures are logged and skipped.
    let paths = config.system_paths.clone();
    let mut recovery = Recovery::scan(&paths, || discover_pod_files(&paths));
    if let Some(err) = recovery.take_error() {
        warn!(error = %err, "recovery completed with failures");
    }
    info!(pods = recovery.pods.len(), "recovery complete");

    // Init-system connection (mock until a D-Bus client is wired in).
    let conn = Arc::new(MockSystemd::new());

    // The environment active at boot; recovered pods rendered under a
    // different environment are reported dirty.
    let mut boot_env = BTreeMap::from([
        ("agent.id".to_string(), config.agent_id.clone()),
        ("agent.pod_exec".to_string(), config.pod_exec.clone()),
        ("agent.drain".to_string(), "false".to_string()),
    ]);
    for (key, value) in &config.meta {
        boot_env.insert(format!("meta.{key}"), value.clone());
    }

    let evaluator = Arc::new(Evaluator::new(
        conn,
        EvaluatorConfig {
            system_paths: config.system_paths.clone(),
            recovery: recovery.pods,
            boot_env,
            status: Arc::new(loam_bus::Blackhole),
        },
    ));

    let manager = Arc::new(Manager::new(vec![
        Source::new(
            "agent",
            SourceMode::Merged,
            Some(Constraint::from_iter([("${agent.drain}", "!= true")])),
            &["private", "public"],
        ),
        Source::new("meta", SourceMode::Merged, None, &["private", "public"]),
    ]));

    let _sink = Sink::new(evaluator, manager.clone());

    let agent_producer = SimpleProducer::new("agent", vec![manager_consumer(&manager)]);
    let meta_producer = SimpleProducer::new("meta", vec![manager_consumer(&manager)]);

    agent_producer.replace(BTreeMap::from([
        ("id".to_string(), config.agent_id.clone()),
        ("pod_exec".to_string(), config.pod_exec.clone()),
        ("drain".to_string(), "false".to_string()),
    ]));
    meta_producer.replace(config.meta.clone());

    // Desired pods arrive from external registries through `Sink::sync`;
    // until then the agent holds the recovered state.
    tokio::signal::ctrl_c().await?;
    info!("Agent shutdown complete");
    Ok(())
}

fn manager_consumer(manager: &Arc<Manager>) -> SourceConsumer {
    let manager = manager.clone();
    Box::new(move |message| manager.sync(message))
}
