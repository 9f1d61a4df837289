//! credmesh: command surface and HTTP node runtime for the credibility mesh.

use anyhow::{bail, Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use credmesh_core::{current_timestamp_ms, logging, MeshConfig};
use credmesh_crypto::Keyring;
use credmesh_trust_mesh::{
    service::KEYRING_FILE, spawn_node, verify_tenant, FederatedQuorumEngine, MeshDirectory,
    MeshInstance, MeshNode, MeshSummary, NodePaths, ReachabilityMatrix, Replicator,
    ScenarioController, ScenarioPhase,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

mod config;
mod handlers;
mod state;
mod transport;

use config::ConfigArgs;
use state::{AppState, Runtime};
use transport::HttpTransport;

/// Distributed credibility mesh
#[derive(Parser, Debug)]
#[command(name = "credmesh", version)]
#[command(about = "Federated evidence validation with partition-safe quorum and sealed outcomes")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the tenant directory, keyring and empty node logs
    Init(ConfigArgs),

    /// Run one node process that replicates with its peers over HTTP
    Node {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        node_id: String,
    },

    /// Run every node of the tenant in this process behind one HTTP surface
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
    },

    /// Drive scenario phases and print per-phase claim statuses
    Scenario {
        #[command(flatten)]
        config: ConfigArgs,
        /// baseline, partition, correlated_failure, recovery or all
        #[arg(long, default_value = "all")]
        phase: String,
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },

    /// Verify persisted logs and seal chains; exits non-zero on FAIL
    Verify(ConfigArgs),

    /// Print the tenant summary built from persisted state
    Summary(ConfigArgs),
}

pub(crate) fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/mesh/:tenant/summary", get(handlers::summary))
        .route("/mesh/:tenant/:node/push", post(handlers::push))
        .route("/mesh/:tenant/:node/pull", get(handlers::pull))
        .route("/mesh/:tenant/:node/status", get(handlers::node_status))
        .with_state(state)
        .layer(ServiceBuilder::new().into_inner())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_json {
        logging::init_json();
    } else {
        logging::init();
    }

    match cli.command {
        Command::Init(args) => init(&args.load()?),
        Command::Node { config, node_id } => run_node(config.load()?, &node_id).await,
        Command::Serve { config, listen } => serve(config.load()?, &listen).await,
        Command::Scenario {
            config,
            phase,
            cycles,
        } => scenario(config.load()?, &phase, cycles).await,
        Command::Verify(args) => verify(&args.load()?),
        Command::Summary(args) => summary(&args.load()?),
    }
}

fn init(config: &MeshConfig) -> Result<()> {
    let keyring = MeshInstance::initialize(config).context("failed to initialize tenant")?;
    let output = serde_json::json!({
        "tenant_id": config.tenant_id,
        "path": config.tenant_dir(),
        "signature_scheme": keyring.scheme,
        "nodes": keyring.node_ids().collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn serve_http(state: Arc<AppState>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, tenant_id = %state.tenant_id(), "Mesh HTTP surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn run_node(config: MeshConfig, node_id: &str) -> Result<()> {
    let spec = config
        .node(node_id)
        .with_context(|| format!("node '{}' is not configured", node_id))?;
    let listen = spec
        .listen_addr
        .clone()
        .with_context(|| format!("node '{}' has no listen_addr", node_id))?;

    let tenant_dir = config.tenant_dir();
    let keyring = Keyring::load(tenant_dir.join(KEYRING_FILE))
        .context("failed to load keyring; run `credmesh init` first")?;
    let directory = Arc::new(MeshDirectory::from_config(&config, &keyring)?);
    let engine = Arc::new(FederatedQuorumEngine::new(Arc::new(config.policy.clone()))?);
    let policy_hash = engine.policy_hash().to_string();

    let node = MeshNode::open(
        node_id,
        keyring.keypair(node_id)?,
        directory.clone(),
        engine,
        &NodePaths::for_node(&tenant_dir, node_id),
    )
    .with_context(|| format!("failed to open node '{}'", node_id))?
    .with_sync(config.sync.clone());
    let (handle, task) = spawn_node(node);

    let transport = Arc::new(HttpTransport::new(&directory, &config.replication)?);
    let mut replicator = Replicator::new(
        node_id,
        config.tenant_id.clone(),
        transport,
        &config.replication,
    );
    let reachability = ReachabilityMatrix::new().shared();
    let interval_ms = config.replication.interval_ms.max(1);

    let state = Arc::new(AppState::for_node(
        config,
        directory.clone(),
        policy_hash,
        handle.clone(),
        reachability.clone(),
    ));
    let server = tokio::spawn({
        let state = state.clone();
        async move { serve_http(state, &listen).await }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let matrix = reachability.read().await.clone();
                let round = replicator.run_round(&handle, &directory, &matrix).await;
                if let Err(e) = handle.step(current_timestamp_ms()).await {
                    error!(node_id = %node_id, error = %e, "Node step failed");
                    break;
                }
                debug!(
                    node_id = %node_id,
                    pushed = round.pushed,
                    pulled = round.pulled,
                    live_peers = round.live_peers.len(),
                    "Replication round complete"
                );
            }
        }
    }

    server.abort();
    let _ = handle.shutdown().await;
    task.await.context("node task ended abnormally")?;
    info!(node_id = %node_id, "Node stopped");
    Ok(())
}

async fn serve(config: MeshConfig, listen: &str) -> Result<()> {
    MeshInstance::initialize(&config).context("failed to initialize tenant")?;
    let interval = Duration::from_millis(config.replication.interval_ms.max(1));
    let mesh = MeshInstance::open(config)
        .await
        .context("failed to open mesh instance")?;
    let state = Arc::new(AppState::for_mesh(mesh));
    let Runtime::Mesh(mesh) = &state.runtime else {
        bail!("serve requires an in-process mesh");
    };
    let mesh = mesh.clone();

    let server = tokio::spawn({
        let state = state.clone();
        let listen = listen.to_string();
        async move { serve_http(state, &listen).await }
    });

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match mesh.lock().await.run_cycle().await {
                    Ok(report) if !report.step_failures.is_empty() => {
                        warn!(
                            cycle = report.cycle,
                            failed_nodes = ?report.step_failures.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                            "Cycle completed with failed nodes"
                        );
                    }
                    Ok(_) => {}
                    // Retried on the next tick
                    Err(e) => error!(error = %e, "Cycle failed"),
                }
            }
        }
    }

    server.abort();
    let _ = server.await;
    drop(state);
    match Arc::try_unwrap(mesh) {
        Ok(mesh) => mesh.into_inner().shutdown().await,
        Err(_) => info!("Mesh still referenced at exit; node tasks end with the runtime"),
    }
    Ok(())
}

async fn scenario(config: MeshConfig, phase: &str, cycles: usize) -> Result<()> {
    let phases: Vec<ScenarioPhase> = if phase == "all" {
        ScenarioPhase::ALL.to_vec()
    } else {
        vec![phase.parse()?]
    };

    MeshInstance::initialize(&config).context("failed to initialize tenant")?;
    let mut mesh = MeshInstance::open(config)
        .await
        .context("failed to open mesh instance")?;
    let mut reports = Vec::with_capacity(phases.len());
    {
        let mut controller = ScenarioController::new(&mut mesh)?.with_cycles(cycles);
        for phase in phases {
            reports.push(controller.run(phase).await?);
        }
    }
    mesh.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn verify(config: &MeshConfig) -> Result<()> {
    let report = verify_tenant(config).context("verification could not run")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        bail!("verification FAIL for tenant '{}'", config.tenant_id);
    }
    Ok(())
}

fn summary(config: &MeshConfig) -> Result<()> {
    let summary = MeshSummary::from_disk(config).context("failed to build summary")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
