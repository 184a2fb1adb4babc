//! CCE controller - managed-Kubernetes cluster lifecycle reconciler

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::try_join_all;
use kube::{CustomResourceExt, ResourceExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use cce_controller::config::ControllerConfig;
use cce_controller::controller::{Context, Scheduler};
use cce_controller::crd::{validate_submission, Cluster, ClusterPhase};
use cce_controller::orchestrator;
use cce_controller::provisioner::SimulatedProvisioner;
use cce_controller::service::{prepare_submission, ClusterService};
use cce_controller::status::{ChannelSink, PhaseChange};
use cce_controller::store::{MemoryStore, SpecStore};
use cce_controller::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// CCE controller - reconciles managed-Kubernetes clusters toward their spec
#[derive(Parser, Debug)]
#[command(name = "cce-controller", version, about, long_about = None)]
struct Cli {
    /// Print the Cluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, value_enum, env = "CCE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate cluster manifests without reconciling them
    Validate {
        /// Cluster YAML files; each may hold several documents
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the provisioning plan of a cluster manifest
    Plan {
        /// Cluster YAML file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },

    /// Reconcile cluster manifests against the simulated IaaS provisioner
    ///
    /// Submits every cluster, waits until each one is running or failed and
    /// optionally deletes them again.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cluster YAML files; each may hold several documents
    #[arg(short = 'f', long = "file", required = true)]
    files: Vec<PathBuf>,

    /// Controller configuration (TOML)
    #[arg(long, env = "CCE_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of parallel reconciles
    #[arg(long, env = "CCE_WORKERS")]
    workers: Option<usize>,

    /// Delay of every simulated provisioner call, in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Delete every cluster once it settled
    #[arg(long)]
    delete: bool,

    /// Give up after this many seconds
    #[arg(long, default_value = "600")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..TelemetryConfig::default()
    })?;

    match cli.command {
        Some(Commands::Validate { files }) => run_validate(&files).await,
        Some(Commands::Plan { file }) => run_plan(&file).await,
        Some(Commands::Run(args)) => run_controller(args).await,
        None => {
            eprintln!("nothing to do; pass --crd or a subcommand (see --help)");
            Ok(())
        }
    }
}

/// Read every Cluster document from a YAML file
async fn load_clusters(path: &Path) -> anyhow::Result<Vec<Cluster>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut clusters = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&content) {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if value.is_null() {
            continue;
        }
        let cluster: Cluster = serde_yaml::from_value(value)
            .with_context(|| format!("Failed to parse Cluster in {}", path.display()))?;
        if cluster.metadata.name.is_none() {
            anyhow::bail!("Cluster in {} must have metadata.name", path.display());
        }
        clusters.push(cluster);
    }
    Ok(clusters)
}

async fn load_all(files: &[PathBuf]) -> anyhow::Result<Vec<Cluster>> {
    let mut clusters = Vec::new();
    for file in files {
        clusters.extend(load_clusters(file).await?);
    }
    Ok(clusters)
}

/// Validate manifests; exits non-zero when any is invalid
async fn run_validate(files: &[PathBuf]) -> anyhow::Result<()> {
    let clusters = load_all(files).await?;
    let mut invalid = 0;

    for cluster in &clusters {
        let name = cluster.name_any();
        match validate_submission(&name, &cluster.spec) {
            Ok(()) => println!("{name}: valid"),
            Err(e) => {
                invalid += 1;
                println!("{name}: invalid");
                for violation in e.violations() {
                    println!("  - {violation}");
                }
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} clusters are invalid", clusters.len());
    }
    Ok(())
}

/// Print the tasks a cluster would be provisioned with
async fn run_plan(file: &Path) -> anyhow::Result<()> {
    for cluster in load_clusters(file).await? {
        let name = cluster.name_any();
        let spec = prepare_submission(&name, cluster.spec)?;

        let preview_id = format!("{}preview", cce_controller::CCE_PREFIX);
        let plan = orchestrator::plan(&preview_id, &spec);
        println!("# {name}");
        println!("{}", serde_yaml::to_string(&plan)?);
    }
    Ok(())
}

/// Run the controller until every submitted cluster has settled
async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path).await?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }

    let clusters = load_all(&args.files).await?;
    info!(clusters = clusters.len(), workers = config.workers, "starting controller");

    let store = Arc::new(MemoryStore::new());
    let provisioner =
        Arc::new(SimulatedProvisioner::new().with_latency(Duration::from_millis(args.latency_ms)));
    let sink = Arc::new(ChannelSink::new(256));
    let changes = sink.subscribe();

    let ctx = Arc::new(
        Context::builder(store.clone(), store.clone(), provisioner.clone(), provisioner.clone())
            .config(config)
            .sink(sink)
            .build(),
    );
    let scheduler = Scheduler::new(ctx);
    let service = ClusterService::new(store.clone(), store.clone()).with_scheduler(scheduler.clone());
    let printer = tokio::spawn(print_changes(changes));

    let names: Vec<String> = clusters.iter().map(|c| c.name_any()).collect();
    let submissions = clusters
        .into_iter()
        .zip(&names)
        .map(|(cluster, name)| service.submit(name, cluster.spec));
    try_join_all(submissions)
        .await
        .context("Failed to submit clusters")?;

    let timeout = Duration::from_secs(args.timeout_secs);
    let outcome = tokio::select! {
        result = run_lifecycle(&service, store.as_ref(), &names, args.delete) => result,
        _ = tokio::time::sleep(timeout) => Err(anyhow::anyhow!("timed out after {}s", args.timeout_secs)),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping at the next checkpoint");
            Ok(())
        }
    };

    scheduler.shutdown().await;
    service.record_phase_counts().await?;
    printer.abort();

    for cluster in store.list_clusters().await? {
        println!("{}: {}", cluster.name_any(), cluster.phase());
    }
    info!(live_resources = provisioner.live_resources(), "controller stopped");
    outcome
}

async fn run_lifecycle(
    service: &ClusterService,
    store: &MemoryStore,
    names: &[String],
    delete: bool,
) -> anyhow::Result<()> {
    wait_for(store, names, |phase| {
        matches!(phase, Some(ClusterPhase::Running | ClusterPhase::CreateFailed))
    })
    .await?;

    if !delete {
        return Ok(());
    }
    let mut deleting = Vec::new();
    for name in names {
        match service.delete(name).await {
            Ok(_) => deleting.push(name.clone()),
            Err(e) => warn!(cluster = %name, error = %e, "delete rejected"),
        }
    }
    wait_for(store, &deleting, |phase| {
        matches!(phase, None | Some(ClusterPhase::DeleteFailed))
    })
    .await
}

/// Poll the store until `settled` holds for every named cluster
///
/// A cluster missing from the store is reported as `None`.
async fn wait_for(
    store: &MemoryStore,
    names: &[String],
    settled: impl Fn(Option<ClusterPhase>) -> bool,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let mut done = true;
        for name in names {
            let phase = match store.get_cluster(name).await {
                Ok(cluster) => Some(cluster.phase()),
                Err(cce_controller::Error::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            done &= settled(phase);
        }
        if done {
            return Ok(());
        }
    }
}

async fn print_changes(mut changes: broadcast::Receiver<PhaseChange>) {
    loop {
        match changes.recv().await {
            Ok(change) if change.old_phase != change.new_phase => {
                println!("{}: {} -> {}", change.cluster, change.old_phase, change.new_phase);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "phase change printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
