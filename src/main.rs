//! InstaScale controller - on-demand MachineSets for AppWrapper workloads

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use instascale::config::{InstaScaleConfig, MachineSetsStrategy, SharedPoolShrink};
use instascale::controller::{error_policy, reconcile, Context};
use instascale::crd::AppWrapper;

/// InstaScale - scales OpenShift MachineSets for AppWrapper batch workloads
#[derive(Parser, Debug)]
#[command(name = "instascale", version, about, long_about = None)]
struct Cli {
    /// Print the AppWrapper CRD the controller expects and exit
    #[arg(long)]
    crd: bool,

    /// Path to a YAML configuration file
    #[arg(short = 'c', long, env = "INSTASCALE_CONFIG")]
    config: Option<PathBuf>,

    /// Pool sharing strategy (reuse or dedicated)
    #[arg(long, env = "INSTASCALE_MACHINESETS_STRATEGY")]
    strategy: Option<MachineSetsStrategy>,

    /// Ceiling on replicas across controller-managed MachineSets
    #[arg(long, env = "INSTASCALE_MAX_SCALEOUT_ALLOWED")]
    max_scaleout_allowed: Option<u32>,

    /// Namespace holding MachineSets
    #[arg(long, env = "INSTASCALE_MACHINESET_NAMESPACE")]
    namespace: Option<String>,

    /// Shared pool shrink policy on teardown (recompute or retain)
    #[arg(long, env = "INSTASCALE_SHARED_POOL_SHRINK")]
    shared_pool_shrink: Option<SharedPoolShrink>,

    /// Log output format
    #[arg(long, env = "INSTASCALE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("instascale=info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    if cli.crd {
        let crd = serde_yaml::to_string(&AppWrapper::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = load_config(&cli)?;
    run_controller(config).await
}

/// Read the config file, then apply CLI and environment overrides
fn load_config(cli: &Cli) -> anyhow::Result<InstaScaleConfig> {
    let mut config = match &cli.config {
        Some(path) => InstaScaleConfig::from_file(path)?,
        None => InstaScaleConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.machine_sets_strategy = strategy;
    }
    if let Some(ceiling) = cli.max_scaleout_allowed {
        config.max_scaleout_allowed = ceiling;
    }
    if let Some(namespace) = &cli.namespace {
        config.machine_set_namespace = namespace.clone();
    }
    if let Some(shrink) = cli.shared_pool_shrink {
        config.shared_pool_shrink = shrink;
    }
    config.validate()?;
    Ok(config)
}

async fn run_controller(config: InstaScaleConfig) -> anyhow::Result<()> {
    tracing::info!(
        strategy = %config.machine_sets_strategy,
        max_scaleout_allowed = config.max_scaleout_allowed,
        namespace = %config.machine_set_namespace,
        "InstaScale controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let appwrappers: Api<AppWrapper> = Api::all(client.clone());
    let ctx = Arc::new(Context::builder(client, config).build());

    Controller::new(appwrappers, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "AppWrapper reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "AppWrapper reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("InstaScale controller stopped");
    Ok(())
}
