//! `ottobench` - run a closed-loop autotuning experiment from JSON configs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otto_config::{ConfigBuilder, ConfigLoaderService, ConfigPaths};
use otto_core::{flatten_params, ParamDict, ParamValue};
use otto_driver::ExperimentDriver;
use otto_services::LocalExecService;

#[derive(Debug, Parser)]
#[command(
    name = "ottobench",
    about = "Closed-loop benchmark autotuning",
    version
)]
struct Args {
    /// Root environment configuration file.
    #[arg(long)]
    environment: String,

    /// Optimizer configuration file.
    #[arg(long)]
    optimizer: String,

    /// Storage configuration file; in-memory storage when omitted.
    #[arg(long)]
    storage: Option<String>,

    /// Tunable-space configuration files.
    #[arg(long = "tunables")]
    tunables: Vec<String>,

    /// Service configuration files.
    #[arg(long = "services")]
    services: Vec<String>,

    /// Global configuration file (experiment id, credentials, overrides).
    #[arg(long)]
    globals: Option<String>,

    /// Extra directories to search for config files, in order.
    #[arg(long = "config-path")]
    config_path: Vec<PathBuf>,

    /// Experiment id; may also come from the globals file.
    #[arg(long = "experiment-id")]
    experiment_id: Option<String>,

    /// Other experiment ids whose observations warm-start the optimizer.
    #[arg(long = "merge")]
    merge: Vec<String>,

    /// Override the optimizer's iteration budget.
    #[arg(long = "max-iterations")]
    max_iterations: Option<u64>,

    /// Skip tearing down the root environment on exit.
    #[arg(long = "no-teardown")]
    no_teardown: bool,

    /// Log level filter, e.g. `info` or `otto_driver=debug`.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let paths = ConfigPaths::new(&args.config_path, None);
    let builder = ConfigBuilder::new(paths.clone());

    // Global parameters, flattened to dotted names.
    let mut global_config = ParamDict::new();
    if let Some(globals) = &args.globals {
        let value = paths.load(globals)?;
        global_config = flatten_params(&value)?;
    }

    let experiment_id = args
        .experiment_id
        .clone()
        .or_else(|| {
            global_config
                .get("experiment_id")
                .and_then(ParamValue::as_str)
                .map(str::to_string)
        })
        .context("experiment id required: pass --experiment-id or set it in --globals")?;

    let tunables = builder
        .load_tunables(&args.tunables)
        .context("cannot load tunables")?;

    // Scheduler-side services are always available; config-file providers
    // shadow them where operation names overlap.
    let cancel = CancellationToken::new();
    let mut registry = otto_services::ServiceRegistry::with_cancel(cancel.clone());
    registry.register(Arc::new(ConfigLoaderService::new(paths.clone())));
    registry.register(Arc::new(LocalExecService::new(None)));
    builder
        .load_services_into(&args.services, &mut registry)
        .context("cannot load services")?;
    let registry = Arc::new(registry);

    let mut env = builder
        .load_environment(&args.environment, &global_config, &tunables, &registry)
        .context("cannot build environment")?;

    let mut optimizer_value = paths.load(&args.optimizer)?;
    if let Some(max_iterations) = args.max_iterations {
        optimizer_value["config"]["max_iterations"] = max_iterations.into();
    }
    let mut optimizer = builder
        .build_optimizer(&optimizer_value, env.tunable_params())
        .context("cannot build optimizer")?;

    let storage_value = match &args.storage {
        Some(file) => paths.load(file)?,
        None => serde_json::json!({"class": "otto.storage.memory", "config": {}}),
    };
    let storage = builder
        .build_storage(&storage_value)
        .await
        .context("cannot build storage")?;

    let driver = ExperimentDriver::new(&experiment_id, global_config)
        .with_merge(args.merge.clone())
        .with_teardown(!args.no_teardown)
        .with_cancel(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; canceling the in-flight trial");
            cancel.cancel();
        }
    });

    let best = driver
        .optimize(env.as_mut(), optimizer.as_mut(), storage.as_ref())
        .await?;
    match best {
        Some((score, tunables)) => {
            info!(score, "optimization complete");
            println!("best score: {score}");
            println!("best config: {tunables}");
            Ok(())
        }
        None => bail!("no successful trials"),
    }
}
