use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use raccoon_core::DenseInitializer;
use raccoon_server::{
    coordinator::{AggregationCoordinator, GroupRegistry},
    rest,
    settings::Settings,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        log: log_settings,
        coordinator: coordinator_settings,
        model: model_settings,
        groups,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let initializer = DenseInitializer::from(&model_settings);
    let registry = GroupRegistry::from_settings(&groups, &initializer).unwrap_or_else(|err| {
        error!("failed to initialize the groups: {}", err);
        process::exit(1);
    });
    info!("initialized {} groups", registry.len());
    let coordinator = Arc::new(AggregationCoordinator::new(registry, coordinator_settings));

    tokio::select! {
        result = rest::serve(api_settings, coordinator) => {
            if let Err(err) = result {
                error!("{}", err);
                process::exit(1);
            }
            warn!("shutting down: REST server terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
