mod annotations;
mod aws;
mod binding;
mod certs;
mod config;
mod controller;
mod crd;
mod deploy;
mod endpoints;
mod error;
mod group;
mod metrics;
mod model;

use clap::Parser;

use crate::{config::Settings, controller::run_controllers, crd::print_crds_without_formats};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if std::env::var("PRINT_CRD").is_ok() {
        print_crds_without_formats()?;
        return Ok(());
    }

    let settings = Settings::parse();
    run_controllers(settings).await
}
