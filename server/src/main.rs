use clap::Parser;
use tracing::Level;

mod ai;
mod app;
mod diff_cache;
mod directories;
mod error;
mod fs;
mod git;
mod idle_monitor;
mod pane;
mod path_utils;
mod pty;
mod registry;
mod session_manager;
mod settings;
mod state;
mod store;
mod ws;

#[cfg(test)]
mod test_support;

use app::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let args = Args::parse();
    app::run(args).await
}
