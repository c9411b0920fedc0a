use clap::Parser;
use tracing::warn;

use cctp_relayer::cli::run_command;
use cctp_relayer::config::{Ctx, Env};
use cctp_relayer::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = Env::parse();
    let ctx = Ctx::load_files(&env.config, &env.secrets)?;
    setup_tracing(&ctx.log_level);

    // Metrics export is optional; the relayer runs without it.
    let metrics_guard = match ctx.metrics.as_ref().map(|metrics| metrics.setup_metrics()) {
        Some(Ok(guard)) => Some(guard),
        Some(Err(err)) => {
            warn!("Failed to set up metrics export: {err}");
            None
        }
        None => None,
    };

    let result = run_command(ctx, env.command).await;
    drop(metrics_guard);
    result
}
