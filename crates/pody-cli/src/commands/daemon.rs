//! `pody daemon`: Reconcile pod status and sample usage periodically.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use pody_core::service::PodyService;

use super::Context;

/// Arguments for the `daemon` command.
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Seconds between ticks; defaults to `sample_interval_secs` from the
    /// configuration.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Run a single tick and exit.
    #[arg(long)]
    pub once: bool,
}

/// Executes the `daemon` command.
///
/// # Errors
///
/// Returns an error if the async runtime cannot start or the signal
/// handler cannot be installed.
pub fn execute(ctx: Context, args: &DaemonArgs) -> anyhow::Result<()> {
    let service = Arc::new(ctx.service);
    if args.once {
        tick(&service);
        return Ok(());
    }
    let secs = args
        .interval
        .unwrap_or(service.config().sample_interval_secs)
        .max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(service, Duration::from_secs(secs)))
}

async fn run(service: Arc<PodyService>, period: Duration) -> anyhow::Result<()> {
    tracing::info!(period_secs = period.as_secs(), "daemon started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let svc = Arc::clone(&service);
                if let Err(e) = tokio::task::spawn_blocking(move || tick(&svc)).await {
                    tracing::error!(error = %e, "daemon tick panicked");
                }
            }
            res = &mut shutdown => {
                res?;
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

/// One reconcile and sampling pass. Failures are logged; the next tick
/// retries.
fn tick(service: &PodyService) {
    let changed = service.reconcile();
    match service.sample_usage(chrono::Utc::now().timestamp()) {
        Ok(samples) => tracing::debug!(changed, samples, "daemon tick"),
        Err(e) => tracing::warn!(changed, error = %e, "usage sampling failed"),
    }
}
