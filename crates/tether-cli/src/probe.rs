//! `tether probe`: staggered tasks borrowing the shared connection.

use std::time::{Duration, Instant};

use clap::Args;
use tether_core::TetherConfig;
use tether_lease::{ReservationRegistry, WorkContext, WorkRunner};
use tether_sqlite::{SqliteConnection, SqliteError, SqliteFactory};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Number of tasks to submit.
    #[arg(long, default_value_t = 4)]
    pub tasks: usize,

    /// How long each task holds the connection.
    #[arg(long, default_value_t = 250)]
    pub work_ms: u64,

    /// Delay between consecutive task starts.
    #[arg(long, default_value_t = 100)]
    pub stagger_ms: u64,

    /// Stay alive past the grace period to watch the connection close.
    #[arg(long)]
    pub linger: bool,
}

pub async fn run(config: TetherConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let factory = SqliteFactory::from_config(&config.database);
    info!(path = %factory.path(), tasks = args.tasks, "starting probe");
    let registry = ReservationRegistry::new(factory, &config.lease);
    let runner = WorkRunner::new(registry.clone());

    // Ctrl-C tears everything down without waiting for the grace period.
    let shutdown = {
        let runner = runner.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, cancelling all tasks");
                let report = runner.cancel_all().await;
                info!(
                    cancelled = report.cancelled,
                    pending_cancelled = report.pending_cancelled,
                    resource_closed = report.resource_closed,
                    "shutdown complete"
                );
            }
        })
    };

    let work = Duration::from_millis(args.work_ms);
    let handles: Vec<_> = (0..args.tasks)
        .map(|i| {
            let delay = Duration::from_millis(args.stagger_ms * i as u64);
            runner.submit_blocking_after(delay, move |ctx| query_and_hold(&ctx, work))
        })
        .collect();

    for handle in handles {
        let id = handle.id();
        match handle.await {
            Ok(version) => println!("{id}  ok         sqlite {version}"),
            Err(e) if e.is_cancelled() => println!("{id}  cancelled"),
            Err(e) => println!("{id}  failed     {e}"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&registry.status())?);

    if args.linger {
        let wait = registry.grace_period() + Duration::from_millis(250);
        info!(?wait, "lingering past the grace period");
        tokio::time::sleep(wait).await;
        println!("{}", serde_json::to_string_pretty(&registry.status())?);
    }

    shutdown.abort();
    Ok(())
}

/// Read the SQLite version, then keep the reservation for `hold`.
fn query_and_hold(
    ctx: &WorkContext<SqliteConnection>,
    hold: Duration,
) -> Result<String, SqliteError> {
    let version: String = ctx
        .resource()
        .with_conn(|c| c.query_row("SELECT sqlite_version()", [], |r| r.get(0)))?;

    let deadline = Instant::now() + hold;
    loop {
        if ctx.is_cancelled() {
            return Err(SqliteError::Closed);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
    Ok(version)
}
