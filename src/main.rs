use clap::Parser;
use ledgerwatch::application::directory::AccountDirectory;
use ledgerwatch::application::dispatcher::EventDispatcher;
use ledgerwatch::application::executor::TransferExecutor;
use ledgerwatch::application::pipeline::FraudPipeline;
use ledgerwatch::application::stats::{StatsSnapshot, TransferStats};
use ledgerwatch::application::workload::WorkloadGenerator;
use ledgerwatch::config::{BalanceRange, Cli};
use ledgerwatch::domain::event::TransferEvent;
use ledgerwatch::domain::ports::SharedLedger;
use ledgerwatch::infrastructure::in_memory::InMemoryLedger;
#[cfg(feature = "storage-postgres")]
use ledgerwatch::infrastructure::postgres::PostgresLedger;
use ledgerwatch::interfaces::ingest::server::{IngestState, router, serve};
use miette::{IntoDiagnostic, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type Feed = Option<broadcast::Receiver<TransferEvent>>;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn in_memory() -> (SharedLedger, Feed) {
    let store = InMemoryLedger::new();
    let feed = store.subscribe();
    (Arc::new(store), Some(feed))
}

async fn open_store(cli: &Cli) -> Result<(SharedLedger, Feed)> {
    match cli.connection_string() {
        #[cfg(feature = "storage-postgres")]
        Some(url) => {
            let store = PostgresLedger::connect(url, cli.max_in_flight as usize + 16)
                .await
                .into_diagnostic()?;
            Ok((Arc::new(store), None))
        }
        #[cfg(not(feature = "storage-postgres"))]
        Some(_) => {
            warn!(
                "WARNING: Persistent storage requested via DB, but 'storage-postgres' feature is not enabled. Falling back to in-memory storage."
            );
            Ok(in_memory())
        }
        None => {
            info!("using in-memory ledger store");
            Ok(in_memory())
        }
    }
}

fn report_workload(joined: std::result::Result<ledgerwatch::error::Result<StatsSnapshot>, JoinError>) {
    match joined {
        Ok(Ok(snapshot)) => info!(
            transfers = snapshot.transfers,
            suspicious = snapshot.suspicious,
            "workload finished"
        ),
        Ok(Err(e)) => error!(error = %e, "workload stopped"),
        Err(e) => error!(error = %e, "workload task failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let workload_config = cli.workload().into_diagnostic()?;
    let escalation = cli.escalation_policy().into_diagnostic()?;
    let anomaly_ttl = cli.anomaly_ttl().into_diagnostic()?;
    let (store, feed) = open_store(&cli).await?;
    let retry = cli.retry_policy();

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let directory = AccountDirectory::provision(
        Arc::clone(&store),
        cli.account_count(),
        BalanceRange::default(),
        &mut rng,
        retry,
    )
    .await
    .into_diagnostic()?;

    let stats = Arc::new(TransferStats::new());
    let executor = Arc::new(TransferExecutor::new(
        Arc::clone(&store),
        Arc::clone(&stats),
        cli.transfer_rules(),
        retry,
    ));
    let pipeline = Arc::new(FraudPipeline::new(
        Arc::clone(&store),
        cli.policy.classifier(cli.repetition_threshold),
        escalation,
        anomaly_ttl,
        retry,
    ));
    let dispatcher = EventDispatcher::new(pipeline, cli.max_in_flight);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .into_diagnostic()?;
    let app = router(IngestState {
        dispatcher: dispatcher.clone(),
        on_malformed: cli.on_malformed,
    });
    let server = tokio::spawn(serve(listener, app, shutdown_rx.clone()));

    let forwarder = match feed {
        Some(feed) if !cli.no_feed => Some(tokio::spawn(
            dispatcher.clone().forward(feed, shutdown_rx.clone()),
        )),
        _ => None,
    };

    let generator = WorkloadGenerator::new(executor, directory, workload_config, rng);
    let mut workload = tokio::spawn(generator.run(shutdown_rx.clone()));

    tokio::select! {
        joined = &mut workload => {
            report_workload(joined);
            if !cli.exit_on_complete {
                info!("serving until interrupted");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
            let _ = shutdown_tx.send(true);
            report_workload(workload.await);
        }
    }
    let _ = shutdown_tx.send(true);

    server.await.into_diagnostic()?.into_diagnostic()?;
    if let Some(forwarder) = forwarder {
        forwarder.await.into_diagnostic()?;
    }
    dispatcher.drain().await.into_diagnostic()?;

    println!("{}", stats.snapshot());
    Ok(())
}
