//! rowfarm binary: run the master or a worker.

mod args;

use std::io::{self, Write};
use std::process;

use anyhow::{Context, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rowfarm::{
    Assembly, Dispatcher, MasterConfig, Matrix, Roster, RowStatus, WorkerConfig, WorkerService,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::args::{Command, MasterArgs, USAGE, WorkerArgs, parse_args};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(command) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async {
        match command {
            Command::Master(args) => run_master(args).await,
            Command::Worker(args) => run_worker(args).await,
        }
    })
}

/// `RUST_LOG` wins; otherwise `ROWFARM_LOG` picks the level for our own targets.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("ROWFARM_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("rowfarm={level},rowfarm_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let mut config = MasterConfig::from_env().context("invalid master configuration")?;
    if let Some(size) = args.size {
        config.matrix_size = size;
    }
    config.validate()?;

    let roster = Roster::parse(&args.workers, config.default_port)?;
    let (a, b) = load_inputs(&args, config.matrix_size)?;
    tracing::info!(
        size = b.rows(),
        workers = roster.len(),
        verify_index = config.verify_index,
        version = rowfarm::ROWFARM_VERSION,
        "Master starting"
    );

    let dispatcher = Dispatcher::new(roster, config);
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::warn!("Interrupted, cancelling remaining rows");
            cancel.cancel();
        }
    });

    let table = dispatcher.dispatch_with_cancel(&a, &b, &cancel).await;
    interrupt.abort();
    let Assembly { matrix, report } = table?.assemble();

    let failed = report.failed_rows();
    if failed.is_empty() {
        tracing::info!(rows = report.size, "All rows completed");
    } else {
        tracing::warn!(
            completed = report.completed(),
            failed = failed.len(),
            rows = ?failed,
            "Some rows failed and were filled with zeros"
        );
    }

    if args.verify {
        let expected = a.multiply(&b).context("local multiplication failed")?;
        let max_diff = report
            .rows
            .iter()
            .filter(|r| r.status == RowStatus::Completed)
            .filter_map(|r| Some((matrix.row(r.index)?, expected.row(r.index)?)))
            .flat_map(|(got, want)| got.iter().zip(want).map(|(g, w)| (g - w).abs()))
            .fold(0.0_f64, f64::max);
        tracing::info!(
            max_abs_diff = max_diff,
            rows_checked = report.completed(),
            "Verified against local product"
        );
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Report written");
    }

    match &args.output {
        Some(path) => {
            matrix
                .save_to_file(path)
                .with_context(|| format!("failed to write result to {}", path.display()))?;
            tracing::info!(path = %path.display(), "Result written");
        }
        None => {
            let mut stdout = io::stdout().lock();
            matrix.write_to(&mut stdout)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// A and B from files, or random N×N matrices.
fn load_inputs(args: &MasterArgs, size: usize) -> anyhow::Result<(Matrix, Matrix)> {
    if let Some((path_a, path_b)) = &args.matrices {
        let a = Matrix::load_from_file(path_a)
            .with_context(|| format!("failed to load {}", path_a.display()))?;
        let b = Matrix::load_from_file(path_b)
            .with_context(|| format!("failed to load {}", path_b.display()))?;
        if !b.is_square() || a.rows() != b.rows() || a.cols() != b.cols() {
            bail!(
                "input matrices must both be N×N, got {}x{} and {}x{}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols()
            );
        }
        return Ok((a, b));
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let a = Matrix::random(size, size, &mut rng);
    let b = Matrix::random(size, size, &mut rng);
    Ok((a, b))
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_env().context("invalid worker configuration")?;
    if let Some(host) = args.bind {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    config.validate()?;

    let service = WorkerService::bind(config).await?;
    service.run_until(shutdown_signal()).await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
