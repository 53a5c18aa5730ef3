//! `meridian`: open a node's data directory, run crash recovery, report the
//! prepared transactions it left behind, and optionally settle one of them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use meridian_common::config::MeridianConfig;
use meridian_txn::{Backend, BackendOptions, GlobalTransactionData, RedoStats, SharedStateBuilder};

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Meridian transaction node: recovery and prepared transactions")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "meridian.toml")]
    config: PathBuf,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Log filter directives, e.g. "info,meridian_txn=trace".
    #[arg(long)]
    log: Option<String>,

    /// Serve Prometheus metrics on this address while the node is open.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Keep the node open this long after recovery, refreshing gauges
    /// every second.
    #[arg(long, default_value = "0")]
    hold_secs: u64,

    /// COMMIT PREPARED this gid once recovery is done.
    #[arg(long, conflicts_with = "rollback_prepared")]
    commit_prepared: Option<String>,

    /// ROLLBACK PREPARED this gid once recovery is done.
    #[arg(long)]
    rollback_prepared: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

impl Cli {
    fn finish_request(&self) -> Option<(&str, bool)> {
        match (&self.commit_prepared, &self.rollback_prepared) {
            (Some(gid), _) => Some((gid.as_str(), true)),
            (None, Some(gid)) => Some((gid.as_str(), false)),
            (None, None) => None,
        }
    }
}

#[derive(Debug)]
struct Report {
    redo: RedoStats,
    /// Prepared transactions still open when the node shut down.
    prepared: Vec<GlobalTransactionData>,
    finished: Option<String>,
}

fn run(cli: &Cli, mut config: MeridianConfig) -> Result<Report> {
    if let Some(dir) = &cli.data_dir {
        config.wal.data_dir = dir.clone();
    }
    let data_dir = config.data_dir();
    let shared = SharedStateBuilder::new(config)
        .persistent()
        .build()
        .with_context(|| format!("opening {}", data_dir.display()))?;
    let redo = shared
        .startup_recovery()
        .with_context(|| format!("recovering {}", data_dir.display()))?;
    meridian_observability::record_redo_stats(&redo);

    for data in shared.twophase.list() {
        tracing::info!(
            "prepared {} xid {} ({} subxacts) at lsn {}, prepared at {}",
            data.gid,
            data.xid,
            data.subxids.len(),
            data.prepare_lsn,
            data.prepared_at
        );
    }

    let mut finished = None;
    if let Some((gid, commit)) = cli.finish_request() {
        let mut backend = Backend::connect(&shared, BackendOptions::default())?;
        backend
            .finish_prepared_transaction(gid, commit)
            .with_context(|| format!("finishing prepared transaction {}", gid))?;
        finished = Some(gid.to_string());
    }

    meridian_observability::record_node_metrics(&shared);
    for _ in 0..cli.hold_secs {
        std::thread::sleep(Duration::from_secs(1));
        meridian_observability::record_node_metrics(&shared);
    }

    let prepared = shared.twophase.list();
    shared.shutdown()?;
    Ok(Report {
        redo,
        prepared,
        finished,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", MeridianConfig::default().to_toml_string()?);
        return Ok(());
    }

    meridian_observability::init_tracing(cli.log.as_deref());
    let config = MeridianConfig::load(&cli.config);
    config.validate()?;

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = meridian_observability::init_metrics(addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let report = run(&cli, config)?;
    println!(
        "recovered {} records ({} commits, {} aborts, {} prepares) up to lsn {}",
        report.redo.records,
        report.redo.commits,
        report.redo.aborts,
        report.redo.prepares,
        report.redo.end_lsn
    );
    if let Some(gid) = &report.finished {
        println!("finished {}", gid);
    }
    for data in &report.prepared {
        println!("{}\t{}\t{}", data.gid, data.xid, data.prepared_at);
    }
    Ok(())
}
