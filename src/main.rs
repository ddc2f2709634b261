use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use raftkv::commit_log::FileCommitLog;
use raftkv::config::{Cli, PartitionTable};
use raftkv::consensus::Replica;
use raftkv::error::RaftError;
use raftkv::kv::Kv;
use raftkv::router::Router;
use raftkv::server;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> raftkv::error::Result<()> {
    let table = PartitionTable::parse(&cli.partitions)?;
    let id = table
        .locate(&cli.host, cli.port)
        .ok_or_else(|| RaftError::UnknownEndpoint(cli.host.clone(), cli.port))?;

    let log_path = format!("commit-log-{}-{}.txt", cli.host, cli.port);
    let log = Arc::new(FileCommitLog::open(&log_path)?);
    let kv = Arc::new(Kv::new());

    let replica = Replica::new(id, table.clone(), log, kv);
    replica.start();
    info!("replica {:?} started, shard size {}", id, replica.shard_size());

    let router = Arc::new(Router::new(replica, table));
    server::serve(&cli.host, cli.port, router)?;
    Ok(())
}
