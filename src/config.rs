use std::fmt;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// A single replica address within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `partitions: ordered sequence of Shard`, each an ordered sequence of
/// `Endpoint`. Deserialized directly from the JSON literal passed as the
/// third CLI argument, replacing the source's `eval()` of a Python literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTable {
    shards: Vec<Vec<Endpoint>>,
}

/// `(shardIndex, replicaIndex)` identity of a replica within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaId {
    pub shard: usize,
    pub replica: usize,
}

impl PartitionTable {
    /// Parses the literal partition-table argument. Accepts either a JSON
    /// array of arrays of `Endpoint` objects, or the more compact
    /// `[["host:port", ...], ...]` form used by the CLI examples in this
    /// repo's README-equivalent usage strings.
    pub fn parse(literal: &str) -> Result<Self> {
        if let Ok(shards) = serde_json::from_str::<Vec<Vec<Endpoint>>>(literal) {
            return Ok(PartitionTable { shards });
        }
        let compact: Vec<Vec<String>> = serde_json::from_str(literal)
            .map_err(|e| RaftError::InvalidPartitionTable(e.to_string()))?;
        let shards = compact
            .into_iter()
            .map(|shard| {
                shard
                    .into_iter()
                    .map(|addr| parse_host_port(&addr))
                    .collect::<Result<Vec<Endpoint>>>()
            })
            .collect::<Result<Vec<Vec<Endpoint>>>>()?;
        Ok(PartitionTable { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &[Endpoint] {
        &self.shards[index]
    }

    pub fn shards(&self) -> &[Vec<Endpoint>] {
        &self.shards
    }

    /// Finds this process's own `(shardIndex, replicaIndex)` by matching
    /// `host`/`port` against every entry in the table, mirroring
    /// `raft.py.__init__`'s scan over `self.partitions`.
    pub fn locate(&self, host: &str, port: u16) -> Option<ReplicaId> {
        for (i, shard) in self.shards.iter().enumerate() {
            for (j, endpoint) in shard.iter().enumerate() {
                if endpoint.host == host && endpoint.port == port {
                    return Some(ReplicaId { shard: i, replica: j });
                }
            }
        }
        None
    }
}

fn parse_host_port(addr: &str) -> Result<Endpoint> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RaftError::InvalidPartitionTable(format!("not host:port: {addr}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RaftError::InvalidPartitionTable(format!("bad port: {addr}")))?;
    Ok(Endpoint::new(host, port))
}

/// Positional CLI arguments per the wire spec's "Process invocation": bind
/// host, TCP port, and the whole partition table as a literal.
#[derive(Debug, Parser)]
#[command(name = "raftkv", about = "Sharded, leader-lease replicated key-value store")]
pub struct Cli {
    /// Host this replica binds to and is addressed by in the partition table.
    pub host: String,
    /// TCP port this replica listens on.
    pub port: u16,
    /// Partition table literal, e.g. `[["127.0.0.1:9001","127.0.0.1:9002"]]`.
    pub partitions: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_host_port_literal() {
        let table = PartitionTable::parse(r#"[["127.0.0.1:9001","127.0.0.1:9002"]]"#).unwrap();
        assert_eq!(table.shard_count(), 1);
        assert_eq!(table.shard(0)[0], Endpoint::new("127.0.0.1", 9001));
    }

    #[test]
    fn parses_structured_literal() {
        let table =
            PartitionTable::parse(r#"[[{"host":"a","port":1},{"host":"b","port":2}]]"#).unwrap();
        assert_eq!(table.shard(0)[1], Endpoint::new("b", 2));
    }

    #[test]
    fn locates_self_by_host_and_port() {
        let table = PartitionTable::parse(
            r#"[["127.0.0.1:9001","127.0.0.1:9002"],["127.0.0.1:9003"]]"#,
        )
        .unwrap();
        let id = table.locate("127.0.0.1", 9003).unwrap();
        assert_eq!(id, ReplicaId { shard: 1, replica: 0 });
        assert!(table.locate("127.0.0.1", 9999).is_none());
    }
}
