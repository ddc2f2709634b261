use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::config::PartitionTable;
use crate::consensus::Replica;
use crate::transport;
use crate::wire::{self, Message};

/// Per-request timeout used when forwarding a client command to the shard
/// that actually owns its key.
const FORWARD_TIMEOUT: Duration = Duration::from_millis(3000);

/// Routes one client-facing wire line to the shard responsible for its key,
/// serving it locally when this process owns that shard and forwarding it
/// otherwise. See SPEC_FULL.md §5 "Sharding" and §7 "Client-facing
/// semantics".
pub struct Router {
    replica: Arc<Replica>,
    table: PartitionTable,
}

impl Router {
    pub fn new(replica: Arc<Replica>, table: PartitionTable) -> Router {
        Router { replica, table }
    }

    /// Hashes `key` with 32-bit MurmurHash3 (x86, seed 0) and reduces it
    /// modulo the shard count, per SPEC_FULL.md §5.
    pub fn shard_of(&self, key: &str) -> usize {
        let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or(0);
        (hash as usize) % self.table.shard_count()
    }

    /// Handles one already-framed client request line (`SET`/`GET`) and
    /// returns the reply line to write back. Internal RPCs (`VOTE-*`,
    /// `APPEND-*`) are never routed here; `server.rs` dispatches those
    /// straight to the `Replica`.
    pub fn handle_line(&self, line: &str) -> String {
        match Message::parse(line) {
            Ok(Message::Set { key, value, req_id }) => self.handle_set(&key, &value, req_id),
            Ok(Message::Get { key, req_id }) => self.handle_get(&key, req_id),
            Ok(Message::VoteReq { candidate_id, term, last_log_term, last_log_index }) => self
                .replica
                .process_vote_request(candidate_id, term, last_log_term, last_log_index)
                .encode(),
            Ok(Message::AppendReq { leader_id, term, prev_index, prev_term, entries, commit_index, lease_duration_ms }) => self
                .replica
                .process_append_request(leader_id, term, prev_index, prev_term, entries, commit_index, lease_duration_ms)
                .encode(),
            Ok(Message::VoteRep { .. }) | Ok(Message::AppendRep { .. }) => wire::REPLY_INVALID_COMMAND.to_string(),
            Err(_) => wire::REPLY_INVALID_COMMAND.to_string(),
        }
    }

    fn handle_set(&self, key: &str, value: &str, req_id: u64) -> String {
        let shard = self.shard_of(key);
        if shard != self.replica.id().shard {
            return self.forward_cross_shard(shard, &Message::Set { key: key.to_string(), value: value.to_string(), req_id });
        }
        match self.replica.append_client_command(&Message::Set { key: key.to_string(), value: value.to_string(), req_id }.encode()) {
            Some((index, term)) => {
                if self.replica.wait_for_commit(index, term) {
                    wire::REPLY_OK.to_string()
                } else {
                    wire::REPLY_KO.to_string()
                }
            }
            None => self.forward_to_shard_leader(shard, &Message::Set { key: key.to_string(), value: value.to_string(), req_id }),
        }
    }

    fn handle_get(&self, key: &str, req_id: u64) -> String {
        let shard = self.shard_of(key);
        if shard != self.replica.id().shard {
            return self.forward_cross_shard(shard, &Message::Get { key: key.to_string(), req_id });
        }
        match self.replica.try_local_read(key) {
            Some(Some(value)) => value,
            Some(None) => wire::REPLY_NON_EXISTENT_KEY.to_string(),
            None => self.forward_to_shard_leader(shard, &Message::Get { key: key.to_string(), req_id }),
        }
    }

    /// Forwards, once with no retry, to whichever endpoint this replica
    /// currently believes is the leader of `shard`, falling back to `ko` on
    /// timeout/error or when it has no opinion (e.g. an election is in
    /// progress). Per SPEC_FULL.md §4.8/§7: "forward once (no retry)... on
    /// timeout or error reply `ko`; client retries."
    fn forward_to_shard_leader(&self, shard: usize, msg: &Message) -> String {
        let endpoint = if shard == self.replica.id().shard {
            self.replica.leader_endpoint()
        } else {
            None
        };
        match endpoint {
            Some(endpoint) => transport::send_and_recv_no_retry(&msg.encode(), &endpoint.host, endpoint.port, FORWARD_TIMEOUT)
                .unwrap_or_else(|| wire::REPLY_KO.to_string()),
            None => wire::REPLY_KO.to_string(),
        }
    }

    /// Forwards a client request whose key belongs to a different shard, to
    /// that shard's first replica only (with retry), which then forwards
    /// again to its own leader if needed. Mirrors `raft.py`'s
    /// `handle_commands`, which only ever contacts `self.conns[node][0]`.
    fn forward_cross_shard(&self, shard: usize, msg: &Message) -> String {
        let Some(endpoint) = self.table.shard(shard).first() else {
            warn!("cross-shard forward to shard {shard} found no replicas in the partition table");
            return wire::REPLY_KO.to_string();
        };
        transport::send_and_recv(&msg.encode(), &endpoint.host, endpoint.port, FORWARD_TIMEOUT)
            .unwrap_or_else(|| wire::REPLY_KO.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_of_is_stable_and_in_range() {
        let table = PartitionTable::parse(r#"[["a:1"],["b:2"],["c:3"]]"#).unwrap();
        let replica = test_replica(&table, 0);
        let router = Router::new(replica, table);
        let first = router.shard_of("some-key");
        let second = router.shard_of("some-key");
        assert_eq!(first, second);
        assert!(first < 3);
    }

    #[test]
    fn invalid_line_yields_invalid_command_reply() {
        let table = PartitionTable::parse(r#"[["a:1"]]"#).unwrap();
        let replica = test_replica(&table, 0);
        let router = Router::new(replica, table);
        assert_eq!(router.handle_line("BOGUS 1 2"), wire::REPLY_INVALID_COMMAND);
    }

    #[test]
    fn set_and_get_round_trip_on_singleton_shard() {
        let table = PartitionTable::parse(r#"[["a:1"]]"#).unwrap();
        let replica = test_replica(&table, 0);
        let router = Router::new(Arc::clone(&replica), table);
        let key = "k";
        let shard = router.shard_of(key);
        assert_eq!(shard, 0);
        let set_line = Message::Set { key: key.to_string(), value: "v".to_string(), req_id: 1 }.encode();
        assert_eq!(router.handle_line(&set_line), wire::REPLY_OK);
        let get_line = Message::Get { key: key.to_string(), req_id: 2 }.encode();
        assert_eq!(router.handle_line(&get_line), "v");
    }

    fn test_replica(table: &PartitionTable, replica_idx: usize) -> Arc<Replica> {
        use crate::commit_log::{CommitLog, FileCommitLog};
        use crate::config::ReplicaId;
        use crate::kv::Kv;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("raftkv-router-test-{}-{n}.log", std::process::id()));
        let log: Arc<dyn CommitLog> = Arc::new(FileCommitLog::open(&path).unwrap());
        let replica = Replica::new(ReplicaId { shard: 0, replica: replica_idx }, table.clone(), log, Arc::new(Kv::new()));
        // Needed so the leader loop actually runs and advances commit_index
        // (and applies committed commands to kv); without it `wait_for_commit`
        // would block on a condvar nothing ever notifies.
        replica.start();
        replica
    }
}
