use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::commit_log::{Entry, LogIndex};
use crate::config::Endpoint;
use crate::transport;
use crate::wire::Message;

use super::Replica;

pub struct VoteReqPayload {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_term: u64,
    pub last_log_index: LogIndex,
}

pub struct AppendReqPayload {
    pub leader_id: usize,
    pub term: u64,
    pub prev_index: LogIndex,
    pub prev_term: u64,
    pub entries: Vec<Entry>,
    pub commit_index: LogIndex,
    pub lease_duration_ms: u64,
}

enum PeerCommand {
    RequestVote(VoteReqPayload),
    AppendEntries(AppendReqPayload, Option<Sender<bool>>),
    Shutdown,
}

/// One background thread per peer replica, mirroring the teacher's
/// peer-thread-plus-channel shape: the consensus loop never blocks on
/// network I/O itself, it just drops a command into this handle's queue.
pub struct PeerHandle {
    tx: Sender<PeerCommand>,
    join: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn start(peer_idx: usize, endpoint: Endpoint, replica: Arc<Replica>, timeout: Duration) -> PeerHandle {
        let (tx, rx) = channel::<PeerCommand>();
        let weak = Arc::downgrade(&replica);
        let join = thread::spawn(move || {
            let peer = Peer { idx: peer_idx, endpoint, replica: weak, timeout };
            peer.run(rx);
        });
        PeerHandle { tx, join: Some(join) }
    }

    pub fn request_vote(&self, payload: VoteReqPayload) {
        let _ = self.tx.send(PeerCommand::RequestVote(payload));
    }

    pub fn append_entries(&self, payload: AppendReqPayload, round_tx: Option<Sender<bool>>) {
        let _ = self.tx.send(PeerCommand::AppendEntries(payload, round_tx));
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(PeerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct Peer {
    idx: usize,
    endpoint: Endpoint,
    replica: Weak<Replica>,
    timeout: Duration,
}

impl Peer {
    fn run(&self, rx: std::sync::mpsc::Receiver<PeerCommand>) {
        for command in rx {
            match command {
                PeerCommand::RequestVote(payload) => self.send_request_vote(payload),
                PeerCommand::AppendEntries(payload, round_tx) => self.send_append_entries(payload, round_tx),
                PeerCommand::Shutdown => break,
            }
        }
    }

    /// Sends `VOTE-REQ`, retrying until a reply parses, this replica is no
    /// longer a candidate for `term` (step-down, new election, already
    /// elected), or the peer thread is torn down — matching `raft.py`'s
    /// `request_vote`, which loops `send_and_recv_no_retry` the same way.
    fn send_request_vote(&self, payload: VoteReqPayload) {
        let term = payload.term;
        let msg = Message::VoteReq {
            candidate_id: payload.candidate_id,
            term: payload.term,
            last_log_term: payload.last_log_term,
            last_log_index: payload.last_log_index,
        };
        let encoded = msg.encode();
        loop {
            let Some(replica) = self.replica.upgrade() else { return };
            if !replica.still_candidate_for(term) {
                return;
            }
            let reply = transport::send_and_recv_no_retry(&encoded, &self.endpoint.host, self.endpoint.port, self.timeout);
            match reply {
                Some(reply) => {
                    if let Ok(Message::VoteRep { voter_id, term, voted_for, old_leader_lease_ms }) = Message::parse(&reply) {
                        replica.handle_vote_reply(voter_id, term, voted_for, old_leader_lease_ms);
                    }
                    return;
                }
                None => debug!("peer {}: no VOTE-REP received for term {term}, retrying", self.idx),
            }
        }
    }

    /// Sends `APPEND-REQ` once (no internal retry: a dropped heartbeat is
    /// superseded by the next leader-loop tick). `round_tx`, when present,
    /// is the majority-ack channel for one `append_entries_round`; it gets
    /// exactly one `bool` regardless of how the RPC resolves.
    fn send_append_entries(&self, payload: AppendReqPayload, round_tx: Option<Sender<bool>>) {
        let Some(replica) = self.replica.upgrade() else {
            if let Some(tx) = round_tx {
                let _ = tx.send(false);
            }
            return;
        };
        let msg = Message::AppendReq {
            leader_id: payload.leader_id,
            term: payload.term,
            prev_index: payload.prev_index,
            prev_term: payload.prev_term,
            entries: payload.entries,
            commit_index: payload.commit_index,
            lease_duration_ms: payload.lease_duration_ms,
        };
        let reply = transport::send_and_recv_no_retry(&msg.encode(), &self.endpoint.host, self.endpoint.port, self.timeout);
        let mut acked = false;
        if let Some(reply) = &reply {
            if let Ok(Message::AppendRep { follower_id, term, success, matched_index }) = Message::parse(reply) {
                acked = success;
                replica.handle_append_reply(follower_id, term, success, matched_index);
            }
        } else {
            debug!("peer {}: no APPEND-REP received", self.idx);
        }
        if let Some(tx) = round_tx {
            let _ = tx.send(acked);
        }
    }
}
