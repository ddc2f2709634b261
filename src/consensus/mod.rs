mod peer;

use std::collections::HashSet;
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::commit_log::{CommitLog, Entry, LogIndex};
use crate::config::{Endpoint, PartitionTable, ReplicaId};
use crate::kv::Kv;
use crate::wire::Message;

use peer::{AppendReqPayload, PeerHandle, VoteReqPayload};

/// Time between leader-loop ticks: how often a LEADER re-evaluates lease
/// expiry and fires another replication round. Short enough that
/// `wait_for_commit` below doesn't add noticeable client-visible latency.
const LEADER_TICK: Duration = Duration::from_millis(20);
/// Tick for the election-timeout watcher thread.
const ELECTION_WATCHER_TICK: Duration = Duration::from_millis(20);
/// Per-outbound-RPC timeout (SPEC_FULL.md §4.3).
const RPC_TIMEOUT: Duration = Duration::from_millis(3000);
/// Fixed lease duration (SPEC_FULL.md §4.3).
const LEASE_DURATION_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct ReplicaState {
    role: Role,
    current_term: u64,
    voted_for: Option<usize>,
    leader_id: Option<usize>,
    commit_index: LogIndex,
    next_index: Vec<usize>,
    match_index: Vec<LogIndex>,
    votes: HashSet<usize>,
    election_deadline: Instant,
    lease_start: Instant,
    old_leader_lease_deadline_ms: i64,
    /// Either this replica's own lease window (while LEADER) or the
    /// window it believes the current leader holds (while FOLLOWER,
    /// derived from the `leaseMs` field of the last accepted
    /// `APPEND-REQ`). Reported back verbatim on `VOTE-REP` per §4.4.
    lease_deadline: Option<Instant>,
}

/// A single consensus participant: one replica within one shard. Owns the
/// durable log and the in-memory KV it applies committed commands to, and
/// drives its own election-timeout and leader/lease loops on background
/// threads started by `start`.
pub struct Replica {
    id: ReplicaId,
    table: PartitionTable,
    log: Arc<dyn CommitLog>,
    kv: Arc<Kv>,
    state: Mutex<ReplicaState>,
    commit_cond: Condvar,
    peers: Mutex<Vec<Option<PeerHandle>>>,
    election_period_ms: u64,
}

impl Replica {
    pub fn new(id: ReplicaId, table: PartitionTable, log: Arc<dyn CommitLog>, kv: Arc<Kv>) -> Arc<Replica> {
        let shard_size = table.shard(id.shard).len();
        let election_period_ms = rand::thread_rng().gen_range(5000..=10000);
        let now = Instant::now();
        let initial_role = if shard_size <= 1 { Role::Leader } else { Role::Follower };
        let state = ReplicaState {
            role: initial_role,
            current_term: 1,
            voted_for: None,
            leader_id: if initial_role == Role::Leader { Some(id.replica) } else { None },
            commit_index: -1,
            next_index: vec![0; shard_size],
            match_index: vec![-1; shard_size],
            votes: HashSet::new(),
            election_deadline: now,
            lease_start: now,
            old_leader_lease_deadline_ms: 0,
            lease_deadline: if initial_role == Role::Leader {
                Some(now + Duration::from_millis(LEASE_DURATION_MS))
            } else {
                None
            },
        };
        Arc::new(Replica {
            id,
            table,
            log,
            kv,
            state: Mutex::new(state),
            commit_cond: Condvar::new(),
            peers: Mutex::new(Vec::new()),
            election_period_ms,
        })
    }

    /// Spawns the peer RPC threads and the election-watcher / leader-loop
    /// background threads. Must be called once, after construction.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            reset_election_deadline(&mut state, self.election_period_ms);
        }
        let shard = self.table.shard(self.id.shard);
        let mut peers = self.peers.lock().unwrap();
        *peers = shard
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| {
                if idx == self.id.replica {
                    None
                } else {
                    Some(PeerHandle::start(idx, endpoint.clone(), Arc::clone(self), RPC_TIMEOUT))
                }
            })
            .collect();
        drop(peers);

        {
            let replica = Arc::clone(self);
            thread::spawn(move || replica.election_watcher_loop());
        }
        {
            let replica = Arc::clone(self);
            thread::spawn(move || replica.leader_loop());
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn kv(&self) -> &Arc<Kv> {
        &self.kv
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn shard_size(&self) -> usize {
        self.table.shard(self.id.shard).len()
    }

    /// The endpoint of the replica this one currently believes leads its
    /// shard, if any.
    pub fn leader_endpoint(&self) -> Option<Endpoint> {
        let state = self.state.lock().unwrap();
        state.leader_id.map(|idx| self.table.shard(self.id.shard)[idx].clone())
    }

    /// Whether this replica is still a CANDIDATE in `term`, i.e. whether a
    /// vote request for `term` is still worth retrying.
    pub(crate) fn still_candidate_for(&self, term: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.role == Role::Candidate && state.current_term == term
    }

    fn remaining_lease_ms_locked(state: &ReplicaState) -> i64 {
        match state.lease_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    deadline.duration_since(now).as_millis() as i64
                } else {
                    0
                }
            }
            None => -1,
        }
    }

    /// Appends `command` under the current term if, and only if, this
    /// replica is currently LEADER. Returns the `(index, term)` pair the
    /// caller must then wait to see committed.
    pub fn append_client_command(&self, command: &str) -> Option<(LogIndex, u64)> {
        let term = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return None;
            }
            state.current_term
        };
        match self.log.append(term, command) {
            Ok((index, term)) => Some((index, term)),
            Err(e) => {
                warn!("commit log append failed: {e}");
                None
            }
        }
    }

    /// Blocks (via condvar, not a busy loop) until `commit_index >= index`
    /// under `term`, or returns `false` the moment this replica is no
    /// longer LEADER of `term` (step-down, term change) since the entry
    /// can then never commit under this leadership.
    pub fn wait_for_commit(&self, index: LogIndex, term: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.role != Role::Leader || state.current_term != term {
                return false;
            }
            if state.commit_index >= index {
                return true;
            }
            let (guard, _timeout) =
                self.commit_cond.wait_timeout(state, Duration::from_millis(50)).unwrap();
            state = guard;
        }
    }

    /// Serves a `GET` locally iff this replica is LEADER and its lease has
    /// not expired. `Some(None)` means "leader, lease valid, key absent";
    /// `None` means the caller must forward or reply `ko` (SPEC_FULL.md
    /// §9's open-question decision: an expired lease is treated as if not
    /// leader for reads).
    pub fn try_local_read(&self, key: &str) -> Option<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return None;
        }
        let lease_valid = matches!(state.lease_deadline, Some(deadline) if Instant::now() <= deadline);
        if !lease_valid {
            return None;
        }
        drop(state);
        Some(self.kv.get(key))
    }

    fn election_watcher_loop(self: Arc<Self>) {
        loop {
            let should_elect = {
                let state = self.state.lock().unwrap();
                matches!(state.role, Role::Follower | Role::Candidate) && Instant::now() > state.election_deadline
            };
            if should_elect {
                self.start_election();
            }
            thread::sleep(ELECTION_WATCHER_TICK);
        }
    }

    fn start_election(self: &Arc<Self>) {
        let (term, last_index, last_term) = {
            let mut state = self.state.lock().unwrap();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id.replica);
            state.votes.clear();
            state.votes.insert(self.id.replica);
            state.old_leader_lease_deadline_ms = 0;
            reset_election_deadline(&mut state, self.election_period_ms);
            let (last_index, last_term) = self.log.get_last_index_term();
            info!("node {} starting election for term {}", self.id.replica, state.current_term);
            (state.current_term, last_index, last_term)
        };
        let peers = self.peers.lock().unwrap();
        for peer in peers.iter().flatten() {
            peer.request_vote(VoteReqPayload {
                term,
                candidate_id: self.id.replica,
                last_log_term: last_term,
                last_log_index: last_index,
            });
        }
    }

    /// Receiver side of `VOTE-REQ` (SPEC_FULL.md §4.4 "Vote granting").
    pub fn process_vote_request(&self, candidate: usize, term: u64, last_term: u64, last_index: LogIndex) -> Message {
        let mut state = self.state.lock().unwrap();
        if term > state.current_term {
            step_down_locked(&mut state, term, self.election_period_ms);
        }
        let (self_last_index, self_last_term) = self.log.get_last_index_term();
        let log_up_to_date =
            last_term > self_last_term || (last_term == self_last_term && last_index >= self_last_index);
        let can_vote = matches!(state.voted_for, None) || state.voted_for == Some(candidate);

        if term == state.current_term && can_vote && log_up_to_date {
            state.voted_for = Some(candidate);
            state.role = Role::Follower;
            reset_election_deadline(&mut state, self.election_period_ms);
            debug!("node {} granted vote to {} in term {}", self.id.replica, candidate, term);
        } else {
            debug!("node {} denied vote to {} in term {}", self.id.replica, candidate, term);
        }

        let old_lease_ms = Self::remaining_lease_ms_locked(&state);
        Message::VoteRep {
            voter_id: self.id.replica,
            term: state.current_term,
            voted_for: state.voted_for.map(|v| v as i64).unwrap_or(-1),
            old_leader_lease_ms: old_lease_ms,
        }
    }

    /// Called by a peer thread after it receives a `VOTE-REP`.
    pub(crate) fn handle_vote_reply(self: &Arc<Self>, voter: usize, term: u64, voted_for: i64, old_lease_ms: i64) {
        let became_leader_wait = {
            let mut state = self.state.lock().unwrap();
            if term > state.current_term {
                step_down_locked(&mut state, term, self.election_period_ms);
                return;
            }
            if state.role != Role::Candidate || term != state.current_term {
                return;
            }
            if voted_for == self.id.replica as i64 {
                state.votes.insert(voter);
                state.old_leader_lease_deadline_ms = state.old_leader_lease_deadline_ms.max(old_lease_ms);
            }
            let majority = state.votes.len() * 2 > self.shard_size();
            if !majority {
                None
            } else {
                state.role = Role::Leader;
                state.leader_id = Some(self.id.replica);
                let (last_index, _) = self.log.get_last_index_term();
                let n = self.shard_size();
                state.next_index = vec![(last_index + 1).max(0) as usize; n];
                state.match_index = vec![-1; n];
                info!("node {} became leader for term {}", self.id.replica, state.current_term);
                Some(state.old_leader_lease_deadline_ms)
            }
        };
        if let Some(wait_ms) = became_leader_wait {
            self.become_leader(wait_ms);
        }
    }

    /// SPEC_FULL.md §4.5: wait out the old leader's lease, anchor the new
    /// term with a no-op entry, then start this leader's own lease.
    fn become_leader(&self, old_leader_wait_ms: i64) {
        if old_leader_wait_ms > 0 {
            info!("node {} waiting {}ms for old leader lease to expire", self.id.replica, old_leader_wait_ms);
            thread::sleep(Duration::from_millis(old_leader_wait_ms as u64));
        }
        let term = self.state.lock().unwrap().current_term;
        if let Err(e) = self.log.append(term, &format!("NO-OP {term}")) {
            warn!("failed to append no-op entry: {e}");
        }
        let mut state = self.state.lock().unwrap();
        state.lease_start = Instant::now();
        state.lease_deadline = Some(state.lease_start + Duration::from_millis(LEASE_DURATION_MS));
    }

    fn leader_loop(self: Arc<Self>) {
        loop {
            let is_leader = self.state.lock().unwrap().role == Role::Leader;
            if is_leader {
                let lease_expired = {
                    let state = self.state.lock().unwrap();
                    Instant::now().duration_since(state.lease_start) > Duration::from_millis(LEASE_DURATION_MS)
                };
                if lease_expired {
                    self.renew_lease_or_step_down();
                } else {
                    let acked = self.append_entries_round();
                    if acked {
                        self.advance_commit_index();
                    }
                }
            }
            thread::sleep(LEADER_TICK);
        }
    }

    fn renew_lease_or_step_down(self: &Arc<Self>) {
        let term = self.state.lock().unwrap().current_term;
        if let Err(e) = self.log.append(term, &format!("NO-OP {term}")) {
            warn!("failed to append lease-renewal no-op: {e}");
        }
        if self.append_entries_round() {
            let mut state = self.state.lock().unwrap();
            state.lease_start = Instant::now();
            state.lease_deadline = Some(state.lease_start + Duration::from_millis(LEASE_DURATION_MS));
            drop(state);
            self.advance_commit_index();
        } else {
            warn!("node {} failed to renew lease, stepping down", self.id.replica);
            self.step_down(term);
        }
    }

    pub fn step_down(&self, term: u64) {
        let mut state = self.state.lock().unwrap();
        step_down_locked(&mut state, term, self.election_period_ms);
    }

    /// SPEC_FULL.md §4.6: dispatch `APPEND-REQ` to every peer in parallel
    /// and block until enough peers have acked that, together with the
    /// leader's own copy, a strict majority of the whole shard holds the
    /// entry — without waiting on stragglers.
    fn append_entries_round(&self) -> bool {
        let n = self.shard_size();
        if n <= 1 {
            return true;
        }
        let (term, commit_index, next_index) = {
            let state = self.state.lock().unwrap();
            (state.current_term, state.commit_index, state.next_index.clone())
        };
        let (tx, rx) = channel::<bool>();
        let peers = self.peers.lock().unwrap();
        let mut dispatched = 0usize;
        for (idx, maybe_peer) in peers.iter().enumerate() {
            if let Some(peer) = maybe_peer {
                let payload = self.build_append_payload(term, commit_index, next_index[idx]);
                peer.append_entries(payload, Some(tx.clone()));
                dispatched += 1;
            }
        }
        drop(peers);
        if dispatched == 0 {
            return true;
        }
        // `dispatched` is the peer count excluding self (shard_size - 1). The
        // leader's own copy already counts as one vote toward the majority,
        // so only `dispatched / 2` further acks are needed, matching
        // `raft.py.append_entries`'s `cnts > len(partitions)/2.0 - 1`.
        let need = dispatched / 2;
        let deadline = Instant::now() + RPC_TIMEOUT + Duration::from_millis(500);
        let mut acked = 0usize;
        while acked < need {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(true) => acked += 1,
                Ok(false) => {}
                Err(_) => break,
            }
        }
        acked >= need
    }

    fn build_append_payload(&self, term: u64, commit_index: LogIndex, next_index: usize) -> AppendReqPayload {
        let prev_index = next_index as LogIndex - 1;
        let prev_term = self.term_at(prev_index);
        let entries = self.log.read_from(prev_index + 1);
        AppendReqPayload {
            leader_id: self.id.replica,
            term,
            prev_index,
            prev_term,
            entries,
            commit_index,
            lease_duration_ms: LEASE_DURATION_MS,
        }
    }

    fn term_at(&self, index: LogIndex) -> u64 {
        if index < 0 {
            return 0;
        }
        self.log.read_range(index, index).first().map(|e| e.term).unwrap_or(0)
    }

    /// Advances `commit_index` to the log's current end and applies every
    /// newly committed command to `self.kv`. This is the leader's only path
    /// for getting its own writes into the KV (followers apply during log
    /// repair in `process_append_request`).
    fn advance_commit_index(&self) {
        let (last_index, _) = self.log.get_last_index_term();
        let newly_committed = {
            let mut state = self.state.lock().unwrap();
            if last_index <= state.commit_index {
                return;
            }
            let committed = self.log.read_range(state.commit_index + 1, last_index);
            state.commit_index = last_index;
            committed
        };
        for entry in &newly_committed {
            apply_command_to_kv(&self.kv, &entry.command);
        }
        self.commit_cond.notify_all();
    }

    /// Called by a peer thread after it receives an `APPEND-REP`.
    pub(crate) fn handle_append_reply(&self, peer_idx: usize, term: u64, success: bool, matched_index: LogIndex) {
        let retry_payload = {
            let mut state = self.state.lock().unwrap();
            if term > state.current_term {
                step_down_locked(&mut state, term, self.election_period_ms);
                return;
            }
            if state.role != Role::Leader || term != state.current_term {
                return;
            }
            if success {
                state.next_index[peer_idx] = (matched_index + 1).max(0) as usize;
                state.match_index[peer_idx] = matched_index;
                None
            } else {
                state.next_index[peer_idx] = state.next_index[peer_idx].saturating_sub(1);
                let payload = self.build_append_payload(state.current_term, state.commit_index, state.next_index[peer_idx]);
                Some(payload)
            }
        };
        if let Some(payload) = retry_payload {
            if let Some(peer) = self.peers.lock().unwrap().get(peer_idx).and_then(|p| p.as_ref()) {
                peer.append_entries(payload, None);
            }
        }
    }

    /// Receiver side of `APPEND-REQ` (SPEC_FULL.md §4.7).
    pub fn process_append_request(
        &self,
        leader: usize,
        term: u64,
        prev_index: LogIndex,
        prev_term: u64,
        entries: Vec<Entry>,
        leader_commit_index: LogIndex,
        lease_ms: u64,
    ) -> Message {
        let current_term = {
            let mut state = self.state.lock().unwrap();
            reset_election_deadline(&mut state, self.election_period_ms);
            if term > state.current_term {
                step_down_locked(&mut state, term, self.election_period_ms);
            }
            if term < state.current_term {
                return Message::AppendRep {
                    follower_id: self.id.replica,
                    term: state.current_term,
                    success: false,
                    matched_index: 0,
                };
            }
            state.leader_id = Some(leader);
            state.role = Role::Follower;
            state.lease_deadline = Some(Instant::now() + Duration::from_millis(lease_ms));
            state.current_term
        };

        let self_prev_term = if prev_index < 0 { None } else { self.log.read_range(prev_index, prev_index).into_iter().next().map(|e| e.term) };
        let log_matches = prev_index < 0 || self_prev_term == Some(prev_term);
        if !log_matches {
            return Message::AppendRep {
                follower_id: self.id.replica,
                term: current_term,
                success: false,
                matched_index: 0,
            };
        }

        let (last_index, last_term) = self.log.get_last_index_term();
        let is_retransmission = !entries.is_empty()
            && entries.last().map(|e| e.term) == Some(last_term)
            && last_index == leader_commit_index;

        let matched_index = if is_retransmission {
            leader_commit_index
        } else {
            let commands: Vec<String> = entries.iter().map(|e| e.command.clone()).collect();
            match self.log.replace_from(term, &commands, prev_index + 1) {
                Ok((new_last_index, _)) => {
                    for command in &commands {
                        apply_command_to_kv(&self.kv, command);
                    }
                    new_last_index
                }
                Err(e) => {
                    warn!("log replace_from failed: {e}");
                    return Message::AppendRep {
                        follower_id: self.id.replica,
                        term: current_term,
                        success: false,
                        matched_index: 0,
                    };
                }
            }
        };

        Message::AppendRep { follower_id: self.id.replica, term: current_term, success: true, matched_index }
    }
}

fn reset_election_deadline(state: &mut ReplicaState, period_ms: u64) {
    let jitter_ms = rand::thread_rng().gen_range(period_ms..=2 * period_ms);
    state.election_deadline = Instant::now() + Duration::from_millis(jitter_ms);
}

fn step_down_locked(state: &mut ReplicaState, new_term: u64, period_ms: u64) {
    state.current_term = new_term;
    state.role = Role::Follower;
    state.voted_for = None;
    state.leader_id = None;
    reset_election_deadline(state, period_ms);
}

/// Parses a raw logged command and applies it to `kv`, matching
/// `update_state_machine` in the source (only `SET` mutates state; any
/// other command, including `NO-OP`, is a silent no-op here).
fn apply_command_to_kv(kv: &Kv, command: &str) {
    if let Ok(Message::Set { key, value, req_id }) = Message::parse(command) {
        kv.set(&key, &value, req_id);
    }
}
