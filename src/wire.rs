use serde::{Deserialize, Serialize};

use crate::commit_log::{Entry, LogIndex};
use crate::error::{RaftError, Result};

/// One `(term, command)` tuple as it appears inside a `logSliceLiteral`.
/// Serialized as a JSON 2-tuple; collected into a JSON array with no
/// embedded whitespace so the whole slice is one whitespace-delimited
/// token on the wire, per SPEC_FULL.md §6/§9.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WireEntry(u64, String);

pub fn encode_log_slice(entries: &[Entry]) -> String {
    let wire: Vec<WireEntry> = entries.iter().map(|e| WireEntry(e.term, e.command.clone())).collect();
    serde_json::to_string(&wire).expect("log slice of plain strings always serializes")
}

pub fn decode_log_slice(literal: &str) -> Result<Vec<Entry>> {
    let wire: Vec<WireEntry> = serde_json::from_str(literal)?;
    Ok(wire.into_iter().map(|WireEntry(term, command)| Entry { term, command }).collect())
}

/// A parsed line of the wire grammar in SPEC_FULL.md §6.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Set { key: String, value: String, req_id: u64 },
    Get { key: String, req_id: u64 },
    VoteReq { candidate_id: usize, term: u64, last_log_term: u64, last_log_index: LogIndex },
    VoteRep { voter_id: usize, term: u64, voted_for: i64, old_leader_lease_ms: i64 },
    AppendReq {
        leader_id: usize,
        term: u64,
        prev_index: LogIndex,
        prev_term: u64,
        entries: Vec<Entry>,
        commit_index: LogIndex,
        lease_duration_ms: u64,
    },
    AppendRep { follower_id: usize, term: u64, success: bool, matched_index: LogIndex },
}

impl Message {
    /// Renders this message back onto a single wire line (no trailing
    /// newline; callers append the frame terminator).
    pub fn encode(&self) -> String {
        match self {
            Message::Set { key, value, req_id } => format!("SET {key} {value} {req_id}"),
            Message::Get { key, req_id } => format!("GET {key} {req_id}"),
            Message::VoteReq { candidate_id, term, last_log_term, last_log_index } => {
                format!("VOTE-REQ {candidate_id} {term} {last_log_term} {last_log_index}")
            }
            Message::VoteRep { voter_id, term, voted_for, old_leader_lease_ms } => {
                format!("VOTE-REP {voter_id} {term} {voted_for} {old_leader_lease_ms}")
            }
            Message::AppendReq { leader_id, term, prev_index, prev_term, entries, commit_index, lease_duration_ms } => {
                let slice = encode_log_slice(entries);
                format!(
                    "APPEND-REQ {leader_id} {term} {prev_index} {prev_term} {slice} {commit_index} {lease_duration_ms}"
                )
            }
            Message::AppendRep { follower_id, term, success, matched_index } => {
                let flag = if *success { 1 } else { 0 };
                format!("APPEND-REP {follower_id} {term} {flag} {matched_index}")
            }
        }
    }

    /// Parses one wire line per the grammar in SPEC_FULL.md §6. Returns
    /// `RaftError::MalformedMessage` for anything that doesn't match a
    /// known command shape; the caller (Router) maps that to
    /// `Error: Invalid command`.
    pub fn parse(line: &str) -> Result<Message> {
        let line = line.trim();
        let mut tokens = line.splitn(2, ' ');
        let head = tokens.next().unwrap_or("");
        let rest = tokens.next().unwrap_or("");

        match head {
            "SET" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [key, value, req_id] = take3(&parts, line)?;
                Ok(Message::Set { key: key.to_string(), value: value.to_string(), req_id: parse_u64(req_id, line)? })
            }
            "GET" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [key, req_id] = take2(&parts, line)?;
                Ok(Message::Get { key: key.to_string(), req_id: parse_u64(req_id, line)? })
            }
            "VOTE-REQ" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [candidate_id, term, last_log_term, last_log_index] = take4(&parts, line)?;
                Ok(Message::VoteReq {
                    candidate_id: parse_usize(candidate_id, line)?,
                    term: parse_u64(term, line)?,
                    last_log_term: parse_u64(last_log_term, line)?,
                    last_log_index: parse_i64(last_log_index, line)?,
                })
            }
            "VOTE-REP" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [voter_id, term, voted_for, old_lease] = take4(&parts, line)?;
                Ok(Message::VoteRep {
                    voter_id: parse_usize(voter_id, line)?,
                    term: parse_u64(term, line)?,
                    voted_for: parse_i64(voted_for, line)?,
                    old_leader_lease_ms: parse_i64(old_lease, line)?,
                })
            }
            "APPEND-REQ" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [leader_id, term, prev_index, prev_term, slice, commit_index, lease_ms] =
                    take7(&parts, line)?;
                Ok(Message::AppendReq {
                    leader_id: parse_usize(leader_id, line)?,
                    term: parse_u64(term, line)?,
                    prev_index: parse_i64(prev_index, line)?,
                    prev_term: parse_u64(prev_term, line)?,
                    entries: decode_log_slice(slice)?,
                    commit_index: parse_i64(commit_index, line)?,
                    lease_duration_ms: parse_u64(lease_ms, line)?,
                })
            }
            "APPEND-REP" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [follower_id, term, flag, matched_index] = take4(&parts, line)?;
                Ok(Message::AppendRep {
                    follower_id: parse_usize(follower_id, line)?,
                    term: parse_u64(term, line)?,
                    success: flag == "1",
                    matched_index: parse_i64(matched_index, line)?,
                })
            }
            _ => Err(RaftError::MalformedMessage(line.to_string())),
        }
    }
}

fn take2<'a>(parts: &[&'a str], line: &str) -> Result<[&'a str; 2]> {
    match parts {
        [a, b] => Ok([a, b]),
        _ => Err(RaftError::MalformedMessage(line.to_string())),
    }
}

fn take3<'a>(parts: &[&'a str], line: &str) -> Result<[&'a str; 3]> {
    match parts {
        [a, b, c] => Ok([a, b, c]),
        _ => Err(RaftError::MalformedMessage(line.to_string())),
    }
}

fn take4<'a>(parts: &[&'a str], line: &str) -> Result<[&'a str; 4]> {
    match parts {
        [a, b, c, d] => Ok([a, b, c, d]),
        _ => Err(RaftError::MalformedMessage(line.to_string())),
    }
}

fn take7<'a>(parts: &[&'a str], line: &str) -> Result<[&'a str; 7]> {
    match parts {
        [a, b, c, d, e, f, g] => Ok([a, b, c, d, e, f, g]),
        _ => Err(RaftError::MalformedMessage(line.to_string())),
    }
}

fn parse_u64(token: &str, line: &str) -> Result<u64> {
    token.parse().map_err(|_| RaftError::MalformedMessage(line.to_string()))
}

fn parse_i64(token: &str, line: &str) -> Result<i64> {
    token.parse().map_err(|_| RaftError::MalformedMessage(line.to_string()))
}

fn parse_usize(token: &str, line: &str) -> Result<usize> {
    token.parse().map_err(|_| RaftError::MalformedMessage(line.to_string()))
}

/// Reply strings a client ever sees, per SPEC_FULL.md §6/§7.
pub const REPLY_OK: &str = "ok";
pub const REPLY_KO: &str = "ko";
pub const REPLY_NON_EXISTENT_KEY: &str = "Error: Non existent key";
pub const REPLY_INVALID_COMMAND: &str = "Error: Invalid command";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_set() {
        let msg = Message::Set { key: "x".into(), value: "1".into(), req_id: 7 };
        let line = msg.encode();
        assert_eq!(line, "SET x 1 7");
        assert_eq!(Message::parse(&line).unwrap(), msg);
    }

    #[test]
    fn round_trips_vote_req() {
        let msg = Message::VoteReq { candidate_id: 2, term: 5, last_log_term: 4, last_log_index: 10 };
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn round_trips_append_req_with_entries() {
        let msg = Message::AppendReq {
            leader_id: 0,
            term: 3,
            prev_index: -1,
            prev_term: 0,
            entries: vec![
                Entry { term: 3, command: "SET a 1 1".to_string() },
                Entry { term: 3, command: "NO-OP 3".to_string() },
            ],
            commit_index: 1,
            lease_duration_ms: 5000,
        };
        let line = msg.encode();
        assert_eq!(line.split(' ').count(), 7, "log slice must be one whitespace-free token");
        assert_eq!(Message::parse(&line).unwrap(), msg);
    }

    #[test]
    fn round_trips_append_req_empty_slice() {
        let msg = Message::AppendReq {
            leader_id: 1,
            term: 3,
            prev_index: 4,
            prev_term: 3,
            entries: vec![],
            commit_index: 4,
            lease_duration_ms: 5000,
        };
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn round_trips_append_rep_and_vote_rep() {
        let rep = Message::AppendRep { follower_id: 1, term: 9, success: true, matched_index: 3 };
        assert_eq!(Message::parse(&rep.encode()).unwrap(), rep);
        let vrep = Message::VoteRep { voter_id: 1, term: 9, voted_for: -1, old_leader_lease_ms: 0 };
        assert_eq!(Message::parse(&vrep.encode()).unwrap(), vrep);
    }

    #[test]
    fn unknown_command_is_malformed() {
        assert!(matches!(Message::parse("PING 1 2"), Err(RaftError::MalformedMessage(_))));
    }

    #[test]
    fn wrong_arity_is_malformed() {
        assert!(matches!(Message::parse("SET onlykey"), Err(RaftError::MalformedMessage(_))));
    }
}
