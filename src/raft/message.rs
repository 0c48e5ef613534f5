use super::{Entry, Index, NodeID, Term};
use crate::errdata;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The reserved broadcast ID. As a destination it addresses all replicas;
/// in the leader field it means the sender doesn't know of a leader.
pub const BROADCAST: &str = "FFFF";

/// The maximum size of an encoded message, in bytes. The transport delivers
/// each message as a single datagram.
pub const MAX_DATAGRAM: usize = 65535;

/// A message envelope. Every datagram carries the sender, the recipient (a
/// replica, a client, or broadcast), and the sender's believed leader,
/// followed by a type-tagged payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeID,
    pub dst: NodeID,
    pub leader: NodeID,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Decodes an envelope from a single datagram. Unknown message types and
    /// missing envelope fields surface as decode errors.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the envelope as a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return errdata!("message of {} bytes exceeds datagram size", bytes.len());
        }
        Ok(bytes)
    }
}

/// A message payload. The wire representation is a flat, self-describing
/// record tagged by the `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Announces a replica to the network on startup.
    Hello,

    /// A client read of a single key.
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },

    /// A client write of a single key.
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },

    /// A successful reply to a client request. Carries the read value for
    /// gets; absent keys read as the empty string.
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Tells a client to retry against the believed leader carried in the
    /// envelope's leader field (or broadcast, if unknown).
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// A candidate solicits votes from all peers. last_log_index and
    /// last_log_term identify the candidate's log head (0 if empty), used
    /// by voters to check that the candidate is at least as up-to-date.
    RequestVote { term: Term, last_log_index: Index, last_log_term: Term },

    /// Grants the sender's vote for the given term. Votes are granted at
    /// most once per term, on a first-come basis; denial is silence.
    RequestVoteResponse { term: Term },

    /// Replicates log entries to a follower, and doubles as a heartbeat
    /// when entries is empty. prev_log_index/term identify the entry
    /// immediately before the submitted ones; they are null for an append
    /// starting at the head of the log.
    Append {
        term: Term,
        prev_log_index: Option<Index>,
        prev_log_term: Option<Term>,
        entries: Vec<Entry>,
        leader_commit: Index,
    },

    /// A follower's reply to an append. On success, match_index is the
    /// last log index this append verified as matching the leader.
    AppendResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_index: Option<Index>,
    },
}

impl Message {
    /// Returns the sender's term, for messages that carry one. Discovering
    /// a higher term via any such message forces a transition to follower.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term }
            | Message::Append { term, .. } => Some(*term),
            Message::Hello
            | Message::Get { .. }
            | Message::Put { .. }
            | Message::Ok { .. }
            | Message::Redirect { .. }
            | Message::AppendResponse { .. } => None,
        }
    }
}
