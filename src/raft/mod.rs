mod log;
mod message;
mod node;
mod server;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message, BROADCAST, MAX_DATAGRAM};
pub use node::{Node, NodeID, Options, Term, Timestamp};
pub use server::Server;
pub use state::{KvStore, State};

/// The interval between appends from a leader to an idle peer, in
/// milliseconds. Empty appends double as heartbeats and liveness probes.
pub const HEARTBEAT_INTERVAL: u64 = 175;

/// The range of randomized election timeouts, in milliseconds. A fresh
/// timeout is drawn every time the timer is armed, to reduce split votes.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<u64> = 400..650;

/// How long a leader tolerates not hearing from a quorum before it steps
/// down, in milliseconds. Roughly 1.5× the middle election timeout, so a
/// partitioned leader stops serving reads before its replacement settles in.
pub const RESPONSE_TIMEOUT: u64 = 800;

/// The maximum number of log entries in a single append message. Keeps
/// individual datagrams well below the transport's size limit.
pub const MAX_APPEND_ENTRIES: usize = 10;
