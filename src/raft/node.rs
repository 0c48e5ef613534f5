use super::{Entry, Envelope, Index, Log, Message, State, BROADCAST};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::Rng as _;
use std::collections::{HashMap, HashSet, VecDeque};

/// A replica ID: a short hex string assigned by the simulator.
pub type NodeID = String;

/// A leader term.
pub type Term = u64;

/// A monotonic timestamp in milliseconds, supplied by the event loop.
/// Timestamps start at 0 when the node is constructed.
pub type Timestamp = u64;

/// Raft node options.
pub struct Options {
    /// Milliseconds between appends from a leader to an idle peer.
    pub heartbeat_interval: u64,
    /// The range of randomized election timeouts, in milliseconds.
    pub election_timeout: std::ops::Range<u64>,
    /// How long a leader tolerates not hearing from a quorum before it
    /// steps down, in milliseconds.
    pub response_timeout: u64,
    /// Maximum number of entries in a single append message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout: super::ELECTION_TIMEOUT_RANGE,
            response_timeout: super::RESPONSE_TIMEOUT,
            max_append_entries: super::MAX_APPEND_ENTRIES,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given
/// node_tx channel, which the event loop drains onto the network.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or
    /// leader if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        rng: StdRng,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, node_tx, opts, rng);
        if node.peers.is_empty() {
            // If there are no peers, hold a one-node election immediately.
            return Ok(node.into_candidate(0)?.into_leader(0)?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes an inbound message at the given time.
    pub fn step(self, msg: Envelope, now: Timestamp) -> Result<Self> {
        debug!("Stepping {msg:?}");
        assert!(msg.dst == *self.id() || msg.dst == BROADCAST, "message addressed to other node");
        match self {
            Node::Candidate(n) => n.step(msg, now),
            Node::Follower(n) => n.step(msg, now),
            Node::Leader(n) => n.step(msg, now),
        }
    }

    /// Advances time, firing any expired timers.
    pub fn tick(self, now: Timestamp) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(now),
            Node::Follower(n) => n.tick(now),
            Node::Leader(n) => n.tick(now),
        }
    }

    /// Returns the earliest time at which a timer fires: the election
    /// deadline for followers and candidates, the next per-peer heartbeat
    /// or the step-down deadline for leaders.
    pub fn next_deadline(&self, now: Timestamp) -> Timestamp {
        match self {
            Node::Candidate(n) => n.next_deadline(),
            Node::Follower(n) => n.next_deadline(),
            Node::Leader(n) => n.next_deadline(now),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {
    /// The believed leader to stamp on outbound envelopes: ourselves when
    /// leader, the followed leader if known, broadcast otherwise.
    fn leader_hint<'a>(&'a self, id: &'a NodeID) -> &'a str;
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    rng: StdRng,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            rng: self.rng,
            role,
        }
    }

    /// Returns the node's current term. Convenience wrapper for the log.
    fn term(&self) -> Term {
        self.log.get_term()
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message, stamping the envelope with our believed leader.
    fn send(&self, to: &NodeID, message: Message) -> Result<()> {
        let envelope = Envelope {
            src: self.id.clone(),
            dst: to.clone(),
            leader: self.role.leader_hint(&self.id).to_string(),
            message,
        };
        Self::send_with(&self.node_tx, envelope)
    }

    /// Sends a message without borrowing self, to allow partial borrows.
    fn send_with(node_tx: &crossbeam::channel::Sender<Envelope>, envelope: Envelope) -> Result<()> {
        debug!("Sending {envelope:?}");
        Ok(node_tx.send(envelope)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for to in self.peers.iter().sorted() {
            self.send(to, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&mut self) -> u64 {
        self.rng.gen_range(self.opts.election_timeout.clone())
    }

    /// Advances the commit index and applies newly committed entries to the
    /// state machine, in order. No-op at or below the current commit index.
    fn commit_and_apply(&mut self, index: Index) {
        let prev = self.log.commit_index();
        if index <= prev {
            return;
        }
        self.log.commit(index);
        for entry in self.log.scan(prev + 1..=index) {
            debug!("Applying {entry:?}");
            self.state.apply(entry);
        }
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeID>,
    /// When to give up on this election and call a new one.
    election_deadline: Timestamp,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_deadline: Timestamp) -> Self {
        Self { votes: HashSet::new(), election_deadline }
    }
}

impl Role for Candidate {
    fn leader_hint<'a>(&'a self, _id: &'a NodeID) -> &'a str {
        BROADCAST
    }
}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&self) {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(self.log.get_vote(), Some(&self.id), "log vote does not match self");
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<NodeID>,
        now: Timestamp,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_deadline = now + self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in a different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_deadline)))
        } else {
            // We found a new term, but don't know the leader yet. We'll
            // find out when we step a message from it.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
            Ok(self.into_role(Follower::new(None, election_deadline)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self, now: Timestamp) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let role = Leader::new(&self.peers, self.log.last_index(), now);
        let mut node = self.into_role(role);

        // Propose an empty write when assuming leadership. Entries from
        // earlier terms can't be committed directly (see figure 8 in the
        // Raft paper), so committing one of our own pulls them in and lets
        // reads proceed from a complete state machine.
        let noop = Entry {
            term: node.term(),
            key: String::new(),
            value: String::new(),
            client: node.id.clone(),
            origin: node.id.clone(),
            mid: format!("boot-{}-{}", node.term(), node.id),
        };
        node.propose(noop, now)?;
        node.maybe_commit_and_apply()?;
        node.heartbeat(now)?;

        Ok(node)
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Timestamp) -> Result<Node> {
        self.assert();

        // If we discover a future term, become a leaderless follower in it
        // and step the message again.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(term, None, now)?.step(msg, now);
            }
        }

        match msg.message {
            // If we received a vote in this term's election, record it. If
            // the vote gives us quorum, assume leadership.
            Message::RequestVoteResponse { term } => {
                if term == self.term() {
                    self.role.votes.insert(msg.src.clone());
                    if self.role.votes.len() >= self.quorum_size() {
                        return Ok(self.into_leader(now)?.into());
                    }
                }
            }

            // A leader won this term's election; follow it and step the
            // append as a follower.
            Message::Append { term, .. } if term == self.term() => {
                let leader = msg.src.clone();
                return self.into_follower(term, Some(leader), now)?.step(msg, now);
            }
            Message::Append { .. } => debug!("Dropping append from stale term"),

            // We voted for ourselves; denial is silence.
            Message::RequestVote { .. } => {}

            // There's no leader while the election runs; the client must
            // retry elsewhere.
            Message::Put { mid, .. } | Message::Get { mid, .. } => {
                info!("redirecting {} to {BROADCAST} (mid: {mid})", msg.src);
                self.send(&msg.src, Message::Redirect { mid })?;
            }

            // Stale traffic from a previous role or election.
            Message::Hello
            | Message::AppendResponse { .. }
            | Message::Ok { .. }
            | Message::Redirect { .. } => {}
        }
        Ok(self.into())
    }

    /// Advances time. If the election timed out, call a new one.
    fn tick(mut self, now: Timestamp) -> Result<Node> {
        self.assert();
        if now >= self.role.election_deadline {
            self.campaign(now)?;
        }
        Ok(self.into())
    }

    fn next_deadline(&self) -> Timestamp {
        self.role.election_deadline
    }

    /// Campaigns for leadership by increasing the term, voting for
    /// ourselves, and soliciting votes from all peers.
    fn campaign(&mut self, now: Timestamp) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        let election_deadline = now + self.gen_election_timeout();
        self.role = Candidate::new(election_deadline);
        self.role.votes.insert(self.id.clone());
        self.log.set_term(term, Some(self.id.clone()));
        self.broadcast(Message::RequestVote {
            term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }
}

// A follower replicates state from a leader.
pub struct Follower {
    /// The leader in the current term, or None if not yet known.
    leader: Option<NodeID>,
    /// When to start an election, unless the leader shows liveness first.
    election_deadline: Timestamp,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<NodeID>, election_deadline: Timestamp) -> Self {
        Self { leader, election_deadline }
    }
}

impl Role for Follower {
    fn leader_hint<'a>(&'a self, _id: &'a NodeID) -> &'a str {
        self.leader.as_deref().unwrap_or(BROADCAST)
    }
}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower. The election timer is
    /// armed from time 0.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        rng: StdRng,
    ) -> Self {
        let mut node =
            Self { id, peers, log, state, node_tx, opts, rng, role: Follower::new(None, 0) };
        node.role.election_deadline = node.gen_election_timeout();
        node
    }

    /// Asserts internal invariants.
    fn assert(&self) {
        if let Some(leader) = &self.role.leader {
            assert_ne!(leader, &self.id, "can't follow self");
            assert!(self.peers.contains(leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        }
    }

    /// Transitions the follower into a candidate, campaigning for
    /// leadership in a new term.
    fn into_candidate(self, now: Timestamp) -> Result<RawNode<Candidate>> {
        let mut node = self.into_role(Candidate::new(now));
        node.campaign(now)?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either following a leader
    /// discovered in the current term or leaderless in a new term.
    fn into_follower(
        mut self,
        leader: Option<NodeID>,
        term: Term,
        now: Timestamp,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_deadline = now + self.gen_election_timeout();
        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have a leader in this term");
            assert_eq!(term, self.term(), "can't follow leader in a different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), election_deadline);
        } else {
            // We found a new term, but don't know the leader yet.
            assert_ne!(term, self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
            self.role = Follower::new(None, election_deadline);
        }
        Ok(self)
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Timestamp) -> Result<Node> {
        self.assert();

        // If we discover a future term, become a leaderless follower in it
        // and step the message again.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(None, term, now)?.step(msg, now);
            }
        }

        match msg.message {
            // The leader replicates entries and asserts its leadership.
            Message::Append { term, prev_log_index, prev_log_term, entries, leader_commit } => {
                if term < self.term() {
                    debug!("Dropping append from stale term {term}");
                    return Ok(self.into());
                }

                // Follow the sender if we don't have a leader yet, and
                // defer the next election while it shows liveness.
                if self.role.leader.is_none() {
                    self = self.into_follower(Some(msg.src.clone()), term, now)?;
                }
                assert_eq!(self.role.leader.as_ref(), Some(&msg.src), "multiple leaders in term");
                self.role.election_deadline = now + self.gen_election_timeout();

                // Consistency check: the base entry must be in our log. A
                // null or 0 base marks an append from the head of the log
                // (or a heartbeat to an empty log) and matches vacuously.
                let base = prev_log_index.unwrap_or(0);
                let matches = match (prev_log_index, prev_log_term) {
                    (None, _) | (Some(0), _) => true,
                    (Some(index), Some(term)) => self.log.has(index, term),
                    (Some(_), None) => false,
                };
                if !matches {
                    self.send(
                        &msg.src,
                        Message::AppendResponse { success: false, match_index: None },
                    )?;
                    return Ok(self.into());
                }

                // Splice the entries in, advance the commit index over the
                // prefix this append verified, and apply.
                let match_index = self.log.splice(base, entries);
                self.commit_and_apply(std::cmp::min(leader_commit, match_index));
                self.send(
                    &msg.src,
                    Message::AppendResponse { success: true, match_index: Some(match_index) },
                )?;
            }

            // A candidate is requesting our vote.
            Message::RequestVote { term, last_log_index, last_log_term } => {
                if term < self.term() {
                    debug!("Dropping vote solicitation from stale term {term}");
                    return Ok(self.into());
                }

                // Only one vote per term, on a first-come basis.
                if let Some(vote) = self.log.get_vote() {
                    if vote != &msg.src {
                        return Ok(self.into());
                    }
                }

                // Don't vote for candidates whose log is behind ours,
                // comparing (last term, last index).
                if (last_log_term, last_log_index) < (self.log.last_term(), self.log.last_index())
                {
                    return Ok(self.into());
                }

                // Grant the vote; denial is silence.
                info!("Voting for {} in term {term} election", msg.src);
                self.log.set_term(term, Some(msg.src.clone()));
                self.role.election_deadline = now + self.gen_election_timeout();
                self.send(&msg.src, Message::RequestVoteResponse { term })?;
            }

            // Clients must talk to the leader; point them at ours, if any.
            Message::Put { mid, .. } | Message::Get { mid, .. } => {
                info!(
                    "redirecting {} to {} (mid: {mid})",
                    msg.src,
                    self.role.leader_hint(&self.id)
                );
                self.send(&msg.src, Message::Redirect { mid })?;
            }

            // A vote for an election we're no longer running, or a
            // response to an append from a leadership we no longer hold.
            Message::RequestVoteResponse { .. } | Message::AppendResponse { .. } => {}

            Message::Hello => {}
            Message::Ok { .. } | Message::Redirect { .. } => {
                debug!("Dropping client reply addressed to a replica")
            }
        };
        Ok(self.into())
    }

    /// Advances time. If the leader has been quiet past the election
    /// deadline, campaign for leadership.
    fn tick(self, now: Timestamp) -> Result<Node> {
        self.assert();
        if now >= self.role.election_deadline {
            return Ok(self.into_candidate(now)?.into());
        }
        Ok(self.into())
    }

    fn next_deadline(&self) -> Timestamp {
        self.role.election_deadline
    }
}

/// Per-peer replication progress and liveness bookkeeping on the leader.
struct Progress {
    /// The next log index to send.
    next_index: Index,
    /// The highest log index known to match the peer's log.
    match_index: Index,
    /// When we last sent this peer an append.
    last_send: Timestamp,
    /// When we last heard anything from this peer.
    last_heard: Timestamp,
}

impl Progress {
    /// Advances the peer's match index, if it grew. next_index follows,
    /// but is otherwise left as is to avoid regressing it unnecessarily.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Backs next_index off one step after a rejected append, bounded below
    /// by the index following the verified match.
    fn back_off(&mut self) {
        self.next_index = std::cmp::max(self.next_index.saturating_sub(1), self.match_index + 1);
    }
}

/// A pending client read.
struct Read {
    client: NodeID,
    key: String,
    mid: String,
    /// Arrival time. The read is answered once a quorum has been heard
    /// from at or after this time.
    arrival: Timestamp,
}

// A leader serves client requests and replicates the log to followers.
pub struct Leader {
    /// Replication progress and liveness bookkeeping for each peer.
    progress: HashMap<NodeID, Progress>,
    /// Reads waiting for quorum confirmation that we are still leader,
    /// in arrival order.
    reads: VecDeque<Read>,
}

impl Leader {
    /// Creates a new leader role.
    fn new(peers: &HashSet<NodeID>, last_index: Index, now: Timestamp) -> Self {
        let progress = peers
            .iter()
            .cloned()
            .map(|p| {
                let progress = Progress {
                    next_index: last_index + 1,
                    match_index: 0,
                    last_send: now,
                    last_heard: now,
                };
                (p, progress)
            })
            .collect();
        Self { progress, reads: VecDeque::new() }
    }
}

impl Role for Leader {
    fn leader_hint<'a>(&'a self, id: &'a NodeID) -> &'a str {
        id
    }
}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&self) {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(self.log.get_vote(), Some(&self.id), "log vote does not match self");
    }

    /// Transitions the leader into a leaderless follower in a new term.
    fn into_follower(mut self, term: Term, now: Timestamp) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in a later term");
        info!("Discovered new term {term}");

        // Pending reads are dropped unanswered and in-flight writes go
        // unacknowledged; clients retry with the same MID and are
        // redirected or deduplicated.
        self.log.set_term(term, None);
        let election_deadline = now + self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_deadline)))
    }

    /// Steps down to a leaderless follower in the current term, after
    /// failing to confirm a quorum within the response timeout.
    fn step_down(mut self, now: Timestamp) -> Result<RawNode<Follower>> {
        let election_deadline = now + self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_deadline)))
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Timestamp) -> Result<Node> {
        self.assert();

        // Any inbound message from a peer is a liveness signal.
        if let Some(progress) = self.role.progress.get_mut(&msg.src) {
            progress.last_heard = now;
        }

        // If we discover a future term, become a leaderless follower in it
        // and step the message again.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(term, now)?.step(msg, now);
            }
        }

        match msg.message {
            // Replication responses can only be processed for known peers.
            Message::AppendResponse { .. } if !self.role.progress.contains_key(&msg.src) => {
                debug!("Dropping append response from unknown sender {}", msg.src);
            }

            // A follower appended our entries. Record its progress, try to
            // commit, and keep catching it up one batch at a time.
            Message::AppendResponse { success: true, match_index: Some(match_index) } => {
                if match_index > self.log.last_index() {
                    error!("Peer {} claims match at unknown index {match_index}", msg.src);
                    return Ok(self.into());
                }
                if self.progress_mut(&msg.src).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                self.maybe_send_append(&msg.src, now, false)?;
            }

            // The peer rejected our base entry. Back off one step and
            // probe again until we find a common prefix.
            Message::AppendResponse { success: false, .. } => {
                self.progress_mut(&msg.src).back_off();
                self.maybe_send_append(&msg.src, now, true)?;
            }

            // A bare acknowledgement carries no progress, just liveness.
            Message::AppendResponse { success: true, match_index: None } => {}

            // A client write. Duplicates are acked as if the original
            // succeeded; fresh writes are proposed and acked on commit.
            Message::Put { mid, key, value } => {
                if self.log.contains_mid(&mid) {
                    debug!("Suppressing duplicate put (mid: {mid})");
                    self.send(&msg.src, Message::Ok { mid, value: None })?;
                } else {
                    info!("executing PUT {key}={value} for {} (mid: {mid})", msg.src);
                    let entry = Entry {
                        term: self.term(),
                        key,
                        value,
                        client: msg.src.clone(),
                        origin: self.id.clone(),
                        mid,
                    };
                    self.propose(entry, now)?;
                    if self.peers.is_empty() {
                        self.maybe_commit_and_apply()?;
                    }
                }
            }

            // A client read. Queue it with its arrival time and confirm
            // our leadership promptly rather than waiting for the next
            // heartbeat round.
            Message::Get { mid, key } => {
                if !self.role.reads.iter().any(|r| r.mid == mid) {
                    info!("executing GET {key} for {} (mid: {mid})", msg.src);
                    let read = Read { client: msg.src.clone(), key, mid, arrival: now };
                    self.role.reads.push_back(read);
                    self.heartbeat(now)?;
                }
            }

            // There can't be two leaders in the same term.
            Message::Append { term, .. } => {
                assert_ne!(term, self.term(), "saw other leader {} in term {term}", msg.src);
                debug!("Dropping append from stale term {term}");
            }

            // We won this term's election; deny by silence, and ignore
            // straggling votes.
            Message::RequestVote { .. } | Message::RequestVoteResponse { .. } => {}

            Message::Hello | Message::Ok { .. } | Message::Redirect { .. } => {}
        }

        // Liveness or commit progress may have unblocked pending reads.
        self.maybe_read(now)?;

        Ok(self.into())
    }

    /// Advances time: steps down if we can't confirm a quorum, otherwise
    /// sends heartbeats to peers we haven't contacted recently.
    fn tick(mut self, now: Timestamp) -> Result<Node> {
        self.assert();

        // A partitioned leader must not serve stale reads indefinitely.
        if now.saturating_sub(self.quorum_heard(now)) >= self.opts.response_timeout {
            info!("Unable to reach quorum, stepping down in term {}", self.term());
            return Ok(self.step_down(now)?.into());
        }

        for peer in self.role.progress.keys().cloned().sorted() {
            if now.saturating_sub(self.role.progress[&peer].last_send)
                >= self.opts.heartbeat_interval
            {
                self.maybe_send_append(&peer, now, true)?;
            }
        }
        Ok(self.into())
    }

    fn next_deadline(&self, now: Timestamp) -> Timestamp {
        let step_down = self.quorum_heard(now) + self.opts.response_timeout;
        let heartbeat = self
            .role
            .progress
            .values()
            .map(|p| p.last_send + self.opts.heartbeat_interval)
            .min()
            .unwrap_or(step_down);
        std::cmp::min(step_down, heartbeat)
    }

    /// Returns the quorum-th most recent time we heard from each replica,
    /// counting ourselves as of now. If this falls behind the response
    /// timeout we can no longer tell whether we've been deposed.
    fn quorum_heard(&self, now: Timestamp) -> Timestamp {
        self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.last_heard)
                .chain(std::iter::once(now))
                .collect(),
        )
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress_mut(&mut self, id: &NodeID) -> &mut Progress {
        self.role.progress.get_mut(id).expect("unknown peer")
    }

    /// Proposes an entry for consensus by appending it to our log and
    /// eagerly replicating it to peers in steady state. Lagging peers are
    /// being probed or caught up separately and would only reject it.
    fn propose(&mut self, entry: Entry, now: Timestamp) -> Result<Index> {
        let index = self.log.append(entry);
        for peer in self.role.progress.keys().cloned().sorted() {
            if self.role.progress[&peer].next_index == index {
                self.maybe_send_append(&peer, now, false)?;
            }
        }
        Ok(index)
    }

    /// Sends a heartbeat to every peer, regardless of how recently we sent
    /// to it.
    fn heartbeat(&mut self, now: Timestamp) -> Result<()> {
        for peer in self.role.progress.keys().cloned().sorted() {
            self.maybe_send_append(&peer, now, true)?;
        }
        Ok(())
    }

    /// Sends pending log entries to a peer, starting at its next_index, or
    /// nothing if the peer has no pending entries and force is false. A
    /// forced send with no pending entries is an empty append (heartbeat)
    /// at the peer's current base, which the peer verifies like any other.
    fn maybe_send_append(&mut self, peer: &NodeID, now: Timestamp, force: bool) -> Result<()> {
        let progress = self.role.progress.get(peer).expect("unknown peer");
        let next = progress.next_index;
        assert!(next > progress.match_index, "next_index at or below match_index");

        let entries: Vec<Entry> =
            self.log.scan(next..).iter().take(self.opts.max_append_entries).cloned().collect();
        if entries.is_empty() && !force {
            return Ok(());
        }
        let count = entries.len() as Index;

        let (prev_log_index, prev_log_term) = match next - 1 {
            0 => (None, None),
            base => (Some(base), Some(self.log.get(base).expect("missing base entry").term)),
        };

        debug!("Replicating {count} entries at base {} to {peer}", next - 1);
        let envelope = Envelope {
            src: self.id.clone(),
            dst: peer.clone(),
            leader: self.id.clone(),
            message: Message::Append {
                term: self.term(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
            },
        };
        Self::send_with(&self.node_tx, envelope)?;

        // Optimistically assume the entries arrive, to avoid re-sending
        // them before the peer responds. A lost append is recovered by the
        // next heartbeat probe, which the peer will reject.
        let progress = self.role.progress.get_mut(peer).expect("unknown peer");
        progress.next_index = next + count;
        progress.last_send = now;
        Ok(())
    }

    /// Commits any new entries that have been replicated to a quorum, and
    /// applies them to the state machine, acknowledging applied writes to
    /// their originating clients.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        let prev = self.log.commit_index();
        if quorum_index <= prev {
            return Ok(prev);
        }

        // Only entries from our own term commit directly; earlier entries
        // commit with them (see figure 8 in the Raft paper).
        match self.log.get(quorum_index) {
            Some(entry) if entry.term == self.term() => {}
            Some(_) => return Ok(prev),
            None => panic!("missing entry at quorum index {quorum_index}"),
        }
        self.log.commit(quorum_index);

        // Apply the newly committed entries, and ack each applied write to
        // the client recorded in the entry. Any leader that commits the
        // entry acks it, even if another leader accepted it.
        let mut replies = Vec::new();
        for entry in self.log.scan(prev + 1..=quorum_index) {
            debug!("Applying {entry:?}");
            self.state.apply(entry);
            if entry.client != self.id {
                info!(
                    "completed PUT {}={} for {} (mid: {})",
                    entry.key, entry.value, entry.client, entry.mid
                );
                replies.push((entry.client.clone(), Message::Ok { mid: entry.mid.clone(), value: None }));
            }
        }
        for (client, message) in replies {
            self.send(&client, message)?;
        }
        Ok(quorum_index)
    }

    /// Answers pending reads that are confirmed: a quorum has been heard
    /// from since the read arrived, so we were still the leader then.
    fn maybe_read(&mut self, now: Timestamp) -> Result<()> {
        if self.role.reads.is_empty() {
            return Ok(());
        }

        // Only answer reads once an entry from our own term has committed:
        // until then the applied state may be missing writes that an
        // earlier leader already acknowledged.
        if self.log.commit_term() < self.term() {
            return Ok(());
        }

        let horizon = self.quorum_heard(now);
        let mut replies = Vec::new();
        while let Some(read) = self.role.reads.front() {
            if read.arrival > horizon {
                break;
            }
            let Read { client, key, mid, .. } =
                self.role.reads.pop_front().expect("read disappeared");
            let value = self.state.read(&key);
            info!("completed GET {key}={value} for {client} (mid: {mid})");
            replies.push((client, Message::Ok { mid, value: Some(value) }));
        }
        for (client, message) in replies {
            self.send(&client, message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{KvStore, MAX_APPEND_ENTRIES};
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng as _;
    use std::collections::BTreeMap;
    use test_case::test_case;

    /// Tightened, fixed timing for tests. Elections are triggered
    /// explicitly by ticking a chosen node past its deadline, so all nodes
    /// share a fixed timeout for determinism.
    const ELECTION: u64 = 100;
    const HEARTBEAT: u64 = 50;
    const RESPONSE: u64 = 150;

    fn test_options() -> Options {
        Options {
            heartbeat_interval: HEARTBEAT,
            election_timeout: ELECTION..ELECTION + 1,
            response_timeout: RESPONSE,
            max_append_entries: MAX_APPEND_ENTRIES,
        }
    }

    fn new_node(id: &str, peers: &[&str]) -> (Node, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let seed = id.bytes().map(|b| b as u64).sum();
        let node = Node::new(
            id.into(),
            peers.iter().map(|p| p.to_string()).collect(),
            Log::new(),
            Box::new(KvStore::new()),
            node_tx,
            test_options(),
            StdRng::seed_from_u64(seed),
        )
        .expect("node failed");
        (node, node_rx)
    }

    mod quorum {
        use super::{new_node, Node};
        use test_case::test_case;

        #[test_case(1 => 1)]
        #[test_case(2 => 2)]
        #[test_case(3 => 2)]
        #[test_case(4 => 3)]
        #[test_case(5 => 3)]
        #[test_case(6 => 4)]
        #[test_case(7 => 4)]
        #[test_case(8 => 5)]
        fn quorum_size(size: usize) -> usize {
            let peers: Vec<String> = (2..=size).map(|i| i.to_string()).collect();
            let peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
            let (node, _rx) = new_node("1", &peers);
            match &node {
                Node::Candidate(n) => {
                    assert_eq!(n.cluster_size(), size);
                    n.quorum_size()
                }
                Node::Follower(n) => {
                    assert_eq!(n.cluster_size(), size);
                    n.quorum_size()
                }
                Node::Leader(n) => {
                    assert_eq!(n.cluster_size(), size);
                    n.quorum_size()
                }
            }
        }

        #[test_case(vec![1] => 1)]
        #[test_case(vec![1,3,2] => 2)]
        #[test_case(vec![4,1,3,2] => 2)]
        #[test_case(vec![1,1,1,2,2] => 1)]
        #[test_case(vec![1,1,2,2,2] => 2)]
        fn quorum_value(values: Vec<i8>) -> i8 {
            let peers: Vec<String> = (2..=values.len()).map(|i| i.to_string()).collect();
            let peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
            let (node, _rx) = new_node("1", &peers);
            match &node {
                Node::Candidate(n) => n.quorum_value(values),
                Node::Follower(n) => n.quorum_value(values),
                Node::Leader(n) => n.quorum_value(values),
            }
        }
    }

    /// A deterministic in-memory cluster. Nodes are driven by explicitly
    /// delivering pending messages and advancing a synthetic clock;
    /// messages to non-replica IDs queue up as client replies.
    struct Cluster {
        ids: Vec<NodeID>,
        nodes: BTreeMap<NodeID, Node>,
        rxs: BTreeMap<NodeID, Receiver<Envelope>>,
        /// In-flight messages, per destination (replica or client).
        pending: BTreeMap<NodeID, Vec<Envelope>>,
        /// Nodes partitioned away from the rest of the cluster. Nodes in
        /// the set can talk to each other, but not across the boundary.
        partitioned: HashSet<NodeID>,
        /// The synthetic clock, in milliseconds.
        now: Timestamp,
    }

    impl Cluster {
        fn new(ids: &[&str]) -> Self {
            let mut nodes = BTreeMap::new();
            let mut rxs = BTreeMap::new();
            for id in ids {
                let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
                let (node, rx) = new_node(id, &peers);
                nodes.insert(id.to_string(), node);
                rxs.insert(id.to_string(), rx);
            }
            Self {
                ids: ids.iter().map(|id| id.to_string()).collect(),
                nodes,
                rxs,
                pending: BTreeMap::new(),
                partitioned: HashSet::new(),
                now: 0,
            }
        }

        fn advance(&mut self, ms: u64) {
            self.now += ms;
        }

        /// Queues messages from a node's outbound channel for their
        /// destinations, dropping messages that cross a partition.
        fn route(&mut self, from: &str) {
            while let Ok(envelope) = self.rxs[from].try_recv() {
                let dsts: Vec<NodeID> = if envelope.dst == BROADCAST {
                    self.ids.iter().filter(|id| **id != envelope.src).cloned().collect()
                } else {
                    vec![envelope.dst.clone()]
                };
                for dst in dsts {
                    if self.blocked(&envelope.src, &dst) {
                        continue;
                    }
                    let mut envelope = envelope.clone();
                    envelope.dst = dst.clone();
                    self.pending.entry(dst).or_default().push(envelope);
                }
            }
        }

        /// Replicas across a partition boundary can't talk; clients are
        /// never partitioned.
        fn blocked(&self, src: &str, dst: &str) -> bool {
            if !self.ids.iter().any(|id| id == src) || !self.ids.iter().any(|id| id == dst) {
                return false;
            }
            self.partitioned.contains(src) != self.partitioned.contains(dst)
        }

        /// Steps a single message into a node at the current time.
        fn step(&mut self, id: &str, envelope: Envelope) {
            let node = self.nodes.remove(id).expect("unknown node");
            self.nodes.insert(id.to_string(), node.step(envelope, self.now).expect("step failed"));
            self.route(id);
        }

        /// Delivers all queued messages to the given node.
        fn deliver(&mut self, id: &str) {
            for envelope in self.pending.remove(id).unwrap_or_default() {
                self.step(id, envelope);
            }
        }

        /// Delivers queued messages until none remain for any replica.
        fn stabilize(&mut self) {
            loop {
                let ready: Vec<NodeID> = self
                    .ids
                    .iter()
                    .filter(|id| self.pending.get(*id).is_some_and(|p| !p.is_empty()))
                    .cloned()
                    .collect();
                if ready.is_empty() {
                    return;
                }
                for id in ready {
                    self.deliver(&id);
                }
            }
        }

        /// Ticks the given node at the current time.
        fn tick(&mut self, id: &str) {
            let node = self.nodes.remove(id).expect("unknown node");
            self.nodes.insert(id.to_string(), node.tick(self.now).expect("tick failed"));
            self.route(id);
        }

        fn tick_all(&mut self) {
            for id in self.ids.clone() {
                self.tick(&id);
            }
        }

        /// Elects the given node by expiring its election timer, then
        /// settles the vote traffic and a heartbeat round.
        fn elect(&mut self, id: &str) {
            self.advance(ELECTION);
            self.tick(id);
            self.stabilize();
            self.heartbeat_round();
            assert!(self.is_leader(id), "{id} was not elected");
        }

        /// Advances past the heartbeat interval, ticks every node, and
        /// settles the resulting traffic.
        fn heartbeat_round(&mut self) {
            self.advance(HEARTBEAT);
            self.tick_all();
            self.stabilize();
        }

        fn is_leader(&self, id: &str) -> bool {
            matches!(self.nodes[id], Node::Leader(_))
        }

        fn leader_count(&self) -> usize {
            self.ids.iter().filter(|id| self.is_leader(id)).count()
        }

        /// Injects a client request and delivers it.
        fn request(&mut self, to: &str, client: &str, message: Message) {
            let envelope =
                Envelope { src: client.into(), dst: to.into(), leader: BROADCAST.into(), message };
            self.pending.entry(to.to_string()).or_default().push(envelope);
            self.deliver(to);
        }

        fn put(&mut self, to: &str, client: &str, mid: &str, key: &str, value: &str) {
            let message =
                Message::Put { mid: mid.into(), key: key.into(), value: value.into() };
            self.request(to, client, message);
        }

        fn get(&mut self, to: &str, client: &str, mid: &str, key: &str) {
            self.request(to, client, Message::Get { mid: mid.into(), key: key.into() });
        }

        /// Takes all replies queued for a client so far.
        fn client_replies(&mut self, client: &str) -> Vec<Envelope> {
            self.pending.remove(client).unwrap_or_default()
        }

        /// Reads a key from a node's applied state.
        fn read(&self, id: &str, key: &str) -> String {
            match &self.nodes[id] {
                Node::Candidate(n) => n.state.read(key),
                Node::Follower(n) => n.state.read(key),
                Node::Leader(n) => n.state.read(key),
            }
        }

        fn log_of(&self, id: &str) -> &Log {
            match &self.nodes[id] {
                Node::Candidate(n) => &n.log,
                Node::Follower(n) => &n.log,
                Node::Leader(n) => &n.log,
            }
        }

        fn partition(&mut self, id: &str) {
            self.partitioned.insert(id.to_string());
        }

        fn heal(&mut self) {
            self.partitioned.clear();
        }

        fn ok_reply(&self, from: &str, client: &str, mid: &str, value: Option<&str>) -> Envelope {
            Envelope {
                src: from.into(),
                dst: client.into(),
                leader: from.into(),
                message: Message::Ok { mid: mid.into(), value: value.map(|v| v.into()) },
            }
        }
    }

    #[test]
    fn follower_campaigns_on_timeout() {
        let mut cluster = Cluster::new(&["A", "B", "C"]);
        cluster.advance(ELECTION - 1);
        cluster.tick("A");
        assert!(matches!(cluster.nodes["A"], Node::Follower(_)));

        cluster.advance(1);
        cluster.tick("A");
        assert!(matches!(cluster.nodes["A"], Node::Candidate(_)));
        assert_eq!(cluster.nodes["A"].term(), 1);

        // Both peers got a vote solicitation for the empty log, with no
        // believed leader.
        for id in ["B", "C"] {
            let pending = &cluster.pending[id];
            assert_eq!(pending.len(), 1);
            assert_eq!(
                pending[0].message,
                Message::RequestVote { term: 1, last_log_index: 0, last_log_term: 0 }
            );
            assert_eq!(pending[0].leader, BROADCAST);
        }
    }

    #[test]
    fn election_elects_single_leader() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        assert_eq!(cluster.leader_count(), 1);
        assert_eq!(cluster.nodes["A"].term(), 1);

        // The leader's initial entry is committed and replicated everywhere.
        for id in ["A", "B", "C", "D", "E"] {
            assert_eq!(cluster.log_of(id).last_index(), 1, "log on {id}");
            assert_eq!(cluster.log_of(id).commit_index(), 1, "commit on {id}");
        }
    }

    /// Two simultaneous candidates can't both win: votes are granted once
    /// per term, and the loser defers to the winner's appends.
    #[test]
    fn election_safety_on_split_vote() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.advance(ELECTION);
        cluster.tick("A");
        cluster.tick("B");
        cluster.stabilize();

        assert!(cluster.is_leader("A"));
        assert_eq!(cluster.leader_count(), 1);
        assert!(matches!(cluster.nodes["B"], Node::Follower(_)));
        assert_eq!(cluster.nodes["B"].term(), 1);
    }

    /// A candidate whose log is missing committed entries can't win an
    /// election, and its higher term deposes the leader without electing
    /// anyone.
    #[test]
    fn vote_denied_for_stale_log() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        cluster.partition("E");
        cluster.put("A", "C1", "m1", "x", "1");
        cluster.stabilize();
        cluster.client_replies("C1");

        cluster.heal();
        cluster.advance(ELECTION);
        cluster.tick("E");
        cluster.stabilize();
        assert!(matches!(cluster.nodes["E"], Node::Candidate(_)));
        assert_eq!(cluster.leader_count(), 0);

        // The old leader's complete log wins the re-election.
        cluster.elect("A");
        assert_eq!(cluster.read("A", "x"), "1");
    }

    #[test]
    fn put_commits_and_replies() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        cluster.put("A", "C1", "m1", "x", "1");
        cluster.stabilize();

        assert_eq!(cluster.client_replies("C1"), vec![cluster.ok_reply("A", "C1", "m1", None)]);

        // Followers apply the write once the commit index reaches them.
        cluster.heartbeat_round();
        for id in ["A", "B", "C", "D", "E"] {
            assert_eq!(cluster.read(id, "x"), "1", "state machine on {id}");
        }
    }

    #[test]
    fn non_leader_redirects_to_leader() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");

        cluster.put("B", "C1", "m2", "x", "1");
        let replies = cluster.client_replies("C1");
        assert_eq!(
            replies,
            vec![Envelope {
                src: "B".into(),
                dst: "C1".into(),
                leader: "A".into(),
                message: Message::Redirect { mid: "m2".into() },
            }]
        );

        cluster.get("C", "C1", "m3", "x");
        let replies = cluster.client_replies("C1");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].leader, "A");
        assert_eq!(replies[0].message, Message::Redirect { mid: "m3".into() });
    }

    #[test]
    fn get_missing_key_returns_empty() {
        let mut cluster = Cluster::new(&["A", "B", "C"]);
        cluster.elect("A");
        cluster.get("A", "C1", "m4", "zzz");
        cluster.stabilize();
        assert_eq!(
            cluster.client_replies("C1"),
            vec![cluster.ok_reply("A", "C1", "m4", Some(""))]
        );
    }

    #[test]
    fn duplicate_put_acks_again_after_commit() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        cluster.put("A", "C1", "m5", "y", "7");
        cluster.stabilize();
        assert_eq!(cluster.client_replies("C1").len(), 1);

        // The client never saw the ack and retries with the same MID.
        cluster.put("A", "C1", "m5", "y", "7");
        cluster.stabilize();
        assert_eq!(cluster.client_replies("C1"), vec![cluster.ok_reply("A", "C1", "m5", None)]);

        // Exactly one committed entry carries the MID.
        let log = cluster.log_of("A");
        assert_eq!(log.scan(..).iter().filter(|e| e.mid == "m5").count(), 1);
        assert!(log.commit_index() >= 2);
    }

    #[test]
    fn duplicate_put_acked_while_in_flight() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");

        // Deliver the put to the leader but hold its append traffic, then
        // retry: the duplicate is acked immediately, the original when the
        // write commits.
        cluster.put("A", "C1", "m6", "z", "1");
        cluster.put("A", "C1", "m6", "z", "1");
        assert_eq!(cluster.client_replies("C1"), vec![cluster.ok_reply("A", "C1", "m6", None)]);

        cluster.stabilize();
        assert_eq!(cluster.client_replies("C1"), vec![cluster.ok_reply("A", "C1", "m6", None)]);
        let log = cluster.log_of("A");
        assert_eq!(log.scan(..).iter().filter(|e| e.mid == "m6").count(), 1);
    }

    /// A leader cut off from the cluster must not answer reads: it steps
    /// down within the response timeout, and the client's retry against
    /// the new leader sees the committed value.
    #[test]
    fn read_freshness_on_deposed_leader() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        cluster.put("A", "C1", "m1", "x", "1");
        cluster.stabilize();
        cluster.client_replies("C1");

        cluster.partition("A");
        cluster.advance(1);
        cluster.get("A", "C2", "m3", "x");
        cluster.stabilize();
        assert_eq!(cluster.client_replies("C2"), vec![]);

        cluster.elect("B");
        assert!(matches!(cluster.nodes["A"], Node::Follower(_)), "deposed leader kept leading");
        assert_eq!(cluster.client_replies("C2"), vec![], "stale read was answered");

        cluster.get("B", "C2", "m3", "x");
        cluster.stabilize();
        assert_eq!(
            cluster.client_replies("C2"),
            vec![cluster.ok_reply("B", "C2", "m3", Some("1"))]
        );
    }

    /// A rejoining ex-leader with a conflicting uncommitted tail truncates
    /// it and adopts the new leader's entries.
    #[test]
    fn log_repair_replaces_uncommitted_tail() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");
        cluster.put("A", "C1", "m1", "a", "1");
        cluster.stabilize();
        cluster.client_replies("C1");

        // A accepts a write it can no longer replicate.
        cluster.partition("A");
        cluster.put("A", "C1", "m2", "a", "2");
        assert_eq!(cluster.log_of("A").last_index(), 3);

        // B takes over and commits a different write at the same index.
        cluster.elect("B");
        cluster.put("B", "C2", "m3", "a", "3");
        cluster.stabilize();

        cluster.heal();
        cluster.heartbeat_round();
        assert_eq!(cluster.log_of("A").scan(..), cluster.log_of("B").scan(..));
        assert_eq!(cluster.read("A", "a"), "3");
        assert!(!cluster.log_of("A").contains_mid("m2"));
        // The overwritten write was never acknowledged; the client will
        // retry it.
        assert_eq!(cluster.client_replies("C1"), vec![]);
    }

    /// An entry from an earlier term is only committed once an entry from
    /// the new leader's own term reaches quorum, and the new leader acks
    /// it to the original client.
    #[test]
    fn new_leader_commits_inherited_entries() {
        let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
        cluster.elect("A");

        // The write reaches only B before A loses its majority.
        cluster.partition("A");
        cluster.partition("B");
        cluster.put("A", "C1", "m1", "x", "1");
        cluster.stabilize();
        assert_eq!(cluster.client_replies("C1"), vec![]);
        assert_eq!(cluster.log_of("B").last_index(), 2);
        assert_eq!(cluster.log_of("B").commit_index(), 1);

        // B's log carries the entry into the next term, and committing
        // B's own boot entry commits it everywhere.
        cluster.heal();
        cluster.elect("B");
        assert_eq!(cluster.client_replies("C1"), vec![cluster.ok_reply("B", "C1", "m1", None)]);
        for id in ["A", "B", "C", "D", "E"] {
            assert_eq!(cluster.read(id, "x"), "1", "state machine on {id}");
        }
    }

    /// In-flight reads with the same MID are answered once.
    #[test]
    fn pending_reads_dedupe_by_mid() {
        let mut cluster = Cluster::new(&["A", "B", "C"]);
        cluster.elect("A");
        cluster.partition("A");
        cluster.advance(1);
        cluster.get("A", "C1", "m1", "x");
        cluster.get("A", "C1", "m1", "x");
        cluster.stabilize();
        assert_eq!(cluster.client_replies("C1"), vec![]);

        cluster.heal();
        cluster.advance(HEARTBEAT);
        cluster.tick("A");
        cluster.stabilize();
        assert_eq!(
            cluster.client_replies("C1"),
            vec![cluster.ok_reply("A", "C1", "m1", Some(""))]
        );
    }
}
