use super::{
    Envelope, KvStore, Log, Message, Node, NodeID, Options, Timestamp, BROADCAST, MAX_DATAGRAM,
};
use crate::errinput;
use crate::error::Result;

use crossbeam::channel::Receiver;
use log::{debug, error, info};
use rand::rngs::StdRng;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// A replica server. Owns the consensus node, the UDP endpoint towards the
/// simulator's relay, and the event loop that drives them: the node's
/// outbound channel is drained onto the socket after every transition, and
/// socket waits are bounded by the node's next timer deadline.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    socket: UdpSocket,
    relay: SocketAddr,
    start: Instant,
}

impl Server {
    /// Creates a replica that sends and receives datagrams through the
    /// simulator relay on the given localhost port.
    pub fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        port: u16,
        opts: Options,
        rng: StdRng,
    ) -> Result<Self> {
        if id == BROADCAST || peers.iter().any(|p| *p == BROADCAST) {
            return errinput!("replica IDs can't be the broadcast ID {BROADCAST}");
        }
        if peers.iter().any(|p| *p == id) {
            return errinput!("replica {id} can't be its own peer");
        }
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        let relay = SocketAddr::from(([127, 0, 0, 1], port));
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            id,
            peers.into_iter().collect(),
            Log::new(),
            Box::new(KvStore::new()),
            node_tx,
            opts,
            rng,
        )?;
        Ok(Self { node, node_rx, socket, relay, start: Instant::now() })
    }

    /// Runs the replica until the process is killed. Announces the replica
    /// to the network, then multiplexes inbound datagrams against timer
    /// expiry: block on the socket until the node's next deadline, step
    /// whatever arrives, fire expired timers, and flush outbound messages.
    pub fn serve(self) -> Result<()> {
        let Server { mut node, node_rx, socket, relay, start } = self;
        info!("Replica {} starting, relaying via port {}", node.id(), relay.port());

        let hello = Envelope {
            src: node.id().clone(),
            dst: BROADCAST.into(),
            leader: BROADCAST.into(),
            message: Message::Hello,
        };
        socket.send_to(&hello.encode()?, relay)?;

        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            let now = Self::since(start);
            let deadline = node.next_deadline(now);
            if deadline > now {
                socket.set_read_timeout(Some(Duration::from_millis(deadline - now)))?;
                match socket.recv_from(&mut buf) {
                    Ok((len, _)) => match Envelope::decode(&buf[..len]) {
                        Ok(envelope) if envelope.dst == *node.id() || envelope.dst == BROADCAST => {
                            node = node.step(envelope, Self::since(start))?;
                        }
                        Ok(envelope) => debug!("Ignoring datagram addressed to {}", envelope.dst),
                        Err(err) => error!("Discarding malformed datagram: {err}"),
                    },
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            node = node.tick(Self::since(start))?;

            while let Ok(envelope) = node_rx.try_recv() {
                socket.send_to(&envelope.encode()?, relay)?;
            }
        }
    }

    /// Milliseconds elapsed since the given start time.
    fn since(start: Instant) -> Timestamp {
        start.elapsed().as_millis() as Timestamp
    }
}
