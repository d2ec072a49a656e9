//! Sends one serialized message per outbound TCP connection and feeds
//! inbound messages into the dispatcher's mailbox.
//!
//! `broadcast` fans a message out to every peer, including this node —
//! self-delivery is posted onto the same mailbox the network listener uses,
//! so the dispatcher never re-enters itself while broadcasting (§5, §9).
//! `unicast` bounds the whole connect-write-close sequence by one deadline;
//! on timeout against a peer flagged leader it reports a `LeaderTimeout`
//! event and retries once, per §4.2/§4.5.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Error;
use crate::message::{Message, NodeLocation};
use crate::node::Event;

#[derive(Clone)]
pub struct Transport {
    event_tx: UnboundedSender<Event>,
    deadline: Duration,
}

impl Transport {
    pub fn new(event_tx: UnboundedSender<Event>, deadline: Duration) -> Self {
        Transport { event_tx, deadline }
    }

    /// Delivers `make(peer)` to every peer in `peers`, including the one
    /// whose `num` matches `local_num`.
    pub fn broadcast<F>(&self, peers: &[NodeLocation], local_num: u64, make: F)
    where
        F: Fn(&NodeLocation) -> Message,
    {
        for peer in peers {
            let msg = make(peer);
            if peer.num == local_num {
                if self.event_tx.send(Event::Inbound(msg)).is_err() {
                    log::error!("dispatcher mailbox closed; dropping self-delivered message");
                }
            } else {
                self.unicast(peer.clone(), msg);
            }
        }
    }

    /// Sends one message to one peer, asynchronously, applying the
    /// timeout/retry/leader-rotation contract of §4.2. Does not block the
    /// caller — the send happens on a spawned task.
    pub fn unicast(&self, peer: NodeLocation, msg: Message) {
        let event_tx = self.event_tx.clone();
        let deadline = self.deadline;

        tokio::spawn(async move {
            match send_once(&peer, &msg, deadline).await {
                Ok(()) => {}
                Err(Error::Timeout(_)) => {
                    log::warn!("unicast to node {} ({}) timed out", peer.num, peer.addr());

                    if peer.is_leader {
                        if event_tx.send(Event::LeaderTimeout { num: peer.num }).is_err() {
                            log::error!("dispatcher mailbox closed; cannot trigger leader rotation");
                        }

                        if let Err(e) = send_once(&peer, &msg, deadline).await {
                            log::error!("retry of unicast to node {} also failed: {}", peer.num, e);
                        }
                    } else {
                        log::error!(
                            "node {} presumed crashed (send deadline exceeded); dropping {} message",
                            peer.num,
                            msg.kind()
                        );
                    }
                }
                Err(e) => {
                    log::error!("unicast to node {} failed: {}; dropping message", peer.num, e);
                }
            }
        });
    }
}

async fn send_once(peer: &NodeLocation, msg: &Message, deadline: Duration) -> Result<(), Error> {
    let bytes = bincode::serialize(msg)?;

    let attempt = async {
        let mut stream = TcpStream::connect(peer.addr())
            .await
            .map_err(|e| Error::PeerIo(peer.addr(), e))?;
        stream.write_all(&bytes).await.map_err(|e| Error::PeerIo(peer.addr(), e))?;
        stream.shutdown().await.map_err(|e| Error::PeerIo(peer.addr(), e))?;
        Ok(())
    };

    tokio::time::timeout(deadline, attempt)
        .await
        .map_err(|_| Error::Timeout(peer.addr()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn broadcast_self_delivers_without_touching_the_network() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(event_tx, Duration::from_millis(100));

        let local = NodeLocation::new("127.0.0.1", 9000, 0);
        let peers = vec![local.clone()];

        transport.broadcast(&peers, 0, |peer| {
            Message::Heartbeat(crate::message::Heartbeat { sender: local.clone(), receiver: peer.clone() })
        });

        let event = event_rx.recv().await.expect("self-delivery should post an event");
        match event {
            Event::Inbound(Message::Heartbeat(_)) => {}
            other => panic!("expected an inbound heartbeat, got {:?}", std::mem::discriminant(&other)),
        }
    }

    #[tokio::test]
    async fn unicast_to_an_unreachable_non_leader_does_not_trigger_rotation() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(event_tx, Duration::from_millis(50));

        // Port 0 on loopback never accepts; connect fails fast (not a timeout),
        // which is still a dropped, non-rotation-triggering path.
        let unreachable = NodeLocation::new("127.0.0.1", 1, 1);
        let local = NodeLocation::new("127.0.0.1", 9000, 0);

        transport.unicast(
            unreachable,
            Message::Heartbeat(crate::message::Heartbeat { sender: local.clone(), receiver: local }),
        );

        let outcome = tokio::time::timeout(Duration::from_millis(500), event_rx.recv()).await;
        assert!(outcome.is_err() || outcome.unwrap().is_none(), "no LeaderTimeout event should be posted");
    }
}
