//! The proposer/acceptor/learner state machine, co-resident in every node,
//! and the actor that drives it. All mutation happens inside `run_dispatcher`,
//! which is the crate's single mutual-exclusion domain (§5): everything else
//! — the listener, the heartbeat task, the per-slot re-propose timers, and
//! the public `Node` handle — only ever talks to it by posting an `Event`
//! onto one mailbox.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::configurations::NodeConfig;
use crate::error::Error;
use crate::membership::Membership;
use crate::message::{
    AcceptNotification, AcceptRequest, Heartbeat, Message, NewLeaderNotification, NodeLocation,
    PrepareRequest, PrepareResponse, Proposal,
};
use crate::storage::{AcceptorSnapshot, Storage};
use crate::transport::Transport;

/// Messages the dispatcher accepts on its mailbox: decoded network
/// messages, self-delivered broadcasts, timer fires, and the public API
/// calls, all serialized through the same channel.
#[derive(Debug)]
pub(crate) enum Event {
    Inbound(Message),
    Submit { value: String, csn: Option<u64>, reply: oneshot::Sender<u64> },
    RetransmitSlot { csn: u64, generation: u64 },
    HeartbeatTick,
    LeaderTimeout { num: u64 },
    SetPeers { peers: Vec<NodeLocation>, reply: oneshot::Sender<()> },
    BecomeLeader { reply: oneshot::Sender<()> },
    IsLeader { reply: oneshot::Sender<bool> },
    GetDecidedValues { reply: oneshot::Sender<BTreeMap<u64, String>> },
    ClearStableStorage { reply: oneshot::Sender<Result<(), Error>> },
    Shutdown,
}

/// Proposer-side bookkeeping for one csn (§3). `generation` is bumped every
/// time `submit_at` (re)starts a round for this csn, and is compared against
/// the generation a re-propose timer was armed with so a timer that fires
/// just after being superseded is a harmless no-op instead of a stale retry.
struct ProposerSlot {
    num_accept_requests: Option<u64>,
    proposal: Proposal,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct LearnerSlot {
    num_accept_notifications: u64,
    has_learned: bool,
}

struct NodeState {
    local: NodeLocation,
    membership: Membership,
    n: u64,
    psn: u64,
    next_csn: u64,
    acceptor: AcceptorSnapshot,
    storage: Storage,
    proposer_slots: HashMap<u64, ProposerSlot>,
    learner_slots: HashMap<u64, LearnerSlot>,
    chosen_values: BTreeMap<u64, String>,
    transport: Transport,
    config: NodeConfig,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl NodeState {
    fn advance_psn(&mut self) {
        self.psn += self.n;
    }

    fn alloc_csn(&mut self) -> u64 {
        let csn = self.next_csn;
        self.next_csn += 1;
        csn
    }

    fn persist_acceptor(&mut self) {
        if let Err(e) = self.storage.save(&self.acceptor) {
            log::error!(
                "[node {}] stable storage write fault: {}; acceptor state remains in-memory only",
                self.local.num,
                e
            );
        }
    }

    /// `submit(value, csn)` of §4.3: cancels any in-flight round for this
    /// csn, starts a fresh one with the current local psn, arms a
    /// re-propose timer, and broadcasts PrepareRequest.
    fn submit_at(&mut self, value: String, csn: u64) {
        if let Some(old) = self.proposer_slots.get_mut(&csn) {
            if let Some(handle) = old.timer.take() {
                handle.abort();
            }
        }

        let psn = self.psn;
        self.advance_psn();

        let generation = self.proposer_slots.get(&csn).map(|s| s.generation + 1).unwrap_or(0);
        let proposal = Proposal { csn, psn, value };

        self.proposer_slots.insert(
            csn,
            ProposerSlot { num_accept_requests: Some(0), proposal: proposal.clone(), generation, timer: None },
        );

        self.arm_re_propose_timer(csn, generation);

        let local = self.local.clone();
        self.transport.broadcast(self.membership.peers(), local.num, move |peer| {
            Message::PrepareRequest(PrepareRequest {
                sender: local.clone(),
                receiver: peer.clone(),
                csn,
                psn,
            })
        });
    }

    fn arm_re_propose_timer(&mut self, csn: u64, generation: u64) {
        let event_tx = self.event_tx.clone();
        let propose_timeout = self.config.propose_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(propose_timeout).await;
            let _ = event_tx.send(Event::RetransmitSlot { csn, generation });
        });

        if let Some(slot) = self.proposer_slots.get_mut(&csn) {
            slot.timer = Some(handle);
        }
    }

    fn handle_retransmit(&mut self, csn: u64, generation: u64) {
        let stale_or_done = match self.proposer_slots.get(&csn) {
            Some(slot) => slot.generation != generation || slot.num_accept_requests.is_none(),
            None => true,
        };
        if stale_or_done {
            return;
        }

        let value = self.proposer_slots.get(&csn).unwrap().proposal.value.clone();
        log::debug!("[node {}] re-propose timer fired for csn {}", self.local.num, csn);
        self.submit_at(value, csn);
    }

    fn dispatch_message(&mut self, msg: Message) {
        log::debug!(
            "[node {}] dispatching {} from node {}",
            self.local.num,
            msg.kind(),
            msg.sender().num
        );

        match msg {
            Message::Heartbeat(_) => {}
            Message::PrepareRequest(m) => self.handle_prepare_request(m),
            Message::PrepareResponse(m) => self.handle_prepare_response(m),
            Message::AcceptRequest(m) => self.handle_accept_request(m),
            Message::AcceptNotification(m) => self.handle_accept_notification(m),
            Message::NewLeaderNotification(m) => self.handle_new_leader_notification(m),
        }
    }

    /// Acceptor role (§4.3). The `<` (not `<=`) predicate is intentional: a
    /// PrepareRequest whose psn equals the current promise does not raise
    /// it, but the acceptor still replies, so it still counts toward the
    /// proposer's majority (documented Open Question, preserved here).
    fn handle_prepare_request(&mut self, m: PrepareRequest) {
        let min_psn = match self.acceptor.min_psns.get(&m.csn).copied() {
            None => {
                self.acceptor.min_psns.insert(m.csn, m.psn);
                m.psn
            }
            Some(cur) if cur < m.psn => {
                self.acceptor.min_psns.insert(m.csn, m.psn);
                m.psn
            }
            Some(cur) => cur,
        };

        let accepted_proposal = self.acceptor.max_accepted_proposals.get(&m.csn).cloned();
        self.persist_acceptor();

        let local = self.local.clone();
        self.transport.unicast(
            m.sender.clone(),
            Message::PrepareResponse(PrepareResponse {
                sender: local,
                receiver: m.sender,
                csn: m.csn,
                min_psn,
                accepted_proposal,
            }),
        );
    }

    /// Proposer role (§4.3).
    fn handle_prepare_response(&mut self, m: PrepareResponse) {
        let in_flight = matches!(self.proposer_slots.get(&m.csn), Some(s) if s.num_accept_requests.is_some());
        if !in_flight {
            return;
        }

        if let Some(accepted) = &m.accepted_proposal {
            if let Some(slot) = self.proposer_slots.get_mut(&m.csn) {
                if accepted.psn > slot.proposal.psn {
                    slot.proposal = accepted.clone();
                }
            }
        }

        let current_psn = self.proposer_slots.get(&m.csn).unwrap().proposal.psn;

        if m.min_psn > current_psn {
            let value = self.proposer_slots.get(&m.csn).unwrap().proposal.value.clone();
            while self.psn < m.min_psn {
                self.advance_psn();
            }
            self.submit_at(value, m.csn);
            return;
        }

        let majority_reached = {
            let slot = self.proposer_slots.get_mut(&m.csn).unwrap();
            let count = slot.num_accept_requests.unwrap() + 1;
            if count > self.n / 2 {
                slot.num_accept_requests = None;
                if let Some(handle) = slot.timer.take() {
                    handle.abort();
                }
                true
            } else {
                slot.num_accept_requests = Some(count);
                false
            }
        };

        if majority_reached {
            let proposal = self.proposer_slots.get(&m.csn).unwrap().proposal.clone();
            let local = self.local.clone();
            log::debug!("[node {}] majority promise for csn {}, sending AcceptRequest", local.num, m.csn);
            self.transport.broadcast(self.membership.peers(), local.num, move |peer| {
                Message::AcceptRequest(AcceptRequest {
                    sender: local.clone(),
                    receiver: peer.clone(),
                    proposal: proposal.clone(),
                })
            });
        }
    }

    /// Acceptor role (§4.3). Persisted before the AcceptNotification is
    /// broadcast, per the durability ordering guarantee in §5: a learner
    /// must never observe an acceptance that didn't survive a restart.
    fn handle_accept_request(&mut self, m: AcceptRequest) {
        let csn = m.proposal.csn;
        let psn = m.proposal.psn;
        let current_min = self.acceptor.min_psns.get(&csn).copied();

        if let Some(cur) = current_min {
            if psn < cur {
                return;
            }
        }

        // Mirrors the `None` arm of `handle_prepare_request`: an acceptor
        // that never saw this csn's PrepareRequest (dropped message, or it
        // was briefly down) can still observe the AcceptRequest broadcast
        // directly, with no prior `min_psns` entry to compare against.
        self.acceptor
            .min_psns
            .entry(csn)
            .and_modify(|e| *e = (*e).max(psn))
            .or_insert(psn);

        self.acceptor.max_accepted_proposals.insert(csn, m.proposal.clone());
        debug_assert!(psn <= *self.acceptor.min_psns.get(&csn).unwrap());
        self.persist_acceptor();

        let local = self.local.clone();
        let proposal = m.proposal.clone();
        self.transport.broadcast(self.membership.peers(), local.num, move |peer| {
            Message::AcceptNotification(AcceptNotification {
                sender: local.clone(),
                receiver: peer.clone(),
                proposal: proposal.clone(),
            })
        });
    }

    /// Learner role (§4.3). Idempotent: once a csn is learned, further
    /// notifications are ignored outright.
    fn handle_accept_notification(&mut self, m: AcceptNotification) {
        let csn = m.proposal.csn;
        let slot = self.learner_slots.entry(csn).or_default();
        if slot.has_learned {
            return;
        }

        slot.num_accept_notifications += 1;
        if slot.num_accept_notifications > self.n / 2 {
            slot.has_learned = true;
            self.chosen_values.insert(csn, m.proposal.value.clone());
            log::info!("[node {}] csn {} decided: {:?}", self.local.num, csn, m.proposal.value);
        }
    }

    fn handle_new_leader_notification(&mut self, m: NewLeaderNotification) {
        log::debug!("[node {}] new leader hint: node {}", self.local.num, m.num);
        self.membership.set_leader_by_num(m.num);
    }

    fn handle_heartbeat_tick(&mut self) {
        let local = self.local.clone();
        self.transport.broadcast(self.membership.peers(), local.num, move |peer| {
            Message::Heartbeat(Heartbeat { sender: local.clone(), receiver: peer.clone() })
        });
    }

    /// Triggered by the transport when a unicast against the flagged leader
    /// times out (§4.5).
    fn handle_leader_timeout(&mut self, num: u64) {
        let new_num = (num + 1) % self.n;
        log::warn!("[node {}] node {} presumed crashed; rotating leader hint to node {}", self.local.num, num, new_num);
        self.membership.set_leader_by_num(new_num);

        let local = self.local.clone();
        self.transport.broadcast(self.membership.peers(), local.num, move |peer| {
            Message::NewLeaderNotification(NewLeaderNotification {
                sender: local.clone(),
                receiver: peer.clone(),
                num: new_num,
            })
        });
    }
}

async fn run_dispatcher(mut state: NodeState, mut event_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Inbound(msg) => state.dispatch_message(msg),
            Event::Submit { value, csn, reply } => {
                let csn = csn.unwrap_or_else(|| state.alloc_csn());
                state.submit_at(value, csn);
                let _ = reply.send(csn);
            }
            Event::RetransmitSlot { csn, generation } => state.handle_retransmit(csn, generation),
            Event::HeartbeatTick => state.handle_heartbeat_tick(),
            Event::LeaderTimeout { num } => state.handle_leader_timeout(num),
            Event::SetPeers { peers, reply } => {
                state.membership.set_peers(peers);
                let _ = reply.send(());
            }
            Event::BecomeLeader { reply } => {
                state.membership.become_leader();
                let _ = reply.send(());
            }
            Event::IsLeader { reply } => {
                let _ = reply.send(state.membership.is_leader());
            }
            Event::GetDecidedValues { reply } => {
                let _ = reply.send(state.chosen_values.clone());
            }
            Event::ClearStableStorage { reply } => {
                let result = state.storage.clear().map(|()| {
                    state.acceptor = AcceptorSnapshot::default();
                });
                let _ = reply.send(result);
            }
            Event::Shutdown => break,
        }
    }
}

async fn run_listener(listener: TcpListener, event_tx: mpsc::UnboundedSender<Event>) {
    use tokio::io::AsyncReadExt;

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    match stream.read_to_end(&mut buf).await {
                        Ok(_) => match bincode::deserialize::<Message>(&buf) {
                            Ok(msg) => {
                                if event_tx.send(Event::Inbound(msg)).is_err() {
                                    log::error!("dispatcher mailbox closed; dropping inbound message");
                                }
                            }
                            Err(e) => log::error!("decode fault: {}; discarding message", e),
                        },
                        Err(e) => log::error!("listener read fault: {}", e),
                    }
                });
            }
            Err(e) => log::error!("listener accept fault: {}", e),
        }
    }
}

async fn run_heartbeat(event_tx: mpsc::UnboundedSender<Event>, min: Duration, max: Duration) {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis().max(min.as_millis() as u128 + 1) as u64;

    loop {
        let wait_ms = rand::thread_rng().gen_range(min_ms, max_ms);
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        if event_tx.send(Event::HeartbeatTick).is_err() {
            return;
        }
    }
}

/// A handle to a running node. Cloning shares the same mailbox and
/// background tasks; dropping every clone does not stop the node — call
/// `stop` explicitly.
pub struct Node {
    event_tx: mpsc::UnboundedSender<Event>,
    dispatcher: JoinHandle<()>,
    listener: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Node {
    /// Binds the listener, loads the acceptor snapshot from stable storage
    /// (before any message can be accepted, per §4.6), and spawns the
    /// dispatcher, listener, and heartbeat tasks.
    pub async fn start(
        local: NodeLocation,
        peers: Vec<NodeLocation>,
        storage_dir: impl AsRef<Path>,
        config: NodeConfig,
    ) -> Result<Node, Error> {
        let storage = Storage::new(storage_dir.as_ref(), local.num.to_string());
        let acceptor = storage.load();

        let listener = TcpListener::bind(local.addr()).await.map_err(Error::ListenerIo)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(event_tx.clone(), config.socket_deadline);
        let n = peers.len() as u64;

        let state = NodeState {
            psn: local.num,
            local: local.clone(),
            membership: Membership::new(local.num, peers),
            n,
            next_csn: 0,
            acceptor,
            storage,
            proposer_slots: HashMap::new(),
            learner_slots: HashMap::new(),
            chosen_values: BTreeMap::new(),
            transport,
            config,
            event_tx: event_tx.clone(),
        };

        let dispatcher = tokio::spawn(run_dispatcher(state, event_rx));
        let listener_handle = tokio::spawn(run_listener(listener, event_tx.clone()));
        let heartbeat = tokio::spawn(run_heartbeat(event_tx.clone(), config.heartbeat_min, config.heartbeat_max));

        Ok(Node { event_tx, dispatcher, listener: listener_handle, heartbeat })
    }

    /// Injects a new PrepareRequest for a freshly allocated csn. Returns the
    /// csn chosen.
    pub async fn submit(&self, value: impl Into<String>) -> Result<u64, Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx
            .send(Event::Submit { value: value.into(), csn: None, reply })
            .map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)
    }

    /// Injects a new PrepareRequest for a specific csn, overriding any round
    /// currently in flight for it.
    pub async fn submit_at(&self, value: impl Into<String>, csn: u64) -> Result<(), Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx
            .send(Event::Submit { value: value.into(), csn: Some(csn), reply })
            .map_err(|_| Error::ActorGone)?;
        recv.await.map(|_| ()).map_err(|_| Error::ActorGone)
    }

    pub async fn get_decided_values(&self) -> Result<BTreeMap<u64, String>, Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx.send(Event::GetDecidedValues { reply }).map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)
    }

    pub async fn set_peers(&self, peers: Vec<NodeLocation>) -> Result<(), Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx.send(Event::SetPeers { peers, reply }).map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)
    }

    pub async fn become_leader(&self) -> Result<(), Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx.send(Event::BecomeLeader { reply }).map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)
    }

    pub async fn is_leader(&self) -> Result<bool, Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx.send(Event::IsLeader { reply }).map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)
    }

    /// Wipes the acceptor's durable snapshot and resets in-memory acceptor
    /// state to fresh. Intended for test setup/teardown, not for use on a
    /// live multi-node cluster (it throws away the node's promises).
    pub async fn clear_stable_storage(&self) -> Result<(), Error> {
        let (reply, recv) = oneshot::channel();
        self.event_tx.send(Event::ClearStableStorage { reply }).map_err(|_| Error::ActorGone)?;
        recv.await.map_err(|_| Error::ActorGone)?
    }

    /// Stops the listener, heartbeat, and dispatcher tasks. In-flight
    /// unicasts spawned before this call still run to their own deadline.
    pub async fn stop(self) {
        self.listener.abort();
        self.heartbeat.abort();
        let _ = self.event_tx.send(Event::Shutdown);
        let _ = self.dispatcher.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locations(n: u64) -> Vec<NodeLocation> {
        (0..n).map(|num| NodeLocation::new("127.0.0.1", 0, num)).collect()
    }

    async fn start_cluster(n: u64, dir: &Path) -> Vec<Node> {
        // Bind each node to an ephemeral port, then fix up the peer list
        // with the ports the OS actually gave us.
        let mut nodes = Vec::new();
        let mut peers = locations(n);

        for num in 0..n {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port();
            drop(probe);
            peers[num as usize].port = port;
        }

        for num in 0..n {
            let node = Node::start(peers[num as usize].clone(), peers.clone(), dir, NodeConfig::default())
                .await
                .unwrap();
            nodes.push(node);
        }
        nodes
    }

    #[tokio::test]
    async fn single_proposer_no_failures_reaches_agreement() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = start_cluster(3, dir.path()).await;

        let csn = nodes[0].submit("A").await.unwrap();

        let mut learned = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let values = nodes[2].get_decided_values().await.unwrap();
            if values.get(&csn).map(|v| v.as_str()) == Some("A") {
                learned = true;
                break;
            }
        }
        assert!(learned, "all nodes should eventually learn the submitted value");

        for node in nodes {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn out_of_order_slots_decide_independently() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = start_cluster(3, dir.path()).await;

        nodes[0].submit_at("A", 2).await.unwrap();
        nodes[0].submit_at("B", 0).await.unwrap();

        let mut decided = BTreeMap::new();
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            decided = nodes[1].get_decided_values().await.unwrap();
            if decided.len() == 2 {
                break;
            }
        }

        assert_eq!(decided.get(&0).map(String::as_str), Some("B"));
        assert_eq!(decided.get(&2).map(String::as_str), Some("A"));
        assert!(!decided.contains_key(&1));

        for node in nodes {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn become_leader_and_is_leader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = start_cluster(1, dir.path()).await;

        assert!(!nodes[0].is_leader().await.unwrap());
        nodes[0].become_leader().await.unwrap();
        assert!(nodes[0].is_leader().await.unwrap());

        nodes[0].clear_stable_storage().await.unwrap();
        for node in nodes {
            node.stop().await;
        }
    }
}
