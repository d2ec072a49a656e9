//! Wire messages exchanged between nodes and the proposal type they carry.

use serde_derive::{Deserialize, Serialize};

/// A peer's address and its position in the fixed membership.
///
/// `num` seeds this node's proposal numbers and is also the key used for
/// leader rotation (`(num + 1) mod N`). `is_leader` is a hint copied around
/// with the rest of the membership view; it never gates safety.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeLocation {
    pub host: String,
    pub port: u16,
    pub num: u64,
    pub is_leader: bool,
}

impl NodeLocation {
    pub fn new(host: impl Into<String>, port: u16, num: u64) -> Self {
        NodeLocation { host: host.into(), port, num, is_leader: false }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An immutable `(csn, psn, value)` triple. `psn` is globally unique across
/// all proposers for a given `csn` because every node seeds its own counter
/// at `num` and advances it by `+N`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Proposal {
    pub csn: u64,
    pub psn: u64,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Heartbeat {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrepareRequest {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
    pub csn: u64,
    pub psn: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrepareResponse {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
    pub csn: u64,
    pub min_psn: u64,
    pub accepted_proposal: Option<Proposal>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AcceptRequest {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
    pub proposal: Proposal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AcceptNotification {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
    pub proposal: Proposal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewLeaderNotification {
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
    pub num: u64,
}

/// Every message kind a node can send or receive. Self-describing on the
/// wire: one value, one connection, no extra framing (see `transport`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    Heartbeat(Heartbeat),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    AcceptRequest(AcceptRequest),
    AcceptNotification(AcceptNotification),
    NewLeaderNotification(NewLeaderNotification),
}

impl Message {
    pub fn sender(&self) -> &NodeLocation {
        match self {
            Message::Heartbeat(m) => &m.sender,
            Message::PrepareRequest(m) => &m.sender,
            Message::PrepareResponse(m) => &m.sender,
            Message::AcceptRequest(m) => &m.sender,
            Message::AcceptNotification(m) => &m.sender,
            Message::NewLeaderNotification(m) => &m.sender,
        }
    }

    pub fn receiver(&self) -> &NodeLocation {
        match self {
            Message::Heartbeat(m) => &m.receiver,
            Message::PrepareRequest(m) => &m.receiver,
            Message::PrepareResponse(m) => &m.receiver,
            Message::AcceptRequest(m) => &m.receiver,
            Message::AcceptNotification(m) => &m.receiver,
            Message::NewLeaderNotification(m) => &m.receiver,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "Heartbeat",
            Message::PrepareRequest(_) => "PrepareRequest",
            Message::PrepareResponse(_) => "PrepareResponse",
            Message::AcceptRequest(_) => "AcceptRequest",
            Message::AcceptNotification(_) => "AcceptNotification",
            Message::NewLeaderNotification(_) => "NewLeaderNotification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_receiver_are_accessible_uniformly_across_kinds() {
        let a = NodeLocation::new("127.0.0.1", 9000, 0);
        let b = NodeLocation::new("127.0.0.1", 9001, 1);

        let m = Message::PrepareRequest(PrepareRequest {
            sender: a.clone(),
            receiver: b.clone(),
            csn: 0,
            psn: 0,
        });

        assert_eq!(m.sender(), &a);
        assert_eq!(m.receiver(), &b);
        assert_eq!(m.kind(), "PrepareRequest");
    }

    #[test]
    fn proposal_round_trips_through_bincode() {
        let p = Proposal { csn: 3, psn: 7, value: "X".to_string() };
        let bytes = bincode::serialize(&p).unwrap();
        let decoded: Proposal = bincode::deserialize(&bytes).unwrap();
        assert_eq!(p, decoded);
    }
}
