//! The fixed set of peer endpoints and the singleton "leader" hint flag.
//!
//! The leader flag is advisory: it only biases retransmission decisions in
//! `transport`. Consensus safety holds no matter which node, if any, is
//! currently believed to be leader.

use crate::message::NodeLocation;

#[derive(Debug, Clone)]
pub struct Membership {
    local_num: u64,
    peers: Vec<NodeLocation>,
}

impl Membership {
    pub fn new(local_num: u64, peers: Vec<NodeLocation>) -> Self {
        Membership { local_num, peers }
    }

    pub fn set_peers(&mut self, peers: Vec<NodeLocation>) {
        self.peers = peers;
    }

    pub fn peers(&self) -> &[NodeLocation] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// This node becomes leader; every other peer's flag is cleared.
    pub fn become_leader(&mut self) {
        self.set_leader_by_num(self.local_num);
    }

    /// The peer whose `num` matches becomes leader; every other peer's flag
    /// is cleared. Used both locally and on `NewLeaderNotification` receipt.
    pub fn set_leader_by_num(&mut self, num: u64) {
        for peer in &mut self.peers {
            peer.is_leader = peer.num == num;
        }
    }

    pub fn is_leader(&self) -> bool {
        self.peers.iter().any(|p| p.num == self.local_num && p.is_leader)
    }

    pub fn current_leader(&self) -> Option<&NodeLocation> {
        self.peers.iter().find(|p| p.is_leader)
    }

    pub fn local_num(&self) -> u64 {
        self.local_num
    }

    pub fn local(&self) -> Option<&NodeLocation> {
        self.peers.iter().find(|p| p.num == self.local_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(num: u64) -> NodeLocation {
        NodeLocation::new("127.0.0.1", 9000 + num as u16, num)
    }

    #[test]
    fn become_leader_clears_other_flags() {
        let mut m = Membership::new(1, vec![peer(0), peer(1), peer(2)]);
        m.set_leader_by_num(0);
        m.become_leader();

        assert!(m.is_leader());
        assert_eq!(m.peers().iter().filter(|p| p.is_leader).count(), 1);
        assert_eq!(m.current_leader().unwrap().num, 1);
    }

    #[test]
    fn new_leader_notification_sets_exactly_one_flag() {
        let mut m = Membership::new(0, vec![peer(0), peer(1), peer(2)]);
        m.become_leader();
        m.set_leader_by_num(2);

        assert!(!m.is_leader());
        assert_eq!(m.current_leader().unwrap().num, 2);
        assert_eq!(m.peers().iter().filter(|p| p.is_leader).count(), 1);
    }

    #[test]
    fn no_leader_is_a_valid_state() {
        let m = Membership::new(0, vec![peer(0), peer(1), peer(2)]);
        assert!(!m.is_leader());
        assert!(m.current_leader().is_none());
    }
}
