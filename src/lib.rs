//! Multi-decree Paxos: proposer, acceptor, and learner co-resident in every
//! node, talking over one TCP connection per message (see `transport`) and
//! serialized through a single actor mailbox (see `node`).

pub mod configurations;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod storage;
pub mod transport;

pub use configurations::NodeConfig;
pub use error::Error;
pub use message::{Message, NodeLocation, Proposal};
pub use node::Node;
