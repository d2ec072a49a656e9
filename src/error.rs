//! The error taxonomy handled explicitly at the boundaries named in the
//! component design: transport, stable storage, and message decoding.
//! Everything else is an internal invariant and stays a `debug_assert!`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("peer {0} unreachable: send deadline exceeded")]
    Timeout(String),

    #[error("peer {0} unreachable: {1}")]
    PeerIo(String, std::io::Error),

    #[error("listener I/O fault: {0}")]
    ListenerIo(std::io::Error),

    #[error("could not read configuration: {0}")]
    Config(String),

    #[error("could not decode message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("stable storage I/O fault: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("node actor is no longer running")]
    ActorGone,
}
