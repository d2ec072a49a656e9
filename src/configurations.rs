//! Reads the fixed peer membership and the timing constants (§6) from a
//! TOML configuration file, the way the rest of this crate's lineage reads
//! `Config.toml`: merge the file into a `config::Config`, then deserialize.
//!
//! Expected shape:
//!
//! ```toml
//! [peers.0]
//! host = "127.0.0.1"
//! port = 9000
//!
//! [peers.1]
//! host = "127.0.0.1"
//! port = 9001
//!
//! [timing]
//! socket_deadline_ms = 5000
//! propose_timeout_ms = 10000
//! heartbeat_min_ms = 1000
//! heartbeat_max_ms = 2000
//! ```
//!
//! The `[timing]` table and each of its keys are optional; anything absent
//! falls back to the defaults in `NodeConfig::default`.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, File};
use serde_derive::Deserialize;

use crate::error::Error;
use crate::message::NodeLocation;

#[derive(Deserialize)]
struct PeerEntry {
    host: String,
    port: u16,
}

#[derive(Deserialize, Default)]
struct TimingSection {
    socket_deadline_ms: Option<u64>,
    propose_timeout_ms: Option<u64>,
    heartbeat_min_ms: Option<u64>,
    heartbeat_max_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RawConfig {
    peers: HashMap<String, PeerEntry>,
    #[serde(default)]
    timing: TimingSection,
}

/// The configurable knobs named in §6, with the defaults given there.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub socket_deadline: Duration,
    pub propose_timeout: Duration,
    pub heartbeat_min: Duration,
    pub heartbeat_max: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            socket_deadline: Duration::from_millis(5000),
            propose_timeout: Duration::from_millis(10_000),
            heartbeat_min: Duration::from_millis(1000),
            heartbeat_max: Duration::from_millis(2000),
        }
    }
}

/// Reads both the peer set and the timing overrides from one file.
pub fn load(file_name: &str) -> Result<(Vec<NodeLocation>, NodeConfig), Error> {
    let raw = read_raw(file_name)?;

    let mut peers: Vec<NodeLocation> = raw
        .peers
        .iter()
        .map(|(num, entry)| {
            let num: u64 = num.parse().unwrap_or_else(|_| panic!("peer key {:?} is not a number", num));
            NodeLocation::new(entry.host.clone(), entry.port, num)
        })
        .collect();
    peers.sort_by_key(|p| p.num);

    let defaults = NodeConfig::default();
    let timing = NodeConfig {
        socket_deadline: raw.timing.socket_deadline_ms.map(Duration::from_millis).unwrap_or(defaults.socket_deadline),
        propose_timeout: raw.timing.propose_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.propose_timeout),
        heartbeat_min: raw.timing.heartbeat_min_ms.map(Duration::from_millis).unwrap_or(defaults.heartbeat_min),
        heartbeat_max: raw.timing.heartbeat_max_ms.map(Duration::from_millis).unwrap_or(defaults.heartbeat_max),
    };

    Ok((peers, timing))
}

fn read_raw(file_name: &str) -> Result<RawConfig, Error> {
    let mut c = Config::default();
    c.merge(File::with_name(file_name)).map_err(|e| Error::Config(e.to_string()))?;
    c.try_into::<RawConfig>().map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_peers_sorted_by_num_and_timing_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            [peers.2]
            host = "127.0.0.1"
            port = 9002

            [peers.0]
            host = "127.0.0.1"
            port = 9000

            [peers.1]
            host = "127.0.0.1"
            port = 9001
            "#
        )
        .unwrap();

        let (peers, timing) = load(path.to_str().unwrap()).unwrap();

        assert_eq!(peers.iter().map(|p| p.num).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(peers[0].port, 9000);
        assert_eq!(timing.socket_deadline, Duration::from_millis(5000));
        assert_eq!(timing.heartbeat_min, Duration::from_millis(1000));
    }

    #[test]
    fn timing_overrides_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            [peers.0]
            host = "127.0.0.1"
            port = 9000

            [timing]
            socket_deadline_ms = 1234
            "#
        )
        .unwrap();

        let (_, timing) = load(path.to_str().unwrap()).unwrap();
        assert_eq!(timing.socket_deadline, Duration::from_millis(1234));
        assert_eq!(timing.propose_timeout, Duration::from_millis(10_000));
    }
}
