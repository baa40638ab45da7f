//! CLI configuration (spec §6, SPEC_FULL §4.13).
//!
//! A thin `clap` derive surface, validated into a `Config` the rest of the
//! crate consumes. Mirrors the teacher's `RawConfig`/`Config` split: `Cli`
//! is what the user can type, `Config` is what every module actually needs.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;
use obus_protocol::NodeId;

use crate::sink::SinkKind;

/// `--role` is an initial hint only (spec.md §6): the actual role is always
/// decided by Bully election. A peer started with `--role leader` makes no
/// promise to become leader; it only logs the operator's expectation so a
/// startup log can flag a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RoleHint {
    Leader,
    Follower,
}

impl fmt::Display for RoleHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoleHint::Leader => "leader",
            RoleHint::Follower => "follower",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Parser)]
#[command(name = "peer", about = "A LAN-scoped totally-ordered broadcast peer")]
pub struct Cli {
    /// This peer's node id. Must be unique within the cluster and is used
    /// both as the Bully election priority and to derive this peer's
    /// per-node datagram port (`NODE_UDP_BASE + id`).
    #[arg(long)]
    pub id: NodeId,

    /// Operator's expectation of this peer's role at startup. Purely
    /// informational — election alone decides who actually leads.
    #[arg(long, value_enum)]
    pub role: Option<RoleHint>,

    /// Every node id expected to participate in this cluster, comma
    /// separated (e.g. `--cluster 1,2,3`). Used for quorum-free Bully
    /// election: a peer only campaigns against ids it was told about.
    #[arg(long, value_delimiter = ',')]
    pub cluster: Vec<NodeId>,

    /// TCP port this peer listens on for stream-transport connections
    /// while it is leader. Followers dial whichever port the current
    /// leader advertises, not this one.
    #[arg(long, default_value_t = 7000)]
    pub tcp_port: u16,

    /// IP address to bind listening sockets to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_ip: IpAddr,

    /// Directory the WAL file (`wal_{id}.sqlite3`) is created in.
    #[arg(long, default_value = ".")]
    pub wal_dir: PathBuf,

    /// Which application sink to deliver orders to.
    #[arg(long, value_enum, default_value_t = SinkKind::Log)]
    pub ui: SinkKind,

    /// Run in single-host mode: discovery broadcasts also target
    /// 127.0.0.1 so peers sharing one machine (where link-local broadcast
    /// degenerates to a single host) can still find each other.
    #[arg(long, default_value_t = false)]
    pub single_host: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster list must include this peer's own id ({0})")]
    SelfNotInCluster(NodeId),
    #[error("cluster list must have at least one member")]
    EmptyCluster,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub id: NodeId,
    pub role_hint: Option<RoleHint>,
    pub cluster: Vec<NodeId>,
    pub tcp_port: u16,
    pub bind_ip: IpAddr,
    pub wal_dir: PathBuf,
    pub ui: SinkKind,
    pub single_host: bool,
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, ConfigError> {
        if cli.cluster.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        if !cli.cluster.contains(&cli.id) {
            return Err(ConfigError::SelfNotInCluster(cli.id));
        }
        Ok(Config {
            id: cli.id,
            role_hint: cli.role,
            cluster: cli.cluster,
            tcp_port: cli.tcp_port,
            bind_ip: cli.bind_ip,
            wal_dir: cli.wal_dir,
            ui: cli.ui,
            single_host: cli.single_host,
        })
    }
}

impl Config {
    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir.join(format!("wal_{}.sqlite3", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            id: 1,
            role: None,
            cluster: vec![1, 2, 3],
            tcp_port: 7000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            wal_dir: PathBuf::from("."),
            ui: SinkKind::Log,
            single_host: false,
        }
    }

    #[test]
    fn rejects_a_cluster_list_missing_the_local_id() {
        let mut cli = base_cli();
        cli.cluster = vec![2, 3];
        let err = Config::try_from(cli).unwrap_err();
        assert!(matches!(err, ConfigError::SelfNotInCluster(1)));
    }

    #[test]
    fn rejects_an_empty_cluster_list() {
        let mut cli = base_cli();
        cli.cluster = vec![];
        let err = Config::try_from(cli).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCluster));
    }

    #[test]
    fn wal_path_encodes_the_node_id() {
        let cfg = Config::try_from(base_cli()).unwrap();
        assert_eq!(cfg.wal_path(), PathBuf::from("./wal_1.sqlite3"));
    }
}
