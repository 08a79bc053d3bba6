//! Keystone server node executable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use keystone::{
    pf_error, pf_warn, ClusterConfig, KeystoneError, KeystoneNode, NodeId,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Node ID of myself.
    #[arg(short, long)]
    id: NodeId,

    /// Key-value API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// List of all cluster nodes' peer-peer addresses, the order of which
    /// maps to node IDs.
    /// Example: '-n host1:p2p_port1 -n host2:p2p_port2 -n host3:p2p_port3'.
    #[arg(short, long)]
    nodes: Vec<SocketAddr>,

    /// List of master node IDs.
    #[arg(short, long)]
    masters: Vec<NodeId>,

    /// List of replica node IDs.
    #[arg(short, long)]
    replicas: Vec<NodeId>,

    /// Write quorum threshold; 0 means majority of masters.
    #[arg(short, long, default_value_t = 0)]
    w: u8,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Optional TOML string of server configuration parameters.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitizes command line arguments, returning `Ok(cluster_config)` on
    /// success or `Err(KeystoneError)` on any error.
    fn sanitize(&self) -> Result<ClusterConfig, KeystoneError> {
        // check for duplicate node addresses
        let mut nodes_set = HashSet::new();
        for addr in self.nodes.iter() {
            if nodes_set.contains(addr) {
                return Err(KeystoneError(format!(
                    "duplicate node address '{}' given",
                    addr
                )));
            }
            nodes_set.insert(addr);
        }

        if (self.id as usize) >= self.nodes.len() {
            return Err(KeystoneError(format!(
                "invalid node ID {} / {}",
                self.id,
                self.nodes.len()
            )));
        }
        let my_addr = self.nodes[self.id as usize];

        if self.api_port <= 1024 {
            return Err(KeystoneError(format!(
                "invalid api_port {}",
                self.api_port
            )));
        }
        if self.api_port == my_addr.port() {
            return Err(KeystoneError(format!(
                "api_port == p2p port {}",
                self.api_port
            )));
        }
        if self.threads < 2 {
            return Err(KeystoneError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        for &id in self.masters.iter().chain(self.replicas.iter()) {
            if (id as usize) >= self.nodes.len() {
                return Err(KeystoneError(format!(
                    "membership ID {} out of range / {}",
                    id,
                    self.nodes.len()
                )));
            }
        }

        let w = if self.w == 0 {
            ClusterConfig::majority(self.masters.len())
        } else {
            self.w
        };
        ClusterConfig::new(w, self.masters.clone(), self.replicas.clone())
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), KeystoneError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let init_config = args.sanitize()?;
    let mut addr_book = HashMap::new();
    for (id, &addr) in args.nodes.iter().enumerate() {
        let id = id as NodeId;
        if id != args.id {
            addr_book.insert(id, addr);
        }
    }

    // parse key-value API port
    let api_addr: SocketAddr = format!("127.0.0.1:{}", args.api_port)
        .parse()
        .map_err(|e| {
            KeystoneError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;
    let p2p_addr = args.nodes[args.id as usize];

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-node{}", args.id))
        .build()?;

    // enter tokio runtime, setup the node, and start the main event loop
    runtime.block_on(async move {
        let mut node = KeystoneNode::new_and_setup(
            args.id,
            api_addr,
            p2p_addr,
            addr_book,
            init_config,
            args.config.as_deref(),
        )
        .await?;

        // flip the termination channel on ctrl-c
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                pf_warn!(args.id; "caught ctrl-c, terminating");
                tx_term.send(true).ok();
            }
        });

        node.run(rx_term).await;

        Ok::<(), KeystoneError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exitted: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs {
            id: 1,
            api_port: 52701,
            nodes: vec![
                "127.0.0.1:52800".parse().unwrap(),
                "127.0.0.1:52801".parse().unwrap(),
                "127.0.0.1:52802".parse().unwrap(),
            ],
            masters: vec![0, 1, 2],
            replicas: vec![],
            w: 0,
            threads: 2,
            config: None,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), KeystoneError> {
        let config = base_args().sanitize()?;
        assert_eq!(config.w, 2); // majority of 3
        assert_eq!(config.masters, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() {
        let mut args = base_args();
        args.id = 3;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_nodes() {
        let mut args = base_args();
        args.nodes[2] = args.nodes[0];
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_w() {
        let mut args = base_args();
        args.w = 4;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_membership_out_of_range() {
        let mut args = base_args();
        args.replicas = vec![7];
        assert!(args.sanitize().is_err());
    }
}
