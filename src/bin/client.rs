//! Keystone client executable: issues one API operation per invocation.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use env_logger::Env;

use keystone::{
    pf_error, ApiCommand, ApiResult, ClientApiStub, KeystoneError, NodeId,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Server node's client API address.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    server: SocketAddr,

    #[command(subcommand)]
    op: Operation,
}

/// Client API operations.
#[derive(Subcommand, Debug)]
enum Operation {
    /// Acquire the lock on a key expected absent.
    Lock {
        key: String,
        value: String,
        /// Lease length in millisecs; 0 uses the server default.
        #[arg(short, long, default_value_t = 0)]
        lease_ms: u64,
        /// Per-phase timeout in millisecs; 0 uses the server default.
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Release a held key, proving ownership by value.
    Release {
        key: String,
        value: String,
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Renew the lease on a held key, proving ownership by value.
    Extend {
        key: String,
        value: String,
        #[arg(short, long, default_value_t = 0)]
        lease_ms: u64,
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Non-quorum local-snapshot read of a key.
    Read { key: String },

    /// Broadcast a replacement master/replica membership.
    SetNodes {
        /// Master node IDs.
        #[arg(short, long)]
        masters: Vec<NodeId>,
        /// Replica node IDs.
        #[arg(short, long)]
        replicas: Vec<NodeId>,
    },

    /// Broadcast a replacement write quorum threshold.
    SetW { w: u8 },

    /// Print the contacted node's local state counters.
    Summary,

    /// Probe the quorum round-trip latency.
    Lag,
}

impl Operation {
    fn into_command(self) -> ApiCommand {
        match self {
            Operation::Lock {
                key,
                value,
                lease_ms,
                timeout_ms,
            } => ApiCommand::Lock {
                key,
                value,
                lease_ms,
                timeout_ms,
            },
            Operation::Release {
                key,
                value,
                timeout_ms,
            } => ApiCommand::Release {
                key,
                value,
                timeout_ms,
            },
            Operation::Extend {
                key,
                value,
                lease_ms,
                timeout_ms,
            } => ApiCommand::ExtendLease {
                key,
                value,
                lease_ms,
                timeout_ms,
            },
            Operation::Read { key } => ApiCommand::DirtyRead { key },
            Operation::SetNodes { masters, replicas } => {
                ApiCommand::SetNodes { masters, replicas }
            }
            Operation::SetW { w } => ApiCommand::SetW { w },
            Operation::Summary => ApiCommand::Summary,
            Operation::Lag => ApiCommand::Lag,
        }
    }
}

/// Prints a result in a one-line human-readable form. Returns the desired
/// process exit code.
fn print_result(result: ApiResult) -> ExitCode {
    match result {
        ApiResult::Quorum(stats) => {
            println!(
                "ok: w = {}, voted = {}, committed = {}",
                stats.w, stats.voted, stats.committed
            );
            ExitCode::SUCCESS
        }
        ApiResult::NoQuorum { w, voted } => {
            println!("no quorum: w = {}, voted = {}", w, voted);
            ExitCode::FAILURE
        }
        ApiResult::Value { value } => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        ApiResult::NotFound => {
            println!("not found");
            ExitCode::FAILURE
        }
        ApiResult::Ok => {
            println!("ok");
            ExitCode::SUCCESS
        }
        ApiResult::Summary {
            keys,
            locks,
            log_records,
        } => {
            println!(
                "keys = {}, locks = {}, buffered log records = {}",
                keys, locks, log_records
            );
            ExitCode::SUCCESS
        }
        ApiResult::Lag { elapsed_ms, down } => {
            println!("round-trip = {} ms, down = {}", elapsed_ms, down);
            ExitCode::SUCCESS
        }
        ApiResult::Error { msg } => {
            println!("error: {}", msg);
            ExitCode::FAILURE
        }
    }
}

// Client executable main entrance.
async fn client_main() -> Result<ExitCode, KeystoneError> {
    let args = CliArgs::parse();
    let mut stub = ClientApiStub::new_and_connect(args.server).await?;
    let result = stub.issue(args.op.into_command()).await?;
    Ok(print_result(result))
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    match client_main().await {
        Ok(code) => code,
        Err(e) => {
            pf_error!("client"; "client_main exitted: {}", e);
            ExitCode::FAILURE
        }
    }
}
