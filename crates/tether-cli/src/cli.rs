//! Clap CLI definitions for tether.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tether serve                          Host PingPongService and RemotePerformanceService
  tether serve --listen tcp://0.0.0.0:9559
  tether ping tcp://127.0.0.1:9559      Hand an object to PingPongService and take it back
  tether bench --count 20               Measure round trips through RemotePerformanceService
  tether services                       List the services a peer has registered";

/// Tether: a distributed object bus.
#[derive(Parser)]
#[command(name = "tether", version, about = "Tether: a distributed object bus", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.tether/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the endpoint name sent during the handshake.
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Override the shared secret used to authenticate peers.
    #[arg(long, global = true)]
    pub secret: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Listen for peers and host the test services until interrupted.
    Serve {
        /// Address to listen on (overrides the config file).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Give a local object to a remote PingPongService and take it back.
    Ping {
        /// Peer address (defaults to the configured listen address).
        url: Option<String>,
    },
    /// Measure call and property round trips through RemotePerformanceService.
    Bench {
        /// Peer address (defaults to the configured listen address).
        url: Option<String>,
        /// Measurements per operation.
        #[arg(long, default_value_t = 10)]
        count: i32,
    },
    /// List the services registered on a peer.
    Services {
        /// Peer address (defaults to the configured listen address).
        url: Option<String>,
    },
}
