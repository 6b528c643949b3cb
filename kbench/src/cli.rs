use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "kbench",
    author,
    version,
    about = "Broker benchmark job engine with an HTTP API and live dashboard feed"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the job API and websocket event feed.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8080", env = "KBENCH_BIND")]
    pub bind: SocketAddr,

    /// Base client id; per-job producer/consumer client ids derive from it.
    #[arg(long, default_value = "kbench", env = "KBENCH_CLIENT_ID")]
    pub client_id: String,

    /// Topic to pre-create in the loopback broker. Repeatable.
    #[arg(long = "topic", value_name = "NAME")]
    pub topics: Vec<String>,
}
