//! Command line interface for the `shuffle-transport` binary.

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Command line arguments for the `shuffle-transport` binary.
#[derive(Debug, Parser)]
#[command(
    name = "shuffle-transport",
    version,
    about = "Serve files beneath a directory as shuffle transport streams"
)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:7337")]
    pub bind: SocketAddr,

    /// Directory whose files are served as streams.
    #[arg(short, long)]
    pub root: PathBuf,

    /// Close connections that fetch while this many transfers are in flight.
    #[arg(long)]
    pub max_chunks_in_flight: Option<u64>,

    /// Largest accepted frame in bytes.
    #[arg(long)]
    pub max_frame_length: Option<usize>,
}
