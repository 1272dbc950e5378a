//! Serve the files beneath a directory over the shuffle transport.

mod cli;
mod files;

use std::sync::Arc;

use clap::Parser;
use shuffle_transport::{TransportConf, TransportServer};

use crate::files::DirectoryHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let mut conf = TransportConf::default();
    if let Some(max) = cli.max_chunks_in_flight {
        conf = conf.with_max_chunks_being_transferred(max);
    }
    if let Some(len) = cli.max_frame_length {
        conf = conf.with_max_frame_length(len);
    }

    let handler = Arc::new(DirectoryHandler::new(cli.root)?);
    TransportServer::new(handler)
        .with_conf(conf)
        .bind(cli.bind)?
        .run()
        .await?;
    Ok(())
}
