//! Demo echo server: every payload segment a peer delivers is sent straight back on the same
//! connection.

use async_trait::async_trait;
use clap::Parser;
use rudp::segment::ReceivedSegment;
use rudp::server::{RudpServer, SegmentDispatcher};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = 8000)]
    port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct EchoDispatcher {
    server: OnceLock<Arc<RudpServer>>,
}

#[async_trait]
impl SegmentDispatcher for EchoDispatcher {
    async fn on_segments(&self, connection_id: u32, segments: &[ReceivedSegment]) {
        let server = self.server.get().expect("server is set before the loop starts");
        for segment in segments {
            info!(
                "echoing {} bytes on connection {:08x}",
                segment.payload().len(),
                connection_id
            );
            server
                .send(
                    connection_id,
                    segment.payload(),
                    Box::new(move |success| {
                        if !success {
                            warn!("echo on connection {:08x} failed", connection_id);
                        }
                    }),
                )
                .await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .init();

    let dispatcher = Arc::new(EchoDispatcher {
        server: OnceLock::new(),
    });
    let server = Arc::new(
        RudpServer::bind(
            SocketAddr::from(([0, 0, 0, 0], args.port)),
            dispatcher.clone(),
        )
        .await?,
    );
    let _ = dispatcher.server.set(server.clone());

    server.recv_loop().await;
    Ok(())
}
