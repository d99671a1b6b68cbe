//! Demo upload client: streams 1 MiB of random data to an echo server in 1 KiB chunks, each
//! chunk sent once the previous one completed, then disconnects and verifies the echoed
//! bytes against what was sent.

use anyhow::bail;
use async_trait::async_trait;
use clap::Parser;
use rudp::segment::ReceivedSegment;
use rudp::server::{RudpServer, SegmentDispatcher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::lookup_host;
use tracing::{info, Level};

const UPLOAD_SIZE: usize = 1024 * 1024;
const CHUNK_SIZE: usize = 1024;

#[derive(Parser)]
struct Args {
    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,

    #[clap(short, long, default_value_t = 8000)]
    remote_port: u16,

    #[clap(short, long, default_value_t = 8001)]
    self_port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

/// Accumulates everything the server echoes back.
struct CollectingDispatcher {
    received: Mutex<Vec<u8>>,
}

#[async_trait]
impl SegmentDispatcher for CollectingDispatcher {
    async fn on_segments(&self, _connection_id: u32, segments: &[ReceivedSegment]) {
        let mut received = self.received.lock().unwrap();
        for segment in segments {
            received.extend_from_slice(segment.payload());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .init();

    let remote_addr = lookup_host((args.host.as_str(), args.remote_port))
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {} to an IPv4 address", args.host))?;

    let dispatcher = Arc::new(CollectingDispatcher {
        received: Mutex::new(Vec::with_capacity(UPLOAD_SIZE)),
    });
    let server = Arc::new(
        RudpServer::bind(
            SocketAddr::from(([0, 0, 0, 0], args.self_port)),
            dispatcher.clone(),
        )
        .await?,
    );

    let server_ = server.clone();
    tokio::spawn(async move { server_.recv_loop().await });

    let data: Vec<u8> = (0..UPLOAD_SIZE).map(|_| rand::random()).collect();

    let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    let closed_tx = Mutex::new(Some(closed_tx));
    server
        .connect(
            remote_addr,
            move |success, connection_id| {
                let _ = connected_tx.send((success, connection_id));
            },
            move || {
                if let Some(tx) = closed_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            },
        )
        .await;

    let (success, connection_id) = connected_rx.await?;
    if !success {
        bail!("connect to {:?} failed", remote_addr);
    }
    info!("connected to {:?} as {:08x}", remote_addr, connection_id);

    for chunk in data.chunks(CHUNK_SIZE) {
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
        server
            .send(
                connection_id,
                chunk,
                Box::new(move |success| {
                    let _ = sent_tx.send(success);
                }),
            )
            .await;
        if !sent_rx.await? {
            bail!("send failed, aborting upload");
        }
    }
    info!("upload complete, disconnecting");

    server.disconnect(connection_id).await;
    closed_rx.await?;

    let received = dispatcher.received.lock().unwrap();
    if *received == data {
        println!("ok");
        Ok(())
    } else {
        println!("corrupted");
        bail!("echoed data does not match ({} of {} bytes)", received.len(), data.len());
    }
}
