//! Transparent data channel (TDC) framing and the TCP fan-out server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

pub const SYNC_PATTERN: [u8; 4] = [0xFF, 0x00, 0xFF, 0x00];
pub const HEADER_LEN: usize = 8;

/// Frames buffered per client before it starts skipping
const CHANNEL_DEPTH: usize = 256;

/// Prefix a frame with the 8 byte header:
/// sync pattern, big-endian length, 0x00, then 0x00 (type 0) or 0xFF
pub fn frame(data: &[u8], frame_type: u8) -> Vec<u8> {
    let len = data.len().min(u16::MAX as usize) as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + len as usize);
    out.extend_from_slice(&SYNC_PATTERN);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(0x00);
    out.push(if frame_type == 0 { 0x00 } else { 0xFF });
    out.extend_from_slice(&data[..len as usize]);
    out
}

/// Broadcasts framed TDC data to every connected client
pub struct TdcServer {
    tx: broadcast::Sender<Arc<[u8]>>,
    local_addr: SocketAddr,
}

impl TdcServer {
    /// Listen on `port` (all interfaces) and accept clients in the background
    pub async fn bind(port: u16) -> std::io::Result<(Self, JoinHandle<()>)> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> std::io::Result<(Self, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel::<Arc<[u8]>>(CHANNEL_DEPTH);
        info!("TDC data server listening on {}", local_addr);

        let accept_tx = tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("TDC client connected from {}", peer);
                        let frames = BroadcastStream::new(accept_tx.subscribe());
                        tokio::spawn(serve_client(stream, peer, frames));
                    }
                    Err(e) => {
                        error!("TDC accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((Self { tx, local_addr }, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn clients(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Frame and queue `data` for all clients; safe to call from any thread
    pub fn publish(&self, data: &[u8], frame_type: u8) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(Arc::from(frame(data, frame_type)));
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut frames: BroadcastStream<Arc<[u8]>>,
) {
    while let Some(item) = frames.next().await {
        match item {
            Ok(frame) => {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                debug!("TDC client {} lagged by {} frames", peer, n);
            }
        }
    }
    info!("TDC client {} disconnected", peer);
}
