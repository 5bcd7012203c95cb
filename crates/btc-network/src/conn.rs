//! Per-connection task.
//!
//! Each peer slot spawns one of these. The task dials the candidate, then
//! loops between the framed read half and the outbound queue, reporting
//! everything back to the engine as events tagged with the slot index and
//! generation. It holds no engine state; dropping the outbound sender is
//! how the engine tells it to shut down.

use crate::peer::OutboundFrame;
use btc_wire::{FrameCodec, RawFrame, STREAM_BUFFER_CAPACITY};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly EOF from the peer.
    Eof,
    /// Read or framing failure.
    ReadError,
    /// The engine dropped the outbound queue to replace the peer.
    Replaced,
}

/// Connection-level events delivered to the engine.
#[derive(Debug)]
pub enum SlotEvent {
    /// TCP connect succeeded.
    Connected,
    /// TCP connect failed.
    ConnectFailed { error: String },
    /// A checksum-verified frame arrived.
    Frame { frame: RawFrame },
    /// An outbound frame finished writing to the socket.
    Wrote { command: btc_wire::Command },
    /// An outbound write failed; the socket stays open and the liveness
    /// sweep decides its fate.
    WriteFailed {
        command: btc_wire::Command,
        error: String,
    },
    /// The socket is gone; the slot may be re-dialed.
    Closed { reason: CloseReason },
}

/// A [`SlotEvent`] addressed to a peer slot at a specific generation.
#[derive(Debug)]
pub struct EngineEvent {
    pub slot: usize,
    pub generation: u64,
    pub event: SlotEvent,
}

/// Run the connection for one slot until the socket dies or the engine
/// replaces it.
pub async fn run_connection(
    slot: usize,
    generation: u64,
    addr: SocketAddr,
    magic: [u8; 4],
    events: mpsc::Sender<EngineEvent>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) {
    let send = |event: SlotEvent| {
        let events = events.clone();
        async move {
            let _ = events
                .send(EngineEvent {
                    slot,
                    generation,
                    event,
                })
                .await;
        }
    };

    let stream = tokio::select! {
        result = TcpStream::connect(addr) => match result {
            Ok(stream) => stream,
            Err(e) => {
                send(SlotEvent::ConnectFailed { error: e.to_string() }).await;
                return;
            }
        },
        // The engine recycled the slot while the dial was in flight.
        _ = wait_closed(&mut outbound) => {
            send(SlotEvent::Closed { reason: CloseReason::Replaced }).await;
            return;
        }
    };

    debug!(peer = %addr, slot, "connected");
    send(SlotEvent::Connected).await;

    let (read_half, mut write_half) = stream.into_split();
    let mut frames =
        FramedRead::with_capacity(read_half, FrameCodec::new(magic), STREAM_BUFFER_CAPACITY);

    let reason = loop {
        tokio::select! {
            incoming = frames.next() => match incoming {
                Some(Ok(frame)) => {
                    if events.send(EngineEvent {
                        slot,
                        generation,
                        event: SlotEvent::Frame { frame },
                    }).await.is_err() {
                        break CloseReason::Replaced;
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = %addr, slot, error = %e, "receive error");
                    break CloseReason::ReadError;
                }
                None => {
                    debug!(peer = %addr, slot, "connection closed by peer");
                    break CloseReason::Eof;
                }
            },
            queued = outbound.recv() => match queued {
                Some(OutboundFrame { command, bytes }) => {
                    match write_half.write_all(&bytes).await {
                        Ok(()) => send(SlotEvent::Wrote { command }).await,
                        Err(e) => {
                            send(SlotEvent::WriteFailed {
                                command,
                                error: e.to_string(),
                            })
                            .await
                        }
                    }
                }
                None => break CloseReason::Replaced,
            },
        }
    };

    send(SlotEvent::Closed { reason }).await;
}

/// Resolve once the engine has dropped every sender for this connection.
async fn wait_closed(outbound: &mut mpsc::Receiver<OutboundFrame>) {
    while outbound.recv().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_wire::{encode_message, Command, Message, MAINNET};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn expect_event(rx: &mut mpsc::Receiver<EngineEvent>) -> SlotEvent {
        rx.recv().await.expect("event").event
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        tokio::spawn(run_connection(
            0,
            1,
            addr,
            MAINNET.magic,
            events_tx,
            outbound_rx,
        ));

        let (mut server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            expect_event(&mut events_rx).await,
            SlotEvent::Connected
        ));

        // Server -> client frame.
        server
            .write_all(&encode_message(MAINNET.magic, &Message::Ping(5)))
            .await
            .unwrap();
        match expect_event(&mut events_rx).await {
            SlotEvent::Frame { frame } => assert_eq!(frame.command, Command::Ping),
            other => panic!("expected frame, got {other:?}"),
        }

        // Client -> server frame with write-completion report.
        let encoded = encode_message(MAINNET.magic, &Message::Pong(5));
        outbound_tx
            .send(OutboundFrame {
                command: Command::Pong,
                bytes: encoded.clone(),
            })
            .await
            .unwrap();
        match expect_event(&mut events_rx).await {
            SlotEvent::Wrote { command } => assert_eq!(command, Command::Pong),
            other => panic!("expected wrote, got {other:?}"),
        }
        let mut received = vec![0u8; encoded.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, encoded.to_vec());

        // Dropping the queue is the replace signal.
        drop(outbound_tx);
        match expect_event(&mut events_rx).await {
            SlotEvent::Closed { reason } => assert_eq!(reason, CloseReason::Replaced),
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_eof_reports_silent_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let (_outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(8);
        tokio::spawn(run_connection(
            0,
            1,
            addr,
            MAINNET.magic,
            events_tx,
            outbound_rx,
        ));

        let (server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            expect_event(&mut events_rx).await,
            SlotEvent::Connected
        ));

        drop(server);
        match expect_event(&mut events_rx).await {
            SlotEvent::Closed { reason } => assert_eq!(reason, CloseReason::Eof),
            other => panic!("expected closed, got {other:?}"),
        }
    }
}
