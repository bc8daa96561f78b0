//! Transport Adapter: a reliable, ordered, message-oriented socket
//! abstraction over TCP.
//!
//! Implemented with length-delimited framing
//! (`tokio_util::codec::LengthDelimitedCodec`), which gives ordering and
//! reliability for free instead of hand-rolling an ack/retransmit scheme.
//! Per-connection I/O runs on its own task and only ever forwards bytes into
//! a channel; every registry mutation still happens on the control loop's
//! own thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Stable transport-level peer identity.
pub type SysAddr = SocketAddr;

/// One of the three event shapes multiplexed onto `receive()`.
#[derive(Debug)]
pub enum Event {
    /// An application payload arrived from `peer`.
    Message { peer: SysAddr, frame: Bytes },
    /// `peer` closed its connection in an orderly way.
    DisconnectNotification { peer: SysAddr },
    /// `peer`'s connection was lost without a clean close (read error, reset,
    /// or idle timeout at the OS level).
    ConnectionLost { peer: SysAddr },
}

impl Event {
    /// The peer this event concerns, regardless of shape.
    pub fn peer(&self) -> SysAddr {
        match self {
            Event::Message { peer, .. } => *peer,
            Event::DisconnectNotification { peer } => *peer,
            Event::ConnectionLost { peer } => *peer,
        }
    }
}

type PeerSenders = Arc<Mutex<HashMap<SysAddr, mpsc::UnboundedSender<Bytes>>>>;

/// Framed, non-blocking-receive transport over TCP.
pub struct Transport {
    events_rx: mpsc::UnboundedReceiver<Event>,
    peers: PeerSenders,
    accept_task: JoinHandle<()>,
}

impl Transport {
    /// Binds a listener and starts accepting connections in the background.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Transport> {
        let listener = TcpListener::bind(addr).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peers: PeerSenders = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = {
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            Transport::spawn_connection(stream, peer, Arc::clone(&peers), events_tx.clone());
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {e}");
                        }
                    }
                }
            })
        };

        Ok(Transport { events_rx, peers, accept_task })
    }

    fn spawn_connection(
        stream: TcpStream,
        peer: SysAddr,
        peers: PeerSenders,
        events_tx: mpsc::UnboundedSender<Event>,
    ) {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        peers.lock().unwrap().insert(peer, outbound_tx);

        tokio::spawn(async move {
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

            let disconnect_event = loop {
                tokio::select! {
                    incoming = framed.next() => {
                        match incoming {
                            Some(Ok(frame)) => {
                                if events_tx.send(Event::Message { peer, frame: frame.freeze() }).is_err() {
                                    break Event::ConnectionLost { peer };
                                }
                            }
                            Some(Err(e)) => {
                                tracing::debug!("Connection to {peer} lost: {e}");
                                break Event::ConnectionLost { peer };
                            }
                            None => break Event::DisconnectNotification { peer },
                        }
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(bytes) => {
                                if let Err(e) = framed.send(bytes).await {
                                    tracing::debug!("Failed to write to {peer}: {e}");
                                    break Event::ConnectionLost { peer };
                                }
                            }
                            None => break Event::DisconnectNotification { peer },
                        }
                    }
                }
            };

            peers.lock().unwrap().remove(&peer);
            let _ = events_tx.send(disconnect_event);
        });
    }

    /// Non-blocking receive: returns immediately with `None` if nothing is
    /// queued.
    pub fn try_receive(&mut self) -> Option<Event> {
        self.events_rx.try_recv().ok()
    }

    /// Sends a frame to a specific peer. Silently drops if the peer is no
    /// longer connected — the caller will learn about the disconnect via the
    /// next `try_receive`.
    pub fn send(&self, peer: SysAddr, frame: Bytes) {
        if let Some(tx) = self.peers.lock().unwrap().get(&peer) {
            let _ = tx.send(frame);
        }
    }

    /// Sends a frame to every currently connected peer.
    pub fn broadcast(&self, frame: Bytes) {
        for tx in self.peers.lock().unwrap().values() {
            let _ = tx.send(frame.clone());
        }
    }

    /// Number of currently connected peers.
    pub fn connection_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
