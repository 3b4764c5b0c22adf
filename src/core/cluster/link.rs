// src/core/cluster/link.rs

//! The framed binary bus between peers (component 4.2). Each known peer
//! gets at most one outgoing link, owned by its `PeerRecord`; inbound
//! links are accepted independently and remain anonymous to their owner
//! beyond the sender identity each frame's header already carries.

use super::codec::{ClusterMessage, ClusterMessageCodec};
use super::id::NodeId;
use crate::core::errors::CoreError;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Events the link layer feeds into the single engine task. The engine
/// never reaches back into link internals; it only reacts to these.
#[derive(Debug)]
pub enum LinkEvent {
    /// A fully decoded frame, from either an outbound or an inbound link.
    Frame(ClusterMessage),
    /// This node's outbound link to `peer` has closed; the scheduler will
    /// re-dial on its next tick.
    OutboundClosed(NodeId),
}

/// A handle to this node's single outgoing link to one peer. Dropping it
/// (or the channel send failing) tears down the writer task.
#[derive(Debug)]
pub struct OutboundLink {
    sender: mpsc::UnboundedSender<ClusterMessage>,
}

impl OutboundLink {
    pub fn send(&self, msg: ClusterMessage) -> Result<(), CoreError> {
        self.sender
            .send(msg)
            .map_err(|_| CoreError::Internal("outbound link writer task is gone".into()))
    }
}

/// Dials `addr`, splits the resulting stream into codec-framed halves, and
/// spawns a reader task (decodes frames onto `events_tx`) and returns an
/// `OutboundLink` whose `send` feeds an internal writer queue. The caller
/// (the scheduler) is responsible for retrying on `LinkEvent::OutboundClosed`.
pub async fn dial(
    peer: NodeId,
    addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) -> Result<OutboundLink, CoreError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    Ok(spawn_link_tasks(peer, stream, events_tx))
}

/// Wraps an already-accepted inbound stream in the same framing, forwarding
/// decoded frames to `events_tx` until the connection closes. Inbound
/// connections have no dedicated `OutboundLink` handle — the owner only
/// ever writes on the link it dialed itself.
pub fn spawn_inbound(stream: TcpStream, events_tx: mpsc::UnboundedSender<LinkEvent>) {
    stream.set_nodelay(true).ok();
    let framed = Framed::new(stream, ClusterMessageCodec::new());
    let (_discard_sink, mut reader) = framed.split();
    tokio::spawn(async move {
        while let Some(result) = reader.next().await {
            match result {
                Ok(frame) => {
                    if events_tx.send(LinkEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(CoreError::Codec(reason)) => {
                    // The frame was already bounded by its declared length;
                    // only this one frame is bad, the buffer is still aligned.
                    debug!(reason, "dropping malformed inbound frame");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "inbound link closed");
                    break;
                }
            }
        }
    });
}

fn spawn_link_tasks(
    peer: NodeId,
    stream: TcpStream,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) -> OutboundLink {
    let framed = Framed::new(stream, ClusterMessageCodec::new());
    let (mut sink, mut reader) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClusterMessage>();

    let reader_events = events_tx.clone();
    tokio::spawn(async move {
        while let Some(result) = reader.next().await {
            match result {
                Ok(frame) => {
                    if reader_events.send(LinkEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(CoreError::Codec(reason)) => {
                    debug!(%peer, reason, "dropping malformed outbound-link frame");
                    continue;
                }
                Err(e) => {
                    debug!(%peer, error = %e, "outbound link read error");
                    break;
                }
            }
        }
        let _ = reader_events.send(LinkEvent::OutboundClosed(peer));
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(%peer, error = %e, "outbound link write error");
                let _ = events_tx.send(LinkEvent::OutboundClosed(peer));
                break;
            }
        }
    });

    OutboundLink { sender: tx }
}

/// Binds the cluster bus listener and forwards every accepted connection
/// to `spawn_inbound`. Runs for the process lifetime; the caller spawns
/// this as its own task.
pub async fn accept_loop(
    bus_addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), CoreError> {
    let listener = TcpListener::bind(bus_addr).await?;
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!(%peer_addr, "accepted inbound cluster bus connection");
        spawn_inbound(stream, events_tx.clone());
    }
}
