//! Unix socket front end of the bus
//!
//! Peers (file managers, backends) connect to the daemon's socket and
//! exchange newline-delimited JSON frames (see [`super::frame`]). Each
//! connection becomes a client of the [`LocalBus`], which keeps doing the
//! routing:
//!
//! - `call` frames go to the tracker, answered in the order they arrived
//! - mount calls addressed to any name a peer owns are written to its socket
//! - `spawned` frames are delivered to spawn handshake endpoints
//! - tracker signals are broadcast to every peer
//!
//! When a connection closes, its names are released, which is what lets the
//! tracker drop the mounts that peer served.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::frame::{
    self, DaemonFrame, Decoded, Fault, PeerFrame, ERROR_INVALID_ARGS, ERROR_NAME_TAKEN,
    ERROR_UNKNOWN_OBJECT,
};
use super::local::{LocalBus, MountHandler};
use super::{Bus, CallError, MountCall, SpawnAck, SpawnMessage};
use crate::registry::TrackerSignal;
use crate::tracker::{stopped, TrackerHandle};

/// A connected peer, as seen by the bus
struct RemotePeer {
    name: String,
    outbound: mpsc::UnboundedSender<DaemonFrame>,
    /// Mount calls waiting for the peer's reply, by serial
    pending: DashMap<u64, oneshot::Sender<Result<(), CallError>>>,
    next_serial: AtomicU64,
}

impl RemotePeer {
    fn new(name: String, outbound: mpsc::UnboundedSender<DaemonFrame>) -> Self {
        Self {
            name,
            outbound,
            pending: DashMap::new(),
            next_serial: AtomicU64::new(1),
        }
    }

    fn send(&self, frame: DaemonFrame) {
        if self.outbound.send(frame).is_err() {
            trace!("Dropping frame for closed connection {}", self.name);
        }
    }

    fn complete(&self, serial: u64, fault: Option<Fault>) {
        match self.pending.remove(&serial) {
            Some((_, reply)) => {
                let _ = reply.send(fault.map_or(Ok(()), |f| Err(f.into())));
            }
            None => debug!("Mount reply {} from {} matches no call", serial, self.name),
        }
    }

    /// Fail every mount call still waiting on this peer
    fn close(&self) {
        self.pending.clear();
    }

    fn disconnected(&self) -> CallError {
        CallError::Disconnected(format!("{} closed its connection", self.name))
    }
}

#[async_trait]
impl MountHandler for RemotePeer {
    async fn mount(&self, call: MountCall) -> Result<(), CallError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.pending.insert(serial, reply);

        let frame = DaemonFrame::Mount {
            serial,
            spec: call.spec.to_wire(),
            automount: call.automount,
            source: call.source.to_wire(),
        };
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&serial);
            return Err(self.disconnected());
        }

        response.await.unwrap_or_else(|_| Err(self.disconnected()))
    }
}

/// Accepts peers on a Unix socket and connects them to the bus and tracker
pub struct SocketServer {
    bus: Arc<LocalBus>,
    tracker: TrackerHandle,
}

impl SocketServer {
    pub fn new(bus: Arc<LocalBus>, tracker: TrackerHandle) -> Self {
        Self { bus, tracker }
    }

    /// Bind `path`, replacing a stale socket left by an earlier run
    pub async fn bind(path: &Path) -> io::Result<UnixListener> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }

        let listener = UnixListener::bind(path)?;
        info!("Bus socket listening at {:?}", path);
        Ok(listener)
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_connection(stream).await });
                }
                Err(e) => warn!("Bus socket accept error: {}", e),
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let unique_name = self.bus.connect();
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();

        // Welcome goes first, ahead of any signal
        let _ = outbound.send(DaemonFrame::Welcome {
            unique_name: unique_name.clone(),
            daemon_name: self.bus.unique_name().to_string(),
        });
        let writer_task = tokio::spawn(write_frames(writer, queue, self.bus.subscribe()));

        let peer = Arc::new(RemotePeer::new(unique_name.clone(), outbound));
        self.bus.own_name(unique_name.clone(), peer.clone());
        info!("{} connected", unique_name);

        let mut well_known = Vec::new();
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => self.handle_line(&peer, &mut well_known, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!("Reading from {} failed: {}", unique_name, e);
                    break;
                }
            }
        }

        peer.close();
        for name in &well_known {
            self.bus.release_name(name, &unique_name);
        }
        self.bus.disconnect(&unique_name);
        writer_task.abort();
        info!("{} disconnected", unique_name);
    }

    fn handle_line(&self, peer: &Arc<RemotePeer>, well_known: &mut Vec<String>, line: &str) {
        match frame::decode_peer(line) {
            Decoded::Frame(PeerFrame::Call { serial, op }) => {
                debug!("{} from {} (serial {})", op.name(), peer.name, serial);
                match self.tracker.submit(peer.name.clone(), op) {
                    Ok(response) => {
                        let peer = peer.clone();
                        tokio::spawn(async move {
                            let result = response.await.unwrap_or_else(|_| Err(stopped()));
                            peer.send(DaemonFrame::reply(serial, result));
                        });
                    }
                    Err(e) => peer.send(DaemonFrame::reply(serial, Err(e))),
                }
            }
            Decoded::Frame(PeerFrame::RequestName { serial, name }) => {
                let fault = self.request_name(peer, &name);
                if fault.is_none() {
                    well_known.push(name);
                }
                peer.send(DaemonFrame::ack(serial, fault));
            }
            Decoded::Frame(PeerFrame::Spawned {
                serial,
                path,
                succeeded,
                message,
            }) => {
                let ack = SpawnMessage::Spawned(SpawnAck {
                    sender: peer.name.clone(),
                    succeeded,
                    message,
                });
                let fault = if self.bus.deliver_spawned(&path, ack) {
                    None
                } else {
                    Some(Fault::new(
                        ERROR_UNKNOWN_OBJECT,
                        format!("No spawn endpoint at {}", path),
                    ))
                };
                peer.send(DaemonFrame::ack(serial, fault));
            }
            Decoded::Frame(PeerFrame::MountReply { serial, fault }) => peer.complete(serial, fault),
            Decoded::Malformed {
                serial,
                spawn_path,
                reason,
            } => {
                debug!("Malformed frame from {}: {}", peer.name, reason);
                if let Some(path) = spawn_path {
                    self.bus.deliver_spawned(
                        &path,
                        SpawnMessage::InvalidArgs {
                            sender: peer.name.clone(),
                        },
                    );
                }
                if let Some(serial) = serial {
                    peer.send(DaemonFrame::ack(
                        serial,
                        Some(Fault::new(ERROR_INVALID_ARGS, reason)),
                    ));
                }
            }
        }
    }

    fn request_name(&self, peer: &Arc<RemotePeer>, name: &str) -> Option<Fault> {
        if name.is_empty() || name.starts_with(':') {
            return Some(Fault::new(
                ERROR_INVALID_ARGS,
                format!("{:?} cannot be requested", name),
            ));
        }
        if self.bus.try_own_name(name, peer.clone()) {
            info!("{} now owns {}", peer.name, name);
            None
        } else {
            Some(Fault::new(
                ERROR_NAME_TAKEN,
                format!("{} is already owned", name),
            ))
        }
    }
}

/// Write queued frames and tracker signals to the peer until either side closes
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<DaemonFrame>,
    mut signals: broadcast::Receiver<TrackerSignal>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            queued = queue.recv() => match queued {
                Some(frame) => frame,
                None => break,
            },
            signal = signals.recv() => match signal {
                Ok(signal) => DaemonFrame::Signal { signal },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Peer missed {} signal(s)", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let line = match frame::encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Writing to peer failed: {}", e);
            break;
        }
    }
}
