// src/transport.rs
//
// Datagram RPC transport: a self-describing request/reply/broadcast frame
// over UDP, an outstanding-request table keyed by message id, and a bounded
// broadcast-seen set that stops flood propagation from looping forever.
// Grounded on the original `datagram_rpc.py` request/reply/timeout
// semantics, expressed the way the teacher's `TcpP2PAdapter` structures a
// connection table (`Arc<Mutex<HashMap<..>>>` plus a spawned read loop).

use crate::error::CoordError;
use crate::id::NodeId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type MsgId = [u8; 16];

fn new_msg_id() -> MsgId {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

#[derive(Serialize, Deserialize, Debug)]
enum Frame {
    Request {
        msg_id: MsgId,
        procedure: String,
        payload: Vec<u8>,
    },
    Reply {
        msg_id: MsgId,
        payload: Vec<u8>,
    },
    Broadcast {
        msg_id: MsgId,
        procedure: String,
        payload: Vec<u8>,
    },
}

/// What the transport hands back to its owner for each inbound datagram.
pub enum Inbound {
    Request {
        from: SocketAddr,
        msg_id: MsgId,
        procedure: String,
        payload: Vec<u8>,
    },
    Broadcast {
        from: SocketAddr,
        msg_id: MsgId,
        procedure: String,
        payload: Vec<u8>,
    },
}

struct BroadcastSeen {
    set: HashSet<MsgId>,
    order: VecDeque<MsgId>,
    capacity: usize,
}

impl BroadcastSeen {
    fn new(capacity: usize) -> Self {
        BroadcastSeen {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` if this is the first time we've seen `id`.
    fn mark(&mut self, id: MsgId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

pub struct Transport {
    socket: UdpSocket,
    pending: Mutex<HashMap<MsgId, oneshot::Sender<Vec<u8>>>>,
    seen: Mutex<BroadcastSeen>,
    timeout: Duration,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, timeout: Duration, seen_capacity: usize) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Transport {
            socket,
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(BroadcastSeen::new(seen_capacity)),
            timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a request and wait for its reply, or fail with `Timeout` after
    /// the configured deadline. At most one outstanding slot per msg_id.
    pub async fn request(
        &self,
        peer_id: NodeId,
        peer: SocketAddr,
        procedure: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CoordError> {
        let msg_id = new_msg_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.insert(msg_id, tx).is_some() {
                return Err(CoordError::Internal(format!(
                    "duplicate outstanding request for msg_id {:x?}",
                    msg_id
                )));
            }
        }

        let frame = Frame::Request {
            msg_id,
            procedure: procedure.to_string(),
            payload,
        };
        let bytes = bincode::serialize(&frame)
            .map_err(|e| CoordError::Internal(format!("encode request: {e}")))?;
        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            self.pending.lock().unwrap().remove(&msg_id);
            warn!("send_to {peer} failed: {e}");
            return Err(CoordError::Timeout {
                peer: peer_id,
                procedure: procedure.to_string(),
            });
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().unwrap().remove(&msg_id);
                Err(CoordError::Timeout {
                    peer: peer_id,
                    procedure: procedure.to_string(),
                })
            }
        }
    }

    pub async fn reply(&self, peer: SocketAddr, msg_id: MsgId, payload: Vec<u8>) -> anyhow::Result<()> {
        let frame = Frame::Reply { msg_id, payload };
        let bytes = bincode::serialize(&frame)?;
        self.socket.send_to(&bytes, peer).await?;
        Ok(())
    }

    /// Originates a new broadcast: marks it seen locally (so a reflection
    /// back to us is dropped) and floods it to every given peer.
    pub async fn broadcast(
        &self,
        peers: &[SocketAddr],
        procedure: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<MsgId> {
        let msg_id = new_msg_id();
        self.seen.lock().unwrap().mark(msg_id);
        self.flood(peers, msg_id, procedure, payload).await?;
        Ok(msg_id)
    }

    /// Re-forwards an already-seen broadcast (msg_id kept) to our peers.
    pub async fn flood(
        &self,
        peers: &[SocketAddr],
        msg_id: MsgId,
        procedure: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let frame = Frame::Broadcast {
            msg_id,
            procedure: procedure.to_string(),
            payload,
        };
        let bytes = bincode::serialize(&frame)?;
        for peer in peers {
            let _ = self.socket.send_to(&bytes, *peer).await;
        }
        Ok(())
    }

    /// First-seen check for an inbound broadcast; `true` means this is new
    /// and the caller should both dispatch it locally and re-flood it.
    pub fn mark_broadcast_seen(&self, msg_id: MsgId) -> bool {
        self.seen.lock().unwrap().mark(msg_id)
    }

    /// Blocks on the socket for the next datagram, decoding it into an
    /// `Inbound` event or completing a pending request's oneshot directly.
    pub async fn recv(&self) -> std::io::Result<Option<Inbound>> {
        let mut buf = [0u8; 65535];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let frame: Frame = match bincode::deserialize(&buf[..len]) {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping malformed datagram from {from}: {e}");
                return Ok(None);
            }
        };
        match frame {
            Frame::Request {
                msg_id,
                procedure,
                payload,
            } => Ok(Some(Inbound::Request {
                from,
                msg_id,
                procedure,
                payload,
            })),
            Frame::Reply { msg_id, payload } => {
                if let Some(tx) = self.pending.lock().unwrap().remove(&msg_id) {
                    let _ = tx.send(payload);
                } else {
                    debug!("late or unknown reply for msg_id {:x?} from {from}", msg_id);
                }
                Ok(None)
            }
            Frame::Broadcast {
                msg_id,
                procedure,
                payload,
            } => Ok(Some(Inbound::Broadcast {
                from,
                msg_id,
                procedure,
                payload,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn request_times_out_with_no_listener() {
        let t = Transport::bind(local(0), Duration::from_millis(100), 1024)
            .await
            .unwrap();
        let dead_addr = local(1); // nothing bound there
        let result = t
            .request(NodeId::random(), dead_addr, "ping", vec![])
            .await;
        assert!(matches!(result, Err(CoordError::Timeout { .. })));
    }

    #[tokio::test]
    async fn broadcast_seen_dedups() {
        let t = Transport::bind(local(0), Duration::from_millis(100), 1024)
            .await
            .unwrap();
        let id = new_msg_id();
        assert!(t.mark_broadcast_seen(id));
        assert!(!t.mark_broadcast_seen(id));
    }
}
