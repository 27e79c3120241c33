//! Peer-to-peer transport for Raft messages.
//!
//! Frames are length-prefixed:
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode-encoded [`Envelope`] whose payload is the protobuf Raft message
//!
//! The envelope carries the sender's id and Raft address, so a member that
//! joined through a snapshot can answer a leader it has never been told about.
//!
//! Each peer gets its own sender thread with a bounded queue. A slow or dead
//! peer only ever stalls its own link; when the queue is full, frames are
//! dropped and Raft's retransmission takes over.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const LINK_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: u64,
    from_addr: String,
    payload: Vec<u8>,
}

/// A decoded Raft message together with where it came from.
#[derive(Debug)]
pub struct Inbound {
    pub from: u64,
    pub from_addr: String,
    pub message: Message,
}

/// Binds `addr` and forwards every received message to `tx`.
///
/// Binding happens on the caller's thread so that address errors surface
/// immediately. Returns the bound address (useful when `addr` uses port 0).
pub fn spawn_listener(addr: &str, tx: Sender<Inbound>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind raft address {addr}"))?;
    let local = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("raft-listener-{local}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "raft connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "raft accept error"),
                }
            }
        })
        .context("failed to spawn raft listener")?;
    Ok(local)
}

/// Reads frames until the peer hangs up.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let Some(frame) = read_frame(&mut stream)? else {
            return Ok(());
        };
        let envelope: Envelope = bincode::deserialize(&frame).context("bad envelope")?;
        let message = Message::decode(&envelope.payload[..])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tx.send(Inbound {
            from: envelope.from,
            from_addr: envelope.from_addr,
            message,
        })
        .map_err(|_| anyhow!("raft worker gone"))?;
    }
}

/// Returns `None` on a clean EOF before a new frame starts.
fn read_frame(stream: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()
}

struct PeerLink {
    addr: String,
    tx: Sender<Vec<u8>>,
}

/// Outgoing side of the transport, owned by the consensus worker.
pub struct Outbound {
    id: u64,
    self_addr: String,
    links: HashMap<u64, PeerLink>,
}

impl Outbound {
    pub fn new(id: u64, self_addr: String) -> Self {
        Self {
            id,
            self_addr,
            links: HashMap::new(),
        }
    }

    /// Queues `msg` for the peer at `addr`. Never blocks.
    pub fn send(&mut self, addr: &str, msg: &Message) -> Result<()> {
        let envelope = Envelope {
            from: self.id,
            from_addr: self.self_addr.clone(),
            payload: msg.encode_to_vec(),
        };
        let frame = bincode::serialize(&envelope).context("encode envelope")?;

        let to = msg.to;
        let stale = self.links.get(&to).is_some_and(|link| link.addr != addr);
        if stale || !self.links.contains_key(&to) {
            // Dropping the old sender ends the previous link thread.
            self.links.insert(to, spawn_link(to, addr.to_string())?);
        }
        let Some(link) = self.links.get(&to) else {
            return Ok(());
        };
        match link.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(peer = to, "link queue full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => {
                self.links.remove(&to);
            }
        }
        Ok(())
    }

    /// Forgets a peer, closing its link.
    pub fn forget(&mut self, id: u64) {
        self.links.remove(&id);
    }
}

fn spawn_link(peer: u64, addr: String) -> Result<PeerLink> {
    let (tx, rx) = bounded(LINK_QUEUE_DEPTH);
    let thread_addr = addr.clone();
    thread::Builder::new()
        .name(format!("raft-link-{peer}"))
        .spawn(move || run_link(peer, &thread_addr, rx))
        .context("failed to spawn raft link")?;
    Ok(PeerLink { addr, tx })
}

fn run_link(peer: u64, addr: &str, rx: Receiver<Vec<u8>>) {
    let mut stream: Option<TcpStream> = None;
    for frame in rx.iter() {
        if stream.is_none() {
            match connect(addr) {
                Ok(s) => stream = Some(s),
                Err(err) => {
                    debug!(peer, addr, error = %err, "peer unreachable");
                    continue;
                }
            }
        }
        if let Some(s) = stream.as_mut() {
            if let Err(err) = write_frame(s, &frame) {
                debug!(peer, addr, error = %err, "send failed, reconnecting");
                stream = None;
            }
        }
    }
}

fn connect(addr: &str) -> io::Result<TcpStream> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}")))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use raft::prelude::MessageType;

    #[test]
    fn message_arrives_with_sender_address() {
        let (tx, rx) = unbounded();
        let local = spawn_listener("127.0.0.1:0", tx).unwrap();

        let mut out = Outbound::new(1, "127.0.0.1:18011".into());
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = 2;
        msg.term = 7;
        out.send(&local.to_string(), &msg).unwrap();
        out.send(&local.to_string(), &msg).unwrap();

        for _ in 0..2 {
            let inbound = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(inbound.from, 1);
            assert_eq!(inbound.from_addr, "127.0.0.1:18011");
            assert_eq!(inbound.message.term, 7);
            assert_eq!(inbound.message.msg_type(), MessageType::MsgHeartbeat);
        }
    }

    #[test]
    fn unreachable_peer_does_not_block_sender() {
        let mut out = Outbound::new(1, "127.0.0.1:18011".into());
        let mut msg = Message::default();
        msg.to = 3;
        for _ in 0..(LINK_QUEUE_DEPTH * 2) {
            out.send("127.0.0.1:1", &msg).unwrap();
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let err = read_frame(&mut &bytes[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(read_frame(&mut &[][..]).unwrap().is_none());
    }
}
