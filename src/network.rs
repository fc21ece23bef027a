use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};
use tungstenite::HandshakeError;
use tungstenite::handshake::MidHandshake;
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tungstenite::protocol::frame::{Frame, FrameSocket};

/// Upper bound on frames taken from one client per poll, so a chatty client
/// cannot hold up the motor.
const MAX_FRAMES_PER_POLL: usize = 16;
/// Largest frame payload a client may send. Anything bigger drops the client
/// before the payload is buffered.
const MAX_PAYLOAD: usize = 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEAD_END: u32 = u32::from_be_bytes(*b"\r\n\r\n");

/// Source of binary command frames.
///
/// `poll` must never block: it hands every complete frame received since the
/// last call to `on_frame` and returns.
pub trait CommandChannel {
    fn poll(&mut self, on_frame: &mut dyn FnMut(&[u8]));
}

/// Socket handed to the opening handshake.
///
/// Reads stop right after the blank line that ends the HTTP request, so the
/// handshake never swallows the first WebSocket frames and the socket can be
/// taken back afterwards for frame-level reading.
struct HandshakeStream {
    stream: Option<TcpStream>,
    recent: u32,
    head_complete: bool,
}

impl HandshakeStream {
    fn new(stream: TcpStream) -> Self {
        HandshakeStream {
            stream: Some(stream),
            recent: 0,
            head_complete: false,
        }
    }
}

fn detached() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

impl Read for HandshakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.head_complete {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(detached());
        };
        let available = stream.peek(buf)?;
        let mut take = available;
        for (i, &byte) in buf[..available].iter().enumerate() {
            self.recent = (self.recent << 8) | u32::from(byte);
            if self.recent == HEAD_END {
                take = i + 1;
                self.head_complete = true;
                break;
            }
        }
        stream.read_exact(&mut buf[..take])?;
        Ok(take)
    }
}

impl Write for HandshakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(detached)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.as_mut().ok_or_else(detached)?.flush()
    }
}

struct Pending {
    peer: SocketAddr,
    since: Instant,
    handshake: MidHandshake<ServerHandshake<HandshakeStream, NoCallback>>,
}

struct Client {
    id: u64,
    peer: SocketAddr,
    frames: FrameSocket<TcpStream>,
}

/// Non-blocking WebSocket server delivering binary messages as command frames.
///
/// Only unfragmented binary messages count. Text messages, fragmented
/// messages and control frames are ignored, apart from answering pings and
/// closes. Nothing else is ever sent back.
pub struct WsCommandServer {
    listener: TcpListener,
    pending: Vec<Pending>,
    clients: Vec<Client>,
    next_id: u64,
}

enum Drain {
    Open,
    Closed,
}

fn would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
}

/// Payload with the client's masking key removed.
fn unmask(frame: Frame) -> Vec<u8> {
    let mask = frame.header().mask;
    let mut payload = frame.into_data();
    if let Some(mask) = mask {
        for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
            *byte ^= key;
        }
    }
    payload
}

impl WsCommandServer {
    pub fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind command channel on {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to make command listener non-blocking")?;
        info!(addr = %listener.local_addr()?, "command channel listening");
        Ok(WsCommandServer {
            listener,
            pending: Vec::new(),
            clients: Vec::new(),
            next_id: 0,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of clients past the WebSocket handshake.
    pub fn connected(&self) -> usize {
        self.clients.len()
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.start_handshake(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "command channel accept failed");
                    break;
                }
            }
        }
    }

    fn start_handshake(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, error = %e, "dropping client, cannot make socket non-blocking");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "cannot disable Nagle on client socket");
        }
        let result = tungstenite::accept(HandshakeStream::new(stream));
        self.finish_handshake(peer, Instant::now(), result);
    }

    fn finish_handshake(
        &mut self,
        peer: SocketAddr,
        since: Instant,
        result: Result<
            tungstenite::WebSocket<HandshakeStream>,
            HandshakeError<ServerHandshake<HandshakeStream, NoCallback>>,
        >,
    ) {
        match result {
            Ok(mut socket) => {
                let Some(stream) = socket.get_mut().stream.take() else {
                    warn!(%peer, "dropping client, socket lost during handshake");
                    return;
                };
                let id = self.next_id;
                self.next_id += 1;
                self.clients.push(Client {
                    id,
                    peer,
                    frames: FrameSocket::new(stream),
                });
                info!(id, %peer, connected = self.connected(), "client connected");
            }
            Err(HandshakeError::Interrupted(handshake)) => {
                if since.elapsed() > HANDSHAKE_TIMEOUT {
                    warn!(%peer, "dropping client, handshake timed out");
                } else {
                    self.pending.push(Pending {
                        peer,
                        since,
                        handshake,
                    });
                }
            }
            Err(HandshakeError::Failure(e)) => {
                warn!(%peer, error = %e, "WebSocket handshake failed");
            }
        }
    }

    fn resume_handshakes(&mut self) {
        for pending in std::mem::take(&mut self.pending) {
            let result = pending.handshake.handshake();
            self.finish_handshake(pending.peer, pending.since, result);
        }
    }

    fn drain(client: &mut Client, on_frame: &mut dyn FnMut(&[u8])) -> Drain {
        for _ in 0..MAX_FRAMES_PER_POLL {
            match client.frames.read(Some(MAX_PAYLOAD)) {
                Ok(Some(frame)) => {
                    if let Drain::Closed = Self::handle(client, frame, on_frame) {
                        return Drain::Closed;
                    }
                }
                Ok(None) => return Drain::Closed,
                Err(e) if would_block(&e) => return Drain::Open,
                Err(e) => {
                    warn!(id = client.id, peer = %client.peer, error = %e, "dropping client");
                    return Drain::Closed;
                }
            }
        }
        Drain::Open
    }

    fn handle(client: &mut Client, frame: Frame, on_frame: &mut dyn FnMut(&[u8])) -> Drain {
        let (opcode, is_final) = (frame.header().opcode, frame.header().is_final);
        match (opcode, is_final) {
            (OpCode::Data(Data::Binary), true) => on_frame(&unmask(frame)),
            (OpCode::Data(Data::Text), true) => debug!(id = client.id, "ignoring text message"),
            (OpCode::Data(_), _) => debug!(id = client.id, "ignoring fragmented message"),
            (OpCode::Control(Control::Ping), _) => {
                if let Err(e) = client.frames.write(Frame::pong(unmask(frame))) {
                    if !would_block(&e) {
                        warn!(id = client.id, peer = %client.peer, error = %e, "dropping client");
                        return Drain::Closed;
                    }
                }
            }
            (OpCode::Control(Control::Close), _) => {
                // The peer is leaving either way; the reply is best effort.
                let _ = client.frames.send(Frame::close(None));
                return Drain::Closed;
            }
            (OpCode::Control(_), _) => {}
        }
        Drain::Open
    }
}

impl CommandChannel for WsCommandServer {
    fn poll(&mut self, on_frame: &mut dyn FnMut(&[u8])) {
        self.accept_new();
        self.resume_handshakes();

        let before = self.clients.len();
        self.clients.retain_mut(|client| match Self::drain(client, &mut *on_frame) {
            Drain::Open => {
                // Pongs are queued by reads; a full socket buffer just means
                // they go out next time.
                match client.frames.flush() {
                    Ok(()) => true,
                    Err(e) if would_block(&e) => true,
                    Err(e) => {
                        warn!(id = client.id, peer = %client.peer, error = %e, "dropping client");
                        false
                    }
                }
            }
            Drain::Closed => {
                info!(id = client.id, peer = %client.peer, "client disconnected");
                false
            }
        });
        if self.clients.len() != before {
            debug!(connected = self.connected(), "clients remaining");
        }
    }
}
