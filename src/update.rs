use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::UpdateSettings;

const CHUNK: usize = 4096;
/// Bounds the time one poll spends copying image bytes.
const MAX_READS_PER_POLL: usize = 8;
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// kind (1) + size (4) + password length (1)
const FIXED_HEADER_LEN: usize = 6;

/// What a transfer replaces once installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Firmware,
    Filesystem,
}

impl UpdateKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(UpdateKind::Firmware),
            1 => Some(UpdateKind::Filesystem),
            _ => None,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            UpdateKind::Firmware => "firmware.bin",
            UpdateKind::Filesystem => "filesystem.bin",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateKind::Firmware => "firmware",
            UpdateKind::Filesystem => "filesystem",
        })
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("auth failed")]
    Auth,
    #[error("begin failed: {0}")]
    Begin(String),
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("end failed: {0}")]
    End(String),
}

/// Lifecycle hooks of a firmware transfer. None of them may block.
pub trait UpdateHandler {
    fn on_start(&mut self, kind: UpdateKind, total: u32);
    fn on_progress(&mut self, received: u32, total: u32);
    fn on_error(&mut self, error: &UpdateError);
    fn on_end(&mut self, kind: UpdateKind, staged: &Path);
}

/// Default hooks: log and nothing else.
#[derive(Debug, Default)]
pub struct LogUpdateHandler {
    last_percent: Option<u32>,
}

impl UpdateHandler for LogUpdateHandler {
    fn on_start(&mut self, kind: UpdateKind, total: u32) {
        self.last_percent = None;
        info!(%kind, total, "start updating {kind}");
    }

    fn on_progress(&mut self, received: u32, total: u32) {
        let percent = (u64::from(received) * 100 / u64::from(total.max(1))) as u32;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            info!("update progress: {percent}%");
        }
    }

    fn on_error(&mut self, error: &UpdateError) {
        error!(%error, "update error");
    }

    fn on_end(&mut self, kind: UpdateKind, staged: &Path) {
        info!(%kind, staged = %staged.display(), "update end");
    }
}

/// Anything the scheduler polls for firmware updates.
pub trait UpdateService {
    fn poll(&mut self);
}

#[derive(Debug, PartialEq, Eq)]
struct Header {
    kind: UpdateKind,
    total: u32,
}

/// Parse a transfer header from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the header and
/// the number of bytes it occupied.
fn parse_header(buf: &[u8], password: Option<&str>) -> Result<Option<(Header, usize)>, UpdateError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let pw_len = usize::from(buf[5]);
    let len = FIXED_HEADER_LEN + pw_len;
    if buf.len() < len {
        return Ok(None);
    }

    let kind = UpdateKind::from_byte(buf[0])
        .ok_or_else(|| UpdateError::Begin(format!("unknown image kind {}", buf[0])))?;
    let total = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if total == 0 {
        return Err(UpdateError::Begin("empty image".into()));
    }
    if let Some(expected) = password {
        if &buf[FIXED_HEADER_LEN..len] != expected.as_bytes() {
            return Err(UpdateError::Auth);
        }
    }
    Ok(Some((Header { kind, total }, len)))
}

struct Payload {
    kind: UpdateKind,
    total: u32,
    received: u32,
    file: File,
    part: PathBuf,
}

enum Stage {
    Header(Vec<u8>),
    Payload(Payload),
}

struct Transfer {
    peer: SocketAddr,
    stream: TcpStream,
    stage: Stage,
    last_activity: Instant,
}

enum Progress {
    Continue,
    Done,
}

/// Receives firmware images over TCP, one transfer at a time, without blocking.
///
/// Completed images are staged as `<staging_dir>/<kind>.bin`; installing
/// them is someone else's job.
pub struct UpdateListener<H> {
    listener: TcpListener,
    password: Option<String>,
    staging_dir: PathBuf,
    handler: H,
    transfer: Option<Transfer>,
}

impl<H: UpdateHandler> UpdateListener<H> {
    pub fn bind(settings: &UpdateSettings, handler: H) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(settings.bind)
            .with_context(|| format!("failed to bind update listener on {}", settings.bind))?;
        listener
            .set_nonblocking(true)
            .context("failed to make update listener non-blocking")?;
        info!(addr = %listener.local_addr()?, "update listener ready");
        if settings.password.is_none() {
            warn!("update listener accepts images without a password");
        }
        Ok(UpdateListener {
            listener,
            password: settings.password.clone(),
            staging_dir: settings.staging_dir.clone(),
            handler,
            transfer: None,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.in_progress() {
                        warn!(%peer, "update already in progress, refusing connection");
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        self.handler.on_error(&UpdateError::Connect(e));
                        continue;
                    }
                    info!(%peer, "update connection accepted");
                    self.transfer = Some(Transfer {
                        peer,
                        stream,
                        stage: Stage::Header(Vec::with_capacity(FIXED_HEADER_LEN + 32)),
                        last_activity: Instant::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.handler.on_error(&UpdateError::Connect(e));
                    break;
                }
            }
        }
    }

    fn advance(&mut self, transfer: &mut Transfer) -> Result<Progress, UpdateError> {
        let mut chunk = [0u8; CHUNK];
        for _ in 0..MAX_READS_PER_POLL {
            let n = match transfer.stream.read(&mut chunk) {
                Ok(0) => return Err(UpdateError::Receive(self.short_read(transfer))),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpdateError::Receive(e.to_string())),
            };
            transfer.last_activity = Instant::now();
            if let Progress::Done = self.consume(transfer, &chunk[..n])? {
                return Ok(Progress::Done);
            }
        }
        if transfer.last_activity.elapsed() > IDLE_TIMEOUT {
            return Err(UpdateError::Receive("timed out".into()));
        }
        Ok(Progress::Continue)
    }

    fn short_read(&self, transfer: &Transfer) -> String {
        match &transfer.stage {
            Stage::Header(_) => "connection closed before header".into(),
            Stage::Payload(p) => format!(
                "connection closed after {} of {} bytes",
                p.received, p.total
            ),
        }
    }

    fn consume(&mut self, transfer: &mut Transfer, bytes: &[u8]) -> Result<Progress, UpdateError> {
        match &mut transfer.stage {
            Stage::Header(buf) => {
                buf.extend_from_slice(bytes);
                let Some((header, used)) = parse_header(buf, self.password.as_deref())? else {
                    return Ok(Progress::Continue);
                };
                let rest = buf.split_off(used);
                transfer.stage = Stage::Payload(self.begin(header)?);
                if rest.is_empty() {
                    Ok(Progress::Continue)
                } else {
                    self.consume(transfer, &rest)
                }
            }
            Stage::Payload(payload) => self.write_payload(transfer.peer, payload, bytes),
        }
    }

    fn write_payload(
        &mut self,
        peer: SocketAddr,
        payload: &mut Payload,
        mut bytes: &[u8],
    ) -> Result<Progress, UpdateError> {
        let remaining = (payload.total - payload.received) as usize;
        if bytes.len() > remaining {
            warn!(%peer, extra = bytes.len() - remaining, "ignoring bytes past image end");
            bytes = &bytes[..remaining];
        }
        payload
            .file
            .write_all(bytes)
            .map_err(|e| UpdateError::Receive(format!("writing {}: {e}", payload.part.display())))?;
        payload.received += bytes.len() as u32;
        self.handler.on_progress(payload.received, payload.total);

        if payload.received < payload.total {
            return Ok(Progress::Continue);
        }
        let staged = self.staging_dir.join(payload.kind.file_name());
        payload
            .file
            .sync_all()
            .and_then(|()| fs::rename(&payload.part, &staged))
            .map_err(|e| UpdateError::End(e.to_string()))?;
        self.handler.on_end(payload.kind, &staged);
        Ok(Progress::Done)
    }

    fn begin(&mut self, header: Header) -> Result<Payload, UpdateError> {
        let part = self
            .staging_dir
            .join(format!("{}.part", header.kind.file_name()));
        let file = fs::create_dir_all(&self.staging_dir)
            .and_then(|()| File::create(&part))
            .map_err(|e| UpdateError::Begin(format!("{}: {e}", part.display())))?;
        self.handler.on_start(header.kind, header.total);
        Ok(Payload {
            kind: header.kind,
            total: header.total,
            received: 0,
            file,
            part,
        })
    }
}

impl<H: UpdateHandler> UpdateService for UpdateListener<H> {
    fn poll(&mut self) {
        self.accept();
        let Some(mut transfer) = self.transfer.take() else {
            return;
        };
        match self.advance(&mut transfer) {
            Ok(Progress::Continue) => self.transfer = Some(transfer),
            Ok(Progress::Done) => info!(peer = %transfer.peer, "update transfer complete"),
            Err(e) => {
                if let Stage::Payload(payload) = &transfer.stage {
                    let _ = fs::remove_file(&payload.part);
                }
                warn!(peer = %transfer.peer, error = %e, "update transfer abandoned");
                self.handler.on_error(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq)]
    enum Event {
        Start(UpdateKind, u32),
        Progress(u32, u32),
        Error(String),
        End(UpdateKind, PathBuf),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl UpdateHandler for Recorder {
        fn on_start(&mut self, kind: UpdateKind, total: u32) {
            self.events.push(Event::Start(kind, total));
        }
        fn on_progress(&mut self, received: u32, total: u32) {
            self.events.push(Event::Progress(received, total));
        }
        fn on_error(&mut self, error: &UpdateError) {
            self.events.push(Event::Error(error.to_string()));
        }
        fn on_end(&mut self, kind: UpdateKind, staged: &Path) {
            self.events.push(Event::End(kind, staged.to_path_buf()));
        }
    }

    impl Recorder {
        fn finished(&self) -> bool {
            self.events
                .iter()
                .any(|e| matches!(e, Event::End(..) | Event::Error(_)))
        }
    }

    fn listener(dir: &Path, password: Option<&str>) -> UpdateListener<Recorder> {
        let settings = UpdateSettings {
            bind: "127.0.0.1:0".parse().unwrap(),
            password: password.map(str::to_owned),
            staging_dir: dir.to_path_buf(),
        };
        UpdateListener::bind(&settings, Recorder::default()).unwrap()
    }

    fn header(kind: u8, total: u32, password: &str) -> Vec<u8> {
        let mut h = vec![kind];
        h.extend_from_slice(&total.to_be_bytes());
        h.push(password.len() as u8);
        h.extend_from_slice(password.as_bytes());
        h
    }

    fn poll_until_finished(listener: &mut UpdateListener<Recorder>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !listener.handler().finished() {
            assert!(Instant::now() < deadline, "timed out: {:?}", listener.handler().events);
            listener.poll();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_parse_header_waits_for_all_bytes() {
        let h = header(0, 10, "pw");
        for cut in 0..h.len() {
            assert!(matches!(parse_header(&h[..cut], Some("pw")), Ok(None)));
        }
        let (parsed, used) = parse_header(&h, Some("pw")).unwrap().unwrap();
        assert_eq!(parsed, Header { kind: UpdateKind::Firmware, total: 10 });
        assert_eq!(used, h.len());
    }

    #[test]
    fn test_parse_header_rejections() {
        assert!(matches!(parse_header(&header(0, 10, "nope"), Some("pw")), Err(UpdateError::Auth)));
        assert!(matches!(parse_header(&header(7, 10, ""), None), Err(UpdateError::Begin(_))));
        assert!(matches!(parse_header(&header(1, 0, ""), None), Err(UpdateError::Begin(_))));
        // Without a configured password any offered one is accepted.
        assert!(matches!(parse_header(&header(1, 3, "x"), None), Ok(Some(_))));
    }

    #[test]
    fn test_full_transfer_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = listener(dir.path(), Some("secret"));

        let image: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(&header(0, image.len() as u32, "secret")).unwrap();
        client.write_all(&image).unwrap();

        poll_until_finished(&mut listener);

        let staged = dir.path().join("firmware.bin");
        let events = &listener.handler().events;
        assert_eq!(events.first(), Some(&Event::Start(UpdateKind::Firmware, 10_000)));
        assert_eq!(events.last(), Some(&Event::End(UpdateKind::Firmware, staged.clone())));

        let progress: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Progress(received, 10_000) => Some(*received),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&10_000));

        assert_eq!(fs::read(&staged).unwrap(), image);
        assert!(!dir.path().join("firmware.bin.part").exists());
        assert!(!listener.in_progress());
    }

    #[test]
    fn test_wrong_password_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = listener(dir.path(), Some("secret"));

        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(&header(1, 4, "guess")).unwrap();
        client.write_all(&[1, 2, 3, 4]).unwrap();

        poll_until_finished(&mut listener);
        assert_eq!(listener.handler().events, vec![Event::Error("auth failed".into())]);
        assert!(!dir.path().join("filesystem.bin").exists());
    }

    #[test]
    fn test_early_disconnect_is_receive_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = listener(dir.path(), None);

        {
            let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client.write_all(&header(0, 100, "")).unwrap();
            client.write_all(&[0; 40]).unwrap();
        }

        poll_until_finished(&mut listener);
        let last = listener.handler().events.last().unwrap();
        assert_eq!(
            last,
            &Event::Error("receive failed: connection closed after 40 of 100 bytes".into())
        );
        assert!(!dir.path().join("firmware.bin.part").exists());
        assert!(!dir.path().join("firmware.bin").exists());
    }

    #[test]
    fn test_listener_is_ready_for_next_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = listener(dir.path(), None);

        for round in 0..2u8 {
            let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client.write_all(&header(1, 3, "")).unwrap();
            client.write_all(&[round; 3]).unwrap();
            poll_until_finished(&mut listener);
            listener.handler.events.clear();
            assert_eq!(fs::read(dir.path().join("filesystem.bin")).unwrap(), [round; 3]);
        }
    }

    #[test]
    fn test_poll_is_idle_without_connections() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = listener(dir.path(), None);
        listener.poll();
        assert!(listener.handler().events.is_empty());
        assert!(!listener.in_progress());
    }
}
