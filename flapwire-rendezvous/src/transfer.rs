//! Data phase of a file transfer.
//!
//! Both peers exchange 256-byte transfer headers around each file's raw
//! bytes. Every socket operation is bounded by the stall timeout and races
//! the cancel flag, and the byte loop moves at most one chunk between
//! checkpoints so pause and cancel take effect promptly.

use crate::error::RendezvousError;
use crate::path::{receive_path, SourceFile};
use bytes::{Buf, BytesMut};
use flapwire_client::config::RendezvousConfig;
use flapwire_protocol::oft::{FileChecksum, CHECKSUM_SEED};
use flapwire_protocol::{Cookie, OftHeader, OftType};
use serde::Serialize;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

/// Cooperative pause and cancel flags shared by a session and its transfer.
#[derive(Debug, Default)]
pub struct TransferControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    changed: Notify,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Waits while paused. Fails once cancelled.
    pub async fn checkpoint(&self) -> Result<(), RendezvousError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return Err(RendezvousError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

impl TransferOptions {
    pub fn from_config(config: &RendezvousConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&RendezvousConfig::default())
    }
}

/// Transfer progress as reported to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub file: String,
    pub file_bytes: u64,
    pub file_size: u64,
    pub bytes: u64,
    pub total: u64,
}

impl Progress {
    fn start_file(&mut self, name: &str, size: u64, offset: u64) {
        self.file = name.to_string();
        self.file_size = size;
        self.file_bytes = offset;
        self.bytes += offset;
    }

    fn advance(&mut self, n: usize) {
        self.file_bytes += n as u64;
        self.bytes += n as u64;
    }
}

async fn guarded<T, F>(stall: Duration, control: &TransferControl, io: F) -> Result<T, RendezvousError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        result = tokio::time::timeout(stall, io) => match result {
            Ok(result) => Ok(result?),
            Err(_) => Err(RendezvousError::Stalled(stall)),
        },
        _ = control.cancelled() => Err(RendezvousError::Cancelled),
    }
}

/// A connected peer stream carrying transfer headers and file data.
pub struct PeerChannel<S> {
    stream: S,
    buf: BytesMut,
    stall: Duration,
    control: Arc<TransferControl>,
}

impl<S> PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, stall: Duration, control: Arc<TransferControl>) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            stall,
            control,
        }
    }

    pub fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn read_header(&mut self, expected: &'static str) -> Result<OftHeader, RendezvousError> {
        let control = self.control.clone();
        loop {
            if let Some(header) = OftHeader::decode(&mut self.buf)? {
                tracing::trace!("Received {:?} header for {}", header.kind, header.filename);
                return Ok(header);
            }
            let n = guarded(self.stall, &control, self.stream.read_buf(&mut self.buf)).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("peer closed while waiting for {}", expected),
                )
                .into());
            }
        }
    }

    pub async fn expect_header(&mut self, kind: OftType, expected: &'static str) -> Result<OftHeader, RendezvousError> {
        let header = self.read_header(expected).await?;
        if header.kind != kind {
            return Err(RendezvousError::UnexpectedHeader {
                expected,
                found: format!("{:?} header", header.kind),
            });
        }
        Ok(header)
    }

    pub async fn write_header(&mut self, header: &OftHeader) -> Result<(), RendezvousError> {
        let bytes = header.encode();
        self.write_data(&bytes).await
    }

    /// Reads file bytes, draining anything buffered behind the last header.
    pub async fn read_data(&mut self, out: &mut [u8]) -> Result<usize, RendezvousError> {
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        let control = self.control.clone();
        guarded(self.stall, &control, self.stream.read(out)).await
    }

    pub async fn write_data(&mut self, data: &[u8]) -> Result<(), RendezvousError> {
        let control = self.control.clone();
        guarded(self.stall, &control, self.stream.write_all(data)).await?;
        guarded(self.stall, &control, self.stream.flush()).await
    }
}

/// Checksum over the first `len` bytes of `path`, zero-filled past its end.
pub async fn prefix_checksum(path: &Path, len: u64) -> Result<u32, RendezvousError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut sum = FileChecksum::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            buf[..want].fill(0);
            sum.update(&buf[..want]);
            remaining -= want as u64;
            continue;
        }
        sum.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(sum.value())
}

/// The offset to resume from after a peer's resume request, and the
/// checksum of the bytes before it.
async fn resume_offset(path: &Path, size: u32, request: &OftHeader) -> Result<(u32, u32), RendezvousError> {
    let requested = request.bytes_received;
    if requested == 0 || requested > size {
        return Ok((0, CHECKSUM_SEED));
    }
    let ours = prefix_checksum(path, requested as u64).await?;
    if ours == request.received_checksum {
        tracing::info!("Resuming {} at byte {}", request.filename, requested);
        Ok((requested, ours))
    } else {
        tracing::warn!(
            "Resume checksum mismatch for {} ({:#010x} != {:#010x}), restarting",
            request.filename,
            request.received_checksum,
            ours
        );
        Ok((0, CHECKSUM_SEED))
    }
}

fn header_size(size: u64) -> Result<u32, RendezvousError> {
    u32::try_from(size).map_err(|_| RendezvousError::FileTooLarge(size))
}

/// Sends `files` in order. Returns the number of bytes written.
pub async fn send_files<S, P>(
    channel: &mut PeerChannel<S>,
    cookie: Cookie,
    files: &[SourceFile],
    chunk_size: usize,
    mut progress: P,
) -> Result<u64, RendezvousError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: FnMut(&Progress),
{
    let total: u64 = files.iter().map(|f| f.size).sum();
    let total_size = header_size(total)?;
    let mut tracker = Progress {
        total,
        ..Progress::default()
    };
    let mut written = 0u64;

    for (index, file) in files.iter().enumerate() {
        let size = header_size(file.size)?;
        let checksum = prefix_checksum(&file.path, file.size).await?;
        let mut prompt = OftHeader::prompt(cookie, file.name.clone(), size, file.modified, checksum);
        prompt.total_files = files.len() as u16;
        prompt.files_left = (files.len() - index) as u16;
        prompt.total_size = total_size;
        channel.write_header(&prompt).await?;

        let reply = channel.read_header("file acknowledgement").await?;
        let offset = match reply.kind {
            OftType::Ack => 0,
            OftType::Resume => {
                let (offset, prefix) = resume_offset(&file.path, size, &reply).await?;
                let mut accept = prompt.reply(OftType::ResumeAccept);
                accept.bytes_received = offset;
                accept.received_checksum = prefix;
                channel.write_header(&accept).await?;
                channel
                    .expect_header(OftType::ResumeAck, "resume acknowledgement")
                    .await?;
                offset
            }
            other => {
                return Err(RendezvousError::UnexpectedHeader {
                    expected: "file acknowledgement",
                    found: format!("{:?} header", other),
                })
            }
        };

        tracker.start_file(&file.name, file.size, offset as u64);
        written += send_data(channel, file, offset, chunk_size, &mut tracker, &mut progress).await?;
        channel.expect_header(OftType::Done, "completion").await?;
        tracing::info!("Sent {} ({} bytes)", file.name, file.size);
    }
    Ok(written)
}

async fn send_data<S, P>(
    channel: &mut PeerChannel<S>,
    file: &SourceFile,
    offset: u32,
    chunk_size: usize,
    tracker: &mut Progress,
    progress: &mut P,
) -> Result<u64, RendezvousError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: FnMut(&Progress),
{
    let mut source = tokio::fs::File::open(&file.path).await?;
    source.seek(SeekFrom::Start(offset as u64)).await?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = file.size - offset as u64;
    let mut padding = false;

    while remaining > 0 {
        channel.control().checkpoint().await?;
        let want = remaining.min(buf.len() as u64) as usize;
        let mut n = if padding { 0 } else { source.read(&mut buf[..want]).await? };
        if n == 0 {
            if !padding {
                tracing::warn!("{} ended early, padding {} bytes", file.path.display(), remaining);
                padding = true;
            }
            buf[..want].fill(0);
            n = want;
        }
        channel.write_data(&buf[..n]).await?;
        remaining -= n as u64;
        tracker.advance(n);
        progress(tracker);
    }
    Ok(file.size - offset as u64)
}

/// Receives files into `dest` until the sender's last file. Returns the
/// paths written.
pub async fn receive_files<S, P>(
    channel: &mut PeerChannel<S>,
    dest: &Path,
    chunk_size: usize,
    mut progress: P,
) -> Result<Vec<PathBuf>, RendezvousError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: FnMut(&Progress),
{
    let mut received = Vec::new();
    let mut tracker = Progress::default();
    loop {
        let prompt = channel.expect_header(OftType::Prompt, "file prompt").await?;
        let target = receive_path(dest, &prompt.filename)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracker.total = prompt.total_size as u64;

        let existing = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 && meta.len() < prompt.size as u64 => meta.len() as u32,
            _ => 0,
        };
        let offset = if existing > 0 {
            let mut resume = prompt.reply(OftType::Resume);
            resume.bytes_received = existing;
            resume.received_checksum = prefix_checksum(&target, existing as u64).await?;
            channel.write_header(&resume).await?;
            let accept = channel
                .expect_header(OftType::ResumeAccept, "resume acceptance")
                .await?;
            let offset = accept.bytes_received.min(existing);
            channel.write_header(&accept.reply(OftType::ResumeAck)).await?;
            offset
        } else {
            channel.write_header(&prompt.reply(OftType::Ack)).await?;
            0
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)
            .await?;
        file.set_len(offset as u64).await?;
        file.seek(SeekFrom::Start(offset as u64)).await?;
        tracker.start_file(&prompt.filename, prompt.size as u64, offset as u64);

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut remaining = (prompt.size - offset) as u64;
        while remaining > 0 {
            channel.control().checkpoint().await?;
            let want = remaining.min(buf.len() as u64) as usize;
            let n = channel.read_data(&mut buf[..want]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("peer closed with {} bytes of {} outstanding", remaining, prompt.filename),
                )
                .into());
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
            tracker.advance(n);
            progress(&tracker);
        }
        file.flush().await?;
        drop(file);

        let mut done = prompt.reply(OftType::Done);
        done.bytes_received = prompt.size;
        done.received_checksum = prefix_checksum(&target, prompt.size as u64).await?;
        if done.received_checksum != prompt.checksum {
            tracing::warn!("Checksum mismatch on {}", prompt.filename);
        }
        channel.write_header(&done).await?;
        tracing::info!("Received {} ({} bytes)", prompt.filename, prompt.size);
        received.push(target);

        if prompt.files_left <= 1 {
            return Ok(received);
        }
    }
}
