//! Attach streams: frame multiplexing, detach keys, signal proxy filter.
//!
//! Wire format (non-TTY): each frame is an 8-byte header then `N` payload
//! bytes.
//!
//! ```text
//! offset  size  meaning
//! 0       1     channel: 0 stdin, 1 stdout, 2 stderr, 3 async error
//! 1..3    3     reserved, must be 0
//! 4..7    4     payload length N, big-endian u32
//! 8..8+N  N     payload
//! ```
//!
//! Channel 3 carries a UTF-8 error message and terminates the stream. When
//! the container has a TTY the wire is raw bytes, not multiplexed. A
//! malformed header is a synchronization loss: the stream cannot be
//! re-framed and the reader gives up within one frame.

use crate::constants::{DEFAULT_DETACH_KEYS, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

// =============================================================================
// Channels
// =============================================================================

/// Stream channel in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    /// Error report from the service; terminates the stream.
    AsyncError,
}

impl Channel {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::AsyncError => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::AsyncError),
            _ => None,
        }
    }
}

// =============================================================================
// Mux / Demux
// =============================================================================

/// Encodes one frame.
pub fn mux_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(channel.as_byte());
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.to_vec()
}

/// Parses a frame header. Reserved bytes must be zero and the length must
/// be sane; anything else means the stream lost sync.
pub fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(Channel, u32)> {
    let channel = Channel::from_byte(header[0])
        .ok_or_else(|| Error::SyncLost(format!("invalid channel byte {}", header[0])))?;
    if header[1] != 0 || header[2] != 0 || header[3] != 0 {
        return Err(Error::SyncLost("nonzero reserved bytes".to_string()));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::SyncLost(format!("oversized frame: {len} bytes")));
    }
    Ok((channel, len))
}

/// Reads one frame. `Ok(None)` is a clean EOF at a frame boundary; EOF
/// mid-frame is a sync loss.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(Channel, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (channel, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::SyncLost("EOF inside frame payload".to_string())
            }
            _ => Error::Io(e),
        })?;
    Ok(Some((channel, payload)))
}

/// Writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    channel: Channel,
    payload: &[u8],
) -> Result<()> {
    writer.write_all(&mux_frame(channel, payload)).await?;
    writer.flush().await?;
    Ok(())
}

// =============================================================================
// Detach Keys
// =============================================================================

/// Parses a detach-key spec like `ctrl-p,ctrl-q` into raw bytes.
pub fn parse_detach_keys(spec: &str) -> Result<Vec<u8>> {
    if spec.is_empty() {
        return Ok(DEFAULT_DETACH_KEYS.to_vec());
    }
    let mut keys = Vec::new();
    for part in spec.split(',') {
        if let Some(letter) = part.strip_prefix("ctrl-") {
            let c = letter
                .chars()
                .next()
                .filter(|c| c.is_ascii_lowercase() && letter.len() == 1)
                .ok_or_else(|| {
                    Error::InvalidArg(format!("invalid detach key: {part:?}"))
                })?;
            keys.push(c as u8 - b'a' + 1);
        } else if part.len() == 1 {
            keys.push(part.as_bytes()[0]);
        } else {
            return Err(Error::InvalidArg(format!("invalid detach key: {part:?}")));
        }
    }
    Ok(keys)
}

/// Incremental scanner for the detach sequence in a stdin stream.
///
/// Feed input chunks; the scanner returns the bytes safe to forward and
/// flags when the full sequence was seen. A partial match at a chunk
/// boundary is held back until disambiguated.
pub struct DetachScanner {
    sequence: Vec<u8>,
    matched: usize,
}

impl DetachScanner {
    pub fn new(sequence: Vec<u8>) -> Self {
        Self {
            sequence,
            matched: 0,
        }
    }

    /// Scans a chunk. Returns (bytes to forward, detach seen).
    pub fn scan(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        if self.sequence.is_empty() {
            return (input.to_vec(), false);
        }
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            if b == self.sequence[self.matched] {
                self.matched += 1;
                if self.matched == self.sequence.len() {
                    return (out, true);
                }
            } else {
                // Flush the partial match, then retry this byte at the
                // start of the sequence.
                out.extend_from_slice(&self.sequence[..self.matched]);
                self.matched = 0;
                if b == self.sequence[0] {
                    self.matched = 1;
                } else {
                    out.push(b);
                }
            }
        }
        (out, false)
    }
}

// =============================================================================
// Signal Proxy Filter
// =============================================================================

/// Signals the attach client never forwards: they belong to the client
/// process itself (child reaping, broken pipes, runtime preemption).
const UNPROXIED_SIGNALS: &[i32] = &[libc::SIGCHLD, libc::SIGPIPE, libc::SIGURG];

/// Whether an attach client should forward this signal to the container.
pub fn should_proxy_signal(signal: i32) -> bool {
    !UNPROXIED_SIGNALS.contains(&signal)
}

// =============================================================================
// Broker
// =============================================================================

/// What the attach client asked to wire up.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
    pub detach_keys: Vec<u8>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            detach_keys: DEFAULT_DETACH_KEYS.to_vec(),
        }
    }
}

/// Container-side endpoints the broker bridges to.
pub struct AttachIo {
    /// Output from the container, already split by channel.
    pub output: mpsc::Receiver<(Channel, Vec<u8>)>,
    /// Sink toward the container's stdin, when it accepts input.
    pub stdin: Option<mpsc::Sender<Vec<u8>>>,
}

/// How an attach ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Output ended: container closed its streams.
    Closed,
    /// The detach sequence was typed; the container keeps running.
    Detached,
}

/// Bridges one hijacked byte stream to a container's stdio.
///
/// Runs the stdin copy and the output mux as concurrent halves of one
/// select loop; either side ending tears the whole attach down.
pub async fn broker<S>(stream: S, config: AttachConfig, mut io: AttachIo) -> Result<AttachOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut scanner = DetachScanner::new(config.detach_keys.clone());
    let mut stdin_buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            // Container output → client.
            chunk = io.output.recv() => {
                match chunk {
                    Some((channel, payload)) => {
                        let wanted = match channel {
                            Channel::Stdout => config.stdout,
                            Channel::Stderr => config.stderr,
                            _ => true,
                        };
                        if !wanted {
                            continue;
                        }
                        if config.tty {
                            write_half.write_all(&payload).await?;
                            write_half.flush().await?;
                        } else {
                            write_frame(&mut write_half, channel, &payload).await?;
                        }
                        if channel == Channel::AsyncError {
                            return Err(Error::StreamError(
                                String::from_utf8_lossy(&payload).to_string(),
                            ));
                        }
                    }
                    None => {
                        debug!("attach output closed");
                        return Ok(AttachOutcome::Closed);
                    }
                }
            }
            // Client stdin → container.
            read = read_half.read(&mut stdin_buf), if config.stdin => {
                let n = read?;
                if n == 0 {
                    return Ok(AttachOutcome::Closed);
                }
                let (forward, detached) = scanner.scan(&stdin_buf[..n]);
                if let Some(tx) = &io.stdin {
                    if !forward.is_empty() && tx.send(forward).await.is_err() {
                        return Ok(AttachOutcome::Closed);
                    }
                }
                if detached {
                    debug!("detach sequence received");
                    return Ok(AttachOutcome::Detached);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_demux_roundtrip_all_channels() {
        for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr] {
            let payload = b"hello frame";
            let frame = mux_frame(channel, payload);
            let header: [u8; 8] = frame[..8].try_into().unwrap();
            let (parsed, len) = parse_header(&header).unwrap();
            assert_eq!(parsed, channel);
            assert_eq!(len as usize, payload.len());
            assert_eq!(&frame[8..], payload);
        }
    }

    #[test]
    fn parse_header_rejects_bad_channel() {
        let mut header = [0u8; 8];
        header[0] = 7;
        assert!(matches!(
            parse_header(&header),
            Err(Error::SyncLost(_))
        ));
    }

    #[test]
    fn parse_header_rejects_reserved_bytes() {
        let mut header = [0u8; 8];
        header[2] = 1;
        assert!(matches!(parse_header(&header), Err(Error::SyncLost(_))));
    }

    #[test]
    fn parse_header_rejects_oversized_length() {
        let mut header = [0u8; 8];
        header[4..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(parse_header(&header), Err(Error::SyncLost(_))));
    }

    #[tokio::test]
    async fn read_frame_clean_eof_is_none() {
        let data: Vec<u8> = mux_frame(Channel::Stdout, b"out");
        let mut cursor = std::io::Cursor::new(data);
        let (channel, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(channel, Channel::Stdout);
        assert_eq!(payload, b"out");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_eof_mid_frame_is_sync_lost() {
        let mut data = mux_frame(Channel::Stdout, b"truncated payload");
        data.truncate(12);
        let mut cursor = std::io::Cursor::new(data);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::SyncLost(_))
        ));
    }

    #[test]
    fn detach_keys_parsing() {
        assert_eq!(parse_detach_keys("").unwrap(), vec![16, 17]);
        assert_eq!(parse_detach_keys("ctrl-p,ctrl-q").unwrap(), vec![16, 17]);
        assert_eq!(parse_detach_keys("ctrl-a").unwrap(), vec![1]);
        assert!(parse_detach_keys("ctrl-").is_err());
        assert!(parse_detach_keys("meta-x").is_err());
    }

    #[test]
    fn detach_scanner_detects_sequence() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        let (out, detached) = scanner.scan(b"abc");
        assert_eq!(out, b"abc");
        assert!(!detached);

        let (out, detached) = scanner.scan(&[16, 17]);
        assert!(out.is_empty());
        assert!(detached);
    }

    #[test]
    fn detach_scanner_handles_chunk_boundary() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        let (out, detached) = scanner.scan(&[b'x', 16]);
        assert_eq!(out, b"x");
        assert!(!detached);
        let (out, detached) = scanner.scan(&[17]);
        assert!(out.is_empty());
        assert!(detached);
    }

    #[test]
    fn detach_scanner_flushes_false_start() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        let (out, detached) = scanner.scan(&[16, b'a', b'b']);
        assert_eq!(out, vec![16, b'a', b'b']);
        assert!(!detached);
    }

    #[test]
    fn signal_proxy_filter() {
        assert!(!should_proxy_signal(libc::SIGCHLD));
        assert!(!should_proxy_signal(libc::SIGPIPE));
        assert!(!should_proxy_signal(libc::SIGURG));
        assert!(should_proxy_signal(libc::SIGTERM));
        assert!(should_proxy_signal(libc::SIGINT));
        assert!(should_proxy_signal(libc::SIGWINCH));
    }

    #[tokio::test]
    async fn broker_muxes_output_and_detaches() {
        let (client, server) = tokio::io::duplex(1024);
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);

        let handle = tokio::spawn(broker(
            server,
            AttachConfig {
                stdin: true,
                ..Default::default()
            },
            AttachIo {
                output: out_rx,
                stdin: Some(in_tx),
            },
        ));

        out_tx
            .send((Channel::Stdout, b"out\n".to_vec()))
            .await
            .unwrap();
        out_tx
            .send((Channel::Stderr, b"err\n".to_vec()))
            .await
            .unwrap();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (c1, p1) = read_frame(&mut client_read).await.unwrap().unwrap();
        assert_eq!(c1, Channel::Stdout);
        assert_eq!(p1, b"out\n");
        let (c2, p2) = read_frame(&mut client_read).await.unwrap().unwrap();
        assert_eq!(c2, Channel::Stderr);
        assert_eq!(p2, b"err\n");

        // Type something, then the detach sequence.
        client_write.write_all(b"input").await.unwrap();
        client_write.write_all(&[16, 17]).await.unwrap();
        client_write.flush().await.unwrap();

        assert_eq!(in_rx.recv().await.unwrap(), b"input");
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, AttachOutcome::Detached);
    }

    #[tokio::test]
    async fn broker_tty_mode_is_raw() {
        let (client, server) = tokio::io::duplex(1024);
        let (out_tx, out_rx) = mpsc::channel(8);

        let handle = tokio::spawn(broker(
            server,
            AttachConfig {
                tty: true,
                ..Default::default()
            },
            AttachIo {
                output: out_rx,
                stdin: None,
            },
        ));

        out_tx
            .send((Channel::Stdout, b"raw bytes".to_vec()))
            .await
            .unwrap();
        drop(out_tx);

        let (mut client_read, _client_write) = tokio::io::split(client);
        let mut buf = vec![0u8; 9];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"raw bytes");
        assert_eq!(handle.await.unwrap().unwrap(), AttachOutcome::Closed);
    }
}
