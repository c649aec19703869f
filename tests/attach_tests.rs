//! Attach stream protocol tests.
//!
//! Properties from the wire contract: demux(mux(c, p)) == (c, p) for every
//! data channel and payload shape, malformed headers surface as a sync
//! loss within one frame, and the detach sequence ends an attach without
//! touching the container.

use caravel::attach::{
    broker, mux_frame, parse_detach_keys, parse_header, read_frame, should_proxy_signal,
    AttachConfig, AttachIo, AttachOutcome, Channel, DetachScanner,
};
use caravel::error::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

// =============================================================================
// Framing Properties
// =============================================================================

#[tokio::test]
async fn roundtrip_for_all_channels_and_payload_shapes() {
    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"x".to_vec(),
        b"hello world\n".to_vec(),
        vec![0u8; 4096],
        (0..=255u8).collect(),
    ];
    for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr] {
        for payload in &payloads {
            let frame = mux_frame(channel, payload);
            let mut cursor = std::io::Cursor::new(frame);
            let (decoded_channel, decoded_payload) =
                read_frame(&mut cursor).await.unwrap().unwrap();
            assert_eq!(decoded_channel, channel);
            assert_eq!(&decoded_payload, payload);
        }
    }
}

#[tokio::test]
async fn consecutive_frames_decode_in_order() {
    let mut wire = Vec::new();
    wire.extend(mux_frame(Channel::Stdout, b"first"));
    wire.extend(mux_frame(Channel::Stderr, b"second"));
    wire.extend(mux_frame(Channel::Stdout, b"third"));

    let mut cursor = std::io::Cursor::new(wire);
    let frames = [
        (Channel::Stdout, b"first".to_vec()),
        (Channel::Stderr, b"second".to_vec()),
        (Channel::Stdout, b"third".to_vec()),
    ];
    for expected in &frames {
        let got = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&got.0, &expected.0);
        assert_eq!(&got.1, &expected.1);
    }
    assert!(read_frame(&mut cursor).await.unwrap().is_none());
}

#[test]
fn malformed_headers_are_sync_lost() {
    // Bad channel.
    let mut header = [0u8; 8];
    header[0] = 9;
    assert!(matches!(parse_header(&header), Err(Error::SyncLost(_))));

    // Reserved bytes set.
    let mut header = [0u8; 8];
    header[1] = 0xFF;
    assert!(matches!(parse_header(&header), Err(Error::SyncLost(_))));

    // Length beyond the cap.
    let mut header = [0u8; 8];
    header[4..].copy_from_slice(&(u32::MAX).to_be_bytes());
    assert!(matches!(parse_header(&header), Err(Error::SyncLost(_))));
}

#[tokio::test]
async fn truncated_payload_is_sync_lost_within_one_frame() {
    let mut wire = mux_frame(Channel::Stdout, b"complete");
    wire.extend(mux_frame(Channel::Stdout, b"will be cut"));
    wire.truncate(wire.len() - 4);

    let mut cursor = std::io::Cursor::new(wire);
    // First frame is fine.
    assert!(read_frame(&mut cursor).await.unwrap().is_some());
    // Second frame dies inside its payload.
    assert!(matches!(
        read_frame(&mut cursor).await,
        Err(Error::SyncLost(_))
    ));
}

// =============================================================================
// Detach Keys
// =============================================================================

#[test]
fn default_sequence_is_ctrl_p_ctrl_q() {
    assert_eq!(parse_detach_keys("").unwrap(), vec![16, 17]);
    assert_eq!(parse_detach_keys("ctrl-p,ctrl-q").unwrap(), vec![16, 17]);
}

#[test]
fn scanner_strips_sequence_split_across_chunks() {
    let mut scanner = DetachScanner::new(vec![16, 17]);
    let mut forwarded = Vec::new();
    let mut detached = false;
    for chunk in [&b"hel"[..], &[b'l', b'o', 16][..], &[17][..]] {
        let (out, d) = scanner.scan(chunk);
        forwarded.extend(out);
        if d {
            detached = true;
            break;
        }
    }
    assert!(detached);
    assert_eq!(forwarded, b"hello");
}

#[test]
fn scanner_forwards_interrupted_prefix() {
    let mut scanner = DetachScanner::new(vec![16, 17]);
    let (out, detached) = scanner.scan(&[16, b'z', 16, 17]);
    assert!(detached);
    assert_eq!(out, vec![16, b'z']);
}

// =============================================================================
// Signal Proxy Filter
// =============================================================================

#[test]
fn client_signals_stay_with_the_client() {
    for signal in [libc::SIGCHLD, libc::SIGPIPE, libc::SIGURG] {
        assert!(!should_proxy_signal(signal));
    }
    for signal in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGWINCH] {
        assert!(should_proxy_signal(signal));
    }
}

// =============================================================================
// Broker Scenarios
// =============================================================================

#[tokio::test]
async fn stdout_and_stderr_arrive_as_separate_frames() {
    let (client, server) = tokio::io::duplex(4096);
    let (out_tx, out_rx) = mpsc::channel(8);

    let attach = tokio::spawn(broker(
        server,
        AttachConfig::default(),
        AttachIo {
            output: out_rx,
            stdin: None,
        },
    ));

    out_tx.send((Channel::Stdout, b"out\n".to_vec())).await.unwrap();
    out_tx.send((Channel::Stderr, b"err\n".to_vec())).await.unwrap();
    drop(out_tx);

    let (mut read, _write) = tokio::io::split(client);
    let (c1, p1) = read_frame(&mut read).await.unwrap().unwrap();
    let (c2, p2) = read_frame(&mut read).await.unwrap().unwrap();
    assert_eq!((c1, p1.as_slice()), (Channel::Stdout, &b"out\n"[..]));
    assert_eq!((c2, p2.as_slice()), (Channel::Stderr, &b"err\n"[..]));

    assert_eq!(attach.await.unwrap().unwrap(), AttachOutcome::Closed);
}

#[tokio::test]
async fn detach_sequence_ends_attach_without_killing_output_source() {
    let (client, server) = tokio::io::duplex(4096);
    let (out_tx, out_rx) = mpsc::channel(8);
    let (in_tx, mut in_rx) = mpsc::channel(8);

    let attach = tokio::spawn(broker(
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

    let (_read, mut write) = tokio::io::split(client);
    write.write_all(b"typed").await.unwrap();
    write.write_all(&[16, 17]).await.unwrap();
    write.flush().await.unwrap();

    assert_eq!(in_rx.recv().await.unwrap(), b"typed");
    assert_eq!(attach.await.unwrap().unwrap(), AttachOutcome::Detached);
    // The output channel survives the detach: the container keeps running.
    assert!(out_tx.send((Channel::Stdout, b"still here".to_vec())).await.is_ok());
}

#[tokio::test]
async fn async_error_frame_terminates_with_stream_error() {
    let (client, server) = tokio::io::duplex(4096);
    let (out_tx, out_rx) = mpsc::channel(8);

    let attach = tokio::spawn(broker(
        server,
        AttachConfig::default(),
        AttachIo {
            output: out_rx,
            stdin: None,
        },
    ));

    out_tx
        .send((Channel::AsyncError, b"backend went away".to_vec()))
        .await
        .unwrap();

    let (mut read, _write) = tokio::io::split(client);
    let (channel, payload) = read_frame(&mut read).await.unwrap().unwrap();
    assert_eq!(channel, Channel::AsyncError);
    assert_eq!(payload, b"backend went away");

    let result = attach.await.unwrap();
    assert!(matches!(result, Err(Error::StreamError(_))));
}
