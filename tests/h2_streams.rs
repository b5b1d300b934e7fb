//! Stream lifecycle tests: local encoding limits, cancellation, trailers,
//! streaming uploads and peer protocol violations.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mimic_h2::transport::h2::{handshake, ConnectionOptions};
use mimic_h2::{
    Body, CancellationToken, Error, ErrorCode, FingerprintConfig, H2Handle, LocalLimits, Request,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

mod helpers;
use helpers::mock_h2_server::{MockH2Server, ReceivedRequest, ACK, GOAWAY, PING, RST_STREAM};
use helpers::{init_tracing, test_transport, within};

const PROTOCOL_ERROR: u32 = 0x1;
const CANCEL: u32 = 0x8;
const COMPRESSION_ERROR: u32 = 0x9;

#[tokio::test]
async fn test_header_list_overflow_fails_locally() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let (tx, mut rx) = mpsc::unbounded_channel::<ReceivedRequest>();

    let _server = server.start(move |conn, _| {
        let tx = tx.clone();
        async move {
            // SETTINGS_MAX_HEADER_LIST_SIZE = 1024
            conn.handshake(&[(0x6, 1024)]).await.unwrap();
            loop {
                let Ok(req) = conn.read_request().await else {
                    return;
                };
                conn.send_response(req.stream_id, 200, &[], b"").await.unwrap();
                tx.send(req).unwrap();
            }
        }
    });

    let transport = test_transport().build().unwrap();
    // First request lets the client see the peer's SETTINGS.
    within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap();

    let oversized = Request::get(&url)
        .unwrap()
        .with_header("x-large", "v".repeat(2000));
    let err = within(transport.round_trip(oversized)).await.unwrap_err();
    match &err {
        Error::HeaderListTooLarge { size, limit } => {
            assert_eq!(*limit, 1024);
            assert!(*size > 1024);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_encoding());
    assert!(!err.is_retryable());

    // The HPACK state is untouched: the server still decodes the next block.
    let normal = Request::get(&url).unwrap().with_header("x-small", "1");
    let resp = within(transport.round_trip(normal)).await.unwrap();
    assert_eq!(resp.status, 200);

    let first = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(third.header("x-small"), Some("1"));
    // The oversized request never consumed a stream id.
    assert_eq!(third.stream_id, first.stream_id + 2);
    assert_eq!(transport.pool_stats().await.http2_connections, 1);
}

#[tokio::test]
async fn test_cancel_after_headers_still_yields_response() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let (sent_tx, sent_rx) = oneshot::channel::<()>();
    let sent_tx = std::sync::Mutex::new(Some(sent_tx));

    let _server = server.start(move |conn, _| {
        let sent_tx = sent_tx.lock().unwrap().take();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            conn.send_response(req.stream_id, 200, &[], b"").await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(tx) = sent_tx {
                let _ = tx.send(());
            }
            let _ = conn.read_frame().await;
        }
    });

    let transport = test_transport().build().unwrap();
    let cancel = CancellationToken::new();
    let request = Request::get(&url).unwrap().with_cancel(cancel.clone());
    tokio::spawn(async move {
        let _ = sent_rx.await;
        cancel.cancel();
    });

    let resp = within(transport.round_trip(request)).await.unwrap();
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn test_cancel_after_head_with_pending_body() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/late-body", server.url());
    let (head_tx, head_rx) = oneshot::channel::<()>();
    let head_tx = std::sync::Mutex::new(Some(head_tx));

    let _server = server.start(move |conn, _| {
        let head_tx = head_tx.lock().unwrap().take();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            let block = conn.encode_headers(200, &[]).await;
            conn.send_headers(req.stream_id, &block, false, true)
                .await
                .unwrap();
            if let Some(tx) = head_tx {
                let _ = tx.send(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            conn.send_data(req.stream_id, b"late body", true)
                .await
                .unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let transport = test_transport().build().unwrap();
    let cancel = CancellationToken::new();
    let request = Request::get(&url).unwrap().with_cancel(cancel.clone());
    tokio::spawn(async move {
        let _ = head_rx.await;
        // Long enough for the client to take the head, well before DATA.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let resp = within(transport.round_trip(request)).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body().as_ref(), b"late body");
}

#[tokio::test]
async fn test_cancel_before_headers_resets_stream() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/slow", server.url());
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<(u32, u32, u32)>();

    let _server = server.start(move |conn, _| {
        let reset_tx = reset_tx.clone();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            let frame = conn.expect_frame(RST_STREAM).await.unwrap();
            let p = &frame.payload;
            let code = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
            reset_tx.send((req.stream_id, frame.stream_id, code)).unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let transport = test_transport().build().unwrap();
    let cancel = CancellationToken::new();
    let request = Request::get(&url).unwrap().with_cancel(cancel.clone());
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = within(transport.round_trip(request)).await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "unexpected error: {:?}", err);
    assert!(err.is_canceled());

    let (request_stream, reset_stream, code) = within(reset_rx.recv()).await.unwrap();
    assert_eq!(request_stream, reset_stream);
    assert_eq!(code, CANCEL);
}

#[tokio::test]
async fn test_total_timeout_is_deadline_exceeded() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/never", server.url());

    let _server = server.start(|conn, _| async move {
        conn.handshake(&[]).await.unwrap();
        let _ = conn.read_request().await;
        let _ = conn.expect_frame(RST_STREAM).await;
    });

    let transport = test_transport()
        .timeouts(mimic_h2::Timeouts::new().total(Duration::from_millis(200)))
        .build()
        .unwrap();
    let err = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(_)), "unexpected error: {:?}", err);
    assert!(err.is_canceled());
}

#[tokio::test]
async fn test_streaming_upload_with_trailers() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/upload", server.url());
    let (tx, mut rx) = mpsc::unbounded_channel::<(ReceivedRequest, Bytes, Vec<(String, String)>)>();

    let _server = server.start(move |conn, _| {
        let tx = tx.clone();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            let (body, trailers) = conn.read_body(req.stream_id).await.unwrap();
            let block = conn.encode_headers(200, &[]).await;
            conn.send_headers(req.stream_id, &block, false, true).await.unwrap();
            conn.send_data(req.stream_id, b"stored", false).await.unwrap();
            let trailer_block = conn.encode_trailers(&[("x-checksum", "abc")]).await;
            conn.send_headers(req.stream_id, &trailer_block, true, true)
                .await
                .unwrap();
            tx.send((req, body, trailers)).unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let (body_tx, body) = Body::channel(4);
    tokio::spawn(async move {
        for chunk in [&b"hello "[..], b"streaming ", b"world"] {
            body_tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
    });
    let request = Request::post(&url, body)
        .unwrap()
        .with_trailer("X-Digest", "d1");

    let transport = test_transport().build().unwrap();
    let resp = within(transport.round_trip(request)).await.unwrap();
    assert_eq!(resp.body().as_ref(), b"stored");
    assert_eq!(
        resp.trailers(),
        &[("x-checksum".to_string(), "abc".to_string())]
    );

    let (req, body, trailers) = rx.recv().await.unwrap();
    assert!(!req.end_stream);
    assert_eq!(req.header("trailer"), Some("X-Digest"));
    assert_eq!(req.header("content-length"), None);
    assert_eq!(body.as_ref(), b"hello streaming world");
    assert_eq!(trailers, vec![("x-digest".to_string(), "d1".to_string())]);
}

#[tokio::test]
async fn test_invalid_peer_setting_sends_goaway() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let (tx, mut rx) = mpsc::unbounded_channel::<u32>();

    let _server = server.start(move |conn, _| {
        let tx = tx.clone();
        async move {
            conn.read_client_preamble().await.unwrap();
            // Wait for the request so the stream is open when SETTINGS lands.
            conn.read_request().await.unwrap();
            // ENABLE_PUSH = 2 is out of range.
            conn.send_settings(&[(0x2, 2)]).await.unwrap();
            let frame = conn.expect_frame(GOAWAY).await.unwrap();
            let p = &frame.payload;
            tx.send(u32::from_be_bytes([p[4], p[5], p[6], p[7]])).unwrap();
        }
    });

    let transport = test_transport().build().unwrap();
    let err = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidSetting { code: ErrorCode::ProtocolError, .. }),
        "unexpected error: {:?}",
        err
    );
    assert!(!err.is_retryable());
    assert_eq!(within(rx.recv()).await.unwrap(), PROTOCOL_ERROR);
}

#[tokio::test]
async fn test_push_promise_is_connection_error() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());

    let _server = server.start(|conn, _| async move {
        conn.handshake(&[]).await.unwrap();
        let req = conn.read_request().await.unwrap();
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&conn.encode_headers(200, &[]).await);
        // PUSH_PROMISE with END_HEADERS
        conn.send_frame(0x5, 0x4, req.stream_id, &payload).await.unwrap();
        let _ = conn.expect_frame(GOAWAY).await;
    });

    let transport = test_transport().build().unwrap();
    let err = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Protocol { code: ErrorCode::ProtocolError, .. }),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn test_strict_max_concurrent_streams_waits_for_slot() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let accepted = server.accepted();

    let _server = server.start(|conn, _| async move {
        // MAX_CONCURRENT_STREAMS = 1
        conn.handshake(&[(0x3, 1)]).await.unwrap();
        while let Ok(req) = conn.read_request().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.send_response(req.stream_id, 200, &[], b"").await.unwrap();
        }
    });

    let transport = test_transport()
        .strict_max_concurrent_streams(true)
        .build()
        .unwrap();
    // Learn the ceiling first.
    within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap();

    let a = transport.round_trip(Request::get(&url).unwrap());
    let b = transport.round_trip(Request::get(&url).unwrap());
    let (a, b) = within(async { tokio::join!(a, b) }).await;
    assert_eq!(a.unwrap().status, 200);
    assert_eq!(b.unwrap().status, 200);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_ceiling_opens_new_connection_by_default() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let accepted = server.accepted();

    let _server = server.start(|conn, _| async move {
        conn.handshake(&[(0x3, 1)]).await.unwrap();
        while let Ok(req) = conn.read_request().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
            conn.send_response(req.stream_id, 200, &[], b"").await.unwrap();
        }
    });

    let transport = test_transport().build().unwrap();
    within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap();

    let a = transport.round_trip(Request::get(&url).unwrap());
    let b = transport.round_trip(Request::get(&url).unwrap());
    let (a, b) = within(async { tokio::join!(a, b) }).await;
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    transport.close_idle_connections().await;
    assert_eq!(transport.pool_stats().await.http2_connections, 0);
}

async fn connect_handle(port: u16) -> H2Handle {
    let io = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut options = ConnectionOptions::new(format!("127.0.0.1:{}", port));
    options.allow_http = true;
    handshake(io, Arc::new(FingerprintConfig::new()), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ping_round_trip() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let port = server.port();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let handle_server = server.start(move |conn, _| {
        let tx = tx.clone();
        async move {
            conn.handshake(&[]).await.unwrap();
            loop {
                let Ok(frame) = conn.read_frame().await else {
                    return;
                };
                if frame.frame_type == PING && !frame.has_flag(ACK) {
                    conn.send_frame(PING, ACK, 0, &frame.payload).await.unwrap();
                    tx.send(frame.payload.to_vec()).unwrap();
                }
            }
        }
    });

    let handle = within(connect_handle(port)).await;
    let rtt = within(handle.ping()).await.unwrap();
    assert!(rtt < Duration::from_secs(5));
    let payload = rx.recv().await.unwrap();
    assert_eq!(payload.len(), 8);

    handle.close().await;
    assert!(handle.is_closed());
    assert!(handle.ping().await.is_err());
    drop(handle_server);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_stream() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/drain", server.url());
    let port = server.port();
    let (goaway_tx, goaway_rx) = oneshot::channel::<u32>();
    let goaway_tx = std::sync::Mutex::new(Some(goaway_tx));

    let _server = server.start(move |conn, _| {
        let goaway_tx = goaway_tx.lock().unwrap().take();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            let frame = conn.expect_frame(GOAWAY).await.unwrap();
            let p = &frame.payload;
            if let Some(tx) = goaway_tx {
                let _ = tx.send(u32::from_be_bytes([p[4], p[5], p[6], p[7]]));
            }
            // The stream opened before GOAWAY still completes.
            conn.send_response(req.stream_id, 200, &[], b"drained")
                .await
                .unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let handle = within(connect_handle(port)).await;
    let request = handle.send_request(Request::get(&url).unwrap());
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;
    };
    let (resp, ()) = within(async { tokio::join!(request, shutdown) }).await;
    assert_eq!(resp.unwrap().body().as_ref(), b"drained");
    assert_eq!(within(goaway_rx).await.unwrap(), 0);
    assert!(handle.is_closed());

    let err = within(handle.send_request(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_malformed_header_block_sends_compression_goaway() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let accepted = server.accepted();
    let (tx, mut rx) = mpsc::unbounded_channel::<u32>();

    let _server = server.start(move |conn, index| {
        let tx = tx.clone();
        async move {
            conn.handshake(&[]).await.unwrap();
            let req = conn.read_request().await.unwrap();
            if index == 1 {
                // Dynamic table size update with a truncated integer.
                conn.send_headers(req.stream_id, &[0x3f, 0xa3, 0xaa], true, true)
                    .await
                    .unwrap();
                let frame = conn.expect_frame(GOAWAY).await.unwrap();
                let p = &frame.payload;
                tx.send(u32::from_be_bytes([p[4], p[5], p[6], p[7]])).unwrap();
                return;
            }
            conn.send_response(req.stream_id, 200, &[], b"ok").await.unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let transport = test_transport().build().unwrap();
    let err = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Protocol { code: ErrorCode::CompressionError, .. }),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(within(rx.recv()).await.unwrap(), COMPRESSION_ERROR);

    // The broken connection is gone from the pool; the next request redials.
    let resp = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap();
    assert_eq!(resp.body().as_ref(), b"ok");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_oversized_response_headers_reset_stream() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let url = format!("{}/", server.url());
    let accepted = server.accepted();
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<(bool, u32)>();

    let _server = server.start(move |conn, _| {
        let reset_tx = reset_tx.clone();
        async move {
            let preamble = conn.handshake(&[]).await.unwrap();
            assert!(preamble.settings.contains(&(0x6, 1024)));
            let req = conn.read_request().await.unwrap();
            let big = "v".repeat(2000);
            conn.send_response(req.stream_id, 200, &[("x-big", big.as_str())], b"dropped")
                .await
                .unwrap();
            let frame = conn.expect_frame(RST_STREAM).await.unwrap();
            let p = &frame.payload;
            reset_tx
                .send((
                    frame.stream_id == req.stream_id,
                    u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
                ))
                .unwrap();

            let req = conn.read_request().await.unwrap();
            conn.send_response(req.stream_id, 200, &[("x-small", "1")], b"fine")
                .await
                .unwrap();
            let _ = conn.read_frame().await;
        }
    });

    let transport = test_transport()
        .local_limits(LocalLimits {
            max_header_list_size: 1024,
            ..LocalLimits::default()
        })
        .build()
        .unwrap();
    let err = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Protocol { code: ErrorCode::ProtocolError, .. }),
        "unexpected error: {:?}",
        err
    );
    let (same_stream, code) = within(reset_rx.recv()).await.unwrap();
    assert!(same_stream);
    assert_eq!(code, PROTOCOL_ERROR);

    // Only the stream failed; the connection and its HPACK state carry on.
    let resp = within(transport.round_trip(Request::get(&url).unwrap()))
        .await
        .unwrap();
    assert_eq!(resp.body().as_ref(), b"fine");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requests_over_peer_ceiling_queue_in_order() {
    init_tracing();
    let server = MockH2Server::new().await.unwrap();
    let port = server.port();
    let base = server.url();
    let (reserved_tx, reserved_rx) = oneshot::channel::<()>();
    let reserved_rx = std::sync::Mutex::new(Some(reserved_rx));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(u32, String, bool)>();

    let _server = server.start(move |conn, _| {
        let reserved_rx = reserved_rx.lock().unwrap().take();
        let seen_tx = seen_tx.clone();
        async move {
            conn.read_client_preamble().await.unwrap();
            if let Some(rx) = reserved_rx {
                let _ = rx.await;
            }
            // MAX_CONCURRENT_STREAMS = 1
            conn.send_settings(&[(0x3, 1)]).await.unwrap();
            let mut req = conn.read_request().await.unwrap();
            loop {
                // No other stream may open while this one is in flight.
                let early =
                    tokio::time::timeout(Duration::from_millis(50), conn.read_request()).await;
                let path = req.header(":path").unwrap_or_default().to_string();
                seen_tx
                    .send((req.stream_id, path.clone(), early.is_err()))
                    .unwrap();
                conn.send_response(req.stream_id, 200, &[], path.as_bytes())
                    .await
                    .unwrap();
                req = match early {
                    Ok(Ok(next)) => next,
                    _ => match conn.read_request().await {
                        Ok(next) => next,
                        Err(_) => return,
                    },
                };
            }
        }
    });

    let handle = within(connect_handle(port)).await;
    // Reserved while the ceiling is still unknown.
    let slots: Vec<_> = (0..3).map(|_| handle.try_reserve().unwrap()).collect();
    reserved_tx.send(()).unwrap();
    within(async {
        while handle.can_take_new_request() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let request = |path: &str| Request::get(&format!("{}{}", base, path)).unwrap();
    let mut slots = slots.into_iter();
    let a = handle.send_request_with_slot(slots.next().unwrap(), request("/1"));
    let b = handle.send_request_with_slot(slots.next().unwrap(), request("/2"));
    let c = handle.send_request_with_slot(slots.next().unwrap(), request("/3"));
    // join! polls in order, so the driver sees the requests as a, b, c.
    let (a, b, c) = within(async { tokio::join!(a, b, c) }).await;
    assert_eq!(a.unwrap().body().as_ref(), b"/1");
    assert_eq!(b.unwrap().body().as_ref(), b"/2");
    assert_eq!(c.unwrap().body().as_ref(), b"/3");

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(within(seen_rx.recv()).await.unwrap());
    }
    assert_eq!(
        seen,
        vec![
            (3, "/1".to_string(), true),
            (5, "/2".to_string(), true),
            (7, "/3".to_string(), true),
        ]
    );
    assert_eq!(handle.in_flight(), 0);
}
