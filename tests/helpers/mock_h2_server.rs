use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const PRIORITY: u8 = 0x2;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;
pub const PADDED: u8 = 0x8;
pub const PRIORITY_FLAG: u8 = 0x20;

/// A scripted HTTP/2 server speaking prior-knowledge h2 over plain TCP.
/// Each accepted connection is handed to the handler as raw frames.
pub struct MockH2Server {
    listener: TcpListener,
    port: u16,
    accepted: Arc<AtomicUsize>,
}

impl MockH2Server {
    /// Bind to a random local port.
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            accepted: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Base URL (`http://`, so the client must allow prior knowledge).
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Counter of accepted connections, readable after `start`.
    pub fn accepted(&self) -> Arc<AtomicUsize> {
        self.accepted.clone()
    }

    /// Serve every accepted connection with `handler`. The handler also
    /// receives the 1-based index of the connection.
    pub fn start<F, Fut>(self, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(MockH2Connection, usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                let index = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler(MockH2Connection::new(stream), index).await;
                });
            }
        })
    }
}

/// One raw frame.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// What the client wrote before its first request.
#[derive(Debug, Clone)]
pub struct ClientPreamble {
    pub settings: Vec<(u16, u32)>,
    pub window_update: u32,
}

/// A decoded request header block.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub stream_id: u32,
    pub headers: Vec<(String, String)>,
    pub end_stream: bool,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        self.headers.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// A single HTTP/2 connection with frame-level control.
pub struct MockH2Connection {
    stream: Mutex<TcpStream>,
    decoder: Mutex<hpack::Decoder<'static>>,
    encoder: Mutex<hpack::Encoder<'static>>,
}

impl MockH2Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            decoder: Mutex::new(hpack::Decoder::new()),
            encoder: Mutex::new(hpack::Encoder::new()),
        }
    }

    /// Read the 24-byte connection preface.
    pub async fn read_preface(&self) -> std::io::Result<()> {
        let mut stream = self.stream.lock().await;
        let mut preface = [0u8; 24];
        stream.read_exact(&mut preface).await?;
        if preface.as_slice() != b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid HTTP/2 preface",
            ));
        }
        Ok(())
    }

    /// Read the next complete frame from the client.
    pub async fn read_frame(&self) -> std::io::Result<RawFrame> {
        let mut stream = self.stream.lock().await;
        let mut header = [0u8; 9];
        stream.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let stream_id = u32::from_be_bytes([header[5] & 0x7F, header[6], header[7], header[8]]);
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;
        Ok(RawFrame {
            frame_type: header[3],
            flags: header[4],
            stream_id,
            payload: Bytes::from(payload),
        })
    }

    /// Read preface, SETTINGS and the connection WINDOW_UPDATE.
    pub async fn read_client_preamble(&self) -> std::io::Result<ClientPreamble> {
        self.read_preface().await?;
        let settings_frame = self.read_frame().await?;
        assert_eq!(settings_frame.frame_type, SETTINGS, "first frame must be SETTINGS");
        let settings = settings_frame
            .payload
            .chunks(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect();
        let update = self.read_frame().await?;
        assert_eq!(update.frame_type, WINDOW_UPDATE, "second frame must be WINDOW_UPDATE");
        assert_eq!(update.stream_id, 0);
        let window_update = u32::from_be_bytes([
            update.payload[0] & 0x7F,
            update.payload[1],
            update.payload[2],
            update.payload[3],
        ]);
        Ok(ClientPreamble {
            settings,
            window_update,
        })
    }

    /// Read the client preamble and answer with `settings`.
    pub async fn handshake(&self, settings: &[(u16, u32)]) -> std::io::Result<ClientPreamble> {
        let preamble = self.read_client_preamble().await?;
        self.send_settings(settings).await?;
        Ok(preamble)
    }

    /// Skip connection-management frames until a request HEADERS block
    /// arrives, then decode it.
    pub async fn read_request(&self) -> std::io::Result<ReceivedRequest> {
        loop {
            let frame = self.read_frame().await?;
            match frame.frame_type {
                HEADERS => return self.finish_header_block(frame).await,
                PING if !frame.has_flag(ACK) => self.send_frame(PING, ACK, 0, &frame.payload).await?,
                DATA | RST_STREAM => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("expected HEADERS, got frame type {}", frame.frame_type),
                    ))
                }
                _ => {}
            }
        }
    }

    async fn finish_header_block(&self, frame: RawFrame) -> std::io::Result<ReceivedRequest> {
        let mut payload = frame.payload.clone();
        let mut pad = 0usize;
        if frame.has_flag(PADDED) {
            pad = payload[0] as usize;
            payload = payload.slice(1..);
        }
        if frame.has_flag(PRIORITY_FLAG) {
            payload = payload.slice(5..);
        }
        let mut block = BytesMut::from(&payload[..payload.len() - pad]);
        let mut end_headers = frame.has_flag(END_HEADERS);
        while !end_headers {
            let next = self.read_frame().await?;
            assert_eq!(next.frame_type, CONTINUATION);
            assert_eq!(next.stream_id, frame.stream_id);
            block.extend_from_slice(&next.payload);
            end_headers = next.has_flag(END_HEADERS);
        }
        let fields = self
            .decoder
            .lock()
            .await
            .decode(&block)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{:?}", e)))?;
        Ok(ReceivedRequest {
            stream_id: frame.stream_id,
            headers: fields
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8_lossy(&n).into_owned(),
                        String::from_utf8_lossy(&v).into_owned(),
                    )
                })
                .collect(),
            end_stream: frame.has_flag(END_STREAM),
        })
    }

    /// Read DATA for `stream_id` until END_STREAM. Request trailers, if any,
    /// are decoded and returned too.
    pub async fn read_body(
        &self,
        stream_id: u32,
    ) -> std::io::Result<(Bytes, Vec<(String, String)>)> {
        let mut body = BytesMut::new();
        loop {
            let frame = self.read_frame().await?;
            if frame.stream_id != stream_id {
                continue;
            }
            match frame.frame_type {
                DATA => {
                    body.extend_from_slice(&frame.payload);
                    if frame.has_flag(END_STREAM) {
                        return Ok((body.freeze(), Vec::new()));
                    }
                }
                HEADERS => {
                    let trailers = self.finish_header_block(frame).await?;
                    return Ok((body.freeze(), trailers.headers));
                }
                _ => {}
            }
        }
    }

    /// HPACK-encode a response header block.
    pub async fn encode_headers(&self, status: u16, headers: &[(&str, &str)]) -> Vec<u8> {
        let status = status.to_string();
        let mut fields: Vec<(&[u8], &[u8])> = vec![(&b":status"[..], status.as_bytes())];
        fields.extend(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        self.encoder.lock().await.encode(fields)
    }

    /// HPACK-encode a trailer block on the connection's encoder.
    pub async fn encode_trailers(&self, trailers: &[(&str, &str)]) -> Vec<u8> {
        let fields: Vec<(&[u8], &[u8])> = trailers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        self.encoder.lock().await.encode(fields)
    }

    /// Send a complete response: HEADERS, then DATA if `body` is not empty.
    pub async fn send_response(
        &self,
        stream_id: u32,
        status: u16,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> std::io::Result<()> {
        let block = self.encode_headers(status, headers).await;
        self.send_headers(stream_id, &block, body.is_empty(), true)
            .await?;
        if !body.is_empty() {
            self.send_data(stream_id, body, true).await?;
        }
        Ok(())
    }

    /// Send a raw frame to the client.
    pub async fn send_frame(
        &self,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let length = payload.len() as u32;
        let mut frame = Vec::with_capacity(9 + payload.len());
        frame.extend_from_slice(&length.to_be_bytes()[1..]);
        frame.push(frame_type);
        frame.push(flags);
        frame.extend_from_slice(&(stream_id & 0x7FFFFFFF).to_be_bytes());
        frame.extend_from_slice(payload);

        let mut stream = self.stream.lock().await;
        stream.write_all(&frame).await?;
        stream.flush().await
    }

    pub async fn send_settings(&self, settings: &[(u16, u32)]) -> std::io::Result<()> {
        let mut payload = Vec::new();
        for (id, value) in settings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.send_frame(SETTINGS, 0, 0, &payload).await
    }

    pub async fn send_settings_ack(&self) -> std::io::Result<()> {
        self.send_frame(SETTINGS, ACK, 0, &[]).await
    }

    pub async fn send_window_update(&self, stream_id: u32, increment: u32) -> std::io::Result<()> {
        let payload = (increment & 0x7FFFFFFF).to_be_bytes();
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &payload).await
    }

    pub async fn send_headers(
        &self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        end_headers: bool,
    ) -> std::io::Result<()> {
        let mut flags = 0u8;
        if end_stream {
            flags |= END_STREAM;
        }
        if end_headers {
            flags |= END_HEADERS;
        }
        self.send_frame(HEADERS, flags, stream_id, block).await
    }

    pub async fn send_data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> std::io::Result<()> {
        let flags = if end_stream { END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, data).await
    }

    pub async fn send_rst_stream(&self, stream_id: u32, error_code: u32) -> std::io::Result<()> {
        self.send_frame(RST_STREAM, 0, stream_id, &error_code.to_be_bytes())
            .await
    }

    pub async fn send_goaway(&self, last_stream_id: u32, error_code: u32) -> std::io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(last_stream_id & 0x7FFFFFFF).to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());
        self.send_frame(GOAWAY, 0, 0, &payload).await
    }

    /// Read frames until one of `frame_type` arrives.
    pub async fn expect_frame(&self, frame_type: u8) -> std::io::Result<RawFrame> {
        loop {
            let frame = self.read_frame().await?;
            if frame.frame_type == frame_type {
                return Ok(frame);
            }
        }
    }

    /// Drop the TCP connection without GOAWAY.
    pub async fn abort(self) {
        let stream = self.stream.into_inner();
        let _ = stream.set_linger(Some(std::time::Duration::ZERO));
        drop(stream);
    }
}
