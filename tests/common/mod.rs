//! Scripted in-memory gateway for session and manager tests.
//!
//! Every `open` creates a fresh connection pair: the session gets a
//! [`MockTransport`], the test receives the matching [`ServerEnd`] and plays
//! the gateway's side by hand.

#![allow(dead_code)]

use arrakis_client::config::{SessionSettings, Token};
use arrakis_client::error::BoxError;
use arrakis_client::shard::{CloseFrame, Transport, TransportOpener, WireMessage};
use async_trait::async_trait;
use flate2::{Compress, Compression, FlushCompress};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const TOKEN: &str = "test-token";
pub const GATEWAY_URL: &str = "wss://gateway.test";
pub const RESUME_URL: &str = "wss://resume.test";

/// What the session wrote to the wire
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(Value),
    Close(u16),
}

pub struct MockTransport {
    to_server: mpsc::UnboundedSender<ClientFrame>,
    from_server: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), BoxError> {
        let value: Value = serde_json::from_str(&text)?;
        self.to_server
            .send(ClientFrame::Text(value))
            .map_err(|_| "server end dropped".into())
    }

    async fn recv(&mut self) -> Result<WireMessage, BoxError> {
        Ok(self.from_server.recv().await.unwrap_or(WireMessage::Close(None)))
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), BoxError> {
        let _ = self.to_server.send(ClientFrame::Close(code));
        Ok(())
    }
}

/// Gateway side of one connection
pub struct ServerEnd {
    pub url: Url,
    to_client: mpsc::UnboundedSender<WireMessage>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    zlib: Option<Compress>,
}

impl ServerEnd {
    /// Compress every following message into one zlib stream.
    pub fn compressed(mut self) -> Self {
        self.zlib = Some(Compress::new(Compression::default(), true));
        self
    }

    pub fn send_json(&mut self, value: Value) {
        let text = value.to_string();
        let message = match &mut self.zlib {
            Some(zlib) => WireMessage::Binary(deflate_sync(zlib, text.as_bytes())),
            None => WireMessage::Text(text),
        };
        let _ = self.to_client.send(message);
    }

    /// One compressed message, for tests that split it across frames.
    pub fn compress_json(&mut self, value: Value) -> Vec<u8> {
        let zlib = self.zlib.as_mut().expect("connection is not compressed");
        deflate_sync(zlib, value.to_string().as_bytes())
    }

    pub fn send_raw(&self, message: WireMessage) {
        let _ = self.to_client.send(message);
    }

    pub fn hello(&mut self, interval_ms: u64) {
        self.send_json(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn dispatch(&mut self, seq: u64, event: &str, data: Value) {
        self.send_json(json!({"op": 0, "s": seq, "t": event, "d": data}));
    }

    pub fn ready(&mut self, seq: u64, session_id: &str) {
        self.dispatch(
            seq,
            "READY",
            json!({
                "v": 10,
                "session_id": session_id,
                "resume_gateway_url": RESUME_URL,
                "user": {"id": "1", "username": "bot"},
                "guilds": []
            }),
        );
    }

    pub fn ack(&mut self) {
        self.send_json(json!({"op": 11}));
    }

    pub fn close(&self, code: u16) {
        self.send_raw(WireMessage::Close(Some(CloseFrame {
            code,
            reason: String::new(),
        })));
    }

    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Frames already written by the client
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Next frame with opcode `op`, skipping heartbeats unless asked for.
    pub async fn expect_op(&mut self, op: u64) -> Value {
        loop {
            match self.next_frame().await {
                Some(ClientFrame::Text(value)) => {
                    let got = value["op"].as_u64();
                    if got == Some(op) {
                        return value;
                    }
                    assert_eq!(got, Some(1), "expected op {op}, got {value}");
                }
                other => panic!("expected op {op}, got {other:?}"),
            }
        }
    }

    /// Close code the client sent, skipping any text frames before it.
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            match self.next_frame().await {
                Some(ClientFrame::Close(code)) => return code,
                Some(ClientFrame::Text(_)) => continue,
                None => panic!("connection dropped without a close frame"),
            }
        }
    }

    /// HELLO, then the client's IDENTIFY
    pub async fn handshake(&mut self, interval_ms: u64) -> Value {
        self.hello(interval_ms);
        self.expect_op(2).await
    }
}

fn deflate_sync(zlib: &mut Compress, input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() + 64);
    let before = zlib.total_in();
    loop {
        let consumed = (zlib.total_in() - before) as usize;
        if output.len() == output.capacity() {
            output.reserve(256);
        }
        zlib.compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
            .unwrap();
        let done = (zlib.total_in() - before) as usize == input.len();
        if done && output.ends_with(&[0x00, 0x00, 0xff, 0xff]) {
            return output;
        }
    }
}

/// Opener that hands every connection's server side to the test
pub struct ScriptedOpener {
    servers: mpsc::UnboundedSender<ServerEnd>,
    refusals: AtomicUsize,
    opened: AtomicUsize,
}

impl ScriptedOpener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let opener = Arc::new(Self {
            servers,
            refusals: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        (opener, rx)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportOpener for ScriptedOpener {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, BoxError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err("connection refused".into());
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            url: url.clone(),
            to_client,
            from_client,
            zlib: None,
        });
        Ok(Box::new(MockTransport {
            to_server,
            from_server,
        }))
    }
}

/// Session settings for scripted tests: fixed first heartbeat at one full interval.
pub fn settings() -> SessionSettings {
    SessionSettings {
        heartbeat_jitter: Some(1.0),
        ..SessionSettings::new(Token::new(TOKEN), GATEWAY_URL)
    }
}

pub fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

pub const LONG_INTERVAL: u64 = 45_000;

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
