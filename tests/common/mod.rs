//! Shared test harness: an in-process RESP stub standing in for the
//! denylist store, a mock upstream origin that records what it receives,
//! and throwaway RSA material for minting bearer tokens.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::Router;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Minimal RESP server: answers PING, EXISTS against a fixed blocked set,
/// and OK to everything else. `kill` drops all connections and the
/// listener, simulating a store outage.
pub struct DenylistStub {
    pub addr: SocketAddr,
    kill_tx: watch::Sender<bool>,
}

impl DenylistStub {
    pub async fn spawn(blocked: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let blocked: Arc<HashSet<String>> = Arc::new(
            blocked
                .iter()
                .map(|ip| format!("blocklist:ip:{ip}"))
                .collect(),
        );
        let (kill_tx, kill_rx) = watch::channel(false);

        let accept_kill = kill_rx.clone();
        tokio::spawn(async move {
            let mut accept_kill = accept_kill;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        tokio::spawn(serve_resp(socket, blocked.clone(), kill_rx.clone()));
                    }
                    _ = accept_kill.changed() => break,
                }
            }
        });

        Self { addr, kill_tx }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Simulate the store going down.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }
}

async fn serve_resp(
    mut socket: tokio::net::TcpStream,
    blocked: Arc<HashSet<String>>,
    mut kill_rx: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::select! {
            read = socket.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
            _ = kill_rx.changed() => return,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some((command, consumed)) = parse_resp_command(&buf) {
            buf.drain(..consumed);
            let reply = match command.first().map(|c| c.to_ascii_uppercase()) {
                Some(name) if name == "PING" => "+PONG\r\n".to_owned(),
                Some(name) if name == "EXISTS" => {
                    let hit = command.get(1).map(|k| blocked.contains(k)).unwrap_or(false);
                    format!(":{}\r\n", i32::from(hit))
                }
                _ => "+OK\r\n".to_owned(),
            };
            if socket.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Parse one complete RESP array of bulk strings, returning the parts and
/// the number of bytes consumed. `None` means the buffer is incomplete.
fn parse_resp_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    if buf.first()? != &b'*' {
        return None;
    }
    let (count, mut pos) = read_int_line(buf, 1)?;
    let mut parts = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if buf.get(pos)? != &b'$' {
            return None;
        }
        let (len, data_start) = read_int_line(buf, pos + 1)?;
        let data_end = data_start + len.max(0) as usize;
        if buf.len() < data_end + 2 {
            return None;
        }
        parts.push(String::from_utf8_lossy(&buf[data_start..data_end]).into_owned());
        pos = data_end + 2;
    }
    Some((parts, pos))
}

fn read_int_line(buf: &[u8], start: usize) -> Option<(i64, usize)> {
    let rel = buf.get(start..)?.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf[start..start + rel]).ok()?;
    let value = line.parse().ok()?;
    Some((value, start + rel + 2))
}

/// Mock origin that records the headers of the last request it served.
pub struct Upstream {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Option<HeaderMap>>>,
}

impl Upstream {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));

        let recorder = seen.clone();
        let app = Router::new().fallback(move |request: Request<Body>| {
            let recorder = recorder.clone();
            async move {
                *recorder.lock().unwrap() = Some(request.headers().clone());
                "hello from origin"
            }
        });

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, seen }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.seen.lock().unwrap().clone()
    }
}

/// Throwaway RSA keypair shared across the test binary.
pub struct TestKeys {
    pub private_pem: String,
    pub public_pem: String,
}

pub fn test_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("RSA keygen");
        let public = RsaPublicKey::from(&private);
        TestKeys {
            private_pem: private
                .to_pkcs1_pem(LineEnding::LF)
                .expect("private key PEM")
                .to_string(),
            public_pem: public
                .to_public_key_pem(LineEnding::LF)
                .expect("public key PEM"),
        }
    })
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: u64,
}

fn epoch_offset(offset_secs: i64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    (now + offset_secs).max(0) as u64
}

/// Mint an RS256 token for `sub`, expiring `ttl_secs` from now (negative
/// for an already-expired token).
pub fn make_token(sub: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        sub: sub.to_owned(),
        exp: epoch_offset(ttl_secs),
    };
    let key = EncodingKey::from_rsa_pem(test_keys().private_pem.as_bytes()).unwrap();
    encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
}

/// The classic algorithm-confusion probe: HS256 keyed with the public PEM.
pub fn make_hs256_token(sub: &str) -> String {
    let claims = Claims {
        sub: sub.to_owned(),
        exp: epoch_offset(3600),
    };
    let key = EncodingKey::from_secret(test_keys().public_pem.as_bytes());
    encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap()
}
