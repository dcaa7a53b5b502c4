//! UDP datagram source: receives key=value datagrams with a receive
//! timeout, reconnecting (rebinding) with exponential backoff on bind
//! failure. Same backoff shape as `line_source.rs`, grounded on the
//! teacher's `socket_client.rs`; semantics from `udp_receiver.py`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::SourceError;

const MAX_DATAGRAM_CHARS: usize = 4096;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(64);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DatagramSourceStatus {
    pub connected: bool,
    pub running: bool,
    pub bytes_in: u64,
    pub datagrams_in: u64,
    pub errors: u64,
    pub uptime_s: f64,
    pub last_rx_ago_s: Option<f64>,
}

struct Counters {
    bytes_in: AtomicU64,
    datagrams_in: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    running: AtomicBool,
}

pub struct DatagramSource {
    host: String,
    port: u16,
    buffer_bytes: usize,
    receive_timeout: Duration,
    counters: Arc<Counters>,
    start_time: Instant,
    last_rx: Arc<std::sync::Mutex<Option<Instant>>>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl DatagramSource {
    pub fn new(host: impl Into<String>, port: u16, buffer_bytes: usize) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_bytes,
            receive_timeout: Duration::from_millis(500),
            counters: Arc::new(Counters {
                bytes_in: AtomicU64::new(0),
                datagrams_in: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            start_time: Instant::now(),
            last_rx: Arc::new(std::sync::Mutex::new(None)),
            stop_tx: None,
        }
    }

    pub fn start(&mut self, consumer: mpsc::Sender<String>) {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let addr = format!("{}:{}", self.host, self.port);
        let buffer_bytes = self.buffer_bytes;
        let receive_timeout = self.receive_timeout;
        let counters = self.counters.clone();
        let last_rx = self.last_rx.clone();

        counters.running.store(true, Ordering::SeqCst);
        metrics::gauge!("datagram_source.connected").set(0.0);

        tokio::spawn(async move {
            let mut attempt = 0u32;
            'outer: loop {
                let socket = match UdpSocket::bind(&addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        attempt += 1;
                        warn!(addr, attempt, "failed to bind UDP socket: {e}");
                        counters.errors.fetch_add(1, Ordering::SeqCst);
                        if attempt >= MAX_RECONNECT_ATTEMPTS {
                            let err = SourceError::ReconnectExhausted {
                                endpoint: addr.clone(),
                                attempts: attempt,
                            };
                            error!("{err}");
                            break 'outer;
                        }
                        let delay =
                            std::cmp::min(BACKOFF_BASE * 2u32.pow(attempt - 1), BACKOFF_CAP);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = stop_rx.recv() => break 'outer,
                        }
                    }
                };

                info!(addr, "UDP socket bound");
                counters.connected.store(true, Ordering::SeqCst);
                metrics::gauge!("datagram_source.connected").set(1.0);
                attempt = 0;

                let mut buf = vec![0u8; buffer_bytes];
                loop {
                    tokio::select! {
                        recv = tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)) => {
                            match recv {
                                Ok(Ok((n, _peer))) => {
                                    counters.bytes_in.fetch_add(n as u64, Ordering::SeqCst);
                                    let text = String::from_utf8_lossy(&buf[..n]);
                                    if text.chars().count() > MAX_DATAGRAM_CHARS {
                                        counters.errors.fetch_add(1, Ordering::SeqCst);
                                        warn!(addr, len = text.len(), "datagram exceeds cap, dropped");
                                        continue;
                                    }
                                    counters.datagrams_in.fetch_add(1, Ordering::SeqCst);
                                    *last_rx.lock().unwrap() = Some(Instant::now());
                                    metrics::counter!("datagram_source.datagrams_total").increment(1);
                                    if consumer.send(text.into_owned()).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                Ok(Err(source)) => {
                                    let err = SourceError::Io { endpoint: addr.clone(), source };
                                    error!("{err}");
                                    counters.errors.fetch_add(1, Ordering::SeqCst);
                                    break;
                                }
                                Err(_) => {
                                    // receive timeout, observe stop request and loop
                                }
                            }
                        }
                        _ = stop_rx.recv() => break 'outer,
                    }
                }

                counters.connected.store(false, Ordering::SeqCst);
                metrics::gauge!("datagram_source.connected").set(0.0);
            }

            counters.running.store(false, Ordering::SeqCst);
        });
    }

    pub async fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    pub fn status(&self) -> DatagramSourceStatus {
        DatagramSourceStatus {
            connected: self.counters.connected.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            bytes_in: self.counters.bytes_in.load(Ordering::SeqCst),
            datagrams_in: self.counters.datagrams_in.load(Ordering::SeqCst),
            errors: self.counters.errors.load(Ordering::SeqCst),
            uptime_s: self.start_time.elapsed().as_secs_f64(),
            last_rx_ago_s: self.last_rx.lock().unwrap().map(|t| t.elapsed().as_secs_f64()),
        }
    }
}
