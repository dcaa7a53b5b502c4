//! Serial line source: reads CR/LF-delimited ASCII lines with a read
//! timeout, reconnecting with exponential backoff on I/O error.
//!
//! Grounded on the teacher's `socket_client.rs` (backoff shape, metrics call
//! sites) and `aprs_client.rs` (line-oriented `BufReader::read_line` loop).
//! Read-timeout/backoff constants follow `serial_reader.py`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

use crate::error::SourceError;

const MAX_LINE_LEN: usize = 256;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(64);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct LineSourceStatus {
    pub connected: bool,
    pub running: bool,
    pub bytes_in: u64,
    pub lines_in: u64,
    pub errors: u64,
    pub uptime_s: f64,
    pub last_rx_ago_s: Option<f64>,
}

struct Counters {
    bytes_in: AtomicU64,
    lines_in: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    running: AtomicBool,
}

pub struct LineSource {
    port: String,
    baud_rate: u32,
    timeout: Duration,
    counters: Arc<Counters>,
    start_time: Instant,
    last_rx: Arc<std::sync::Mutex<Option<Instant>>>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl LineSource {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
            counters: Arc::new(Counters {
                bytes_in: AtomicU64::new(0),
                lines_in: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            start_time: Instant::now(),
            last_rx: Arc::new(std::sync::Mutex::new(None)),
            stop_tx: None,
        }
    }

    /// Starts the background read task; received lines are sent on
    /// `consumer`. Mirrors `aprs_client.rs`'s `start()`/retry-loop shape.
    pub fn start(&mut self, consumer: mpsc::Sender<String>) {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let port = self.port.clone();
        let baud_rate = self.baud_rate;
        let timeout = self.timeout;
        let counters = self.counters.clone();
        let last_rx = self.last_rx.clone();

        counters.running.store(true, Ordering::SeqCst);
        metrics::gauge!("line_source.connected").set(0.0);

        tokio::spawn(async move {
            let mut attempt = 0u32;
            'outer: loop {
                let stream = tokio_serial::new(&port, baud_rate)
                    .timeout(timeout)
                    .open_native_async();

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        attempt += 1;
                        warn!(port, attempt, "failed to open serial port: {e}");
                        counters.errors.fetch_add(1, Ordering::SeqCst);
                        if attempt >= MAX_RECONNECT_ATTEMPTS {
                            let err = SourceError::ReconnectExhausted {
                                endpoint: port.clone(),
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

                info!(port, "serial port opened");
                counters.connected.store(true, Ordering::SeqCst);
                metrics::gauge!("line_source.connected").set(1.0);
                attempt = 0;

                let mut reader = BufReader::new(stream);
                loop {
                    let mut line = String::new();
                    tokio::select! {
                        read_result = reader.read_line(&mut line) => {
                            match read_result {
                                Ok(0) => {
                                    warn!(port, "serial port closed by peer");
                                    break;
                                }
                                Ok(n) => {
                                    counters.bytes_in.fetch_add(n as u64, Ordering::SeqCst);
                                    let trimmed = line.trim_end_matches(['\r', '\n']);
                                    if trimmed.len() > MAX_LINE_LEN {
                                        counters.errors.fetch_add(1, Ordering::SeqCst);
                                        warn!(port, len = trimmed.len(), "line exceeds cap, dropped");
                                        continue;
                                    }
                                    counters.lines_in.fetch_add(1, Ordering::SeqCst);
                                    *last_rx.lock().unwrap() = Some(Instant::now());
                                    metrics::counter!("line_source.lines_total").increment(1);
                                    if consumer.send(trimmed.to_string()).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                Err(source) => {
                                    let err = SourceError::Io { endpoint: port.clone(), source };
                                    error!("{err}");
                                    counters.errors.fetch_add(1, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                        _ = stop_rx.recv() => break 'outer,
                    }
                }

                counters.connected.store(false, Ordering::SeqCst);
                metrics::gauge!("line_source.connected").set(0.0);
            }

            counters.running.store(false, Ordering::SeqCst);
        });
    }

    pub async fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    pub fn status(&self) -> LineSourceStatus {
        LineSourceStatus {
            connected: self.counters.connected.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            bytes_in: self.counters.bytes_in.load(Ordering::SeqCst),
            lines_in: self.counters.lines_in.load(Ordering::SeqCst),
            errors: self.counters.errors.load(Ordering::SeqCst),
            uptime_s: self.start_time.elapsed().as_secs_f64(),
            last_rx_ago_s: self.last_rx.lock().unwrap().map(|t| t.elapsed().as_secs_f64()),
        }
    }
}
