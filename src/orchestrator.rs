//! Orchestrator: owns component lifecycle, wiring, housekeeping, and
//! status aggregation.
//!
//! Grounded on `bridge.py`'s `Bridge` (`start`/`_main_loop`/
//! `_check_components`/`stop` ordering) with the teacher's cooperative
//! cancellation idiom for task shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcast_hub::BroadcastHub;
use crate::config::Config;
use crate::datagram_source::DatagramSource;
use crate::kv_parser::KvParser;
use crate::line_source::LineSource;
use crate::nmea_parser::NmeaParser;
use crate::sim_model::{SimModel, SourceName};

#[derive(Debug, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub uptime_s: f64,
    pub error_count: u64,
    pub data_active: bool,
    pub data_last_update_ago_s: Option<f64>,
    pub serial_connected: Option<bool>,
    pub udp_connected: Option<bool>,
    pub websocket_connections: Option<usize>,
    pub data: serde_json::Value,
}

pub struct Orchestrator {
    config: Config,
    model: Arc<SimModel>,
    line_source: Option<LineSource>,
    datagram_source: Option<DatagramSource>,
    hub: Option<BroadcastHub>,
    housekeeping: Option<tokio::task::JoinHandle<()>>,
    start_time: Instant,
    error_count: Arc<std::sync::atomic::AtomicU64>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let model = Arc::new(SimModel::new(
            Duration::from_secs_f64(config.serial.freshness_s),
            Duration::from_secs_f64(config.udp.freshness_s),
        ));

        let line_source = config
            .serial
            .enabled
            .then(|| LineSource::new(config.serial.port.clone(), config.serial.baudrate, Duration::from_secs_f64(config.serial.timeout_s)));
        let datagram_source = config.udp.enabled.then(|| {
            DatagramSource::new(config.udp.host.clone(), config.udp.port, config.udp.buffer_bytes)
        });
        let hub = config
            .websocket
            .enabled
            .then(|| BroadcastHub::new(model.clone(), &config.websocket));

        Self {
            config,
            model,
            line_source,
            datagram_source,
            hub,
            housekeeping: None,
            start_time: Instant::now(),
            error_count: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            stop_tx: None,
        }
    }

    pub async fn start(&mut self) {
        if let Some(line_source) = self.line_source.as_mut() {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            line_source.start(tx);

            let model = self.model.clone();
            let error_count = self.error_count.clone();
            tokio::spawn(async move {
                let mut parser = NmeaParser::new();
                while let Some(line) = rx.recv().await {
                    match parser.parse_sentence(&line) {
                        Ok(update) => model.ingest_nmea(&update),
                        Err(e) => {
                            error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            warn!("NMEA parse error: {e}");
                        }
                    }
                }
            });
        } else {
            info!("serial source disabled");
        }

        if let Some(datagram_source) = self.datagram_source.as_mut() {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            datagram_source.start(tx);

            let model = self.model.clone();
            let error_count = self.error_count.clone();
            tokio::spawn(async move {
                let mut parser = KvParser::new();
                while let Some(datagram) = rx.recv().await {
                    match parser.parse_datagram(&datagram) {
                        Ok(update) => model.ingest_kv(&update),
                        Err(e) => {
                            error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            warn!("KV parse error: {e}");
                        }
                    }
                }
            });
        } else {
            info!("UDP source disabled");
        }

        if let Some(hub) = self.hub.as_mut() {
            hub.start(
                &self.config.websocket.host,
                self.config.websocket.port,
                Duration::from_secs_f64(self.config.websocket.broadcast_interval_s),
            )
            .await;
        } else {
            info!("WebSocket hub disabled");
        }

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let model = self.model.clone();
        self.housekeeping = Some(tokio::spawn(async move {
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        ticks += 1;
                        if !model.is_active() {
                            let nmea = model.source_status(SourceName::Nmea);
                            let kv = model.source_status(SourceName::Kv);
                            if let Some(ago) = nmea.last_update_ago_s().or(kv.last_update_ago_s()) {
                                if ago > 10.0 {
                                    warn!(ago, "no source update in over 10 seconds");
                                }
                            }
                        }
                        if ticks % 10 == 0 {
                            info!(
                                active = model.is_active(),
                                "status: bridge running"
                            );
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.housekeeping.take() {
            let _ = handle.await;
        }
        if let Some(hub) = self.hub.as_mut() {
            hub.stop().await;
        }
        if let Some(datagram_source) = self.datagram_source.as_mut() {
            datagram_source.close().await;
        }
        if let Some(line_source) = self.line_source.as_mut() {
            line_source.close().await;
        }
        self.model.reset();
    }

    pub fn status(&self) -> BridgeStatus {
        let nmea = self.model.source_status(SourceName::Nmea);
        BridgeStatus {
            running: self.housekeeping.is_some(),
            uptime_s: self.start_time.elapsed().as_secs_f64(),
            error_count: self.error_count.load(std::sync::atomic::Ordering::Relaxed),
            data_active: self.model.is_active(),
            data_last_update_ago_s: nmea.last_update_ago_s(),
            serial_connected: self.line_source.as_ref().map(|s| s.status().connected),
            udp_connected: self.datagram_source.as_ref().map(|s| s.status().connected),
            websocket_connections: self.hub.as_ref().map(|h| h.subscriber_count()),
            data: serde_json::to_value(self.model.get_data()).unwrap_or_default(),
        }
    }
}
