//! WebSocket broadcast hub.
//!
//! Accept loop, per-peer read/write tasks, and a periodic tick mirror the
//! teacher's `actions/fixes.rs` WebSocket handler structure. The encode
//! schema and unit conversions are grounded on
//! `io/websocket_server.py`'s `_format_for_shirley`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        OriginalUri, State,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::WebSocketConfig;
use crate::sim_model::SimModel;

const METERS_TO_FEET: f64 = 3.28084;
const MPS_TO_FPM: f64 = 196.85;

#[derive(Debug, Default)]
pub struct HubStats {
    pub total_connections: AtomicU64,
    pub total_broadcasts: AtomicU64,
    pub total_bytes_sent: AtomicU64,
    pub errors: AtomicU64,
}

struct Peer {
    sender: tokio::sync::mpsc::UnboundedSender<Message>,
}

struct HubState {
    model: Arc<SimModel>,
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer_id: AtomicU64,
    stats: HubStats,
    path_suffix: String,
    compatibility_mode: bool,
}

/// Handle to the running hub: drives the accept server and the broadcast
/// tick as independent tasks, matching §4.6's lifecycle.
pub struct BroadcastHub {
    state: Arc<HubState>,
    tick_handle: Option<tokio::task::JoinHandle<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
    start_time: Instant,
}

impl BroadcastHub {
    pub fn new(model: Arc<SimModel>, config: &WebSocketConfig) -> Self {
        Self {
            state: Arc::new(HubState {
                model,
                peers: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(0),
                stats: HubStats::default(),
                path_suffix: config.path.clone(),
                compatibility_mode: config.compatibility_mode,
            }),
            tick_handle: None,
            server_handle: None,
            start_time: Instant::now(),
        }
    }

    pub async fn start(&mut self, host: &str, port: u16, broadcast_interval: Duration) {
        let state = self.state.clone();
        let app = Router::new()
            .route("/{*path}", any(ws_handler))
            .route("/", any(ws_handler))
            .with_state(state.clone());

        let addr = format!("{host}:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr, "failed to bind WebSocket listener: {e}");
                return;
            }
        };
        info!(addr, path = %state.path_suffix, "WebSocket server listening");

        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("WebSocket server exited: {e}");
            }
        }));

        let tick_state = state.clone();
        self.tick_handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(broadcast_interval);
            loop {
                interval.tick().await;
                tick_once(&tick_state).await;
            }
        }));
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.tick_handle.take() {
            handle.abort();
        }
        let peers = self.state.peers.lock().await;
        for peer in peers.values() {
            let _ = peer.sender.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1001,
                reason: "Server shutting down".into(),
            })));
        }
        drop(peers);
        self.state.peers.lock().await.clear();
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.peers.try_lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.state.stats.total_connections.load(Ordering::Relaxed),
            self.state.stats.total_broadcasts.load(Ordering::Relaxed),
            self.state.stats.total_bytes_sent.load(Ordering::Relaxed),
        )
    }

    pub fn uptime_s(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

async fn ws_handler(
    uri: OriginalUri,
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> Response {
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, path))
}

async fn handle_socket(socket: WebSocket, state: Arc<HubState>, path: String) {
    if !path.ends_with(state.path_suffix.as_str()) {
        warn!(path, expected = %state.path_suffix, "closing connection on invalid path");
        let (mut sink, _) = socket.split();
        let _ = sink
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: format!("Invalid path. Expected {}", state.path_suffix).into(),
            })))
            .await;
        return;
    }

    let peer_id = state.next_peer_id.fetch_add(1, Ordering::SeqCst);
    state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!("broadcast_hub.connections").increment(1.0);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    state.peers.lock().await.insert(peer_id, Peer { sender: tx });

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let preview: String = text.chars().take(100).collect();
                info!(peer_id, "received message: {preview}");
            }
            Ok(Message::Close(_)) => {
                info!(peer_id, "client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(peer_id, "websocket error: {e}");
                break;
            }
        }
    }

    state.peers.lock().await.remove(&peer_id);
    write_task.abort();
    metrics::gauge!("broadcast_hub.connections").decrement(1.0);
    info!(peer_id, "client disconnected");
}

async fn tick_once(state: &Arc<HubState>) {
    let peers = state.peers.lock().await;
    if peers.is_empty() {
        return;
    }

    let snapshot = state.model.get_data();
    if snapshot.is_empty() {
        return;
    }

    let encoded = encode_snapshot(&snapshot, state.compatibility_mode);
    let message = match serde_json::to_string(&encoded) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode snapshot: {e}");
            state.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let bytes = message.len() as u64;

    for peer in peers.values() {
        let _ = peer.sender.send(Message::Text(message.clone().into()));
    }

    state.stats.total_broadcasts.fetch_add(1, Ordering::Relaxed);
    state
        .stats
        .total_bytes_sent
        .fetch_add(bytes * peers.len() as u64, Ordering::Relaxed);
}

fn get_f64(snapshot: &HashMap<String, Value>, key: &str) -> f64 {
    snapshot.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Produces the FlyShirley-compatible JSON schema; radio frequency is
/// intentionally omitted (see DESIGN.md Open Question 3).
fn encode_snapshot(snapshot: &HashMap<String, Value>, compatibility_mode: bool) -> Value {
    let mut position = json!({
        "latitudeDeg": get_f64(snapshot, "latitude"),
        "longitudeDeg": get_f64(snapshot, "longitude"),
        "mslAltitudeFt": get_f64(snapshot, "altitude_msl") * METERS_TO_FEET,
    });
    if let Some(agl) = snapshot.get("height_agl").and_then(Value::as_f64) {
        position["aglAltitudeFt"] = json!(agl * METERS_TO_FEET);
    }

    let heading = snapshot
        .get("heading")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| get_f64(snapshot, "yaw_deg"));
    let mut attitude = json!({
        "rollAngleDegRight": get_f64(snapshot, "bank_deg"),
        "pitchAngleDegUp": get_f64(snapshot, "pitch_deg"),
        "trueHeadingDeg": heading,
    });

    if !compatibility_mode {
        position["gpsGroundSpeedKts"] = json!(get_f64(snapshot, "ground_speed"));
        position["trueTrackDeg"] = json!(get_f64(snapshot, "track_true"));
        if let Some(yaw_string) = snapshot.get("yawstring_angle_deg").and_then(Value::as_f64) {
            attitude["yawStringDeg"] = json!(yaw_string);
        }
        if let Some(turn_rate) = snapshot.get("turn_rate").and_then(Value::as_f64) {
            attitude["turnRateDegPerSec"] = json!(turn_rate);
        }
        if let Some(g_force) = snapshot.get("g_force").and_then(Value::as_f64) {
            attitude["gForce"] = json!(g_force);
        }

        let mut soaring = json!({
            "indicatedAirspeedKts": get_f64(snapshot, "ias"),
            "totalEnergyVarioFpm": get_f64(snapshot, "vario") * MPS_TO_FPM,
        });
        if let Some(netto) = snapshot.get("netto_vario").and_then(Value::as_f64) {
            soaring["nettoVarioFpm"] = json!(netto * MPS_TO_FPM);
        }
        if let Some(avg) = snapshot.get("avg_vario").and_then(Value::as_f64) {
            soaring["averageVarioFpm"] = json!(avg * MPS_TO_FPM);
        }

        let mut result = json!({ "position": position, "attitude": attitude, "soaring": soaring });
        if let Some(turbulence) = snapshot.get("turbulence").and_then(Value::as_f64) {
            result["environment"] = json!({ "turbulenceIntensity": turbulence });
        }
        return result;
    }

    json!({ "position": position, "attitude": attitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(pairs: &[(&str, f64)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn encodes_compatible_schema_with_unit_conversion() {
        let snapshot = snapshot_with(&[
            ("latitude", 45.8895),
            ("longitude", 13.8906),
            ("altitude_msl", 117.4),
            ("bank_deg", 3.0),
            ("pitch_deg", 1.0),
            ("heading", 268.0),
        ]);
        let encoded = encode_snapshot(&snapshot, true);
        let msl_ft = encoded["position"]["mslAltitudeFt"].as_f64().unwrap();
        assert!((msl_ft - 385.2).abs() < 0.1);
        assert!(encoded.get("soaring").is_none());
    }

    #[test]
    fn extended_mode_adds_soaring_block() {
        let snapshot = snapshot_with(&[("ias", 59.3), ("vario", 1.2)]);
        let encoded = encode_snapshot(&snapshot, false);
        let vario_fpm = encoded["soaring"]["totalEnergyVarioFpm"].as_f64().unwrap();
        assert!((vario_fpm - (1.2 * MPS_TO_FPM)).abs() < 0.01);
    }
}
