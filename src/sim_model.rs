//! Fused flight-state model.
//!
//! Single-lock shared state, following the concurrency model: every access
//! goes through one `std::sync::Mutex` because no critical section here
//! spans an `.await`. Grounded on `sim_data.py`'s `SimData`: freshness
//! tracking per source, per-category history with age+count caps, and the
//! field-granular conflict resolution in `_resolve_data_conflicts`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::kv_parser::{AttitudeRecord, ConfigRecord, KvUpdate, MotionRecord, RAD_TO_DEG, MPS_TO_KNOTS};
use crate::nmea_parser::{GpsFix, NmeaUpdate, SoaringRecord};

const HISTORY_MAX_ENTRIES: usize = 20;
const HISTORY_MAX_AGE: Duration = Duration::from_secs(60);
const HISTORY_CLEANUP_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceName {
    Nmea,
    Kv,
}

impl SourceName {
    fn key(self) -> &'static str {
        match self {
            SourceName::Nmea => "nmea",
            SourceName::Kv => "kv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub connected: bool,
    pub last_update: Option<Instant>,
    pub update_count: u64,
    pub error_count: u64,
    pub freshness_threshold: Duration,
    pub fields_seen: std::collections::BTreeSet<String>,
}

impl SourceStatus {
    fn new(freshness_threshold: Duration) -> Self {
        Self {
            connected: false,
            last_update: None,
            update_count: 0,
            error_count: 0,
            freshness_threshold,
            fields_seen: Default::default(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        match self.last_update {
            Some(t) => t.elapsed() < self.freshness_threshold,
            None => false,
        }
    }

    pub fn last_update_ago_s(&self) -> Option<f64> {
        self.last_update.map(|t| t.elapsed().as_secs_f64())
    }

    fn mark_update(&mut self, fields: impl IntoIterator<Item = &'static str>) {
        self.connected = true;
        self.last_update = Some(Instant::now());
        self.update_count += 1;
        self.fields_seen.extend(fields.into_iter().map(String::from));
    }
}

/// One timestamped entry in a history ring, values keyed by field name.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: Instant,
    pub fields: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct HistoryBuffer {
    entries: Vec<HistoryEntry>,
}

impl HistoryBuffer {
    fn push(&mut self, fields: HashMap<String, f64>) {
        self.entries.push(HistoryEntry {
            timestamp: Instant::now(),
            fields,
        });
        if self.entries.len() > HISTORY_MAX_ENTRIES {
            self.entries.remove(0);
        }
    }

    fn prune(&mut self) {
        self.entries
            .retain(|entry| entry.timestamp.elapsed() < HISTORY_MAX_AGE);
    }

    /// Linear interpolation at `at`; nearer-sample for non-numeric gaps is
    /// moot here since every stored field is numeric.
    fn interpolate(&self, at: Instant) -> HashMap<String, f64> {
        match self.entries.len() {
            0 => HashMap::new(),
            1 => self.entries[0].fields.clone(),
            _ => {
                let first = &self.entries[0];
                let last = &self.entries[self.entries.len() - 1];
                if at <= first.timestamp {
                    return first.fields.clone();
                }
                if at >= last.timestamp {
                    return last.fields.clone();
                }
                for window in self.entries.windows(2) {
                    let (a, b) = (&window[0], &window[1]);
                    if a.timestamp <= at && at <= b.timestamp {
                        let span = b.timestamp.duration_since(a.timestamp).as_secs_f64();
                        let factor = if span == 0.0 {
                            0.0
                        } else {
                            at.duration_since(a.timestamp).as_secs_f64() / span
                        };
                        let mut out = a.fields.clone();
                        for (key, a_val) in &a.fields {
                            if let Some(b_val) = b.fields.get(key) {
                                out.insert(key.clone(), a_val + (b_val - a_val) * factor);
                            }
                        }
                        return out;
                    }
                }
                last.fields.clone()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryCategory {
    Position,
    Attitude,
    Motion,
}

#[derive(Default)]
struct ModelState {
    snapshot: HashMap<String, Value>,
    sources: HashMap<&'static str, SourceStatus>,
    position: HistoryBuffer,
    attitude: HistoryBuffer,
    motion: HistoryBuffer,
    update_counter: u64,
}

/// Central fused flight state, shared across the two ingest paths and the
/// broadcast tick via `Arc<SimModel>`.
pub struct SimModel {
    state: Mutex<ModelState>,
}

impl SimModel {
    pub fn new(nmea_freshness: Duration, kv_freshness: Duration) -> Self {
        let mut sources = HashMap::new();
        sources.insert("nmea", SourceStatus::new(nmea_freshness));
        sources.insert("kv", SourceStatus::new(kv_freshness));
        Self {
            state: Mutex::new(ModelState {
                sources,
                ..Default::default()
            }),
        }
    }

    pub fn ingest_nmea(&self, update: &NmeaUpdate) {
        let mut state = self.state.lock().unwrap();
        let category = match update {
            NmeaUpdate::Gga(fix) => {
                Self::merge_gga(&mut state, fix);
                "gga"
            }
            NmeaUpdate::Rmc(fix) => {
                Self::merge_rmc(&mut state, fix);
                "rmc"
            }
            NmeaUpdate::Lxwp0(record) => {
                Self::merge_soaring(&mut state, record);
                "lxwp0"
            }
        };
        Self::resolve_conflicts(&mut state);
        state.sources.get_mut("nmea").unwrap().mark_update([category]);
        Self::maybe_prune(&mut state);
    }

    fn merge_gga(state: &mut ModelState, fix: &GpsFix) {
        state
            .snapshot
            .insert("latitude".into(), json_f64(fix.latitude_deg));
        state
            .snapshot
            .insert("longitude".into(), json_f64(fix.longitude_deg));
        state
            .snapshot
            .insert("altitude_msl".into(), json_f64(fix.altitude_m));
        state
            .snapshot
            .insert("fix_quality".into(), json_f64(fix.fix_quality as f64));
        state
            .snapshot
            .insert("satellites".into(), json_f64(fix.satellite_count as f64));
        state
            .snapshot
            .insert("gps_valid".into(), Value::Bool(fix.valid));

        let mut position = HashMap::new();
        position.insert("latitude".into(), fix.latitude_deg);
        position.insert("longitude".into(), fix.longitude_deg);
        position.insert("altitude_msl".into(), fix.altitude_m);
        state.position.push(position);
    }

    fn merge_rmc(state: &mut ModelState, fix: &GpsFix) {
        state
            .snapshot
            .insert("latitude".into(), json_f64(fix.latitude_deg));
        state
            .snapshot
            .insert("longitude".into(), json_f64(fix.longitude_deg));
        state
            .snapshot
            .insert("ground_speed".into(), json_f64(fix.ground_speed_kt));
        state
            .snapshot
            .insert("track_true".into(), json_f64(fix.track_deg));
        // RMC can only force gps_valid false (status void); it never
        // asserts validity on its own, only GGA's quality field does.
        if !fix.valid {
            state.snapshot.insert("gps_valid".into(), Value::Bool(false));
        }

        let mut position = HashMap::new();
        position.insert("latitude".into(), fix.latitude_deg);
        position.insert("longitude".into(), fix.longitude_deg);
        position.insert("ground_speed".into(), fix.ground_speed_kt);
        position.insert("track_true".into(), fix.track_deg);
        state.position.push(position);
    }

    fn merge_soaring(state: &mut ModelState, record: &SoaringRecord) {
        state.snapshot.insert("ias".into(), json_f64(record.ias_kt));
        state
            .snapshot
            .insert("baro_altitude".into(), json_f64(record.baro_alt_m));
        state.snapshot.insert("vario".into(), json_f64(record.vario_mps));
        if let Some(avg) = record.avg_vario_mps {
            state.snapshot.insert("avg_vario".into(), json_f64(avg));
        }
        state
            .snapshot
            .insert("heading".into(), json_f64(record.heading_deg));
        if let Some(track) = record.track_bearing_deg {
            state
                .snapshot
                .insert("track_bearing".into(), json_f64(track));
        }
        if let Some(turn_rate) = record.turn_rate_dps {
            state.snapshot.insert("turn_rate".into(), json_f64(turn_rate));
        }

        let mut attitude = HashMap::new();
        attitude.insert("heading".into(), record.heading_deg);
        state.attitude.push(attitude);
    }

    pub fn ingest_kv(&self, update: &KvUpdate) {
        let mut state = self.state.lock().unwrap();
        let mut fields_seen = Vec::new();

        if let Some(attitude) = &update.attitude {
            Self::merge_attitude(&mut state, attitude);
            fields_seen.push("attitude");
        }
        if let Some(motion) = &update.motion {
            Self::merge_motion(&mut state, motion);
            fields_seen.push("motion");
        }
        if let Some(config) = &update.config {
            Self::merge_config(&mut state, config);
            fields_seen.push("config");
        }

        Self::resolve_conflicts(&mut state);
        state.sources.get_mut("kv").unwrap().mark_update(fields_seen);
        Self::maybe_prune(&mut state);
    }

    fn merge_attitude(state: &mut ModelState, attitude: &AttitudeRecord) {
        let yaw_deg = attitude.yaw_rad * RAD_TO_DEG;
        let pitch_deg = attitude.pitch_rad * RAD_TO_DEG;
        let bank_deg = attitude.bank_rad * RAD_TO_DEG;
        state.snapshot.insert("yaw_deg".into(), json_f64(yaw_deg));
        state.snapshot.insert("pitch_deg".into(), json_f64(pitch_deg));
        state.snapshot.insert("bank_deg".into(), json_f64(bank_deg));
        state
            .snapshot
            .insert("roll_rate_deg".into(), json_f64(attitude.roll_rate_rps * RAD_TO_DEG));
        state
            .snapshot
            .insert("pitch_rate_deg".into(), json_f64(attitude.pitch_rate_rps * RAD_TO_DEG));
        state
            .snapshot
            .insert("yaw_rate_deg".into(), json_f64(attitude.yaw_rate_rps * RAD_TO_DEG));
        state.snapshot.insert(
            "yawstring_angle_deg".into(),
            json_f64(attitude.yaw_string_rad * RAD_TO_DEG),
        );

        let mut entry = HashMap::new();
        entry.insert("yaw_deg".into(), yaw_deg);
        entry.insert("pitch_deg".into(), pitch_deg);
        entry.insert("bank_deg".into(), bank_deg);
        state.attitude.push(entry);
    }

    fn merge_motion(state: &mut ModelState, motion: &MotionRecord) {
        let ias_kt = motion.airspeed_mps * MPS_TO_KNOTS;
        if !state.snapshot.contains_key("ias") {
            state.snapshot.insert("ias".into(), json_f64(ias_kt));
        }
        if !state.snapshot.contains_key("altitude_msl") {
            state
                .snapshot
                .insert("altitude_msl".into(), json_f64(motion.altitude_m));
        }
        if !state.snapshot.contains_key("vario") {
            state.snapshot.insert("vario".into(), json_f64(motion.vario_mps));
        }
        state
            .snapshot
            .insert("evario".into(), json_f64(motion.evario_mps));
        state
            .snapshot
            .insert("netto_vario".into(), json_f64(motion.netto_vario_mps));
        state.snapshot.insert("g_force".into(), json_f64(motion.g_force));
        state
            .snapshot
            .insert("height_agl".into(), json_f64(motion.height_agl_m));
        state
            .snapshot
            .insert("wheel_height".into(), json_f64(motion.wheel_height_m));
        state
            .snapshot
            .insert("turbulence".into(), json_f64(motion.turbulence));

        let mut entry = HashMap::new();
        entry.insert("airspeed_mps".into(), motion.airspeed_mps);
        entry.insert("altitude_m".into(), motion.altitude_m);
        entry.insert("vario_mps".into(), motion.vario_mps);
        entry.insert("g_force".into(), motion.g_force);
        state.motion.push(entry);
    }

    fn merge_config(state: &mut ModelState, config: &ConfigRecord) {
        state
            .snapshot
            .insert("flaps".into(), json_f64(config.flaps_index as f64));
        state
            .snapshot
            .insert("mc_setting".into(), json_f64(config.mc_setting));
        state
            .snapshot
            .insert("water_ballast".into(), json_f64(config.water_ballast as f64));
        state
            .snapshot
            .insert("radio_hz".into(), json_f64(config.radio_hz));
    }

    /// Fallback rules when a field has no authoritative source yet.
    /// Ground-speed-as-IAS ignores wind; kept only as a last resort.
    fn resolve_conflicts(state: &mut ModelState) {
        if !state.snapshot.contains_key("ias") {
            if let Some(ground_speed) = state.snapshot.get("ground_speed").cloned() {
                state.snapshot.insert("ias".into(), ground_speed);
            }
        }
        if !state.snapshot.contains_key("heading") {
            if let Some(Value::Number(yaw)) = state.snapshot.get("yaw_deg") {
                let yaw = yaw.as_f64().unwrap_or(0.0);
                state
                    .snapshot
                    .insert("heading".into(), json_f64((yaw + 360.0) % 360.0));
            }
        }
    }

    fn maybe_prune(state: &mut ModelState) {
        state.update_counter += 1;
        if state.update_counter % HISTORY_CLEANUP_INTERVAL == 0 {
            state.position.prune();
            state.attitude.prune();
            state.motion.prune();
        }
    }

    /// Defensive copy of the fused Snapshot.
    pub fn get_data(&self) -> HashMap<String, Value> {
        self.state.lock().unwrap().snapshot.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .sources
            .values()
            .any(|s| s.is_fresh())
    }

    pub fn source_status(&self, source: SourceName) -> SourceStatus {
        self.state.lock().unwrap().sources[source.key()].clone()
    }

    pub fn interpolate(&self, category: HistoryCategory, at: Instant) -> HashMap<String, f64> {
        let state = self.state.lock().unwrap();
        match category {
            HistoryCategory::Position => state.position.interpolate(at),
            HistoryCategory::Attitude => state.attitude.interpolate(at),
            HistoryCategory::Motion => state.motion.interpolate(at),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        let nmea_threshold = state.sources["nmea"].freshness_threshold;
        let kv_threshold = state.sources["kv"].freshness_threshold;
        *state = ModelState::default();
        state.sources.insert("nmea", SourceStatus::new(nmea_threshold));
        state.sources.insert("kv", SourceStatus::new(kv_threshold));
    }
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea_parser::NmeaParser;

    #[test]
    fn fuses_nmea_position_and_soaring() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));
        let mut parser = NmeaParser::new();
        let gga = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000*02")
            .unwrap();
        model.ingest_nmea(&gga);

        let data = model.get_data();
        assert_eq!(data["altitude_msl"].as_f64().unwrap(), 117.4);
        assert!(model.is_active());
    }

    #[test]
    fn conflict_resolution_prefers_nmea_but_keeps_kv_yaw() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));

        let kv_update = KvUpdate {
            attitude: Some(AttitudeRecord {
                yaw_rad: 269.0 / RAD_TO_DEG,
                ..Default::default()
            }),
            motion: Some(MotionRecord {
                altitude_m: 1510.0,
                vario_mps: 1.0,
                ..Default::default()
            }),
            config: None,
        };
        model.ingest_kv(&kv_update);

        let mut parser = NmeaParser::new();
        let gga = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,1500,M,,,,,0000*2B")
            .unwrap();
        model.ingest_nmea(&gga);
        let lxwp0 = parser
            .parse_sentence("$LXWP0,Y,,,1.2,,,,,,268,,0.0*45")
            .unwrap();
        model.ingest_nmea(&lxwp0);

        let data = model.get_data();
        assert_eq!(data["altitude_msl"].as_f64().unwrap(), 1500.0);
        assert_eq!(data["vario"].as_f64().unwrap(), 1.2);
        assert_eq!(data["heading"].as_f64().unwrap(), 268.0);
        assert!((data["yaw_deg"].as_f64().unwrap() - 269.0).abs() < 0.01);
    }

    #[test]
    fn reset_clears_snapshot_and_sources() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));
        let mut parser = NmeaParser::new();
        let gga = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000*02")
            .unwrap();
        model.ingest_nmea(&gga);
        model.reset();

        assert!(model.get_data().is_empty());
        assert!(!model.is_active());
    }

    #[test]
    fn rmc_status_active_does_not_override_gga_invalid() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));
        let mut parser = NmeaParser::new();

        let gga = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,0,12,10,117.4,M,,,,,0000*03")
            .unwrap();
        model.ingest_nmea(&gga);
        assert_eq!(model.get_data()["gps_valid"].as_bool().unwrap(), false);

        let rmc = parser
            .parse_sentence("$GPRMC,170000.021,A,4553.3709,N,01353.4357,E,10.0,270.0,010125,,,*12")
            .unwrap();
        model.ingest_nmea(&rmc);

        // RMC's active status must not resurrect validity that a
        // quality-0 GGA already set to false.
        assert_eq!(model.get_data()["gps_valid"].as_bool().unwrap(), false);
    }

    #[test]
    fn nmea_source_status_records_sentence_categories() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));
        let mut parser = NmeaParser::new();
        let gga = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000*02")
            .unwrap();
        model.ingest_nmea(&gga);
        let lxwp0 = parser
            .parse_sentence("$LXWP0,Y,17.5,117.4,0.50,,,,,,268,268,0.0*7F")
            .unwrap();
        model.ingest_nmea(&lxwp0);

        let status = model.source_status(SourceName::Nmea);
        assert!(status.fields_seen.contains("gga"));
        assert!(status.fields_seen.contains("lxwp0"));
    }

    #[test]
    fn history_caps_at_twenty_entries() {
        let model = SimModel::new(Duration::from_secs(5), Duration::from_secs(5));
        for _ in 0..25 {
            let kv_update = KvUpdate {
                attitude: None,
                motion: Some(MotionRecord {
                    airspeed_mps: 10.0,
                    ..Default::default()
                }),
                config: None,
            };
            model.ingest_kv(&kv_update);
        }
        let snapshot = model.interpolate(HistoryCategory::Motion, Instant::now());
        assert!(!snapshot.is_empty());
        let len = model.state.lock().unwrap().motion.entries.len();
        assert_eq!(len, HISTORY_MAX_ENTRIES);
    }
}
