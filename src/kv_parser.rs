//! Key=value datagram parsing for attitude, motion, and config records.
//!
//! Grounded on `condor_parser.py`'s regex shape and per-category trigger
//! keys: a record is only produced when at least one of its defining keys
//! is present in the datagram.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

use crate::error::KvError;

const MAX_DATAGRAM_CHARS: usize = 4096;

fn kv_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([A-Za-z_]+)=([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)").unwrap()
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttitudeRecord {
    pub yaw_rad: f64,
    pub pitch_rad: f64,
    pub bank_rad: f64,
    pub quaternion: [f64; 4],
    pub roll_rate_rps: f64,
    pub pitch_rate_rps: f64,
    pub yaw_rate_rps: f64,
    pub yaw_string_rad: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionRecord {
    pub sim_time: f64,
    pub airspeed_mps: f64,
    pub altitude_m: f64,
    pub vario_mps: f64,
    pub evario_mps: f64,
    pub netto_vario_mps: f64,
    pub accel: [f64; 3],
    pub vel: [f64; 3],
    pub g_force: f64,
    pub height_agl_m: f64,
    pub wheel_height_m: f64,
    pub turbulence: f64,
    pub surface_roughness: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigRecord {
    pub flaps_index: i64,
    pub mc_setting: f64,
    pub water_ballast: i64,
    pub radio_hz: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KvUpdate {
    pub attitude: Option<AttitudeRecord>,
    pub motion: Option<MotionRecord>,
    pub config: Option<ConfigRecord>,
}

#[derive(Debug, Default)]
pub struct KvParser {
    pub error_count: u64,
    pub warning_count: u64,
}

impl KvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_datagram(&mut self, body: &str) -> Result<KvUpdate, KvError> {
        if body.chars().count() > MAX_DATAGRAM_CHARS {
            self.error_count += 1;
            return Err(KvError::TooLong {
                max: MAX_DATAGRAM_CHARS,
            });
        }

        let mut fields: HashMap<String, Number> = HashMap::new();
        for capture in kv_pattern().captures_iter(body) {
            let key = capture[1].to_string();
            let raw = &capture[2];
            let number = if !raw.contains('.') && !raw.to_ascii_lowercase().contains('e') {
                raw.parse::<i64>()
                    .map(Number::Int)
                    .unwrap_or_else(|_| Number::Float(raw.parse().unwrap_or(0.0)))
            } else {
                Number::Float(raw.parse().unwrap_or(0.0))
            };
            fields.insert(key, number);
        }

        if fields.is_empty() {
            self.error_count += 1;
            return Err(KvError::Empty);
        }

        Ok(KvUpdate {
            attitude: self.extract_attitude(&fields),
            motion: self.extract_motion(&fields),
            config: self.extract_config(&fields),
        })
    }

    fn extract_attitude(&self, fields: &HashMap<String, Number>) -> Option<AttitudeRecord> {
        let get = |k: &str| fields.get(k).map(|n| n.as_f64()).unwrap_or(0.0);
        if !["yaw", "pitch", "bank", "quaternionx"]
            .iter()
            .any(|k| fields.contains_key(*k))
        {
            return None;
        }
        Some(AttitudeRecord {
            yaw_rad: get("yaw"),
            pitch_rad: get("pitch"),
            bank_rad: get("bank"),
            quaternion: [
                get("quaternionx"),
                get("quaterniony"),
                get("quaternionz"),
                fields
                    .get("quaternionw")
                    .map(|n| n.as_f64())
                    .unwrap_or(1.0),
            ],
            roll_rate_rps: get("rollrate"),
            pitch_rate_rps: get("pitchrate"),
            yaw_rate_rps: get("yawrate"),
            yaw_string_rad: get("yawstringangle"),
        })
    }

    fn extract_motion(&mut self, fields: &HashMap<String, Number>) -> Option<MotionRecord> {
        let get = |k: &str| fields.get(k).map(|n| n.as_f64()).unwrap_or(0.0);
        if !["airspeed", "altitude", "vario"]
            .iter()
            .any(|k| fields.contains_key(*k))
        {
            return None;
        }

        self.check_range("altitude", fields, -500.0, 15_000.0);
        self.check_range("airspeed", fields, 0.0, 150.0);
        self.check_range("vario", fields, -20.0, 20.0);
        self.check_range("evario", fields, -20.0, 20.0);
        self.check_range("nettovario", fields, -20.0, 20.0);
        self.check_range("gforce", fields, -5.0, 10.0);
        self.check_range("height", fields, -10.0, 15_000.0);

        Some(MotionRecord {
            sim_time: get("time"),
            airspeed_mps: get("airspeed"),
            altitude_m: get("altitude"),
            vario_mps: get("vario"),
            evario_mps: get("evario"),
            netto_vario_mps: get("nettovario"),
            accel: [get("ax"), get("ay"), get("az")],
            vel: [get("vx"), get("vy"), get("vz")],
            g_force: get("gforce"),
            height_agl_m: get("height"),
            wheel_height_m: get("wheelheight"),
            turbulence: get("turbulencestrength"),
            surface_roughness: get("surfaceroughness"),
        })
    }

    fn extract_config(&self, fields: &HashMap<String, Number>) -> Option<ConfigRecord> {
        if !["flaps", "MC", "water", "radiofrequency"]
            .iter()
            .any(|k| fields.contains_key(*k))
        {
            return None;
        }
        let int_of = |k: &str| match fields.get(k) {
            Some(Number::Int(v)) => *v,
            Some(Number::Float(v)) => *v as i64,
            None => 0,
        };
        Some(ConfigRecord {
            flaps_index: int_of("flaps"),
            mc_setting: fields.get("MC").map(|n| n.as_f64()).unwrap_or(0.0),
            water_ballast: int_of("water"),
            radio_hz: fields.get("radiofrequency").map(|n| n.as_f64()).unwrap_or(0.0),
        })
    }

    fn check_range(&mut self, key: &str, fields: &HashMap<String, Number>, min: f64, max: f64) {
        if let Some(value) = fields.get(key) {
            let value = value.as_f64();
            if !(min..=max).contains(&value) {
                self.warning_count += 1;
                warn!(key, value, min, max, "motion field outside expected range");
            }
        }
    }
}

pub const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;
pub const MPS_TO_KNOTS: f64 = 1.94384;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_attitude_and_motion() {
        let mut parser = KvParser::new();
        let update = parser
            .parse_datagram(
                "yaw=1.57\npitch=0.1\nbank=0.2\nairspeed=30.5\naltitude=1000\nvario=2.5\ngforce=1.2\nheight=950",
            )
            .unwrap();

        let attitude = update.attitude.unwrap();
        assert!((attitude.yaw_rad * RAD_TO_DEG - 89.954).abs() < 0.01);
        assert!((attitude.pitch_rad * RAD_TO_DEG - 5.7296).abs() < 0.01);
        assert!((attitude.bank_rad * RAD_TO_DEG - 11.459).abs() < 0.01);

        let motion = update.motion.unwrap();
        assert!((motion.airspeed_mps * MPS_TO_KNOTS - 59.29).abs() < 0.1);
        assert_eq!(motion.altitude_m, 1000.0);
        assert_eq!(motion.vario_mps, 2.5);
        assert_eq!(motion.g_force, 1.2);
        assert_eq!(motion.height_agl_m, 950.0);
    }

    #[test]
    fn ignores_unknown_keys() {
        let mut parser = KvParser::new();
        let update = parser.parse_datagram("foo=1\nbar=2.5").unwrap();
        assert!(update.attitude.is_none());
        assert!(update.motion.is_none());
        assert!(update.config.is_none());
    }

    #[test]
    fn rejects_empty_datagram() {
        let mut parser = KvParser::new();
        let result = parser.parse_datagram("no pairs here");
        assert!(matches!(result, Err(KvError::Empty)));
        assert_eq!(parser.error_count, 1);
    }

    #[test]
    fn decodes_config_fields() {
        let mut parser = KvParser::new();
        let update = parser
            .parse_datagram("flaps=2\nMC=1.5\nwater=50\nradiofrequency=123.575")
            .unwrap();
        let config = update.config.unwrap();
        assert_eq!(config.flaps_index, 2);
        assert_eq!(config.mc_setting, 1.5);
        assert_eq!(config.water_ballast, 50);
    }
}
