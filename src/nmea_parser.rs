//! NMEA 0183 sentence parsing: GPGGA, GPRMC, LXWP0.
//!
//! Field indices and validation order are taken from the original
//! `NMEAParser` (Condor-Shirley-Bridge): checksum, then length, then
//! coordinate range. Out-of-range altitude/speed/vario only warn.

use tracing::warn;

use crate::error::NmeaError;

const MAX_SENTENCE_LEN: usize = 256;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsFix {
    pub timestamp_s: f64,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub ground_speed_kt: f64,
    pub track_deg: f64,
    pub fix_quality: u8,
    pub satellite_count: u8,
    pub valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoaringRecord {
    pub timestamp_s: f64,
    pub ias_kt: f64,
    pub baro_alt_m: f64,
    pub vario_mps: f64,
    pub avg_vario_mps: Option<f64>,
    pub heading_deg: f64,
    pub track_bearing_deg: Option<f64>,
    pub turn_rate_dps: Option<f64>,
}

/// One decoded sentence; the caller merges whichever fields it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum NmeaUpdate {
    Gga(GpsFix),
    Rmc(GpsFix),
    Lxwp0(SoaringRecord),
}

#[derive(Debug, Default)]
pub struct NmeaParser {
    pub error_count: u64,
    pub warning_count: u64,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_sentence(&mut self, line: &str) -> Result<NmeaUpdate, NmeaError> {
        let result = self.try_parse(line);
        if result.is_err() {
            self.error_count += 1;
        }
        result
    }

    fn try_parse(&mut self, line: &str) -> Result<NmeaUpdate, NmeaError> {
        let line = line.trim();
        if line.len() > MAX_SENTENCE_LEN {
            return Err(NmeaError::TooLong {
                max: MAX_SENTENCE_LEN,
            });
        }
        let body = self.verify_checksum(line)?;

        let fields: Vec<&str> = body.split(',').collect();
        let kind = fields.first().copied().unwrap_or("");

        match kind {
            "$GPGGA" => self.parse_gga(&fields).map(NmeaUpdate::Gga),
            "$GPRMC" => self.parse_rmc(&fields).map(NmeaUpdate::Rmc),
            "$LXWP0" => self.parse_lxwp0(&fields).map(NmeaUpdate::Lxwp0),
            _ => Err(NmeaError::Unrecognized),
        }
    }

    fn verify_checksum<'a>(&mut self, line: &'a str) -> Result<&'a str, NmeaError> {
        let Some(star) = line.rfind('*') else {
            return Ok(line);
        };
        let body = &line[..star];
        let checksum_hex = &line[star + 1..];
        let Ok(expected) = u8::from_str_radix(checksum_hex.trim(), 16) else {
            return Err(NmeaError::BadField(format!(
                "non-hex checksum {checksum_hex}"
            )));
        };

        let payload = body.strip_prefix('$').unwrap_or(body);
        let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);

        if actual != expected {
            return Err(NmeaError::BadChecksum { expected, actual });
        }
        Ok(body)
    }

    fn parse_gga(&mut self, fields: &[&str]) -> Result<GpsFix, NmeaError> {
        if fields.len() < 15 {
            return Err(NmeaError::TooFewFields {
                kind: "GPGGA",
                min: 15,
                actual: fields.len(),
            });
        }
        let timestamp_s = parse_time(fields[1]);
        let latitude_deg = parse_lat(fields[2], fields[3])?;
        let longitude_deg = parse_lon(fields[4], fields[5])?;
        let fix_quality: u8 = fields[6].parse().unwrap_or(0);
        let satellite_count: u8 = fields[7].parse().unwrap_or(0);
        let altitude_m: f64 = fields[9].parse().unwrap_or(0.0);

        if !(-500.0..15_000.0).contains(&altitude_m) {
            self.warning_count += 1;
            warn!(altitude_m, "GGA altitude outside expected range");
        }

        Ok(GpsFix {
            timestamp_s,
            latitude_deg,
            longitude_deg,
            altitude_m,
            fix_quality,
            satellite_count,
            valid: fix_quality > 0,
            ..Default::default()
        })
    }

    fn parse_rmc(&mut self, fields: &[&str]) -> Result<GpsFix, NmeaError> {
        if fields.len() < 12 {
            return Err(NmeaError::TooFewFields {
                kind: "GPRMC",
                min: 12,
                actual: fields.len(),
            });
        }
        let timestamp_s = parse_time(fields[1]);
        let status_valid = fields[2] == "A";
        let latitude_deg = parse_lat(fields[3], fields[4])?;
        let longitude_deg = parse_lon(fields[5], fields[6])?;
        let ground_speed_kt: f64 = fields[7].parse().unwrap_or(0.0);
        let track_deg: f64 = fields[8].parse().unwrap_or(0.0);

        if !(0.0..150.0).contains(&(ground_speed_kt * 0.514444)) {
            self.warning_count += 1;
            warn!(ground_speed_kt, "RMC ground speed outside expected range");
        }

        Ok(GpsFix {
            timestamp_s,
            latitude_deg,
            longitude_deg,
            ground_speed_kt,
            track_deg,
            // RMC can only force invalid, never force valid on its own.
            valid: status_valid,
            ..Default::default()
        })
    }

    fn parse_lxwp0(&mut self, fields: &[&str]) -> Result<SoaringRecord, NmeaError> {
        if fields.len() < 11 {
            return Err(NmeaError::TooFewFields {
                kind: "LXWP0",
                min: 11,
                actual: fields.len(),
            });
        }
        let ias_kt: f64 = fields[2].parse().unwrap_or(0.0);
        let baro_alt_m: f64 = fields[3].parse().unwrap_or(0.0);
        let vario_mps: f64 = fields[4].parse().unwrap_or(0.0);
        let avg_vario_mps = fields.get(5).and_then(|s| s.parse().ok());
        let heading_deg: f64 = fields.get(10).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let track_bearing_deg = fields.get(11).and_then(|s| s.parse().ok());
        let turn_rate_dps = fields.get(12).and_then(|s| s.parse().ok());

        if !(-20.0..20.0).contains(&vario_mps) {
            self.warning_count += 1;
            warn!(vario_mps, "LXWP0 vario outside expected range");
        }

        Ok(SoaringRecord {
            ias_kt,
            baro_alt_m,
            vario_mps,
            avg_vario_mps,
            heading_deg,
            track_bearing_deg,
            turn_rate_dps,
            ..Default::default()
        })
    }
}

/// `HHMMSS.sss` to seconds-since-midnight UTC.
fn parse_time(field: &str) -> f64 {
    if field.len() < 6 {
        return 0.0;
    }
    let hours: f64 = field[0..2].parse().unwrap_or(0.0);
    let minutes: f64 = field[2..4].parse().unwrap_or(0.0);
    let seconds: f64 = field[4..].parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds
}

/// `DDMM.mmmm` + hemisphere to signed decimal degrees.
fn parse_lat(field: &str, hemisphere: &str) -> Result<f64, NmeaError> {
    if field.is_empty() {
        return Ok(0.0);
    }
    let raw: f64 = field
        .parse()
        .map_err(|_| NmeaError::BadField(field.to_string()))?;
    let degrees = (raw / 100.0).floor();
    let minutes = raw - degrees * 100.0;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" {
        decimal = -decimal;
    }
    if !(-90.0..=90.0).contains(&decimal) {
        return Err(NmeaError::BadCoordinate(decimal));
    }
    Ok(decimal)
}

/// `DDDMM.mmmm` + hemisphere to signed decimal degrees.
fn parse_lon(field: &str, hemisphere: &str) -> Result<f64, NmeaError> {
    if field.is_empty() {
        return Ok(0.0);
    }
    let raw: f64 = field
        .parse()
        .map_err(|_| NmeaError::BadField(field.to_string()))?;
    let degrees = (raw / 100.0).floor();
    let minutes = raw - degrees * 100.0;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "W" {
        decimal = -decimal;
    }
    if !(-180.0..=180.0).contains(&decimal) {
        return Err(NmeaError::BadCoordinate(decimal));
    }
    Ok(decimal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gga_position() {
        let mut parser = NmeaParser::new();
        let update = parser
            .parse_sentence("$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000*02")
            .unwrap();
        let NmeaUpdate::Gga(fix) = update else {
            panic!("expected GGA");
        };
        assert!((fix.latitude_deg - 45.8895).abs() < 1e-3);
        assert!((fix.longitude_deg - 13.8906).abs() < 1e-3);
        assert_eq!(fix.altitude_m, 117.4);
        assert_eq!(fix.fix_quality, 1);
        assert_eq!(fix.satellite_count, 12);
        assert!(fix.valid);
    }

    #[test]
    fn decodes_lxwp0_soaring() {
        let mut parser = NmeaParser::new();
        let update = parser
            .parse_sentence("$LXWP0,Y,17.5,117.4,0.50,,,,,,268,268,0.0*7F")
            .unwrap();
        let NmeaUpdate::Lxwp0(record) = update else {
            panic!("expected LXWP0");
        };
        assert_eq!(record.ias_kt, 17.5);
        assert_eq!(record.baro_alt_m, 117.4);
        assert_eq!(record.vario_mps, 0.50);
        assert_eq!(record.heading_deg, 268.0);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut parser = NmeaParser::new();
        let result = parser.parse_sentence(
            "$GPGGA,170000.021,4553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000*FF",
        );
        assert!(matches!(result, Err(NmeaError::BadChecksum { .. })));
        assert_eq!(parser.error_count, 1);
    }

    #[test]
    fn rmc_status_void_forces_invalid() {
        let mut parser = NmeaParser::new();
        let update = parser
            .parse_sentence("$GPRMC,170000.021,V,4553.3709,N,01353.4357,E,10.0,090.0,010180,,*2A")
            .unwrap();
        let NmeaUpdate::Rmc(fix) = update else {
            panic!("expected RMC");
        };
        assert!(!fix.valid);
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let mut parser = NmeaParser::new();
        // 9553.3709 decodes to 95.889 deg, outside +-90; no checksum appended
        // so the checksum step is skipped and the coordinate check is reached.
        let result = parser.parse_sentence(
            "$GPGGA,170000.021,9553.3709,N,01353.4357,E,1,12,10,117.4,M,,,,,0000",
        );
        assert!(matches!(result, Err(NmeaError::BadCoordinate(_))));
    }
}
