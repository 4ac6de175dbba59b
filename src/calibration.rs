// calibration.rs

use crate::*;

pub const CALIBRATION_NAME: &str = "cal";

/// Raw touch controller readings taken at the two calibration reticules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TouchCalibration {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

impl TouchCalibration {
    pub fn is_unset(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub sht_temp_off: f64,
    pub bme1_temp_off: f64,
    pub bme2_temp_off: f64,
    pub touch: TouchCalibration,
}

/// Offset that makes a sensor reading `measured` (already including
/// `old_offset`) report `real` instead.
pub fn recalibrate(real: f64, measured: f64, old_offset: f64) -> f64 {
    let raw = measured - old_offset;
    real - raw
}

/// Query of `GET /calibrate`. Each value is the real temperature for that sensor.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CalibrateQuery {
    pub bme1: Option<f64>,
    pub bme2: Option<f64>,
    pub sht: Option<f64>,
}

impl Calibration {
    /// Apply a calibration request against the current readings.
    /// Returns true when any offset changed.
    pub fn apply(&mut self, query: &CalibrateQuery, snapshot: &SensorSnapshot) -> bool {
        let mut changed = false;

        if let (Some(real), Some(bme)) = (query.bme1, snapshot.bme1.as_ref()) {
            self.bme1_temp_off = recalibrate(real, bme.temperature, self.bme1_temp_off);
            info!("BME280 low offset now {:.2}", self.bme1_temp_off);
            changed = true;
        }
        if let (Some(real), Some(bme)) = (query.bme2, snapshot.bme2.as_ref()) {
            self.bme2_temp_off = recalibrate(real, bme.temperature, self.bme2_temp_off);
            info!("BME280 high offset now {:.2}", self.bme2_temp_off);
            changed = true;
        }
        if let (Some(real), Some(sht)) = (query.sht, snapshot.sht.as_ref()) {
            self.sht_temp_off = recalibrate(real, sht.temperature, self.sht_temp_off);
            info!("SHT21 offset now {:.2}", self.sht_temp_off);
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::ClimateReading;

    #[test]
    fn recalibrate_removes_old_offset() {
        // sensor reads 21.0 raw, old offset +1.0 shows 22.0, real is 20.5
        let off = recalibrate(20.5, 22.0, 1.0);
        assert!((off - (-0.5)).abs() < 1e-9);
        assert!((21.0 + off - 20.5).abs() < 1e-9);
    }

    #[test]
    fn touch_calibration_unset_when_zero() {
        assert!(TouchCalibration::default().is_unset());
        let t = TouchCalibration {
            left: 300,
            right: 3800,
            top: 250,
            bottom: 3700,
        };
        assert!(!t.is_unset());
    }

    #[test]
    fn apply_skips_missing_sensors() {
        let snap = SensorSnapshot {
            sht: Some(ClimateReading {
                temperature: 23.0,
                humidity: 40.0,
                pressure: None,
            }),
            ..Default::default()
        };
        let mut cal = Calibration::default();
        let query = CalibrateQuery {
            bme1: Some(20.0),
            bme2: None,
            sht: Some(21.5),
        };
        assert!(cal.apply(&query, &snap));
        assert_eq!(cal.bme1_temp_off, 0.0);
        assert!((cal.sht_temp_off - (-1.5)).abs() < 1e-9);

        assert!(!cal.apply(&CalibrateQuery::default(), &snap));
    }
}

// EOF
