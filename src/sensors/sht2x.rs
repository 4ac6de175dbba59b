// sensors/sht2x.rs
//
// SHT21 / HTU21D humidity and temperature sensor, hold master mode.

use crc::{Algorithm, Crc};
use embedded_hal::{delay::DelayNs, i2c::I2c};

use super::{sensor_err, ClimateReading, EnvSensor, SHT_ADDR};
use crate::*;

const TRIGGER_TEMP_MEASURE_HOLD: u8 = 0xE3;
const TRIGGER_HUMD_MEASURE_HOLD: u8 = 0xE5;

// datasheet: 50 ms max conversion time
const MEASURE_DELAY_MS: u32 = 55;

const CRC_8_SHT2X: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};
const SHT_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SHT2X);

pub struct Sht2x<I2C, D> {
    i2c: I2C,
    delay: D,
}

impl<I2C: I2c, D: DelayNs> Sht2x<I2C, D> {
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self { i2c, delay }
    }

    pub fn probe(i2c: I2C, delay: D) -> Option<Self> {
        let mut sht = Self::new(i2c, delay);
        match sht.read_raw(TRIGGER_TEMP_MEASURE_HOLD) {
            Ok(_) => {
                info!("Found SHT21 at 0x{SHT_ADDR:02X}");
                Some(sht)
            }
            Err(e) => {
                info!("No SHT21: {e}");
                None
            }
        }
    }

    fn read_raw(&mut self, command: u8) -> AppResult<u16> {
        self.i2c
            .write(SHT_ADDR, &[command])
            .map_err(|e| sensor_err("SHT21 write", e))?;
        self.delay.delay_ms(MEASURE_DELAY_MS);

        let mut buf = [0u8; 3];
        self.i2c
            .read(SHT_ADDR, &mut buf)
            .map_err(|e| sensor_err("SHT21 read", e))?;

        let crc = SHT_CRC.checksum(&buf[..2]);
        if crc != buf[2] {
            return Err(AppError::Sensor(format!(
                "SHT21 CRC mismatch: got {:02X}, computed {crc:02X}",
                buf[2]
            )));
        }
        // two low bits are status
        Ok(u16::from_be_bytes([buf[0], buf[1]]) & !0x0003)
    }

    pub fn temperature(&mut self) -> AppResult<f64> {
        let raw = self.read_raw(TRIGGER_TEMP_MEASURE_HOLD)?;
        Ok(-46.85 + 175.72 / 65536.0 * f64::from(raw))
    }

    pub fn humidity(&mut self) -> AppResult<f64> {
        let raw = self.read_raw(TRIGGER_HUMD_MEASURE_HOLD)?;
        Ok(-6.0 + 125.0 / 65536.0 * f64::from(raw))
    }
}

impl<I2C: I2c, D: DelayNs> EnvSensor for Sht2x<I2C, D> {
    fn name(&self) -> &'static str {
        "SHT21"
    }

    fn sample(&mut self) -> AppResult<ClimateReading> {
        Ok(ClimateReading {
            temperature: self.temperature()?,
            humidity: self.humidity()?,
            pressure: None,
        })
    }
}


// EOF
