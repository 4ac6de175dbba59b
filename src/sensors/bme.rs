// sensors/bme.rs

use bme280::i2c::BME280;
use embedded_hal::{delay::DelayNs, i2c::I2c};

use super::{sensor_err, ClimateReading, EnvSensor, BME_ADDR_LOW};
use crate::*;

pub struct Bme280Sensor<I2C, D> {
    dev: BME280<I2C>,
    delay: D,
    name: &'static str,
}

impl<I2C: I2c, D: DelayNs> Bme280Sensor<I2C, D> {
    pub fn probe(i2c: I2C, address: u8, mut delay: D) -> Option<Self> {
        let (mut dev, name) = if address == BME_ADDR_LOW {
            (BME280::new_primary(i2c), "BME280 low")
        } else {
            (BME280::new_secondary(i2c), "BME280 high")
        };

        match dev.init(&mut delay) {
            Ok(()) => {
                info!("Found {name} at 0x{address:02X}");
                Some(Self { dev, delay, name })
            }
            Err(e) => {
                info!("No BME280 at 0x{address:02X}: {e:?}");
                None
            }
        }
    }
}

impl<I2C: I2c, D: DelayNs> EnvSensor for Bme280Sensor<I2C, D> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sample(&mut self) -> AppResult<ClimateReading> {
        let m = self
            .dev
            .measure(&mut self.delay)
            .map_err(|e| sensor_err(self.name, e))?;
        Ok(ClimateReading {
            temperature: m.temperature.into(),
            humidity: m.humidity.into(),
            pressure: Some(m.pressure.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakeI2c, NoDelay};
    use super::*;

    #[test]
    fn probe_fails_without_device() {
        assert!(Bme280Sensor::probe(FakeI2c::default(), BME_ADDR_LOW, NoDelay).is_none());
    }
}

// EOF
