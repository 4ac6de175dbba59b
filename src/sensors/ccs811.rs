// sensors/ccs811.rs
//
// CCS811 eCO2/TVOC sensor, constant power mode with one reading per second.

use embedded_hal::{delay::DelayNs, i2c::I2c};

use super::{sensor_err, AirReading, AirSensor};
use crate::*;

const REG_STATUS: u8 = 0x00;
const REG_MEAS_MODE: u8 = 0x01;
const REG_ALG_RESULT_DATA: u8 = 0x02;
const REG_ENV_DATA: u8 = 0x05;
const REG_HW_ID: u8 = 0x20;
const REG_APP_START: u8 = 0xF4;
const REG_SW_RESET: u8 = 0xFF;

const HW_ID: u8 = 0x81;
const SW_RESET_SEQ: [u8; 4] = [0x11, 0xE5, 0x72, 0x8A];

const STATUS_ERROR: u8 = 0x01;
const STATUS_DATA_READY: u8 = 0x08;
const STATUS_FW_MODE: u8 = 0x80;

// drive mode 1: constant power, one measurement per second
const MEAS_MODE_1SEC: u8 = 0x10;

pub struct Ccs811<I2C, D> {
    i2c: I2C,
    delay: D,
    address: u8,
}

impl<I2C: I2c, D: DelayNs> Ccs811<I2C, D> {
    pub fn new(i2c: I2C, address: u8, delay: D) -> Self {
        Self { i2c, delay, address }
    }

    pub fn probe(i2c: I2C, address: u8, delay: D) -> Option<Self> {
        let mut ccs = Self::new(i2c, address, delay);
        match ccs.begin() {
            Ok(()) => {
                info!("Found CCS811 at 0x{address:02X}");
                Some(ccs)
            }
            Err(e) => {
                info!("No CCS811 at 0x{address:02X}: {e}");
                None
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<()> {
        self.i2c
            .write(self.address, data)
            .map_err(|e| sensor_err("CCS811 write", e))
    }

    fn read_reg(&mut self, reg: u8, buf: &mut [u8]) -> AppResult<()> {
        self.i2c
            .write_read(self.address, &[reg], buf)
            .map_err(|e| sensor_err("CCS811 read", e))
    }

    fn status(&mut self) -> AppResult<u8> {
        let mut buf = [0u8];
        self.read_reg(REG_STATUS, &mut buf)?;
        Ok(buf[0])
    }

    fn begin(&mut self) -> AppResult<()> {
        let mut reset = [REG_SW_RESET; 5];
        reset[1..].copy_from_slice(&SW_RESET_SEQ);
        self.write(&reset)?;
        self.delay.delay_ms(100);

        let mut hw_id = [0u8];
        self.read_reg(REG_HW_ID, &mut hw_id)?;
        if hw_id[0] != HW_ID {
            return Err(AppError::Sensor(format!(
                "CCS811 unexpected hardware id 0x{:02X}",
                hw_id[0]
            )));
        }

        self.write(&[REG_APP_START])?;
        self.delay.delay_ms(100);

        let status = self.status()?;
        if status & STATUS_ERROR != 0 {
            return Err(AppError::Sensor("CCS811 reports error after start".into()));
        }
        if status & STATUS_FW_MODE == 0 {
            return Err(AppError::Sensor("CCS811 not in application mode".into()));
        }

        self.write(&[REG_MEAS_MODE, MEAS_MODE_1SEC])
    }
}

/// Humidity in %RH and temperature in °C as the ENV_DATA register wants them.
pub(crate) fn env_data(humidity: f64, temperature: f64) -> [u8; 4] {
    let hum = (humidity * 512.0 + 0.5) as u16;
    let temp = ((temperature + 25.0) * 512.0 + 0.5) as u16;
    let [h0, h1] = hum.to_be_bytes();
    let [t0, t1] = temp.to_be_bytes();
    [h0, h1, t0, t1]
}

impl<I2C: I2c, D: DelayNs> AirSensor for Ccs811<I2C, D> {
    fn data_ready(&mut self) -> AppResult<bool> {
        Ok(self.status()? & STATUS_DATA_READY != 0)
    }

    fn set_environment(&mut self, humidity: f64, temperature: f64) -> AppResult<()> {
        let env = env_data(humidity, temperature);
        self.write(&[REG_ENV_DATA, env[0], env[1], env[2], env[3]])
    }

    fn read(&mut self) -> AppResult<AirReading> {
        let mut buf = [0u8; 8];
        self.read_reg(REG_ALG_RESULT_DATA, &mut buf)?;

        let error = if buf[4] & STATUS_ERROR != 0 { buf[5] } else { 0 };
        Ok(AirReading {
            eco2: u16::from_be_bytes([buf[0], buf[1]]).into(),
            tvoc: u16::from_be_bytes([buf[2], buf[3]]).into(),
            error,
            valid: error == 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakeI2c, NoDelay};
    use super::*;
    use crate::sensors::CCS_ADDR_1;

    #[test]
    fn env_data_encoding() {
        // 48.5 %RH, 23.5 °C
        assert_eq!(env_data(48.5, 23.5), [0x61, 0x00, 0x61, 0x00]);
    }

    #[test]
    fn begin_checks_hardware_id() {
        let bus = FakeI2c::with_reads(&[&[0x55]]);
        assert!(Ccs811::probe(bus, CCS_ADDR_1, NoDelay).is_none());

        let bus = FakeI2c::with_reads(&[&[HW_ID], &[STATUS_FW_MODE]]);
        let ccs = Ccs811::probe(bus, CCS_ADDR_1, NoDelay).unwrap();
        let last = ccs.i2c.writes.last().unwrap();
        assert_eq!(last, &(CCS_ADDR_1, vec![REG_MEAS_MODE, MEAS_MODE_1SEC]));
    }

    #[test]
    fn reads_results() {
        let bus = FakeI2c::with_reads(&[
            &[STATUS_DATA_READY | STATUS_FW_MODE],
            &[0x01, 0x9A, 0x00, 0x05, 0x98, 0x00, 0x00, 0x00],
            &[0x01, 0x9A, 0x00, 0x05, 0x99, 0x04, 0x00, 0x00],
        ]);
        let mut ccs = Ccs811::new(bus, CCS_ADDR_1, NoDelay);
        assert!(ccs.data_ready().unwrap());

        let r = ccs.read().unwrap();
        assert_eq!(r.eco2, 410.0);
        assert_eq!(r.tvoc, 5.0);
        assert!(r.valid);

        let r = ccs.read().unwrap();
        assert_eq!(r.error, 4);
        assert!(!r.valid);
    }
}

// EOF
