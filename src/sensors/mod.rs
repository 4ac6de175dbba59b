// sensors/mod.rs

use std::cell::RefCell;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use embedded_hal_bus::i2c::CriticalSectionDevice;

use crate::*;

mod bme;
mod ccs811;
mod sht2x;

pub use bme::Bme280Sensor;
pub use ccs811::Ccs811;
pub use sht2x::Sht2x;

pub const BME_ADDR_LOW: u8 = 0x76;
pub const BME_ADDR_HIGH: u8 = 0x77;
pub const SHT_ADDR: u8 = 0x40;
pub const CCS_ADDR_1: u8 = 0x5A;
pub const CCS_ADDR_2: u8 = 0x5B;

// two consecutive samples must agree within this
pub const STABLE_MAX_DIFF: f64 = 2.0;
pub const STABLE_MAX_ATTEMPTS: usize = 10;

pub type SharedI2c<I2C> = critical_section::Mutex<RefCell<I2C>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ClimateReading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AirReading {
    pub eco2: f64,
    pub tvoc: f64,
    pub error: u8,
    pub valid: bool,
}

/// Latest readings of every sensor found at start-up.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub bme1: Option<ClimateReading>,
    pub bme2: Option<ClimateReading>,
    pub sht: Option<ClimateReading>,
    pub ccs1: Option<AirReading>,
    pub ccs2: Option<AirReading>,
}

impl SensorSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bme1.is_none()
            && self.bme2.is_none()
            && self.sht.is_none()
            && self.ccs1.is_none()
            && self.ccs2.is_none()
    }

    /// Temperature and humidity source for MQTT: SHT21 first, then the BME280s.
    pub fn primary_climate(&self) -> Option<&ClimateReading> {
        self.sht.as_ref().or(self.bme1.as_ref()).or(self.bme2.as_ref())
    }

    pub fn primary_air(&self) -> Option<&AirReading> {
        self.ccs1.as_ref().or(self.ccs2.as_ref())
    }
}

/// Temperature/humidity sensor.
pub trait EnvSensor {
    fn name(&self) -> &'static str;
    fn sample(&mut self) -> AppResult<ClimateReading>;
}

/// Air quality sensor with environmental compensation.
pub trait AirSensor {
    fn data_ready(&mut self) -> AppResult<bool>;
    fn set_environment(&mut self, humidity: f64, temperature: f64) -> AppResult<()>;
    fn read(&mut self) -> AppResult<AirReading>;
}

pub(crate) fn sensor_err<E: core::fmt::Debug>(what: &str, e: E) -> AppError {
    AppError::Sensor(format!("{what}: {e:?}"))
}

/// Read a value twice and accept the mean once both samples agree.
pub fn stable_read<F>(mut sample: F) -> AppResult<f64>
where
    F: FnMut() -> AppResult<f64>,
{
    for _ in 0..STABLE_MAX_ATTEMPTS {
        let a = sample()?;
        let b = sample()?;
        if (a - b).abs() < STABLE_MAX_DIFF {
            return Ok((a + b) / 2.0);
        }
        debug!("Unstable reading {a} vs {b}, retrying");
    }
    Err(AppError::Sensor(format!(
        "no stable reading after {STABLE_MAX_ATTEMPTS} attempts"
    )))
}

fn stable_climate(sensor: &mut dyn EnvSensor) -> AppResult<ClimateReading> {
    let temperature = stable_read(|| Ok(sensor.sample()?.temperature))?;
    let humidity = stable_read(|| Ok(sensor.sample()?.humidity))?;
    let pressure = match sensor.sample()?.pressure {
        Some(_) => Some(stable_read(|| {
            sensor
                .sample()?
                .pressure
                .ok_or_else(|| AppError::Sensor("pressure vanished".into()))
        })?),
        None => None,
    };
    Ok(ClimateReading {
        temperature,
        humidity,
        pressure,
    })
}

struct AirSlot<'a> {
    dev: Box<dyn AirSensor + 'a>,
    last: AirReading,
}

impl<'a> AirSlot<'a> {
    fn new(dev: Box<dyn AirSensor + 'a>) -> Self {
        Self {
            dev,
            last: AirReading::default(),
        }
    }
}

#[derive(Default)]
pub struct Sensors<'a> {
    bme1: Option<Box<dyn EnvSensor + 'a>>,
    bme2: Option<Box<dyn EnvSensor + 'a>>,
    sht: Option<Box<dyn EnvSensor + 'a>>,
    ccs1: Option<AirSlot<'a>>,
    ccs2: Option<AirSlot<'a>>,
}

impl<'a> Sensors<'a> {
    /// Probe every known sensor address on the shared bus.
    pub fn probe<I2C, D>(bus: &'a SharedI2c<I2C>, delay: D) -> Self
    where
        I2C: I2c + 'a,
        D: DelayNs + Clone + 'a,
    {
        info!("Probing I2C sensors...");
        let sensors = Self {
            bme1: Bme280Sensor::probe(CriticalSectionDevice::new(bus), BME_ADDR_LOW, delay.clone())
                .map(|s| Box::new(s) as Box<dyn EnvSensor + 'a>),
            bme2: Bme280Sensor::probe(CriticalSectionDevice::new(bus), BME_ADDR_HIGH, delay.clone())
                .map(|s| Box::new(s) as Box<dyn EnvSensor + 'a>),
            sht: Sht2x::probe(CriticalSectionDevice::new(bus), delay.clone())
                .map(|s| Box::new(s) as Box<dyn EnvSensor + 'a>),
            ccs1: Ccs811::probe(CriticalSectionDevice::new(bus), CCS_ADDR_1, delay.clone())
                .map(|s| AirSlot::new(Box::new(s))),
            ccs2: Ccs811::probe(CriticalSectionDevice::new(bus), CCS_ADDR_2, delay)
                .map(|s| AirSlot::new(Box::new(s))),
        };
        info!("Sensors found: {:?}", sensors.found());
        sensors
    }

    pub fn with_bme1(mut self, s: Box<dyn EnvSensor + 'a>) -> Self {
        self.bme1 = Some(s);
        self
    }

    pub fn with_bme2(mut self, s: Box<dyn EnvSensor + 'a>) -> Self {
        self.bme2 = Some(s);
        self
    }

    pub fn with_sht(mut self, s: Box<dyn EnvSensor + 'a>) -> Self {
        self.sht = Some(s);
        self
    }

    pub fn with_ccs1(mut self, s: Box<dyn AirSensor + 'a>) -> Self {
        self.ccs1 = Some(AirSlot::new(s));
        self
    }

    pub fn found(&self) -> Vec<&'static str> {
        let mut v = Vec::new();
        if self.bme1.is_some() {
            v.push("bme280 low");
        }
        if self.bme2.is_some() {
            v.push("bme280 high");
        }
        if self.sht.is_some() {
            v.push("sht21");
        }
        if self.ccs1.is_some() {
            v.push("ccs811 1");
        }
        if self.ccs2.is_some() {
            v.push("ccs811 2");
        }
        v
    }

    pub fn is_empty(&self) -> bool {
        self.found().is_empty()
    }

    pub fn poll(&mut self, cal: &Calibration) -> SensorSnapshot {
        let bme1 = read_climate(self.bme1.as_deref_mut(), cal.bme1_temp_off);
        let bme2 = read_climate(self.bme2.as_deref_mut(), cal.bme2_temp_off);
        let sht = read_climate(self.sht.as_deref_mut(), cal.sht_temp_off);

        // compensation source, BME280s preferred
        let env = bme1.or(bme2).or(sht);
        let ccs1 = read_air(self.ccs1.as_mut(), env.as_ref());
        let ccs2 = read_air(self.ccs2.as_mut(), env.as_ref());

        SensorSnapshot {
            bme1,
            bme2,
            sht,
            ccs1,
            ccs2,
        }
    }
}

fn read_climate(sensor: Option<&mut (dyn EnvSensor + '_)>, offset: f64) -> Option<ClimateReading> {
    let sensor = sensor?;
    match stable_climate(sensor) {
        Ok(mut r) => {
            r.temperature += offset;
            Some(r)
        }
        Err(e) => {
            error!("{} read failed: {e}", sensor.name());
            None
        }
    }
}

fn read_air(slot: Option<&mut AirSlot<'_>>, env: Option<&ClimateReading>) -> Option<AirReading> {
    let slot = slot?;
    let ready = match slot.dev.data_ready() {
        Ok(r) => r,
        Err(e) => {
            error!("CCS811 status read failed: {e}");
            false
        }
    };
    if ready {
        if let Some(env) = env {
            if let Err(e) = slot.dev.set_environment(env.humidity, env.temperature) {
                error!("CCS811 compensation failed: {e}");
            }
        }
        match slot.dev.read() {
            Ok(r) => slot.last = r,
            Err(e) => error!("CCS811 read failed: {e}"),
        }
    }
    Some(slot.last)
}

pub async fn poll_sensors(state: Arc<Pin<Box<MyState>>>, mut sensors: Sensors<'_>) -> anyhow::Result<()> {
    if sensors.is_empty() {
        warn!("No sensors found, nothing to poll.");
        // we cannot return, otherwise tokio::select in main() will exit
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    loop {
        let cal = state.calibration.read().await.clone();
        let snapshot = sensors.poll(&cal);
        debug!("Sensors: {snapshot:?}");
        *state.sensors.write().await = snapshot;

        let interval = state.config.read().await.sensor_interval;
        sleep(Duration::from_secs(interval.into())).await;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;

    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    use super::*;

    /// Scripted I2C bus: reads pop canned responses, writes are recorded.
    #[derive(Debug, Default)]
    pub struct FakeI2c {
        pub reads: VecDeque<Vec<u8>>,
        pub writes: Vec<(u8, Vec<u8>)>,
    }

    impl FakeI2c {
        pub fn with_reads(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                writes: Vec::new(),
            }
        }
    }

    impl ErrorType for FakeI2c {
        type Error = ErrorKind;
    }

    impl I2c for FakeI2c {
        fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
            for op in operations {
                match op {
                    Operation::Write(data) => self.writes.push((address, data.to_vec())),
                    Operation::Read(buf) => {
                        let resp = self
                            .reads
                            .pop_front()
                            .ok_or(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))?;
                        buf.copy_from_slice(&resp[..buf.len()]);
                    }
                }
            }
            Ok(())
        }
    }

    #[derive(Clone, Copy, Debug, Default)]
    pub struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Scripted {
        samples: VecDeque<ClimateReading>,
    }

    impl Scripted {
        fn new(temps: &[f64]) -> Self {
            Self {
                samples: temps
                    .iter()
                    .map(|&t| ClimateReading {
                        temperature: t,
                        humidity: 50.0,
                        pressure: None,
                    })
                    .collect(),
            }
        }
    }

    impl EnvSensor for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn sample(&mut self) -> AppResult<ClimateReading> {
            // keep repeating the last sample once the script runs out
            match self.samples.len() {
                0 => Err(AppError::Sensor("empty".into())),
                1 => Ok(self.samples[0]),
                _ => Ok(self.samples.pop_front().unwrap_or_default()),
            }
        }
    }

    #[derive(Default)]
    struct FakeAir {
        ready: bool,
        env: Option<(f64, f64)>,
    }

    impl AirSensor for &mut FakeAir {
        fn data_ready(&mut self) -> AppResult<bool> {
            Ok(self.ready)
        }

        fn set_environment(&mut self, humidity: f64, temperature: f64) -> AppResult<()> {
            self.env = Some((humidity, temperature));
            Ok(())
        }

        fn read(&mut self) -> AppResult<AirReading> {
            Ok(AirReading {
                eco2: 412.0,
                tvoc: 3.0,
                error: 0,
                valid: true,
            })
        }
    }

    #[test]
    fn stable_read_averages_agreeing_samples() {
        let mut vals = vec![21.0, 22.0].into_iter();
        let v = stable_read(|| Ok(vals.next().unwrap())).unwrap();
        assert!((v - 21.5).abs() < 1e-9);
    }

    #[test]
    fn stable_read_retries_outliers() {
        let mut vals = vec![21.0, 85.0, 21.2, 21.4].into_iter();
        let v = stable_read(|| Ok(vals.next().unwrap())).unwrap();
        assert!((v - 21.3).abs() < 1e-9);
    }

    #[test]
    fn stable_read_gives_up() {
        let mut flip = false;
        let r = stable_read(|| {
            flip = !flip;
            Ok(if flip { 0.0 } else { 10.0 })
        });
        assert!(r.is_err());
    }

    #[test]
    fn poll_applies_offsets_and_compensates_air_sensor() {
        let mut air = FakeAir {
            ready: true,
            ..Default::default()
        };
        {
            let mut sensors = Sensors::default()
                .with_sht(Box::new(Scripted::new(&[20.0])))
                .with_bme2(Box::new(Scripted::new(&[25.0])))
                .with_ccs1(Box::new(&mut air));
            let cal = Calibration {
                sht_temp_off: -1.0,
                ..Default::default()
            };
            let snap = sensors.poll(&cal);

            assert_eq!(snap.sht.unwrap().temperature, 19.0);
            assert_eq!(snap.bme2.unwrap().temperature, 25.0);
            assert!(snap.bme1.is_none());
            assert_eq!(snap.ccs1.unwrap().eco2, 412.0);
            // MQTT prefers the SHT21
            assert_eq!(snap.primary_climate().unwrap().temperature, 19.0);
        }
        // compensation prefers the BME280
        assert_eq!(air.env, Some((50.0, 25.0)));
    }

    #[test]
    fn air_sensor_keeps_last_value_when_not_ready() {
        let mut air = FakeAir::default();
        let mut sensors = Sensors::default().with_ccs1(Box::new(&mut air));
        let snap = sensors.poll(&Calibration::default());
        let ccs = snap.ccs1.unwrap();
        assert!(!ccs.valid);
        assert_eq!(ccs.eco2, 0.0);
    }

    #[test]
    fn snapshot_emptiness() {
        assert!(SensorSnapshot::default().is_empty());
        assert!(Sensors::default().is_empty());
    }
}

// EOF
