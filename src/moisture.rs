// moisture.rs

use crate::*;

pub const MOISTURE_CHANNELS: usize = 6;
pub const ADC_OVERSAMPLE: u32 = 20;
pub const ADC_BITWIDTH: u32 = 12;

// 10-bit ADC readings above this are noise on a dry/unplugged probe
const SCALE_10BIT_CLAMP: u16 = 1010;

/// Raw analog input, one reading per call.
pub trait AdcSource {
    fn channels(&self) -> usize;
    fn read_raw(&mut self, channel: usize) -> AppResult<u16>;
}

pub const fn moisture_max() -> u16 {
    (1 << ADC_BITWIDTH) - 1
}

/// A probe reading at (or above) full scale means nothing is connected.
pub fn is_connected(value: u16) -> bool {
    value < moisture_max()
}

/// Stretch a 10-bit reading onto the 12-bit range.
pub fn scale_10bit(raw: u16) -> u16 {
    let v = if raw >= SCALE_10BIT_CLAMP { 1023 } else { raw & 0x3FF };
    (v << 2) | 3
}

pub struct Moisture<A> {
    adc: A,
    oversample: u32,
}

impl<A: AdcSource> Moisture<A> {
    pub fn new(adc: A) -> Self {
        Self::with_oversample(adc, ADC_OVERSAMPLE)
    }

    pub fn with_oversample(adc: A, oversample: u32) -> Self {
        Self {
            adc,
            oversample: oversample.max(1),
        }
    }

    pub fn count(&self) -> usize {
        self.adc.channels()
    }

    /// Averaged reading of one probe.
    pub fn read(&mut self, sensor: usize) -> AppResult<u16> {
        if sensor >= self.count() {
            return Err(AppError::Sensor(format!("No moisture sensor {sensor}")));
        }

        let mut sum: u32 = 0;
        for _ in 0..self.oversample {
            sum += u32::from(self.adc.read_raw(sensor)?);
        }
        Ok((sum / self.oversample) as u16)
    }

    pub fn read_all(&mut self) -> Vec<u16> {
        (0..self.count())
            .map(|i| match self.read(i) {
                Ok(v) => v,
                Err(e) => {
                    error!("Moisture sensor {i}: {e}");
                    moisture_max()
                }
            })
            .collect()
    }
}

pub async fn poll_moisture<A: AdcSource>(
    state: Arc<Pin<Box<MyState>>>,
    moisture: Option<Moisture<A>>,
) -> anyhow::Result<()> {
    let Some(mut moisture) = moisture else {
        info!("Moisture sensors are disabled.");
        // we cannot return, otherwise tokio::select in main() will exit
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    };

    loop {
        let values = moisture.read_all();
        debug!("Moisture: {values:?}");
        *state.moisture.write().await = values;

        let interval = state.config.read().await.sensor_interval;
        sleep(Duration::from_secs(interval.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ramp {
        values: Vec<Vec<u16>>,
        pos: Vec<usize>,
    }

    impl AdcSource for Ramp {
        fn channels(&self) -> usize {
            self.values.len()
        }

        fn read_raw(&mut self, channel: usize) -> AppResult<u16> {
            let v = &self.values[channel];
            let r = v[self.pos[channel] % v.len()];
            self.pos[channel] += 1;
            Ok(r)
        }
    }

    #[test]
    fn max_is_twelve_bits() {
        assert_eq!(moisture_max(), 4095);
        assert!(is_connected(2000));
        assert!(!is_connected(4095));
    }

    #[test]
    fn scale_10bit_clamps_noise() {
        assert_eq!(scale_10bit(0), 3);
        assert_eq!(scale_10bit(512), 2051);
        assert_eq!(scale_10bit(1009), 4039);
        assert_eq!(scale_10bit(1010), 4095);
        assert_eq!(scale_10bit(1023), 4095);
    }

    #[test]
    fn read_averages_oversampled_values() {
        let adc = Ramp {
            values: vec![vec![100, 200], vec![4095]],
            pos: vec![0, 0],
        };
        let mut m = Moisture::with_oversample(adc, 4);
        assert_eq!(m.count(), 2);
        assert_eq!(m.read(0).unwrap(), 150);
        assert_eq!(m.read_all(), vec![150, 4095]);
        assert!(m.read(2).is_err());
    }
}

// EOF
