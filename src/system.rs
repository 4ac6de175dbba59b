// system.rs

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use embedded_svc::http::{client::Client as HttpClient, Status};
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_hal::{ledc::LedcDriver, uart::UartDriver};
use esp_idf_svc::{
    http::client::{Configuration as HttpConfiguration, EspHttpConnection},
    ota::EspOta,
};
use esp_idf_sys::{self as sys, esp};

use crate::*;

const CONFIG_RESET_COUNT: i32 = 9;
const BUTTON_POLL: Duration = Duration::from_millis(50);
const RESET_STEP: Duration = Duration::from_millis(500);

const HEARTBEAT: Duration = Duration::from_millis(2000);
const HEARTBEAT_ON: Duration = Duration::from_millis(50);
const CONNECT_BLINK: Duration = Duration::from_millis(250);
const ERROR_BLINK: Duration = Duration::from_millis(100);

const OTA_CHUNK: usize = 1024;

// Heltec LoRa 32 V3: 390k/100k divider on VBAT
const VBAT_DIVIDER: f32 = 4.9;
const ADC_FULL_SCALE_V: f32 = 3.1;

#[link_section = ".rtc.data"]
static RTC_LAST_TX_MSG: AtomicU8 = AtomicU8::new(0);
#[link_section = ".rtc.data"]
static RTC_SML_COUNTER: AtomicU32 = AtomicU32::new(0);

pub async fn run_led(state: Arc<Pin<Box<MyState>>>, mut led: PinDriver<'_, AnyOutputPin, Output>) -> anyhow::Result<()> {
    loop {
        let blinks = state.take_blinks();
        for _ in 0..blinks {
            led.set_high()?;
            sleep(ERROR_BLINK).await;
            led.set_low()?;
            sleep(ERROR_BLINK).await;
        }

        let mode = *state.led_mode.read().await;
        match mode {
            LedMode::Heartbeat => {
                led.set_high()?;
                sleep(HEARTBEAT_ON).await;
                led.set_low()?;
                sleep(HEARTBEAT - HEARTBEAT_ON).await;
            }
            LedMode::Connecting => {
                led.toggle()?;
                sleep(CONNECT_BLINK).await;
            }
            LedMode::Error => {
                led.toggle()?;
                sleep(ERROR_BLINK).await;
            }
        }
    }
}

/// ADC1 oneshot reader over a fixed channel list.
pub struct EspAdc {
    handle: sys::adc_oneshot_unit_handle_t,
    channels: Vec<sys::adc_channel_t>,
}

impl EspAdc {
    pub fn new(channels: &[sys::adc_channel_t]) -> AppResult<Self> {
        let mut handle: sys::adc_oneshot_unit_handle_t = std::ptr::null_mut();
        let unit_cfg = sys::adc_oneshot_unit_init_cfg_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            ..Default::default()
        };
        esp!(unsafe { sys::adc_oneshot_new_unit(&unit_cfg, &mut handle) })?;

        let chan_cfg = sys::adc_oneshot_chan_cfg_t {
            atten: sys::adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        for ch in channels {
            esp!(unsafe { sys::adc_oneshot_config_channel(handle, *ch, &chan_cfg) })?;
        }
        Ok(Self {
            handle,
            channels: channels.to_vec(),
        })
    }
}

impl AdcSource for EspAdc {
    fn channels(&self) -> usize {
        self.channels.len()
    }

    fn read_raw(&mut self, channel: usize) -> AppResult<u16> {
        let ch = *self
            .channels
            .get(channel)
            .ok_or_else(|| AppError::Sensor(format!("No ADC channel {channel}")))?;
        let mut raw: i32 = 0;
        esp!(unsafe { sys::adc_oneshot_read(self.handle, ch, &mut raw) })?;
        Ok(raw.clamp(0, moisture_max() as i32) as u16)
    }
}

impl Drop for EspAdc {
    fn drop(&mut self) {
        unsafe { sys::adc_oneshot_del_unit(self.handle) };
    }
}

/// Relay outputs, low means on.
pub struct GpioRelays {
    pins: Vec<PinDriver<'static, AnyOutputPin, Output>>,
}

impl GpioRelays {
    pub fn new(pins: Vec<PinDriver<'static, AnyOutputPin, Output>>) -> Self {
        Self { pins }
    }
}

impl RelayDriver for GpioRelays {
    fn apply(&mut self, index: usize, on: bool) -> AppResult<()> {
        let Some(pin) = self.pins.get_mut(index) else {
            return Err(AppError::Message(format!("No relay pin {index}")));
        };
        if on {
            pin.set_low()?;
        } else {
            pin.set_high()?;
        }
        Ok(())
    }
}

/// UART as a byte stream. Reads do not block.
pub struct UartPort(pub UartDriver<'static>);

impl io::Write for UartPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.wait_tx_done(esp_idf_hal::delay::BLOCK).map_err(io::Error::other)
    }
}

impl io::Read for UartPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf, esp_idf_hal::delay::NON_BLOCK).map_err(io::Error::other)
    }
}

pub struct EspBoard {
    state: Arc<Pin<Box<MyState>>>,
    vbat: Option<EspAdc>,
    #[cfg(feature = "esp32s3")]
    temp_sensor: sys::temperature_sensor_handle_t,
}

#[cfg(feature = "esp32s3")]
fn install_temp_sensor() -> sys::temperature_sensor_handle_t {
    let mut handle: sys::temperature_sensor_handle_t = std::ptr::null_mut();
    let cfg = sys::temperature_sensor_config_t {
        range_min: -10,
        range_max: 80,
        ..Default::default()
    };
    let ok = esp!(unsafe { sys::temperature_sensor_install(&cfg, &mut handle) })
        .and_then(|_| esp!(unsafe { sys::temperature_sensor_enable(handle) }));
    match ok {
        Ok(()) => handle,
        Err(e) => {
            error!("Chip temperature sensor: {e}");
            std::ptr::null_mut()
        }
    }
}

impl EspBoard {
    pub fn new(state: Arc<Pin<Box<MyState>>>, vbat: Option<EspAdc>) -> Self {
        Self {
            state,
            vbat,
            #[cfg(feature = "esp32s3")]
            temp_sensor: install_temp_sensor(),
        }
    }
}

impl LoraBoard for EspBoard {
    fn battery_volts(&mut self) -> f32 {
        let Some(adc) = self.vbat.as_mut() else {
            return 0.0;
        };
        match adc.read_raw(0) {
            Ok(raw) => raw as f32 / moisture_max() as f32 * ADC_FULL_SCALE_V * VBAT_DIVIDER,
            Err(e) => {
                error!("VBAT read failed: {e}");
                0.0
            }
        }
    }

    #[cfg(not(feature = "esp32s3"))]
    fn chip_temperature(&mut self) -> f32 {
        0.0
    }

    #[cfg(feature = "esp32s3")]
    fn chip_temperature(&mut self) -> f32 {
        if self.temp_sensor.is_null() {
            return 0.0;
        }
        let mut celsius: f32 = 0.0;
        match esp!(unsafe { sys::temperature_sensor_get_celsius(self.temp_sensor, &mut celsius) }) {
            Ok(()) => celsius,
            Err(e) => {
                error!("Chip temperature read failed: {e}");
                0.0
            }
        }
    }

    fn button_clicked(&mut self) -> bool {
        self.state.take_click()
    }

    fn retained(&self) -> Retained {
        Retained {
            last_tx_msg: RTC_LAST_TX_MSG.load(Ordering::Relaxed),
            sml_counter: RTC_SML_COUNTER.load(Ordering::Relaxed),
        }
    }

    fn retain(&mut self, retained: Retained) {
        RTC_LAST_TX_MSG.store(retained.last_tx_msg, Ordering::Relaxed);
        RTC_SML_COUNTER.store(retained.sml_counter, Ordering::Relaxed);
    }

    fn deep_sleep(&mut self, secs: u64) {
        info!("Deep sleep for {secs}s.");
        unsafe { sys::esp_deep_sleep(secs * 1_000_000) }
    }
}

/// Boot button, light sensor and LEDC backlight next to the TFT.
pub struct EspPanelIo<'a> {
    state: Arc<Pin<Box<MyState>>>,
    held_at_boot: bool,
    ldr: Option<EspAdc>,
    backlight: LedcDriver<'a>,
}

impl<'a> EspPanelIo<'a> {
    pub fn new(state: Arc<Pin<Box<MyState>>>, held_at_boot: bool, ldr: Option<EspAdc>, backlight: LedcDriver<'a>) -> Self {
        Self {
            state,
            held_at_boot,
            ldr,
            backlight,
        }
    }
}

impl panel::PanelIo for EspPanelIo<'_> {
    fn boot_button(&mut self) -> bool {
        std::mem::take(&mut self.held_at_boot) || self.state.take_click()
    }

    fn ldr(&mut self) -> Option<i32> {
        let adc = self.ldr.as_mut()?;
        match adc.read_raw(0) {
            Ok(raw) => Some(raw as i32),
            Err(e) => {
                error!("LDR read failed: {e}");
                None
            }
        }
    }

    fn set_backlight(&mut self, level: i32) {
        let duty = self.backlight.get_max_duty() * level.clamp(0, ui::LCD_MAX_BRIGHTNESS) as u32 / ui::LCD_MAX_BRIGHTNESS as u32;
        if let Err(e) = self.backlight.set_duty(duty) {
            error!("Backlight: {e}");
        }
    }
}

/// Download an application image and write it to the next OTA slot.
pub fn ota_update(url: &str) -> AppResult<()> {
    let conf = HttpConfiguration {
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&conf)?);
    let request = client.get(url).map_err(|e| AppError::Http(format!("{e:?}")))?;
    let mut response = request.submit().map_err(|e| AppError::Http(format!("{e:?}")))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(AppError::Http(format!("Firmware download failed with HTTP {status}")));
    }

    let mut ota = EspOta::new()?;
    let mut update = ota.initiate_update()?;
    let mut chunk = [0u8; OTA_CHUNK];
    let mut total = 0usize;
    loop {
        let n = response.read(&mut chunk).map_err(|e| AppError::Http(format!("{e:?}")))?;
        if n == 0 {
            break;
        }
        update.write(&chunk[..n])?;
        total += n;
    }
    if total == 0 {
        update.abort()?;
        return Err(AppError::Http("Firmware image is empty".into()));
    }
    update.complete()?;
    info!("Firmware update written, {total} bytes.");
    Ok(())
}

pub async fn poll_reset(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    let mut uptime: usize = 0;
    loop {
        sleep(Duration::from_secs(2)).await;

        uptime += 2;
        *(state.uptime.write().await) = uptime;

        if *state.reset.read().await {
            esp_idf_hal::reset::restart();
        }
    }
}

/// Short press is a click, holding it resets the configuration.
pub async fn poll_button(state: Arc<Pin<Box<MyState>>>, button: PinDriver<'_, AnyInputPin, Input>) -> anyhow::Result<()> {
    loop {
        sleep(BUTTON_POLL).await;
        if button.is_high() {
            continue;
        }

        let mut reset_cnt = CONFIG_RESET_COUNT;
        let mut held = Duration::ZERO;
        while button.is_low() {
            sleep(BUTTON_POLL).await;
            held += BUTTON_POLL;
            if held < RESET_STEP {
                continue;
            }
            held = Duration::ZERO;

            error!("Reset? {reset_cnt}");
            if reset_cnt == 0 {
                error!("Factory resetting...");
                state.factory_reset().await?;
                sleep(Duration::from_millis(2000)).await;
                esp_idf_hal::reset::restart();
            }
            reset_cnt -= 1;
        }

        if reset_cnt == CONFIG_RESET_COUNT {
            state.button_click.store(true, Ordering::Relaxed);
        }
    }
}
// EOF
