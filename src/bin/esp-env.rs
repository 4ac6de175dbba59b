// bin/esp-env.rs

#![warn(clippy::large_futures)]

#[cfg(target_os = "espidf")]
use std::{cell::RefCell, io};

#[cfg(target_os = "espidf")]
use esp_idf_hal::{
    delay::Delay,
    gpio::AnyIOPin,
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    uart::{self, UartDriver},
};
#[cfg(target_os = "espidf")]
use mipidsi::{
    interface::SpiInterface,
    models::ILI9341Rgb565,
    options::{ColorOrder, Orientation, Rotation},
};
#[cfg(target_os = "espidf")]
use esp_idf_svc::{eventloop::EspSystemEventLoop, ota::EspOta, timer::EspTaskTimerService, wifi::WifiDriver};
#[cfg(target_os = "espidf")]
use esp_idf_sys::esp;
#[cfg(target_os = "espidf")]
use esp_env::*;

// ADC1 channels 1..=6 are GPIO2..GPIO7 on the S3
#[cfg(target_os = "espidf")]
const MOISTURE_ADC_CHANNELS: [u32; MOISTURE_CHANNELS] = [1, 2, 3, 4, 5, 6];
#[cfg(target_os = "espidf")]
const VBAT_ADC_CHANNEL: u32 = 0;
#[cfg(target_os = "espidf")]
const SML_BAUDRATE: u32 = 9600;
#[cfg(target_os = "espidf")]
const RELAY_BAUDRATE: u32 = 115_200;
// the light sensor shares ADC1 channel 0 with the battery divider
#[cfg(target_os = "espidf")]
const LDR_ADC_CHANNEL: u32 = 0;
#[cfg(target_os = "espidf")]
const PANEL_SPI_BUFFER: usize = 512;
// InfluxDB writes run on the blocking pool
#[cfg(target_os = "espidf")]
const BLOCKING_STACK_SIZE: usize = 16 * 1024;

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    if logbuf::init(esp_idf_svc::log::EspLogger::new(), LevelFilter::Info).is_err() {
        esp_idf_svc::log::EspLogger::initialize_default();
    }

    #[allow(clippy::needless_update)]
    let config = esp_idf_sys::esp_vfs_eventfd_config_t {
        max_fds: 2,
        ..Default::default()
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_eventfd_register(&config) } }?;

    info!("Hello.");
    info!("Starting up {PLATFORM_NAME} v{FW_VERSION} ({BUILD_DATE} {BUILD_TIME}).");

    let sysloop = EspSystemEventLoop::take()?;
    let timer = EspTaskTimerService::new()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;

    let ns = env!("CARGO_BIN_NAME");
    let nvs = match nvs::EspNvs::new(nvs_default_partition.clone(), ns, true) {
        Ok(nvs) => {
            info!("Got namespace {ns:?} from default partition");
            nvs
        }
        Err(e) => panic!("Could not get namespace {ns}: {e:?}"),
    };
    let mut store = NvsStore::new(nvs);

    let config: MyConfig = load_or_default(&mut store, CONFIG_NAME)?;
    let calibration: Calibration = load_or_default(&mut store, CALIBRATION_NAME)?;
    info!("My config:\n{config:#?}");

    let ota_slot = {
        let mut ota = EspOta::new()?;
        let running_slot = ota.get_running_slot()?;
        ota.mark_running_slot_valid()?;
        let slot = format!("{} ({:?})", &running_slot.label, running_slot.state);
        info!("OTA slot: {slot}");
        slot
    };

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let button = PinDriver::input(pins.gpio0.downgrade_input())?;
    let button_held = button.is_low();
    let led = PinDriver::output(pins.gpio35.downgrade_output())?;

    // I2C: GPIO41=SDA, GPIO42=SCL
    let i2c_cfg = I2cConfig::new().baudrate(100.kHz().into());
    let i2c = I2cDriver::new(peripherals.i2c0, pins.gpio41, pins.gpio42, &i2c_cfg)?;
    let bus = critical_section::Mutex::new(RefCell::new(i2c));
    let sensors = Sensors::probe(&bus, Delay::new_default());
    let sensors_missing = sensors.is_empty();

    let relay_driver: Box<dyn RelayDriver + Send> = match config.relay_mode {
        RelayMode::None => Box::new(NoRelays),
        RelayMode::Gpio => {
            let relay_pins = vec![
                PinDriver::output(pins.gpio33.downgrade_output())?,
                PinDriver::output(pins.gpio34.downgrade_output())?,
                PinDriver::output(pins.gpio38.downgrade_output())?,
                PinDriver::output(pins.gpio39.downgrade_output())?,
            ];
            Box::new(GpioRelays::new(relay_pins))
        }
        RelayMode::Serial => {
            // UART1 TX on GPIO19
            let uart_cfg = uart::config::Config::new().baudrate(Hertz(RELAY_BAUDRATE));
            let uart = UartDriver::new(
                peripherals.uart1,
                pins.gpio19,
                pins.gpio40,
                Option::<AnyIOPin>::None,
                Option::<AnyIOPin>::None,
                &uart_cfg,
            )?;
            Box::new(SerialRelays::new(UartPort(uart)))
        }
    };
    let mut relays = RelayBank::new(config.relay_names.clone(), relay_driver);
    relays.init(&config);

    let lora_role = config.lora_role;
    let moisture = match (config.moisture_enable, lora_role) {
        (false, _) => None,
        (true, LoraRole::Sender) => {
            warn!("Moisture probes share the ADC with the battery monitor, disabled.");
            None
        }
        (true, _) => Some(Moisture::new(EspAdc::new(&MOISTURE_ADC_CHANNELS)?)),
    };

    // UART2 RX on GPIO20 (TX GPIO21 unused) reads the meter's optical head
    let meter: Box<dyn io::Read> = if lora_role == LoraRole::Sender {
        let uart_cfg = uart::config::Config::new().baudrate(Hertz(SML_BAUDRATE));
        let uart = UartDriver::new(
            peripherals.uart2,
            pins.gpio21,
            pins.gpio20,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &uart_cfg,
        )?;
        Box::new(UartPort(uart))
    } else {
        Box::new(io::empty())
    };

    // LoRa SPI pins: GPIO9=SCK, GPIO10=MOSI, GPIO11=MISO, GPIO8=NSS, GPIO12=RST, GPIO13=BUSY
    let spi_driver = spi::SpiDriver::new(
        peripherals.spi2,
        pins.gpio9,
        pins.gpio10,
        Some(pins.gpio11),
        &spi::SpiDriverConfig::new(),
    )?;
    let radio = if lora_role == LoraRole::Off {
        None
    } else {
        let spi_cfg = spi::config::Config::new().baudrate(8.MHz().into());
        let dev = spi::SpiDeviceDriver::new(&spi_driver, Some(pins.gpio8), &spi_cfg)?;
        let busy = PinDriver::input(pins.gpio13.downgrade_input())?;
        let reset = PinDriver::output(pins.gpio12.downgrade_output())?;
        let mut radio = Sx1262Radio::new(dev, busy, reset);
        match radio.init() {
            Ok(()) => Some(radio),
            Err(e) => {
                error!("LoRa radio init failed: {e}");
                None
            }
        }
    };
    let vbat = match lora_role {
        LoraRole::Sender => EspAdc::new(&[VBAT_ADC_CHANNEL]).ok(),
        _ => None,
    };

    let wifidriver = WifiDriver::new(peripherals.modem, sysloop.clone(), Some(nvs_default_partition))?;

    let ui_enable = config.ui_enable;
    let hostname = config.hostname();
    let ldr_free = moisture.is_none() && lora_role != LoraRole::Sender;
    let require_sensors = config.require_sensors;
    let state = Box::pin(MyState::new(config, calibration, Box::new(store), relays, ota_slot));
    let shared_state = Arc::new(state);
    let board = EspBoard::new(shared_state.clone(), vbat);

    // Panel SPI: GPIO14=SCK, GPIO15=MOSI, GPIO16=MISO, GPIO17=TFT CS, GPIO18=DC, GPIO47=touch CS
    let panel_spi = spi::SpiDriver::new(
        peripherals.spi3,
        pins.gpio14,
        pins.gpio15,
        Some(pins.gpio16),
        &spi::SpiDriverConfig::new(),
    )?;
    // backlight PWM on GPIO45
    let backlight_timer = LedcTimerDriver::new(peripherals.ledc.timer0, &TimerConfig::new().frequency(5.kHz().into()))?;
    let ui = if ui_enable {
        let tft_cfg = spi::config::Config::new().baudrate(40.MHz().into());
        let tft = spi::SpiDeviceDriver::new(&panel_spi, Some(pins.gpio17), &tft_cfg)?;
        let dc = PinDriver::output(pins.gpio18.downgrade_output())?;
        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; PANEL_SPI_BUFFER]));
        let display = mipidsi::Builder::new(ILI9341Rgb565, SpiInterface::new(tft, dc, buffer))
            .orientation(Orientation::new().rotate(Rotation::Deg90))
            .color_order(ColorOrder::Bgr)
            .init(&mut Delay::new_default())
            .map_err(|e| anyhow::anyhow!("Display init failed: {e:?}"))?;

        let touch_cfg = spi::config::Config::new().baudrate(2.MHz().into());
        let touch = spi::SpiDeviceDriver::new(&panel_spi, Some(pins.gpio47), &touch_cfg)?;
        let backlight = LedcDriver::new(peripherals.ledc.channel0, &backlight_timer, pins.gpio45)?;
        let ldr = if ldr_free {
            EspAdc::new(&[LDR_ADC_CHANNEL]).ok()
        } else {
            None
        };
        let io = EspPanelIo::new(shared_state.clone(), button_held, ldr, backlight);
        Some(panel::Panel::new(display, touch, io, &hostname))
    } else {
        None
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_stack_size(BLOCKING_STACK_SIZE)
        .build()?
        .block_on(Box::pin(async move {
            if sensors_missing && require_sensors {
                error!("No sensors found, refusing to run.");
                *shared_state.led_mode.write().await = LedMode::Error;
                let _ = Box::pin(run_led(shared_state.clone(), led)).await;
                return;
            }

            let wifi_loop = WifiLoop {
                state: shared_state.clone(),
                wifi: None,
            };

            info!("Entering main loop...");
            tokio::select! {
                _ = Box::pin(poll_reset(shared_state.clone())) => { error!("poll_reset() ended."); }
                _ = Box::pin(poll_button(shared_state.clone(), button)) => { error!("poll_button() ended."); }
                _ = Box::pin(run_led(shared_state.clone(), led)) => { error!("run_led() ended."); }
                _ = Box::pin(poll_sensors(shared_state.clone(), sensors)) => { error!("poll_sensors() ended."); }
                _ = Box::pin(poll_moisture(shared_state.clone(), moisture)) => { error!("poll_moisture() ended."); }
                _ = Box::pin(run_influx(shared_state.clone())) => { error!("run_influx() ended."); }
                _ = Box::pin(run_mqtt(shared_state.clone())) => { error!("run_mqtt() ended."); }
                _ = Box::pin(run_api_server(shared_state.clone())) => { error!("run_api_server() ended."); }
                _ = Box::pin(run_lora(shared_state.clone(), radio, board, meter)) => { error!("run_lora() ended."); }
                _ = Box::pin(ui::run_ui(shared_state.clone(), ui)) => { error!("run_ui() ended."); }
                _ = Box::pin(wifi_loop.run(wifidriver, sysloop, timer)) => { error!("wifi_loop.run() ended."); }
            };
        }));

    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    esp_idf_hal::reset::restart();
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("esp-env runs on ESP-IDF targets only, build with --target xtensa-esp32s3-espidf.");
}
// EOF
