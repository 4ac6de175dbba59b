// state.rs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::*;

pub const INFLUX_ERROR_BLINKS: u32 = 10;
pub const MQTT_QUEUE_MAX: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LedMode {
    #[default]
    Heartbeat,
    Connecting,
    Error,
}

/// Last frame seen by the LoRa gateway.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoraRx {
    pub msg_type: u8,
    pub value: f64,
    pub rssi: i16,
    pub snr: f32,
    pub uptime: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoraStatus {
    pub rx_count: u32,
    pub rx_errors: u32,
    pub tx_count: u32,
    pub last_rx: Option<LoraRx>,
}

/// Outgoing MQTT publish queued by tasks that do not own the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

pub struct MyState {
    pub ota_slot: String,
    pub config: RwLock<MyConfig>,
    pub calibration: RwLock<Calibration>,
    pub store: Mutex<Box<dyn ConfigStore>>,
    pub uptime: RwLock<usize>,
    pub api_cnt: AtomicU32,
    pub wifi_up: RwLock<bool>,
    pub ip_addr: RwLock<net::Ipv4Addr>,
    pub my_id: RwLock<String>,
    pub my_mac_s: RwLock<String>,
    pub sensors: RwLock<SensorSnapshot>,
    pub moisture: RwLock<Vec<u16>>,
    pub relays: RwLock<RelayBank>,
    pub influx_errors: RwLock<u32>,
    pub influx_kick: Notify,
    pub mqtt_queue: Mutex<VecDeque<MqttMessage>>,
    pub mqtt_kick: Notify,
    pub sml: RwLock<Option<SmlReading>>,
    pub lora: RwLock<LoraStatus>,
    pub ui: RwLock<ui::UiStatus>,
    pub led_mode: RwLock<LedMode>,
    pub led_blinks: AtomicU32,
    pub button_click: AtomicBool,
    pub reset: RwLock<bool>,
}

impl MyState {
    pub fn new(
        config: MyConfig,
        calibration: Calibration,
        store: Box<dyn ConfigStore>,
        relays: RelayBank,
        ota_slot: String,
    ) -> Self {
        MyState {
            ota_slot,
            config: RwLock::new(config),
            calibration: RwLock::new(calibration),
            store: Mutex::new(store),
            uptime: RwLock::new(0),
            api_cnt: 0.into(),
            wifi_up: RwLock::new(false),
            ip_addr: RwLock::new(net::Ipv4Addr::new(0, 0, 0, 0)),
            my_id: RwLock::new("esp-env_000000000000".into()),
            my_mac_s: RwLock::new("00:00:00:00:00:00".into()),
            sensors: RwLock::new(SensorSnapshot::default()),
            moisture: RwLock::new(Vec::new()),
            relays: RwLock::new(relays),
            influx_errors: RwLock::new(0),
            influx_kick: Notify::new(),
            mqtt_queue: Mutex::new(VecDeque::new()),
            mqtt_kick: Notify::new(),
            sml: RwLock::new(None),
            lora: RwLock::new(LoraStatus::default()),
            ui: RwLock::new(ui::UiStatus::default()),
            led_mode: RwLock::new(LedMode::default()),
            led_blinks: 0.into(),
            button_click: false.into(),
            reset: RwLock::new(false),
        }
    }

    /// Host-side state with in-memory storage and no relay hardware.
    pub fn with_defaults(config: MyConfig) -> Self {
        Self::new(
            config,
            Calibration::default(),
            Box::new(MemStore::new()),
            RelayBank::disabled(),
            "none".into(),
        )
    }

    pub async fn save_config(&self) -> AppResult<()> {
        let config = self.config.read().await.clone();
        save_record(&mut **self.store.lock().await, CONFIG_NAME, &config)
    }

    pub async fn save_calibration(&self) -> AppResult<()> {
        let cal = self.calibration.read().await.clone();
        save_record(&mut **self.store.lock().await, CALIBRATION_NAME, &cal)
    }

    pub async fn schedule_reset(&self) {
        *self.reset.write().await = true;
    }

    pub fn blink(&self, count: u32) {
        self.led_blinks.fetch_add(count, Ordering::Relaxed);
    }

    /// Take the pending error blinks for the LED task.
    pub fn take_blinks(&self) -> u32 {
        self.led_blinks.swap(0, Ordering::Relaxed)
    }

    /// True once per short press of the boot button.
    pub fn take_click(&self) -> bool {
        self.button_click.swap(false, Ordering::Relaxed)
    }

    pub async fn factory_reset(&self) -> AppResult<()> {
        let mut store = self.store.lock().await;
        save_record(&mut **store, CONFIG_NAME, &MyConfig::default())?;
        save_record(&mut **store, CALIBRATION_NAME, &Calibration::default())
    }

    /// Queue a message for the MQTT client. Dropped when MQTT is off.
    pub async fn publish(&self, topic: String, payload: String, retain: bool) {
        if !self.config.read().await.mqtt_enable {
            return;
        }
        {
            let mut queue = self.mqtt_queue.lock().await;
            if queue.len() >= MQTT_QUEUE_MAX {
                queue.pop_front();
            }
            queue.push_back(MqttMessage {
                topic,
                payload,
                retain,
            });
        }
        self.mqtt_kick.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_config() -> MyConfig {
        MyConfig {
            mqtt_enable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_queues_and_notifies() {
        let state = MyState::with_defaults(mqtt_config());
        state.publish("a/b".into(), "on".into(), true).await;

        timeout(Duration::from_millis(100), state.mqtt_kick.notified())
            .await
            .unwrap();
        let queued = state.mqtt_queue.lock().await.pop_front();
        assert_eq!(
            queued,
            Some(MqttMessage {
                topic: "a/b".into(),
                payload: "on".into(),
                retain: true,
            })
        );
    }

    #[tokio::test]
    async fn publish_is_dropped_without_mqtt_and_bounded() {
        let state = MyState::with_defaults(MyConfig {
            mqtt_enable: false,
            ui_enable: true,
            ..Default::default()
        });
        for _ in 0..3 {
            state.publish("a/b".into(), "on".into(), true).await;
        }
        assert!(state.mqtt_queue.lock().await.is_empty());

        let state = MyState::with_defaults(mqtt_config());
        for i in 0..MQTT_QUEUE_MAX + 5 {
            state.publish("a/b".into(), i.to_string(), false).await;
        }
        let queue = state.mqtt_queue.lock().await;
        assert_eq!(queue.len(), MQTT_QUEUE_MAX);
        assert_eq!(queue.front().map(|m| m.payload.as_str()), Some("5"));
    }

    #[test]
    fn blinks_and_clicks_are_taken_once() {
        let state = MyState::with_defaults(MyConfig::default());
        state.blink(3);
        state.blink(INFLUX_ERROR_BLINKS);
        assert_eq!(state.take_blinks(), 13);
        assert_eq!(state.take_blinks(), 0);

        assert!(!state.take_click());
        state.button_click.store(true, Ordering::Relaxed);
        assert!(state.take_click());
        assert!(!state.take_click());
    }

    #[tokio::test]
    async fn config_saves_and_factory_reset() {
        let state = MyState::with_defaults(MyConfig::default());
        state.config.write().await.location = "cellar".into();
        state.calibration.write().await.sht_temp_off = -1.25;
        state.save_config().await.unwrap();
        state.save_calibration().await.unwrap();

        {
            let mut store = state.store.lock().await;
            let cfg: Option<MyConfig> = load_record(&mut **store, CONFIG_NAME);
            assert_eq!(cfg.map(|c| c.location), Some("cellar".to_string()));
        }

        state.factory_reset().await.unwrap();
        let mut store = state.store.lock().await;
        let cfg: Option<MyConfig> = load_record(&mut **store, CONFIG_NAME);
        assert_eq!(cfg.map(|c| c.location), Some(MyConfig::default().location));
        let cal: Option<Calibration> = load_record(&mut **store, CALIBRATION_NAME);
        assert_eq!(cal, Some(Calibration::default()));
    }
}

// EOF
