// config.rs

use std::fmt;

use crate::*;

pub const DEFAULT_API_PORT: u16 = 80;
pub const HOSTNAME_PREFIX: &str = "ESP-";

pub const CONFIG_NAME: &str = "cfg";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMode {
    #[default]
    None,
    Gpio,
    Serial,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraRole {
    #[default]
    Off,
    Gateway,
    Sender,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayMode::None => "none",
            RelayMode::Gpio => "gpio",
            RelayMode::Serial => "serial",
        })
    }
}

impl std::str::FromStr for RelayMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(RelayMode::None),
            "gpio" => Ok(RelayMode::Gpio),
            "serial" => Ok(RelayMode::Serial),
            other => Err(AppError::Message(format!("Unknown relay mode {other:?}"))),
        }
    }
}

impl fmt::Display for LoraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoraRole::Off => "off",
            LoraRole::Gateway => "gateway",
            LoraRole::Sender => "sender",
        })
    }
}

impl std::str::FromStr for LoraRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" => Ok(LoraRole::Off),
            "gateway" => Ok(LoraRole::Gateway),
            "sender" => Ok(LoraRole::Sender),
            other => Err(AppError::Message(format!("Unknown LoRa role {other:?}"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Template)]
#[template(path = "config.html.ask", escape = "html")]
pub struct MyConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,

    pub location: String,
    pub location_id: String,

    pub sensor_interval: u32,
    pub require_sensors: bool,
    pub moisture_enable: bool,

    pub influx_enable: bool,
    pub influx_host: String,
    pub influx_port: u16,
    pub influx_db: String,
    pub influx_interval: u32,
    pub influx_max_errors: u32,

    pub mqtt_enable: bool,
    pub mqtt_url: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_interval: u32,

    pub relay_mode: RelayMode,
    pub relay_names: Vec<String>,
    pub relay_initial: Vec<bool>,

    pub lora_role: LoraRole,
    pub lora_keep_sending: bool,
    pub lora_xor_key: String,

    pub ui_enable: bool,
}

impl Default for MyConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or("internet").into(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or("").into(),

            location: option_env!("SENSOR_LOCATION").unwrap_or("testing").into(),
            location_id: option_env!("SENSOR_ID").unwrap_or("testing").into(),

            sensor_interval: 5,
            require_sensors: false,
            moisture_enable: false,

            influx_enable: option_env!("INFLUX_HOST").is_some(),
            influx_host: option_env!("INFLUX_HOST").unwrap_or("influx.local").into(),
            influx_port: 8086,
            influx_db: option_env!("INFLUX_DB").unwrap_or("roomsensorsdiy").into(),
            influx_interval: 30,
            influx_max_errors: 0,

            mqtt_enable: option_env!("MQTT_URL").is_some(),
            mqtt_url: option_env!("MQTT_URL").unwrap_or("mqtt://mqtt.local:1883").into(),
            mqtt_user: option_env!("MQTT_USER").unwrap_or("").into(),
            mqtt_pass: option_env!("MQTT_PASS").unwrap_or("").into(),
            mqtt_interval: 30,

            relay_mode: RelayMode::None,
            relay_names: (0..4).map(|i| format!("relais_{i}")).collect(),
            relay_initial: vec![false; 4],

            lora_role: LoraRole::Off,
            lora_keep_sending: false,
            lora_xor_key: option_env!("LORA_XOR_KEY").unwrap_or("").into(),

            ui_enable: false,
        }
    }
}

pub(crate) fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    if !hex.len().is_multiple_of(2) || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

impl MyConfig {
    pub fn hostname(&self) -> String {
        format!("{HOSTNAME_PREFIX}{}", self.location_id)
    }

    /// LoRa frame obfuscation key. An empty string disables obfuscation,
    /// anything else must be exactly one frame worth of hex bytes.
    pub fn xor_key_bytes(&self) -> AppResult<Option<[u8; FRAME_LEN]>> {
        let hex = self.lora_xor_key.trim();
        if hex.is_empty() {
            return Ok(None);
        }
        let bytes = parse_hex(hex)
            .ok_or_else(|| AppError::Message(format!("LoRa XOR key is not valid hex: {hex:?}")))?;
        let key: [u8; FRAME_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            AppError::Message(format!(
                "LoRa XOR key must be {FRAME_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Some(key))
    }

    pub fn relay_names_list(&self) -> String {
        self.relay_names.join(",")
    }

    pub fn relay_initial_list(&self) -> String {
        self.relay_initial
            .iter()
            .map(|on| if *on { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn relay_initial_state(&self, index: usize) -> bool {
        self.relay_initial.get(index).copied().unwrap_or(false)
    }

    /// Apply a submitted configuration form. Nothing is changed on error.
    pub fn apply_form(&mut self, form: &ConfigForm) -> AppResult<()> {
        let mut new = self.clone();

        new.wifi_ssid = form.wifi_ssid.trim().into();
        if !form.wifi_pass.is_empty() {
            new.wifi_pass = form.wifi_pass.clone();
        }

        new.location = form.location.trim().into();
        if new.location.is_empty() {
            return Err("Location must not be empty".into());
        }
        new.location_id = match form.location_id.trim() {
            "" => new.location.clone(),
            id => id.into(),
        };

        new.sensor_interval = parse_num::<u32>(&form.sensor_interval, "sensor_interval")?.max(1);
        new.require_sensors = form.require_sensors.is_some();
        new.moisture_enable = form.moisture_enable.is_some();

        new.influx_enable = form.influx_enable.is_some();
        new.influx_host = form.influx_host.trim().into();
        new.influx_port = parse_num(&form.influx_port, "influx_port")?;
        new.influx_db = form.influx_db.trim().into();
        new.influx_interval = parse_num::<u32>(&form.influx_interval, "influx_interval")?.max(1);
        new.influx_max_errors = parse_num(&form.influx_max_errors, "influx_max_errors")?;

        new.mqtt_enable = form.mqtt_enable.is_some();
        new.mqtt_url = form.mqtt_url.trim().into();
        new.mqtt_user = form.mqtt_user.trim().into();
        if !form.mqtt_pass.is_empty() {
            new.mqtt_pass = form.mqtt_pass.clone();
        }
        new.mqtt_interval = parse_num::<u32>(&form.mqtt_interval, "mqtt_interval")?.max(1);

        new.relay_mode = form.relay_mode.parse()?;
        new.relay_names = split_list(&form.relay_names);
        new.relay_initial = split_list(&form.relay_initial)
            .iter()
            .map(|s| matches!(s.as_str(), "1" | "on" | "true"))
            .collect();

        new.lora_role = form.lora_role.parse()?;
        new.lora_keep_sending = form.lora_keep_sending.is_some();
        new.lora_xor_key = form.lora_xor_key.trim().into();
        new.xor_key_bytes()?;

        new.ui_enable = form.ui_enable.is_some();

        *self = new;
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, name: &str) -> AppResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Message(format!("Invalid number for {name}: {value:?}")))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Urlencoded body of `POST /config`. Checkboxes are only present when set.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigForm {
    pub wifi_ssid: String,
    #[serde(default)]
    pub wifi_pass: String,
    pub location: String,
    #[serde(default)]
    pub location_id: String,
    pub sensor_interval: String,
    pub require_sensors: Option<String>,
    pub moisture_enable: Option<String>,
    pub influx_enable: Option<String>,
    pub influx_host: String,
    pub influx_port: String,
    pub influx_db: String,
    pub influx_interval: String,
    pub influx_max_errors: String,
    pub mqtt_enable: Option<String>,
    pub mqtt_url: String,
    #[serde(default)]
    pub mqtt_user: String,
    #[serde(default)]
    pub mqtt_pass: String,
    pub mqtt_interval: String,
    pub relay_mode: String,
    #[serde(default)]
    pub relay_names: String,
    #[serde(default)]
    pub relay_initial: String,
    pub lora_role: String,
    pub lora_keep_sending: Option<String>,
    #[serde(default)]
    pub lora_xor_key: String,
    pub ui_enable: Option<String>,
}


// EOF
