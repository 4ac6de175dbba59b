// lib.rs
#![warn(clippy::large_futures)]

pub use std::{net, pin::Pin, sync::Arc};

pub use anyhow::bail;
pub use askama::Template;
pub use chrono::*;
pub use log::*;
pub use serde::{Deserialize, Serialize};
pub use tokio::sync::{Mutex, Notify, RwLock};
pub use tokio::time::{sleep, timeout, Duration};

#[cfg(target_os = "espidf")]
pub use esp_idf_hal::prelude::*;
#[cfg(target_os = "espidf")]
pub use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyInputPin, AnyOutputPin, Input, InputPin, Output, OutputPin, PinDriver},
    spi,
};
#[cfg(target_os = "espidf")]
pub use esp_idf_svc::nvs;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

#[cfg(feature = "esp32s3")]
pub const PLATFORM_NAME: &str = "ESP32-S3";
#[cfg(not(feature = "esp32s3"))]
pub const PLATFORM_NAME: &str = "ESP32";

#[derive(Debug, Deserialize)]
pub struct UpdateFirmware {
    pub url: String,
}

mod error;
pub use error::*;

pub mod logbuf;

mod config;
pub use config::*;

mod storage;
pub use storage::*;

mod calibration;
pub use calibration::*;

pub mod sensors;
pub use sensors::{poll_sensors, SensorSnapshot, Sensors};

mod moisture;
pub use moisture::*;

mod relays;
pub use relays::*;

mod state;
pub use state::*;

mod influx;
pub use influx::*;

pub mod mqtt;
pub use mqtt::*;

mod telemetry;
pub use telemetry::*;

mod scheduler;
pub use scheduler::*;

pub mod sml;
pub use sml::{SmlReader, SmlReading};

mod lora;
pub use lora::*;

mod apiserver;
pub use apiserver::*;

pub mod ui;

pub mod panel;

#[cfg(target_os = "espidf")]
pub mod sx1262;
#[cfg(target_os = "espidf")]
pub use sx1262::Sx1262Radio;

#[cfg(target_os = "espidf")]
mod wifi;
#[cfg(target_os = "espidf")]
pub use wifi::*;

#[cfg(target_os = "espidf")]
mod system;
#[cfg(target_os = "espidf")]
pub use system::*;

// EOF
