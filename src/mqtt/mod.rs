// mqtt/mod.rs

use crate::*;

#[cfg(target_os = "espidf")]
mod client;
#[cfg(target_os = "espidf")]
pub use client::run_mqtt;

pub fn client_id(location_id: &str, random: u16) -> String {
    format!("{HOSTNAME_PREFIX}{location_id}-{random:x}")
}

pub fn topic(location: &str, leaf: &str) -> String {
    format!("{location}/{leaf}")
}

fn value(v: f64) -> String {
    format!("{v:.2}")
}

/// Retained sensor values. Climate comes from the SHT21 when present, pressure
/// only from a BME280.
pub fn sensor_messages(snapshot: &SensorSnapshot, location: &str) -> Vec<(String, String)> {
    let mut msgs = Vec::new();

    if let Some(c) = snapshot.primary_climate() {
        msgs.push((topic(location, "temperature"), value(c.temperature)));
        msgs.push((topic(location, "humidity"), value(c.humidity)));
        if let Some(p) = c.pressure {
            msgs.push((topic(location, "pressure"), value(p)));
        }
    }

    if let Some(a) = snapshot.primary_air() {
        msgs.push((topic(location, "eco2"), value(a.eco2)));
        msgs.push((topic(location, "tvoc"), value(a.tvoc)));
    }
    msgs
}

pub fn relay_topics(location: &str, relays: &RelayBank) -> Vec<String> {
    relays.names().iter().map(|n| topic(location, n)).collect()
}

/// `on` wins over `off`, anything else is not a command.
pub fn parse_switch(payload: &str) -> Option<bool> {
    if payload.contains("on") {
        Some(true)
    } else if payload.contains("off") {
        Some(false)
    } else {
        None
    }
}

/// Relay switched by a `<location>/<relay name>` message.
pub fn route_relay(location: &str, topic: &str, payload: &str, relays: &RelayBank) -> Option<(usize, bool)> {
    let Some(name) = topic.strip_prefix(location).and_then(|t| t.strip_prefix('/')) else {
        warn!("Unknown MQTT room {topic}");
        return None;
    };
    let Some(id) = relays.index_of(name) else {
        warn!("Unknown MQTT topic {topic}");
        return None;
    };
    let on = parse_switch(payload)?;

    info!("Turning {} relais {id}", if on { "on" } else { "off" });
    Some((id, on))
}

/// Incoming message dispatch: UI mirror first, then relays.
pub async fn handle_message(state: &MyState, topic: &str, payload: &str) {
    info!("MQTT Rx @ {topic:?} = {payload:?}");

    if state.config.read().await.ui_enable && state.ui.write().await.apply_mqtt(topic, payload) {
        return;
    }

    let location = state.config.read().await.location.clone();
    let routed = route_relay(&location, topic, payload, &*state.relays.read().await);
    if let Some((id, on)) = routed {
        set_relays(&state.relays, Some(id), on).await;
        state.influx_kick.notify_one();
    }
}

/// Everything to subscribe to.
pub async fn subscriptions(state: &MyState) -> Vec<String> {
    let config = state.config.read().await.clone();
    let mut topics = relay_topics(&config.location, &*state.relays.read().await);
    if config.ui_enable {
        topics.extend(ui::UiStatus::topics().into_iter().map(String::from));
    }
    topics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{AirReading, ClimateReading};

    fn relays() -> RelayBank {
        let names = ["light_small", "light_big", "relais_2", "fan"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        RelayBank::new(names, Box::new(NoRelays))
    }

    #[test]
    fn client_id_format() {
        assert_eq!(client_id("bath", 0xBEEF), "ESP-bath-beef");
        assert_eq!(client_id("bath", 0x0A), "ESP-bath-a");
    }

    #[test]
    fn sht_preferred_for_climate() {
        let snapshot = SensorSnapshot {
            bme1: Some(ClimateReading {
                temperature: 20.0,
                humidity: 45.0,
                pressure: Some(1001.5),
            }),
            sht: Some(ClimateReading {
                temperature: 21.456,
                humidity: 50.0,
                pressure: None,
            }),
            ccs2: Some(AirReading {
                eco2: 612.0,
                tvoc: 31.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let msgs = sensor_messages(&snapshot, "bathroom");
        assert_eq!(
            msgs,
            vec![
                ("bathroom/temperature".to_string(), "21.46".to_string()),
                ("bathroom/humidity".to_string(), "50.00".to_string()),
                ("bathroom/eco2".to_string(), "612.00".to_string()),
                ("bathroom/tvoc".to_string(), "31.00".to_string()),
            ]
        );
    }

    #[test]
    fn bme_includes_pressure() {
        let snapshot = SensorSnapshot {
            bme2: Some(ClimateReading {
                temperature: 19.0,
                humidity: 60.0,
                pressure: Some(998.25),
            }),
            ..Default::default()
        };
        let msgs = sensor_messages(&snapshot, "attic");
        assert_eq!(msgs[2], ("attic/pressure".to_string(), "998.25".to_string()));
        assert!(sensor_messages(&SensorSnapshot::default(), "attic").is_empty());
    }

    #[test]
    fn routes_relay_commands() {
        let r = relays();
        assert_eq!(route_relay("bathroom", "bathroom/fan", "on", &r), Some((3, true)));
        assert_eq!(route_relay("bathroom", "bathroom/fan", "turn off", &r), Some((3, false)));

        assert_eq!(route_relay("bathroom", "bathroom/fan", "toggle", &r), None);
        assert_eq!(route_relay("bathroom", "kitchen/fan", "on", &r), None);
        assert_eq!(route_relay("bathroom", "bathroom/heater", "on", &r), None);
        assert_eq!(route_relay("bathroom", "bathroomfan", "on", &r), None);
    }

    #[test]
    fn subscribes_to_every_relay() {
        assert_eq!(
            relay_topics("bathroom", &relays()),
            vec!["bathroom/light_small", "bathroom/light_big", "bathroom/relais_2", "bathroom/fan"]
        );
    }

    #[tokio::test]
    async fn handle_message_switches_and_kicks_influx() {
        let state = MyState::new(
            MyConfig {
                location: "bathroom".into(),
                ..Default::default()
            },
            Calibration::default(),
            Box::new(MemStore::new()),
            relays(),
            "none".into(),
        );

        handle_message(&state, "bathroom/light_big", "on").await;
        assert!(state.relays.read().await.get(1));
        // the stored permit makes this resolve immediately
        timeout(Duration::from_millis(100), state.influx_kick.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handle_message_mirrors_ui_topics() {
        let state = MyState::with_defaults(MyConfig {
            ui_enable: true,
            ..Default::default()
        });
        handle_message(&state, "livingroom/light_box", "on").await;
        assert!(state.ui.read().await.light_box);
        assert!(subscriptions(&state).await.contains(&"livingroom/light_box".to_string()));
    }
}

// EOF
