// mqtt/client.rs

use std::sync::atomic::{AtomicBool, Ordering};

use esp_idf_svc::mqtt::{
    self,
    client::{EventPayload, MessageId},
};
use esp_idf_sys::EspError;

use crate::*;

#[allow(unreachable_code)]
pub async fn run_mqtt(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    if !state.config.read().await.mqtt_enable {
        info!("MQTT is disabled.");
        // we cannot return, otherwise tokio::select in main() will exit
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    loop {
        if *state.wifi_up.read().await {
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }

    let config = state.config.read().await.clone();
    // SAFETY: plain hardware RNG read
    let random = unsafe { esp_idf_sys::esp_random() } as u16;
    let myid = client_id(&config.location_id, random);

    sleep(Duration::from_secs(10)).await;

    info!("MQTT conn: {} [{myid}]", config.mqtt_url);
    let (client, conn) = match mqtt::client::EspAsyncMqttClient::new(
        &config.mqtt_url,
        &mqtt::client::MqttClientConfiguration {
            client_id: Some(&myid),
            keep_alive_interval: Some(Duration::from_secs(25)),
            username: (!config.mqtt_user.is_empty()).then_some(config.mqtt_user.as_str()),
            password: (!config.mqtt_pass.is_empty()).then_some(config.mqtt_pass.as_str()),
            ..Default::default()
        },
    ) {
        Ok(c) => c,
        Err(e) => {
            let emsg = format!("MQTT conn failed: {e:?}");
            error!("{emsg}");
            bail!("{emsg}");
        }
    };

    let connected = AtomicBool::new(false);
    let subscribe = Notify::new();
    tokio::select! {
        _ = Box::pin(data_sender(state.clone(), client, &connected, &subscribe)) => { error!("data_sender() ended."); }
        _ = Box::pin(event_loop(state.clone(), conn, &connected, &subscribe)) => { error!("event_loop() ended."); }
    };
    Ok(())
}

async fn data_sender(
    state: Arc<Pin<Box<MyState>>>,
    mut client: mqtt::client::EspAsyncMqttClient,
    connected: &AtomicBool,
    subscribe: &Notify,
) -> anyhow::Result<()> {
    let (location, interval) = {
        let config = state.config.read().await;
        (config.location.clone(), config.mqtt_interval.max(1) as u64)
    };
    let mut next_publish = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = subscribe.notified() => {
                for topic in subscriptions(&state).await {
                    info!("MQTT subscribe {topic}");
                    if let Err(e) = client.subscribe(&topic, mqtt::client::QoS::AtLeastOnce).await {
                        error!("MQTT subscribe error: {e}");
                    }
                }
            }
            _ = state.mqtt_kick.notified() => {}
            _ = tokio::time::sleep_until(next_publish) => {
                next_publish += Duration::from_secs(interval);
                if connected.load(Ordering::Relaxed) {
                    let snapshot = state.sensors.read().await.clone();
                    for (topic, data) in sensor_messages(&snapshot, &location) {
                        Box::pin(mqtt_send(&mut client, &topic, true, &data)).await.ok();
                    }
                }
            }
        }

        if !connected.load(Ordering::Relaxed) {
            // publishes are dropped while the broker is away
            state.mqtt_queue.lock().await.clear();
            continue;
        }
        loop {
            let Some(msg) = state.mqtt_queue.lock().await.pop_front() else {
                break;
            };
            Box::pin(mqtt_send(&mut client, &msg.topic, msg.retain, &msg.payload)).await.ok();
        }
    }
}

async fn mqtt_send(
    client: &mut mqtt::client::EspAsyncMqttClient,
    topic: &str,
    retain: bool,
    data: &str,
) -> Result<MessageId, EspError> {
    info!("MQTT sending {topic} {data}");

    let result = client
        .publish(topic, mqtt::client::QoS::AtLeastOnce, retain, data.as_bytes())
        .await;
    if let Err(e) = result {
        let msg = format!("MQTT send error: {e}");
        error!("{msg}");
    }
    result
}

async fn event_loop(
    state: Arc<Pin<Box<MyState>>>,
    mut conn: mqtt::client::EspAsyncMqttConnection,
    connected: &AtomicBool,
    subscribe: &Notify,
) -> anyhow::Result<()> {
    while let Ok(notification) = Box::pin(conn.next()).await {
        let received = match notification.payload() {
            EventPayload::Connected(_) => {
                info!("MQTT connected.");
                connected.store(true, Ordering::Relaxed);
                subscribe.notify_one();
                None
            }
            EventPayload::Disconnected => {
                warn!("MQTT disconnected.");
                connected.store(false, Ordering::Relaxed);
                None
            }
            EventPayload::Received {
                topic: Some(topic),
                data,
                ..
            } => Some((topic.to_string(), String::from_utf8_lossy(data).into_owned())),
            other => {
                debug!("MQTT event: {other:?}");
                None
            }
        };
        drop(notification);

        if let Some((topic, payload)) = received {
            handle_message(&state, &topic, &payload).await;
        }
    }

    error!("MQTT connection closed.");
    Ok(())
}
// EOF
