// apiserver.rs

use std::sync::atomic::Ordering;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};

use crate::*;

pub type SharedState = Arc<Pin<Box<MyState>>>;

const RESET_DELAY: Duration = Duration::from_secs(2);

pub struct ClimateRow {
    pub title: &'static str,
    pub key: &'static str,
    pub temperature: String,
    pub humidity: String,
    pub pressure: Option<String>,
    pub offset: String,
}

pub struct AirRow {
    pub title: &'static str,
    pub eco2: String,
    pub tvoc: String,
    pub invalid: Option<u8>,
}

pub struct MoistureRow {
    pub sensor: usize,
    pub value: u16,
}

#[derive(Template)]
#[template(path = "index.html.ask", escape = "html")]
pub struct IndexPage {
    pub platform: &'static str,
    pub version: &'static str,
    pub build_date: &'static str,
    pub build_time: &'static str,
    pub location: String,
    pub location_id: String,
    pub mac: String,
    pub ota_slot: String,
    pub climate: Vec<ClimateRow>,
    pub missing: Vec<&'static str>,
    pub air: Vec<AirRow>,
    pub moisture_enable: bool,
    pub moisture: Vec<MoistureRow>,
    pub moisture_max: u16,
    pub relays: Vec<RelayView>,
    pub relay_all: usize,
    pub message: Option<String>,
    pub influx: Option<String>,
    pub uptime: usize,
    pub log: String,
}

#[derive(Template)]
#[template(path = "reset.html.ask", escape = "html")]
pub struct ResetPage {
    pub platform: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ApiStatus {
    pub version: &'static str,
    pub platform: &'static str,
    pub location: String,
    pub location_id: String,
    pub id: String,
    pub mac: String,
    pub ip: String,
    pub uptime: usize,
    pub sensors: SensorSnapshot,
    pub moisture: Vec<u16>,
    pub relays: Vec<RelayView>,
    pub sml: Option<SmlReading>,
    pub lora: LoraStatus,
    pub influx_errors: u32,
    pub api_cnt: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayQuery {
    pub id: Option<String>,
}

impl RelayQuery {
    /// Relay index, `None` for anything that is not a non-negative number.
    pub fn index(&self) -> Option<usize> {
        self.id.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

fn fmt2(v: f64) -> String {
    format!("{v:.2}")
}

fn climate_row(title: &'static str, key: &'static str, reading: &sensors::ClimateReading, offset: f64) -> ClimateRow {
    ClimateRow {
        title,
        key,
        temperature: fmt2(reading.temperature),
        humidity: fmt2(reading.humidity),
        pressure: reading.pressure.map(fmt2),
        offset: fmt2(offset),
    }
}

pub async fn index_page(state: &MyState, message: Option<String>) -> IndexPage {
    let config = state.config.read().await.clone();
    let cal = state.calibration.read().await.clone();
    let snapshot = state.sensors.read().await.clone();

    let mut climate = Vec::new();
    let mut missing = Vec::new();
    for (title, key, reading, offset) in [
        ("BME280 Low", "bme1", &snapshot.bme1, cal.bme1_temp_off),
        ("BME280 High", "bme2", &snapshot.bme2, cal.bme2_temp_off),
        ("SHT21", "sht", &snapshot.sht, cal.sht_temp_off),
    ] {
        match reading {
            Some(r) => climate.push(climate_row(title, key, r, offset)),
            None => missing.push(title),
        }
    }

    let mut air = Vec::new();
    for (title, reading) in [("CCS811 Low", &snapshot.ccs1), ("CCS811 High", &snapshot.ccs2)] {
        match reading {
            Some(a) => air.push(AirRow {
                title,
                eco2: format!("{:.0}", a.eco2),
                tvoc: format!("{:.0}", a.tvoc),
                invalid: (!a.valid).then_some(a.error),
            }),
            None => missing.push(title),
        }
    }

    let moisture = state
        .moisture
        .read()
        .await
        .iter()
        .enumerate()
        .filter(|(_, v)| is_connected(**v))
        .map(|(i, v)| MoistureRow {
            sensor: i + 1,
            value: *v,
        })
        .collect();

    let relays = state.relays.read().await.view();
    IndexPage {
        platform: PLATFORM_NAME,
        version: FW_VERSION,
        build_date: BUILD_DATE,
        build_time: BUILD_TIME,
        location: config.location.clone(),
        location_id: config.location_id.clone(),
        mac: state.my_mac_s.read().await.clone(),
        ota_slot: state.ota_slot.clone(),
        climate,
        missing,
        air,
        moisture_enable: config.moisture_enable,
        moisture,
        moisture_max: moisture_max(),
        relay_all: relays.len(),
        relays,
        message,
        influx: config
            .influx_enable
            .then(|| InfluxClient::from_config(&config).target()),
        uptime: *state.uptime.read().await,
        log: logbuf::contents(),
    }
}

fn render<T: Template>(page: &T) -> Response {
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            let msg = format!("Template error: {e}");
            error!("{msg}");
            (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
        }
    }
}

pub async fn get_index(State(state): State<SharedState>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    render(&index_page(&state, None).await)
}

pub async fn get_calibrate(State(state): State<SharedState>, Query(query): Query<CalibrateQuery>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);

    let snapshot = state.sensors.read().await.clone();
    let changed = state.calibration.write().await.apply(&query, &snapshot);

    let mut message = None;
    if changed {
        match state.save_calibration().await {
            Ok(()) => message = Some("New calibration value saved!".to_string()),
            Err(e) => {
                let msg = format!("Calibration save failed: {e}");
                error!("{msg}");
                return (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response();
            }
        }
    }
    render(&index_page(&state, message).await)
}

async fn switch_relays(state: &SharedState, query: RelayQuery, on: bool) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);

    let ids = set_relays(&state.relays, query.index(), on).await;
    let which = match (query.index(), ids.as_slice()) {
        (_, []) => "none".to_string(),
        (Some(id), [one]) if *one == id => id.to_string(),
        (_, [.., last]) => format!("0-{last}"),
    };
    state.influx_kick.notify_one();

    let message = format!("Turned Relais {which} {}", if on { "On" } else { "Off" });
    info!("{message}");
    render(&index_page(state, Some(message)).await)
}

pub async fn get_on(State(state): State<SharedState>, Query(query): Query<RelayQuery>) -> Response {
    switch_relays(&state, query, true).await
}

pub async fn get_off(State(state): State<SharedState>, Query(query): Query<RelayQuery>) -> Response {
    switch_relays(&state, query, false).await
}

pub async fn get_reset(State(state): State<SharedState>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("Reset requested over http.");

    let reset_state = state.clone();
    tokio::spawn(async move {
        sleep(RESET_DELAY).await;
        reset_state.schedule_reset().await;
    });
    render(&ResetPage {
        platform: PLATFORM_NAME,
    })
}

pub async fn api_status(state: &MyState) -> ApiStatus {
    let config = state.config.read().await;
    ApiStatus {
        version: FW_VERSION,
        platform: PLATFORM_NAME,
        location: config.location.clone(),
        location_id: config.location_id.clone(),
        id: state.my_id.read().await.clone(),
        mac: state.my_mac_s.read().await.clone(),
        ip: state.ip_addr.read().await.to_string(),
        uptime: *state.uptime.read().await,
        sensors: state.sensors.read().await.clone(),
        moisture: state.moisture.read().await.clone(),
        relays: state.relays.read().await.view(),
        sml: *state.sml.read().await,
        lora: state.lora.read().await.clone(),
        influx_errors: *state.influx_errors.read().await,
        api_cnt: state.api_cnt.load(Ordering::Relaxed),
    }
}

pub async fn get_api(State(state): State<SharedState>) -> Json<ApiStatus> {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    Json(api_status(&state).await)
}

pub async fn get_log() -> String {
    logbuf::contents()
}

pub async fn get_config(State(state): State<SharedState>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    let config = state.config.read().await.clone();
    render(&config)
}

pub async fn set_config(State(state): State<SharedState>, Form(form): Form<ConfigForm>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("Config update: {form:?}");

    let mut config = state.config.read().await.clone();
    if let Err(e) = config.apply_form(&form) {
        let msg = format!("Invalid config: {e}");
        error!("{msg}");
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    *state.config.write().await = config;
    if let Err(e) = state.save_config().await {
        let msg = format!("Config save failed: {e}");
        error!("{msg}");
        return (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response();
    }

    info!("Config saved, rebooting.");
    get_reset(State(state)).await
}

pub async fn update_fw(State(state): State<SharedState>, Json(fw): Json<UpdateFirmware>) -> Response {
    state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("Firmware update from {}", fw.url);

    #[cfg(target_os = "espidf")]
    let resp = match ota_update(&fw.url) {
        Ok(()) => {
            state.schedule_reset().await;
            (StatusCode::OK, "Firmware updated, rebooting.\n").into_response()
        }
        Err(e) => {
            let msg = format!("Firmware update failed: {e}");
            error!("{msg}");
            (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
        }
    };

    #[cfg(not(target_os = "espidf"))]
    let resp = (StatusCode::NOT_IMPLEMENTED, "Firmware update not supported on this platform.\n").into_response();

    resp
}

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/calibrate", get(get_calibrate))
        .route("/on", get(get_on))
        .route("/off", get(get_off))
        .route("/reset", get(get_reset))
        .route("/api", get(get_api))
        .route("/log", get(get_log))
        .route("/config", get(get_config).post(set_config))
        .route("/fw", post(update_fw))
        .with_state(state)
}

pub async fn run_api_server(state: SharedState) -> anyhow::Result<()> {
    loop {
        if *state.wifi_up.read().await {
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }

    let addr = net::SocketAddr::new(net::IpAddr::V4(net::Ipv4Addr::UNSPECIFIED), DEFAULT_API_PORT);
    info!("API server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api_router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::sensors::ClimateReading;

    fn shared(config: MyConfig) -> SharedState {
        let names = vec!["light".to_string(), "fan".to_string()];
        let state = MyState::new(
            config,
            Calibration::default(),
            Box::new(MemStore::new()),
            RelayBank::new(names, Box::new(NoRelays)),
            "ota_0 (Valid)".into(),
        );
        Arc::new(Box::pin(state))
    }

    async fn call(state: &SharedState, req: Request<Body>) -> (StatusCode, String) {
        let resp = api_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_lists_sensors_and_relays() {
        let state = shared(MyConfig {
            location: "bathroom".into(),
            ..Default::default()
        });
        state.sensors.write().await.sht = Some(ClimateReading {
            temperature: 22.5,
            humidity: 48.25,
            pressure: None,
        });

        let (status, body) = call(&state, get_req("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Location: bathroom"));
        assert!(body.contains("22.50"));
        assert!(body.contains("BME280 Low not connected!"));
        assert!(body.contains("/on?id=1"));
        assert!(body.contains("/on?id=2"));
    }

    #[tokio::test]
    async fn relay_switching() {
        let state = shared(MyConfig::default());

        let (status, body) = call(&state, get_req("/on?id=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Turned Relais 1 On"));
        assert!(state.relays.read().await.get(1));
        assert!(!state.relays.read().await.get(0));

        let (_, body) = call(&state, get_req("/on?id=7")).await;
        assert!(body.contains("Turned Relais 0-1 On"));
        assert!(state.relays.read().await.get(0));

        let (_, body) = call(&state, get_req("/off")).await;
        assert!(body.contains("Turned Relais 0-1 Off"));
        assert!(!state.relays.read().await.get(0));
        assert!(!state.relays.read().await.get(1));
    }

    #[tokio::test]
    async fn odd_relay_ids_switch_all() {
        let state = shared(MyConfig::default());
        for uri in ["/on?id=", "/on?id=-1", "/on?id=abc"] {
            state.relays.write().await.set_all(false);
            let (status, body) = call(&state, get_req(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert!(body.contains("Turned Relais 0-1 On"), "{uri}");
            assert!(state.relays.read().await.get(0));
            assert!(state.relays.read().await.get(1));
        }

        let (_, body) = call(&state, get_req("/off?id=%201")).await;
        assert!(body.contains("Turned Relais 1 Off"));
        assert!(state.relays.read().await.get(0));
    }

    #[tokio::test]
    async fn calibrate_saves_offset() {
        let state = shared(MyConfig::default());
        state.sensors.write().await.sht = Some(ClimateReading {
            temperature: 22.0,
            humidity: 50.0,
            pressure: None,
        });

        let (status, body) = call(&state, get_req("/calibrate?sht=20.5")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("New calibration value saved!"));
        assert!((state.calibration.read().await.sht_temp_off + 1.5).abs() < 1e-9);

        let stored: Option<Calibration> = load_record(&mut **state.store.lock().await, CALIBRATION_NAME);
        assert_eq!(stored, Some(state.calibration.read().await.clone()));

        // no matching sensor, nothing saved
        let (_, body) = call(&state, get_req("/calibrate?bme1=19.0")).await;
        assert!(!body.contains("New calibration value saved!"));
    }

    #[tokio::test]
    async fn api_returns_json() {
        let state = shared(MyConfig {
            location: "attic".into(),
            ..Default::default()
        });
        *state.moisture.write().await = vec![1234, 4095];

        let (status, body) = call(&state, get_req("/api")).await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["location"], "attic");
        assert_eq!(v["moisture"][0], 1234);
        assert_eq!(v["relays"][1]["name"], "fan");
        assert_eq!(v["api_cnt"], 1);
    }

    #[tokio::test]
    async fn config_post_validates_and_saves() {
        let state = shared(MyConfig::default());

        let form = "wifi_ssid=home&location=&sensor_interval=5&influx_host=h&influx_port=8086\
                    &influx_db=db&influx_interval=30&influx_max_errors=0&mqtt_url=&mqtt_interval=30\
                    &relay_mode=none&lora_role=off";
        let req = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/config")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap()
        };

        let (status, _) = call(&state, req(form.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let ok = form.replace("location=&", "location=kitchen&");
        let (status, body) = call(&state, req(ok)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Resetting in 2s"));
        assert_eq!(state.config.read().await.location, "kitchen");

        let stored: Option<MyConfig> = load_record(&mut **state.store.lock().await, CONFIG_NAME);
        assert_eq!(stored.map(|c| c.location), Some("kitchen".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_sets_flag_after_delay() {
        let state = shared(MyConfig::default());
        let (status, body) = call(&state, get_req("/reset")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("content='10; URL=/'"));
        assert!(!*state.reset.read().await);

        sleep(RESET_DELAY + Duration::from_millis(10)).await;
        assert!(*state.reset.read().await);
    }

    #[tokio::test]
    async fn firmware_update_unsupported_on_host() {
        let state = shared(MyConfig::default());
        let req = Request::builder()
            .method("POST")
            .uri("/fw")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"url":"http://10.0.0.1/fw.bin"}"#))
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }
}

// EOF
