// influx.rs

use std::fmt::Write as _;

use embedded_svc::http::client::{Client as HttpClient, Connection};
use embedded_svc::http::{Headers as _, Status as _};
use embedded_svc::io::Write as _;

use crate::*;

pub const INFLUX_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(v.into())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// One line of InfluxDB line protocol, server timestamped.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

const MEASUREMENT_SPECIAL: &[char] = &[',', ' '];
const KEY_SPECIAL: &[char] = &[',', '=', ' '];

impl Point {
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn tag<V: ToString>(mut self, key: &str, value: V) -> Self {
        self.tags.push((key.into(), value.to_string()));
        self
    }

    pub fn field<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(128);
        escape_into(&mut line, &self.measurement, MEASUREMENT_SPECIAL);

        for (k, v) in &self.tags {
            line.push(',');
            escape_into(&mut line, k, KEY_SPECIAL);
            line.push('=');
            escape_into(&mut line, v, KEY_SPECIAL);
        }

        for (i, (k, v)) in self.fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            escape_into(&mut line, k, KEY_SPECIAL);
            line.push('=');
            // writing into a String cannot fail
            let _ = match v {
                FieldValue::Float(f) => write!(line, "{f}"),
                FieldValue::Int(n) => write!(line, "{n}i"),
                FieldValue::Bool(b) => write!(line, "{b}"),
            };
        }
        line
    }
}

/// Point with the tags every measurement of this node carries.
pub fn base_point(measurement: &str, config: &MyConfig) -> Point {
    Point::new(measurement)
        .tag("location", &config.location)
        .tag("location-id", &config.location_id)
}

fn climate_point(
    config: &MyConfig,
    mac: &str,
    sensor: &str,
    placement: Option<&str>,
    r: &sensors::ClimateReading,
) -> Point {
    let mut p = base_point("environment", config);
    if let Some(placement) = placement {
        p = p.tag("placement", placement);
    }
    let mut p = p
        .tag("sensor", sensor)
        .tag("device", mac)
        .field("temperature", r.temperature);
    if let Some(pressure) = r.pressure {
        p = p.field("pressure", pressure);
    }
    p.field("humidity", r.humidity)
}

fn air_point(config: &MyConfig, mac: &str, placement: &str, r: &sensors::AirReading) -> Point {
    base_point("environment", config)
        .tag("placement", placement)
        .tag("sensor", "ccs811")
        .tag("error", r.error)
        .tag("device", mac)
        .field("eco2", r.eco2)
        .field("tvoc", r.tvoc)
}

pub fn environment_points(snapshot: &SensorSnapshot, config: &MyConfig, mac: &str) -> Vec<Point> {
    let mut points = Vec::new();
    if let Some(r) = &snapshot.bme1 {
        points.push(climate_point(config, mac, "bme280", Some("1"), r));
    }
    if let Some(r) = &snapshot.bme2 {
        points.push(climate_point(config, mac, "bme280", Some("2"), r));
    }
    if let Some(r) = &snapshot.sht {
        points.push(climate_point(config, mac, "sht21", None, r));
    }
    if let Some(r) = &snapshot.ccs1 {
        points.push(air_point(config, mac, "1", r));
    }
    if let Some(r) = &snapshot.ccs2 {
        points.push(air_point(config, mac, "2", r));
    }
    points
}

/// Connected probes only, numbered from 1.
pub fn moisture_points(values: &[u16], config: &MyConfig, mac: &str) -> Vec<Point> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| is_connected(**v))
        .map(|(i, v)| {
            base_point("moisture", config)
                .tag("sensor", i + 1)
                .tag("device", mac)
                .field("value", *v)
                .field("maximum", moisture_max())
        })
        .collect()
}

pub fn relay_points(relays: &RelayBank, config: &MyConfig, mac: &str) -> Vec<Point> {
    relays
        .view()
        .into_iter()
        .map(|r| {
            base_point("relais", config)
                .tag("id", r.id)
                .tag("name", r.name)
                .tag("device", mac)
                .field("state", i32::from(r.state))
        })
        .collect()
}

pub struct InfluxClient {
    host: String,
    port: u16,
    db: String,
    timeout: Duration,
}

impl InfluxClient {
    pub fn new(host: &str, port: u16, db: &str) -> Self {
        Self {
            host: host.into(),
            port,
            db: db.into(),
            timeout: INFLUX_TIMEOUT,
        }
    }

    pub fn from_config(config: &MyConfig) -> Self {
        Self::new(&config.influx_host, config.influx_port, &config.influx_db)
    }

    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn write_url(&self) -> String {
        format!("http://{}:{}/write?db={}", self.host, self.port, self.db)
    }

    /// The HTTP client blocks, it runs on the blocking pool.
    pub async fn write(&self, points: &[Point]) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points.iter().map(Point::to_line).collect::<Vec<_>>().join("\n");
        let url = self.write_url();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || post_lines(connect(timeout)?, &url, &body))
            .await
            .map_err(|e| AppError::Message(format!("InfluxDB writer: {e}")))?
    }
}

#[cfg(target_os = "espidf")]
fn connect(timeout: Duration) -> AppResult<esp_idf_svc::http::client::EspHttpConnection> {
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

    let conf = Configuration {
        timeout: Some(timeout),
        ..Default::default()
    };
    Ok(EspHttpConnection::new(&conf)?)
}

#[cfg(not(target_os = "espidf"))]
fn connect(_timeout: Duration) -> AppResult<NoConnection> {
    Err(AppError::Http("no HTTP client on this platform".into()))
}

/// Placeholder connection type for builds without ESP-IDF.
#[cfg(not(target_os = "espidf"))]
pub enum NoConnection {}

#[cfg(not(target_os = "espidf"))]
mod no_connection {
    use embedded_svc::http::client::Connection;
    use embedded_svc::http::{Headers, Method, Status};
    use embedded_svc::io::{ErrorKind, ErrorType, Read, Write};

    use super::NoConnection;

    impl ErrorType for NoConnection {
        type Error = ErrorKind;
    }

    impl Read for NoConnection {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ErrorKind> {
            match *self {}
        }
    }

    impl Write for NoConnection {
        fn write(&mut self, _buf: &[u8]) -> Result<usize, ErrorKind> {
            match *self {}
        }

        fn flush(&mut self) -> Result<(), ErrorKind> {
            match *self {}
        }
    }

    impl Status for NoConnection {
        fn status(&self) -> u16 {
            match *self {}
        }

        fn status_message(&self) -> Option<&'_ str> {
            match *self {}
        }
    }

    impl Headers for NoConnection {
        fn header(&self, _name: &str) -> Option<&'_ str> {
            match *self {}
        }
    }

    impl Connection for NoConnection {
        type Headers = Self;
        type Read = Self;
        type RawConnectionError = ErrorKind;
        type RawConnection = Self;

        fn initiate_request<'a>(
            &'a mut self,
            _method: Method,
            _uri: &'a str,
            _headers: &'a [(&'a str, &'a str)],
        ) -> Result<(), ErrorKind> {
            match *self {}
        }

        fn is_request_initiated(&self) -> bool {
            match *self {}
        }

        fn initiate_response(&mut self) -> Result<(), ErrorKind> {
            match *self {}
        }

        fn is_response_initiated(&self) -> bool {
            match *self {}
        }

        fn split(&mut self) -> (&Self::Headers, &mut Self::Read) {
            match *self {}
        }

        fn raw_connection(&mut self) -> Result<&mut Self::RawConnection, ErrorKind> {
            match *self {}
        }
    }
}

fn http_err<E: std::fmt::Debug>(what: &str, e: E) -> AppError {
    AppError::Http(format!("{what}: {e:?}"))
}

/// POST line protocol to `url`. Success is a 2xx status without an
/// `X-Influxdb-Error` header.
pub fn post_lines<C: Connection>(conn: C, url: &str, body: &str) -> AppResult<()> {
    let len = body.len().to_string();
    let user_agent = format!("esp-env/{FW_VERSION}");
    let headers = [
        ("Content-Type", "text/plain"),
        ("Content-Length", len.as_str()),
        ("Connection", "close"),
        ("User-Agent", user_agent.as_str()),
    ];

    let mut client = HttpClient::wrap(conn);
    let mut request = client.post(url, &headers).map_err(|e| http_err("request", e))?;
    request.write_all(body.as_bytes()).map_err(|e| http_err("write", e))?;
    request.flush().map_err(|e| http_err("flush", e))?;
    let response = request.submit().map_err(|e| http_err("submit", e))?;

    if let Some(err) = response.header("X-Influxdb-Error") {
        return Err(AppError::Http(format!("InfluxDB error: {err}")));
    }
    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(AppError::Http(format!("status {status}")));
    }
    Ok(())
}

/// Update the failure counter after a write. Returns true on success.
pub async fn record_result(state: &MyState, config: &MyConfig, target: &str, result: AppResult<()>) -> bool {
    match result {
        Ok(()) => {
            debug!("InfluxDB: write to {target} ok");
            *state.influx_errors.write().await = 0;
            true
        }
        Err(e) => {
            let errors = {
                let mut errors = state.influx_errors.write().await;
                *errors += 1;
                *errors
            };
            error!("InfluxDB write to {target} failed ({errors}): {e}");
            state.blink(INFLUX_ERROR_BLINKS);

            if config.influx_max_errors > 0 && errors >= config.influx_max_errors {
                error!("Too many InfluxDB errors, rebooting.");
                state.schedule_reset().await;
            }
            false
        }
    }
}

/// Write points and keep the failure counter. Returns true on success.
pub async fn influx_write(state: &MyState, points: &[Point]) -> bool {
    let config = state.config.read().await.clone();
    if !config.influx_enable {
        return false;
    }

    let client = InfluxClient::from_config(&config);
    let result = client.write(points).await;
    record_result(state, &config, &client.target(), result).await
}

pub async fn collect_points(state: &MyState) -> Vec<Point> {
    let config = state.config.read().await.clone();
    let mac = state.my_mac_s.read().await.clone();

    let mut points = environment_points(&*state.sensors.read().await, &config, &mac);
    points.extend(moisture_points(&state.moisture.read().await, &config, &mac));
    points.extend(relay_points(&*state.relays.read().await, &config, &mac));
    points
}

pub async fn run_influx(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    if !state.config.read().await.influx_enable {
        info!("InfluxDB is disabled.");
        // we cannot return, otherwise tokio::select in main() will exit
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    loop {
        let interval = state.config.read().await.influx_interval;
        tokio::select! {
            _ = sleep(Duration::from_secs(interval.into())) => {}
            _ = state.influx_kick.notified() => { debug!("InfluxDB write requested."); }
        }

        if !*state.wifi_up.read().await {
            continue;
        }
        let points = collect_points(&state).await;
        influx_write(&state, &points).await;
    }
}

#[cfg(test)]
mod tests {
    use embedded_svc::http::client::Connection;
    use embedded_svc::http::{Headers, Method, Status};
    use embedded_svc::io::{ErrorKind, ErrorType, Read, Write};

    use super::*;
    use crate::sensors::{AirReading, ClimateReading};

    fn config() -> MyConfig {
        MyConfig {
            location: "bathroom".into(),
            location_id: "bath-1".into(),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct FakeResponse {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
    }

    impl Status for FakeResponse {
        fn status(&self) -> u16 {
            self.status
        }

        fn status_message(&self) -> Option<&'_ str> {
            None
        }
    }

    impl Headers for FakeResponse {
        fn header(&self, name: &str) -> Option<&'_ str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        }
    }

    #[derive(Default)]
    struct FakeBody(Vec<u8>);

    impl ErrorType for FakeBody {
        type Error = ErrorKind;
    }

    impl Read for FakeBody {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ErrorKind> {
            Ok(0)
        }
    }

    impl Write for FakeBody {
        fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), ErrorKind> {
            Ok(())
        }
    }

    /// Records the request and answers with a canned response.
    #[derive(Default)]
    struct FakeHttp {
        method: Option<Method>,
        uri: String,
        headers: Vec<(String, String)>,
        body: FakeBody,
        response: FakeResponse,
        responded: bool,
    }

    impl FakeHttp {
        fn answering(status: u16, headers: &[(&'static str, &'static str)]) -> Self {
            Self {
                response: FakeResponse {
                    status,
                    headers: headers.to_vec(),
                },
                ..Default::default()
            }
        }
    }

    impl ErrorType for FakeHttp {
        type Error = ErrorKind;
    }

    impl Read for FakeHttp {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
            self.body.read(buf)
        }
    }

    impl Write for FakeHttp {
        fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
            self.body.write(buf)
        }

        fn flush(&mut self) -> Result<(), ErrorKind> {
            Ok(())
        }
    }

    impl Status for FakeHttp {
        fn status(&self) -> u16 {
            self.response.status()
        }

        fn status_message(&self) -> Option<&'_ str> {
            None
        }
    }

    impl Headers for FakeHttp {
        fn header(&self, name: &str) -> Option<&'_ str> {
            self.response.header(name)
        }
    }

    impl Connection for FakeHttp {
        type Headers = FakeResponse;
        type Read = FakeBody;
        type RawConnectionError = ErrorKind;
        type RawConnection = FakeBody;

        fn initiate_request<'a>(
            &'a mut self,
            method: Method,
            uri: &'a str,
            headers: &'a [(&'a str, &'a str)],
        ) -> Result<(), ErrorKind> {
            self.method = Some(method);
            self.uri = uri.into();
            self.headers = headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            Ok(())
        }

        fn is_request_initiated(&self) -> bool {
            self.method.is_some()
        }

        fn initiate_response(&mut self) -> Result<(), ErrorKind> {
            self.responded = true;
            Ok(())
        }

        fn is_response_initiated(&self) -> bool {
            self.responded
        }

        fn split(&mut self) -> (&Self::Headers, &mut Self::Read) {
            (&self.response, &mut self.body)
        }

        fn raw_connection(&mut self) -> Result<&mut Self::RawConnection, ErrorKind> {
            Err(ErrorKind::Unsupported)
        }
    }

    #[test]
    fn line_protocol_escaping() {
        let p = Point::new("my env")
            .tag("location", "living room")
            .tag("a=b", "c,d")
            .field("temperature", 21.5)
            .field("count", 3i64)
            .field("on", true);
        assert_eq!(
            p.to_line(),
            r"my\ env,location=living\ room,a\=b=c\,d temperature=21.5,count=3i,on=true"
        );
    }

    #[test]
    fn floats_use_shortest_form() {
        let p = Point::new("m").field("v", 20.0).field("w", 0.1 + 0.2);
        assert_eq!(p.to_line(), "m v=20,w=0.30000000000000004");
    }

    #[test]
    fn environment_points_per_sensor() {
        let snapshot = SensorSnapshot {
            bme1: Some(ClimateReading {
                temperature: 21.5,
                humidity: 40.0,
                pressure: Some(1013.25),
            }),
            sht: Some(ClimateReading {
                temperature: 22.0,
                humidity: 41.5,
                pressure: None,
            }),
            ccs2: Some(AirReading {
                eco2: 400.0,
                tvoc: 3.0,
                error: 0,
                valid: true,
            }),
            ..Default::default()
        };
        let lines: Vec<String> = environment_points(&snapshot, &config(), "AA:BB")
            .iter()
            .map(Point::to_line)
            .collect();
        assert_eq!(
            lines,
            vec![
                "environment,location=bathroom,location-id=bath-1,placement=1,sensor=bme280,device=AA:BB temperature=21.5,pressure=1013.25,humidity=40",
                "environment,location=bathroom,location-id=bath-1,sensor=sht21,device=AA:BB temperature=22,humidity=41.5",
                "environment,location=bathroom,location-id=bath-1,placement=2,sensor=ccs811,error=0,device=AA:BB eco2=400,tvoc=3",
            ]
        );
    }

    #[test]
    fn moisture_skips_unconnected_probes() {
        let lines: Vec<String> = moisture_points(&[1500, 4095, 2200], &config(), "AA:BB")
            .iter()
            .map(Point::to_line)
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "moisture,location=bathroom,location-id=bath-1,sensor=3,device=AA:BB value=2200i,maximum=4095i"
        );
    }

    #[test]
    fn relay_points_carry_id_and_name() {
        let mut relays = RelayBank::new(vec!["light".into(), "fan".into()], Box::new(NoRelays));
        relays.set(1, true);
        let lines: Vec<String> = relay_points(&relays, &config(), "AA:BB")
            .iter()
            .map(Point::to_line)
            .collect();
        assert_eq!(
            lines[1],
            "relais,location=bathroom,location-id=bath-1,id=1,name=fan,device=AA:BB state=1i"
        );
    }

    #[test]
    fn posts_line_protocol() {
        let client = InfluxClient::new("10.0.0.2", 8086, "roomsensorsdiy");
        let body = "environment temperature=20.5\nmoisture value=100i";
        let mut conn = FakeHttp::answering(204, &[]);
        post_lines(&mut conn, &client.write_url(), body).unwrap();

        assert_eq!(conn.method, Some(Method::Post));
        assert_eq!(conn.uri, "http://10.0.0.2:8086/write?db=roomsensorsdiy");
        assert!(conn.headers.contains(&("Connection".into(), "close".into())));
        assert!(conn.headers.contains(&("Content-Length".into(), body.len().to_string())));
        assert_eq!(conn.body.0, body.as_bytes());
    }

    #[test]
    fn rejects_error_status_and_header() {
        let url = "http://10.0.0.2:8086/write?db=x";
        assert!(post_lines(&mut FakeHttp::answering(204, &[]), url, "m v=1").is_ok());
        assert!(post_lines(&mut FakeHttp::answering(404, &[]), url, "m v=1").is_err());

        let mut conn = FakeHttp::answering(204, &[("x-influxdb-error", "partial write")]);
        match post_lines(&mut conn, url, "m v=1") {
            Err(AppError::Http(msg)) => assert!(msg.contains("partial write")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_write_needs_no_connection() {
        let client = InfluxClient::new("10.0.0.2", 8086, "x");
        client.write(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn failures_count_and_trigger_reset() {
        let config = MyConfig {
            influx_enable: true,
            influx_max_errors: 2,
            ..Default::default()
        };
        let state = MyState::with_defaults(config.clone());

        let fail = || Err(AppError::Http("status 500".into()));
        assert!(!record_result(&state, &config, "db", fail()).await);
        assert_eq!(*state.influx_errors.read().await, 1);
        assert_eq!(state.take_blinks(), INFLUX_ERROR_BLINKS);
        assert!(!*state.reset.read().await);

        assert!(record_result(&state, &config, "db", Ok(())).await);
        assert_eq!(*state.influx_errors.read().await, 0);

        record_result(&state, &config, "db", fail()).await;
        record_result(&state, &config, "db", fail()).await;
        assert!(*state.reset.read().await);
    }
}

// EOF
