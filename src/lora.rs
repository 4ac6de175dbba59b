// lora.rs

use std::io::Read;

use tokio::time::Instant;

use crate::sml::{SmlEvent, SmlReader, SmlReading};
use crate::*;

const GATEWAY_POLL: Duration = Duration::from_millis(20);
const SENDER_POLL: Duration = Duration::from_millis(10);

// the receiver sometimes hangs, restart when it has been quiet for a while
const GATEWAY_RESTART_UPTIME: Duration = Duration::from_secs(6 * 60 * 60);
const GATEWAY_RX_SILENCE: Duration = Duration::from_secs(30);

pub const SENDER_AWAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
pub struct RxPacket {
    pub data: Vec<u8>,
    pub rssi: i16,
    pub snr: f32,
}

/// Half-duplex packet radio.
pub trait LoraRadio {
    /// Blocking transmit, returns the time on air.
    fn transmit(&mut self, data: &[u8]) -> AppResult<Duration>;
    fn start_receive(&mut self) -> AppResult<()>;
    fn poll_packet(&mut self) -> AppResult<Option<RxPacket>>;
}

/// Values that survive deep sleep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Retained {
    pub last_tx_msg: u8,
    pub sml_counter: u32,
}

/// Board services around the radio.
pub trait LoraBoard {
    fn battery_volts(&mut self) -> f32;
    fn chip_temperature(&mut self) -> f32;
    /// True once per button click.
    fn button_clicked(&mut self) -> bool;
    fn retained(&self) -> Retained;
    fn retain(&mut self, retained: Retained);
    /// Does not return on the device.
    fn deep_sleep(&mut self, secs: u64);
}

/// Radio plus frame codec and duty cycle bookkeeping.
pub struct LoraLink<R> {
    radio: R,
    duty: DutyCycle,
    key: Option<[u8; FRAME_LEN]>,
    receiving: bool,
}

impl<R: LoraRadio> LoraLink<R> {
    pub fn new(radio: R, key: Option<[u8; FRAME_LEN]>) -> Self {
        Self {
            radio,
            duty: DutyCycle::default(),
            key,
            receiving: false,
        }
    }

    pub fn duty(&self) -> &DutyCycle {
        &self.duty
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn start_receive(&mut self) -> AppResult<()> {
        self.receiving = true;
        self.radio.start_receive()
    }

    /// Transmit one message if the duty cycle allows it. `now` is in ms.
    pub fn send(&mut self, msg: &TelemetryMessage, now: u64) -> bool {
        if !self.duty.is_legal(now) {
            return false;
        }

        let frame = msg.encode(self.key.as_ref());
        let (ok, airtime) = match self.radio.transmit(&frame) {
            Ok(airtime) => {
                info!("TX [{}] ({} bytes) OK ({} ms)", msg.msg_type, frame.len(), airtime.as_millis());
                (true, airtime)
            }
            Err(e) => {
                error!("TX [{}] failed: {e}", msg.msg_type);
                (false, Duration::ZERO)
            }
        };
        let airtime_ms = airtime.as_millis() as u64;
        self.duty.record(now + airtime_ms, airtime_ms);

        if self.receiving {
            if let Err(e) = self.radio.start_receive() {
                error!("LoRa receive restart failed: {e}");
            }
        }
        ok
    }

    pub fn receive(&mut self) -> AppResult<Option<RxPacket>> {
        let packet = self.radio.poll_packet()?;
        if packet.is_some() && self.receiving {
            self.radio.start_receive()?;
        }
        Ok(packet)
    }

    pub fn decode(&self, packet: &RxPacket) -> Result<TelemetryMessage, FrameError> {
        TelemetryMessage::decode(&packet.data, self.key.as_ref())
    }
}

fn millis(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

pub fn gateway_should_restart(uptime: Duration, since_rx: Duration) -> bool {
    uptime >= GATEWAY_RESTART_UPTIME && since_rx >= GATEWAY_RX_SILENCE
}

/// InfluxDB point for a received frame.
pub fn gateway_point(msg: &TelemetryMessage, location: &str) -> Point {
    let p = Point::new("environment")
        .tag("sensor", "sml")
        .tag("location", location);
    match msg.battery_status() {
        Some(bat) => p.field("vbat", bat.volts).field("percent", bat.percent),
        None => p.field(field_name(msg.msg_type), msg.value),
    }
}

async fn gateway_handle(state: &MyState, msg: Result<TelemetryMessage, FrameError>, packet: &RxPacket) {
    let msg = match msg {
        Ok(m) => {
            info!("RX [{}]", m.msg_type);
            info!("  RSSI: {} dBm", packet.rssi);
            info!("  SNR: {:.2} dB", packet.snr);
            m
        }
        Err(e) => {
            warn!("RX ({} bytes, RSSI {} dBm): {e}", packet.data.len(), packet.rssi);
            state.lora.write().await.rx_errors += 1;
            return;
        }
    };
    match msg.battery_status() {
        Some(bat) => info!("  Vbat: {:.2} ({}%)", bat.volts, bat.percent),
        None => info!("  Value: {:.2}", msg.value),
    }

    {
        let uptime = *state.uptime.read().await;
        let mut lora = state.lora.write().await;
        lora.rx_count += 1;
        lora.last_rx = Some(LoraRx {
            msg_type: msg.msg_type,
            value: msg.value,
            rssi: packet.rssi,
            snr: packet.snr,
            uptime,
        });
    }

    let location = state.config.read().await.location.clone();
    influx_write(state, &[gateway_point(&msg, &location)]).await;
}

pub async fn run_lora_gateway<R, B>(
    state: Arc<Pin<Box<MyState>>>,
    mut link: LoraLink<R>,
    mut board: B,
) -> anyhow::Result<()>
where
    R: LoraRadio,
    B: LoraBoard,
{
    link.start_receive()?;
    info!("LoRa gateway listening.");

    let started = Instant::now();
    let mut last_rx = started;
    loop {
        sleep(GATEWAY_POLL).await;

        if gateway_should_restart(started.elapsed(), last_rx.elapsed()) {
            error!("LoRa receiver quiet for too long, rebooting.");
            state.schedule_reset().await;
            last_rx = Instant::now();
        }

        match link.receive() {
            Ok(Some(packet)) => {
                last_rx = Instant::now();
                let msg = link.decode(&packet);
                gateway_handle(&state, msg, &packet).await;
            }
            Ok(None) => {}
            Err(e) => error!("LoRa receive failed: {e}"),
        }

        if board.button_clicked() {
            let now = millis(started);
            if !link.duty().is_legal(now) {
                info!("Legal limit, wait {} sec.", link.duty().wait_secs(now));
                continue;
            }
            let hello = TelemetryMessage::new(MessageType::Hello, board.chip_temperature().into());
            if link.send(&hello, now) {
                state.lora.write().await.tx_count += 1;
            }
        }
    }
}

/// Queue everything a meter reading produces, battery report included.
pub fn submit_reading(cache: &mut TelemetryCache, reading: &SmlReading, counter: u32, battery: BatteryStatus) {
    for (kind, value) in reading.telemetry() {
        cache.submit(kind, value, counter);
    }
    cache.submit(MessageType::BatV, battery.to_value(), counter);
}

/// One-per-wake transmit: the next ready value after the last one sent.
/// Returns the new last sent type.
pub fn send_next<R: LoraRadio>(cache: &mut TelemetryCache, link: &mut LoraLink<R>, last_tx_msg: u8, now: u64) -> u8 {
    let Some(kind) = cache.next_after(last_tx_msg) else {
        return last_tx_msg;
    };
    if let Some((value, _)) = cache.pending(kind) {
        if link.send(&TelemetryMessage::new(kind, value), now) {
            cache.mark_sent(kind);
        }
    }
    kind as u8
}

pub async fn run_lora_sender<R, B, S>(
    state: Arc<Pin<Box<MyState>>>,
    mut link: LoraLink<R>,
    mut board: B,
    mut meter: S,
) -> anyhow::Result<()>
where
    R: LoraRadio,
    B: LoraBoard,
    S: Read,
{
    let keep_sending = state.config.read().await.lora_keep_sending;
    let retained = board.retained();
    let mut reader = SmlReader::new(retained.sml_counter);
    let mut cache = TelemetryCache::new();
    let mut last_tx_msg = retained.last_tx_msg;

    let bat = BatteryStatus::from_volts(board.battery_volts());
    info!("Vbat: {:.2}V ({}%)", bat.volts, bat.percent);

    let started = Instant::now();
    let mut buf = [0u8; 128];
    loop {
        let n = match meter.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };

        for byte in &buf[..n] {
            match reader.feed(*byte) {
                Some(SmlEvent::Start) => debug!("SML frame start ({})", reader.counter()),
                Some(SmlEvent::Frame(body)) => {
                    let reading = match SmlReading::parse(&body) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("SML parse error: {e}");
                            continue;
                        }
                    };
                    reading.log();
                    *state.sml.write().await = Some(reading);

                    let bat = BatteryStatus::from_volts(board.battery_volts());
                    submit_reading(&mut cache, &reading, reader.counter(), bat);

                    if !keep_sending {
                        last_tx_msg = send_next(&mut cache, &mut link, last_tx_msg, millis(started));
                        board.retain(Retained {
                            last_tx_msg,
                            sml_counter: reader.counter(),
                        });
                        board.deep_sleep(link.duty().deep_sleep_secs());
                        return Ok(());
                    }
                }
                Some(SmlEvent::Error(e)) => warn!("SML: {e}"),
                None => {}
            }
        }

        if keep_sending {
            let now = millis(started);
            let sent = cache.send_oldest(|kind, value| link.send(&TelemetryMessage::new(kind, value), now));
            if sent > 0 {
                state.lora.write().await.tx_count += sent as u32;
            }
        }

        if started.elapsed() >= SENDER_AWAKE_TIMEOUT {
            info!(
                "Awake for {}s (SML data: {}), going to sleep.",
                SENDER_AWAKE_TIMEOUT.as_secs(),
                reader.data_received()
            );
            board.retain(Retained {
                last_tx_msg,
                sml_counter: reader.counter(),
            });
            board.deep_sleep(link.duty().deep_sleep_secs());
            return Ok(());
        }

        sleep(SENDER_POLL).await;
    }
}

pub async fn run_lora<R, B, S>(
    state: Arc<Pin<Box<MyState>>>,
    radio: Option<R>,
    board: B,
    meter: S,
) -> anyhow::Result<()>
where
    R: LoraRadio,
    B: LoraBoard,
    S: Read,
{
    let (role, key) = {
        let config = state.config.read().await;
        (config.lora_role, config.xor_key_bytes()?)
    };

    let radio = match (role, radio) {
        (LoraRole::Off, _) | (_, None) => {
            info!("LoRa is disabled.");
            // we cannot return, otherwise tokio::select in main() will exit
            loop {
                sleep(Duration::from_secs(3600)).await;
            }
        }
        (_, Some(radio)) => radio,
    };

    let link = LoraLink::new(radio, key);
    match role {
        LoraRole::Gateway => Box::pin(run_lora_gateway(state, link, board)).await,
        _ => Box::pin(run_lora_sender(state, link, board, meter)).await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::sml::tests::{frame, meter_body};

    #[derive(Default)]
    pub(crate) struct FakeRadio {
        pub sent: Vec<Vec<u8>>,
        pub rx: VecDeque<RxPacket>,
        pub airtime: Duration,
        pub fail: bool,
        pub receive_starts: usize,
    }

    impl LoraRadio for FakeRadio {
        fn transmit(&mut self, data: &[u8]) -> AppResult<Duration> {
            if self.fail {
                return Err(AppError::Radio("tx timeout".into()));
            }
            self.sent.push(data.to_vec());
            Ok(self.airtime)
        }

        fn start_receive(&mut self) -> AppResult<()> {
            self.receive_starts += 1;
            Ok(())
        }

        fn poll_packet(&mut self) -> AppResult<Option<RxPacket>> {
            Ok(self.rx.pop_front())
        }
    }

    #[derive(Default)]
    struct FakeBoard {
        retained: Retained,
        slept: Option<u64>,
    }

    impl LoraBoard for FakeBoard {
        fn battery_volts(&mut self) -> f32 {
            3.7
        }

        fn chip_temperature(&mut self) -> f32 {
            31.5
        }

        fn button_clicked(&mut self) -> bool {
            false
        }

        fn retained(&self) -> Retained {
            self.retained
        }

        fn retain(&mut self, retained: Retained) {
            self.retained = retained;
        }

        fn deep_sleep(&mut self, secs: u64) {
            self.slept = Some(secs);
        }
    }

    fn radio(airtime_ms: u64) -> FakeRadio {
        FakeRadio {
            airtime: Duration::from_millis(airtime_ms),
            ..Default::default()
        }
    }

    #[test]
    fn send_respects_duty_cycle() {
        let mut link = LoraLink::new(radio(100), None);
        let msg = TelemetryMessage::new(MessageType::SumW, 230.0);

        assert!(link.send(&msg, 1000));
        // 100 ms on air, 10 s pause after it ended
        assert!(!link.send(&msg, 5000));
        assert!(link.send(&msg, 11_101));
        assert_eq!(link.radio_mut().sent.len(), 2);
        assert_eq!(link.radio_mut().sent[0], msg.encode(None));
    }

    #[test]
    fn failed_send_still_updates_last_tx() {
        let mut link = LoraLink::new(
            FakeRadio {
                fail: true,
                ..Default::default()
            },
            None,
        );
        let msg = TelemetryMessage::new(MessageType::Hello, 20.0);
        assert!(!link.send(&msg, 500));
        assert!(!link.duty().is_legal(500));
        assert!(link.duty().is_legal(501));
    }

    #[test]
    fn receive_decodes_with_key_and_rearms() {
        let key = [0x42; FRAME_LEN];
        let msg = TelemetryMessage::new(MessageType::L1W, 512.5);
        let mut fake = radio(0);
        fake.rx.push_back(RxPacket {
            data: msg.encode(Some(&key)).to_vec(),
            rssi: -97,
            snr: 7.25,
        });

        let mut link = LoraLink::new(fake, Some(key));
        link.start_receive().unwrap();
        let packet = link.receive().unwrap().unwrap();
        assert_eq!(link.decode(&packet).unwrap(), msg);
        assert_eq!(link.radio_mut().receive_starts, 2);
        assert_eq!(link.receive().unwrap(), None);
    }

    #[test]
    fn restart_only_after_long_uptime_and_silence() {
        let h = |h: u64| Duration::from_secs(h * 3600);
        let s = Duration::from_secs;
        assert!(!gateway_should_restart(h(5), s(3600)));
        assert!(!gateway_should_restart(h(6), s(29)));
        assert!(gateway_should_restart(h(6), s(30)));
    }

    #[test]
    fn gateway_points_by_type() {
        let msg = TelemetryMessage::new(MessageType::T1Wh, 12345.5);
        assert_eq!(
            gateway_point(&msg, "garage").to_line(),
            "environment,sensor=sml,location=garage T1_Wh=12345.5"
        );

        let bat = TelemetryMessage::battery(BatteryStatus {
            volts: 3.75,
            percent: 55,
        });
        assert_eq!(
            gateway_point(&bat, "garage").to_line(),
            "environment,sensor=sml,location=garage vbat=3.75,percent=55i"
        );

        let odd = TelemetryMessage {
            msg_type: 77,
            value: 1.0,
        };
        assert_eq!(
            gateway_point(&odd, "garage").to_line(),
            "environment,sensor=sml,location=garage unknown=1"
        );
    }

    #[test]
    fn one_per_wake_round_robin() {
        let reading = SmlReading::parse(&meter_body()).unwrap();
        let mut cache = TelemetryCache::new();
        submit_reading(&mut cache, &reading, 1, BatteryStatus::from_volts(3.7));

        let mut link = LoraLink::new(radio(10), None);
        let last = send_next(&mut cache, &mut link, MessageType::Hello as u8, 1000);
        assert_eq!(last, MessageType::T1Wh as u8);

        // next wake picks up after T1Wh
        let mut link = LoraLink::new(radio(10), None);
        let last = send_next(&mut cache, &mut link, last, 1000);
        assert_eq!(last, MessageType::SumW as u8);
        let sent = TelemetryMessage::decode(&link.radio_mut().sent[0], None).unwrap();
        assert_eq!(sent, TelemetryMessage::new(MessageType::SumW, 230.0));
    }

    #[tokio::test]
    async fn sender_transmits_one_value_then_sleeps() {
        let state = Arc::new(Box::pin(MyState::with_defaults(MyConfig {
            lora_role: LoraRole::Sender,
            ..Default::default()
        })));
        let mut board = FakeBoard::default();
        board.retained.sml_counter = 41;
        let link = LoraLink::new(radio(150), None);
        let wire = frame(&meter_body());

        run_lora_sender(state.clone(), link, &mut board, wire.as_slice())
            .await
            .unwrap();

        assert_eq!(board.slept, Some(60));
        assert_eq!(
            board.retained,
            Retained {
                last_tx_msg: MessageType::T1Wh as u8,
                sml_counter: 42
            }
        );
        assert_eq!(state.sml.read().await.and_then(|r| r.sum_w), Some(230.0));
    }

    #[tokio::test(start_paused = true)]
    async fn sender_sleeps_without_meter_data() {
        let state = Arc::new(Box::pin(MyState::with_defaults(MyConfig::default())));
        let mut board = FakeBoard::default();
        let link = LoraLink::new(radio(0), None);

        run_lora_sender(state, link, &mut board, std::io::empty())
            .await
            .unwrap();
        assert_eq!(board.slept, Some(60));
        assert_eq!(board.retained, Retained::default());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_sending_sender_also_sleeps_after_timeout() {
        let state = Arc::new(Box::pin(MyState::with_defaults(MyConfig {
            lora_role: LoraRole::Sender,
            lora_keep_sending: true,
            ..Default::default()
        })));
        let mut board = FakeBoard::default();
        let link = LoraLink::new(radio(0), None);

        let res = timeout(
            Duration::from_secs(120),
            run_lora_sender(state, link, &mut board, std::io::empty()),
        )
        .await;
        assert!(matches!(res, Ok(Ok(()))));
        assert_eq!(board.slept, Some(MIN_DEEP_SLEEP_SECS));
    }

    #[tokio::test]
    async fn gateway_counts_bad_frames() {
        let state = MyState::with_defaults(MyConfig::default());
        let packet = RxPacket {
            data: vec![0x01, 0x02],
            rssi: -110,
            snr: -3.5,
        };
        let msg = TelemetryMessage::decode(&packet.data, None);
        gateway_handle(&state, msg, &packet).await;

        let lora = state.lora.read().await;
        assert_eq!(lora.rx_errors, 1);
        assert_eq!(lora.rx_count, 0);
    }

    impl<B: LoraBoard> LoraBoard for &mut B {
        fn battery_volts(&mut self) -> f32 {
            (**self).battery_volts()
        }

        fn chip_temperature(&mut self) -> f32 {
            (**self).chip_temperature()
        }

        fn button_clicked(&mut self) -> bool {
            (**self).button_clicked()
        }

        fn retained(&self) -> Retained {
            (**self).retained()
        }

        fn retain(&mut self, retained: Retained) {
            (**self).retain(retained)
        }

        fn deep_sleep(&mut self, secs: u64) {
            (**self).deep_sleep(secs)
        }
    }
}

// EOF
