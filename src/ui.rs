// ui.rs
//
// Touchscreen controller for the 320x240 "cheap yellow display" boards.
// Drawing is left to a renderer, this module only decides what to show.

use crate::*;

pub const LCD_WIDTH: i32 = 320;
pub const LCD_HEIGHT: i32 = 240;

pub const BTN_W: i32 = 120;
pub const BTN_H: i32 = 60;
pub const BTN_GAP: i32 = 20;

pub const BTNS_OFF_X: i32 = (LCD_WIDTH - 2 * BTN_W - BTN_GAP) / 2;
pub const BTNS_OFF_Y: i32 = (LCD_HEIGHT - 3 * BTN_H - 2 * BTN_GAP) / 2;

pub const CALIB_1: (i32, i32) = (42, 42);
pub const CALIB_2: (i32, i32) = (LCD_WIDTH - 1 - CALIB_1.0, LCD_HEIGHT - 1 - CALIB_1.1);

const LDR_CHECK_MS: u64 = 100;
const LDR_DARK_VALUE: i32 = 1200;
const LDR_BRIGHT_VALUE: i32 = 0;
const LDR_LOWPASS_FACT: f32 = 0.025;

pub const STANDBY_BRIGHTNESS: i32 = 10;
pub const LCD_MIN_BRIGHTNESS: i32 = STANDBY_BRIGHTNESS * 2;
pub const LCD_MAX_BRIGHTNESS: i32 = 255;

const MIN_TOUCH_DELAY_MS: u64 = 200;
const TOUCH_PRESSURE_MIN: i32 = 1000;
const FULL_BRIGHT_MS: u64 = 30_000;
const NO_BRIGHT_MS: u64 = 2_000;

pub const BATHROOM_TOPIC: &str = "bathroom/force_light";

/// Integer linear mapping with truncation.
pub fn map_range(x: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    if in_max == in_min {
        return out_min;
    }
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BathroomLights {
    #[default]
    Off,
    Auto,
    Big,
    Small,
}

impl BathroomLights {
    pub fn payload(self) -> &'static str {
        match self {
            BathroomLights::Off => "off",
            BathroomLights::Auto => "none",
            BathroomLights::Big => "big",
            BathroomLights::Small => "small",
        }
    }

    pub fn from_payload(p: &str) -> Option<Self> {
        match p.trim() {
            "off" => Some(BathroomLights::Off),
            "none" => Some(BathroomLights::Auto),
            "big" => Some(BathroomLights::Big),
            "small" => Some(BathroomLights::Small),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiSwitch {
    LightCorner,
    LightWorkspace,
    LightSink,
    LightKitchen,
    SoundAmplifier,
    LightBench,
    LightPc,
    LightAmp,
    LightBox,
    PcDisplays,
}

impl UiSwitch {
    pub const ALL: [UiSwitch; 10] = [
        UiSwitch::LightCorner,
        UiSwitch::LightWorkspace,
        UiSwitch::LightSink,
        UiSwitch::LightKitchen,
        UiSwitch::SoundAmplifier,
        UiSwitch::LightBench,
        UiSwitch::LightPc,
        UiSwitch::LightAmp,
        UiSwitch::LightBox,
        UiSwitch::PcDisplays,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            UiSwitch::LightCorner => "livingroom/light_corner",
            UiSwitch::LightWorkspace => "livingroom/light_workspace",
            UiSwitch::LightSink => "livingroom/light_sink",
            UiSwitch::LightKitchen => "livingroom/light_kitchen",
            UiSwitch::SoundAmplifier => "livingroom/amp",
            UiSwitch::LightBench => "livingroom/light_bench",
            UiSwitch::LightPc => "livingroom/light_pc",
            UiSwitch::LightAmp => "livingroom/light_amp",
            UiSwitch::LightBox => "livingroom/light_box",
            UiSwitch::PcDisplays => "livingroom/displays",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UiSwitch::LightCorner => "Lights Corner",
            UiSwitch::LightWorkspace => "Lights Workspace",
            UiSwitch::LightSink => "Lights Sink",
            UiSwitch::LightKitchen => "Lights Kitchen",
            UiSwitch::SoundAmplifier => "Sound Amp.",
            UiSwitch::LightBench => "Lights Bench",
            UiSwitch::LightPc => "Lights PC",
            UiSwitch::LightAmp => "Lights Amp.",
            UiSwitch::LightBox => "Lights Box",
            UiSwitch::PcDisplays => "PC Displays",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UiStatus {
    pub light_corner: bool,
    pub light_workspace: bool,
    pub light_sink: bool,
    pub light_kitchen: bool,
    pub sound_amplifier: bool,
    pub light_bench: bool,
    pub light_pc: bool,
    pub light_amp: bool,
    pub light_box: bool,
    pub pc_displays: bool,
    pub bathroom_lights: BathroomLights,
}

impl UiStatus {
    fn switch_mut(&mut self, s: UiSwitch) -> &mut bool {
        match s {
            UiSwitch::LightCorner => &mut self.light_corner,
            UiSwitch::LightWorkspace => &mut self.light_workspace,
            UiSwitch::LightSink => &mut self.light_sink,
            UiSwitch::LightKitchen => &mut self.light_kitchen,
            UiSwitch::SoundAmplifier => &mut self.sound_amplifier,
            UiSwitch::LightBench => &mut self.light_bench,
            UiSwitch::LightPc => &mut self.light_pc,
            UiSwitch::LightAmp => &mut self.light_amp,
            UiSwitch::LightBox => &mut self.light_box,
            UiSwitch::PcDisplays => &mut self.pc_displays,
        }
    }

    pub fn get(&self, s: UiSwitch) -> bool {
        match s {
            UiSwitch::LightCorner => self.light_corner,
            UiSwitch::LightWorkspace => self.light_workspace,
            UiSwitch::LightSink => self.light_sink,
            UiSwitch::LightKitchen => self.light_kitchen,
            UiSwitch::SoundAmplifier => self.sound_amplifier,
            UiSwitch::LightBench => self.light_bench,
            UiSwitch::LightPc => self.light_pc,
            UiSwitch::LightAmp => self.light_amp,
            UiSwitch::LightBox => self.light_box,
            UiSwitch::PcDisplays => self.pc_displays,
        }
    }

    pub fn set(&mut self, s: UiSwitch, on: bool) {
        *self.switch_mut(s) = on;
    }

    pub fn toggle(&mut self, s: UiSwitch) {
        let v = self.switch_mut(s);
        *v = !*v;
    }

    pub fn any_light_on(&self) -> bool {
        UiSwitch::ALL
            .iter()
            .filter(|s| **s != UiSwitch::SoundAmplifier)
            .any(|s| self.get(*s))
    }

    /// "All Lights Off" when anything is lit, otherwise "Wake Up Lights".
    pub fn all_off_or_wake(&mut self) {
        if self.any_light_on() {
            for s in UiSwitch::ALL {
                if s != UiSwitch::SoundAmplifier {
                    self.set(s, false);
                }
            }
        } else {
            self.light_corner = true;
            self.light_sink = true;
            self.pc_displays = true;
        }
    }

    /// Every state as `(topic, payload)`.
    pub fn messages(&self) -> Vec<(String, String)> {
        let mut v: Vec<(String, String)> = UiSwitch::ALL
            .iter()
            .map(|s| {
                let payload = if self.get(*s) { "on" } else { "off" };
                (s.topic().to_string(), payload.to_string())
            })
            .collect();
        v.push((BATHROOM_TOPIC.into(), self.bathroom_lights.payload().into()));
        v
    }

    /// Mirror a received state. Returns true when the topic belongs to the UI.
    pub fn apply_mqtt(&mut self, topic: &str, payload: &str) -> bool {
        if topic == BATHROOM_TOPIC {
            if let Some(b) = BathroomLights::from_payload(payload) {
                self.bathroom_lights = b;
            }
            return true;
        }
        let Some(s) = UiSwitch::ALL.iter().find(|s| s.topic() == topic) else {
            return false;
        };
        if payload.contains("on") {
            self.set(*s, true);
        } else if payload.contains("off") {
            self.set(*s, false);
        }
        true
    }

    pub fn topics() -> Vec<&'static str> {
        let mut v: Vec<&'static str> = UiSwitch::ALL.iter().map(|s| s.topic()).collect();
        v.push(BATHROOM_TOPIC);
        v
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Page {
    #[default]
    LivingRoom1,
    LivingRoom2,
    Bathroom,
    Info,
}

impl Page {
    /// Menu pages cycle, Info is only reached with the boot button.
    pub fn next(self) -> Self {
        match self {
            Page::LivingRoom1 => Page::LivingRoom2,
            Page::LivingRoom2 => Page::Bathroom,
            Page::Bathroom | Page::Info => Page::LivingRoom1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x <= self.x + self.w && y >= self.y && y <= self.y + self.h
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }
}

pub const NEXT_SLOT: usize = 5;

/// Slots 0..3 are the left column top to bottom, 3..6 the right one.
pub fn button_rect(slot: usize) -> Rect {
    let col = (slot / 3) as i32;
    let row = (slot % 3) as i32;
    Rect {
        x: BTNS_OFF_X + col * (BTN_W + BTN_GAP),
        y: BTNS_OFF_Y + row * (BTN_H + BTN_GAP),
        w: BTN_W,
        h: BTN_H,
    }
}

pub fn hit_test(x: i32, y: i32) -> Option<usize> {
    (0..6).find(|slot| button_rect(*slot).contains(x, y))
}

pub fn touch_to_screen(cal: &TouchCalibration, raw_x: i32, raw_y: i32) -> (i32, i32) {
    let x = map_range(raw_x, cal.left, cal.right, CALIB_1.0, CALIB_2.0);
    let y = map_range(raw_y, cal.top, cal.bottom, CALIB_1.1, CALIB_2.1);
    (x.clamp(0, LCD_WIDTH - 1), y.clamp(0, LCD_HEIGHT - 1))
}

/// Calibration from raw readings at the two reticules.
pub fn calibration_from_points(first: (i32, i32), second: (i32, i32)) -> TouchCalibration {
    TouchCalibration {
        left: first.0,
        top: first.1,
        right: second.0,
        bottom: second.1,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Touch {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ButtonColor {
    On,
    Off,
    Action,
    Next,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ButtonView {
    pub label: &'static str,
    pub rect: Rect,
    pub color: ButtonColor,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Screen {
    /// Touch the reticule at `target`, or press the button to save when `None`.
    Calibrate { target: Option<(i32, i32)> },
    Standby,
    Info,
    Menu { page: Page, buttons: Vec<ButtonView> },
}

enum Action {
    Toggle(UiSwitch),
    Bath(BathroomLights),
    AllLights,
    Nothing,
}

fn page_actions(page: Page) -> [Action; 5] {
    use Action::*;
    match page {
        Page::LivingRoom1 => [
            Toggle(UiSwitch::LightCorner),
            Toggle(UiSwitch::LightWorkspace),
            Toggle(UiSwitch::LightSink),
            Toggle(UiSwitch::SoundAmplifier),
            AllLights,
        ],
        Page::LivingRoom2 => [
            Toggle(UiSwitch::LightPc),
            Toggle(UiSwitch::LightBench),
            Toggle(UiSwitch::LightKitchen),
            Toggle(UiSwitch::LightAmp),
            Toggle(UiSwitch::LightBox),
        ],
        Page::Bathroom => [
            Bath(BathroomLights::Auto),
            Bath(BathroomLights::Big),
            Toggle(UiSwitch::PcDisplays),
            Bath(BathroomLights::Off),
            Bath(BathroomLights::Small),
        ],
        Page::Info => [Nothing, Nothing, Nothing, Nothing, Nothing],
    }
}

fn on_off(on: bool) -> ButtonColor {
    if on {
        ButtonColor::On
    } else {
        ButtonColor::Off
    }
}

fn bath_label(b: BathroomLights) -> &'static str {
    match b {
        BathroomLights::Off => "Bath Lights Off",
        BathroomLights::Auto => "Bath Lights Auto",
        BathroomLights::Big => "Bath Lights Big",
        BathroomLights::Small => "Bath Lights Small",
    }
}

/// Result of one controller step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UiUpdate {
    pub redraw: bool,
    pub changed: bool,
}

pub struct UiController {
    page: Page,
    cal: TouchCalibration,
    is_touched: bool,
    last_touch: u64,
    last_ldr: u64,
    ldr_value: f32,
    max_brightness: i32,
    brightness: i32,
}

impl UiController {
    pub fn new(cal: TouchCalibration, ldr: i32) -> Self {
        Self {
            page: Page::default(),
            cal,
            is_touched: false,
            last_touch: 0,
            last_ldr: 0,
            ldr_value: ldr as f32,
            max_brightness: LCD_MAX_BRIGHTNESS,
            brightness: LCD_MAX_BRIGHTNESS,
        }
    }

    pub fn page(&self) -> Page {
        self.page
    }

    pub fn brightness(&self) -> i32 {
        self.brightness
    }

    pub fn ldr_value(&self) -> i32 {
        self.ldr_value as i32
    }

    fn update_ldr(&mut self, raw: i32) {
        self.ldr_value = self.ldr_value * (1.0 - LDR_LOWPASS_FACT) + raw as f32 * LDR_LOWPASS_FACT;
        let v = (self.ldr_value as i32).clamp(0, LDR_DARK_VALUE);
        self.max_brightness = map_range(v, LDR_DARK_VALUE, LDR_BRIGHT_VALUE, LCD_MIN_BRIGHTNESS, LCD_MAX_BRIGHTNESS);
    }

    fn update_brightness(&mut self, now: u64) {
        let diff = now.saturating_sub(self.last_touch);
        self.brightness = if diff < FULL_BRIGHT_MS || self.page == Page::Info {
            self.max_brightness
        } else if diff < FULL_BRIGHT_MS + NO_BRIGHT_MS {
            map_range(
                (diff - FULL_BRIGHT_MS) as i32,
                0,
                NO_BRIGHT_MS as i32,
                self.max_brightness,
                STANDBY_BRIGHTNESS,
            )
        } else {
            STANDBY_BRIGHTNESS
        };
    }

    pub fn is_standby(&self) -> bool {
        self.brightness <= STANDBY_BRIGHTNESS
    }

    /// One step of the UI loop. `ldr` is a raw light sensor reading, `touch` a raw
    /// touch controller sample while the panel is pressed.
    pub fn step(
        &mut self,
        now: u64,
        status: &mut UiStatus,
        touch: Option<Touch>,
        boot_button: bool,
        ldr: Option<i32>,
    ) -> UiUpdate {
        let mut update = UiUpdate::default();

        if boot_button && self.page != Page::Info {
            self.page = Page::Info;
            update.redraw = true;
        }

        if now >= self.last_ldr + LDR_CHECK_MS {
            if let Some(raw) = ldr {
                self.last_ldr = now;
                self.update_ldr(raw);
            }
        }

        let was_dimmed = self.brightness < self.max_brightness;
        self.update_brightness(now);

        let touch = touch
            .filter(|t| t.z >= TOUCH_PRESSURE_MIN)
            .map(|t| touch_to_screen(&self.cal, t.x, t.y));

        match touch {
            Some((x, y)) if !self.is_touched => {
                self.is_touched = true;
                self.last_touch = now;
                update.redraw = true;

                if was_dimmed {
                    // only wake the screen up
                    self.update_brightness(now);
                    return update;
                }
                if self.page == Page::Info {
                    self.page = self.page.next();
                    return update;
                }

                match hit_test(x, y) {
                    Some(NEXT_SLOT) => self.page = self.page.next(),
                    Some(slot) => {
                        update.changed = match &page_actions(self.page)[slot] {
                            Action::Toggle(s) => {
                                status.toggle(*s);
                                true
                            }
                            Action::Bath(b) => {
                                status.bathroom_lights = *b;
                                true
                            }
                            Action::AllLights => {
                                status.all_off_or_wake();
                                true
                            }
                            Action::Nothing => false,
                        };
                    }
                    None => {}
                }
            }
            None if self.is_touched && now.saturating_sub(self.last_touch) >= MIN_TOUCH_DELAY_MS => {
                self.is_touched = false;
            }
            _ => {}
        }
        update
    }

    pub fn screen(&self, status: &UiStatus) -> Screen {
        if self.is_standby() {
            return Screen::Standby;
        }
        if self.page == Page::Info {
            return Screen::Info;
        }

        let mut buttons: Vec<ButtonView> = page_actions(self.page)
            .iter()
            .enumerate()
            .map(|(slot, action)| {
                let (label, color) = match action {
                    Action::Toggle(s) => (s.label(), on_off(status.get(*s))),
                    Action::Bath(b) => (bath_label(*b), on_off(status.bathroom_lights == *b)),
                    Action::AllLights if status.any_light_on() => ("All Lights Off", ButtonColor::Action),
                    Action::AllLights => ("Wake Up Lights", ButtonColor::Action),
                    Action::Nothing => ("", ButtonColor::Off),
                };
                ButtonView {
                    label,
                    rect: button_rect(slot),
                    color,
                }
            })
            .collect();
        buttons.push(ButtonView {
            label: "Next...",
            rect: button_rect(NEXT_SLOT),
            color: ButtonColor::Next,
        });

        Screen::Menu {
            page: self.page,
            buttons,
        }
    }
}

/// Panel, touch controller, light sensor and backlight.
pub trait UiHardware {
    fn has_touch(&self) -> bool {
        true
    }
    fn touch(&mut self) -> Option<Touch>;
    fn boot_button(&mut self) -> bool;
    fn ldr(&mut self) -> Option<i32>;
    fn set_backlight(&mut self, level: i32);
    fn draw(&mut self, screen: &Screen);
}

const UI_LOOP: Duration = Duration::from_millis(20);
const CALIBRATION_RELEASE: Duration = Duration::from_millis(500);
const STANDBY_REDRAW: Duration = Duration::from_millis(500);
const INFO_REDRAW: Duration = Duration::from_secs(1);

/// Screens showing a clock or live values are redrawn periodically.
fn redraw_interval(screen: &Screen) -> Option<Duration> {
    match screen {
        Screen::Standby => Some(STANDBY_REDRAW),
        Screen::Info => Some(INFO_REDRAW),
        _ => None,
    }
}

async fn wait_touch<H: UiHardware>(hw: &mut H) -> (i32, i32) {
    loop {
        if let Some(t) = hw.touch().filter(|t| t.z >= TOUCH_PRESSURE_MIN) {
            return (t.x, t.y);
        }
        sleep(UI_LOOP).await;
    }
}

/// Record the raw readings at both reticules, then wait for the button.
async fn calibrate<H: UiHardware>(hw: &mut H) -> TouchCalibration {
    info!("Calibrating touchscreen...");
    hw.set_backlight(LCD_MAX_BRIGHTNESS);

    hw.draw(&Screen::Calibrate { target: Some(CALIB_1) });
    let first = wait_touch(hw).await;
    hw.draw(&Screen::Calibrate { target: None });
    sleep(CALIBRATION_RELEASE).await;

    hw.draw(&Screen::Calibrate { target: Some(CALIB_2) });
    let second = wait_touch(hw).await;
    hw.draw(&Screen::Calibrate { target: None });
    sleep(CALIBRATION_RELEASE).await;

    while !hw.boot_button() {
        sleep(UI_LOOP).await;
    }
    let cal = calibration_from_points(first, second);
    info!("Touch calibration: {cal:?}");
    cal
}

pub async fn run_ui<H: UiHardware>(state: Arc<Pin<Box<MyState>>>, hw: Option<H>) -> anyhow::Result<()> {
    let enabled = state.config.read().await.ui_enable;
    let Some(mut hw) = hw.filter(|_| enabled) else {
        info!("Touch UI is disabled.");
        // we cannot return, otherwise tokio::select in main() will exit
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    };

    let mut cal = state.calibration.read().await.touch;
    if hw.has_touch() && (cal.is_unset() || hw.boot_button()) {
        cal = Box::pin(calibrate(&mut hw)).await;
        state.calibration.write().await.touch = cal;
        if let Err(e) = state.save_calibration().await {
            error!("Could not save touch calibration: {e}");
        }
    }

    let mut ui = UiController::new(cal, hw.ldr().unwrap_or_default());
    let started = tokio::time::Instant::now();
    let mut last_screen = None;
    let mut last_draw = started;
    loop {
        let now = started.elapsed().as_millis() as u64;
        let (touch, button, ldr) = (hw.touch(), hw.boot_button(), hw.ldr());

        let (update, status) = {
            let mut status = state.ui.write().await;
            let update = ui.step(now, &mut status, touch, button, ldr);
            (update, status.clone())
        };

        if update.changed {
            for (topic, payload) in status.messages() {
                state.publish(topic, payload, true).await;
            }
        }

        hw.set_backlight(ui.brightness());
        let screen = ui.screen(&status);
        let stale = redraw_interval(&screen).is_some_and(|d| last_draw.elapsed() >= d);
        if update.redraw || stale || last_screen.as_ref() != Some(&screen) {
            hw.draw(&screen);
            last_screen = Some(screen);
            last_draw = tokio::time::Instant::now();
        }

        sleep(UI_LOOP).await;
    }
}


// EOF
