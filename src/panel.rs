// panel.rs
//
// 320x240 RGB565 TFT with an XPT2046 resistive touch controller.

use embedded_graphics::{
    draw_target::DrawTarget,
    geometry::{Point, Size},
    mono_font::{
        ascii::{FONT_6X10, FONT_9X18},
        MonoTextStyle,
    },
    pixelcolor::{Rgb565, RgbColor},
    primitives::{Circle, Line, Primitive, PrimitiveStyle, Rectangle},
    text::{Alignment, Baseline, Text, TextStyle, TextStyleBuilder},
    Drawable, Pixel,
};
use embedded_hal::spi::SpiDevice;

use crate::ui::{ButtonColor, Screen, Touch, UiHardware, LCD_HEIGHT, LCD_WIDTH};
use crate::*;

const RETICULE_LEN: i32 = 20;
const LINE_HEIGHT: i32 = 16;
const INFO_TOP: i32 = 40;

const WEEKDAYS: [&str; 7] = ["So.", "Mo.", "Di.", "Mi.", "Do.", "Fr.", "Sa."];

// XPT2046 control bytes, 12 bit differential mode with the reference on
const XPT_Z1: u8 = 0xB1;
const XPT_Z2: u8 = 0xC1;
const XPT_X: u8 = 0xD1;
const XPT_Y: u8 = 0x91;
const XPT_POWER_DOWN: u8 = 0xD0;
const XPT_MAX: i32 = 4095;
pub const TOUCH_Z_THRESHOLD: i32 = 300;

fn button_color(color: ButtonColor) -> Rgb565 {
    match color {
        ButtonColor::On => Rgb565::GREEN,
        ButtonColor::Off => Rgb565::RED,
        ButtonColor::Action => Rgb565::MAGENTA,
        ButtonColor::Next => Rgb565::CYAN,
    }
}

fn aligned(alignment: Alignment, baseline: Baseline) -> TextStyle {
    TextStyleBuilder::new().alignment(alignment).baseline(baseline).build()
}

fn text<D>(target: &mut D, s: &str, pos: (i32, i32), style: TextStyle, big: bool, color: Rgb565) -> Result<(), D::Error>
where
    D: DrawTarget<Color = Rgb565>,
{
    let font = if big { &FONT_9X18 } else { &FONT_6X10 };
    Text::with_text_style(s, Point::new(pos.0, pos.1), MonoTextStyle::new(font, color), style).draw(target)?;
    Ok(())
}

fn header<D>(target: &mut D) -> Result<(), D::Error>
where
    D: DrawTarget<Color = Rgb565>,
{
    let top = aligned(Alignment::Center, Baseline::Top);
    let title = format!("{PLATFORM_NAME} esp-env V{FW_VERSION}");
    text(target, &title, (LCD_WIDTH / 2, 0), top, true, Rgb565::WHITE)?;
    text(target, "by xythobuz.de", (LCD_WIDTH / 2, LINE_HEIGHT + 2), top, false, Rgb565::WHITE)
}

fn reticule<D>(target: &mut D, (x, y): (i32, i32)) -> Result<(), D::Error>
where
    D: DrawTarget<Color = Rgb565>,
{
    let half = RETICULE_LEN / 2;
    let red = PrimitiveStyle::with_stroke(Rgb565::RED, 1);
    Line::new(Point::new(x - half, y), Point::new(x + half - 1, y))
        .into_styled(red)
        .draw(target)?;
    Line::new(Point::new(x, y - half), Point::new(x, y + half - 1))
        .into_styled(red)
        .draw(target)?;
    Circle::with_center(Point::new(x, y), (RETICULE_LEN / 2) as u32)
        .into_styled(PrimitiveStyle::with_stroke(Rgb565::GREEN, 1))
        .draw(target)?;
    Pixel(Point::new(x, y), Rgb565::WHITE).draw(target)
}

/// Draw a whole screen. `lines` are the date and time on the standby
/// screen and the status lines on the info screen.
pub fn render<D>(target: &mut D, screen: &Screen, lines: &[String]) -> Result<(), D::Error>
where
    D: DrawTarget<Color = Rgb565>,
{
    let center = aligned(Alignment::Center, Baseline::Middle);
    target.clear(Rgb565::BLACK)?;

    match screen {
        Screen::Calibrate { target: point } => {
            let mid = (LCD_WIDTH / 2, LCD_HEIGHT / 2);
            text(target, "Calibrate Touchscreen", mid, center, true, Rgb565::WHITE)?;
            match point {
                Some(p) => reticule(target, *p)?,
                None => {
                    text(target, "Press button to save", (mid.0, mid.1 + 20), center, true, Rgb565::WHITE)?;
                    text(target, "Power off to re-do", (mid.0, mid.1 + 40), center, true, Rgb565::WHITE)?;
                }
            }
        }
        Screen::Standby => {
            header(target)?;
            for (i, line) in lines.iter().take(2).enumerate() {
                let y = LCD_HEIGHT / 2 - 8 + 16 * i as i32;
                text(target, line, (LCD_WIDTH / 2, y), center, true, Rgb565::WHITE)?;
            }
            let bottom = aligned(Alignment::Center, Baseline::Bottom);
            text(target, "Touch to begin...", (LCD_WIDTH / 2, LCD_HEIGHT), bottom, true, Rgb565::WHITE)?;
        }
        Screen::Info => {
            header(target)?;
            let left = aligned(Alignment::Left, Baseline::Top);
            for (i, line) in lines.iter().enumerate() {
                text(target, line, (0, INFO_TOP + LINE_HEIGHT * i as i32), left, false, Rgb565::WHITE)?;
            }
        }
        Screen::Menu { buttons, .. } => {
            for b in buttons {
                Rectangle::new(Point::new(b.rect.x, b.rect.y), Size::new(b.rect.w as u32, b.rect.h as u32))
                    .into_styled(PrimitiveStyle::with_fill(button_color(b.color)))
                    .draw(target)?;
                text(target, b.label, b.rect.center(), center, false, Rgb565::BLACK)?;
            }
        }
    }
    Ok(())
}

pub fn standby_lines<Tz: TimeZone>(now: &DateTime<Tz>) -> Vec<String>
where
    Tz::Offset: std::fmt::Display,
{
    let weekday = WEEKDAYS[now.weekday().num_days_from_sunday() as usize];
    vec![
        format!("{weekday} {}", now.format("%d.%m.%Y")),
        now.format("%H:%M:%S").to_string(),
    ]
}

pub struct Xpt2046<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> Xpt2046<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    fn sample(&mut self, cmd: u8) -> Result<i32, SPI::Error> {
        let mut buf = [cmd, 0, 0];
        self.spi.transfer_in_place(&mut buf)?;
        Ok((u16::from_be_bytes([buf[1], buf[2]]) >> 3) as i32)
    }

    /// Raw landscape reading, `None` while nothing presses the panel.
    pub fn read(&mut self) -> Result<Option<Touch>, SPI::Error> {
        let z1 = self.sample(XPT_Z1)?;
        let z2 = self.sample(XPT_Z2)?;
        let z = z1 + XPT_MAX - z2;
        if z < TOUCH_Z_THRESHOLD {
            self.sample(XPT_POWER_DOWN)?;
            return Ok(None);
        }

        // first conversion after the pressure channels settles the input
        self.sample(XPT_X)?;
        let x = self.sample(XPT_X)?;
        let y = self.sample(XPT_Y)?;
        self.sample(XPT_POWER_DOWN)?;
        Ok(Some(Touch {
            x: XPT_MAX - y,
            y: x,
            z,
        }))
    }
}

/// Board glue next to the panel: boot button, light sensor and backlight.
pub trait PanelIo {
    fn boot_button(&mut self) -> bool;
    fn ldr(&mut self) -> Option<i32>;
    fn set_backlight(&mut self, level: i32);
}

pub struct Panel<D, SPI, IO> {
    display: D,
    touch: Xpt2046<SPI>,
    io: IO,
    hostname: String,
    ldr: i32,
    started: std::time::Instant,
}

impl<D, SPI, IO> Panel<D, SPI, IO>
where
    D: DrawTarget<Color = Rgb565>,
    SPI: SpiDevice,
    IO: PanelIo,
{
    pub fn new(display: D, touch: SPI, io: IO, hostname: &str) -> Self {
        Self {
            display,
            touch: Xpt2046::new(touch),
            io,
            hostname: hostname.into(),
            ldr: 0,
            started: std::time::Instant::now(),
        }
    }

    fn info_lines(&self) -> Vec<String> {
        vec![
            format!("Build Date: {BUILD_DATE}"),
            format!("Build Time: {BUILD_TIME}"),
            format!("Hostname: {}", self.hostname),
            format!("Uptime: {}sec", self.started.elapsed().as_secs()),
            format!("LDR: {}", self.ldr),
        ]
    }
}

impl<D, SPI, IO> UiHardware for Panel<D, SPI, IO>
where
    D: DrawTarget<Color = Rgb565>,
    D::Error: std::fmt::Debug,
    SPI: SpiDevice,
    IO: PanelIo,
{
    fn touch(&mut self) -> Option<Touch> {
        match self.touch.read() {
            Ok(t) => t,
            Err(e) => {
                debug!("Touch read failed: {e:?}");
                None
            }
        }
    }

    fn boot_button(&mut self) -> bool {
        self.io.boot_button()
    }

    fn ldr(&mut self) -> Option<i32> {
        let value = self.io.ldr();
        if let Some(v) = value {
            self.ldr = v;
        }
        value
    }

    fn set_backlight(&mut self, level: i32) {
        self.io.set_backlight(level);
    }

    fn draw(&mut self, screen: &Screen) {
        let lines = match screen {
            Screen::Standby => standby_lines(&Local::now()),
            Screen::Info => self.info_lines(),
            _ => Vec::new(),
        };
        if let Err(e) = render(&mut self.display, screen, &lines) {
            error!("Display update failed: {e:?}");
        }
    }
}


// EOF
