// sml.rs
//
// Smart Message Language reader for electricity meters: transport framing,
// TL encoded values and the OBIS quantities we forward over LoRa.

use crc::{Crc, CRC_16_IBM_SDLC};

use crate::*;

const ESC: [u8; 4] = [0x1B; 4];
const BEGIN: [u8; 4] = [0x01; 4];
const END_MARK: u8 = 0x1A;

pub const MAX_FRAME_LEN: usize = 2048;
const MAX_DEPTH: usize = 16;
// a 2 KiB frame never needs more than 4 TL bytes
const MAX_TL_BYTES: usize = 4;

const TAG_GET_LIST_RESPONSE: u64 = 0x0701;
const VAL_LIST_INDEX: usize = 4;

const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SmlError {
    #[error("frame longer than {len} bytes", len = MAX_FRAME_LEN)]
    TooLong,
    #[error("invalid escape sequence {0:02X?}")]
    Escape([u8; 4]),
    #[error("CRC mismatch: received 0x{received:04X}, computed 0x{computed:04X}")]
    Crc { received: u16, computed: u16 },
    #[error("invalid padding {0}")]
    Padding(usize),
    #[error("truncated value at offset {0}")]
    Truncated(usize),
    #[error("invalid TL byte 0x{tl:02X} at offset {pos}")]
    TypeLength { tl: u8, pos: usize },
    #[error("nesting too deep")]
    TooDeep,
}

#[derive(Debug, PartialEq)]
pub enum SmlEvent {
    /// Start sequence seen, a new reading begins.
    Start,
    /// Complete frame with escapes and padding removed.
    Frame(Vec<u8>),
    Error(SmlError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Body,
    Escape,
}

/// Byte-at-a-time transport decoder.
pub struct SmlReader {
    phase: Phase,
    window: [u8; 8],
    raw: Vec<u8>,
    body: Vec<u8>,
    quad: [u8; 4],
    quad_len: usize,
    counter: u32,
}

impl Default for SmlReader {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SmlReader {
    /// `counter` continues the reading count kept across deep sleep.
    pub fn new(counter: u32) -> Self {
        Self {
            phase: Phase::Idle,
            window: [0; 8],
            raw: Vec::new(),
            body: Vec::new(),
            quad: [0; 4],
            quad_len: 0,
            counter,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn data_received(&self) -> bool {
        self.counter > 0
    }

    pub fn feed(&mut self, byte: u8) -> Option<SmlEvent> {
        if self.phase == Phase::Idle {
            self.window.copy_within(1.., 0);
            self.window[7] = byte;
            if self.window[..4] == ESC && self.window[4..] == BEGIN {
                self.start();
                return Some(SmlEvent::Start);
            }
            return None;
        }

        self.raw.push(byte);
        if self.raw.len() > MAX_FRAME_LEN {
            warn!("SML frame too long, dropped");
            self.reset();
            return Some(SmlEvent::Error(SmlError::TooLong));
        }

        self.quad[self.quad_len] = byte;
        self.quad_len += 1;
        if self.quad_len < self.quad.len() {
            return None;
        }
        self.quad_len = 0;
        let quad = self.quad;

        match self.phase {
            Phase::Body if quad == ESC => {
                self.phase = Phase::Escape;
                None
            }
            Phase::Body => {
                self.body.extend_from_slice(&quad);
                None
            }
            Phase::Escape if quad == ESC => {
                // escaped escape sequence, literal data
                self.body.extend_from_slice(&ESC);
                self.phase = Phase::Body;
                None
            }
            Phase::Escape if quad == BEGIN => {
                warn!("SML restart inside frame");
                self.start();
                Some(SmlEvent::Start)
            }
            Phase::Escape if quad[0] == END_MARK => Some(self.finish(quad)),
            _ => {
                self.reset();
                Some(SmlEvent::Error(SmlError::Escape(quad)))
            }
        }
    }

    fn start(&mut self) {
        self.reset();
        self.raw.extend_from_slice(&ESC);
        self.raw.extend_from_slice(&BEGIN);
        self.phase = Phase::Body;
        self.counter = self.counter.wrapping_add(1);
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.window = [0; 8];
        self.raw.clear();
        self.body.clear();
        self.quad_len = 0;
    }

    fn finish(&mut self, end: [u8; 4]) -> SmlEvent {
        let padding = usize::from(end[1]);
        let received = u16::from_le_bytes([end[2], end[3]]);
        // CRC covers everything up to and including the padding count
        let computed = X25.checksum(&self.raw[..self.raw.len() - 2]);

        let mut body = std::mem::take(&mut self.body);
        self.reset();

        if received != computed {
            return SmlEvent::Error(SmlError::Crc { received, computed });
        }
        if padding > 3 || padding > body.len() {
            return SmlEvent::Error(SmlError::Padding(padding));
        }
        body.truncate(body.len() - padding);
        SmlEvent::Frame(body)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SmlValue {
    Octets(Vec<u8>),
    Bool(bool),
    Int(i64),
    UInt(u64),
    List(Vec<SmlValue>),
    EndOfMessage,
}

impl SmlValue {
    fn as_list(&self) -> Option<&[SmlValue]> {
        match self {
            SmlValue::List(v) => Some(v),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            SmlValue::Int(v) => Some(*v as f64),
            SmlValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next_byte(&mut self) -> Result<u8, SmlError> {
        let b = *self.data.get(self.pos).ok_or(SmlError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SmlError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(SmlError::Truncated(self.pos))?;
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn value(&mut self, depth: usize) -> Result<SmlValue, SmlError> {
        if depth > MAX_DEPTH {
            return Err(SmlError::TooDeep);
        }

        let start = self.pos;
        let mut tl = self.next_byte()?;
        if tl == 0x00 {
            return Ok(SmlValue::EndOfMessage);
        }

        let kind = (tl >> 4) & 0x07;
        let mut len = usize::from(tl & 0x0F);
        let mut tl_len = 1;
        while tl & 0x80 != 0 {
            if tl_len == MAX_TL_BYTES {
                return Err(SmlError::TypeLength { tl, pos: start });
            }
            tl = self.next_byte()?;
            tl_len += 1;
            len = (len << 4) | usize::from(tl & 0x0F);
        }

        if kind == 0x07 {
            let items = (0..len)
                .map(|_| self.value(depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(SmlValue::List(items));
        }

        // for everything but lists the length counts the TL bytes too
        let data_len = len
            .checked_sub(tl_len)
            .ok_or(SmlError::TypeLength { tl, pos: start })?;
        let data = self.take(data_len)?;

        match kind {
            0x00 => Ok(SmlValue::Octets(data.to_vec())),
            0x04 if data_len == 1 => Ok(SmlValue::Bool(data[0] != 0)),
            0x05 if (1..=8).contains(&data_len) => {
                let fill = if data[0] & 0x80 != 0 { 0xFF } else { 0x00 };
                let mut buf = [fill; 8];
                buf[8 - data_len..].copy_from_slice(data);
                Ok(SmlValue::Int(i64::from_be_bytes(buf)))
            }
            0x06 if (1..=8).contains(&data_len) => {
                let mut buf = [0u8; 8];
                buf[8 - data_len..].copy_from_slice(data);
                Ok(SmlValue::UInt(u64::from_be_bytes(buf)))
            }
            _ => Err(SmlError::TypeLength {
                tl: self.data[start],
                pos: start,
            }),
        }
    }
}

/// Decode every TL value of a frame body.
pub fn parse_values(body: &[u8]) -> Result<Vec<SmlValue>, SmlError> {
    let mut cur = Cursor { data: body, pos: 0 };
    let mut values = Vec::new();
    while cur.pos < body.len() {
        values.push(cur.value(0)?);
    }
    Ok(values)
}

/// `(OBIS, value)` pairs of all GetList.Res messages, scaler applied.
pub fn list_entries(messages: &[SmlValue]) -> Vec<([u8; 6], f64)> {
    let mut out = Vec::new();
    for msg in messages {
        let Some(body) = msg.as_list().and_then(|m| m.get(3)).and_then(SmlValue::as_list) else {
            continue;
        };
        let (Some(SmlValue::UInt(tag)), Some(content)) = (body.first(), body.get(1)) else {
            continue;
        };
        if *tag != TAG_GET_LIST_RESPONSE {
            continue;
        }
        let Some(val_list) = content
            .as_list()
            .and_then(|c| c.get(VAL_LIST_INDEX))
            .and_then(SmlValue::as_list)
        else {
            continue;
        };

        for entry in val_list.iter().filter_map(SmlValue::as_list) {
            let Some(SmlValue::Octets(name)) = entry.first() else {
                continue;
            };
            let Ok(obis) = <[u8; 6]>::try_from(name.as_slice()) else {
                continue;
            };
            let Some(raw) = entry.get(5).and_then(SmlValue::as_number) else {
                continue;
            };
            let scaler = match entry.get(4) {
                Some(SmlValue::Int(s)) => *s as i32,
                _ => 0,
            };
            out.push((obis, raw * 10f64.powi(scaler)));
        }
    }
    out
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SmlReading {
    pub sum_wh: Option<f64>,
    pub t1_wh: Option<f64>,
    pub t2_wh: Option<f64>,
    pub sum_w: Option<f64>,
    pub l1_w: Option<f64>,
    pub l2_w: Option<f64>,
    pub l3_w: Option<f64>,
}

type ObisSetter = fn(&mut SmlReading, f64);

const OBIS_HANDLERS: [([u8; 6], ObisSetter); 7] = [
    ([1, 0, 1, 8, 0, 255], |r, v| r.sum_wh = Some(v)), // 1-0:1.8.0 T1 + T2 Wh
    ([1, 0, 1, 8, 1, 255], |r, v| r.t1_wh = Some(v)),  // 1-0:1.8.1 T1 Wh
    ([1, 0, 1, 8, 2, 255], |r, v| r.t2_wh = Some(v)),  // 1-0:1.8.2 T2 Wh
    ([1, 0, 16, 7, 0, 255], |r, v| r.sum_w = Some(v)), // 1-0:16.7.0 L1 + L2 + L3 W
    ([1, 0, 21, 7, 0, 255], |r, v| r.l1_w = Some(v)),  // 1-0:21.7.0 L1 W
    ([1, 0, 41, 7, 0, 255], |r, v| r.l2_w = Some(v)),  // 1-0:41.7.0 L2 W
    ([1, 0, 61, 7, 0, 255], |r, v| r.l3_w = Some(v)),  // 1-0:61.7.0 L3 W
];

const SAME_WH: f64 = 0.1;

fn near(a: f64, b: f64) -> bool {
    (a - b).abs() < SAME_WH
}

impl SmlReading {
    pub fn parse(body: &[u8]) -> Result<Self, SmlError> {
        let values = parse_values(body)?;
        let mut reading = Self::default();
        for (obis, value) in list_entries(&values) {
            reading.apply(&obis, value);
        }
        Ok(reading)
    }

    pub fn apply(&mut self, obis: &[u8; 6], value: f64) {
        if let Some((_, set)) = OBIS_HANDLERS.iter().find(|(o, _)| o == obis) {
            set(self, value);
        }
    }

    /// Values to transmit. Power readings go as they are, energy readings
    /// collapse to the single active tariff register when possible.
    pub fn telemetry(&self) -> Vec<(MessageType, f64)> {
        let mut out: Vec<(MessageType, f64)> = [
            (MessageType::SumW, self.sum_w),
            (MessageType::L1W, self.l1_w),
            (MessageType::L2W, self.l2_w),
            (MessageType::L3W, self.l3_w),
        ]
        .into_iter()
        .filter_map(|(t, v)| v.map(|v| (t, v)))
        .collect();

        let zero_or_none = |v: Option<f64>| v.is_none_or(|v| v.abs() < SAME_WH);

        match (self.sum_wh, self.t1_wh, self.t2_wh) {
            (Some(sum), Some(t1), t2) if near(sum, t1) && zero_or_none(t2) => {
                out.push((MessageType::T1Wh, t1));
            }
            (Some(sum), t1, Some(t2)) if near(sum, t2) && zero_or_none(t1) => {
                out.push((MessageType::T2Wh, t2));
            }
            (sum, t1, t2) => {
                out.extend(
                    [
                        (MessageType::SumWh, sum),
                        (MessageType::T1Wh, t1),
                        (MessageType::T2Wh, t2),
                    ]
                    .into_iter()
                    .filter_map(|(t, v)| v.map(|v| (t, v))),
                );
            }
        }
        out
    }

    pub fn log(&self) {
        info!("SML Reading:");
        let lines = [
            ("Sum", self.sum_wh, "Wh"),
            (" T1", self.t1_wh, "Wh"),
            (" T2", self.t2_wh, "Wh"),
            ("Sum", self.sum_w, "W"),
            (" L1", self.l1_w, "W"),
            (" L2", self.l2_w, "W"),
            (" L3", self.l3_w, "W"),
        ];
        for (name, value, unit) in lines {
            if let Some(v) = value {
                info!("{name}: {v:14.3} {unit}");
            }
        }
    }
}


// EOF
