// telemetry.rs

use std::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::*;

/// type:u8, value:f64, checksum:u32, packed little-endian
pub const FRAME_LEN: usize = 13;
const VALUE_OFFSET: usize = 1;
const CHECKSUM_OFFSET: usize = 9;

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// linear battery curve for a single Li-Ion cell
const BAT_EMPTY_V: f32 = 3.2;
const BAT_FULL_V: f32 = 4.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    SumWh = 1,
    T1Wh = 2,
    T2Wh = 3,
    SumW = 4,
    L1W = 5,
    L2W = 6,
    L3W = 7,
    BatV = 8,
}

impl MessageType {
    pub const COUNT: usize = 9;

    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Hello,
        MessageType::SumWh,
        MessageType::T1Wh,
        MessageType::T2Wh,
        MessageType::SumW,
        MessageType::L1W,
        MessageType::L2W,
        MessageType::L3W,
        MessageType::BatV,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// InfluxDB field name used by the gateway.
    pub fn field_name(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::SumWh => "Sum_Wh",
            MessageType::T1Wh => "T1_Wh",
            MessageType::T2Wh => "T2_Wh",
            MessageType::SumW => "Sum_W",
            MessageType::L1W => "L1_W",
            MessageType::L2W => "L2_W",
            MessageType::L3W => "L3_W",
            MessageType::BatV => "vbat",
        }
    }
}

pub fn field_name(msg_type: u8) -> &'static str {
    match MessageType::from_u8(msg_type) {
        Some(MessageType::BatV) | None => "unknown",
        Some(t) => t.field_name(),
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("wrong frame length {0}, expected {len}", len = FRAME_LEN)]
    Length(usize),
    #[error("checksum mismatch: received 0x{received:08X}, computed 0x{computed:08X}")]
    Checksum { received: u32, computed: u32 },
}

/// Battery voltage and charge packed into the 8 value bytes of a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryStatus {
    pub volts: f32,
    pub percent: i32,
}

impl BatteryStatus {
    pub fn from_volts(volts: f32) -> Self {
        let frac = (volts - BAT_EMPTY_V) / (BAT_FULL_V - BAT_EMPTY_V);
        let percent = (frac.clamp(0.0, 1.0) * 100.0).round() as i32;
        Self { volts, percent }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[..4].copy_from_slice(&self.volts.to_le_bytes());
        b[4..].copy_from_slice(&self.percent.to_le_bytes());
        b
    }

    pub fn from_bytes(b: [u8; 8]) -> Self {
        let (v, p) = b.split_at(4);
        let mut volts = [0u8; 4];
        let mut percent = [0u8; 4];
        volts.copy_from_slice(v);
        percent.copy_from_slice(p);
        Self {
            volts: f32::from_le_bytes(volts),
            percent: i32::from_le_bytes(percent),
        }
    }

    /// The packed form travels through the cache as an f64 bit pattern.
    pub fn to_value(self) -> f64 {
        f64::from_le_bytes(self.to_bytes())
    }

    pub fn from_value(value: f64) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TelemetryMessage {
    pub msg_type: u8,
    pub value: f64,
}

impl TelemetryMessage {
    pub fn new(kind: MessageType, value: f64) -> Self {
        Self {
            msg_type: kind as u8,
            value,
        }
    }

    pub fn battery(status: BatteryStatus) -> Self {
        Self::new(MessageType::BatV, status.to_value())
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn battery_status(&self) -> Option<BatteryStatus> {
        match self.kind() {
            Some(MessageType::BatV) => Some(BatteryStatus::from_value(self.value)),
            _ => None,
        }
    }

    pub fn encode(&self, xor_key: Option<&[u8; FRAME_LEN]>) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.msg_type;
        frame[VALUE_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.value.to_le_bytes());
        let checksum = FRAME_CRC.checksum(&frame[..CHECKSUM_OFFSET]);
        frame[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());

        if let Some(key) = xor_key {
            xor_in_place(&mut frame, key);
        }
        frame
    }

    pub fn decode(data: &[u8], xor_key: Option<&[u8; FRAME_LEN]>) -> Result<Self, FrameError> {
        let mut frame: [u8; FRAME_LEN] = data.try_into().map_err(|_| FrameError::Length(data.len()))?;
        if let Some(key) = xor_key {
            xor_in_place(&mut frame, key);
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&frame[CHECKSUM_OFFSET..]);
        let received = u32::from_le_bytes(received);
        let computed = FRAME_CRC.checksum(&frame[..CHECKSUM_OFFSET]);
        if received != computed {
            return Err(FrameError::Checksum { received, computed });
        }

        let mut value = [0u8; 8];
        value.copy_from_slice(&frame[VALUE_OFFSET..CHECKSUM_OFFSET]);
        Ok(Self {
            msg_type: frame[0],
            value: f64::from_le_bytes(value),
        })
    }
}

fn xor_in_place(frame: &mut [u8; FRAME_LEN], key: &[u8; FRAME_LEN]) {
    frame.iter_mut().zip(key.iter()).for_each(|(b, k)| *b ^= k);
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; FRAME_LEN] = [
        0x5A, 0x13, 0x77, 0x00, 0xFF, 0x42, 0x99, 0x01, 0x10, 0xAB, 0xCD, 0xEF, 0x3C,
    ];

    #[test]
    fn checksum_is_standard_crc32() {
        assert_eq!(FRAME_CRC.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn frame_layout() {
        let frame = TelemetryMessage::new(MessageType::SumWh, 12345.6).encode(None);
        assert_eq!(
            frame,
            [0x01, 0xCD, 0xCC, 0xCC, 0xCC, 0xCC, 0x1C, 0xC8, 0x40, 0x9D, 0x6B, 0xFB, 0x0D]
        );
    }

    #[test]
    fn obfuscated_frame_decodes_with_key_only() {
        let msg = TelemetryMessage::new(MessageType::L2W, -42.5);
        let plain = msg.encode(None);
        let frame = msg.encode(Some(&KEY));
        assert_eq!(frame[0], plain[0] ^ KEY[0]);
        assert_eq!(frame[12], plain[12] ^ KEY[12]);

        assert_eq!(TelemetryMessage::decode(&frame, Some(&KEY)).unwrap(), msg);
        assert!(matches!(
            TelemetryMessage::decode(&frame, None),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn corrupted_frame_reports_both_checksums() {
        let mut frame = TelemetryMessage::new(MessageType::SumWh, 12345.6).encode(None);
        frame[3] ^= 0x01;
        match TelemetryMessage::decode(&frame, None) {
            Err(FrameError::Checksum { received, computed }) => {
                assert_eq!(received, 0x0DFB_6B9D);
                assert_ne!(computed, received);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(TelemetryMessage::decode(&[0u8; 12], None), Err(FrameError::Length(12)));
        assert_eq!(TelemetryMessage::decode(&[0u8; 14], None), Err(FrameError::Length(14)));
    }

    #[test]
    fn battery_status_packs_into_value() {
        let bat = BatteryStatus { volts: 3.9, percent: 70 };
        assert_eq!(bat.to_bytes(), [0x9A, 0x99, 0x79, 0x40, 0x46, 0x00, 0x00, 0x00]);

        let frame = TelemetryMessage::battery(bat).encode(Some(&KEY));
        let back = TelemetryMessage::decode(&frame, Some(&KEY)).unwrap();
        assert_eq!(back.battery_status(), Some(bat));
    }

    #[test]
    fn battery_percent_is_clamped() {
        assert_eq!(BatteryStatus::from_volts(4.5).percent, 100);
        assert_eq!(BatteryStatus::from_volts(3.7).percent, 50);
        assert_eq!(BatteryStatus::from_volts(2.9).percent, 0);
    }

    #[test]
    fn field_names() {
        assert_eq!(field_name(0), "hello");
        assert_eq!(field_name(1), "Sum_Wh");
        assert_eq!(field_name(7), "L3_W");
        assert_eq!(field_name(42), "unknown");
        assert_eq!(MessageType::from_u8(9), None);
        assert_eq!(MessageType::from_u8(4), Some(MessageType::SumW));
    }
}

// EOF
