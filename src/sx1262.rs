// sx1262.rs: SX1262 LoRa transceiver over SPI

use std::time::Instant;

use crate::*;

// https://www.semtech.com/products/wireless-rf/lora-connect/sx1262

pub const LORA_FREQ_HZ: u64 = 866_300_000;
const XTAL_HZ: u64 = 32_000_000;

// 14 dBm allowed, minus 5 dBi antenna gain
pub const LORA_TX_POWER: i8 = 9;
const LORA_PREAMBLE: u16 = 8;

const SF9: u8 = 0x09;
const BW_250: u8 = 0x05;
const CR_4_7: u8 = 0x03;

const SYNC_WORD_REG: u16 = 0x0740;
const SYNC_WORD_PRIVATE: [u8; 2] = [0x14, 0x24];

const CMD_SET_STANDBY: u8 = 0x80;
const CMD_SET_PACKET_TYPE: u8 = 0x8A;
const CMD_SET_RF_FREQUENCY: u8 = 0x86;
const CMD_SET_PA_CONFIG: u8 = 0x95;
const CMD_SET_TX_PARAMS: u8 = 0x8E;
const CMD_SET_MODULATION_PARAMS: u8 = 0x8B;
const CMD_SET_PACKET_PARAMS: u8 = 0x8C;
const CMD_SET_BUFFER_BASE: u8 = 0x8F;
const CMD_SET_DIO_IRQ_PARAMS: u8 = 0x08;
const CMD_SET_DIO2_RF_SWITCH: u8 = 0x9D;
const CMD_SET_DIO3_TCXO: u8 = 0x97;
const CMD_CALIBRATE: u8 = 0x89;
const CMD_CALIBRATE_IMAGE: u8 = 0x98;
const CMD_WRITE_REGISTER: u8 = 0x0D;
const CMD_WRITE_BUFFER: u8 = 0x0E;
const CMD_READ_BUFFER: u8 = 0x1E;
const CMD_SET_TX: u8 = 0x83;
const CMD_SET_RX: u8 = 0x82;
const CMD_GET_IRQ_STATUS: u8 = 0x12;
const CMD_CLEAR_IRQ_STATUS: u8 = 0x02;
const CMD_GET_RX_BUFFER_STATUS: u8 = 0x13;
const CMD_GET_PACKET_STATUS: u8 = 0x14;

const IRQ_TX_DONE: u16 = 0x0001;
const IRQ_RX_DONE: u16 = 0x0002;
const IRQ_CRC_ERR: u16 = 0x0040;
const IRQ_TIMEOUT: u16 = 0x0200;
const IRQ_ALL: u16 = 0x03FF;

const STANDBY_RC: u8 = 0x00;
const PACKET_TYPE_LORA: u8 = 0x01;
const RAMP_200U: u8 = 0x04;
// 1.8 V TCXO, 5 ms startup
const TCXO_1V8: [u8; 4] = [0x02, 0x00, 0x01, 0x40];
const RX_CONTINUOUS: [u8; 3] = [0xFF, 0xFF, 0xFF];

const BUSY_TIMEOUT_MS: u32 = 100;
const TX_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Sx1262Radio<'a> {
    spi: spi::SpiDeviceDriver<'a, &'a spi::SpiDriver<'a>>,
    busy: PinDriver<'a, AnyInputPin, Input>,
    reset: PinDriver<'a, AnyOutputPin, Output>,
}

fn radio_err<E: std::fmt::Debug>(e: E) -> AppError {
    AppError::Radio(format!("SPI: {e:?}"))
}

impl<'a> Sx1262Radio<'a> {
    pub fn new(
        spi: spi::SpiDeviceDriver<'a, &'a spi::SpiDriver<'a>>,
        busy: PinDriver<'a, AnyInputPin, Input>,
        reset: PinDriver<'a, AnyOutputPin, Output>,
    ) -> Self {
        Self { spi, busy, reset }
    }

    fn wait_busy(&self) -> AppResult<()> {
        for _ in 0..BUSY_TIMEOUT_MS {
            if self.busy.is_low() {
                return Ok(());
            }
            FreeRtos::delay_ms(1);
        }
        Err(AppError::Radio("SX1262 stuck busy".into()))
    }

    fn command(&mut self, cmd: u8, args: &[u8]) -> AppResult<()> {
        self.wait_busy()?;
        let mut buf = Vec::with_capacity(args.len() + 1);
        buf.push(cmd);
        buf.extend_from_slice(args);
        self.spi.write(&buf).map_err(radio_err)
    }

    /// Command with `n` response bytes after the status byte.
    fn query(&mut self, cmd: u8, n: usize) -> AppResult<Vec<u8>> {
        self.wait_busy()?;
        let mut buf = vec![0u8; n + 2];
        buf[0] = cmd;
        self.spi.transfer_in_place(&mut buf).map_err(radio_err)?;
        Ok(buf.split_off(2))
    }

    fn write_register(&mut self, addr: u16, data: &[u8]) -> AppResult<()> {
        let mut args = addr.to_be_bytes().to_vec();
        args.extend_from_slice(data);
        self.command(CMD_WRITE_REGISTER, &args)
    }

    fn irq_status(&mut self) -> AppResult<u16> {
        let r = self.query(CMD_GET_IRQ_STATUS, 2)?;
        Ok(u16::from_be_bytes([r[0], r[1]]))
    }

    fn clear_irq(&mut self) -> AppResult<()> {
        self.command(CMD_CLEAR_IRQ_STATUS, &IRQ_ALL.to_be_bytes())
    }

    fn packet_params(&mut self, len: u8) -> AppResult<()> {
        let [pre_hi, pre_lo] = LORA_PREAMBLE.to_be_bytes();
        // explicit header, CRC on, standard IQ
        self.command(CMD_SET_PACKET_PARAMS, &[pre_hi, pre_lo, 0x00, len, 0x01, 0x00])
    }

    pub fn init(&mut self) -> AppResult<()> {
        info!("SX1262: Resetting radio...");
        self.reset.set_low()?;
        FreeRtos::delay_ms(2);
        self.reset.set_high()?;
        FreeRtos::delay_ms(10);

        self.command(CMD_SET_STANDBY, &[STANDBY_RC])?;
        self.command(CMD_SET_DIO3_TCXO, &TCXO_1V8)?;
        self.command(CMD_CALIBRATE, &[0x7F])?;
        FreeRtos::delay_ms(5);
        // 863-870 MHz band
        self.command(CMD_CALIBRATE_IMAGE, &[0xD7, 0xDB])?;
        self.command(CMD_SET_DIO2_RF_SWITCH, &[0x01])?;

        self.command(CMD_SET_PACKET_TYPE, &[PACKET_TYPE_LORA])?;
        let frf = ((LORA_FREQ_HZ << 25) / XTAL_HZ) as u32;
        self.command(CMD_SET_RF_FREQUENCY, &frf.to_be_bytes())?;

        self.command(CMD_SET_PA_CONFIG, &[0x04, 0x07, 0x00, 0x01])?;
        self.command(CMD_SET_TX_PARAMS, &[LORA_TX_POWER as u8, RAMP_200U])?;
        self.command(CMD_SET_MODULATION_PARAMS, &[SF9, BW_250, CR_4_7, 0x00])?;
        self.packet_params(0xFF)?;
        self.write_register(SYNC_WORD_REG, &SYNC_WORD_PRIVATE)?;
        self.command(CMD_SET_BUFFER_BASE, &[0x00, 0x00])?;

        let irq = (IRQ_TX_DONE | IRQ_RX_DONE | IRQ_CRC_ERR | IRQ_TIMEOUT).to_be_bytes();
        self.command(CMD_SET_DIO_IRQ_PARAMS, &[irq[0], irq[1], irq[0], irq[1], 0, 0, 0, 0])?;
        self.clear_irq()?;

        info!(
            "SX1262: {:.1} MHz, SF9, BW 250 kHz, CR 4/7, {} dBm",
            LORA_FREQ_HZ as f64 / 1e6,
            LORA_TX_POWER
        );
        Ok(())
    }
}

impl LoraRadio for Sx1262Radio<'_> {
    fn transmit(&mut self, data: &[u8]) -> AppResult<Duration> {
        let len = u8::try_from(data.len()).map_err(|_| AppError::Radio("packet too long".into()))?;

        self.command(CMD_SET_STANDBY, &[STANDBY_RC])?;
        self.packet_params(len)?;
        let mut args = vec![0x00];
        args.extend_from_slice(data);
        self.command(CMD_WRITE_BUFFER, &args)?;
        self.clear_irq()?;

        let start = Instant::now();
        // no radio timeout, guarded below
        self.command(CMD_SET_TX, &[0x00, 0x00, 0x00])?;
        loop {
            let irq = self.irq_status()?;
            if irq & IRQ_TX_DONE != 0 {
                break;
            }
            if start.elapsed() > TX_TIMEOUT {
                self.command(CMD_SET_STANDBY, &[STANDBY_RC])?;
                return Err(AppError::Radio("SX1262 transmit timeout".into()));
            }
            FreeRtos::delay_ms(1);
        }
        let airtime = start.elapsed();
        self.clear_irq()?;

        debug!("SX1262: sent {len} bytes in {} ms", airtime.as_millis());
        Ok(airtime)
    }

    fn start_receive(&mut self) -> AppResult<()> {
        self.command(CMD_SET_STANDBY, &[STANDBY_RC])?;
        self.packet_params(0xFF)?;
        self.clear_irq()?;
        self.command(CMD_SET_RX, &RX_CONTINUOUS)
    }

    fn poll_packet(&mut self) -> AppResult<Option<RxPacket>> {
        let irq = self.irq_status()?;
        if irq & IRQ_RX_DONE == 0 {
            return Ok(None);
        }
        self.clear_irq()?;
        if irq & IRQ_CRC_ERR != 0 {
            return Err(AppError::Radio("SX1262 CRC error".into()));
        }

        let status = self.query(CMD_GET_RX_BUFFER_STATUS, 2)?;
        let (len, offset) = (status[0] as usize, status[1]);

        self.wait_busy()?;
        let mut buf = vec![0u8; len + 3];
        buf[0] = CMD_READ_BUFFER;
        buf[1] = offset;
        self.spi.transfer_in_place(&mut buf).map_err(radio_err)?;
        let data = buf.split_off(3);

        let pkt = self.query(CMD_GET_PACKET_STATUS, 3)?;
        let rssi = -(pkt[0] as i16) / 2;
        let snr = (pkt[1] as i8) as f32 / 4.0;

        Ok(Some(RxPacket { data, rssi, snr }))
    }
}
// EOF
