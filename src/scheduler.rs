// scheduler.rs

use crate::*;

// 1% duty cycle: wait 100x the airtime after each transmission
pub const DUTY_CYCLE_FACTOR: u64 = 100;
pub const MIN_DEEP_SLEEP_SECS: u64 = 60;

/// Transmit gate. All times are milliseconds since boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DutyCycle {
    last_tx: u64,
    min_pause: u64,
}

impl DutyCycle {
    pub fn is_legal(&self, now: u64) -> bool {
        now > self.last_tx + self.min_pause
    }

    /// Account for a transmission that finished at `now` and took `airtime_ms`.
    pub fn record(&mut self, now: u64, airtime_ms: u64) {
        self.min_pause = airtime_ms * DUTY_CYCLE_FACTOR;
        self.last_tx = now;
    }

    pub fn min_pause(&self) -> u64 {
        self.min_pause
    }

    /// Seconds until transmitting is legal again, rounded up.
    pub fn wait_secs(&self, now: u64) -> u64 {
        if self.is_legal(now) {
            return 0;
        }
        let elapsed = now.saturating_sub(self.last_tx);
        (self.min_pause - elapsed) / 1000 + 1
    }

    pub fn deep_sleep_secs(&self) -> u64 {
        MIN_DEEP_SLEEP_SECS.max(self.min_pause / 1000)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Slot {
    value: f64,
    next_value: f64,
    ready: bool,
    has_next: bool,
    counter: u32,
    next_counter: u32,
}

/// One pending value per message type, plus one queued behind it.
#[derive(Clone, Debug, Default)]
pub struct TelemetryCache {
    slots: [Slot; MessageType::COUNT],
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, kind: MessageType, value: f64, counter: u32) {
        let slot = &mut self.slots[kind.index()];
        if slot.ready {
            // still waiting to be sent, keep it for the next cycle
            slot.has_next = true;
            slot.next_value = value;
            slot.next_counter = counter;
        } else {
            slot.ready = true;
            slot.value = value;
            slot.counter = counter;
        }
    }

    pub fn pending(&self, kind: MessageType) -> Option<(f64, u32)> {
        let slot = &self.slots[kind.index()];
        slot.ready.then_some((slot.value, slot.counter))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s.ready)
    }

    /// The value was transmitted: promote the queued value or free the slot.
    pub fn mark_sent(&mut self, kind: MessageType) {
        let slot = &mut self.slots[kind.index()];
        if slot.has_next {
            slot.has_next = false;
            slot.value = slot.next_value;
            slot.counter = slot.next_counter;
        } else {
            slot.ready = false;
        }
    }

    /// Ready types sharing the lowest reading counter.
    pub fn oldest_ready(&self) -> Vec<MessageType> {
        let Some(min) = self.slots.iter().filter(|s| s.ready).map(|s| s.counter).min() else {
            return Vec::new();
        };
        MessageType::ALL
            .iter()
            .copied()
            .filter(|t| {
                let s = &self.slots[t.index()];
                s.ready && s.counter == min
            })
            .collect()
    }

    /// Keep-sending mode: try the oldest values, `send` reports success.
    pub fn send_oldest<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(MessageType, f64) -> bool,
    {
        let mut sent = 0;
        for kind in self.oldest_ready() {
            let value = self.slots[kind.index()].value;
            if send(kind, value) {
                self.mark_sent(kind);
                sent += 1;
            }
        }
        sent
    }

    /// One-per-wake mode: next ready type after `last`, wrapping around.
    pub fn next_after(&self, last: u8) -> Option<MessageType> {
        let mut idx = usize::from(last);
        for _ in 0..MessageType::COUNT {
            idx = (idx + 1) % MessageType::COUNT;
            if self.slots[idx].ready {
                return MessageType::from_u8(idx as u8);
            }
        }
        None
    }
}


// EOF
