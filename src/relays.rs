// relays.rs

use std::io::Write;
use std::sync::Mutex as StdMutex;

use crate::*;

const SERIAL_CMD: u8 = 0xA0;
pub const SERIAL_SETTLE: Duration = Duration::from_millis(100);

/// Hardware behind a relay bank.
pub trait RelayDriver {
    fn apply(&mut self, index: usize, on: bool) -> AppResult<()>;

    /// Pause the hardware needs after each command.
    fn settle(&self) -> Duration {
        Duration::ZERO
    }
}

/// No hardware attached, state is only tracked.
pub struct NoRelays;

impl RelayDriver for NoRelays {
    fn apply(&mut self, _index: usize, _on: bool) -> AppResult<()> {
        Ok(())
    }
}

/// LC-Technology UART relay boards.
pub struct SerialRelays<P> {
    port: P,
    settle: Duration,
}

impl<P: Write> SerialRelays<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            settle: SERIAL_SETTLE,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }
}

/// `A0 id state sum`, relay ids on the board start at 1.
pub fn serial_relay_frame(index: usize, on: bool) -> [u8; 4] {
    let id = (index as u8).wrapping_add(1);
    let state = u8::from(on);
    let sum = SERIAL_CMD.wrapping_add(id).wrapping_add(state);
    [SERIAL_CMD, id, state, sum]
}

impl<P: Write> RelayDriver for SerialRelays<P> {
    fn apply(&mut self, index: usize, on: bool) -> AppResult<()> {
        let frame = serial_relay_frame(index, on);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn settle(&self) -> Duration {
        self.settle
    }
}

pub struct RelayBank {
    names: Vec<String>,
    states: Vec<bool>,
    driver: StdMutex<Box<dyn RelayDriver + Send>>,
}

impl RelayBank {
    pub fn new(names: Vec<String>, driver: Box<dyn RelayDriver + Send>) -> Self {
        let states = vec![false; names.len()];
        Self {
            names,
            states,
            driver: StdMutex::new(driver),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new(), Box::new(NoRelays))
    }

    /// Drive every relay to its configured start-up state. Blocks, call it before
    /// the runtime starts.
    pub fn init(&mut self, config: &MyConfig) {
        let settle = self.settle();
        for i in 0..self.count() {
            self.set(i, config.relay_initial_state(i));
            if !settle.is_zero() {
                std::thread::sleep(settle);
            }
        }
    }

    pub fn settle(&self) -> Duration {
        match self.driver.lock() {
            Ok(driver) => driver.settle(),
            Err(e) => e.into_inner().settle(),
        }
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }

    /// Switch one relay. Out of range indexes are ignored.
    pub fn set(&mut self, index: usize, on: bool) {
        if index >= self.count() {
            return;
        }
        self.states[index] = on;

        let driver = self.driver.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = driver.apply(index, on) {
            error!("Relay {index} switch failed: {e}");
        }
    }

    /// Without settle delays, see `set_relays` for boards that need them.
    pub fn set_all(&mut self, on: bool) {
        for i in 0..self.count() {
            self.set(i, on);
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.states.get(index).copied().unwrap_or(false)
    }

    pub fn name(&self, index: usize) -> &str {
        self.names.get(index).map(String::as_str).unwrap_or("Unknown")
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Switch one relay, or all of them when `target` is `None` or out of range.
/// The bank is unlocked while the hardware settles. Returns the switched ids.
pub async fn set_relays(relays: &RwLock<RelayBank>, target: Option<usize>, on: bool) -> Vec<usize> {
    let (ids, settle) = {
        let bank = relays.read().await;
        let ids = match target {
            Some(id) if id < bank.count() => vec![id],
            _ => (0..bank.count()).collect(),
        };
        (ids, bank.settle())
    };

    for id in &ids {
        relays.write().await.set(*id, on);
        if !settle.is_zero() {
            sleep(settle).await;
        }
    }
    ids
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayView {
    pub id: usize,
    pub name: String,
    pub state: bool,
}

impl RelayBank {
    pub fn view(&self) -> Vec<RelayView> {
        (0..self.count())
            .map(|id| RelayView {
                id,
                name: self.name(id).into(),
                state: self.get(id),
            })
            .collect()
    }
}


// EOF
