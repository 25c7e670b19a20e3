//! Hardware bus contract and the bundled devices.
//!
//! A device handler runs synchronously on the executor thread with exclusive
//! access to the machine. Devices that need background work (the clock) own a
//! thread of their own and talk back exclusively through the thread-safe
//! [`InterruptLine`]; they never touch registers or memory off-thread.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::interrupt::InterruptLine;
use crate::state::{Machine, Register};

/// Identification triple reported through HWQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub id: u32,
    pub manufacturer: u32,
    pub revision: u16,
}

impl HardwareInfo {
    /// Scatter the triple into registers the way HWQ defines:
    /// A/B take the id, C the revision, X/Y the manufacturer.
    pub fn store(&self, machine: &mut Machine) {
        machine.info.set(Register::A, self.id as u16);
        machine.info.set(Register::B, (self.id >> 16) as u16);
        machine.info.set(Register::C, self.revision);
        machine.info.set(Register::X, self.manufacturer as u16);
        machine.info.set(Register::Y, (self.manufacturer >> 16) as u16);
    }
}

pub trait HardwareDevice: Send {
    fn info(&self) -> HardwareInfo;

    /// Handle an HWI directed at this device. Returns the cycle cost the
    /// handler consumed, debited on top of HWI's base cost.
    fn on_interrupt(&mut self, machine: &mut Machine) -> u8;
}

const CLOCK_ID: u32 = 0x12D0_B402;
const CLOCK_REVISION: u16 = 1;

struct ClockShared {
    stop: AtomicBool,
    message: AtomicU16,
    ticks: AtomicU64,
}

/// The generic clock: HWI 0 sets the tick divisor and restarts the ticker,
/// HWI 1 reads ticks since the last divisor write into C, HWI 2 selects the
/// interrupt message (0 disables interrupts). The ticker thread sleeps
/// between ticks and enqueues the message; it polls a stop flag between
/// waits so teardown can join it promptly.
pub struct Clock {
    irq: InterruptLine,
    shared: Option<Arc<ClockShared>>,
    ticker: Option<JoinHandle<()>>,
    message: u16,
}

impl Clock {
    pub fn new(irq: InterruptLine) -> Self {
        Self {
            irq,
            shared: None,
            ticker: None,
            message: 0,
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.stop.store(true, Ordering::SeqCst);
        }
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }

    fn start_ticker(&mut self, divisor: u16) {
        let shared = Arc::new(ClockShared {
            stop: AtomicBool::new(false),
            message: AtomicU16::new(self.message),
            ticks: AtomicU64::new(0),
        });
        let period = Duration::from_secs_f64(f64::from(divisor) / 60.0);
        let irq = self.irq.clone();
        let worker = Arc::clone(&shared);
        // Sleep in short steps so teardown never waits a full tick to join.
        let handle = thread::spawn(move || {
            'ticker: loop {
                let mut slept = Duration::ZERO;
                while slept < period {
                    let step = (period - slept).min(Duration::from_millis(20));
                    thread::sleep(step);
                    if worker.stop.load(Ordering::SeqCst) {
                        break 'ticker;
                    }
                    slept += step;
                }
                worker.ticks.fetch_add(1, Ordering::SeqCst);
                let message = worker.message.load(Ordering::SeqCst);
                if message != 0 {
                    irq.enqueue(message);
                }
            }
        });
        self.shared = Some(shared);
        self.ticker = Some(handle);
    }

    fn ticks(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|shared| shared.ticks.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl HardwareDevice for Clock {
    fn info(&self) -> HardwareInfo {
        HardwareInfo {
            id: CLOCK_ID,
            manufacturer: 0,
            revision: CLOCK_REVISION,
        }
    }

    fn on_interrupt(&mut self, machine: &mut Machine) -> u8 {
        let a = machine.info.get(Register::A);
        let b = machine.info.get(Register::B);
        match a {
            0 => {
                self.stop_ticker();
                if b != 0 {
                    self.start_ticker(b);
                }
            }
            1 => {
                machine.info.set(Register::C, self.ticks() as u16);
            }
            2 => {
                self.message = b;
                if let Some(shared) = &self.shared {
                    shared.message.store(b, Ordering::SeqCst);
                }
            }
            _ => {}
        }
        0
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

const LEM1802_ID: u32 = 0x7349_F615;
const LEM1802_MANUFACTURER: u32 = 0x1C6C_8B36;
const LEM1802_REVISION: u16 = 0x1802;

/// LEM1802 monitor. Latches its map registers; rendering is a front-end
/// concern and stays outside the core.
#[derive(Debug, Default)]
pub struct Lem1802 {
    pub screen_map: u16,
    pub font_map: u16,
    pub palette_map: u16,
    pub border_color: u16,
}

impl Lem1802 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HardwareDevice for Lem1802 {
    fn info(&self) -> HardwareInfo {
        HardwareInfo {
            id: LEM1802_ID,
            manufacturer: LEM1802_MANUFACTURER,
            revision: LEM1802_REVISION,
        }
    }

    fn on_interrupt(&mut self, machine: &mut Machine) -> u8 {
        let b = machine.info.get(Register::B);
        match machine.info.get(Register::A) {
            0 => self.screen_map = b,
            1 => self.font_map = b,
            2 => self.palette_map = b,
            3 => self.border_color = b & 0xF,
            _ => {}
        }
        0
    }
}

const SPED3_ID: u32 = 0x42BA_BF3C;
const SPED3_MANUFACTURER: u32 = 0x1EB3_7E91;
const SPED3_REVISION: u16 = 0x0003;

#[derive(Debug, Default)]
pub struct Sped3 {
    pub region: u16,
    pub vertex_count: u16,
    pub rotation: u16,
}

impl Sped3 {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> u16 {
        if self.vertex_count == 0 {
            0 // no vertices queued
        } else if self.rotation != 0 {
            2 // turning toward a new angle
        } else {
            1 // projecting
        }
    }
}

impl HardwareDevice for Sped3 {
    fn info(&self) -> HardwareInfo {
        HardwareInfo {
            id: SPED3_ID,
            manufacturer: SPED3_MANUFACTURER,
            revision: SPED3_REVISION,
        }
    }

    fn on_interrupt(&mut self, machine: &mut Machine) -> u8 {
        match machine.info.get(Register::A) {
            0 => {
                machine.info.set(Register::B, self.state());
                machine.info.set(Register::C, 0);
            }
            1 => {
                self.region = machine.info.get(Register::X);
                self.vertex_count = machine.info.get(Register::Y);
            }
            2 => {
                self.rotation = machine.info.get(Register::X) % 360;
            }
            _ => {}
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwq_scatter_splits_dwords() {
        let mut machine = Machine::new();
        let info = HardwareInfo {
            id: 0x12D0_B402,
            manufacturer: 0xAABB_CCDD,
            revision: 7,
        };
        info.store(&mut machine);
        assert_eq!(machine.info.get(Register::A), 0xB402);
        assert_eq!(machine.info.get(Register::B), 0x12D0);
        assert_eq!(machine.info.get(Register::C), 7);
        assert_eq!(machine.info.get(Register::X), 0xCCDD);
        assert_eq!(machine.info.get(Register::Y), 0xAABB);
    }

    #[test]
    fn clock_reports_published_identity() {
        let clock = Clock::new(InterruptLine::new());
        let info = clock.info();
        assert_eq!(info.id, 0x12D0_B402);
        assert_eq!(info.manufacturer, 0);
        assert_eq!(info.revision, 1);
    }

    #[test]
    fn clock_teardown_joins_ticker() {
        let irq = InterruptLine::new();
        let mut machine = Machine::new();
        let mut clock = Clock::new(irq.clone());
        // HWI 0 with B=1: fastest divisor, ticker running.
        machine.info.set(Register::A, 0);
        machine.info.set(Register::B, 1);
        clock.on_interrupt(&mut machine);
        // HWI 2: pick a message so ticks become interrupts.
        machine.info.set(Register::A, 2);
        machine.info.set(Register::B, 0x0042);
        clock.on_interrupt(&mut machine);
        drop(clock); // must not hang
    }

    #[test]
    fn lem_latches_map_registers() {
        let mut machine = Machine::new();
        let mut lem = Lem1802::new();
        machine.info.set(Register::A, 0);
        machine.info.set(Register::B, 0x8000);
        lem.on_interrupt(&mut machine);
        machine.info.set(Register::A, 3);
        machine.info.set(Register::B, 0x1F);
        lem.on_interrupt(&mut machine);
        assert_eq!(lem.screen_map, 0x8000);
        assert_eq!(lem.border_color, 0xF, "border color keeps low nibble");
    }
}
