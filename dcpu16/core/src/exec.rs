//! The dispatch loop: budget injection, chunk invocation, interrupt
//! delivery and the halt-and-catch-fire latch.

use std::thread;
use std::time::{Duration, Instant};

use crate::hardware::HardwareDevice;
use crate::interrupt::{InterruptLine, INTERRUPT_QUEUE_LIMIT};
use crate::jit::assembler::Context;
use crate::jit::cache::CodeCache;
use crate::jit::translate;
use crate::state::{Machine, Register};
use crate::Result;

/// Cycles per pacing slice when execution is throttled to a target clock.
pub const PACING_ATOM: u64 = 100;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Emit the per-instruction interrupt check inside translated chunks.
    /// With it off, interrupts are only delivered at chunk boundaries.
    pub cycle_hook: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { cycle_hook: true }
    }
}

/// The emulated processor: machine state, device bus, code cache and the
/// interrupt machinery, driven by [`Processor::inject`].
pub struct Processor {
    machine: Machine,
    devices: Vec<Box<dyn HardwareDevice>>,
    cache: CodeCache,
    irq: InterruptLine,
    isr: bool,
    hcf: bool,
    config: ProcessorConfig,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new(ProcessorConfig::default())
    }
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            machine: Machine::new(),
            devices: Vec::new(),
            cache: CodeCache::new(),
            irq: InterruptLine::new(),
            isr: false,
            hcf: false,
            config,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Handle devices use to post interrupts, from any thread.
    pub fn interrupt_line(&self) -> InterruptLine {
        self.irq.clone()
    }

    pub fn attach(&mut self, device: Box<dyn HardwareDevice>) {
        self.devices.push(device);
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Total cycles consumed so far.
    pub fn elapsed(&self) -> u64 {
        self.machine.elapsed
    }

    /// True once the machine has halted and caught fire.
    pub fn halted(&self) -> bool {
        self.hcf
    }

    /// Credit the budget and run until it drains (or HCF). Once HCF is set
    /// this short-circuits forever.
    pub fn inject(&mut self, cycles: u64) -> Result<()> {
        if self.hcf {
            return Ok(());
        }
        self.machine.info.cycles = self
            .machine
            .info
            .cycles
            .saturating_add(cycles.min(i64::MAX as u64) as i64);
        while self.cycle()? {}
        Ok(())
    }

    /// One dispatch step: translate on cache miss, check the budget, enter
    /// the chunk, account the cycles it consumed, then deliver one pending
    /// interrupt if the safe point flagged it (or one is deliverable at this
    /// boundary).
    fn cycle(&mut self) -> Result<bool> {
        if self.hcf {
            return Ok(false);
        }
        let pc = self.machine.info.pc;
        if !self.cache.contains(pc) {
            let translated = translate(&self.machine.memory, pc, self.config.cycle_hook)?;
            self.cache.install(pc, translated.chunk, translated.cost);
        }
        if self.machine.info.cycles < 0 {
            return Ok(false);
        }
        let Some(chunk) = self.cache.get(pc).map(|entry| entry.chunk.clone()) else {
            return Ok(false);
        };

        let before = self.machine.info.cycles;
        {
            let mut ctx = Context {
                machine: &mut self.machine,
                devices: &mut self.devices,
                irq: &self.irq,
                isr: &mut self.isr,
            };
            chunk.run(&mut ctx);
        }
        let consumed = before - self.machine.info.cycles;
        if consumed > 0 {
            self.machine.elapsed = self.machine.elapsed.saturating_add(consumed as u64);
        }

        // Overflow trips HCF within one dispatch step, deliverable or not.
        if self.irq.len() > INTERRUPT_QUEUE_LIMIT {
            self.hcf = true;
            return Ok(false);
        }
        // Chunk boundaries are safe points too, hook or no hook.
        if !self.isr && self.deliverable() {
            self.isr = true;
        }
        if self.isr {
            self.isr = false;
            if let Some(message) = self.irq.pop() {
                let return_pc = self.machine.info.pc;
                let a = self.machine.info.regs[Register::A.slot()];
                self.machine.push(return_pc);
                self.machine.push(a);
                self.machine.info.regs[Register::A.slot()] = message;
                self.machine.info.pc = self.machine.info.ia;
                self.machine.info.queue_interrupts = true;
            }
        }
        Ok(true)
    }

    fn deliverable(&self) -> bool {
        let info = &self.machine.info;
        info.ia != 0 && !info.queue_interrupts && !self.irq.is_empty()
    }

    /// Throttled run: inject [`PACING_ATOM`]-cycle slices and sleep between
    /// them so the guest clock approximates `khz`. Stops after `limit`
    /// cycles when given, or on HCF. No locks are held across the sleeps.
    pub fn run_paced(&mut self, khz: u32, limit: Option<u64>) -> Result<()> {
        let atom = Duration::from_secs_f64(PACING_ATOM as f64 / (f64::from(khz.max(1)) * 1000.0));
        let mut remaining = limit;
        let mut next = Instant::now() + atom;
        while !self.hcf {
            let slice = match remaining {
                Some(0) => break,
                Some(left) => left.min(PACING_ATOM),
                None => PACING_ATOM,
            };
            self.inject(slice)?;
            if let Some(left) = remaining.as_mut() {
                *left -= slice;
            }
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
            next += atom;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Lem1802;
    use dcpu16_asm::assemble;

    fn load(processor: &mut Processor, origin: u16, source: &str) {
        for (index, word) in assemble(source).unwrap().iter().enumerate() {
            processor
                .machine_mut()
                .memory
                .write(origin.wrapping_add(index as u16), *word);
        }
    }

    #[test]
    fn elapsed_matches_the_budget_spent() {
        let mut processor = Processor::default();
        load(&mut processor, 0, ":spin SET PC, spin\n");
        processor.inject(10).unwrap();
        let final_budget = processor.machine().info.cycles;
        assert!(final_budget < 0, "budget must drain past zero");
        assert_eq!(processor.elapsed(), (10 - final_budget) as u64);
    }

    #[test]
    fn interrupt_delivery_pushes_pc_then_a() {
        let mut processor = Processor::default();
        // Handler parks itself; INT fires from 0x0020.
        load(&mut processor, 0x0100, "SET PC, 0x0100\n");
        load(&mut processor, 0x0020, "INT 7\n");
        {
            let info = &mut processor.machine_mut().info;
            info.ia = 0x0100;
            info.pc = 0x0020;
            info.sp = 0xFFFE;
            info.regs[0] = 0xAAAA;
        }
        processor.inject(8).unwrap();

        let machine = processor.machine();
        assert_eq!(machine.info.regs[0], 0x0007, "A carries the message");
        assert_eq!(machine.info.sp, 0xFFFC);
        assert_eq!(
            machine.memory.read(0xFFFD),
            0x0021,
            "return PC points past the INT"
        );
        assert_eq!(machine.memory.read(0xFFFC), 0xAAAA, "old A under it");
        assert!(machine.info.queue_interrupts);
        assert!(!processor.halted());
    }

    #[test]
    fn queue_overflow_latches_hcf() {
        let mut processor = Processor::default();
        load(&mut processor, 0, ":spin SET A, 1\nSET PC, spin\n");
        processor.machine_mut().info.ia = 0x0100;
        let line = processor.interrupt_line();
        for n in 0..(INTERRUPT_QUEUE_LIMIT as u16 + 1) {
            line.enqueue(n);
        }
        processor.inject(100).unwrap();
        assert!(processor.halted());
        let elapsed = processor.elapsed();
        // HCF is sticky: further injections do nothing.
        processor.inject(100).unwrap();
        assert_eq!(processor.elapsed(), elapsed);
    }

    #[test]
    fn hardware_query_scatters_identity() {
        let mut processor = Processor::default();
        processor.attach(Box::new(Lem1802::new()));
        load(&mut processor, 0, "HWN J\nHWQ 0\n:spin SET PC, spin\n");
        processor.inject(16).unwrap();
        let info = &processor.machine().info;
        assert_eq!(info.regs[7], 1, "HWN reports one device");
        assert_eq!(info.regs[0], 0xF615);
        assert_eq!(info.regs[1], 0x7349);
        assert_eq!(info.regs[2], 0x1802);
        assert_eq!(info.regs[3], 0x8B36);
        assert_eq!(info.regs[4], 0x1C6C);
    }

    #[test]
    fn queueing_flag_defers_delivery_until_cleared() {
        let mut processor = Processor::default();
        load(&mut processor, 0x0100, "SET PC, 0x0100\n");
        // INT posts while queueing is on; the message may only land in A
        // once IAQ 0 reopens delivery.
        load(
            &mut processor,
            0,
            "IAQ 1\nINT 0x42\nSET A, 1\nIAQ 0\n:spin SET PC, spin\n",
        );
        processor.machine_mut().info.ia = 0x0100;
        processor.inject(40).unwrap();
        let info = &processor.machine().info;
        assert_eq!(info.regs[0], 0x0042, "message delivered after IAQ 0");
        assert_eq!(info.pc, 0x0100, "execution continues at the handler");
        assert!(info.queue_interrupts, "delivery re-arms queueing");
    }
}
