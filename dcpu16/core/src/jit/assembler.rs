//! Emission back-end for the translator.
//!
//! The assembler collects host-callable ops into a chunk buffer, with the
//! label/bind protocol conditional chains need: a forward label is created,
//! branch ops reference it, and it is bound to the next emitted position.
//! `finalize` resolves every branch target and produces an immutable
//! [`Chunk`], the unit the code cache stores and the dispatcher invokes with
//! the execution context as its sole argument.

use thiserror::Error;

use crate::hardware::HardwareDevice;
use crate::interrupt::InterruptLine;
use crate::state::Machine;

/// Ops a single chunk may hold. Hitting the cap is an emission error, not a
/// guest-visible condition; the executor treats it as fatal.
pub const CHUNK_OP_LIMIT: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("chunk buffer full ({CHUNK_OP_LIMIT} ops)")]
    BufferFull,
    #[error("label bound twice")]
    LabelRebound,
    #[error("branch to a label that was never bound")]
    UnboundLabel,
}

/// Everything a running chunk may touch: the machine it mutates, the device
/// list for hardware ops, the interrupt line the cycle hook polls, and the
/// ISR flag the hook raises to force a return to the dispatcher.
pub struct Context<'a> {
    pub machine: &'a mut Machine,
    pub devices: &'a mut [Box<dyn HardwareDevice>],
    pub irq: &'a InterruptLine,
    pub isr: &'a mut bool,
}

/// Control decision returned by each op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    Ret,
}

pub type OpFn = Box<dyn Fn(&mut Context<'_>) -> Step>;
pub type TestFn = Box<dyn Fn(&mut Context<'_>) -> bool>;

/// Forward reference into the chunk, resolved at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Op {
    Thunk(OpFn),
    /// Conditional test: falls through while `test` holds; otherwise debits
    /// `skip_cost` from the cycle budget and jumps to `target`.
    BranchUnless {
        test: TestFn,
        skip_cost: i64,
        target: Label,
    },
    Ret,
}

#[derive(Default)]
pub struct Assembler {
    ops: Vec<Op>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted position.
    pub fn bind(&mut self, label: Label) -> Result<(), AssemblyError> {
        let slot = &mut self.labels[label.0];
        if slot.is_some() {
            return Err(AssemblyError::LabelRebound);
        }
        *slot = Some(self.ops.len());
        Ok(())
    }

    fn push(&mut self, op: Op) -> Result<(), AssemblyError> {
        if self.ops.len() >= CHUNK_OP_LIMIT {
            return Err(AssemblyError::BufferFull);
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn thunk(
        &mut self,
        f: impl Fn(&mut Context<'_>) -> Step + 'static,
    ) -> Result<(), AssemblyError> {
        self.push(Op::Thunk(Box::new(f)))
    }

    pub fn branch_unless(
        &mut self,
        test: impl Fn(&mut Context<'_>) -> bool + 'static,
        skip_cost: i64,
        target: Label,
    ) -> Result<(), AssemblyError> {
        self.push(Op::BranchUnless {
            test: Box::new(test),
            skip_cost,
            target,
        })
    }

    /// The chunk footer: plain return to the dispatcher.
    pub fn ret(&mut self) -> Result<(), AssemblyError> {
        self.push(Op::Ret)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolve branch targets and seal the buffer.
    pub fn finalize(self) -> Result<Chunk, AssemblyError> {
        let labels = self.labels;
        let ops = self
            .ops
            .into_iter()
            .map(|op| {
                Ok(match op {
                    Op::Thunk(f) => ChunkOp::Thunk(f),
                    Op::BranchUnless {
                        test,
                        skip_cost,
                        target,
                    } => ChunkOp::BranchUnless {
                        test,
                        skip_cost,
                        target: labels[target.0].ok_or(AssemblyError::UnboundLabel)?,
                    },
                    Op::Ret => ChunkOp::Ret,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Chunk { ops })
    }
}

enum ChunkOp {
    Thunk(OpFn),
    BranchUnless {
        test: TestFn,
        skip_cost: i64,
        target: usize,
    },
    Ret,
}

/// A finalized, host-callable chunk.
pub struct Chunk {
    ops: Vec<ChunkOp>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("ops", &self.ops.len()).finish()
    }
}

impl Chunk {
    /// Execute the chunk until an op returns to the dispatcher.
    pub fn run(&self, ctx: &mut Context<'_>) {
        let mut index = 0;
        while let Some(op) = self.ops.get(index) {
            match op {
                ChunkOp::Thunk(f) => match f(ctx) {
                    Step::Next => index += 1,
                    Step::Ret => return,
                },
                ChunkOp::BranchUnless {
                    test,
                    skip_cost,
                    target,
                } => {
                    if test(ctx) {
                        index += 1;
                    } else {
                        ctx.machine.info.cycles -= skip_cost;
                        index = *target;
                    }
                }
                ChunkOp::Ret => return,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunk: &Chunk) -> Machine {
        let mut machine = Machine::new();
        let mut devices: Vec<Box<dyn HardwareDevice>> = Vec::new();
        let irq = InterruptLine::new();
        let mut isr = false;
        let mut ctx = Context {
            machine: &mut machine,
            devices: &mut devices,
            irq: &irq,
            isr: &mut isr,
        };
        chunk.run(&mut ctx);
        machine
    }

    #[test]
    fn thunks_run_in_order_until_ret() {
        let mut asm = Assembler::new();
        asm.thunk(|ctx| {
            ctx.machine.info.regs[0] = 1;
            Step::Next
        })
        .unwrap();
        asm.thunk(|ctx| {
            ctx.machine.info.regs[1] = 2;
            Step::Ret
        })
        .unwrap();
        asm.thunk(|ctx| {
            ctx.machine.info.regs[2] = 3;
            Step::Next
        })
        .unwrap();
        asm.ret().unwrap();
        let machine = run(&asm.finalize().unwrap());
        assert_eq!(machine.info.regs[..3], [1, 2, 0]);
    }

    #[test]
    fn failed_branch_debits_and_skips_to_label() {
        let mut asm = Assembler::new();
        let end = asm.new_label();
        asm.branch_unless(|_| false, 3, end).unwrap();
        asm.thunk(|ctx| {
            ctx.machine.info.regs[0] = 0xBAD;
            Step::Next
        })
        .unwrap();
        asm.bind(end).unwrap();
        asm.thunk(|ctx| {
            ctx.machine.info.regs[1] = 1;
            Step::Next
        })
        .unwrap();
        asm.ret().unwrap();
        let machine = run(&asm.finalize().unwrap());
        assert_eq!(machine.info.regs[0], 0, "guarded op must be skipped");
        assert_eq!(machine.info.regs[1], 1);
        assert_eq!(machine.info.cycles, -3);
    }

    #[test]
    fn unbound_label_is_an_emission_error() {
        let mut asm = Assembler::new();
        let dangling = asm.new_label();
        asm.branch_unless(|_| true, 1, dangling).unwrap();
        asm.ret().unwrap();
        assert_eq!(asm.finalize().unwrap_err(), AssemblyError::UnboundLabel);
    }

    #[test]
    fn buffer_overflow_is_reported() {
        let mut asm = Assembler::new();
        for _ in 0..CHUNK_OP_LIMIT {
            asm.thunk(|_| Step::Next).unwrap();
        }
        assert_eq!(
            asm.thunk(|_| Step::Next).unwrap_err(),
            AssemblyError::BufferFull
        );
    }
}
