//! The dynamic translation engine.
//!
//! [`translate`] decodes a straight-line span of guest instructions starting
//! at a given PC — a *chunk* — and compiles it into host ops through the
//! [`assembler`] back-end. A chunk ends at the first control-flow boundary:
//! an instruction that writes PC, JSR, the hardware opcodes, a software
//! interrupt, or an invalid opcode. Within the chunk, every instruction
//! debits its cycle cost and (unless disabled) passes the cycle hook, the
//! one safe point where a pending interrupt can force an early return.
//!
//! Conditional IF* runs are handled as a unit: a pre-scan counts the chain,
//! each test is emitted with the cycle penalty a failure at that position
//! costs, and all failures land on one shared label bound just past the
//! first non-conditional instruction after the chain.

pub mod assembler;
pub mod cache;

use once_cell::sync::Lazy;

use crate::decode::{decode, Instruction, Opcode, Operand, OperandKind, Role};
use crate::memory::Memory;
use crate::state::Register;

use assembler::{Assembler, AssemblyError, Chunk, Context, Step};

static TRACE_JIT: Lazy<bool> =
    Lazy::new(|| std::env::var("DCPU_TRACE_JIT").is_ok_and(|v| v != "0"));

/// A freshly translated chunk plus its static cycle cost (the debit a full
/// pass through the chunk performs, before conditional skips and device
/// costs).
pub struct TranslatedChunk {
    pub chunk: Chunk,
    pub cost: u32,
}

/// A resolved operand location. Resolution applies addressing side effects
/// (PUSH/POP stack adjustment) exactly once; reads and writes then go
/// through the location.
#[derive(Debug, Clone, Copy)]
enum Location {
    Reg(usize),
    Sp,
    Pc,
    Ex,
    Mem(u16),
    /// Literals read back their value; writes are silently discarded.
    Imm(u16),
}

fn resolve(ctx: &mut Context<'_>, operand: Operand) -> Location {
    let info = &mut ctx.machine.info;
    match operand.kind {
        OperandKind::Register(reg) => Location::Reg(reg.slot()),
        OperandKind::IndirectRegister(reg) => Location::Mem(info.regs[reg.slot()]),
        OperandKind::IndirectRegisterOffset(reg, offset) => {
            Location::Mem(info.regs[reg.slot()].wrapping_add(offset))
        }
        OperandKind::PushPop => match operand.role {
            // PUSH: pre-decrement, operand is [new SP].
            Role::B => {
                info.sp = info.sp.wrapping_sub(1);
                Location::Mem(info.sp)
            }
            // POP: operand is [old SP], post-increment.
            Role::A => {
                let address = info.sp;
                info.sp = info.sp.wrapping_add(1);
                Location::Mem(address)
            }
        },
        OperandKind::Peek => Location::Mem(info.sp),
        OperandKind::Pick(depth) => Location::Mem(info.sp.wrapping_add(depth)),
        OperandKind::Sp => Location::Sp,
        OperandKind::Pc => Location::Pc,
        OperandKind::Ex => Location::Ex,
        OperandKind::MemoryAbs(address) => Location::Mem(address),
        OperandKind::Literal(value) | OperandKind::InlineLiteral(value) => Location::Imm(value),
    }
}

fn load(ctx: &Context<'_>, location: Location) -> u16 {
    match location {
        Location::Reg(slot) => ctx.machine.info.regs[slot],
        Location::Sp => ctx.machine.info.sp,
        Location::Pc => ctx.machine.info.pc,
        Location::Ex => ctx.machine.info.ex,
        Location::Mem(address) => ctx.machine.memory.read(address),
        Location::Imm(value) => value,
    }
}

fn store(ctx: &mut Context<'_>, location: Location, value: u16) {
    match location {
        Location::Reg(slot) => ctx.machine.info.regs[slot] = value,
        Location::Sp => ctx.machine.info.sp = value,
        Location::Pc => ctx.machine.info.pc = value,
        Location::Ex => ctx.machine.info.ex = value,
        Location::Mem(address) => ctx.machine.memory.write(address, value),
        Location::Imm(_) => {}
    }
}

fn read(ctx: &mut Context<'_>, operand: Operand) -> u16 {
    let location = resolve(ctx, operand);
    load(ctx, location)
}

/// Execute one non-conditional, non-terminating instruction's semantics.
/// Operand A resolves before operand B, so a POP settles SP before a paired
/// PUSH sees it.
fn perform(ctx: &mut Context<'_>, inst: Instruction) {
    match inst.op {
        Opcode::Set | Opcode::Sti | Opcode::Std => {
            let value = read(ctx, inst.a);
            if let Some(b) = inst.b {
                let lb = resolve(ctx, b);
                store(ctx, lb, value);
            }
            let step: u16 = match inst.op {
                Opcode::Sti => 1,
                Opcode::Std => 0xFFFF, // -1
                _ => 0,
            };
            if step != 0 {
                let i = Register::I.slot();
                let j = Register::J.slot();
                ctx.machine.info.regs[i] = ctx.machine.info.regs[i].wrapping_add(step);
                ctx.machine.info.regs[j] = ctx.machine.info.regs[j].wrapping_add(step);
            }
        }

        Opcode::Iag => {
            let la = resolve(ctx, inst.a);
            let ia = ctx.machine.info.ia;
            store(ctx, la, ia);
        }
        Opcode::Ias => {
            let value = read(ctx, inst.a);
            ctx.machine.info.ia = value;
        }
        Opcode::Iaq => {
            let value = read(ctx, inst.a);
            ctx.machine.info.queue_interrupts = value != 0;
        }

        _ => {
            let av = read(ctx, inst.a);
            let Some(b) = inst.b else { return };
            let lb = resolve(ctx, b);
            let bv = load(ctx, lb);
            binary_op(ctx, inst.op, av, bv, lb);
        }
    }
}

/// The two-operand arithmetic and bitwise core: compute in host width, write
/// back the low 16 bits, capture EX where the opcode defines it.
fn binary_op(ctx: &mut Context<'_>, op: Opcode, av: u16, bv: u16, lb: Location) {
    match op {
        Opcode::Add => {
            let sum = u32::from(bv) + u32::from(av);
            store(ctx, lb, sum as u16);
            ctx.machine.info.ex = (sum >> 16) as u16;
        }
        Opcode::Sub => {
            let diff = i32::from(bv) - i32::from(av);
            store(ctx, lb, diff as u16);
            ctx.machine.info.ex = if diff < 0 { 0xFFFF } else { 0 };
        }
        Opcode::Mul => {
            let product = u32::from(bv) * u32::from(av);
            ctx.machine.info.ex = (product >> 16) as u16;
            store(ctx, lb, product as u16);
        }
        Opcode::Mli => {
            let product = i32::from(bv as i16) * i32::from(av as i16);
            ctx.machine.info.ex = (product >> 16) as u16;
            store(ctx, lb, product as u16);
        }
        Opcode::Div => {
            if av == 0 {
                ctx.machine.info.ex = 0;
                store(ctx, lb, 0);
            } else {
                ctx.machine.info.ex = ((u32::from(bv) << 16) / u32::from(av)) as u16;
                store(ctx, lb, bv / av);
            }
        }
        Opcode::Dvi => {
            if av == 0 {
                ctx.machine.info.ex = 0;
                store(ctx, lb, 0);
            } else {
                let bi = i64::from(bv as i16);
                let ai = i64::from(av as i16);
                ctx.machine.info.ex = ((bi << 16) / ai) as u16;
                store(ctx, lb, (bi / ai) as u16);
            }
        }
        Opcode::Mod => {
            store(ctx, lb, if av == 0 { 0 } else { bv % av });
        }
        Opcode::Mdi => {
            let value = if av == 0 {
                0
            } else {
                (i32::from(bv as i16) % i32::from(av as i16)) as u16
            };
            store(ctx, lb, value);
        }
        Opcode::And => store(ctx, lb, bv & av),
        Opcode::Bor => store(ctx, lb, bv | av),
        Opcode::Xor => store(ctx, lb, bv ^ av),
        Opcode::Shr => {
            let shift = u32::from(av).min(63);
            store(ctx, lb, (u64::from(bv) >> shift) as u16);
            ctx.machine.info.ex = ((u64::from(bv) << 16) >> shift) as u16;
        }
        Opcode::Asr => {
            let shift = u32::from(av).min(63);
            let value = i64::from(bv as i16);
            store(ctx, lb, (value >> shift) as u16);
            ctx.machine.info.ex = ((value << 16) >> shift) as u16;
        }
        Opcode::Shl => {
            let shifted = u64::from(bv) << u32::from(av).min(63);
            store(ctx, lb, shifted as u16);
            ctx.machine.info.ex = (shifted >> 16) as u16;
        }
        Opcode::Adx => {
            let sum = u32::from(bv) + u32::from(av) + u32::from(ctx.machine.info.ex);
            store(ctx, lb, sum as u16);
            ctx.machine.info.ex = if sum > 0xFFFF { 1 } else { 0 };
        }
        Opcode::Sbx => {
            let result = i32::from(bv) - i32::from(av) + i32::from(ctx.machine.info.ex);
            store(ctx, lb, result as u16);
            ctx.machine.info.ex = if result < 0 { 0xFFFF } else { 0 };
        }
        _ => {}
    }
}

/// Evaluate an IF* test. Operand side effects fire whether or not the test
/// passes, exactly as in straight-line execution.
fn evaluate_condition(ctx: &mut Context<'_>, inst: Instruction) -> bool {
    let av = read(ctx, inst.a);
    let Some(b) = inst.b else { return true };
    let bv = read(ctx, b);
    match inst.op {
        Opcode::Ifb => (bv & av) != 0,
        Opcode::Ifc => (bv & av) == 0,
        Opcode::Ife => bv == av,
        Opcode::Ifn => bv != av,
        Opcode::Ifg => bv > av,
        Opcode::Ifa => (bv as i16) > (av as i16),
        Opcode::Ifl => bv < av,
        Opcode::Ifu => (bv as i16) < (av as i16),
        _ => true,
    }
}

fn emit_debit(asm: &mut Assembler, cost: u8) -> Result<(), AssemblyError> {
    let debit = i64::from(cost);
    asm.thunk(move |ctx| {
        ctx.machine.info.cycles -= debit;
        Step::Next
    })
}

/// The in-chunk safe point: with an interrupt handler installed and queueing
/// off, a non-empty queue raises the ISR flag and forces the chunk to return
/// to the dispatcher.
fn emit_cycle_hook(asm: &mut Assembler) -> Result<(), AssemblyError> {
    asm.thunk(|ctx| {
        let info = &ctx.machine.info;
        if info.ia == 0 || info.queue_interrupts {
            return Step::Next;
        }
        if ctx.irq.is_empty() {
            Step::Next
        } else {
            *ctx.isr = true;
            Step::Ret
        }
    })
}

/// Keep the stored PC coherent before an instruction whose operands can
/// observe or modify it.
fn emit_pc_store(asm: &mut Assembler, offset: u16) -> Result<(), AssemblyError> {
    asm.thunk(move |ctx| {
        ctx.machine.info.pc = offset;
        Step::Next
    })
}

/// Emit one non-conditional instruction. Returns `true` when the op is a
/// chunk terminator; terminators return to the dispatcher from inside their
/// own op, so a terminator guarded by a conditional still leaves the skip
/// path open for the instructions after it.
fn emit_instruction(asm: &mut Assembler, inst: Instruction) -> Result<bool, AssemblyError> {
    let jump = inst
        .b
        .is_some_and(|b| b.kind == OperandKind::Pc)
        && matches!(inst.op, Opcode::Set | Opcode::Sti | Opcode::Std);

    match inst.op {
        Opcode::Jsr => {
            asm.thunk(move |ctx| {
                let target = read(ctx, inst.a);
                ctx.machine.push(inst.next_offset);
                ctx.machine.info.pc = target;
                Step::Ret
            })?;
            Ok(true)
        }
        Opcode::Int => {
            asm.thunk(move |ctx| {
                let message = read(ctx, inst.a);
                ctx.irq.enqueue(message);
                ctx.machine.info.pc = inst.next_offset;
                Step::Ret
            })?;
            Ok(true)
        }
        Opcode::Rfi => {
            asm.thunk(move |ctx| {
                ctx.machine.info.queue_interrupts = false;
                let a = ctx.machine.pop();
                let pc = ctx.machine.pop();
                ctx.machine.info.regs[Register::A.slot()] = a;
                ctx.machine.info.pc = pc;
                Step::Ret
            })?;
            Ok(true)
        }
        Opcode::Hwn => {
            asm.thunk(move |ctx| {
                let count = ctx.devices.len() as u16;
                let la = resolve(ctx, inst.a);
                store(ctx, la, count);
                ctx.machine.info.pc = inst.next_offset;
                Step::Ret
            })?;
            Ok(true)
        }
        Opcode::Hwq => {
            asm.thunk(move |ctx| {
                let index = read(ctx, inst.a) as usize;
                if let Some(device) = ctx.devices.get(index) {
                    let info = device.info();
                    info.store(ctx.machine);
                }
                ctx.machine.info.pc = inst.next_offset;
                Step::Ret
            })?;
            Ok(true)
        }
        Opcode::Hwi => {
            asm.thunk(move |ctx| {
                let index = read(ctx, inst.a) as usize;
                if let Some(device) = ctx.devices.get_mut(index) {
                    let handler_cost = device.on_interrupt(ctx.machine);
                    ctx.machine.info.cycles -= i64::from(handler_cost);
                }
                ctx.machine.info.pc = inst.next_offset;
                Step::Ret
            })?;
            Ok(true)
        }
        _ if jump => {
            asm.thunk(move |ctx| {
                perform(ctx, inst);
                Step::Ret
            })?;
            Ok(true)
        }
        _ => {
            asm.thunk(move |ctx| {
                perform(ctx, inst);
                Step::Next
            })?;
            Ok(false)
        }
    }
}

/// Translate the chunk starting at `start_pc` into a host-callable buffer
/// plus its static cost (never zero, so a cached chunk always drains the
/// budget).
pub fn translate(
    memory: &Memory,
    start_pc: u16,
    cycle_hook: bool,
) -> Result<TranslatedChunk, AssemblyError> {
    let mut asm = Assembler::new();
    let mut pc = start_pc;
    let mut cost: u32 = 0;
    let mut instructions = 0usize;

    // Conditional-chain state: the shared skip target, and a countdown that
    // binds it immediately after the first non-conditional instruction
    // following the chain.
    let mut chain_end = None;
    let mut bind_ctr: i8 = -1;

    let mut assembling = true;
    while assembling {
        let inst = decode(memory, pc);
        pc = inst.next_offset;
        instructions += 1;

        if bind_ctr == 0 {
            if let Some(label) = chain_end.take() {
                asm.bind(label)?;
            }
            bind_ctr = -1;
        } else if bind_ctr > 0 {
            bind_ctr -= 1;
        }

        if inst.op == Opcode::Invalid {
            // The guest sees a no-op, but the chunk must still drain budget.
            let debit = inst.cost.max(1);
            cost += u32::from(debit);
            emit_debit(&mut asm, debit)?;
            break;
        }

        if inst.op.is_conditional() {
            // Pre-scan the whole chain; the first test carries the
            // worst-case skip cost, each later one carries one less.
            let mut chain = Vec::new();
            let mut scan_pc = inst.offset;
            loop {
                let link = decode(memory, scan_pc);
                if !link.op.is_conditional() {
                    break;
                }
                scan_pc = link.next_offset;
                chain.push(link);
            }
            let label = asm.new_label();
            let mut remaining = chain.len() as i64;
            for link in chain {
                cost += u32::from(link.cost);
                if link.touches_pc() {
                    emit_pc_store(&mut asm, link.offset)?;
                }
                emit_debit(&mut asm, link.cost)?;
                if cycle_hook {
                    emit_cycle_hook(&mut asm)?;
                }
                let skip_cost = remaining;
                remaining -= 1;
                asm.branch_unless(
                    move |ctx| evaluate_condition(ctx, link),
                    skip_cost,
                    label,
                )?;
            }
            chain_end = Some(label);
            bind_ctr = 1;
            pc = scan_pc;
            continue;
        }

        cost += u32::from(inst.cost);
        if inst.touches_pc() {
            emit_pc_store(&mut asm, inst.offset)?;
        }
        emit_debit(&mut asm, inst.cost)?;
        if cycle_hook {
            emit_cycle_hook(&mut asm)?;
        }

        let guarded = bind_ctr >= 0;
        let terminated = emit_instruction(&mut asm, inst)?;
        if terminated && !guarded {
            assembling = false;
        }
    }

    // A chain that ran into the chunk end still needs its skip target.
    if let Some(label) = chain_end.take() {
        asm.bind(label)?;
    }
    asm.ret()?;

    let cost = cost.max(1);
    if *TRACE_JIT {
        eprintln!(
            "[jit] chunk pc=0x{start_pc:04X} insns={instructions} ops={} cost={cost}",
            asm.len(),
        );
    }
    let chunk = asm.finalize()?;
    Ok(TranslatedChunk { chunk, cost })
}
