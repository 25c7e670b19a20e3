//! DCPU-16 emulator core.
//!
//! The guest machine is a 16-bit word-addressed processor with eight general
//! registers, a 64 KiW memory, an interrupt queue and a pluggable hardware
//! bus. Execution goes through a translating core: straight-line spans of
//! guest instructions are decoded once, compiled into host-callable chunks,
//! cached by start address and dispatched by the [`exec::Processor`] under an
//! injected cycle budget.

pub mod decode;
pub mod exec;
pub mod hardware;
pub mod interrupt;
pub mod jit;
pub mod memory;
pub mod state;

use thiserror::Error;

pub use decode::{decode, encode, Instruction, Opcode, Operand, OperandKind, Role};
pub use exec::{Processor, ProcessorConfig};
pub use hardware::{Clock, HardwareDevice, HardwareInfo, Lem1802, Sped3};
pub use interrupt::{InterruptLine, INTERRUPT_QUEUE_LIMIT};
pub use memory::{Endianness, Memory, MEMORY_WORDS};
pub use state::{Machine, Register, RegisterInfo, RegisterSnapshot};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] memory::ImageError),
    #[error("assembly error: {0}")]
    Assembly(#[from] jit::assembler::AssemblyError),
}
