mod extensions;
mod interpreter;
mod interrupt;
mod memory;
mod op;
pub mod package;
mod preprocess;
mod register;
mod vm;

pub use extensions::{ExtensionEntry, ExtensionRegistry, ExternCall, ExternFn};
pub use interpreter::RuntimeError;
pub use memory::{Memory, PROGRAM_START, STACK_BASE};
pub use op::{Op, Width};
pub use preprocess::{
    PreprocessError, ProgramInfo, Symbol, SymbolTable, BIN_INLINE_ENTRY,
    BIN_INLINE_PROGRAM, META_USE_FLAGS,
};
pub use register::{Register, RegisterFile, UnknownRegister};
pub use vm::{Vm, VmCreateInfo, VmError};
