use std::fmt;

use crate::extensions::{ExtensionRegistry, ExternFn};
use crate::interpreter::{self, RuntimeError};
use crate::memory::{Memory, PROGRAM_START, STACK_BASE};
use crate::op::Width;
use crate::preprocess::{
    self, PreprocessError, ProgramInfo, BIN_INLINE_ENTRY, META_USE_FLAGS,
};
use crate::register::{Register, RegisterFile};

/// Construction failures. Runtime conditions never surface here; they are
/// reported through the run loop and the exit code instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The preprocessing scan did not run to completion.
    InvalidProgram(PreprocessError),
    /// The memory buffer cannot hold the fixed layout plus the program.
    BufferTooSmall { required: usize, actual: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidProgram(err) => write!(f, "invalid program: {err}"),
            VmError::BufferTooSmall { required, actual } => write!(
                f,
                "memory buffer too small: need {required} bytes, have {actual}"
            ),
        }
    }
}

impl From<PreprocessError> for VmError {
    fn from(err: PreprocessError) -> Self {
        VmError::InvalidProgram(err)
    }
}

/// Construction parameters for a [`Vm`].
#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    /// Size of the shared memory buffer in bytes.
    pub memory_size: usize,
    /// Emit a trace line per executed step and a heap summary after the
    /// run.
    pub trace_steps: bool,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            memory_size: 1024 * 1024,
            trace_steps: false,
        }
    }
}

/// One virtual machine instance: the shared memory buffer, the register
/// file, the preprocessed program tables and all mutable execution state.
/// Instances own their buffers exclusively; there is exactly one logical
/// thread of control per instance.
pub struct Vm {
    pub(crate) memory: Memory,
    pub(crate) registers: RegisterFile,
    pub(crate) program: ProgramInfo,
    pub(crate) extensions: ExtensionRegistry,
    /// Return addresses, pushed on CALL and popped on RET. A growable frame
    /// stack rather than the single saved slot, so nested calls return
    /// correctly; `rtp` still mirrors the most recent save.
    pub(crate) frames: Vec<u16>,
    pub(crate) binary_type: u8,
    pub(crate) use_flags: bool,
    pub(crate) zero_flag: bool,
    pub(crate) neg_flag: bool,
    pub(crate) halted: bool,
    pub(crate) exit_code: u32,
    /// Heap data cursor for ASCIZ/OFFSET placement.
    pub(crate) data_cursor: usize,
    step_count: usize,
    max_steps: usize,
    trace_steps: bool,
}

impl Vm {
    /// Build an instance around a fresh buffer, load the program image and
    /// run the preprocessing scan. The scan runs exactly once per load; a
    /// failed scan aborts construction.
    pub fn new(info: VmCreateInfo, program: &[u8]) -> Result<Self, VmError> {
        let required = PROGRAM_START + program.len();
        if info.memory_size < required {
            return Err(VmError::BufferTooSmall {
                required,
                actual: info.memory_size,
            });
        }

        let mut vm = Self {
            memory: Memory::new(info.memory_size, program.len()),
            registers: RegisterFile::new(),
            program: ProgramInfo::default(),
            extensions: ExtensionRegistry::new(),
            frames: Vec::new(),
            binary_type: 0,
            use_flags: false,
            zero_flag: false,
            neg_flag: false,
            halted: false,
            exit_code: 0,
            data_cursor: 0,
            step_count: 0,
            max_steps: 0,
            trace_steps: info.trace_steps,
        };
        vm.load(program)?;
        Ok(vm)
    }

    /// Reinitialize every piece of per-run state for a fresh program while
    /// keeping the instance, its buffer size and the registered extensions.
    pub fn reset(&mut self, program: &[u8]) -> Result<(), VmError> {
        let required = PROGRAM_START + program.len();
        if self.memory.len() < required {
            return Err(VmError::BufferTooSmall {
                required,
                actual: self.memory.len(),
            });
        }
        self.memory = Memory::new(self.memory.len(), program.len());
        self.registers = RegisterFile::new();
        self.frames.clear();
        self.use_flags = false;
        self.zero_flag = false;
        self.neg_flag = false;
        self.halted = false;
        self.exit_code = 0;
        self.data_cursor = 0;
        self.step_count = 0;
        self.load(program)
    }

    fn load(&mut self, program: &[u8]) -> Result<(), VmError> {
        self.memory.load_program(program);
        self.program = preprocess::scan(program)?;
        self.binary_type = self.program.binary_type;
        self.max_steps = 10 * program.len();

        self.registers.set(Register::Rip, PROGRAM_START as u16);
        self.registers.set(Register::Rsp, STACK_BASE as u16);
        self.registers
            .set(Register::Rhp, self.memory.heap_start() as u16);
        self.registers.set(Register::Rtp, 0);

        for code in self.program.metadata.clone() {
            self.apply_meta(code);
        }
        self.resolve_entry();
        Ok(())
    }

    /// Metadata codes set one-way engine flags; unknown codes are no-ops.
    /// Applied once from the preprocessed list and again by the live `META`
    /// opcode with identical semantics.
    pub(crate) fn apply_meta(&mut self, code: u8) {
        if code == META_USE_FLAGS {
            self.use_flags = true;
        }
    }

    /// Entry-point resolution per the declared binary type. An inline-entry
    /// binary without function 0 is a fatal condition: reported, exit code
    /// 1, halted before the first step.
    fn resolve_entry(&mut self) {
        if self.binary_type != BIN_INLINE_ENTRY {
            return;
        }
        match self.program.functions.lookup(0) {
            Some(address) => {
                self.registers.set(Register::Rip, address);
                self.registers.set(Register::Rtp, address);
            }
            None => {
                log::error!("{}", RuntimeError::MissingEntryPoint);
                self.exit_code = 1;
                self.halted = true;
            }
        }
    }

    /// Register a batch of host callbacks under a namespace; method ids are
    /// assigned sequentially starting at 1. Registrations persist across
    /// [`reset`](Vm::reset).
    pub fn register_namespace(&mut self, namespace: u8, callbacks: &[ExternFn]) {
        self.extensions.register_namespace(namespace, callbacks);
    }

    /// Execute until halt, a fatal condition or the iteration ceiling.
    /// Always returns the exit code; fatal conditions report to the error
    /// channel and yield 1.
    pub fn run(&mut self) -> u32 {
        let mut iterations = 0usize;
        while !self.halted {
            if let Err(err) = interpreter::step(self) {
                log::error!("{err}");
                self.exit_code = 1;
                self.halted = true;
                break;
            }
            if self.halted {
                break;
            }
            if iterations >= self.max_steps {
                log::error!(
                    "{}",
                    RuntimeError::IterationLimitExceeded { steps: iterations }
                );
                self.exit_code = 1;
                self.halted = true;
                break;
            }
            self.trace_step();
            self.step_count += 1;
            iterations += 1;
        }
        self.trace_heap_summary();
        self.exit_code
    }

    /// Run the program as an exported callable: the arguments are stored as
    /// 8-bit values at heap offsets 0.., then the program executes normally
    /// and its exit code is the return value.
    pub fn run_with_args(&mut self, args: &[u8]) -> u32 {
        for (i, &arg) in args.iter().enumerate() {
            interpreter::heap_store(self, Width::W8, i, u32::from(arg));
        }
        self.run()
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn program(&self) -> &ProgramInfo {
        &self.program
    }

    fn trace_step(&self) {
        if !self.trace_steps || !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let rsp = self.registers.get(Register::Rsp) as usize;
        let mut snapshot = String::new();
        for addr in rsp..STACK_BASE {
            let value = self.memory.get_u8(addr);
            if !snapshot.is_empty() {
                snapshot.push(' ');
            }
            snapshot.push_str(&format!("{addr:#05x}:{value}"));
        }
        log::trace!(
            "step {}: rsp={rsp:#06x} stack [{snapshot}]",
            self.step_count + 1
        );
    }

    fn trace_heap_summary(&self) {
        if !self.trace_steps || !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let start = self.memory.heap_start();
        let end = (self.registers.get(Register::Rhp) as usize + 5)
            .min(self.memory.len() - 1);
        let mut summary = String::new();
        for addr in start..=end {
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(&format!("{addr:#06x}:{}", self.memory.get_u8(addr)));
        }
        log::trace!("heap summary [{summary}]");
    }
}
