use std::fmt;
use std::str::FromStr;

/// The fixed register set: three control registers, the heap watermark and
/// ten general-purpose scratch registers. Every cell is an unsigned 16-bit
/// value; arithmetic on register contents wraps without signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    /// Return-address register (compatibility slot next to the call-frame
    /// stack).
    Rtp = 0,
    /// Stack pointer, absolute address of the current top of stack.
    Rsp,
    /// Instruction pointer, absolute address of the next fetch.
    Rip,
    /// Heap watermark: address of the last byte written to the heap.
    Rhp,
    R10,
    R9,
    R8,
    R7,
    R6,
    R5,
    R4,
    R3,
    R2,
    R1,
}

impl Register {
    pub const COUNT: usize = Register::R1 as usize + 1;

    /// Byte offset of this register's cell in the backing buffer.
    fn offset(self) -> usize {
        self as usize * 2
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Rtp => "rtp",
            Register::Rsp => "rsp",
            Register::Rip => "rip",
            Register::Rhp => "rhp",
            Register::R10 => "r10",
            Register::R9 => "r9",
            Register::R8 => "r8",
            Register::R7 => "r7",
            Register::R6 => "r6",
            Register::R5 => "r5",
            Register::R4 => "r4",
            Register::R3 => "r3",
            Register::R2 => "r2",
            Register::R1 => "r1",
        };
        f.write_str(name)
    }
}

/// Raised when a diagnostic surface names a register that does not exist.
/// This is a precondition violation on the caller's side, never a
/// recoverable runtime condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRegister(pub String);

impl fmt::Display for UnknownRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no such register '{}'", self.0)
    }
}

impl FromStr for Register {
    type Err = UnknownRegister;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reg = match s {
            "rtp" => Register::Rtp,
            "rsp" => Register::Rsp,
            "rip" => Register::Rip,
            "rhp" => Register::Rhp,
            "r10" => Register::R10,
            "r9" | "r09" => Register::R9,
            "r8" | "r08" => Register::R8,
            "r7" | "r07" => Register::R7,
            "r6" | "r06" => Register::R6,
            "r5" | "r05" => Register::R5,
            "r4" | "r04" => Register::R4,
            "r3" | "r03" => Register::R3,
            "r2" | "r02" => Register::R2,
            "r1" | "r01" => Register::R1,
            _ => return Err(UnknownRegister(s.to_string())),
        };
        Ok(reg)
    }
}

/// Register storage: one 16-bit big-endian cell per register, backed by its
/// own small buffer separate from main memory.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    bytes: [u8; Register::COUNT * 2],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            bytes: [0; Register::COUNT * 2],
        }
    }

    pub fn get(&self, reg: Register) -> u16 {
        let off = reg.offset();
        u16::from_be_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    pub fn set(&mut self, reg: Register, value: u16) {
        let off = reg.offset();
        self.bytes[off..off + 2].copy_from_slice(&value.to_be_bytes());
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
