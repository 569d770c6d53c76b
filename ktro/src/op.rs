use std::fmt;

/// Bytecode opcodes.
///
/// Sized instructions carry an explicit width byte (a literal `8`, `16` or
/// `32`) before their value or offset operands. Heap offsets and symbol ids
/// are always single bytes. Marker opcodes ([`Binary`](Op::Binary) through
/// [`Section`](Op::Section)) are consumed by the preprocessor; the engine
/// skip-executes them so that linear control flow can run across
/// declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Does nothing.
    Nop = 0x00,

    /// Declare the binary type. Operands: `type:u8`.
    Binary = 0x01,

    /// Service an I/O interrupt. Operands: `code:u8`, then per code.
    Interrupt = 0x02,

    /// Engine metadata. Operands: `code:u8` (only `0x1F`, flags mode, has a
    /// defined effect).
    Meta = 0x03,

    /// Declare a function entry point at the following byte.
    /// Operands: `id:u8`.
    Func = 0x06,

    /// Declare a jump label at the following byte. Operands: `id:u8`.
    Label = 0x07,

    /// Pop a value and store it into the heap. Operands: `w`, `offset:u8`.
    Sto = 0x0A,

    /// Pop, increment, push. Operands: `w`.
    Inc = 0x0B,

    /// Pop two values, push their exclusive or. Operands: `w`.
    Xor = 0x0C,

    /// Push an immediate. Operands: `w`, `value:w`.
    Const = 0x10,

    /// Pop two values, push their sum. Operands: `w`.
    Add = 0x11,

    /// Pop the exit code and halt. Operands: `w`.
    Hlt = 0x12,

    /// Compare equal. Operands: `w`.
    CmpEq = 0x13,

    /// Compare not-equal. Operands: `w`.
    CmpNe = 0x14,

    /// Compare greater-than. Operands: `w`.
    CmpGt = 0x15,

    /// Compare less-than. Operands: `w`.
    CmpLt = 0x16,

    /// Compare greater-or-equal. Operands: `w`.
    CmpGe = 0x17,

    /// Compare less-or-equal. Operands: `w`.
    CmpLe = 0x18,

    /// Copy raw bytes into the heap at the data cursor.
    /// Operands: `count:u8`, `bytes:u8 × count` (count includes the NUL).
    Asciz = 0x19,

    /// Load from the heap and push. Operands: `w`, `offset:u8`.
    Lds = 0x1A,

    /// Pop, decrement, push. Operands: `w`.
    Dec = 0x1B,

    /// Pop, push the bitwise complement within the width. Operands: `w`.
    Not = 0x1C,

    /// Invoke a registered host callback.
    /// Operands: `namespace:u8`, `method:u8`.
    Extern = 0x20,

    /// Pop and discard. Operands: `w`.
    Popl = 0x2A,

    /// Pop two values, push the remainder. Operands: `w`.
    Mod = 0x2B,

    /// Pop two values, push the complement of their or. Operands: `w`.
    Nor = 0x2C,

    /// Zero a heap cell. Operands: `w`, `offset:u8`.
    Del = 0x3A,

    /// Duplicate the top of stack. Operands: `w`.
    Dup = 0x4A,

    /// Call a function by id, saving the return address. Operands: `id:u8`.
    Call = 0x4C,

    /// Unconditional jump to a label. Operands: `id:u8`.
    Jmp = 0x5B,

    /// Return to the most recently saved address.
    Ret = 0x5C,

    /// Jump to a label when the last comparison was truthy.
    /// Operands: `id:u8`.
    Jze = 0x8B,

    /// Pop two values, push their difference (second-popped minus
    /// first-popped). Operands: `w`.
    Sub = 0xAA,

    /// Pop two values, push their product. Operands: `w`.
    Mul = 0xBA,

    /// Advance the heap data cursor without writing. Operands: `align:u8`.
    Offset = 0xBB,

    /// Pop two values, push the quotient. Operands: `w`.
    Div = 0xCA,

    /// Pop two values, push their bitwise and. Operands: `w`.
    And = 0xCB,

    /// Pop two values, push their bitwise or. Operands: `w`.
    Or = 0xDB,

    /// Pop two values, push the second shifted left by the first.
    /// Operands: `w`.
    Shl = 0xEC,

    /// Switch the active program section. Operands: `tag:u8`, or the
    /// double-marker form `0xFA 0xFA tag` inside non-zero sections.
    Section = 0xFA,

    /// Pop two values, push the second shifted right by the first.
    /// Operands: `w`.
    Shr = 0xFC,
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let op = match byte {
            0x00 => Op::Nop,
            0x01 => Op::Binary,
            0x02 => Op::Interrupt,
            0x03 => Op::Meta,
            0x06 => Op::Func,
            0x07 => Op::Label,
            0x0A => Op::Sto,
            0x0B => Op::Inc,
            0x0C => Op::Xor,
            0x10 => Op::Const,
            0x11 => Op::Add,
            0x12 => Op::Hlt,
            0x13 => Op::CmpEq,
            0x14 => Op::CmpNe,
            0x15 => Op::CmpGt,
            0x16 => Op::CmpLt,
            0x17 => Op::CmpGe,
            0x18 => Op::CmpLe,
            0x19 => Op::Asciz,
            0x1A => Op::Lds,
            0x1B => Op::Dec,
            0x1C => Op::Not,
            0x20 => Op::Extern,
            0x2A => Op::Popl,
            0x2B => Op::Mod,
            0x2C => Op::Nor,
            0x3A => Op::Del,
            0x4A => Op::Dup,
            0x4C => Op::Call,
            0x5B => Op::Jmp,
            0x5C => Op::Ret,
            0x8B => Op::Jze,
            0xAA => Op::Sub,
            0xBA => Op::Mul,
            0xBB => Op::Offset,
            0xCA => Op::Div,
            0xCB => Op::And,
            0xDB => Op::Or,
            0xEC => Op::Shl,
            0xFA => Op::Section,
            0xFC => Op::Shr,
            _ => return Err(byte),
        };
        Ok(op)
    }
}

/// Operand size in bits. The width byte in the instruction stream is the
/// literal bit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Width {
    W8 = 8,
    W16 = 16,
    W32 = 32,
}

impl Width {
    /// Size in bytes.
    pub const fn bytes(self) -> usize {
        self as usize / 8
    }

    /// Truncate a value to this width.
    pub const fn mask(self, value: u32) -> u32 {
        match self {
            Width::W8 => value & 0xFF,
            Width::W16 => value & 0xFFFF,
            Width::W32 => value,
        }
    }
}

impl TryFrom<u8> for Width {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            8 => Ok(Width::W8),
            16 => Ok(Width::W16),
            32 => Ok(Width::W32),
            _ => Err(byte),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
