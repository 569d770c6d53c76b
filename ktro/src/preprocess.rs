use std::fmt;

use crate::memory::PROGRAM_START;
use crate::op::Op;

/// Default binary type when a program carries no `BINARY` marker: inline
/// program, execution starts at the first program byte.
pub const BIN_INLINE_PROGRAM: u8 = 0xA1;

/// Inline entry: execution starts at function id 0.
pub const BIN_INLINE_ENTRY: u8 = 0xA2;

/// Metadata code enabling flags mode.
pub const META_USE_FLAGS: u8 = 0x1F;

/// One resolved function or label declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub id: u8,
    /// Absolute address of the first code byte after the declaration.
    pub address: u16,
}

/// Declaration-ordered symbol table. Lookup returns the first match;
/// duplicate ids are undefined input and later entries are simply dead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u8, address: u16) {
        self.entries.push(Symbol { id, address });
    }

    pub fn lookup(&self, id: u8) -> Option<u16> {
        self.entries
            .iter()
            .find(|sym| sym.id == id)
            .map(|sym| sym.address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Symbol] {
        &self.entries
    }
}

/// Immutable output of the preprocessing scan. Produced once per load and
/// consumed read-only by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub binary_type: u8,
    pub metadata: Vec<u8>,
    pub functions: SymbolTable,
    pub labels: SymbolTable,
}

impl Default for ProgramInfo {
    fn default() -> Self {
        Self {
            binary_type: BIN_INLINE_PROGRAM,
            metadata: Vec::new(),
            functions: SymbolTable::new(),
            labels: SymbolTable::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessError {
    /// A marker's operand byte lies past the end of the program.
    Truncated { at: usize },
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessError::Truncated { at } => {
                write!(f, "truncated marker operand at program byte {at}")
            }
        }
    }
}

/// Single forward scan over the raw program bytes.
///
/// Section 0 (header) recognizes `BINARY`, `META` and `SECTION`; section 1
/// (declarations) recognizes `FUNC` and `LABEL`; every other byte skips one
/// at a time. Inside non-zero sections only the double marker
/// `SECTION SECTION tag` switches sections; a lone `SECTION` byte there is
/// plain data. Must run to completion before the first instruction
/// executes.
pub fn scan(program: &[u8]) -> Result<ProgramInfo, PreprocessError> {
    let mut info = ProgramInfo::default();
    let mut binary_seen = false;
    let mut section = 0u8;
    let mut cursor = 0usize;

    let operand = |at: usize| -> Result<u8, PreprocessError> {
        program
            .get(at)
            .copied()
            .ok_or(PreprocessError::Truncated { at })
    };

    while cursor < program.len() {
        let byte = program[cursor];

        if byte == Op::Section as u8 {
            if program.get(cursor + 1) == Some(&(Op::Section as u8)) {
                section = operand(cursor + 2)?;
                cursor += 3;
            } else if section == 0 {
                section = operand(cursor + 1)?;
                cursor += 2;
            } else {
                cursor += 1;
            }
            continue;
        }

        match section {
            0 => {
                if byte == Op::Binary as u8 {
                    let kind = operand(cursor + 1)?;
                    if !binary_seen {
                        info.binary_type = kind;
                        binary_seen = true;
                    }
                    cursor += 2;
                } else if byte == Op::Meta as u8 {
                    info.metadata.push(operand(cursor + 1)?);
                    cursor += 2;
                } else {
                    cursor += 1;
                }
            }
            1 => {
                if byte == Op::Func as u8 || byte == Op::Label as u8 {
                    let id = operand(cursor + 1)?;
                    let address = (PROGRAM_START + cursor + 2) as u16;
                    if byte == Op::Func as u8 {
                        info.functions.insert(id, address);
                    } else {
                        info.labels.insert(id, address);
                    }
                    cursor += 2;
                } else {
                    cursor += 1;
                }
            }
            _ => cursor += 1,
        }
    }

    Ok(info)
}
