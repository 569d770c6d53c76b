use std::fs;
use std::io::{self, Write};

use crate::interpreter::{fetch8, RuntimeError};
use crate::memory::Memory;
use crate::vm::Vm;

/// Interrupt code 1: write a heap-resident string to a stream.
pub const INT_WRITE: u8 = 1;

/// Read a NUL-terminated byte string starting at an absolute address,
/// stopping at the end of the buffer if no terminator is found.
fn read_cstring(memory: &Memory, addr: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    while cursor < memory.len() {
        let byte = memory.get_u8(cursor);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cursor += 1;
    }
    bytes
}

/// Service one interrupt. The code byte has already been fetched; operands
/// specific to the code are fetched here.
///
/// Code 1 fetches a stream selector and a heap offset, both logical heap
/// offsets of NUL-terminated strings: the selector names the output path
/// (empty means standard output) and the offset addresses the payload.
/// Unknown codes are logged and ignored.
pub(crate) fn service(vm: &mut Vm, code: u8) -> Result<(), RuntimeError> {
    match code {
        INT_WRITE => {
            let selector = fetch8(vm)? as usize;
            let offset = fetch8(vm)? as usize;
            let path = read_cstring(&vm.memory, vm.memory.heap_address(selector));
            let data = read_cstring(&vm.memory, vm.memory.heap_address(offset));
            write_stream(&path, &data)
        }
        _ => {
            log::warn!("unhandled interrupt code {code}");
            Ok(())
        }
    }
}

fn write_stream(path: &[u8], data: &[u8]) -> Result<(), RuntimeError> {
    let result = if path.is_empty() {
        let mut stdout = io::stdout();
        stdout.write_all(data).and_then(|()| stdout.flush())
    } else {
        fs::write(String::from_utf8_lossy(path).as_ref(), data)
    };
    result.map_err(|err| RuntimeError::InterruptFailed {
        message: err.to_string(),
    })
}
