use std::fmt;

use crate::extensions;
use crate::interrupt;
use crate::memory::STACK_BASE;
use crate::op::{Op, Width};
use crate::register::Register;
use crate::vm::Vm;

/// Fatal execution conditions. Every one of these stops the run loop with
/// exit code 1 after being reported to the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// An inline-entry binary declared no function with id 0.
    MissingEntryPoint,
    UnknownLabel { id: u8 },
    UnknownFunction { id: u8 },
    UnknownExtern { namespace: u8, method: u8 },
    /// The runaway-program safety valve tripped.
    IterationLimitExceeded { steps: usize },
    InvalidOpcode { byte: u8, address: u16 },
    InvalidWidth { byte: u8 },
    /// A fetched address falls outside the memory buffer. Reachable with
    /// buffers smaller than the 16-bit address space.
    OutOfBoundsAccess { address: u16 },
    DivisionByZero,
    InterruptFailed { message: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::MissingEntryPoint => {
                write!(f, "missing entry point: no function with id 0")
            }
            RuntimeError::UnknownLabel { id } => write!(f, "unknown label id {id}"),
            RuntimeError::UnknownFunction { id } => {
                write!(f, "unknown function id {id}")
            }
            RuntimeError::UnknownExtern { namespace, method } => {
                write!(f, "no extension registered for ({namespace}, {method})")
            }
            RuntimeError::IterationLimitExceeded { steps } => {
                write!(f, "segmentation fault: iteration limit reached after {steps} steps")
            }
            RuntimeError::InvalidOpcode { byte, address } => {
                write!(f, "invalid opcode 0x{byte:02X} at 0x{address:04X}")
            }
            RuntimeError::InvalidWidth { byte } => {
                write!(f, "invalid operand width {byte}")
            }
            RuntimeError::OutOfBoundsAccess { address } => {
                write!(f, "memory access out of bounds at 0x{address:04X}")
            }
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::InterruptFailed { message } => {
                write!(f, "interrupt write failed: {message}")
            }
        }
    }
}

/// Fetch one byte at `rip` and advance it. `rip` walking off the end of the
/// buffer is a fatal condition, never a panic.
pub(crate) fn fetch8(vm: &mut Vm) -> Result<u8, RuntimeError> {
    let addr = vm.registers.get(Register::Rip);
    if addr as usize >= vm.memory.len() {
        return Err(RuntimeError::OutOfBoundsAccess { address: addr });
    }
    let byte = vm.memory.get_u8(addr as usize);
    vm.registers.set(Register::Rip, addr.wrapping_add(1));
    Ok(byte)
}

fn fetch_sized(vm: &mut Vm, width: Width) -> Result<u32, RuntimeError> {
    let addr = vm.registers.get(Register::Rip);
    if addr as usize + width.bytes() > vm.memory.len() {
        return Err(RuntimeError::OutOfBoundsAccess { address: addr });
    }
    let value = vm.memory.load(width, addr as usize);
    vm.registers
        .set(Register::Rip, addr.wrapping_add(width.bytes() as u16));
    Ok(value)
}

fn fetch_width(vm: &mut Vm) -> Result<Width, RuntimeError> {
    let byte = fetch8(vm)?;
    Width::try_from(byte).map_err(|byte| RuntimeError::InvalidWidth { byte })
}

/// Push a value: grow the stack downward by the operand size, then write at
/// the new `rsp`. A wrapped `rsp` landing outside a small buffer is a fatal
/// condition.
pub(crate) fn push(vm: &mut Vm, width: Width, value: u32) -> Result<(), RuntimeError> {
    let top = vm
        .registers
        .get(Register::Rsp)
        .wrapping_sub(width.bytes() as u16);
    if top as usize + width.bytes() > vm.memory.len() {
        return Err(RuntimeError::OutOfBoundsAccess { address: top });
    }
    vm.memory.store(width, top as usize, width.mask(value));
    vm.registers.set(Register::Rsp, top);
    Ok(())
}

/// Pop a value: read at the current `rsp`, zero the read cells, then shrink
/// the stack. A pop that would carry `rsp` past `STACK_BASE` clamps to the
/// base first and reads whatever sits there rather than failing.
pub(crate) fn pop(vm: &mut Vm, width: Width) -> Result<u32, RuntimeError> {
    let mut top = vm.registers.get(Register::Rsp) as usize;
    if top + width.bytes() > STACK_BASE {
        top = STACK_BASE;
    }
    if top + width.bytes() > vm.memory.len() {
        return Err(RuntimeError::OutOfBoundsAccess { address: top as u16 });
    }
    let value = vm.memory.load(width, top);
    for i in 0..width.bytes() {
        vm.memory.set_u8(top + i, 0);
    }
    vm.registers
        .set(Register::Rsp, (top + width.bytes()).min(STACK_BASE) as u16);
    Ok(value)
}

/// Store into the heap at a logical offset, moving the `rhp` watermark to
/// the last written byte.
pub(crate) fn heap_store(vm: &mut Vm, width: Width, offset: usize, value: u32) {
    let addr = vm.memory.heap_address(offset);
    vm.memory.store(width, addr, value);
    vm.registers
        .set(Register::Rhp, (addr + width.bytes() - 1) as u16);
}

pub(crate) fn heap_load(vm: &mut Vm, width: Width, offset: usize) -> u32 {
    let addr = vm.memory.heap_address(offset);
    vm.memory.load(width, addr)
}

/// The single predicate behind conditional jumps: the zero flag in flags
/// mode, otherwise an 8-bit value popped off the stack.
fn last_result_truthy(vm: &mut Vm) -> Result<bool, RuntimeError> {
    if vm.use_flags {
        Ok(vm.zero_flag)
    } else {
        Ok(pop(vm, Width::W8)? != 0)
    }
}

fn binary_op(vm: &mut Vm, f: impl FnOnce(u32, u32) -> u32) -> Result<(), RuntimeError> {
    let width = fetch_width(vm)?;
    let a = pop(vm, width)?;
    let b = pop(vm, width)?;
    push(vm, width, f(b, a))
}

fn unary_op(vm: &mut Vm, f: impl FnOnce(u32) -> u32) -> Result<(), RuntimeError> {
    let width = fetch_width(vm)?;
    let a = pop(vm, width)?;
    push(vm, width, f(a))
}

/// Comparisons resolve through the flags policy: in flags mode they set the
/// condition flags and leave the stack untouched, otherwise they push the
/// boolean as an 8-bit value.
fn compare(vm: &mut Vm, f: impl FnOnce(u32, u32) -> bool) -> Result<(), RuntimeError> {
    let width = fetch_width(vm)?;
    let a = pop(vm, width)?;
    let b = pop(vm, width)?;
    let result = f(b, a);
    if vm.use_flags {
        vm.zero_flag = result;
        vm.neg_flag = b < a;
    } else {
        push(vm, Width::W8, u32::from(result))?;
    }
    Ok(())
}

/// Fetch, decode and execute exactly one instruction.
pub fn step(vm: &mut Vm) -> Result<(), RuntimeError> {
    let address = vm.registers.get(Register::Rip);
    let byte = fetch8(vm)?;
    let op = Op::try_from(byte)
        .map_err(|byte| RuntimeError::InvalidOpcode { byte, address })?;

    match op {
        Op::Nop => {}

        // Markers also exist in the executable stream; linear control flow
        // runs across them by consuming their operands.
        Op::Binary => {
            vm.binary_type = fetch8(vm)?;
        }
        Op::Meta => {
            let code = fetch8(vm)?;
            vm.apply_meta(code);
        }
        Op::Func | Op::Label => {
            fetch8(vm)?;
        }
        Op::Section => {
            let rip = vm.registers.get(Register::Rip);
            let skip = if (rip as usize) < vm.memory.len()
                && vm.memory.get_u8(rip as usize) == Op::Section as u8
            {
                2
            } else {
                1
            };
            vm.registers.set(Register::Rip, rip.wrapping_add(skip));
        }

        Op::Const => {
            let width = fetch_width(vm)?;
            let value = fetch_sized(vm, width)?;
            push(vm, width, value)?;
        }
        Op::Popl => {
            let width = fetch_width(vm)?;
            pop(vm, width)?;
        }
        Op::Dup => {
            let width = fetch_width(vm)?;
            let value = pop(vm, width)?;
            push(vm, width, value)?;
            push(vm, width, value)?;
        }

        Op::Sto => {
            let width = fetch_width(vm)?;
            let offset = fetch8(vm)? as usize;
            let value = pop(vm, width)?;
            heap_store(vm, width, offset, value);
        }
        Op::Lds => {
            let width = fetch_width(vm)?;
            let offset = fetch8(vm)? as usize;
            let value = heap_load(vm, width, offset);
            push(vm, width, value)?;
        }
        Op::Del => {
            let width = fetch_width(vm)?;
            let offset = fetch8(vm)? as usize;
            heap_store(vm, width, offset, 0);
        }

        Op::Add => binary_op(vm, u32::wrapping_add)?,
        Op::Sub => binary_op(vm, u32::wrapping_sub)?,
        Op::Mul => binary_op(vm, u32::wrapping_mul)?,
        Op::Div => {
            let width = fetch_width(vm)?;
            let a = pop(vm, width)?;
            let b = pop(vm, width)?;
            if a == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            push(vm, width, b / a)?;
        }
        Op::Mod => {
            let width = fetch_width(vm)?;
            let a = pop(vm, width)?;
            let b = pop(vm, width)?;
            if a == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            push(vm, width, b % a)?;
        }
        Op::And => binary_op(vm, |b, a| b & a)?,
        Op::Or => binary_op(vm, |b, a| b | a)?,
        Op::Xor => binary_op(vm, |b, a| b ^ a)?,
        Op::Nor => binary_op(vm, |b, a| !(b | a))?,
        Op::Shl => binary_op(vm, u32::wrapping_shl)?,
        Op::Shr => binary_op(vm, u32::wrapping_shr)?,
        Op::Not => unary_op(vm, |a| !a)?,
        Op::Inc => unary_op(vm, |a| a.wrapping_add(1))?,
        Op::Dec => unary_op(vm, |a| a.wrapping_sub(1))?,

        Op::CmpEq => compare(vm, |b, a| b == a)?,
        Op::CmpNe => compare(vm, |b, a| b != a)?,
        Op::CmpGt => compare(vm, |b, a| b > a)?,
        Op::CmpLt => compare(vm, |b, a| b < a)?,
        Op::CmpGe => compare(vm, |b, a| b >= a)?,
        Op::CmpLe => compare(vm, |b, a| b <= a)?,

        Op::Jmp => {
            let id = fetch8(vm)?;
            let target = vm
                .program
                .labels
                .lookup(id)
                .ok_or(RuntimeError::UnknownLabel { id })?;
            vm.registers.set(Register::Rip, target);
        }
        Op::Jze => {
            let id = fetch8(vm)?;
            let target = vm
                .program
                .labels
                .lookup(id)
                .ok_or(RuntimeError::UnknownLabel { id })?;
            if last_result_truthy(vm)? {
                vm.registers.set(Register::Rip, target);
            }
        }
        Op::Call => {
            let id = fetch8(vm)?;
            let target = vm
                .program
                .functions
                .lookup(id)
                .ok_or(RuntimeError::UnknownFunction { id })?;
            let ret = vm.registers.get(Register::Rip);
            vm.frames.push(ret);
            vm.registers.set(Register::Rtp, ret);
            vm.registers.set(Register::Rip, target);
        }
        Op::Ret => {
            let ret = vm
                .frames
                .pop()
                .unwrap_or_else(|| vm.registers.get(Register::Rtp));
            vm.registers.set(Register::Rip, ret);
        }

        Op::Extern => {
            let namespace = fetch8(vm)?;
            let method = fetch8(vm)?;
            extensions::dispatch(vm, namespace, method)?;
        }
        Op::Interrupt => {
            let code = fetch8(vm)?;
            interrupt::service(vm, code)?;
        }

        Op::Asciz => {
            let count = fetch8(vm)?;
            for _ in 0..count {
                let byte = fetch8(vm)?;
                heap_store(vm, Width::W8, vm.data_cursor, u32::from(byte));
                vm.data_cursor += 1;
            }
        }
        Op::Offset => {
            let align = fetch8(vm)?;
            vm.data_cursor += align as usize;
        }

        Op::Hlt => {
            let width = fetch_width(vm)?;
            vm.exit_code = pop(vm, width)?;
            vm.halted = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Vm, VmCreateInfo};

    fn load(program: &[u8]) -> Vm {
        Vm::new(VmCreateInfo::default(), program).unwrap()
    }

    fn run(program: &[u8]) -> u32 {
        load(program).run()
    }

    #[test]
    fn stack_is_lifo_and_rsp_restores() {
        let mut vm = load(&[0x00]);
        let before = vm.registers.get(Register::Rsp);
        for v in [1, 2, 3, 4] {
            push(&mut vm, Width::W16, v).unwrap();
        }
        for expected in [4, 3, 2, 1] {
            assert_eq!(pop(&mut vm, Width::W16).unwrap(), expected);
        }
        assert_eq!(vm.registers.get(Register::Rsp), before);
    }

    #[test]
    fn underflowing_pop_clamps_to_stack_base() {
        let mut vm = load(&[0x00]);
        assert_eq!(pop(&mut vm, Width::W8).unwrap(), 0);
        assert_eq!(vm.registers.get(Register::Rsp), STACK_BASE as u16);
        assert_eq!(pop(&mut vm, Width::W32).unwrap(), 0);
        assert_eq!(vm.registers.get(Register::Rsp), STACK_BASE as u16);
    }

    #[test]
    fn pop_zeroes_the_read_cells() {
        let mut vm = load(&[0x00]);
        push(&mut vm, Width::W16, 0xBEEF).unwrap();
        let read_addr = vm.registers.get(Register::Rsp) as usize;
        assert_eq!(pop(&mut vm, Width::W16).unwrap(), 0xBEEF);
        assert_eq!(vm.memory.get_u16(read_addr), 0);
    }

    #[test]
    fn wrapped_stack_pointer_is_fatal_in_a_small_buffer() {
        let info = VmCreateInfo {
            memory_size: 0x2000,
            ..Default::default()
        };
        let mut vm = Vm::new(info, &[0x00]).unwrap();
        vm.registers.set(Register::Rsp, 2);
        let err = push(&mut vm, Width::W32, 1).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfBoundsAccess { .. }));
    }

    #[test]
    fn heap_store_load_is_idempotent() {
        let mut vm = load(&[0x00]);
        heap_store(&mut vm, Width::W16, 7, 0x1234);
        assert_eq!(heap_load(&mut vm, Width::W16, 7), 0x1234);
        heap_store(&mut vm, Width::W8, 3, 0xAB);
        assert_eq!(heap_load(&mut vm, Width::W8, 3), 0xAB);
    }

    #[test]
    fn heap_store_moves_the_watermark() {
        let mut vm = load(&[0x00]);
        let base = vm.memory.heap_start();
        heap_store(&mut vm, Width::W8, 0, 1);
        assert_eq!(vm.registers.get(Register::Rhp), base as u16);
        heap_store(&mut vm, Width::W16, 4, 1);
        assert_eq!(vm.registers.get(Register::Rhp), (base + 5) as u16);
        heap_store(&mut vm, Width::W32, 8, 1);
        assert_eq!(vm.registers.get(Register::Rhp), (base + 11) as u16);
    }

    #[test]
    fn overflowing_heap_offsets_share_the_clamp_address() {
        let mut vm =
            Vm::new(VmCreateInfo { memory_size: 0x3000, ..Default::default() }, &[0x00])
                .unwrap();
        heap_store(&mut vm, Width::W8, 0xF000, 42);
        assert_eq!(heap_load(&mut vm, Width::W8, 0xFFFF), 42);
    }

    #[test]
    fn sub_applies_second_popped_minus_first_popped() {
        // CONST 5, CONST 3, SUB -> 5 - 3
        let program = [0x01, 0xA1, 0x10, 8, 5, 0x10, 8, 3, 0xAA, 8, 0x12, 8];
        assert_eq!(run(&program), 2);
    }

    #[test]
    fn arithmetic_wraps_within_width() {
        // CONST 255, INC -> 0 at width 8
        let program = [0x01, 0xA1, 0x10, 8, 255, 0x0B, 8, 0x12, 8];
        assert_eq!(run(&program), 0);
        // CONST 250, CONST 10, ADD -> 4 at width 8
        let program = [0x01, 0xA1, 0x10, 8, 250, 0x10, 8, 10, 0x11, 8, 0x12, 8];
        assert_eq!(run(&program), 4);
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let program = [0x01, 0xA1, 0x10, 8, 5, 0x10, 8, 0, 0xCA, 8, 0x12, 8];
        assert_eq!(run(&program), 1);
    }

    #[test]
    fn bitwise_ops() {
        // CONST 0b1100, CONST 0b1010, AND -> 0b1000
        let program = [0x01, 0xA1, 0x10, 8, 12, 0x10, 8, 10, 0xCB, 8, 0x12, 8];
        assert_eq!(run(&program), 8);
        // CONST 1, CONST 3, SHL -> 8
        let program = [0x01, 0xA1, 0x10, 8, 1, 0x10, 8, 3, 0xEC, 8, 0x12, 8];
        assert_eq!(run(&program), 8);
        // NOT 0 at width 8 -> 255
        let program = [0x01, 0xA1, 0x10, 8, 0, 0x1C, 8, 0x12, 8];
        assert_eq!(run(&program), 255);
    }

    #[test]
    fn dup_duplicates_the_top() {
        // CONST 6, DUP, ADD -> 12
        let program = [0x01, 0xA1, 0x10, 8, 6, 0x4A, 8, 0x11, 8, 0x12, 8];
        assert_eq!(run(&program), 12);
    }

    #[test]
    fn unknown_opcode_is_a_decode_error() {
        let program = [0x01, 0xA1, 0xEE];
        assert_eq!(run(&program), 1);
    }

    #[test]
    fn invalid_width_is_fatal() {
        let program = [0x01, 0xA1, 0x10, 9, 1, 0x12, 8];
        assert_eq!(run(&program), 1);
    }

    #[test]
    fn unknown_label_is_fatal() {
        let program = [0x01, 0xA1, 0x5B, 0x07];
        assert_eq!(run(&program), 1);
    }

    #[test]
    fn jump_skips_over_code() {
        // Jump over a CONST 99 straight to the label, then halt with 7.
        let program = [
            0x01, 0xA1, // binary
            0xFA, 0x01, // section 1
            0x5B, 0x00, // jmp label 0
            0x10, 8, 99, // skipped
            0x07, 0x00, // label 0
            0x10, 8, 7, // const 7
            0x12, 8, // hlt
        ];
        assert_eq!(run(&program), 7);
    }

    #[test]
    fn conditional_jump_follows_comparison_without_flags() {
        // 4 == 4 pushes 1, JZE taken, halt 1; else path halts 9.
        let program = [
            0x01, 0xA1, 0xFA, 0x01, // header
            0x10, 8, 4, 0x10, 8, 4, 0x13, 8, // cmpeq
            0x8B, 0x01, // jze label 1
            0x10, 8, 9, 0x12, 8, // not taken
            0x07, 0x01, 0x10, 8, 1, 0x12, 8, // taken
        ];
        assert_eq!(run(&program), 1);

        let program = [
            0x01, 0xA1, 0xFA, 0x01,
            0x10, 8, 4, 0x10, 8, 5, 0x13, 8,
            0x8B, 0x01,
            0x10, 8, 9, 0x12, 8,
            0x07, 0x01, 0x10, 8, 1, 0x12, 8,
        ];
        assert_eq!(run(&program), 9);
    }

    #[test]
    fn flags_mode_drives_jze_identically() {
        // META 0x1F ahead of the same comparison: nothing is pushed, the
        // zero flag drives the jump instead.
        let program = [
            0x01, 0xA1, 0x03, 0x1F, 0xFA, 0x01,
            0x10, 8, 4, 0x10, 8, 4, 0x13, 8,
            0x8B, 0x01,
            0x10, 8, 9, 0x12, 8,
            0x07, 0x01, 0x10, 8, 1, 0x12, 8,
        ];
        assert_eq!(run(&program), 1);
    }

    #[test]
    fn flags_mode_comparison_does_not_push() {
        // With flags mode on, CMPEQ consumes its operands but pushes no
        // boolean; the later HLT sees the value below instead.
        let program = [
            0x01, 0xA1, 0x03, 0x1F, // binary, meta flags
            0x10, 8, 2, // sentinel
            0x10, 8, 30, 0x10, 8, 30, 0x13, 8, // cmpeq
            0x12, 8, // hlt pops the sentinel
        ];
        let mut vm = load(&program);
        assert_eq!(vm.run(), 2);
        assert!(vm.zero_flag);
    }

    #[test]
    fn flags_mode_comparison_sets_the_negative_flag() {
        // CONST 2, CONST 5, CMPLT: 2 < 5, so both flags come up true.
        let program = [
            0x01, 0xA1, 0x03, 0x1F,
            0x10, 8, 2, 0x10, 8, 5, 0x16, 8,
            0x10, 8, 0, 0x12, 8,
        ];
        let mut vm = load(&program);
        assert_eq!(vm.run(), 0);
        assert!(vm.zero_flag);
        assert!(vm.neg_flag);
    }

    #[test]
    fn call_and_ret_nest() {
        // Entry calls f1, f1 calls f2, both return; result proves both
        // bodies ran in order: ((0 + 5) * 3) via two functions.
        let program = [
            0x01, 0xA2, // inline entry
            0xFA, 0x01, // section 1
            0x06, 0x00, // func 0 (entry)
            0x10, 8, 5, // const 5
            0x4C, 0x01, // call 1
            0x12, 8, // hlt
            0x06, 0x01, // func 1
            0x10, 8, 3, // const 3
            0x4C, 0x02, // call 2
            0x5C, // ret
            0x06, 0x02, // func 2
            0xBA, 8, // mul
            0x5C, // ret
        ];
        assert_eq!(run(&program), 15);
    }

    #[test]
    fn ret_without_frames_falls_back_to_rtp() {
        let mut vm = load(&[0x00]);
        vm.registers.set(Register::Rtp, 0x1234);
        vm.frames.clear();
        // A RET placed at rip.
        let rip = vm.registers.get(Register::Rip) as usize;
        vm.memory.set_u8(rip, 0x5C);
        step(&mut vm).unwrap();
        assert_eq!(vm.registers.get(Register::Rip), 0x1234);
    }

    #[test]
    fn asciz_places_bytes_at_the_data_cursor() {
        // OFFSET 2 reserves two bytes, then ASCIZ "ok\0" lands at offset 2.
        let program = [
            0x01, 0xA1, // binary
            0xBB, 2, // offset 2
            0x19, 3, b'o', b'k', 0, // asciz
            0x10, 8, 0, 0x12, 8, // const 0, hlt
        ];
        let mut vm = load(&program);
        assert_eq!(vm.run(), 0);
        assert_eq!(heap_load(&mut vm, Width::W8, 2), u32::from(b'o'));
        assert_eq!(heap_load(&mut vm, Width::W8, 3), u32::from(b'k'));
        assert_eq!(heap_load(&mut vm, Width::W8, 4), 0);
    }

    #[test]
    fn live_meta_opcode_enables_flags_mode() {
        let mut vm = load(&[0x01, 0xA1, 0x03, 0x1F, 0x10, 8, 0, 0x12, 8]);
        assert!(vm.use_flags);
        // Flags mode arrives from preprocessing here, but the live opcode
        // path must agree.
        vm.use_flags = false;
        vm.run();
        assert!(vm.use_flags);
    }
}
