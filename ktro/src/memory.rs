use crate::op::Width;

/// Highest address of the operand stack. The stack grows downward from here
/// toward address 0.
pub const STACK_BASE: usize = 0xFFF;

/// First byte of the program image. Fixed at one past the stack window.
pub const PROGRAM_START: usize = STACK_BASE + 1;

/// One flat byte-addressable buffer shared by the stack, the program image
/// and the heap. Registers live in their own small buffer, see
/// [`RegisterFile`](crate::RegisterFile).
///
/// Multi-byte accessors are big-endian throughout; the buffer is its own
/// consistent address space and never aliases host memory.
#[derive(Debug, Clone)]
pub struct Memory {
    bytes: Vec<u8>,
    heap_start: usize,
    heap_max: usize,
}

impl Memory {
    /// Create a zeroed buffer of `size` bytes partitioned around a program
    /// of `program_len` bytes.
    pub fn new(size: usize, program_len: usize) -> Self {
        Self {
            bytes: vec![0; size],
            heap_start: PROGRAM_START + program_len,
            heap_max: size - PROGRAM_START,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    pub fn heap_max(&self) -> usize {
        self.heap_max
    }

    /// Translate a logical heap offset to an absolute address.
    ///
    /// Offsets past the end of the heap window clamp to `heap_max` instead
    /// of failing; programs may rely on the clamped address as a reusable
    /// sentinel location.
    pub fn heap_address(&self, offset: usize) -> usize {
        let addr = self.heap_start + offset;
        if addr >= self.heap_max { self.heap_max } else { addr }
    }

    pub fn get_u8(&self, addr: usize) -> u8 {
        self.bytes[addr]
    }

    pub fn set_u8(&mut self, addr: usize, value: u8) {
        self.bytes[addr] = value;
    }

    pub fn get_u16(&self, addr: usize) -> u16 {
        u16::from_be_bytes([self.bytes[addr], self.bytes[addr + 1]])
    }

    pub fn set_u16(&mut self, addr: usize, value: u16) {
        self.bytes[addr..addr + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn get_u32(&self, addr: usize) -> u32 {
        u32::from_be_bytes([
            self.bytes[addr],
            self.bytes[addr + 1],
            self.bytes[addr + 2],
            self.bytes[addr + 3],
        ])
    }

    pub fn set_u32(&mut self, addr: usize, value: u32) {
        self.bytes[addr..addr + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Sized read at an absolute address.
    pub fn load(&self, width: Width, addr: usize) -> u32 {
        match width {
            Width::W8 => u32::from(self.get_u8(addr)),
            Width::W16 => u32::from(self.get_u16(addr)),
            Width::W32 => self.get_u32(addr),
        }
    }

    /// Sized write at an absolute address. The value is truncated to the
    /// given width.
    pub fn store(&mut self, width: Width, addr: usize, value: u32) {
        match width {
            Width::W8 => self.set_u8(addr, value as u8),
            Width::W16 => self.set_u16(addr, value as u16),
            Width::W32 => self.set_u32(addr, value),
        }
    }

    /// Copy a program image into the program window.
    pub fn load_program(&mut self, program: &[u8]) {
        self.bytes[PROGRAM_START..PROGRAM_START + program.len()]
            .copy_from_slice(program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_byte_accessors_are_big_endian() {
        let mut mem = Memory::new(0x2000, 0);
        mem.set_u16(0x100, 0xABCD);
        assert_eq!(mem.get_u8(0x100), 0xAB);
        assert_eq!(mem.get_u8(0x101), 0xCD);
        assert_eq!(mem.get_u16(0x100), 0xABCD);

        mem.set_u32(0x200, 0xDEAD_BEEF);
        assert_eq!(mem.get_u8(0x200), 0xDE);
        assert_eq!(mem.get_u8(0x203), 0xEF);
        assert_eq!(mem.get_u32(0x200), 0xDEAD_BEEF);
    }

    #[test]
    fn heap_addresses_follow_the_program_image() {
        let mem = Memory::new(0x10000, 16);
        assert_eq!(mem.heap_start(), PROGRAM_START + 16);
        assert_eq!(mem.heap_address(0), PROGRAM_START + 16);
        assert_eq!(mem.heap_address(5), PROGRAM_START + 21);
    }

    #[test]
    fn heap_address_clamps_to_heap_max() {
        let mem = Memory::new(0x3000, 8);
        assert_eq!(mem.heap_max(), 0x3000 - PROGRAM_START);
        assert_eq!(mem.heap_address(0x10000), mem.heap_max());
        // The boundary offset itself clamps too.
        let boundary = mem.heap_max() - mem.heap_start();
        assert_eq!(mem.heap_address(boundary), mem.heap_max());
    }

    #[test]
    fn sized_store_truncates() {
        let mut mem = Memory::new(0x2000, 0);
        mem.store(Width::W8, 0x50, 0x1FF);
        assert_eq!(mem.load(Width::W8, 0x50), 0xFF);
        mem.store(Width::W16, 0x60, 0x1_FFFF);
        assert_eq!(mem.load(Width::W16, 0x60), 0xFFFF);
    }
}
