//! Program packaging: a packaged program is the raw byte sequence written
//! to a named file, nothing more. No compression, no checksum; the only
//! in-band versioning is the `BINARY` marker the program itself carries.

use std::fs;
use std::io;
use std::path::Path;

/// Serialize a program's bytes to a file, overwriting any previous content.
pub fn write_package<P: AsRef<Path>>(path: P, program: &[u8]) -> io::Result<()> {
    fs::write(path, program)
}

/// Read a packaged program back as the byte sequence it was written from.
pub fn read_package<P: AsRef<Path>>(path: P) -> io::Result<Vec<u8>> {
    fs::read(path)
}
