//! The loaded game image: header parsing, ROM/RAM boundary enforcement,
//! and memory resizing.

use crate::bytes;
use crate::error::{Result, TerpError};
use log::{debug, warn};
use std::fmt;

/// Fixed header field offsets.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_RAMSTART: usize = 8;
const OFF_EXTSTART: usize = 12;
const OFF_ENDMEM: usize = 16;
const OFF_STACKSIZE: usize = 20;
const OFF_STARTFUNC: usize = 24;
const OFF_DECODINGTBL: usize = 28;
const OFF_CHECKSUM: usize = 32;

/// The four magic bytes every Glulx image starts with.
const MAGIC: &[u8; 4] = b"Glul";

/// Size of the header slice preserved for save files.
pub const HEADER_SIZE: usize = 128;

/// Memory sizes are always rounded up to this granularity.
const MEM_ROUND: u32 = 256;

/// Round a size up to the next memory-allocation boundary.
pub fn round_up(value: u32) -> u32 {
    value.checked_add(MEM_ROUND - 1).map_or(u32::MAX & !(MEM_ROUND - 1), |v| v & !(MEM_ROUND - 1))
}

/// Parsed copy of the fixed header fields.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u32,
    pub ram_start: u32,
    pub ext_start: u32,
    pub end_mem: u32,
    pub stack_size: u32,
    pub start_func: u32,
    pub decoding_table: u32,
    pub checksum: u32,
}

impl Header {
    fn parse(bytes: &[u8]) -> Header {
        Header {
            version: bytes::read_u32(bytes, OFF_VERSION),
            ram_start: bytes::read_u32(bytes, OFF_RAMSTART),
            ext_start: bytes::read_u32(bytes, OFF_EXTSTART),
            end_mem: bytes::read_u32(bytes, OFF_ENDMEM),
            stack_size: bytes::read_u32(bytes, OFF_STACKSIZE),
            start_func: bytes::read_u32(bytes, OFF_STARTFUNC),
            decoding_table: bytes::read_u32(bytes, OFF_DECODINGTBL),
            checksum: bytes::read_u32(bytes, OFF_CHECKSUM),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "
Glulx version:       {}.{}.{}
RAM start:           {:#010x}
Extended mem start:  {:#010x}
End of memory:       {:#010x}
Stack size:          {:#010x}
Start function:      {:#010x}
Decoding table:      {:#010x}
Checksum:            {:#010x}
",
            self.version >> 16,
            (self.version >> 8) & 0xFF,
            self.version & 0xFF,
            self.ram_start,
            self.ext_start,
            self.end_mem,
            self.stack_size,
            self.start_func,
            self.decoding_table,
            self.checksum,
        )
    }
}

/// The program image: one flat byte buffer with a ROM/RAM boundary.
///
/// Writes below `ram_start` and any access at or past `end_mem` fail.
/// The original file bytes are kept for restart, save-file deltas and
/// the verify opcode.
#[derive(Debug)]
pub struct ImageMemory {
    bytes: Vec<u8>,
    original: Vec<u8>,
    header: Header,
    end_mem: u32,
}

impl ImageMemory {
    /// Load and validate an image from its file bytes.
    pub fn load(file: Vec<u8>) -> Result<ImageMemory> {
        if file.len() < HEADER_SIZE {
            return Err(TerpError::bad_image(format!(
                "file is too small to be a Glulx image ({} bytes)",
                file.len()
            )));
        }
        if &file[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
            return Err(TerpError::bad_image("wrong magic number".to_string()));
        }

        let header = Header::parse(&file);
        debug!("loaded header: {}", header);

        if !(0x00020000..=0x000301FF).contains(&header.version) {
            return Err(TerpError::bad_image(format!(
                "unsupported Glulx version {:#010x}",
                header.version
            )));
        }
        if header.ram_start < 36
            || header.ram_start % MEM_ROUND != 0
            || header.ext_start % MEM_ROUND != 0
            || header.end_mem % MEM_ROUND != 0
        {
            return Err(TerpError::bad_image("misaligned memory layout fields".to_string()));
        }
        if header.ram_start > header.ext_start || header.ext_start > header.end_mem {
            return Err(TerpError::bad_image("memory layout fields out of order".to_string()));
        }
        if (file.len() as u32) < header.ext_start {
            return Err(TerpError::bad_image(format!(
                "file length {} is less than ext_start {:#x}",
                file.len(),
                header.ext_start
            )));
        }
        if file.len() as u32 > header.ext_start {
            warn!(
                "file has {} trailing bytes past ext_start",
                file.len() as u32 - header.ext_start
            );
        }

        let computed = checksum(&file, header.ext_start);
        if computed != header.checksum {
            return Err(TerpError::bad_image(format!(
                "checksum mismatch: computed {:#010x}, header says {:#010x}",
                computed, header.checksum
            )));
        }

        let mut bytes = file.clone();
        bytes.resize(header.end_mem as usize, 0);
        let end_mem = header.end_mem;

        Ok(ImageMemory {
            bytes,
            original: file,
            header,
            end_mem,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn ram_start(&self) -> u32 {
        self.header.ram_start
    }

    pub fn end_mem(&self) -> u32 {
        self.end_mem
    }

    /// Re-run the load-time checksum over the original file bytes.
    pub fn verify(&self) -> bool {
        checksum(&self.original, self.header.ext_start) == self.header.checksum
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8> {
        if addr >= self.end_mem {
            return Err(self.range_fault(addr, 1));
        }
        Ok(self.bytes[addr as usize])
    }

    pub fn read_u16(&self, addr: u32) -> Result<u16> {
        if addr.checked_add(2).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(addr, 2));
        }
        Ok(bytes::read_u16(&self.bytes, addr as usize))
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        if addr.checked_add(4).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(addr, 4));
        }
        Ok(bytes::read_u32(&self.bytes, addr as usize))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<()> {
        self.check_write(addr, 1)?;
        self.bytes[addr as usize] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<()> {
        self.check_write(addr, 2)?;
        bytes::write_u16(&mut self.bytes, addr as usize, value);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.check_write(addr, 4)?;
        bytes::write_u32(&mut self.bytes, addr as usize, value);
        Ok(())
    }

    fn check_write(&self, addr: u32, size: u32) -> Result<()> {
        if addr < self.header.ram_start {
            return Err(TerpError::fault(format!(
                "write to read-only memory at {addr:#010x}"
            )));
        }
        if addr.checked_add(size).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(addr, size));
        }
        Ok(())
    }

    fn range_fault(&self, addr: u32, size: u32) -> TerpError {
        TerpError::fault(format!(
            "memory access of {size} bytes at {addr:#010x} is outside memory (end_mem {:#010x})",
            self.end_mem
        ))
    }

    /// Grow or shrink memory. The new size is rounded up to a 256-byte
    /// boundary; existing bytes are preserved and growth is zero-filled.
    pub fn set_end_mem(&mut self, value: u32) -> Result<()> {
        let rounded = round_up(value);
        if rounded < self.header.ram_start {
            return Err(TerpError::fault(format!(
                "cannot shrink memory to {rounded:#x}, below ram_start"
            )));
        }
        if rounded != self.end_mem {
            debug!("resizing memory {:#x} -> {:#x}", self.end_mem, rounded);
            self.bytes.resize(rounded as usize, 0);
            self.end_mem = rounded;
        }
        Ok(())
    }

    /// Throw away all RAM changes and return to the as-loaded state.
    pub fn revert(&mut self) {
        self.bytes = self.original.clone();
        self.bytes.resize(self.header.end_mem as usize, 0);
        self.end_mem = self.header.end_mem;
    }

    /// The first 128 bytes of the original file, used to identify the
    /// program in save files.
    pub fn original_header(&self) -> &[u8] {
        &self.original[..HEADER_SIZE]
    }

    /// The original RAM contents as stored in the file (`ram_start` up
    /// to `ext_start`; extended memory starts out as zeroes).
    pub fn original_ram(&self) -> &[u8] {
        &self.original[self.header.ram_start as usize..self.header.ext_start as usize]
    }

    /// Current size of RAM in bytes.
    pub fn ram_size(&self) -> u32 {
        self.end_mem - self.header.ram_start
    }

    /// Copy out a range of RAM. Offsets are relative to `ram_start`.
    pub fn read_ram(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let start = self.header.ram_start + offset;
        if start.checked_add(len).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(start, len));
        }
        Ok(self.bytes[start as usize..(start + len) as usize].to_vec())
    }

    /// Overwrite a range of RAM. Offsets are relative to `ram_start`.
    pub fn write_ram(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let start = self.header.ram_start + offset;
        let len = data.len() as u32;
        if start.checked_add(len).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(start, len));
        }
        self.bytes[start as usize..(start + len) as usize].copy_from_slice(data);
        Ok(())
    }

    /// Replace RAM wholesale (restore path), resizing memory to fit.
    pub fn set_ram(&mut self, ram: &[u8]) -> Result<()> {
        self.set_end_mem(self.header.ram_start + ram.len() as u32)?;
        let start = self.header.ram_start as usize;
        self.bytes[start..].fill(0);
        self.bytes[start..start + ram.len()].copy_from_slice(ram);
        Ok(())
    }

    /// Whole-memory copy helper for mcopy; handles overlapping ranges.
    pub fn copy_within(&mut self, src: u32, dest: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if src.checked_add(len).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(src, len));
        }
        self.check_write(dest, len)?;
        self.bytes
            .copy_within(src as usize..(src + len) as usize, dest as usize);
        Ok(())
    }

    /// Zero-fill helper for mzero.
    pub fn zero_range(&mut self, addr: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_write(addr, len)?;
        self.bytes[addr as usize..(addr + len) as usize].fill(0);
        Ok(())
    }

    /// Direct slice access for the string decoder and search opcodes.
    pub fn slice(&self, addr: u32, len: u32) -> Result<&[u8]> {
        if addr.checked_add(len).map_or(true, |end| end > self.end_mem) {
            return Err(self.range_fault(addr, len));
        }
        Ok(&self.bytes[addr as usize..(addr + len) as usize])
    }
}

/// The header checksum: sum mod 2^32 of all 32-bit words from offset 0
/// through `ext_start`, counting the checksum word itself as zero.
pub fn checksum(file: &[u8], ext_start: u32) -> u32 {
    let end = (ext_start as usize).min(file.len() & !3);
    let mut sum = 0u32;
    let mut off = 0;
    while off + 4 <= end {
        if off != OFF_CHECKSUM {
            sum = sum.wrapping_add(bytes::read_u32(file, off));
        }
        off += 4;
    }
    sum
}
