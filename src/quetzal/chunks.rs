//! The individual chunk codecs of the save format.

use crate::bytes;
use crate::error::{Result, TerpError};
use crate::memory::{ImageMemory, HEADER_SIZE};
use crate::quetzal::compressed_memory;

pub const CHUNK_IFHD: [u8; 4] = *b"IFhd";
pub const CHUNK_CMEM: [u8; 4] = *b"CMem";
pub const CHUNK_UMEM: [u8; 4] = *b"UMem";
pub const CHUNK_STKS: [u8; 4] = *b"Stks";
pub const CHUNK_MALL: [u8; 4] = *b"MAll";

/// IFhd carries the original image header, identifying the program a
/// save belongs to.
pub fn build_ifhd(image: &ImageMemory) -> Vec<u8> {
    image.original_header().to_vec()
}

/// Restoring against a different program is rejected byte-for-byte.
pub fn verify_ifhd(data: &[u8], image: &ImageMemory) -> Result<()> {
    if data.len() != HEADER_SIZE {
        return Err(TerpError::bad_save(format!(
            "IFhd chunk is {} bytes, expected {HEADER_SIZE}",
            data.len()
        )));
    }
    if data != image.original_header() {
        return Err(TerpError::bad_save(
            "save file belongs to a different program".to_string(),
        ));
    }
    Ok(())
}

/// CMem: current RAM size, then the XOR-RLE delta against the original.
pub fn build_cmem(image: &ImageMemory) -> Result<Vec<u8>> {
    let ram = image.read_ram(0, image.ram_size())?;
    let mut out = Vec::new();
    bytes::push_u32(&mut out, ram.len() as u32);
    out.extend(compressed_memory::compress_memory(image.original_ram(), &ram));
    Ok(out)
}

pub fn parse_cmem(data: &[u8], image: &ImageMemory) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(TerpError::bad_save("CMem chunk is truncated".to_string()));
    }
    let ram_len = bytes::read_u32(data, 0) as usize;
    compressed_memory::decompress_memory(image.original_ram(), &data[4..], ram_len)
}

/// UMem: current RAM size, then the raw bytes.
pub fn build_umem(image: &ImageMemory) -> Result<Vec<u8>> {
    let ram = image.read_ram(0, image.ram_size())?;
    let mut out = Vec::new();
    bytes::push_u32(&mut out, ram.len() as u32);
    out.extend(ram);
    Ok(out)
}

pub fn parse_umem(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(TerpError::bad_save("UMem chunk is truncated".to_string()));
    }
    let ram_len = bytes::read_u32(data, 0) as usize;
    if data.len() - 4 != ram_len {
        return Err(TerpError::bad_save(format!(
            "UMem declares {ram_len} bytes but carries {}",
            data.len() - 4
        )));
    }
    Ok(data[4..].to_vec())
}
