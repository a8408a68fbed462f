//! The chunked save-file codec.
//!
//! Save files are an IFF FORM of sub-id IFZS: the original header
//! (IFhd), a RAM image (CMem compressed or UMem raw), the stack up to
//! the save-time call stub (Stks), and the allocation heap when one is
//! live (MAll). Reading parses and verifies everything before the
//! engine swaps any state in, so a rejected restore leaves the machine
//! untouched.

pub mod chunks;
pub mod compressed_memory;
pub mod iff;

use crate::error::{Result, TerpError};
use crate::heap::HeapAllocator;
use crate::memory::ImageMemory;
use iff::IffForm;
use log::debug;
use std::io::{Read, Write};

const FORM_IFZS: [u8; 4] = *b"IFZS";

/// A fully parsed save, ready to swap into the engine.
#[derive(Debug)]
pub struct SaveState {
    pub ram: Vec<u8>,
    pub stack: Vec<u8>,
    /// Serialized heap state, absent when no heap was live.
    pub heap: Option<Vec<u8>>,
}

/// Write a save of the current machine state. The caller has already
/// pushed the save-time call stub, so `stack` ends with it.
pub fn write_save<W: Write>(
    w: &mut W,
    image: &ImageMemory,
    stack: &[u8],
    heap: Option<&HeapAllocator>,
) -> Result<()> {
    let mut form = IffForm::new(FORM_IFZS);
    form.add_chunk(chunks::CHUNK_IFHD, chunks::build_ifhd(image));
    form.add_chunk(chunks::CHUNK_CMEM, chunks::build_cmem(image)?);
    form.add_chunk(chunks::CHUNK_STKS, stack.to_vec());
    if let Some(heap) = heap {
        form.add_chunk(chunks::CHUNK_MALL, heap.save());
    }
    form.write_to(w)
}

/// Read and verify a save against the loaded image.
pub fn read_save<R: Read>(r: &mut R, image: &ImageMemory) -> Result<SaveState> {
    let form = IffForm::read_from(r)?;
    if form.sub_id != FORM_IFZS {
        return Err(TerpError::bad_save(format!(
            "form type {:?} is not IFZS",
            String::from_utf8_lossy(&form.sub_id)
        )));
    }

    let ifhd = form
        .find_chunk(&chunks::CHUNK_IFHD)
        .ok_or_else(|| TerpError::bad_save("missing IFhd chunk".to_string()))?;
    chunks::verify_ifhd(&ifhd.data, image)?;

    let ram = if let Some(cmem) = form.find_chunk(&chunks::CHUNK_CMEM) {
        chunks::parse_cmem(&cmem.data, image)?
    } else if let Some(umem) = form.find_chunk(&chunks::CHUNK_UMEM) {
        chunks::parse_umem(&umem.data)?
    } else {
        return Err(TerpError::bad_save("missing CMem or UMem chunk".to_string()));
    };

    let min_ram_len = image.header().end_mem - image.header().ram_start;
    if (ram.len() as u32) < min_ram_len {
        return Err(TerpError::bad_save(format!(
            "saved RAM of {} bytes is smaller than the image's minimum of {min_ram_len}",
            ram.len()
        )));
    }

    let stks = form
        .find_chunk(&chunks::CHUNK_STKS)
        .ok_or_else(|| TerpError::bad_save("missing Stks chunk".to_string()))?;
    if stks.data.len() % 4 != 0 || stks.data.len() < 16 {
        return Err(TerpError::bad_save("Stks chunk has a malformed size".to_string()));
    }

    let heap = form
        .find_chunk(&chunks::CHUNK_MALL)
        .map(|c| c.data.clone());

    debug!(
        "parsed save: {} bytes of RAM, {} of stack, heap {}",
        ram.len(),
        stks.data.len(),
        heap.is_some()
    );
    Ok(SaveState {
        ram,
        stack: stks.data.clone(),
        heap,
    })
}
