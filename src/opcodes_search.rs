//! The linear, binary and linked search opcodes.
//!
//! Keys compare as big-endian unsigned byte strings. Direct keys must
//! be 1, 2 or 4 bytes; larger keys have to be passed indirectly.

use crate::error::{Result, TerpError};
use crate::instruction::DestKind;
use crate::interpreter::Interpreter;
use std::cmp::Ordering;

const OPT_KEY_INDIRECT: u32 = 1;
const OPT_ZERO_KEY_TERMINATES: u32 = 2;
const OPT_RETURN_INDEX: u32 = 4;

const NO_STRUCT_LIMIT: u32 = 0xFFFF_FFFF;

impl Interpreter {
    pub(crate) fn exec_search(&mut self, num: u32, l: &[u32], d: &[DestKind]) -> Result<()> {
        match num {
            // linearsearch key keysize start structsize numstructs keyoffset options
            0x150 => {
                let key = self.search_key(l[0], l[1], l[6])?;
                let (start, struct_size, num_structs, key_offset) = (l[2], l[3], l[4], l[5]);
                let zero_terminates = l[6] & OPT_ZERO_KEY_TERMINATES != 0;
                let mut i: u32 = 0;
                let found = loop {
                    if num_structs != NO_STRUCT_LIMIT && i >= num_structs {
                        break None;
                    }
                    let addr = start.wrapping_add(i.wrapping_mul(struct_size));
                    let probe = self.image.slice(addr.wrapping_add(key_offset), key.len() as u32)?;
                    if probe == &key[..] {
                        break Some((addr, i));
                    }
                    if zero_terminates && probe.iter().all(|&b| b == 0) {
                        break None;
                    }
                    i = i.wrapping_add(1);
                };
                self.store_search_result(d[0], found, l[6])
            }
            // binarysearch key keysize start structsize numstructs keyoffset options
            0x151 => {
                if l[6] & OPT_ZERO_KEY_TERMINATES != 0 {
                    return Err(TerpError::fault(
                        "binarysearch does not support ZeroKeyTerminates".to_string(),
                    ));
                }
                let key = self.search_key(l[0], l[1], l[6])?;
                let (start, struct_size, num_structs, key_offset) = (l[2], l[3], l[4], l[5]);
                let mut lo: u32 = 0;
                let mut hi: u32 = num_structs;
                let mut found = None;
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    let addr = start.wrapping_add(mid.wrapping_mul(struct_size));
                    let probe = self.image.slice(addr.wrapping_add(key_offset), key.len() as u32)?;
                    match probe.cmp(&key[..]) {
                        Ordering::Equal => {
                            found = Some((addr, mid));
                            break;
                        }
                        Ordering::Less => lo = mid + 1,
                        Ordering::Greater => hi = mid,
                    }
                }
                self.store_search_result(d[0], found, l[6])
            }
            // linkedsearch key keysize start keyoffset nextoffset options
            0x152 => {
                if l[5] & OPT_RETURN_INDEX != 0 {
                    return Err(TerpError::fault(
                        "linkedsearch does not support ReturnIndex".to_string(),
                    ));
                }
                let key = self.search_key(l[0], l[1], l[5])?;
                let (start, key_offset, next_offset) = (l[2], l[3], l[4]);
                let zero_terminates = l[5] & OPT_ZERO_KEY_TERMINATES != 0;
                let mut addr = start;
                let found = loop {
                    if addr == 0 {
                        break None;
                    }
                    let probe = self.image.slice(addr.wrapping_add(key_offset), key.len() as u32)?;
                    if probe == &key[..] {
                        break Some((addr, 0));
                    }
                    if zero_terminates && probe.iter().all(|&b| b == 0) {
                        break None;
                    }
                    addr = self.image.read_u32(addr + next_offset)?;
                };
                // Only the address form exists for linked lists.
                self.perform_store(d[0], found.map_or(0, |(addr, _)| addr))
            }
            _ => Err(TerpError::fault(format!("opcode {num:#x} has no handler"))),
        }
    }

    /// The key as the big-endian byte string structures are compared
    /// against.
    fn search_key(&self, key: u32, key_size: u32, options: u32) -> Result<Vec<u8>> {
        if options & OPT_KEY_INDIRECT != 0 {
            Ok(self.image.slice(key, key_size)?.to_vec())
        } else {
            match key_size {
                1 => Ok(vec![key as u8]),
                2 => Ok((key as u16).to_be_bytes().to_vec()),
                4 => Ok(key.to_be_bytes().to_vec()),
                _ => Err(TerpError::fault(format!(
                    "direct search key of size {key_size} is not allowed"
                ))),
            }
        }
    }

    fn store_search_result(
        &mut self,
        dest: DestKind,
        found: Option<(u32, u32)>,
        options: u32,
    ) -> Result<()> {
        let value = if options & OPT_RETURN_INDEX != 0 {
            found.map_or(NO_STRUCT_LIMIT, |(_, index)| index)
        } else {
            found.map_or(0, |(addr, _)| addr)
        };
        self.perform_store(dest, value)
    }
}
