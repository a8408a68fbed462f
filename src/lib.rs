#![crate_name = "glowworm"]
#![allow(dead_code)]

//! A Glulx virtual machine with channel-based I/O.

pub mod bytes;
pub mod error;
pub mod glk;
pub mod heap;
pub mod host;
pub mod instruction;
pub mod interpreter;
pub mod memory;
pub mod opcode_tables;
pub mod opcodes_float;
pub mod opcodes_math;
pub mod opcodes_memory;
pub mod opcodes_search;
pub mod opcodes_stream;
pub mod output;
pub mod quetzal;
pub mod strings;
pub mod veneer;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod test_execution;
