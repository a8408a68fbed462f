//! End-to-end scenarios over hand-assembled programs.

use crate::interpreter::{Interpreter, GLULX_VERSION};
use crate::memory::ImageMemory;
use crate::output::ChannelId;
use crate::test_utils::{
    encode_op, pack_modes, run_expr, run_expr_err, run_program, run_program_with, ImageBuilder,
    TestHost, TEST_RAM_START,
};
use test_log::test;

const R0: u32 = TEST_RAM_START;
const R4: u32 = TEST_RAM_START + 4;
const R8: u32 = TEST_RAM_START + 8;
const R12: u32 = TEST_RAM_START + 12;

/// Minimal assembler: appends encoded pieces and patches branch bytes.
struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    fn new() -> Asm {
        // Every test function takes no arguments and has no locals
        // unless it says otherwise.
        Asm {
            bytes: vec![0xC1, 0x00, 0x00],
        }
    }

    fn raw(mut self, bytes: &[u8]) -> Asm {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn op(self, num: u32) -> Asm {
        let b = encode_op(num);
        self.raw(&b)
    }

    fn modes(self, m: &[u8]) -> Asm {
        let b = pack_modes(m);
        self.raw(&b)
    }

    fn b1(self, v: u8) -> Asm {
        self.raw(&[v])
    }

    fn b4(self, v: u32) -> Asm {
        self.raw(&v.to_be_bytes())
    }

    fn here(&self) -> usize {
        self.bytes.len()
    }

    /// Reserve a one-byte branch offset, to be patched later.
    fn branch_u8(mut self) -> (Asm, usize) {
        let at = self.bytes.len();
        self.bytes.push(0);
        (self, at)
    }

    /// Point the reserved branch byte at the current position.
    fn land(mut self, at: usize) -> Asm {
        // Branches are relative to the end of the instruction, offset
        // by two; the offset byte is the instruction's last byte.
        let offset = self.bytes.len() - (at + 1) + 2;
        self.bytes[at] = offset as u8;
        self
    }

    fn quit(self) -> Asm {
        self.op(0x120)
    }
}

#[test]
fn test_return_42_stops_cleanly() {
    // A one-instruction program: return 42.
    let mut b = ImageBuilder::new();
    b.code(&[0xC1, 0x00, 0x00, 0x31, 0x01, 42]);
    let (host, state) = TestHost::new();
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(terp.sp(), 0);
    // No output, no input requested.
    assert!(state.borrow().flushes.is_empty());
    assert!(state.borrow().lines.is_empty());
}

#[test]
fn test_call_deposits_through_stub() {
    let mut b = ImageBuilder::new();
    // f: push 99, return the popped top of stack.
    let f = b.code(&[0xC0, 0x00, 0x00, 0x40, 0x81, 99, 0x31, 0x08]);
    let main = Asm::new()
        .op(0x30) // call f, 0 args, store to R0
        .modes(&[3, 0, 7])
        .b4(f)
        .b4(R0)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 99);
}

#[test]
fn test_callf_passes_args_to_locals() {
    let mut b = ImageBuilder::new();
    // f(x, y) = x - y, with two 4-byte locals.
    let f_asm = Asm {
        bytes: vec![0xC1, 0x04, 0x02, 0x00, 0x00],
    }
    .op(0x11) // sub L0 L1 -> push
    .modes(&[9, 9, 8])
    .b1(0)
    .b1(4)
    .op(0x31) // return pop
    .modes(&[8]);
    let f = b.code(&f_asm.bytes);
    let main = Asm::new()
        .op(0x162) // callfii f, 30, 12 -> R0
        .modes(&[3, 1, 1, 7])
        .b4(f)
        .b1(30)
        .b1(12)
        .b4(R0)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 18);
}

#[test]
fn test_branch_targets_zero_and_one_return() {
    let mut b = ImageBuilder::new();
    // f: jz 0 1 -- the branch "target" 1 returns 1 from f.
    let f = b.code(&[0xC1, 0x00, 0x00, 0x22, 0x11, 0x00, 0x01]);
    let main = Asm::new()
        .op(0x30)
        .modes(&[3, 0, 7])
        .b4(f)
        .b4(R0)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1);
}

#[test]
fn test_relative_branch_skips_code() {
    // jump over a marker store; only the second store runs.
    let asm = Asm::new().op(0x20).modes(&[1]);
    let (asm, patch) = asm.branch_u8();
    let asm = asm
        .op(0x40) // copy 1 -> R0 (skipped)
        .modes(&[1, 7])
        .b1(1)
        .b4(R0);
    let asm = asm.land(patch);
    let asm = asm
        .op(0x40) // copy 2 -> R4
        .modes(&[1, 7])
        .b1(2)
        .b4(R4)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0);
    assert_eq!(terp.image.read_u32(R4).unwrap(), 2);
}

#[test]
fn test_tailcall_reuses_the_callers_stub() {
    let mut b = ImageBuilder::new();
    let g = b.code(&[0xC1, 0x00, 0x00, 0x31, 0x01, 7]); // return 7
    let f_asm = Asm::new().op(0x34).modes(&[3, 0]).b4(g); // tailcall g, 0
    let f = b.code(&f_asm.bytes);
    let main = Asm::new()
        .op(0x30)
        .modes(&[3, 0, 7])
        .b4(f)
        .b4(R0)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 7);
}

#[test]
fn test_catch_and_throw() {
    // catch establishes a handler token in R0 and branches to the
    // thrower; the throw unwinds, stores 0x63 through the catch stub,
    // and resumes after the catch instruction.
    let asm = Asm::new().op(0x32).modes(&[7, 1]).b4(R0);
    let (asm, patch) = asm.branch_u8();
    let asm = asm
        .op(0x40) // after-catch: copy 1 -> R4
        .modes(&[1, 7])
        .b1(1)
        .b4(R4)
        .quit();
    let asm = asm.land(patch);
    let asm = asm
        .op(0x33) // throw 0x63, token at R0
        .modes(&[1, 7])
        .b1(0x63)
        .b4(R0);
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0x63);
    assert_eq!(terp.image.read_u32(R4).unwrap(), 1);
}

#[test]
fn test_stack_opcodes() {
    // Push 1 2 3, roll the top three up by one, then pop into memory.
    let asm = Asm::new()
        .op(0x40).modes(&[1, 8]).b1(1)
        .op(0x40).modes(&[1, 8]).b1(2)
        .op(0x40).modes(&[1, 8]).b1(3)
        .op(0x53).modes(&[1, 1]).b1(3).b1(1) // stkroll 3 1
        .op(0x40).modes(&[8, 7]).b4(R0)
        .op(0x40).modes(&[8, 7]).b4(R4)
        .op(0x40).modes(&[8, 7]).b4(R8)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    // Before the roll the stack is 1 2 3 (3 on top); afterwards 3 1 2.
    assert_eq!(terp.image.read_u32(R0).unwrap(), 2);
    assert_eq!(terp.image.read_u32(R4).unwrap(), 1);
    assert_eq!(terp.image.read_u32(R8).unwrap(), 3);
}

#[test]
fn test_channel_output() {
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0) // setiosys channels
        .op(0x70).modes(&[1]).b1(b'H')
        .op(0x70).modes(&[1]).b1(b'i')
        .op(0x71).modes(&[1]).b1((-42i8) as u8) // streamnum -42
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    let (_, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(state.borrow().main_text(), "Hi-42");
}

#[test]
fn test_unicode_channel_output() {
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0)
        .op(0x73).modes(&[3]).b4(0x263A) // streamunichar ☺
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    let (_, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(state.borrow().main_text(), "\u{263A}");
}

#[test]
fn test_stream_cstring() {
    let mut b = ImageBuilder::new();
    let s = b.code(b"\xE0hello\x00");
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0)
        .op(0x72).modes(&[3]).b4(s)
        .quit();
    let start = b.code(&asm.bytes);
    b.set_start(start);
    let (host, state) = TestHost::new();
    let (_, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(state.borrow().main_text(), "hello");
}

#[test]
fn test_compressed_string_with_function_node() {
    let mut b = ImageBuilder::new();
    // f prints 'c' and returns.
    let f = b.code(&[0xC1, 0x00, 0x00, 0x70, 0x01, b'c', 0x31, 0x01, 0x00]);

    // Tree: 'a' on bit 0; bit 1 then 0 is an indirect call of f; bit 1
    // then 1 is the end marker.
    let base = b.next_code_addr();
    let root = base + 12;
    let n_a = root + 9;
    let n_b2 = n_a + 2;
    let n_call = n_b2 + 9;
    let n_end = n_call + 5;
    let total = n_end + 1 - base;
    let mut table = Vec::new();
    table.extend(total.to_be_bytes());
    table.extend(5u32.to_be_bytes());
    table.extend(root.to_be_bytes());
    table.push(0);
    table.extend(n_a.to_be_bytes());
    table.extend(n_b2.to_be_bytes());
    table.push(2);
    table.push(b'a');
    table.push(0);
    table.extend(n_call.to_be_bytes());
    table.extend(n_end.to_be_bytes());
    table.push(8);
    table.extend(f.to_be_bytes());
    table.push(1);
    b.code(&table);
    b.set_decoding_table(base);

    // Bit stream: 'a' (0), call (1 0), 'a' (0), end (1 1) packs
    // LSB-first into 0b110010.
    let s = b.code(&[0xE1, 0b0011_0010]);

    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0)
        .op(0x72).modes(&[3]).b4(s)
        .quit();
    let start = b.code(&asm.bytes);
    b.set_start(start);
    let (host, state) = TestHost::new();
    let (_, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(state.borrow().main_text(), "aca");
}

#[test]
fn test_filter_iosys_calls_per_character() {
    let mut b = ImageBuilder::new();
    // filter(ch): store ch in R0, bump the counter in R4, return 0.
    let filter_asm = Asm {
        bytes: vec![0xC1, 0x04, 0x01, 0x00, 0x00],
    }
    .op(0x40).modes(&[9, 7]).b1(0).b4(R0)
    .op(0x10).modes(&[7, 1, 7]).b4(R4).b1(1).b4(R4)
    .op(0x31).modes(&[1]).b1(0);
    let filter = b.code(&filter_asm.bytes);

    let main = Asm::new()
        .op(0x149).modes(&[1, 3]).b1(1).b4(filter) // setiosys filter
        .op(0x70).modes(&[1]).b1(b'A')
        .op(0x70).modes(&[1]).b1(b'B')
        .op(0x71).modes(&[1]).b1((-5i8) as u8) // streamnum -5: two more calls
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R4).unwrap(), 4);
    assert_eq!(terp.image.read_u32(R0).unwrap(), b'5' as u32);
}

#[test]
fn test_save_then_restore_resumes_with_minus_one() {
    // save -> result 0; restore resumes at the save point with -1.
    let asm = Asm::new().op(0x123).modes(&[0, 7]).b4(R0); // save -> R0
    let after_save = asm.here();
    let asm = asm.op(0x23).modes(&[7, 1]).b4(R0); // jnz R0 -> done
    let (asm, patch) = asm.branch_u8();
    let asm = asm
        .op(0x124).modes(&[0, 7]).b4(R4) // restore -> R4 (on failure)
        .quit();
    let asm = asm.land(patch);
    let asm = asm
        .op(0x40).modes(&[1, 7]).b1(1).b4(R8) // done: marker
        .quit();
    assert!(after_save > 0);

    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    // The restore pulled the save made moments earlier, so the marker
    // ran with R0 holding the "restored" value.
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0xFFFF_FFFF);
    assert_eq!(terp.image.read_u32(R8).unwrap(), 1);
    assert_eq!(state.borrow().saves.len(), 1);
}

#[test]
fn test_save_cancelled_by_host_reports_failure() {
    let asm = Asm::new()
        .op(0x123).modes(&[0, 7]).b4(R0)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    state.borrow_mut().refuse_saves = true;
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1);
}

#[test]
fn test_saveundo_then_restoreundo() {
    let asm = Asm::new().op(0x125).modes(&[7]).b4(R0); // saveundo -> R0
    let asm = asm.op(0x23).modes(&[7, 1]).b4(R0);
    let (asm, patch) = asm.branch_u8();
    let asm = asm
        .op(0x126).modes(&[7]).b4(R4) // restoreundo
        .quit();
    let asm = asm.land(patch);
    let asm = asm
        .op(0x40).modes(&[1, 7]).b1(1).b4(R8)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0xFFFF_FFFF);
    assert_eq!(terp.image.read_u32(R8).unwrap(), 1);
}

#[test]
fn test_restoreundo_with_nothing_saved_fails() {
    let asm = Asm::new()
        .op(0x126).modes(&[7]).b4(R0)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1);
}

#[test]
fn test_restart_preserves_protected_ram() {
    // P survives restart because it is protected; Q reverts to zero.
    let p = R0;
    let q = R4;
    let asm = Asm::new().op(0x23).modes(&[7, 1]).b4(p); // jnz P -> done
    let (asm, patch) = asm.branch_u8();
    let asm = asm
        .op(0x40).modes(&[1, 7]).b1(0x11).b4(p)
        .op(0x40).modes(&[1, 7]).b1(0x22).b4(q)
        .op(0x127).modes(&[3, 1]).b4(p).b1(4) // protect P, 4 bytes
        .op(0x122); // restart
    let asm = asm.land(patch);
    let asm = asm.quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(p).unwrap(), 0x11);
    assert_eq!(terp.image.read_u32(q).unwrap(), 0);
}

#[test]
fn test_heap_opcodes_round_trip() {
    let asm = Asm::new()
        .op(0x178).modes(&[1, 7]).b1(100).b4(R0) // malloc 100
        .op(0x179).modes(&[7]).b4(R0) // mfree
        .op(0x178).modes(&[1, 7]).b1(100).b4(R4)
        .op(0x179).modes(&[7]).b4(R4)
        .op(0x102).modes(&[7]).b4(R8) // getmemsize
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    let first = terp.image.read_u32(R0).unwrap();
    let second = terp.image.read_u32(R4).unwrap();
    assert_ne!(first, 0);
    assert_eq!(first, second);
    // After the final free the heap is torn down and memory is back to
    // its original size.
    let end_mem = terp.image.read_u32(R8).unwrap();
    assert_eq!(end_mem, terp.image.header().end_mem);
}

#[test]
fn test_setmemsize_refused_while_heap_live() {
    let grow = 0x2000;
    let asm = Asm::new()
        .op(0x178).modes(&[1, 7]).b1(16).b4(R0) // malloc 16
        .op(0x103).modes(&[3, 7]).b4(grow).b4(R4) // setmemsize: refused
        .op(0x179).modes(&[7]).b4(R0) // mfree
        .op(0x103).modes(&[3, 7]).b4(grow).b4(R8) // setmemsize: ok now
        .op(0x102).modes(&[7]).b4(R12)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R4).unwrap(), 1);
    assert_eq!(terp.image.read_u32(R8).unwrap(), 0);
    assert_eq!(terp.image.read_u32(R12).unwrap(), grow);
}

#[test]
fn test_gestalt_selectors() {
    assert_eq!(run_expr(0x100, &[0, 0]), GLULX_VERSION);
    assert_eq!(run_expr(0x100, &[4, 20]), 1); // channel iosys exists
    assert_eq!(run_expr(0x100, &[4, 3]), 0);
    assert_eq!(run_expr(0x100, &[10, 1]), 1); // Z__Region accelerated
    assert_eq!(run_expr(0x100, &[10, 8]), 0);
    run_expr_err(0x100, &[0x7FFF, 0]);
}

#[test]
fn test_random_ranges() {
    for _ in 0..10 {
        let v = run_expr(0x110, &[10]) as i32;
        assert!((0..10).contains(&v));
        let v = run_expr(0x110, &[(-10i32) as u32]) as i32;
        assert!((-9..=0).contains(&v));
    }
}

#[test]
fn test_seeded_random_is_reproducible() {
    let sample = || {
        let asm = Asm::new()
            .op(0x111).modes(&[1]).b1(5) // setrandom 5
            .op(0x110).modes(&[3, 7]).b4(1000).b4(R0)
            .op(0x110).modes(&[3, 7]).b4(1000).b4(R4)
            .quit();
        let mut b = ImageBuilder::new();
        b.code(&asm.bytes);
        let (terp, result) = run_program(b);
        result.unwrap();
        (
            terp.image.read_u32(R0).unwrap(),
            terp.image.read_u32(R4).unwrap(),
        )
    };
    assert_eq!(sample(), sample());
}

#[test]
fn test_linear_and_binary_search() {
    // The table of keys 3 5 7 9 sits at the start of RAM.
    const TABLE: [u8; 16] = [0, 0, 0, 3, 0, 0, 0, 5, 0, 0, 0, 7, 0, 0, 0, 9];
    let search = |op: u32, key: u32, options: u8| {
        Asm::new()
            .op(op)
            .modes(&[3, 1, 3, 1, 1, 1, 1, 7])
            .b4(key)
            .b1(4) // keysize
            .b4(TEST_RAM_START)
            .b1(4) // structsize
            .b1(4) // numstructs
            .b1(0) // keyoffset
            .b1(options)
            .b4(R0)
            .quit()
    };
    let run_search = |op: u32, key: u32, options: u8| {
        let mut b = ImageBuilder::new();
        b.ram_bytes(&TABLE);
        b.code(&search(op, key, options).bytes);
        let (terp, result) = run_program(b);
        result.unwrap();
        terp.image.read_u32(TEST_RAM_START).unwrap()
    };
    // The result lands in R0 = the table's first slot, which no longer
    // holds a key by the time we read it; that is fine, the searches
    // completed before the store.
    assert_eq!(run_search(0x150, 7, 0), TEST_RAM_START + 8);
    assert_eq!(run_search(0x151, 7, 4), 2); // ReturnIndex
    assert_eq!(run_search(0x151, 8, 4), 0xFFFF_FFFF);
    assert_eq!(run_search(0x150, 8, 0), 0);
}

#[test]
fn test_invalid_search_option_combinations_fault() {
    // ZeroKeyTerminates with binarysearch.
    run_expr_err(0x151, &[1, 4, TEST_RAM_START, 4, 4, 0, 2]);
    // ReturnIndex with linkedsearch.
    run_expr_err(0x152, &[1, 4, TEST_RAM_START, 0, 4, 4]);
}

#[test]
fn test_linkedsearch_follows_links() {
    let mut b = ImageBuilder::new();
    // Three nodes: key, next. The second holds the key we want.
    let n1 = TEST_RAM_START;
    let n2 = TEST_RAM_START + 8;
    let n3 = TEST_RAM_START + 16;
    let mut nodes = Vec::new();
    nodes.extend(10u32.to_be_bytes());
    nodes.extend(n2.to_be_bytes());
    nodes.extend(20u32.to_be_bytes());
    nodes.extend(n3.to_be_bytes());
    nodes.extend(30u32.to_be_bytes());
    nodes.extend(0u32.to_be_bytes());
    b.ram_bytes(&nodes);
    let asm = Asm::new()
        .op(0x152)
        .modes(&[1, 1, 3, 1, 1, 1, 7])
        .b1(20)
        .b1(4)
        .b4(n1)
        .b1(0) // keyoffset
        .b1(4) // nextoffset
        .b1(0)
        .b4(R0)
        .quit();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), n2);
}

#[test]
fn test_aload_and_astore() {
    let asm = Asm::new()
        .op(0x4C).modes(&[3, 1, 3]).b4(R0).b1(1).b4(0xDEADBEEF) // astore R0[1]
        .op(0x48).modes(&[3, 1, 7]).b4(R0).b1(1).b4(R8) // aload back
        .op(0x4E).modes(&[3, 1, 1]).b4(R0).b1(0).b1(0x7F) // astoreb
        .op(0x4B).modes(&[3, 3, 7]).b4(R0 + 1).b4((-1i32) as u32).b4(R12)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R8).unwrap(), 0xDEADBEEF);
    // Bit -1 from R0+1 is the top bit of the byte at R0, which holds
    // 0x7F, so it reads 0.
    assert_eq!(terp.image.read_u32(R12).unwrap(), 0);
    assert_eq!(terp.image.read_u8(R0).unwrap(), 0x7F);
}

#[test]
fn test_copys_moves_sixteen_bits() {
    let asm = Asm::new()
        .op(0x40).modes(&[3, 7]).b4(0xAABBCCDD).b4(R0)
        .op(0x41).modes(&[3, 7]).b4(0x1122_3344).b4(R8) // copys: low 16 bits
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u16(R8).unwrap(), 0x3344);
    assert_eq!(terp.image.read_u16(R8 + 2).unwrap(), 0);
}

#[test]
fn test_mzero_and_mcopy() {
    let asm = Asm::new()
        .op(0x40).modes(&[3, 7]).b4(0x01020304).b4(R0)
        // overlapping copy forward by two bytes
        .op(0x171).modes(&[1, 3, 3]).b1(4).b4(R0).b4(R0 + 2)
        .op(0x170).modes(&[1, 3]).b1(2).b4(R0) // mzero the front
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u8(R0).unwrap(), 0);
    assert_eq!(terp.image.read_u8(R0 + 1).unwrap(), 0);
    // The overlap-safe copy produced 01 02 01 02 03 04.
    assert_eq!(terp.image.read_u32(R0 + 2).unwrap(), 0x01020304);
}

#[test]
fn test_veneer_interception_of_z_region() {
    let mut b = ImageBuilder::new();
    // A dummy routine body; once registered, calls to it never enter
    // the bytecode.
    let slot_fn = b.code(&[0xC1, 0x00, 0x00, 0x31, 0x01, 0x00]);
    let obj = b.ram_bytes(&[0x70]); // object tag in RAM
    let string = b.code(b"\xE0x\x00");
    let main = Asm::new()
        .op(0x180).modes(&[1, 3]).b1(1).b4(slot_fn) // accelfunc 1 = Z__Region
        .op(0x40).modes(&[3, 8]).b4(obj) // push arg
        .op(0x30).modes(&[3, 1, 7]).b4(slot_fn).b1(1).b4(R0)
        .op(0x40).modes(&[3, 8]).b4(string)
        .op(0x30).modes(&[3, 1, 7]).b4(slot_fn).b1(1).b4(R4)
        .op(0x40).modes(&[3, 8]).b4(slot_fn) // a routine address
        .op(0x30).modes(&[3, 1, 7]).b4(slot_fn).b1(1).b4(R8)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1); // object
    assert_eq!(terp.image.read_u32(R4).unwrap(), 3); // string
    assert_eq!(terp.image.read_u32(R8).unwrap(), 2); // routine
}

#[test]
fn test_fyrecall_channel_select_and_case() {
    let scor = u32::from_be_bytes(*b"SCOR");
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0)
        .op(0x1000).modes(&[1, 3, 0, 0]).b1(5).b4(scor) // Channel SCOR
        .op(0x70).modes(&[1]).b1(b'9')
        .op(0x1000).modes(&[1, 3, 0, 0]).b1(5).b4(0x4D41494E) // back to MAIN
        .op(0x70).modes(&[1]).b1(b'k')
        .op(0x1000).modes(&[1, 1, 0, 7]).b1(4).b1(b'a').b4(R0) // ToUpper
        .op(0x1000).modes(&[1, 0, 0, 0]).b1(8) // Transition
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), b'A' as u32);
    let s = state.borrow();
    let last = s.flushes.last().unwrap();
    assert_eq!(last[&ChannelId::from_name(b"SCOR")], "9");
    assert_eq!(last[&ChannelId::MAIN], "k");
    assert_eq!(s.transitions, 1);
}

#[test]
fn test_fyrecall_read_line_and_key() {
    let buf = R12;
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(20).b1(0)
        .op(0x70).modes(&[1]).b1(b'>') // prompt, must flush before input
        .op(0x1000).modes(&[1, 3, 1, 7]).b1(1).b4(buf).b1(8).b4(R0) // ReadLine
        .op(0x1000).modes(&[1, 0, 0, 7]).b1(6).b4(R4) // ReadKey
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    state.borrow_mut().lines.push_back("yes".to_string());
    state.borrow_mut().keys.push_back('q');
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 3);
    assert_eq!(&terp.image.read_ram(buf - TEST_RAM_START, 3).unwrap(), b"yes");
    assert_eq!(terp.image.read_u32(R4).unwrap(), 'q' as u32);
    // The prompt was flushed before the line was requested.
    assert_eq!(state.borrow().flushes[0][&ChannelId::MAIN], ">");
}

#[test]
fn test_fyrecall_cancelled_input_reads_empty() {
    let asm = Asm::new()
        .op(0x1000).modes(&[1, 3, 1, 7]).b1(1).b4(R12).b1(8).b4(R0)
        .op(0x1000).modes(&[1, 0, 0, 7]).b1(6).b4(R4)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b); // host has no scripted input
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0);
    assert_eq!(terp.image.read_u32(R4).unwrap(), 0);
}

#[test]
fn test_glk_output_and_line_input() {
    let buf = R12;
    let event = TEST_RAM_START + 0x40;
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(2).b1(0) // setiosys glk
        // glk window_open(0,0,0,3,0) -> R0
        .op(0x40).modes(&[1, 8]).b1(0)
        .op(0x40).modes(&[1, 8]).b1(3)
        .op(0x40).modes(&[1, 8]).b1(0)
        .op(0x40).modes(&[1, 8]).b1(0)
        .op(0x40).modes(&[1, 8]).b1(0)
        .op(0x130).modes(&[2, 1, 7]).raw(&0x0023u16.to_be_bytes()).b1(5).b4(R0)
        // glk put_char('G')
        .op(0x40).modes(&[1, 8]).b1(b'G')
        .op(0x130).modes(&[2, 1, 0]).raw(&0x0080u16.to_be_bytes()).b1(1)
        // request_line_event(win=1, buf, 8, 0)
        .op(0x40).modes(&[1, 8]).b1(0)
        .op(0x40).modes(&[1, 8]).b1(8)
        .op(0x40).modes(&[3, 8]).b4(buf)
        .op(0x40).modes(&[1, 8]).b1(1)
        .op(0x130).modes(&[2, 1, 0]).raw(&0x00D0u16.to_be_bytes()).b1(4)
        // select(event)
        .op(0x40).modes(&[3, 8]).b4(event)
        .op(0x130).modes(&[2, 1, 0]).raw(&0x00C0u16.to_be_bytes()).b1(1)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (host, state) = TestHost::new();
    state.borrow_mut().lines.push_back("go".to_string());
    let (terp, result) = run_program_with(b, host);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1); // the main window
    assert_eq!(state.borrow().flushes[0][&ChannelId::MAIN], "G");
    assert_eq!(&terp.image.read_ram(buf - TEST_RAM_START, 2).unwrap(), b"go");
    // Event struct: line input, window 1, two characters.
    assert_eq!(terp.image.read_u32(event).unwrap(), 3);
    assert_eq!(terp.image.read_u32(event + 4).unwrap(), 1);
    assert_eq!(terp.image.read_u32(event + 8).unwrap(), 2);
}

#[test]
fn test_getiosys_reports_selection() {
    let asm = Asm::new()
        .op(0x149).modes(&[1, 3]).b1(1).b4(0x1234) // filter at 0x1234
        .op(0x148).modes(&[7, 7]).b4(R0).b4(R4)
        .op(0x149).modes(&[1, 1]).b1(0).b1(0) // back to null before quitting
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 1);
    assert_eq!(terp.image.read_u32(R4).unwrap(), 0x1234);
}

#[test]
fn test_setiosys_rejects_unknown_system() {
    let asm = Asm::new()
        .op(0x149).modes(&[1, 1]).b1(7).b1(0)
        .quit();
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (_, result) = run_program(b);
    assert!(result.is_err());
}

#[test]
fn test_unknown_opcode_faults() {
    let asm = Asm::new().op(0x47); // hole in the opcode map
    let mut b = ImageBuilder::new();
    b.code(&asm.bytes);
    let (_, result) = run_program(b);
    assert!(result.is_err());
}

#[test]
fn test_invalid_operand_mode_faults() {
    let mut b = ImageBuilder::new();
    b.code(&[0xC1, 0x00, 0x00, 0x20, 0x04, 0x00]); // jump with mode 4
    let (_, result) = run_program(b);
    assert!(result.is_err());
}

#[test]
fn test_verify_passes_on_loaded_image() {
    assert_eq!(run_expr(0x121, &[]), 0);
}

#[test]
fn test_save_restore_preserves_registers_and_stack() {
    // Save inside a call with values on the stack, restore, and make
    // sure the frame comes back intact by returning a local afterward.
    let mut b = ImageBuilder::new();
    let f_asm = Asm {
        bytes: vec![0xC1, 0x04, 0x01, 0x00, 0x00],
    }
    .op(0x40).modes(&[1, 9]).b1(55).b1(0) // local0 = 55
    .op(0x123).modes(&[0, 7]).b4(R0); // save -> R0
    let f_after_save = f_asm.here();
    let f_asm = f_asm.op(0x23).modes(&[7, 1]).b4(R0);
    let (f_asm, patch) = f_asm.branch_u8();
    let f_asm = f_asm.op(0x124).modes(&[0, 7]).b4(R4).quit();
    let f_asm = f_asm.land(patch);
    let f_asm = f_asm.op(0x31).modes(&[9]).b1(0); // return local0
    assert!(f_after_save > 0);
    let f = b.code(&f_asm.bytes);
    let main = Asm::new()
        .op(0x30).modes(&[3, 0, 7]).b4(f).b4(R8)
        .quit();
    let start = b.code(&main.bytes);
    b.set_start(start);
    let (terp, result) = run_program(b);
    result.unwrap();
    // The local survived the restore round trip.
    assert_eq!(terp.image.read_u32(R8).unwrap(), 55);
    assert_eq!(terp.image.read_u32(R0).unwrap(), 0xFFFF_FFFF);
}

#[test]
fn test_image_load_scenarios() {
    // Uppercase magic is rejected.
    let mut b = ImageBuilder::new();
    b.code(&[0xC1, 0x00, 0x00, 0x31, 0x01, 0x00]);
    let mut file = b.build();
    file[..4].copy_from_slice(b"GLUL");
    assert!(ImageMemory::load(file).is_err());
    // A 64-byte file is rejected as too small.
    assert!(ImageMemory::load(vec![0u8; 64]).is_err());
}

#[test]
fn test_stack_overflow_faults() {
    // An infinite self-call must die with a fault, not a panic.
    let mut b = ImageBuilder::new();
    let here = b.next_code_addr();
    let f = Asm::new().op(0x30).modes(&[3, 0, 0]).b4(here).quit();
    b.code(&f.bytes);
    b.set_stack_size(0x400);
    let (_, result) = run_program(b);
    assert!(result.is_err());
}

#[test]
fn test_jumpabs() {
    let mut b = ImageBuilder::new();
    // Target block: store marker, quit.
    let target_asm = Asm { bytes: Vec::new() }
        .op(0x40).modes(&[1, 7]).b1(9).b4(R0)
        .quit();
    let start_asm = Asm::new()
        .op(0x104).modes(&[3]); // jumpabs, patched below
    // Lay the start function first so it is picked up, then the block.
    let start_len = start_asm.here() + 4;
    let start_addr = b.next_code_addr();
    let target_addr = start_addr + start_len as u32;
    let start_asm = start_asm.b4(target_addr);
    b.code(&start_asm.bytes);
    b.code(&target_asm.bytes);
    b.set_start(start_addr);
    let (terp, result) = run_program(b);
    result.unwrap();
    assert_eq!(terp.image.read_u32(R0).unwrap(), 9);
}

#[test]
fn test_interpreter_exposes_state_for_host() {
    let mut b = ImageBuilder::new();
    b.code(&[0xC1, 0x00, 0x00, 0x31, 0x01, 0x00]);
    let image = ImageMemory::load(b.build()).unwrap();
    let (host, _state) = TestHost::new();
    let terp = Interpreter::new(image, Box::new(host)).unwrap();
    // After bootstrap the start frame is in place.
    assert!(terp.sp() > 0);
    assert_eq!(terp.fp(), 16);
}
