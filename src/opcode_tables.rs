//! The compile-time opcode metadata table.
//!
//! For each opcode number: its mnemonic, how many load and store
//! operands it takes, and any special operand rule. The dispatch match
//! in the interpreter is keyed by the same numbers.

/// Special operand-decoding behavior attached to an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRule {
    None,
    /// Memory and local operands move 8-bit values (copyb).
    Indirect8,
    /// Memory and local operands move 16-bit values (copys).
    Indirect16,
    /// catch: the store operand comes before the load operand.
    Catch,
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeMeta {
    pub name: &'static str,
    pub loads: u8,
    pub stores: u8,
    pub rule: OperandRule,
}

const fn m(name: &'static str, loads: u8, stores: u8, rule: OperandRule) -> OpcodeMeta {
    OpcodeMeta {
        name,
        loads,
        stores,
        rule,
    }
}

/// Look up the metadata for an opcode number.
pub const fn lookup(num: u32) -> Option<OpcodeMeta> {
    use OperandRule::*;
    let meta = match num {
        0x00 => m("nop", 0, 0, None),
        0x10 => m("add", 2, 1, None),
        0x11 => m("sub", 2, 1, None),
        0x12 => m("mul", 2, 1, None),
        0x13 => m("div", 2, 1, None),
        0x14 => m("mod", 2, 1, None),
        0x15 => m("neg", 1, 1, None),
        0x18 => m("bitand", 2, 1, None),
        0x19 => m("bitor", 2, 1, None),
        0x1A => m("bitxor", 2, 1, None),
        0x1B => m("bitnot", 1, 1, None),
        0x1C => m("shiftl", 2, 1, None),
        0x1D => m("sshiftr", 2, 1, None),
        0x1E => m("ushiftr", 2, 1, None),
        0x20 => m("jump", 1, 0, None),
        0x22 => m("jz", 2, 0, None),
        0x23 => m("jnz", 2, 0, None),
        0x24 => m("jeq", 3, 0, None),
        0x25 => m("jne", 3, 0, None),
        0x26 => m("jlt", 3, 0, None),
        0x27 => m("jge", 3, 0, None),
        0x28 => m("jgt", 3, 0, None),
        0x29 => m("jle", 3, 0, None),
        0x2A => m("jltu", 3, 0, None),
        0x2B => m("jgeu", 3, 0, None),
        0x2C => m("jgtu", 3, 0, None),
        0x2D => m("jleu", 3, 0, None),
        0x30 => m("call", 2, 1, None),
        0x31 => m("return", 1, 0, None),
        0x32 => m("catch", 1, 1, Catch),
        0x33 => m("throw", 2, 0, None),
        0x34 => m("tailcall", 2, 0, None),
        0x40 => m("copy", 1, 1, None),
        0x41 => m("copys", 1, 1, Indirect16),
        0x42 => m("copyb", 1, 1, Indirect8),
        0x44 => m("sexs", 1, 1, None),
        0x45 => m("sexb", 1, 1, None),
        0x48 => m("aload", 2, 1, None),
        0x49 => m("aloads", 2, 1, None),
        0x4A => m("aloadb", 2, 1, None),
        0x4B => m("aloadbit", 2, 1, None),
        0x4C => m("astore", 3, 0, None),
        0x4D => m("astores", 3, 0, None),
        0x4E => m("astoreb", 3, 0, None),
        0x4F => m("astorebit", 3, 0, None),
        0x50 => m("stkcount", 0, 1, None),
        0x51 => m("stkpeek", 1, 1, None),
        0x52 => m("stkswap", 0, 0, None),
        0x53 => m("stkroll", 2, 0, None),
        0x54 => m("stkcopy", 1, 0, None),
        0x70 => m("streamchar", 1, 0, None),
        0x71 => m("streamnum", 1, 0, None),
        0x72 => m("streamstr", 1, 0, None),
        0x73 => m("streamunichar", 1, 0, None),
        0x100 => m("gestalt", 2, 1, None),
        0x101 => m("debugtrap", 1, 0, None),
        0x102 => m("getmemsize", 0, 1, None),
        0x103 => m("setmemsize", 1, 1, None),
        0x104 => m("jumpabs", 1, 0, None),
        0x110 => m("random", 1, 1, None),
        0x111 => m("setrandom", 1, 0, None),
        0x120 => m("quit", 0, 0, None),
        0x121 => m("verify", 0, 1, None),
        0x122 => m("restart", 0, 0, None),
        0x123 => m("save", 1, 1, None),
        0x124 => m("restore", 1, 1, None),
        0x125 => m("saveundo", 0, 1, None),
        0x126 => m("restoreundo", 0, 1, None),
        0x127 => m("protect", 2, 0, None),
        0x130 => m("glk", 2, 1, None),
        0x140 => m("getstringtbl", 0, 1, None),
        0x141 => m("setstringtbl", 1, 0, None),
        0x148 => m("getiosys", 0, 2, None),
        0x149 => m("setiosys", 2, 0, None),
        0x150 => m("linearsearch", 7, 1, None),
        0x151 => m("binarysearch", 7, 1, None),
        0x152 => m("linkedsearch", 6, 1, None),
        0x160 => m("callf", 1, 1, None),
        0x161 => m("callfi", 2, 1, None),
        0x162 => m("callfii", 3, 1, None),
        0x163 => m("callfiii", 4, 1, None),
        0x170 => m("mzero", 2, 0, None),
        0x171 => m("mcopy", 3, 0, None),
        0x178 => m("malloc", 1, 1, None),
        0x179 => m("mfree", 1, 0, None),
        0x180 => m("accelfunc", 2, 0, None),
        0x181 => m("accelparam", 2, 0, None),
        0x190 => m("numtof", 1, 1, None),
        0x191 => m("ftonumz", 1, 1, None),
        0x192 => m("ftonumn", 1, 1, None),
        0x198 => m("ceil", 1, 1, None),
        0x199 => m("floor", 1, 1, None),
        0x1A0 => m("fadd", 2, 1, None),
        0x1A1 => m("fsub", 2, 1, None),
        0x1A2 => m("fmul", 2, 1, None),
        0x1A3 => m("fdiv", 2, 1, None),
        0x1A4 => m("fmod", 2, 2, None),
        0x1A8 => m("sqrt", 1, 1, None),
        0x1A9 => m("exp", 1, 1, None),
        0x1AA => m("log", 1, 1, None),
        0x1AB => m("pow", 2, 1, None),
        0x1B0 => m("sin", 1, 1, None),
        0x1B1 => m("cos", 1, 1, None),
        0x1B2 => m("tan", 1, 1, None),
        0x1B3 => m("asin", 1, 1, None),
        0x1B4 => m("acos", 1, 1, None),
        0x1B5 => m("atan", 1, 1, None),
        0x1B6 => m("atan2", 2, 1, None),
        0x1C0 => m("jfeq", 4, 0, None),
        0x1C1 => m("jfne", 4, 0, None),
        0x1C2 => m("jflt", 3, 0, None),
        0x1C3 => m("jfle", 3, 0, None),
        0x1C4 => m("jfgt", 3, 0, None),
        0x1C5 => m("jfge", 3, 0, None),
        0x1C8 => m("jisnan", 2, 0, None),
        0x1C9 => m("jisinf", 2, 0, None),
        0x1000 => m("fyrecall", 3, 1, None),
        _ => return Option::None,
    };
    Some(meta)
}
