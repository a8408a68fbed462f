//! The library compatibility shim.
//!
//! Programs compiled for the standard library talk to their I/O layer
//! through the glk opcode; this shim folds the calls the library
//! actually makes into the channel system. There is a single main
//! window whose stream feeds the MAIN channel; selectors with no
//! meaning here succeed with a zero result.
//!
//! The fyrecall opcode is the channel-native equivalent: one dispatcher
//! for line/key input, case mapping, channel selection, veneer
//! registration and scene transitions.

use crate::error::{Result, TerpError};
use crate::instruction::DestKind;
use crate::interpreter::Interpreter;
use crate::output::ChannelId;
use log::debug;

// The glk selectors the shim implements.
const SEL_EXIT: u32 = 0x0001;
const SEL_GESTALT: u32 = 0x0004;
const SEL_WINDOW_ITERATE: u32 = 0x0020;
const SEL_WINDOW_OPEN: u32 = 0x0023;
const SEL_WINDOW_CLOSE: u32 = 0x0024;
const SEL_WINDOW_GET_SIZE: u32 = 0x0025;
const SEL_WINDOW_CLEAR: u32 = 0x002A;
const SEL_WINDOW_MOVE_CURSOR: u32 = 0x002B;
const SEL_SET_WINDOW: u32 = 0x002F;
const SEL_STREAM_ITERATE: u32 = 0x0040;
const SEL_STREAM_CLOSE: u32 = 0x0044;
const SEL_STREAM_SET_CURRENT: u32 = 0x0047;
const SEL_STREAM_GET_CURRENT: u32 = 0x0048;
const SEL_PUT_CHAR: u32 = 0x0080;
const SEL_PUT_CHAR_STREAM: u32 = 0x0081;
const SEL_PUT_STRING: u32 = 0x0082;
const SEL_PUT_STRING_STREAM: u32 = 0x0083;
const SEL_PUT_BUFFER: u32 = 0x0084;
const SEL_PUT_BUFFER_STREAM: u32 = 0x0085;
const SEL_SET_STYLE: u32 = 0x0086;
const SEL_SET_STYLE_STREAM: u32 = 0x0087;
const SEL_CHAR_TO_LOWER: u32 = 0x00A0;
const SEL_CHAR_TO_UPPER: u32 = 0x00A1;
const SEL_STYLEHINT_SET: u32 = 0x00B0;
const SEL_STYLEHINT_CLEAR: u32 = 0x00B1;
const SEL_SELECT: u32 = 0x00C0;
const SEL_SELECT_POLL: u32 = 0x00C1;
const SEL_REQUEST_LINE_EVENT: u32 = 0x00D0;
const SEL_CANCEL_LINE_EVENT: u32 = 0x00D1;
const SEL_REQUEST_CHAR_EVENT: u32 = 0x00D2;
const SEL_CANCEL_CHAR_EVENT: u32 = 0x00D3;
const SEL_PUT_CHAR_UNI: u32 = 0x0128;
const SEL_PUT_STRING_UNI: u32 = 0x0129;
const SEL_PUT_BUFFER_UNI: u32 = 0x012A;

// Event types delivered through select.
const EVTYPE_NONE: u32 = 0;
const EVTYPE_CHAR_INPUT: u32 = 2;
const EVTYPE_LINE_INPUT: u32 = 3;

// Fyrecall numbers.
const FYRE_READ_LINE: u32 = 1;
const FYRE_SET_STYLE: u32 = 2;
const FYRE_TO_LOWER: u32 = 3;
const FYRE_TO_UPPER: u32 = 4;
const FYRE_CHANNEL: u32 = 5;
const FYRE_READ_KEY: u32 = 6;
const FYRE_SET_VENEER: u32 = 7;
const FYRE_TRANSITION: u32 = 8;

/// The only window this shim models.
const MAIN_WINDOW: u32 = 1;
/// Its stream.
const MAIN_STREAM: u32 = 1;

/// Writing through a `-1` pointer pushes onto the stack instead.
const PUSH_PTR: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy)]
struct LineRequest {
    win: u32,
    buf: u32,
    max_len: u32,
}

/// Window/stream/input-request bookkeeping for the shim.
pub struct GlkState {
    window_open: bool,
    current_stream: u32,
    line_request: Option<LineRequest>,
    char_request: Option<u32>,
}

impl Default for GlkState {
    fn default() -> Self {
        Self::new()
    }
}

impl GlkState {
    pub fn new() -> GlkState {
        GlkState {
            window_open: false,
            current_stream: 0,
            line_request: None,
            char_request: None,
        }
    }
}

impl Interpreter {
    /// The glk opcode: pop `argc` arguments, dispatch, store the result.
    pub(crate) fn op_glk(&mut self, selector: u32, argc: u32, dest: DestKind) -> Result<()> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop_value()?);
        }
        let result = self.glk_dispatch(selector, &args)?;
        self.perform_store(dest, result)
    }

    fn glk_dispatch(&mut self, selector: u32, args: &[u32]) -> Result<u32> {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        match selector {
            SEL_EXIT => {
                self.stop();
                Ok(0)
            }
            SEL_GESTALT => {
                // Only the version selector has an answer here.
                Ok(if arg(0) == 0 { 0x0000_0705 } else { 0 })
            }
            SEL_WINDOW_OPEN => {
                if self.glk.window_open {
                    return Ok(0);
                }
                self.glk.window_open = true;
                self.glk.current_stream = MAIN_STREAM;
                Ok(MAIN_WINDOW)
            }
            SEL_WINDOW_CLOSE => {
                self.glk.window_open = false;
                self.glk.current_stream = 0;
                self.write_glk_stream_result(arg(1))?;
                Ok(0)
            }
            SEL_WINDOW_ITERATE => {
                if arg(0) == 0 && self.glk.window_open {
                    self.write_glk_u32(arg(1), 0)?;
                    Ok(MAIN_WINDOW)
                } else {
                    Ok(0)
                }
            }
            SEL_WINDOW_GET_SIZE => {
                self.write_glk_u32(arg(1), 0)?;
                self.write_glk_u32(arg(2), 0)?;
                Ok(0)
            }
            SEL_WINDOW_CLEAR | SEL_WINDOW_MOVE_CURSOR => Ok(0),
            SEL_SET_WINDOW => {
                self.glk.current_stream = if arg(0) == 0 { 0 } else { MAIN_STREAM };
                Ok(0)
            }
            SEL_STREAM_ITERATE => {
                if arg(0) == 0 && self.glk.window_open {
                    self.write_glk_u32(arg(1), 0)?;
                    Ok(MAIN_STREAM)
                } else {
                    Ok(0)
                }
            }
            SEL_STREAM_CLOSE => {
                self.write_glk_stream_result(arg(1))?;
                Ok(0)
            }
            SEL_STREAM_SET_CURRENT => {
                self.glk.current_stream = arg(0);
                Ok(0)
            }
            SEL_STREAM_GET_CURRENT => Ok(self.glk.current_stream),
            SEL_PUT_CHAR => {
                self.glk_put_char(arg(0) & 0xFF);
                Ok(0)
            }
            SEL_PUT_CHAR_STREAM => {
                self.glk_put_char(arg(1) & 0xFF);
                Ok(0)
            }
            SEL_PUT_CHAR_UNI => {
                self.glk_put_char(arg(0));
                Ok(0)
            }
            SEL_PUT_STRING => self.glk_put_string(arg(0)).map(|_| 0),
            SEL_PUT_STRING_STREAM => self.glk_put_string(arg(1)).map(|_| 0),
            SEL_PUT_STRING_UNI => self.glk_put_string_uni(arg(0)).map(|_| 0),
            SEL_PUT_BUFFER => self.glk_put_buffer(arg(0), arg(1)).map(|_| 0),
            SEL_PUT_BUFFER_STREAM => self.glk_put_buffer(arg(1), arg(2)).map(|_| 0),
            SEL_PUT_BUFFER_UNI => self.glk_put_buffer_uni(arg(0), arg(1)).map(|_| 0),
            SEL_SET_STYLE | SEL_SET_STYLE_STREAM | SEL_STYLEHINT_SET | SEL_STYLEHINT_CLEAR => {
                Ok(0)
            }
            SEL_CHAR_TO_LOWER => Ok(latin1_to_lower(arg(0))),
            SEL_CHAR_TO_UPPER => Ok(latin1_to_upper(arg(0))),
            SEL_REQUEST_LINE_EVENT => {
                self.glk.line_request = Some(LineRequest {
                    win: arg(0),
                    buf: arg(1),
                    max_len: arg(2),
                });
                Ok(0)
            }
            SEL_REQUEST_CHAR_EVENT => {
                self.glk.char_request = Some(arg(0));
                Ok(0)
            }
            SEL_CANCEL_LINE_EVENT => {
                self.glk.line_request = None;
                self.write_glk_event(arg(1), [EVTYPE_NONE, 0, 0, 0])?;
                Ok(0)
            }
            SEL_CANCEL_CHAR_EVENT => {
                self.glk.char_request = None;
                Ok(0)
            }
            SEL_SELECT => {
                let event = self.glk_wait_for_event()?;
                self.write_glk_event(arg(0), event)?;
                Ok(0)
            }
            SEL_SELECT_POLL => {
                self.write_glk_event(arg(0), [EVTYPE_NONE, 0, 0, 0])?;
                Ok(0)
            }
            other => {
                debug!("glk selector {other:#06x} not implemented, returning 0");
                Ok(0)
            }
        }
    }

    /// Block on whichever input request is pending.
    fn glk_wait_for_event(&mut self) -> Result<[u32; 4]> {
        if let Some(req) = self.glk.line_request.take() {
            let line = self.request_line();
            let mut n = 0u32;
            for ch in line.chars() {
                if n >= req.max_len {
                    break;
                }
                let byte = if (ch as u32) < 0x100 { ch as u32 as u8 } else { b'?' };
                self.image.write_u8(req.buf + n, byte)?;
                n += 1;
            }
            return Ok([EVTYPE_LINE_INPUT, req.win, n, 0]);
        }
        if let Some(win) = self.glk.char_request.take() {
            let key = self.request_key();
            return Ok([EVTYPE_CHAR_INPUT, win, key, 0]);
        }
        // Nothing was requested; deliver an empty event.
        self.flush_to_host();
        Ok([EVTYPE_NONE, 0, 0, 0])
    }

    fn glk_put_char(&mut self, ch: u32) {
        let c = char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER);
        self.out.write_char_to(ChannelId::MAIN, c);
    }

    /// An unencoded string: bytes to the zero terminator, skipping the
    /// E0 tag if the address points at one.
    fn glk_put_string(&mut self, mut addr: u32) -> Result<()> {
        if self.image.read_u8(addr)? == 0xE0 {
            addr += 1;
        }
        loop {
            let b = self.image.read_u8(addr)?;
            if b == 0 {
                return Ok(());
            }
            self.glk_put_char(b as u32);
            addr += 1;
        }
    }

    fn glk_put_string_uni(&mut self, mut addr: u32) -> Result<()> {
        if self.image.read_u8(addr)? == 0xE2 {
            addr += 4;
        }
        loop {
            let ch = self.image.read_u32(addr)?;
            if ch == 0 {
                return Ok(());
            }
            self.glk_put_char(ch);
            addr += 4;
        }
    }

    fn glk_put_buffer(&mut self, addr: u32, len: u32) -> Result<()> {
        for i in 0..len {
            let b = self.image.read_u8(addr + i)?;
            self.glk_put_char(b as u32);
        }
        Ok(())
    }

    fn glk_put_buffer_uni(&mut self, addr: u32, len: u32) -> Result<()> {
        for i in 0..len {
            let ch = self.image.read_u32(addr + 4 * i)?;
            self.glk_put_char(ch);
        }
        Ok(())
    }

    /// Glk reference arguments: 0 discards, -1 pushes, anything else is
    /// a memory address.
    fn write_glk_u32(&mut self, ptr: u32, value: u32) -> Result<()> {
        match ptr {
            0 => Ok(()),
            PUSH_PTR => self.push_value(value),
            addr => self.image.write_u32(addr, value),
        }
    }

    /// A stream-result struct: characters read and written, both zero.
    fn write_glk_stream_result(&mut self, ptr: u32) -> Result<()> {
        match ptr {
            0 => Ok(()),
            PUSH_PTR => {
                self.push_value(0)?;
                self.push_value(0)
            }
            addr => {
                self.image.write_u32(addr, 0)?;
                self.image.write_u32(addr + 4, 0)
            }
        }
    }

    fn write_glk_event(&mut self, ptr: u32, event: [u32; 4]) -> Result<()> {
        match ptr {
            0 => Ok(()),
            PUSH_PTR => {
                // Pushed in reverse so the first field pops first.
                for value in event.into_iter().rev() {
                    self.push_value(value)?;
                }
                Ok(())
            }
            addr => {
                for (i, value) in event.into_iter().enumerate() {
                    self.image.write_u32(addr + 4 * i as u32, value)?;
                }
                Ok(())
            }
        }
    }

    /// The fyrecall opcode.
    pub(crate) fn op_fyrecall(&mut self, l: &[u32], dest: DestKind) -> Result<()> {
        let result = match l[0] {
            FYRE_READ_LINE => {
                let line = self.request_line();
                let buf = l[1];
                let max_len = l[2];
                let mut n = 0u32;
                for ch in line.chars() {
                    if n >= max_len {
                        break;
                    }
                    let byte = if (ch as u32) < 0x100 { ch as u32 as u8 } else { b'?' };
                    self.image.write_u8(buf + n, byte)?;
                    n += 1;
                }
                n
            }
            FYRE_SET_STYLE => 0,
            FYRE_TO_LOWER => latin1_to_lower(l[1]),
            FYRE_TO_UPPER => latin1_to_upper(l[1]),
            FYRE_CHANNEL => {
                self.out.select(ChannelId(l[1]));
                0
            }
            FYRE_READ_KEY => self.request_key(),
            FYRE_SET_VENEER => {
                self.veneer.set_fyre_slot(l[1], l[2])?;
                1
            }
            FYRE_TRANSITION => {
                self.notify_transition();
                0
            }
            other => {
                return Err(TerpError::fault(format!(
                    "unrecognized fyrecall number {other}"
                )))
            }
        };
        self.perform_store(dest, result)
    }
}

/// Latin-1 case mapping, per the library's character tables.
fn latin1_to_lower(ch: u32) -> u32 {
    match ch {
        0x41..=0x5A => ch + 0x20,
        0xC0..=0xDE if ch != 0xD7 => ch + 0x20,
        _ => ch,
    }
}

fn latin1_to_upper(ch: u32) -> u32 {
    match ch {
        0x61..=0x7A => ch - 0x20,
        0xE0..=0xFE if ch != 0xF7 => ch - 0x20,
        _ => ch,
    }
}
