//! Native replacements for the library's hot routines.
//!
//! A program registers routine addresses against well-known slots
//! (through the accelfunc/accelparam opcodes, or the legacy fyrecall
//! table); when a call targets a registered address the engine runs the
//! native body instead of building a frame. The implementations mirror
//! the library routines they stand in for.

use crate::error::{Result, TerpError};
use crate::interpreter::Interpreter;
use crate::output::ChannelId;
use crate::interpreter::IoSystem;
use log::{debug, warn};
use std::collections::HashMap;

/// The functions this engine can accelerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VeneerFunc {
    ZRegion,
    CpTab,
    RaPr,
    RlPr,
    OcCl,
    RvPr,
    OpPr,
    RtChLdw,
    RtChStw,
    RtChLdb,
    RtChStb,
    MetaClass,
    UnsignedCompare,
}

/// Registered slot state: function addresses plus the layout parameters
/// the natives need.
pub struct Veneer {
    funcs: HashMap<u32, VeneerFunc>,
    pub classes_table: u32,
    pub indiv_prop_start: u32,
    pub class_metaclass: u32,
    pub object_metaclass: u32,
    pub routine_metaclass: u32,
    pub string_metaclass: u32,
    /// Address of the library's `self` global; 0 falls back to the
    /// conventional slot at ram_start + 16.
    pub self_addr: u32,
    pub num_attr_bytes: u32,
    pub cpv_start: u32,
    /// Legacy-registered runtime-error routine, called on failed
    /// bounds checks. 0 when unset.
    pub rt_err: u32,
}

/// Error codes passed to the runtime-error routine.
const RTERR_READ_WORD: u32 = 1;
const RTERR_WRITE_WORD: u32 = 2;
const RTERR_READ_BYTE: u32 = 3;
const RTERR_WRITE_BYTE: u32 = 4;

impl Default for Veneer {
    fn default() -> Self {
        Self::new()
    }
}

impl Veneer {
    pub fn new() -> Veneer {
        Veneer {
            funcs: HashMap::new(),
            classes_table: 0,
            indiv_prop_start: 0,
            class_metaclass: 0,
            object_metaclass: 0,
            routine_metaclass: 0,
            string_metaclass: 0,
            self_addr: 0,
            num_attr_bytes: 7,
            cpv_start: 0,
            rt_err: 0,
        }
    }

    pub fn func_for_address(&self, addr: u32) -> Option<VeneerFunc> {
        if addr == 0 || self.funcs.is_empty() {
            return None;
        }
        self.funcs.get(&addr).copied()
    }

    fn register(&mut self, func: VeneerFunc, addr: u32) {
        self.funcs.retain(|_, f| *f != func);
        if addr != 0 {
            debug!("veneer slot {func:?} -> {addr:#010x}");
            self.funcs.insert(addr, func);
        }
    }

    /// The accelfunc opcode's function numbering.
    pub fn set_accel_func(&mut self, number: u32, addr: u32) -> Result<()> {
        let func = match number {
            1 => VeneerFunc::ZRegion,
            2 => VeneerFunc::CpTab,
            3 => VeneerFunc::RaPr,
            4 => VeneerFunc::RlPr,
            5 => VeneerFunc::OcCl,
            6 => VeneerFunc::RvPr,
            7 => VeneerFunc::OpPr,
            _ => {
                return Err(TerpError::fault(format!(
                    "unrecognized acceleration function {number}"
                )))
            }
        };
        self.register(func, addr);
        Ok(())
    }

    pub fn accel_func_known(number: u32) -> bool {
        (1..=7).contains(&number)
    }

    /// The accelparam opcode's parameter numbering.
    pub fn set_accel_param(&mut self, number: u32, value: u32) -> Result<()> {
        match number {
            0 => self.classes_table = value,
            1 => self.indiv_prop_start = value,
            2 => self.class_metaclass = value,
            3 => self.object_metaclass = value,
            4 => self.routine_metaclass = value,
            5 => self.string_metaclass = value,
            6 => self.self_addr = value,
            7 => self.num_attr_bytes = value,
            8 => self.cpv_start = value,
            _ => {
                return Err(TerpError::fault(format!(
                    "unrecognized acceleration parameter {number}"
                )))
            }
        }
        Ok(())
    }

    /// The legacy registration table used by fyrecall SetVeneer, which
    /// predates the acceleration opcodes and folds functions and
    /// parameters into one numbering.
    pub fn set_fyre_slot(&mut self, slot: u32, value: u32) -> Result<()> {
        match slot {
            1 => self.register(VeneerFunc::ZRegion, value),
            2 => self.register(VeneerFunc::CpTab, value),
            3 => self.register(VeneerFunc::OcCl, value),
            4 => self.register(VeneerFunc::RaPr, value),
            5 => self.register(VeneerFunc::RlPr, value),
            6 => self.register(VeneerFunc::RvPr, value),
            7 => self.register(VeneerFunc::OpPr, value),
            8 => self.register(VeneerFunc::RtChLdw, value),
            9 => self.register(VeneerFunc::UnsignedCompare, value),
            10 => self.register(VeneerFunc::RtChLdb, value),
            11 => self.register(VeneerFunc::RtChStw, value),
            12 => self.register(VeneerFunc::RtChStb, value),
            13 => self.register(VeneerFunc::MetaClass, value),
            1001 => self.string_metaclass = value,
            1002 => self.routine_metaclass = value,
            1003 => self.class_metaclass = value,
            1004 => self.object_metaclass = value,
            1005 => self.rt_err = value,
            1006 => self.num_attr_bytes = value,
            1007 => self.classes_table = value,
            1008 => self.indiv_prop_start = value,
            1009 => self.cpv_start = value,
            1010 => self.self_addr = value,
            _ => {
                return Err(TerpError::fault(format!(
                    "unrecognized veneer slot {slot}"
                )))
            }
        }
        Ok(())
    }
}

impl Interpreter {
    /// Run a native veneer body. Missing arguments read as zero, as
    /// they would for a bytecode routine.
    pub(crate) fn veneer_call(&mut self, func: VeneerFunc, args: &[u32]) -> Result<u32> {
        let a0 = args.first().copied().unwrap_or(0);
        let a1 = args.get(1).copied().unwrap_or(0);
        match func {
            VeneerFunc::ZRegion => self.vn_z_region(a0),
            VeneerFunc::CpTab => self.vn_cp_tab(a0, a1),
            VeneerFunc::RaPr => self.vn_ra_pr(a0, a1),
            VeneerFunc::RlPr => self.vn_rl_pr(a0, a1),
            VeneerFunc::OcCl => self.vn_oc_cl(a0, a1),
            VeneerFunc::RvPr => self.vn_rv_pr(a0, a1),
            VeneerFunc::OpPr => self.vn_op_pr(a0, a1),
            VeneerFunc::RtChLdw => self.vn_rt_chldw(a0, a1),
            VeneerFunc::RtChStw => self.vn_rt_chstw(a0, a1, args.get(2).copied().unwrap_or(0)),
            VeneerFunc::RtChLdb => self.vn_rt_chldb(a0, a1),
            VeneerFunc::RtChStb => self.vn_rt_chstb(a0, a1, args.get(2).copied().unwrap_or(0)),
            VeneerFunc::MetaClass => self.vn_meta_class(a0),
            VeneerFunc::UnsignedCompare => Ok(match a0.cmp(&a1) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Less => 0xFFFF_FFFF,
                std::cmp::Ordering::Equal => 0,
            }),
        }
    }

    /// Classify an address: 1 object, 2 routine, 3 string, 0 anything
    /// else.
    pub(crate) fn vn_z_region(&mut self, addr: u32) -> Result<u32> {
        if addr < 36 || addr >= self.image.end_mem() {
            return Ok(0);
        }
        let tag = self.image.read_u8(addr)?;
        Ok(if tag >= 0xE0 {
            3
        } else if tag >= 0xC0 {
            2
        } else if (0x70..=0x7F).contains(&tag) && addr >= self.image.ram_start() {
            1
        } else {
            0
        })
    }

    /// Binary-search an object's common property table; returns the
    /// address of the 10-byte property entry, or 0.
    pub(crate) fn vn_cp_tab(&mut self, obj: u32, id: u32) -> Result<u32> {
        if self.vn_z_region(obj)? != 1 {
            self.vn_runtime_error(
                RTERR_READ_WORD,
                obj,
                id,
                "[** Programming error: tried to read the property table of a non-object **]",
            )?;
            return Ok(0);
        }
        let otab = self.image.read_u32(obj + 1 + self.veneer.num_attr_bytes + 8)?;
        if otab == 0 {
            return Ok(0);
        }
        let count = self.image.read_u32(otab)?;
        let tab = otab + 4;
        let mut lo = 0u32;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = tab + mid * 10;
            let pid = self.image.read_u16(entry)? as u32;
            match pid.cmp(&id) {
                std::cmp::Ordering::Equal => return Ok(entry),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(0)
    }

    /// Property address with class inheritance and privacy rules.
    pub(crate) fn vn_ra_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let entry = self.vn_prop_entry(obj, id)?;
        if entry == 0 {
            return Ok(0);
        }
        self.image.read_u32(entry + 4)
    }

    /// Property length in bytes.
    pub(crate) fn vn_rl_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let entry = self.vn_prop_entry(obj, id)?;
        if entry == 0 {
            return Ok(0);
        }
        Ok(4 * self.image.read_u16(entry + 2)? as u32)
    }

    /// The shared lookup behind RA__Pr and RL__Pr.
    fn vn_prop_entry(&mut self, mut obj: u32, mut id: u32) -> Result<u32> {
        let mut cla = 0;
        if id & 0xFFFF_0000 != 0 {
            // A compound id names a property of a specific class.
            cla = self
                .image
                .read_u32(self.veneer.classes_table + 4 * (id & 0xFFFF))?;
            if self.vn_oc_cl(obj, cla)? == 0 {
                return Ok(0);
            }
            id >>= 16;
            obj = cla;
        }
        let entry = self.vn_cp_tab(obj, id)?;
        if entry == 0 {
            return Ok(0);
        }
        if cla == 0 && self.vn_parent(obj)? == self.veneer.class_metaclass {
            // Reading straight off a class object only reaches the
            // individual-property window.
            let indiv = self.veneer.indiv_prop_start;
            if id < indiv || id >= indiv + 8 {
                return Ok(0);
            }
        }
        if self.vn_self() != obj {
            let flags = self.image.read_u16(entry + 8)?;
            if flags & 1 != 0 {
                // Private to self.
                return Ok(0);
            }
        }
        Ok(entry)
    }

    /// Property read with fallback to the compiler's defaults table.
    pub(crate) fn vn_rv_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let addr = self.vn_ra_pr(obj, id)?;
        if addr != 0 {
            return self.image.read_u32(addr);
        }
        if id > 0 && id < self.veneer.indiv_prop_start {
            return self.image.read_u32(self.veneer.cpv_start + 4 * id);
        }
        self.vn_runtime_error(
            RTERR_READ_WORD,
            obj,
            id,
            "[** Programming error: tried to read a property of an incompatible object **]",
        )?;
        Ok(0)
    }

    /// The "of class" test, including the metaclass chain.
    pub(crate) fn vn_oc_cl(&mut self, obj: u32, cla: u32) -> Result<u32> {
        let class_mc = self.veneer.class_metaclass;
        let object_mc = self.veneer.object_metaclass;
        let routine_mc = self.veneer.routine_metaclass;
        let string_mc = self.veneer.string_metaclass;

        match self.vn_z_region(obj)? {
            2 => return Ok(u32::from(cla == routine_mc)),
            3 => return Ok(u32::from(cla == string_mc)),
            1 => {}
            _ => return Ok(0),
        }

        let is_meta = |o: u32| o == class_mc || o == object_mc || o == routine_mc || o == string_mc;
        if cla == class_mc {
            let classish = self.vn_parent(obj)? == class_mc || is_meta(obj);
            return Ok(u32::from(classish));
        }
        if cla == object_mc {
            let classish = self.vn_parent(obj)? == class_mc || is_meta(obj);
            return Ok(u32::from(!classish));
        }
        if cla == routine_mc || cla == string_mc {
            return Ok(0);
        }
        if self.vn_parent(cla)? != class_mc {
            self.vn_runtime_error(
                RTERR_READ_WORD,
                obj,
                cla,
                "[** Programming error: the second argument of ofclass is not a class **]",
            )?;
            return Ok(0);
        }

        // Property 2 is the object's inheritance list.
        let inlist = self.vn_ra_pr(obj, 2)?;
        if inlist == 0 {
            return Ok(0);
        }
        let entries = self.vn_rl_pr(obj, 2)? / 4;
        for i in 0..entries {
            if self.image.read_u32(inlist + 4 * i)? == cla {
                return Ok(1);
            }
        }
        Ok(0)
    }

    /// The "provides" predicate, including the print/call
    /// metaproperties on strings and routines.
    pub(crate) fn vn_op_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let indiv = self.veneer.indiv_prop_start;
        match self.vn_z_region(obj)? {
            3 => {
                // Strings provide print and print_to_array.
                return Ok(u32::from(id == indiv + 6 || id == indiv + 7));
            }
            2 => {
                // Routines provide call.
                return Ok(u32::from(id == indiv + 5));
            }
            1 => {}
            _ => return Ok(0),
        }
        if (indiv..indiv + 8).contains(&id) && self.vn_parent(obj)? == self.veneer.class_metaclass {
            return Ok(1);
        }
        Ok(u32::from(self.vn_ra_pr(obj, id)? != 0))
    }

    /// The metaclass constant for an address.
    pub(crate) fn vn_meta_class(&mut self, obj: u32) -> Result<u32> {
        match self.vn_z_region(obj)? {
            2 => Ok(self.veneer.routine_metaclass),
            3 => Ok(self.veneer.string_metaclass),
            1 => {
                let class_mc = self.veneer.class_metaclass;
                let is_meta = obj == class_mc
                    || obj == self.veneer.object_metaclass
                    || obj == self.veneer.routine_metaclass
                    || obj == self.veneer.string_metaclass;
                if self.vn_parent(obj)? == class_mc || is_meta {
                    Ok(class_mc)
                } else {
                    Ok(self.veneer.object_metaclass)
                }
            }
            _ => Ok(0),
        }
    }

    // Bounds-checked array access. The library routine reports the
    // failure and carries on with a zero, so these do too.

    pub(crate) fn vn_rt_chldw(&mut self, array: u32, offset: u32) -> Result<u32> {
        let addr = array.wrapping_add(offset.wrapping_mul(4));
        match self.image.read_u32(addr) {
            Ok(value) => Ok(value),
            Err(_) => {
                self.vn_runtime_error(
                    RTERR_READ_WORD,
                    array,
                    offset,
                    "[** Programming error: tried to read outside memory **]",
                )?;
                Ok(0)
            }
        }
    }

    pub(crate) fn vn_rt_chldb(&mut self, array: u32, offset: u32) -> Result<u32> {
        let addr = array.wrapping_add(offset);
        match self.image.read_u8(addr) {
            Ok(value) => Ok(value as u32),
            Err(_) => {
                self.vn_runtime_error(
                    RTERR_READ_BYTE,
                    array,
                    offset,
                    "[** Programming error: tried to read outside memory **]",
                )?;
                Ok(0)
            }
        }
    }

    pub(crate) fn vn_rt_chstw(&mut self, array: u32, offset: u32, value: u32) -> Result<u32> {
        let addr = array.wrapping_add(offset.wrapping_mul(4));
        if self.image.write_u32(addr, value).is_err() {
            self.vn_runtime_error(
                RTERR_WRITE_WORD,
                array,
                offset,
                "[** Programming error: tried to write outside memory **]",
            )?;
        }
        Ok(0)
    }

    pub(crate) fn vn_rt_chstb(&mut self, array: u32, offset: u32, value: u32) -> Result<u32> {
        let addr = array.wrapping_add(offset);
        if self.image.write_u8(addr, value as u8).is_err() {
            self.vn_runtime_error(
                RTERR_WRITE_BYTE,
                array,
                offset,
                "[** Programming error: tried to write outside memory **]",
            )?;
        }
        Ok(0)
    }

    fn vn_parent(&self, obj: u32) -> Result<u32> {
        self.image
            .read_u32(obj + 1 + self.veneer.num_attr_bytes + 12)
    }

    /// The library's `self` global.
    fn vn_self(&self) -> u32 {
        let addr = if self.veneer.self_addr != 0 {
            self.veneer.self_addr
        } else {
            self.image.ram_start() + 16
        };
        self.image.read_u32(addr).unwrap_or(0)
    }

    /// Report a library-level runtime error: through the registered
    /// error routine when there is one, otherwise as text.
    fn vn_runtime_error(&mut self, code: u32, a: u32, b: u32, msg: &str) -> Result<()> {
        let rt_err = self.veneer.rt_err;
        if rt_err != 0 {
            self.call_function_nested(rt_err, &[code, a, b])?;
            return Ok(());
        }
        match self.output_system {
            IoSystem::Channels => {
                let text = format!("\n{msg}\n");
                self.out.write_str(&text);
            }
            IoSystem::Glk => {
                let text = format!("\n{msg}\n");
                self.out.write_str_to(ChannelId::MAIN, &text);
            }
            _ => warn!("{msg}"),
        }
        Ok(())
    }
}
