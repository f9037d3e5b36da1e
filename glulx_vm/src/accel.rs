//! Native replacements for common library routines.
//!
//! A story registers a function address with `accelfunc`; from then on a
//! call to that address runs the native routine instead of the bytecode.
//! The routines walk Inform's object and property tables, whose layout is
//! described by the nine `accelparam` values.
//!
//! Functions 2-7 assume the classic layout with seven attribute bytes;
//! 8-13 are the same routines reading `num_attr_bytes` from the parameters.

use glulx_core::{MemorySpace, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::io::IoCapability;
use crate::search::{self, ArraySearch};

/// Highest function index provided.
pub const MAX_FUNC: u32 = 13;

/// Number of `accelparam` slots.
pub const PARAM_COUNT: usize = 9;

mod param {
    pub const CLASSES_TABLE: usize = 0;
    pub const INDIV_PROP_START: usize = 1;
    pub const CLASS_METACLASS: usize = 2;
    pub const OBJECT_METACLASS: usize = 3;
    pub const ROUTINE_METACLASS: usize = 4;
    pub const STRING_METACLASS: usize = 5;
    pub const SELF: usize = 6;
    pub const NUM_ATTR_BYTES: usize = 7;
    pub const CPV_START: usize = 8;
}

/// Registered functions and table parameters.
#[derive(Debug, Clone, Default)]
pub struct Accelerator {
    funcs: FxHashMap<u32, u32>,
    params: [u32; PARAM_COUNT],
}

impl Accelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether function number `index` exists.
    #[inline]
    pub fn supports(index: u32) -> bool {
        (1..=MAX_FUNC).contains(&index)
    }

    /// Function registered at `addr`, if any.
    #[inline]
    pub fn lookup(&self, addr: u32) -> Option<u32> {
        if self.funcs.is_empty() {
            return None;
        }
        self.funcs.get(&addr).copied()
    }

    /// `accelfunc`: an unknown index (including 0) unregisters `addr`.
    pub fn set_func(&mut self, index: u32, addr: u32) {
        if Self::supports(index) {
            debug!(index, addr = format_args!("{:#x}", addr), "accelerated function registered");
            self.funcs.insert(addr, index);
        } else {
            self.funcs.remove(&addr);
        }
    }

    /// `accelparam`: out-of-range slots are ignored.
    pub fn set_param(&mut self, index: u32, value: u32) {
        if let Some(slot) = self.params.get_mut(index as usize) {
            *slot = value;
        }
    }

    /// Run function `index` on `args`.
    pub fn call(
        &self,
        index: u32,
        args: &[u32],
        mem: &MemorySpace,
        io: &mut dyn IoCapability,
    ) -> Result<u32> {
        let arg = |n: usize| args.get(n).copied().unwrap_or(0);
        let mut run = Routines {
            params: &self.params,
            mem,
            io,
            modern: index >= 8,
        };
        match index {
            1 => run.z_region(arg(0)),
            2 | 8 => run.cp_tab(arg(0), arg(1)),
            3 | 9 => run.ra_pr(arg(0), arg(1)),
            4 | 10 => run.rl_pr(arg(0), arg(1)),
            5 | 11 => run.oc_cl(arg(0), arg(1)),
            6 | 12 => run.rv_pr(arg(0), arg(1)),
            7 | 13 => run.op_pr(arg(0), arg(1)),
            _ => Ok(0),
        }
    }
}

// =============================================================================
// Routines
// =============================================================================

struct Routines<'a> {
    params: &'a [u32; PARAM_COUNT],
    mem: &'a MemorySpace,
    io: &'a mut dyn IoCapability,
    modern: bool,
}

impl Routines<'_> {
    #[inline]
    fn p(&self, slot: usize) -> u32 {
        self.params[slot]
    }

    fn attr_bytes(&self) -> u32 {
        if self.modern {
            self.p(param::NUM_ATTR_BYTES)
        } else {
            7
        }
    }

    fn error(&mut self, what: &str) {
        self.io.put_str(&format!("[** Programming error: {} **]", what));
    }

    /// Z__Region: 1 object, 2 function, 3 string, 0 anything else.
    fn z_region(&self, addr: u32) -> Result<u32> {
        if addr < 36 || addr >= self.mem.end_mem() {
            return Ok(0);
        }
        Ok(match self.mem.read8(addr)? {
            0xE0..=0xFF => 3,
            0xC0..=0xDF => 2,
            0x70..=0x7F if addr >= self.mem.ram_start() => 1,
            _ => 0,
        })
    }

    /// Whether `obj` is itself a class.
    fn obj_in_class(&self, obj: u32) -> Result<bool> {
        let offset = 13 + self.attr_bytes();
        Ok(self.mem.read32(obj.wrapping_add(offset))? == self.p(param::CLASS_METACLASS))
    }

    /// CP__Tab: address of the property table entry for `id`, or 0.
    fn cp_tab(&mut self, obj: u32, id: u32) -> Result<u32> {
        if self.z_region(obj)? != 1 {
            self.error("tried to find the \".\" of (something)");
            return Ok(0);
        }
        let offset = if self.modern {
            4 * (3 + self.attr_bytes() / 4)
        } else {
            16
        };
        let table = self.mem.read32(obj.wrapping_add(offset))?;
        if table == 0 {
            return Ok(0);
        }
        let count = self.mem.read32(table)?;
        search::binary(
            self.mem,
            &ArraySearch {
                key: id,
                key_size: 2,
                start: table + 4,
                struct_size: 10,
                num_structs: count,
                key_offset: 0,
                options: 0,
            },
        )
    }

    /// Property entry visible to the current `self`, following class ids.
    fn get_prop(&mut self, mut obj: u32, mut id: u32) -> Result<u32> {
        let mut class = 0;
        if id & 0xFFFF_0000 != 0 {
            let classes = self.p(param::CLASSES_TABLE);
            class = self.mem.read32(classes.wrapping_add((id & 0xFFFF) * 4))?;
            if self.oc_cl(obj, class)? == 0 {
                return Ok(0);
            }
            id >>= 16;
            obj = class;
        }

        let prop = self.cp_tab(obj, id)?;
        if prop == 0 {
            return Ok(0);
        }

        let indiv = self.p(param::INDIV_PROP_START);
        if self.obj_in_class(obj)? && class == 0 && (id < indiv || id >= indiv + 8) {
            return Ok(0);
        }
        if self.mem.read32(self.p(param::SELF))? != obj && self.mem.read8(prop + 9)? & 1 != 0 {
            return Ok(0);
        }
        Ok(prop)
    }

    /// RA__Pr: address of the property value.
    fn ra_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        match self.get_prop(obj, id)? {
            0 => Ok(0),
            prop => self.mem.read32(prop + 4),
        }
    }

    /// RL__Pr: property length in bytes.
    fn rl_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        match self.get_prop(obj, id)? {
            0 => Ok(0),
            prop => Ok(4 * u32::from(self.mem.read16(prop + 2)?)),
        }
    }

    /// OC__Cl: `obj ofclass cla`.
    fn oc_cl(&mut self, obj: u32, cla: u32) -> Result<u32> {
        let class_mc = self.p(param::CLASS_METACLASS);
        let object_mc = self.p(param::OBJECT_METACLASS);
        let routine_mc = self.p(param::ROUTINE_METACLASS);
        let string_mc = self.p(param::STRING_METACLASS);

        match self.z_region(obj)? {
            3 => return Ok(u32::from(cla == string_mc)),
            2 => return Ok(u32::from(cla == routine_mc)),
            1 => {}
            _ => return Ok(0),
        }

        let metaclass = [class_mc, string_mc, routine_mc, object_mc].contains(&obj);
        if cla == class_mc {
            return Ok(u32::from(self.obj_in_class(obj)? || metaclass));
        }
        if cla == object_mc {
            return Ok(u32::from(!(self.obj_in_class(obj)? || metaclass)));
        }
        if cla == string_mc || cla == routine_mc {
            return Ok(0);
        }

        if !self.obj_in_class(cla)? {
            self.error("tried to apply 'ofclass' with non-class");
            return Ok(0);
        }

        let prop = self.get_prop(obj, 2)?;
        if prop == 0 {
            return Ok(0);
        }
        let list = self.mem.read32(prop + 4)?;
        if list == 0 {
            return Ok(0);
        }
        let len = u32::from(self.mem.read16(prop + 2)?);
        for index in 0..len {
            if self.mem.read32(list + 4 * index)? == cla {
                return Ok(1);
            }
        }
        Ok(0)
    }

    /// RV__Pr: property value, falling back to the common default.
    fn rv_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let addr = self.ra_pr(obj, id)?;
        if addr != 0 {
            return self.mem.read32(addr);
        }
        if id > 0 && id < self.p(param::INDIV_PROP_START) {
            return self.mem.read32(self.p(param::CPV_START).wrapping_add(4 * id));
        }
        self.error("tried to read (something)");
        Ok(0)
    }

    /// OP__Pr: `obj provides id`.
    fn op_pr(&mut self, obj: u32, id: u32) -> Result<u32> {
        let indiv = self.p(param::INDIV_PROP_START);
        match self.z_region(obj)? {
            // print, print_to_array
            3 => return Ok(u32::from(id == indiv + 6 || id == indiv + 7)),
            // call
            2 => return Ok(u32::from(id == indiv + 5)),
            1 => {}
            _ => return Ok(0),
        }
        if id >= indiv && id < indiv + 8 && self.obj_in_class(obj)? {
            return Ok(1);
        }
        Ok(u32::from(self.ra_pr(obj, id)? != 0))
    }
}

// =============================================================================
// Tests
// =============================================================================
