//! Code cache for compiled bytecode units.
//!
//! The cache provides:
//! - O(1) lookup of compiled code by bytecode address through a chained,
//!   power-of-two hash table
//! - A fixed word budget shared by the table, the compiled ops and the
//!   cache nodes
//! - Run-counter driven compression when the budget runs out
//! - Pruning of units whose source bytes were overwritten
//!
//! Compilation only ever happens when the dispatcher transfers control by
//! address, so compaction never moves code the dispatcher is executing.

use glulx_core::{FatalError, MemorySpace, Result};
use tracing::{debug, trace};

use crate::arena::{Arena, Id};
use crate::compiler::{self, CompileAbort};
use crate::ops::Op;

// =============================================================================
// Configuration
// =============================================================================

/// Smallest accepted cache, in bytes.
pub const MIN_CACHE_SIZE: usize = 16 * 1024;

/// Hard cap on a single unit (ops plus patch nodes), in words.
pub const MAX_UNIT_WORDS: u32 = 32_000;

/// Words accounted per cache node.
pub(crate) const NODE_WORDS: u32 = 4;

/// Words accounted per unit header.
pub(crate) const UNIT_HEADER_WORDS: u32 = 4;

/// Fixed-point scale of a unit's run count per footprint word.
const USAGE_SCALE: u64 = 256;

/// Words always kept free so a trampoline can close any unit.
pub(crate) const RESERVE_WORDS: u32 = 4;

/// Cache construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total cache budget in bytes. Clamped to at least [`MIN_CACHE_SIZE`].
    pub size: usize,
    /// Run the peephole optimizer while compiling.
    pub peephole: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: 1024 * 1024,
            peephole: true,
        }
    }
}

// =============================================================================
// Nodes and units
// =============================================================================

/// Per-instruction compile-time record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PatchNode {
    pub pc: u32,
    /// Op offset of the instruction's first op within the unit.
    pub offset: u32,
    /// Op offset of the instruction's branch op, when it has a constant target.
    pub fixup: Option<u32>,
    /// Reachable from outside the unit (entry point or resume point).
    pub referenced: bool,
}

/// Run-time address-to-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashNode {
    pub pc: u32,
    pub ip: u32,
    pub unit: u32,
    pub next: Id<CacheNode>,
}

/// A node slot; patch slots turn into hash slots in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheNode {
    Patch(PatchNode),
    Hash(HashNode),
    Free,
}

/// Header of one compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitHeader {
    pub entry_pc: u32,
    /// Address just past the last compiled instruction.
    pub source_end: u32,
    pub code_start: u32,
    pub code_len: u32,
    /// Op words of the unit.
    pub words: u32,
    pub node_count: u32,
    pub run_counter: u32,
    pub live: bool,
}

impl UnitHeader {
    #[inline]
    fn footprint(&self) -> u32 {
        self.words + self.node_count * NODE_WORDS + UNIT_HEADER_WORDS
    }

    /// Runs per footprint word, scaled by [`USAGE_SCALE`].
    #[inline]
    fn usage(&self) -> u64 {
        self.run_counter as u64 * USAGE_SCALE / self.footprint() as u64
    }

    #[inline]
    fn overlaps(&self, addr: u32, end: u64) -> bool {
        (self.entry_pc as u64) < end && addr < self.source_end
    }
}

/// Entry point into compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRef {
    pub ip: usize,
}

// =============================================================================
// Code Cache
// =============================================================================

/// Address-keyed cache of compiled units.
#[derive(Debug)]
pub struct CodeCache {
    pub(crate) code: Vec<Op>,
    pub(crate) nodes: Arena<CacheNode>,
    pub(crate) units: Vec<UnitHeader>,
    buckets: Vec<Id<CacheNode>>,
    capacity: u32,
    unit_limit: u32,
    code_words: u32,
    peephole: bool,
    /// Source range covered by units compiled from writable memory.
    ram_code: Option<(u32, u32)>,
    stats: CodeCacheStats,
}

impl CodeCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = (config.size.max(MIN_CACHE_SIZE) / 4).min(u32::MAX as usize) as u32;
        let table = (capacity / 32).next_power_of_two().clamp(64, 1 << 16);
        CodeCache {
            code: Vec::with_capacity(capacity as usize / 4),
            nodes: Arena::with_capacity(table as usize),
            units: Vec::new(),
            buckets: vec![Id::INVALID; table as usize],
            capacity,
            unit_limit: MAX_UNIT_WORDS.min(capacity / 4),
            code_words: 0,
            peephole: config.peephole,
            ram_code: None,
            stats: CodeCacheStats::default(),
        }
    }

    #[inline]
    pub fn peephole_enabled(&self) -> bool {
        self.peephole
    }

    /// Total budget in words.
    #[inline]
    pub fn capacity_words(&self) -> u32 {
        self.capacity
    }

    /// Words currently accounted to the table, code, nodes and headers.
    #[inline]
    pub fn used_words(&self) -> u32 {
        self.buckets.len() as u32
            + self.code_words
            + self.nodes.len() as u32 * NODE_WORDS
            + self.units.len() as u32 * UNIT_HEADER_WORDS
    }

    #[inline]
    pub(crate) fn free_words(&self) -> u32 {
        self.capacity.saturating_sub(self.used_words())
    }

    #[inline]
    pub(crate) fn unit_limit(&self) -> u32 {
        self.unit_limit
    }

    /// Number of units that can still be entered.
    pub fn live_units(&self) -> usize {
        self.units.iter().filter(|unit| unit.live).count()
    }

    /// The op at `ip`.
    #[inline]
    pub fn op(&self, ip: usize) -> Op {
        self.code[ip]
    }

    #[inline]
    pub fn stats(&self) -> CodeCacheStats {
        self.stats.clone()
    }

    #[inline]
    fn bucket(&self, pc: u32) -> usize {
        (pc as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, pc: u32) -> Option<HashNode> {
        let mut id = self.buckets[self.bucket(pc)];
        while id.is_valid() {
            match self.nodes[id] {
                CacheNode::Hash(node) if node.pc == pc => return Some(node),
                CacheNode::Hash(node) => id = node.next,
                _ => break,
            }
        }
        None
    }

    /// Run counter of the unit whose entry is `pc`, if cached.
    pub fn run_counter(&self, pc: u32) -> Option<u32> {
        self.find(pc)
            .map(|node| self.units[node.unit as usize].run_counter)
    }

    /// True when `pc` resolves without compiling.
    pub fn contains(&self, pc: u32) -> bool {
        self.find(pc).is_some()
    }

    /// Resolve `pc` to compiled code, compiling a new unit on a miss.
    pub fn get_code(&mut self, mem: &MemorySpace, pc: u32) -> Result<CodeRef> {
        if let Some(node) = self.find(pc) {
            self.stats.hits += 1;
            let unit = &mut self.units[node.unit as usize];
            unit.run_counter = unit.run_counter.saturating_add(1);
            return Ok(CodeRef { ip: node.ip as usize });
        }

        self.stats.misses += 1;
        let ip = match compiler::compile_unit(self, mem, pc) {
            Ok(ip) => ip,
            Err(CompileAbort::CacheFull) => {
                self.compress();
                compiler::compile_unit(self, mem, pc)
                    .map_err(|_| FatalError::CacheExhausted { pc })?
            }
            Err(_) => return Err(FatalError::CacheExhausted { pc }),
        };
        Ok(CodeRef { ip })
    }

    // =========================================================================
    // Unit registration (called by the compiler)
    // =========================================================================

    /// Register the unit whose ops start at `code_start` and whose patch
    /// nodes start at `node_start`. Referenced patch nodes become hash nodes,
    /// the others are dropped.
    pub(crate) fn commit_unit(
        &mut self,
        mem: &MemorySpace,
        entry_pc: u32,
        source_end: u32,
        code_start: usize,
        node_start: Id<CacheNode>,
        words: u32,
    ) {
        let unit_index = self.units.len() as u32;
        let mut kept = 0usize;
        {
            let slots = self.nodes.tail_mut(node_start);
            for i in 0..slots.len() {
                if let CacheNode::Patch(patch) = slots[i] {
                    if patch.referenced {
                        slots[kept] = CacheNode::Hash(HashNode {
                            pc: patch.pc,
                            ip: (code_start as u32) + patch.offset,
                            unit: unit_index,
                            next: Id::INVALID,
                        });
                        kept += 1;
                    }
                }
            }
        }
        self.nodes
            .truncate(Id::new(node_start.index() + kept as u32));

        for i in 0..kept as u32 {
            self.link(Id::new(node_start.index() + i));
        }

        let code_len = (self.code.len() - code_start) as u32;
        self.units.push(UnitHeader {
            entry_pc,
            source_end,
            code_start: code_start as u32,
            code_len,
            words,
            node_count: kept as u32,
            run_counter: 0,
            live: true,
        });
        self.code_words += words;
        self.stats.insertions += 1;

        if entry_pc >= mem.ram_start() {
            self.ram_code = Some(match self.ram_code {
                Some((lo, hi)) => (lo.min(entry_pc), hi.max(source_end)),
                None => (entry_pc, source_end),
            });
        }

        debug!(
            pc = format_args!("{:#x}", entry_pc),
            ops = code_len,
            words,
            nodes = kept,
            "unit compiled"
        );
    }

    fn link(&mut self, id: Id<CacheNode>) {
        if let CacheNode::Hash(mut node) = self.nodes[id] {
            let bucket = self.bucket(node.pc);
            node.next = self.buckets[bucket];
            self.nodes[id] = CacheNode::Hash(node);
            self.buckets[bucket] = id;
        }
    }

    fn relink_all(&mut self) {
        self.buckets.fill(Id::INVALID);
        for index in 0..self.nodes.len() as u32 {
            self.link(Id::new(index));
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Drop everything.
    pub fn clear(&mut self) {
        self.stats.evictions += self.live_units() as u64;
        self.code.clear();
        self.nodes.clear();
        self.units.clear();
        self.buckets.fill(Id::INVALID);
        self.code_words = 0;
        self.ram_code = None;
    }

    /// Free space by discarding cold units.
    ///
    /// A unit's usage is its run count per word of cache it occupies. Units
    /// below half the mean usage are discarded and the survivors' counters
    /// halved. If that would free less than a quarter of the budget the whole
    /// cache is wiped instead.
    pub fn compress(&mut self) {
        self.stats.compressions += 1;

        let live: Vec<usize> = (0..self.units.len())
            .filter(|&i| self.units[i].live)
            .collect();
        if live.is_empty() {
            debug!(wiped = true, "code cache compressed");
            self.clear();
            return;
        }

        let total: u64 = live.iter().map(|&i| self.units[i].usage()).sum();
        let cutoff = total / (2 * live.len() as u64);

        let freed: u32 = self
            .units
            .iter()
            .filter(|unit| !unit.live || unit.usage() < cutoff)
            .map(UnitHeader::footprint)
            .sum();

        if freed < self.capacity / 4 {
            debug!(cutoff, freed, wiped = true, "code cache compressed");
            self.clear();
            return;
        }

        // Compact surviving units to the bottom of the code area.
        let mut unit_map: Vec<Option<(u32, u32)>> = vec![None; self.units.len()];
        let mut code = Vec::with_capacity(self.code.capacity());
        let mut units = Vec::with_capacity(live.len());
        let mut discarded = 0u64;
        for (old, unit) in self.units.iter().enumerate() {
            if !unit.live {
                continue;
            }
            if unit.usage() < cutoff {
                discarded += 1;
                continue;
            }
            let new_start = code.len() as u32;
            let start = unit.code_start as usize;
            code.extend_from_slice(&self.code[start..start + unit.code_len as usize]);
            unit_map[old] = Some((units.len() as u32, new_start));
            units.push(UnitHeader {
                code_start: new_start,
                run_counter: unit.run_counter / 2,
                ..*unit
            });
        }

        let old_units = std::mem::replace(&mut self.units, units);
        self.nodes.retain(|node| match node {
            CacheNode::Hash(hash) => unit_map[hash.unit as usize].is_some(),
            _ => false,
        });
        for index in 0..self.nodes.len() as u32 {
            let id = Id::new(index);
            if let CacheNode::Hash(mut hash) = self.nodes[id] {
                if let Some((new_unit, new_start)) = unit_map[hash.unit as usize] {
                    let old_start = old_units[hash.unit as usize].code_start;
                    hash.ip = hash.ip - old_start + new_start;
                    hash.unit = new_unit;
                    self.nodes[id] = CacheNode::Hash(hash);
                }
            }
        }

        self.code = code;
        self.code_words = self.units.iter().map(|unit| unit.words).sum();
        self.relink_all();
        self.recompute_ram_code();
        self.stats.evictions += discarded;

        debug!(
            cutoff,
            survivors = self.units.len(),
            discarded,
            freed,
            wiped = false,
            "code cache compressed"
        );
    }

    /// Invalidate every unit compiled from bytes in `[addr, addr + len)`.
    pub fn prune(&mut self, addr: u32, len: u32) {
        let end = addr as u64 + len as u64;
        let mut pruned = 0u32;
        for unit in self.units.iter_mut() {
            if unit.live && unit.overlaps(addr, end) {
                unit.live = false;
                pruned += 1;
            }
        }
        if pruned == 0 {
            return;
        }

        for index in 0..self.nodes.len() as u32 {
            let id = Id::new(index);
            if let CacheNode::Hash(hash) = self.nodes[id] {
                if !self.units[hash.unit as usize].live {
                    self.nodes[id] = CacheNode::Free;
                }
            }
        }
        self.relink_all();
        self.recompute_ram_code();
        self.stats.prunes += pruned as u64;
        trace!(addr = format_args!("{:#x}", addr), len, pruned, "code cache pruned");
    }

    /// Cheap check run on every memory write.
    #[inline]
    pub fn note_write(&mut self, addr: u32, len: u32) {
        if let Some((lo, hi)) = self.ram_code {
            if (addr as u64) + (len as u64) > lo as u64 && addr < hi {
                self.prune(addr, len);
            }
        }
    }

    fn recompute_ram_code(&mut self) {
        let Some((lo, _)) = self.ram_code else {
            return;
        };
        self.ram_code = self
            .units
            .iter()
            .filter(|unit| unit.live && unit.entry_pc >= lo)
            .fold(None, |range, unit| {
                Some(match range {
                    Some((a, b)) => (unit.entry_pc.min(a), unit.source_end.max(b)),
                    None => (unit.entry_pc, unit.source_end),
                })
            });
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the code cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Lookups answered from the table.
    pub hits: u64,
    /// Lookups that compiled a unit.
    pub misses: u64,
    /// Units compiled.
    pub insertions: u64,
    /// Units discarded by compression or wiping.
    pub evictions: u64,
    /// Compression passes.
    pub compressions: u64,
    /// Units invalidated by writes to their source.
    pub prunes: u64,
}

impl CodeCacheStats {
    /// Calculate hit rate.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::*;
    use glulx_core::asm::{ImageBuilder, Label, Operand as A};

    fn small_cache() -> CodeCache {
        CodeCache::new(CacheConfig {
            size: MIN_CACHE_SIZE,
            peephole: true,
        })
    }

    /// `count` functions, each returning its own index.
    fn functions(count: usize, ram_start: Option<u32>) -> (MemorySpace, Vec<u32>) {
        let mut asm = ImageBuilder::new();
        if let Some(ram) = ram_start {
            asm = asm.ram_start(ram);
            asm.bytes(&[0; 256]);
        }
        let labels: Vec<Label> = (0..count)
            .map(|i| {
                let label = asm.func_locals(0);
                asm.op(ADD, &[A::Imm(i as i32), A::Imm(1), A::Stack]);
                asm.op(RETURN, &[A::Stack]);
                label
            })
            .collect();
        let image = asm.build(labels[0]);
        let addrs = labels.iter().map(|&l| image.addr(l)).collect();
        (MemorySpace::new(&image.bytes).unwrap(), addrs)
    }

    #[test]
    fn test_second_lookup_is_a_hit() {
        let (mem, addrs) = functions(1, None);
        let mut cache = small_cache();
        let entry = addrs[0] + 3;

        let first = cache.get_code(&mem, entry).unwrap();
        assert_eq!(cache.run_counter(entry), Some(0));
        let second = cache.get_code(&mem, entry).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.run_counter(entry), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.insertions, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compiled_unit_ends_in_a_transfer() {
        let (mem, addrs) = functions(1, None);
        let mut cache = small_cache();
        let ip = cache.get_code(&mem, addrs[0] + 3).unwrap().ip;
        assert_eq!(cache.op(ip), Op::LoadConst2(0, 1));
        assert!(matches!(cache.op(ip + 1), Op::CalcStore(..)));
        assert!(matches!(cache.op(ip + 2), Op::Load { .. }));
        assert_eq!(cache.op(ip + 3), Op::Return);
    }

    #[test]
    fn test_pressure_compresses_and_keeps_hot_units() {
        let (mem, addrs) = functions(600, None);
        let mut cache = small_cache();
        let hot = addrs[0] + 3;
        cache.get_code(&mem, hot).unwrap();
        for _ in 0..1000 {
            cache.get_code(&mem, hot).unwrap();
        }
        for &addr in &addrs[1..] {
            cache.get_code(&mem, addr + 3).unwrap();
            cache.get_code(&mem, hot).unwrap();
            assert!(cache.used_words() <= cache.capacity_words());
        }

        let stats = cache.stats();
        assert!(stats.compressions > 0);
        assert!(cache.contains(hot));
        let ip = cache.get_code(&mem, hot).unwrap().ip;
        assert_eq!(cache.op(ip), Op::LoadConst2(0, 1));
    }

    #[test]
    fn test_usage_is_normalized_by_footprint() {
        let unit = |words, run_counter| UnitHeader {
            entry_pc: 0,
            source_end: 0,
            code_start: 0,
            code_len: words,
            words,
            node_count: 1,
            run_counter,
            live: true,
        };
        // 8 + 4 + 4 words against 120 + 4 + 4 words.
        let small = unit(8, 100);
        let large = unit(120, 100);
        assert_eq!(small.usage(), 100 * USAGE_SCALE / 16);
        assert!(small.usage() > large.usage());
        assert_eq!(unit(120, 800).usage(), 800 * USAGE_SCALE / 128);
    }

    #[test]
    fn test_compress_without_usage_wipes() {
        let (mem, addrs) = functions(4, None);
        let mut cache = small_cache();
        for &addr in &addrs {
            cache.get_code(&mem, addr + 3).unwrap();
        }
        cache.compress();
        assert_eq!(cache.live_units(), 0);
        assert!(!cache.contains(addrs[0] + 3));
        assert_eq!(cache.stats().evictions, 4);
    }

    #[test]
    fn test_prune_invalidates_ram_code() {
        let (mem, addrs) = functions(2, Some(0x100));
        let mut cache = small_cache();
        let a = addrs[0] + 3;
        let b = addrs[1] + 3;
        cache.get_code(&mem, a).unwrap();
        cache.get_code(&mem, b).unwrap();

        cache.note_write(a + 1, 1);
        assert!(!cache.contains(a));
        assert!(cache.contains(b));
        assert_eq!(cache.stats().prunes, 1);

        // Writes elsewhere leave the cache alone.
        cache.note_write(0x10_000, 4);
        assert!(cache.contains(b));
    }

    #[test]
    fn test_rom_code_is_not_tracked_for_writes() {
        let (mem, addrs) = functions(1, None);
        let mut cache = small_cache();
        let entry = addrs[0] + 3;
        cache.get_code(&mem, entry).unwrap();
        cache.note_write(entry, 4);
        assert!(cache.contains(entry));
    }
}
