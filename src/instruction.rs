use crate::{
    address, config,
    mem_fetch::{self, line_size_based_tag_func, MAX_MEMORY_ACCESS_SIZE},
    opcodes::ArchOp,
    resources::{self, ResourceAccounting},
    warp,
};

use bitvec::{array::BitArray, BitArr};
use mem_fetch::access::{Builder as MemAccessBuilder, Kind as AccessKind, MemAccess};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use warp::ToBitString;

/// Kernel parameter address the device runtime resolves without a memory access.
pub const PARAM_SENTINEL_ADDR: address = 0xFEEB_DAED;

pub const MAX_ACCESSES_PER_INSN_PER_THREAD: usize = 8;

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

#[derive(
    Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::EnumIter,
)]
pub enum MemorySpace {
    Local,
    Shared,
    Constant,
    Texture,
    Global,
    /// Kernel parameters (read-only, global to all threads of a kernel).
    ParamKernel,
    /// Thread-local parameters.
    ParamLocal,
    /// Parameter buffers of device-launched child kernels.
    ChildParam,
}

impl From<MemorySpace> for stats::instructions::MemorySpace {
    fn from(space: MemorySpace) -> Self {
        match space {
            MemorySpace::Local => Self::Local,
            MemorySpace::Shared => Self::Shared,
            MemorySpace::Constant => Self::Constant,
            MemorySpace::Texture => Self::Texture,
            MemorySpace::Global => Self::Global,
            MemorySpace::ParamKernel => Self::ParamKernel,
            MemorySpace::ParamLocal => Self::ParamLocal,
            MemorySpace::ChildParam => Self::ChildParam,
        }
    }
}

/// Where the threads of a warp reconverge after this instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reconvergence {
    #[default]
    None,
    At(address),
    /// Reconverge at the return address of the calling thread.
    Return,
}

/// Per-lane completion callback, invoked with the lane id.
#[derive(Clone)]
pub struct Callback(pub Arc<dyn Fn(usize) + Send + Sync>);

impl Callback {
    pub fn new(f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, lane: usize) {
        (self.0)(lane);
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

#[derive(Debug, Default, Clone)]
pub struct PerThreadInfo {
    /// Effective addresses
    ///
    /// up to 8 different requests to support 32B access in
    /// 8 chunks of 4B each
    pub mem_req_addr: [address; MAX_ACCESSES_PER_INSN_PER_THREAD],
    pub callback: Option<Callback>,
}

#[derive(Debug, Default)]
struct TransactionInfo {
    chunk_mask: mem_fetch::SectorMask,
    byte_mask: mem_fetch::ByteMask,
    active_mask: warp::ActiveMask,
}

impl TransactionInfo {
    /// Whether any byte in `start..=end` is already claimed.
    fn test_bytes(&self, start: usize, end: usize) -> bool {
        self.byte_mask[start..=end].any()
    }
}

#[allow(clippy::module_name_repetitions, clippy::struct_excessive_bools)]
#[derive(Clone)]
pub struct WarpInstruction {
    /// Globally unique id for this warp instruction.
    ///
    /// The id is assigned once the instruction is issued by a core.
    pub uid: u64,
    pub warp_id: usize,
    pub dynamic_warp_id: usize,
    pub pc: address,
    /// Size of the encoded instruction in bytes.
    pub instr_size: u32,
    pub opcode: ArchOp,
    pub memory_space: Option<MemorySpace>,
    /// size of the word being operated on
    pub data_size: u32,
    pub is_atomic: bool,
    /// Issued on behalf of a device-launched child kernel.
    pub is_child: bool,
    pub reconvergence_pc: Reconvergence,
    /// operation latency
    pub latency: usize,
    pub initiation_interval: usize,
    /// The cycle in which the instruction was issued by a core.
    pub issue_cycle: Option<u64>,
    pub dispatch_delay_cycles: usize,
    /// Active mask after predication.
    pub active_mask: warp::ActiveMask,
    /// Active mask at issue.
    pub issued_mask: warp::ActiveMask,
    pub warp_size: usize,
    /// Per-thread addresses and callbacks, empty until the first address is set.
    pub threads: Vec<PerThreadInfo>,
    pub mem_access_queue: VecDeque<MemAccess>,
    pub mem_accesses_created: bool,
    empty: bool,
}

impl std::cmp::Ord for WarpInstruction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.uid.cmp(&other.uid)
    }
}

impl std::cmp::PartialOrd for WarpInstruction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::PartialEq for WarpInstruction {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl std::cmp::Eq for WarpInstruction {}

impl std::fmt::Debug for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WarpInstruction")
            .field("uid", &self.uid)
            .field("opcode", &self.opcode)
            .field("warp_id", &self.warp_id)
            .field("pc", &self.pc)
            .field(
                "active_mask",
                &self.active_mask[..self.warp_size].to_bit_string(),
            )
            .field("memory_space", &self.memory_space)
            .field("mem_access_queue", &self.mem_access_queue)
            .finish()
    }
}

impl std::fmt::Display for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}[pc={:#06x},warp={}]",
            self.opcode, self.pc, self.warp_id
        )
    }
}

fn memory_coalescing_arch_reduce(
    is_write: bool,
    access_kind: AccessKind,
    tx: &TransactionInfo,
    mut addr: address,
    segment_size: u64,
) -> MemAccess {
    assert_eq!(addr & (segment_size - 1), 0);
    assert!(tx.chunk_mask.count_ones() >= 1);
    let mut halves: BitArr!(for 2, in u8) = BitArray::ZERO;

    let mut req_size_bytes = segment_size as u32;
    if segment_size == 128 {
        let lower_half_used = tx.chunk_mask[0] || tx.chunk_mask[1];
        let upper_half_used = tx.chunk_mask[2] || tx.chunk_mask[3];
        if lower_half_used && !upper_half_used {
            // only lower 64 bytes used
            req_size_bytes = 64;
            halves |= &tx.chunk_mask[0..2];
        } else if !lower_half_used && upper_half_used {
            // only upper 64 bytes used
            addr += 64;
            req_size_bytes = 64;
            halves |= &tx.chunk_mask[2..4];
        } else {
            assert!(lower_half_used && upper_half_used);
        }
    } else if segment_size == 64 {
        if addr % 128 == 0 {
            halves |= &tx.chunk_mask[0..2];
        } else {
            assert_eq!(addr % 128, 64);
            halves |= &tx.chunk_mask[2..4];
        }
    }

    if req_size_bytes == 64 {
        let lower_half_used = halves[0];
        let upper_half_used = halves[1];
        if lower_half_used && !upper_half_used {
            req_size_bytes = 32;
        } else if !lower_half_used && upper_half_used {
            addr += 32;
            req_size_bytes = 32;
        } else {
            assert!(lower_half_used && upper_half_used);
        }
    }

    MemAccessBuilder {
        kind: access_kind,
        addr,
        req_size_bytes,
        is_write,
        warp_active_mask: tx.active_mask,
        byte_mask: tx.byte_mask,
        sector_mask: tx.chunk_mask,
    }
    .build()
}

fn segment_size(data_size: u32) -> u64 {
    match data_size {
        1 => 32,
        2 => 64,
        4 | 8 | 16 => 128,
        size => panic!("invalid data size {size}"),
    }
}

impl WarpInstruction {
    #[must_use]
    pub fn new(warp_size: usize) -> Self {
        assert!(warp_size <= warp::MAX_WARP_SIZE);
        Self {
            uid: 0,
            warp_id: 0,
            dynamic_warp_id: 0,
            pc: 0,
            instr_size: 8,
            opcode: ArchOp::NO_OP,
            memory_space: None,
            data_size: 0,
            is_atomic: false,
            is_child: false,
            reconvergence_pc: Reconvergence::None,
            latency: 1,
            initiation_interval: 1,
            issue_cycle: None,
            dispatch_delay_cycles: 0,
            active_mask: BitArray::ZERO,
            issued_mask: BitArray::ZERO,
            warp_size,
            threads: Vec::new(),
            mem_access_queue: VecDeque::new(),
            mem_accesses_created: false,
            empty: true,
        }
    }

    /// Marks the instruction as issued by `warp_id` in `cycle`.
    pub fn issue(
        &mut self,
        mask: warp::ActiveMask,
        warp_id: usize,
        cycle: u64,
        dynamic_warp_id: usize,
        is_child: bool,
    ) {
        self.active_mask = mask;
        self.issued_mask = mask;
        self.uid = NEXT_UID.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        self.warp_id = warp_id;
        self.dynamic_warp_id = dynamic_warp_id;
        self.issue_cycle = Some(cycle);
        self.dispatch_delay_cycles = self.initiation_interval;
        self.is_child = is_child;
        self.empty = false;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.empty = true;
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    fn ensure_threads(&mut self) {
        if self.threads.is_empty() {
            self.threads = vec![PerThreadInfo::default(); self.warp_size];
        }
    }

    /// Sets the active mask after predication.
    ///
    /// Callbacks of lanes that are no longer active are dropped for atomics.
    pub fn set_active(&mut self, active: warp::ActiveMask) {
        self.active_mask = active;
        if self.is_atomic {
            for (lane, thread) in self.threads.iter_mut().enumerate() {
                if !self.active_mask[lane] {
                    thread.callback = None;
                }
            }
        }
    }

    /// Disables `inactive` lanes, all of which must currently be active.
    pub fn clear_active(&mut self, inactive: &warp::ActiveMask) {
        for lane in inactive.iter_ones() {
            assert!(
                self.active_mask[lane],
                "lane {lane} of {self} cleared but not active"
            );
            self.active_mask.set(lane, false);
        }
    }

    pub fn set_not_active(&mut self, lane: usize) {
        self.active_mask.set(lane, false);
    }

    #[must_use]
    #[inline]
    pub fn is_active(&self, lane: usize) -> bool {
        self.active_mask[lane]
    }

    #[must_use]
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_mask.count_ones()
    }

    #[must_use]
    #[inline]
    pub fn issued_count(&self) -> usize {
        assert!(!self.empty);
        self.issued_mask.count_ones()
    }

    #[inline]
    pub fn set_addr(&mut self, lane: usize, addr: address) {
        self.ensure_threads();
        self.threads[lane].mem_req_addr[0] = addr;
    }

    pub fn set_addresses(&mut self, lane: usize, addresses: &[address]) {
        assert!(addresses.len() <= MAX_ACCESSES_PER_INSN_PER_THREAD);
        self.ensure_threads();
        let thread = &mut self.threads[lane];
        thread.mem_req_addr[..addresses.len()].copy_from_slice(addresses);
    }

    pub fn add_callback(&mut self, lane: usize, callback: Callback, atomic: bool) {
        self.ensure_threads();
        if atomic {
            self.is_atomic = true;
        }
        self.threads[lane].callback = Some(callback);
    }

    #[must_use]
    pub fn has_callback(&self, lane: usize) -> bool {
        self.active_mask[lane]
            && self
                .threads
                .get(lane)
                .is_some_and(|thread| thread.callback.is_some())
    }

    /// First effective address of `lane`.
    #[must_use]
    pub fn addr(&self, lane: usize) -> address {
        assert!(!self.threads.is_empty(), "{self} has no thread addresses");
        self.threads[lane].mem_req_addr[0]
    }

    pub fn do_atomic(&self, force: bool) {
        self.do_atomic_masked(&self.active_mask, force);
    }

    /// Performs the atomic operation of every lane in `access_mask`.
    pub fn do_atomic_masked(&self, access_mask: &warp::ActiveMask, force: bool) {
        assert!(self.is_atomic && (!self.empty || force));
        self.invoke_callbacks(access_mask);
    }

    pub fn broadcast_barrier_reduction(&self, access_mask: &warp::ActiveMask) {
        self.invoke_callbacks(access_mask);
    }

    fn invoke_callbacks(&self, access_mask: &warp::ActiveMask) {
        for lane in access_mask[..self.warp_size].iter_ones() {
            if let Some(callback) = self.threads.get(lane).and_then(|t| t.callback.as_ref()) {
                callback.call(lane);
            }
        }
    }

    /// Reports the completion latency of this instruction.
    pub fn completed(&self, cycle: u64, stats: &mut stats::Stats) {
        let issue_cycle = self
            .issue_cycle
            .unwrap_or_else(|| panic!("{self} completed without being issued"));
        assert!(
            issue_cycle <= cycle,
            "{self} completed at cycle {cycle} before issue at {issue_cycle}"
        );
        let latency = cycle - issue_cycle;
        stats.add_latency(self.pc, latency * self.active_count() as u64);
    }

    /// Counts down the initiation interval.
    ///
    /// Returns `true` while the instruction still has to wait.
    pub fn dispatch_delay(&mut self) -> bool {
        if self.dispatch_delay_cycles > 0 {
            self.dispatch_delay_cycles -= 1;
        }
        self.dispatch_delay_cycles > 0
    }

    #[must_use]
    pub fn has_dispatch_delay(&self) -> bool {
        self.dispatch_delay_cycles > 0
    }

    #[must_use]
    pub fn accessq_empty(&self) -> bool {
        self.mem_access_queue.is_empty()
    }

    #[must_use]
    pub fn accessq_count(&self) -> usize {
        self.mem_access_queue.len()
    }

    #[must_use]
    pub fn accessq_back(&self) -> Option<&MemAccess> {
        self.mem_access_queue.back()
    }

    pub fn accessq_pop_back(&mut self) -> Option<MemAccess> {
        self.mem_access_queue.pop_back()
    }

    #[must_use]
    #[inline]
    pub fn is_load(&self) -> bool {
        self.opcode == ArchOp::LOAD_OP
    }

    #[must_use]
    #[inline]
    pub fn is_store(&self) -> bool {
        self.opcode == ArchOp::STORE_OP
    }

    #[must_use]
    #[inline]
    pub fn access_kind(&self) -> Option<AccessKind> {
        let is_write = self.is_store();
        match self.memory_space? {
            MemorySpace::Constant | MemorySpace::ParamKernel => Some(AccessKind::CONST_ACC_R),
            MemorySpace::Texture => Some(AccessKind::TEXTURE_ACC_R),
            MemorySpace::Global | MemorySpace::ChildParam => Some(AccessKind::global(is_write)),
            MemorySpace::Local | MemorySpace::ParamLocal => Some(AccessKind::local(is_write)),
            MemorySpace::Shared => None,
        }
    }

    fn first_active_addr(&self) -> address {
        let lane = self.active_mask.first_one().unwrap_or(0);
        self.threads[lane].mem_req_addr[0]
    }

    /// Translates the per-thread addresses into memory accesses.
    ///
    /// Accesses are appended to the access queue. Shared memory accesses
    /// produce no accesses but an initiation interval that models bank
    /// conflicts.
    pub fn generate_mem_accesses(
        &mut self,
        config: &config::GPU,
        resources: &mut ResourceAccounting,
        stats: &mut stats::Stats,
    ) {
        if self.empty || self.mem_accesses_created || !self.opcode.is_memory() {
            return;
        }
        if matches!(self.opcode, ArchOp::BARRIER_OP | ArchOp::MEMORY_BARRIER_OP) {
            // ordering only, no data is moved
            return;
        }
        if self.active_count() < 1 {
            // predicated off
            return;
        }
        assert!(
            !self.threads.is_empty(),
            "{self} needs per-thread address information"
        );

        let is_write = self.is_store();
        let Some(space) = self.memory_space else {
            panic!("generate mem accesses for {self} without memory space");
        };
        let starting_queue_size = self.mem_access_queue.len();
        let mut cache_block_size = None;
        let mut handled = false;

        log::debug!(
            "generate mem accesses[{:?}] for {} (active={})",
            space,
            self,
            self.active_mask[..self.warp_size].to_bit_string()
        );

        match space {
            MemorySpace::Shared => {
                self.shared_memory_bank_conflicts(config, stats);
                handled = true;
            }
            MemorySpace::Texture => {
                cache_block_size = Some(config.tex_cache_l1_line_size);
            }
            MemorySpace::ParamKernel => {
                let addr = self.first_active_addr();
                if config.param_access_unified_l1 && resources::is_child_param(addr) {
                    // redirect child kernel parameter loads to the unified L1
                    self.memory_space = Some(MemorySpace::Global);
                    self.coalesce(is_write, AccessKind::GLOBAL_ACC_R, config, resources);
                } else if addr == PARAM_SENTINEL_ADDR {
                    log::debug!("bypass parameter load of {}", self);
                    resources.bypass.sentinel += 1;
                    return;
                } else {
                    cache_block_size = Some(config.const_cache_l1_line_size);
                }
            }
            MemorySpace::Constant => {
                cache_block_size = Some(config.const_cache_l1_line_size);
            }
            MemorySpace::Global
            | MemorySpace::Local
            | MemorySpace::ParamLocal
            | MemorySpace::ChildParam => {
                let access_kind = self.access_kind().expect("has access kind");
                self.coalesce(is_write, access_kind, config, resources);
            }
        }

        if let Some(block_size) = cache_block_size {
            let access_kind = self.access_kind().expect("has access kind");
            self.cache_block_accesses(is_write, access_kind, block_size);
        }

        let num_new_accesses = self.mem_access_queue.len() - starting_queue_size;
        if self.memory_space == Some(MemorySpace::Global) {
            stats.add_uncoalesced_gmem(self.pc, num_new_accesses as u64);
        }
        for access in self.mem_access_queue.iter().skip(starting_queue_size) {
            stats.accesses.inc(access.kind, 1);
        }

        // fully bypassed instructions may be retried
        if handled || num_new_accesses > 0 {
            self.mem_accesses_created = true;
            if let Some(space) = self.memory_space {
                stats.instructions.inc(space, is_write, 1);
            }
        }
    }

    fn shared_memory_bank_conflicts(&mut self, config: &config::GPU, stats: &mut stats::Stats) {
        let warp_parts = config.shared_memory_warp_parts;
        let subwarp_size = config.warp_size / warp_parts;
        let mut total_accesses = 0;

        for subwarp in 0..warp_parts {
            // bank -> word address -> access count
            let mut bank_accesses: BTreeMap<u64, BTreeMap<address, usize>> = BTreeMap::new();

            for thread_id in (subwarp * subwarp_size)..((subwarp + 1) * subwarp_size) {
                if !self.active_mask[thread_id] {
                    continue;
                }
                let addr = self.threads[thread_id].mem_req_addr[0];
                let bank = config.shared_mem_bank(addr);
                let word = line_size_based_tag_func(addr, config::WORD_SIZE);
                *bank_accesses.entry(bank).or_default().entry(word).or_default() += 1;
            }

            let max_bank_accesses = if config.shared_memory_limited_broadcast {
                let broadcast = bank_accesses.iter().find_map(|(bank, words)| {
                    words
                        .iter()
                        .find(|(_, num_accesses)| **num_accesses > 1)
                        .map(|(word, num_accesses)| (*bank, *word, *num_accesses))
                });

                bank_accesses
                    .iter()
                    .map(|(bank, words)| {
                        let mut accesses: usize = words.values().sum();
                        if let Some((broadcast_bank, _, n)) = broadcast {
                            if broadcast_bank == *bank {
                                assert!(accesses >= n - 1);
                                accesses -= n - 1;
                            }
                        }
                        accesses
                    })
                    .max()
                    .unwrap_or(0)
            } else {
                bank_accesses.values().map(BTreeMap::len).max().unwrap_or(0)
            };
            total_accesses += max_bank_accesses;
        }

        log::debug!("shared memory accesses of {}: {}", self, total_accesses);
        assert!(
            total_accesses > 0 && total_accesses <= config.warp_size,
            "invalid number of shared memory accesses {total_accesses}"
        );

        // bank conflicts are modeled as a longer initiation interval
        self.dispatch_delay_cycles = total_accesses;
        stats.add_smem_bank_conflict(self.pc, total_accesses as u64);
    }

    /// One access per cache block touched by the active threads.
    fn cache_block_accesses(&mut self, is_write: bool, access_kind: AccessKind, block_size: u64) {
        assert!(self.mem_access_queue.is_empty());
        let mut accesses: BTreeMap<address, (warp::ActiveMask, mem_fetch::ByteMask)> =
            BTreeMap::new();

        for lane in self.active_mask[..self.warp_size].iter_ones() {
            let addr = self.threads[lane].mem_req_addr[0];
            let block_addr = line_size_based_tag_func(addr, block_size);
            let (active_mask, byte_mask) = accesses
                .entry(block_addr)
                .or_insert((BitArray::ZERO, BitArray::ZERO));
            active_mask.set(lane, true);
            let idx = (addr - block_addr) as usize;
            for i in 0..self.data_size as usize {
                if idx + i < MAX_MEMORY_ACCESS_SIZE {
                    byte_mask.set(idx + i, true);
                }
            }
        }

        for (block_addr, (warp_active_mask, byte_mask)) in accesses {
            let mut sector_mask: mem_fetch::SectorMask = BitArray::ZERO;
            for (sector, bytes) in byte_mask.chunks(32).enumerate() {
                sector_mask.set(sector, bytes.any());
            }
            self.mem_access_queue.push_back(
                MemAccessBuilder {
                    kind: access_kind,
                    addr: block_addr,
                    req_size_bytes: block_size as u32,
                    is_write,
                    warp_active_mask,
                    byte_mask,
                    sector_mask,
                }
                .build(),
            );
        }
    }

    fn coalesce(
        &mut self,
        is_write: bool,
        access_kind: AccessKind,
        config: &config::GPU,
        resources: &mut ResourceAccounting,
    ) {
        assert_eq!(
            config.coalescing_arch,
            config::Architecture::GT200,
            "coalescing arch {:?} not supported",
            config.coalescing_arch
        );
        let accesses = if self.is_atomic {
            self.memory_coalescing_arch_atomic(is_write, access_kind, config)
        } else {
            self.memory_coalescing_arch(is_write, access_kind, config, resources)
        };
        for access in accesses {
            resources.count_cache_line(is_write);
            self.mem_access_queue.push_back(access);
        }
    }

    fn memory_coalescing_arch(
        &self,
        is_write: bool,
        access_kind: AccessKind,
        config: &config::GPU,
        resources: &mut ResourceAccounting,
    ) -> Vec<MemAccess> {
        let warp_parts = config.shared_memory_warp_parts;
        let segment_size = segment_size(self.data_size);
        let subwarp_size = config.warp_size / warp_parts;
        log::trace!(
            "memory_coalescing_arch {:?}: segment size={} subwarp size={}",
            access_kind,
            segment_size,
            subwarp_size,
        );

        let mut accesses: Vec<MemAccess> = Vec::new();
        for subwarp in 0..warp_parts {
            let mut subwarp_transactions: HashMap<address, TransactionInfo> = HashMap::new();

            for thread_id in (subwarp * subwarp_size)..((subwarp + 1) * subwarp_size) {
                if !self.active_mask[thread_id] {
                    continue;
                }
                let thread = &self.threads[thread_id];

                let mut data_size_coales = self.data_size;
                let mut num_accesses = 1;

                // local memory accesses of 4 bytes or more are split into 4 byte chunks
                if matches!(
                    self.memory_space,
                    Some(MemorySpace::Local | MemorySpace::ParamLocal)
                ) && self.data_size >= 4
                {
                    data_size_coales = 4;
                    num_accesses = self.data_size as usize / 4;
                }
                assert!(num_accesses <= MAX_ACCESSES_PER_INSN_PER_THREAD);

                for &addr in &thread.mem_req_addr[..num_accesses] {
                    if self.memory_space == Some(MemorySpace::ChildParam)
                        && resources.constant_sharing.should_bypass(addr, self.pc)
                    {
                        resources.bypass.constant_sharing += 1;
                        continue;
                    }
                    let block_addr = line_size_based_tag_func(addr, segment_size);
                    // which 32-byte chunk within the 128-byte chunk is accessed
                    let chunk = (addr & 127) / 32;
                    let tx = subwarp_transactions.entry(block_addr).or_default();

                    tx.chunk_mask.set(chunk as usize, true);
                    tx.active_mask.set(thread_id, true);
                    let idx = (addr & 127) as usize;
                    for i in 0..data_size_coales as usize {
                        if idx + i < MAX_MEMORY_ACCESS_SIZE {
                            tx.byte_mask.set(idx + i, true);
                        }
                    }
                }
            }

            log::trace!(
                "memory_coalescing_arch {:?}: subwarp {} transactions: {:?}",
                access_kind,
                subwarp,
                subwarp_transactions,
            );

            let mut subwarp_accesses: Vec<_> = subwarp_transactions.into_iter().collect();
            subwarp_accesses.sort_by_key(|(block_addr, _)| *block_addr);

            accesses.extend(
                subwarp_accesses
                    .into_iter()
                    .map(|(block_addr, transaction)| {
                        memory_coalescing_arch_reduce(
                            is_write,
                            access_kind,
                            &transaction,
                            block_addr,
                            segment_size,
                        )
                    }),
            );
        }
        accesses
    }

    /// Coalescing for atomics.
    ///
    /// Threads touching the same bytes of a segment end up in different
    /// transactions.
    fn memory_coalescing_arch_atomic(
        &self,
        is_write: bool,
        access_kind: AccessKind,
        config: &config::GPU,
    ) -> Vec<MemAccess> {
        assert_eq!(
            self.memory_space,
            Some(MemorySpace::Global),
            "atomics are only supported for global memory"
        );
        let warp_parts = 2;
        let segment_size = segment_size(self.data_size);
        let subwarp_size = config.warp_size / warp_parts;
        let data_size = self.data_size as usize;

        let mut accesses: Vec<MemAccess> = Vec::new();
        for subwarp in 0..warp_parts {
            let mut subwarp_transactions: BTreeMap<address, Vec<TransactionInfo>> =
                BTreeMap::new();

            for thread_id in (subwarp * subwarp_size)..((subwarp + 1) * subwarp_size) {
                if !self.active_mask[thread_id] {
                    continue;
                }
                let addr = self.threads[thread_id].mem_req_addr[0];
                let block_addr = line_size_based_tag_func(addr, segment_size);
                let chunk = (addr & 127) / 32;

                // can only write to one segment
                assert_eq!(
                    block_addr,
                    line_size_based_tag_func(addr + data_size as u64 - 1, segment_size),
                    "atomic access at {addr:#x} spans multiple segments"
                );

                let idx = (addr & 127) as usize;
                let transactions = subwarp_transactions.entry(block_addr).or_default();
                let pos = match transactions
                    .iter()
                    .position(|tx| !tx.test_bytes(idx, idx + data_size - 1))
                {
                    Some(pos) => pos,
                    None => {
                        transactions.push(TransactionInfo::default());
                        transactions.len() - 1
                    }
                };
                let tx = &mut transactions[pos];
                tx.chunk_mask.set(chunk as usize, true);
                tx.active_mask.set(thread_id, true);
                for i in idx..idx + data_size {
                    assert!(!tx.byte_mask[i], "byte {i} claimed twice");
                    tx.byte_mask.set(i, true);
                }
            }

            for (block_addr, transactions) in subwarp_transactions {
                accesses.extend(transactions.iter().map(|tx| {
                    memory_coalescing_arch_reduce(
                        is_write,
                        access_kind,
                        tx,
                        block_addr,
                        segment_size,
                    )
                }));
            }
        }
        accesses
    }
}

#[cfg(test)]
mod tests {
    use super::{Callback, MemorySpace, WarpInstruction};
    use crate::{
        address, config,
        mem_fetch::access::Kind as AccessKind,
        opcodes::ArchOp,
        resources::{self, ResourceAccounting},
        warp,
    };
    use pretty_assertions_sorted as diff;
    use std::sync::{Arc, Mutex};

    fn memory_instruction(
        config: &config::GPU,
        opcode: ArchOp,
        space: MemorySpace,
        data_size: u32,
        addrs: &[(usize, address)],
    ) -> WarpInstruction {
        let mut inst = WarpInstruction::new(config.warp_size);
        inst.pc = 0x120;
        inst.opcode = opcode;
        inst.memory_space = Some(space);
        inst.data_size = data_size;
        for &(lane, addr) in addrs {
            inst.set_addr(lane, addr);
        }
        inst.issue(
            warp::mask_from_lanes(addrs.iter().map(|(lane, _)| *lane)),
            0,
            10,
            0,
            false,
        );
        inst
    }

    fn summary(inst: &WarpInstruction) -> Vec<(AccessKind, address, u32, Vec<usize>)> {
        inst.mem_access_queue
            .iter()
            .map(|access| {
                (
                    access.kind,
                    access.addr,
                    access.req_size_bytes,
                    access.warp_active_mask.iter_ones().collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_coalesce_to_single_sector() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let addrs: Vec<_> = (0..4).map(|lane| (lane, 0x1000 + 4 * lane as u64)).collect();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &addrs);

        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![(AccessKind::GLOBAL_ACC_R, 0x1000, 32, vec![0, 1, 2, 3])]
        );
        let access = &inst.mem_access_queue[0];
        assert_eq!(access.byte_mask.count_ones(), 16);
        assert!(access.byte_mask[..16].all());
        assert!(access.sector_mask[0]);
        assert!(inst.mem_accesses_created);
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 1);
        assert_eq!(resources.total_ld_cache_lines, 1);

        // generating again is a no-op
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.accessq_count(), 1);
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 1);
        assert_eq!(resources.total_ld_cache_lines, 1);
    }

    #[test]
    fn test_coalesce_reduces_to_upper_sector() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::STORE_OP,
            MemorySpace::Global,
            4,
            &[(0, 0x1060), (5, 0x1064)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![(AccessKind::GLOBAL_ACC_W, 0x1060, 32, vec![0, 5])]
        );
        assert_eq!(resources.total_st_cache_lines, 1);
    }

    #[test]
    fn test_coalesce_multiple_segments_in_address_order() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::Global,
            4,
            &[(0, 0x2000), (1, 0x1000), (2, 0x1040), (3, 0x1004)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![
                (AccessKind::GLOBAL_ACC_R, 0x1000, 128, vec![1, 2, 3]),
                (AccessKind::GLOBAL_ACC_R, 0x2000, 32, vec![0]),
            ]
        );
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 2);
    }

    #[test]
    fn test_shared_memory_broadcast() {
        let config = config::GPU {
            shared_memory_num_banks: 32,
            shared_memory_limited_broadcast: true,
            ..config::GPU::default()
        };
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let addrs: Vec<_> = (0..32).map(|lane| (lane, 0x100)).collect();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Shared, 4, &addrs);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert!(inst.accessq_empty());
        assert!(inst.mem_accesses_created);
        assert_eq!(inst.dispatch_delay_cycles, 1);
        assert_eq!(stats.pc.get(0x120).smem_bank_conflicts, 1);
    }

    #[test]
    fn test_shared_memory_bank_conflict() {
        let config = config::GPU {
            shared_memory_num_banks: 32,
            shared_memory_limited_broadcast: true,
            ..config::GPU::default()
        };
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        // 32 distinct words all mapping to bank 0
        let addrs: Vec<_> = (0..32).map(|lane| (lane, 128 * lane as u64)).collect();
        let mut inst =
            memory_instruction(&config, ArchOp::STORE_OP, MemorySpace::Shared, 4, &addrs);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.dispatch_delay_cycles, 32);
        assert_eq!(stats.pc.get(0x120).smem_bank_conflicts, 32);

        assert!(inst.has_dispatch_delay());
        assert!(inst.dispatch_delay());
        assert_eq!(inst.dispatch_delay_cycles, 31);
    }

    #[test]
    fn test_shared_memory_distinct_words_per_bank() {
        let config = config::GPU {
            shared_memory_num_banks: 32,
            ..config::GPU::default()
        };
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        // lanes 0 and 1 share a word, lane 2 hits another word of the same bank
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::Shared,
            4,
            &[(0, 0x0), (1, 0x0), (2, 0x80), (3, 0x4)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.dispatch_delay_cycles, 2);
    }

    #[test]
    fn test_constant_cache_blocks() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::Constant,
            4,
            &[(0, 0x100), (1, 0x104), (2, 0x140)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![
                (AccessKind::CONST_ACC_R, 0x100, 64, vec![0, 1]),
                (AccessKind::CONST_ACC_R, 0x140, 64, vec![2]),
            ]
        );
        assert_eq!(inst.mem_access_queue[0].byte_mask.count_ones(), 8);
        assert_eq!(inst.mem_access_queue[1].byte_mask.count_ones(), 4);
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 0);
        assert_eq!(
            stats
                .accesses
                .num_accesses(stats::mem::AccessKind::CONST_ACC_R),
            2
        );
    }

    #[test]
    fn test_texture_line_size() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::Texture,
            4,
            &[(0, 0x100), (1, 0x17c)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![(AccessKind::TEXTURE_ACC_R, 0x100, 128, vec![0, 1])]
        );
    }

    #[test]
    fn test_param_sentinel_bypass() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::ParamKernel,
            4,
            &[(0, super::PARAM_SENTINEL_ADDR)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert!(inst.accessq_empty());
        assert!(!inst.mem_accesses_created);
        assert_eq!(resources.bypass.sentinel, 1);
    }

    #[test]
    fn test_param_unified_l1_redirect() {
        let config = config::GPU {
            param_access_unified_l1: true,
            ..config::GPU::default()
        };
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let addrs: Vec<_> = (0..4)
            .map(|lane| (lane, resources::CHILD_PARAM_START + 4 * lane as u64))
            .collect();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::ParamKernel, 4, &addrs);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.memory_space, Some(MemorySpace::Global));
        diff::assert_eq!(
            summary(&inst),
            vec![(
                AccessKind::GLOBAL_ACC_R,
                resources::CHILD_PARAM_START,
                32,
                vec![0, 1, 2, 3]
            )]
        );
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 1);
    }

    #[test]
    fn test_param_kernel_uses_constant_cache() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::ParamKernel,
            4,
            &[(0, resources::CHILD_PARAM_START)],
        );
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.memory_space, Some(MemorySpace::ParamKernel));
        diff::assert_eq!(
            summary(&inst),
            vec![(
                AccessKind::CONST_ACC_R,
                resources::CHILD_PARAM_START,
                64,
                vec![0]
            )]
        );
    }

    #[test]
    fn test_atomic_overlap_opens_new_transaction() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::STORE_OP,
            MemorySpace::Global,
            4,
            &[(0, 0x2000), (1, 0x2000), (2, 0x2004), (20, 0x2000)],
        );
        inst.is_atomic = true;
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![
                (AccessKind::GLOBAL_ACC_W, 0x2000, 32, vec![0, 2]),
                (AccessKind::GLOBAL_ACC_W, 0x2000, 32, vec![1]),
                // second sub-warp
                (AccessKind::GLOBAL_ACC_W, 0x2000, 32, vec![20]),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "only supported for global memory")]
    fn test_atomic_requires_global_space() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::STORE_OP,
            MemorySpace::Local,
            4,
            &[(0, 0x2000)],
        );
        inst.is_atomic = true;
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
    }

    #[test]
    fn test_local_accesses_are_split() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst = memory_instruction(
            &config,
            ArchOp::LOAD_OP,
            MemorySpace::Local,
            8,
            &[(0, 0x3000)],
        );
        inst.set_addresses(0, &[0x3000, 0x3040]);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        diff::assert_eq!(
            summary(&inst),
            vec![(AccessKind::LOCAL_ACC_R, 0x3000, 128, vec![0])]
        );
        let access = &inst.mem_access_queue[0];
        assert_eq!(access.byte_mask.count_ones(), 8);
        assert!(access.byte_mask[0x40..0x44].all());
        assert_eq!(stats.pc.get(0x120).uncoalesced_gmem, 0);
    }

    #[test]
    fn test_child_param_constant_sharing_bypass() {
        let config = config::GPU {
            global_constant_pointer_sharing: config::ConstantSharingMode::Always,
            ..config::GPU::default()
        };
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let addrs: Vec<_> = (0..4)
            .map(|lane| (lane, resources::CHILD_PARAM_START + 4 * lane as u64))
            .collect();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::ChildParam, 4, &addrs);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert!(inst.accessq_empty());
        assert!(!inst.mem_accesses_created);
        assert_eq!(resources.bypass.constant_sharing, 4);

        // without sharing, child parameters are coalesced like global memory
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::ChildParam, 4, &addrs);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert_eq!(inst.accessq_count(), 1);
        assert_eq!(inst.mem_access_queue[0].kind, AccessKind::GLOBAL_ACC_R);
    }

    #[test]
    fn test_non_memory_and_predicated_off() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst =
            memory_instruction(&config, ArchOp::ALU_OP, MemorySpace::Global, 4, &[(0, 0x10)]);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert!(inst.accessq_empty());

        for opcode in [ArchOp::BARRIER_OP, ArchOp::MEMORY_BARRIER_OP] {
            assert!(opcode.is_memory());
            let mut inst =
                memory_instruction(&config, opcode, MemorySpace::Global, 4, &[(0, 0x10)]);
            inst.generate_mem_accesses(&config, &mut resources, &mut stats);
            assert!(inst.accessq_empty());
            assert!(!inst.mem_accesses_created);
        }
        assert_eq!(resources.total_ld_cache_lines, 0);

        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &[(0, 0x10)]);
        inst.set_not_active(0);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
        assert!(inst.accessq_empty());
        assert!(!inst.mem_accesses_created);
    }

    #[test]
    #[should_panic(expected = "invalid data size")]
    fn test_invalid_data_size() {
        let config = config::GPU::default();
        let mut resources = ResourceAccounting::new(&config);
        let mut stats = stats::Stats::default();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 3, &[(0, 0x10)]);
        inst.generate_mem_accesses(&config, &mut resources, &mut stats);
    }

    #[test]
    fn test_completed_reports_latency() {
        let config = config::GPU::default();
        let mut stats = stats::Stats::default();
        let addrs: Vec<_> = (0..4).map(|lane| (lane, 0)).collect();
        let inst = memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &addrs);
        assert_eq!(inst.issue_cycle, Some(10));
        inst.completed(15, &mut stats);
        assert_eq!(stats.pc.get(0x120).latency, 5 * 4);
    }

    #[test]
    fn test_issue_assigns_increasing_uids() {
        let config = config::GPU::default();
        let first = memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &[]);
        let second = memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &[]);
        assert!(first.uid > 0);
        assert!(second > first);
        assert!(!second.is_empty());
    }

    #[test]
    fn test_atomic_callbacks() {
        let config = config::GPU::default();
        let called = Arc::new(Mutex::new(Vec::new()));
        let mut inst = memory_instruction(
            &config,
            ArchOp::STORE_OP,
            MemorySpace::Global,
            4,
            &[(0, 0x0), (1, 0x4), (2, 0x8)],
        );
        for lane in 0..3 {
            let called = Arc::clone(&called);
            inst.add_callback(
                lane,
                Callback::new(move |lane| called.lock().unwrap().push(lane)),
                true,
            );
        }
        assert!(inst.is_atomic);
        assert!(inst.has_callback(1));

        // predicated off lanes lose their callback
        inst.set_active(warp::mask_from_lanes([0, 2]));
        assert!(!inst.has_callback(1));
        assert!(inst.threads[1].callback.is_none());

        inst.do_atomic(false);
        diff::assert_eq!(*called.lock().unwrap(), vec![0, 2]);
    }

    #[test]
    #[should_panic(expected = "cleared but not active")]
    fn test_clear_inactive_lane_panics() {
        let config = config::GPU::default();
        let mut inst =
            memory_instruction(&config, ArchOp::LOAD_OP, MemorySpace::Global, 4, &[(0, 0)]);
        inst.clear_active(&warp::mask_from_lanes([0]));
        assert_eq!(inst.active_count(), 0);
        assert_eq!(inst.issued_count(), 1);
        inst.clear_active(&warp::mask_from_lanes([1]));
    }
}
