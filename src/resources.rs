//! Simulation-wide resource accounting.
//!
//! Launch machinery shares a handful of counters between kernels: the child
//! parameter buffer footprint, the hardware kernel queue, the on-chip parameter
//! buffer and some bypass statistics. They live in a single context that is
//! passed by `&mut` to whoever needs to update them.

use super::{address, config};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;

/// Start of the child kernel parameter address range (inclusive).
pub const CHILD_PARAM_START: address = 0xE000_0000;
/// End of the child kernel parameter address range (exclusive).
pub const CHILD_PARAM_END: address = 0xF000_0000;

/// Whether `addr` points into child kernel parameter memory.
#[must_use]
#[inline]
pub fn is_child_param(addr: address) -> bool {
    (CHILD_PARAM_START..CHILD_PARAM_END).contains(&addr)
}

/// Where the metadata of an aggregated group or coalesced kernel lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueEntry {
    /// Slot in the on-chip kernel queue.
    OnChip(usize),
    /// Spilled to off-chip memory.
    OffChip,
}

/// On-chip hardware kernel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelQueue {
    empty: Vec<bool>,
    pub used: usize,
    pub running: usize,
}

impl KernelQueue {
    #[must_use]
    pub fn new(num_entries: usize) -> Self {
        Self {
            empty: vec![true; num_entries],
            used: 0,
            running: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.empty.len()
    }

    #[must_use]
    pub fn is_free(&self, entry: usize) -> bool {
        self.empty.get(entry).copied().unwrap_or(false)
    }

    /// Claims the first free entry, if any.
    pub fn allocate(&mut self) -> Option<usize> {
        let entry = self.empty.iter().position(|empty| *empty)?;
        self.empty[entry] = false;
        self.used += 1;
        Some(entry)
    }

    /// Returns `entry` to the queue.
    ///
    /// Panics if the entry is already free.
    pub fn release(&mut self, entry: usize, running: bool) {
        assert!(
            !self.empty[entry],
            "kernel queue entry {entry} released twice"
        );
        self.empty[entry] = true;
        self.used = self.used.saturating_sub(1);
        if running {
            self.running = self.running.saturating_sub(1);
        }
        log::debug!(
            "reclaim kernel queue entry {} (used={}, running={})",
            entry,
            self.used,
            self.running
        );
    }
}

/// On-chip buffer holding the parameters of coalesced child kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamBuffer {
    pub usage: i64,
    /// Footprint of one kernel entry.
    pub kernel_param_usage: i64,
    pub max_size: u64,
    /// Low watermark in percent.
    pub threshold_low: u64,
    pub full: bool,
}

impl ParamBuffer {
    pub fn reserve_kernel_entry(&mut self) {
        self.usage += self.kernel_param_usage;
        if self.usage >= self.max_size as i64 {
            self.full = true;
        }
    }

    /// Releases one kernel entry and clears the full flag once usage drops
    /// below the low watermark.
    pub fn release_kernel_entry(&mut self) {
        self.usage -= self.kernel_param_usage;
        if self.usage < 0 {
            self.usage = 0;
        }
        log::debug!("clear parameter buffer entry, usage {}", self.usage);
        if (self.usage as u64) * 100 < self.max_size * self.threshold_low {
            self.full = false;
        }
    }
}

/// Accesses that never reached the memory system.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassCounters {
    /// Kernel parameter loads of the device runtime sentinel address.
    pub sentinel: u64,
    /// Child parameter accesses served by constant pointer sharing.
    pub constant_sharing: u64,
}

/// Instructions whose child parameter accesses may bypass the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcRule {
    Ranges(Vec<RangeInclusive<address>>),
    List(Vec<address>),
}

impl PcRule {
    #[must_use]
    pub fn matches(&self, pc: address) -> bool {
        match self {
            Self::Ranges(ranges) => ranges.iter().any(|range| range.contains(&pc)),
            Self::List(pcs) => pcs.contains(&pc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPolicy {
    pub pcs: PcRule,
    /// Child parameter footprint of a single launch.
    pub param_usage: Option<u64>,
}

/// Constant pointer sharing policy for child kernel parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstantSharingPolicy {
    pub mode: config::ConstantSharingMode,
    pub application: Option<String>,
    pub table: HashMap<String, AppPolicy>,
}

impl ConstantSharingPolicy {
    fn app_policy(&self) -> Option<&AppPolicy> {
        self.application
            .as_ref()
            .and_then(|application| self.table.get(application))
    }

    /// Whether an access to `addr` issued at `pc` can skip the memory system.
    #[must_use]
    pub fn should_bypass(&self, addr: address, pc: address) -> bool {
        if !is_child_param(addr) {
            return false;
        }
        match self.mode {
            config::ConstantSharingMode::Off => false,
            config::ConstantSharingMode::Always => true,
            config::ConstantSharingMode::Selective => self
                .app_policy()
                .is_some_and(|policy| policy.pcs.matches(pc)),
        }
    }

    /// Per-launch parameter footprint under selective sharing.
    #[must_use]
    pub fn param_usage(&self) -> Option<u64> {
        if self.mode != config::ConstantSharingMode::Selective {
            return None;
        }
        self.app_policy().and_then(|policy| policy.param_usage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAccounting {
    /// Total child parameter buffer footprint in bytes.
    pub total_param_size: i64,
    pub kernel_queue: KernelQueue,
    pub offchip_metadata: u64,
    pub param_buffer: ParamBuffer,
    pub bypass: BypassCounters,
    pub total_ld_cache_lines: u64,
    pub total_st_cache_lines: u64,
    pub constant_sharing: ConstantSharingPolicy,
}

impl ResourceAccounting {
    #[must_use]
    pub fn new(config: &config::GPU) -> Self {
        Self {
            total_param_size: 0,
            kernel_queue: KernelQueue::new(config.kernel_queue_entries),
            offchip_metadata: 0,
            param_buffer: ParamBuffer {
                usage: 0,
                kernel_param_usage: 0,
                max_size: config.max_param_buffer_size,
                threshold_low: config.param_buffer_threshold_low,
                full: false,
            },
            bypass: BypassCounters::default(),
            total_ld_cache_lines: 0,
            total_st_cache_lines: 0,
            constant_sharing: ConstantSharingPolicy {
                mode: config.global_constant_pointer_sharing,
                application: config.application.clone(),
                table: HashMap::new(),
            },
        }
    }

    pub fn reserve_param_size(&mut self, size: u64) {
        self.total_param_size += size as i64;
    }

    /// Releases `size` bytes of child parameter buffer, clamping at zero.
    pub fn release_param_size(&mut self, size: u64) {
        self.total_param_size -= size as i64;
        if self.total_param_size < 0 {
            log::warn!(
                "child parameter buffer released {} bytes more than reserved",
                -self.total_param_size
            );
            self.total_param_size = 0;
        }
    }

    /// Releases a metadata slot, wherever it lives.
    pub fn release_queue_entry(&mut self, entry: QueueEntry, running: bool) {
        match entry {
            QueueEntry::OnChip(entry) => self.kernel_queue.release(entry, running),
            QueueEntry::OffChip => self.release_offchip_metadata(),
        }
    }

    pub fn release_offchip_metadata(&mut self) {
        self.offchip_metadata = self.offchip_metadata.saturating_sub(1);
        log::debug!(
            "reclaim off-chip kernel metadata, {} remaining",
            self.offchip_metadata
        );
    }

    pub fn count_cache_line(&mut self, is_write: bool) {
        if is_write {
            self.total_st_cache_lines += 1;
        } else {
            self.total_ld_cache_lines += 1;
        }
    }

    /// Aligned footprint of one child parameter buffer for a kernel whose
    /// arguments occupy `args_aligned_size` bytes.
    #[must_use]
    pub fn child_param_footprint(&self, config: &config::GPU, args_aligned_size: u64) -> u64 {
        let size = self
            .constant_sharing
            .param_usage()
            .unwrap_or(args_aligned_size);
        config.align_param_size(size)
    }
}
