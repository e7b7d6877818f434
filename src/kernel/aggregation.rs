//! Aggregated block groups.
//!
//! Blocks of dynamically launched child kernels can be appended to an already
//! running kernel with the same block dimensions. Every group extends the grid
//! of the kernel by its own blocks and is dispatched after the native blocks.

use super::{BlockGroup, BlockState, Kernel, ParentThread};
use crate::{address, config, dim::Dim, resources};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedBlockGroup {
    /// Grid of the aggregated blocks.
    pub agg_dim: Dim,
    pub block_dim: Dim,
    pub param_mem_base: address,
    /// Where the metadata of this group is kept.
    pub kernel_queue_entry: resources::QueueEntry,
    /// Thread that launched the group.
    pub parent_thread: ParentThread,
}

impl AggregatedBlockGroup {
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.agg_dim.size() as usize
    }
}

impl Kernel {
    /// Appends `group` to the grid of this kernel.
    ///
    /// The block state table is rebuilt with linear block ids.
    pub fn add_agg_block_group(&mut self, group: AggregatedBlockGroup) {
        // only groups with the same block configuration are supported
        assert_eq!(
            group.block_dim, self.block_dim,
            "aggregated block dimension {} differs from kernel block dimension {}",
            group.block_dim, self.block_dim
        );
        assert!(
            self.unissued_agg_groups > 0,
            "{} received an unexpected aggregated group",
            self.id
        );

        self.total_agg_blocks += group.num_blocks();
        let group_id = self.total_agg_groups;
        assert!(!self.agg_block_groups.contains_key(&group_id));
        self.parent_threads.push(group.parent_thread);
        self.agg_block_groups.insert(group_id, group);
        self.total_agg_groups += 1;
        log::debug!(
            "{} add aggregated group {} ({} groups)",
            self.id,
            group_id,
            self.total_agg_groups
        );

        let threads_per_block = self.threads_per_cta();
        self.block_state = (0..self.num_blocks())
            .map(|i| BlockState::new(Dim::new(i as u32, 0, 0), threads_per_block))
            .collect();

        self.unissued_agg_groups -= 1;
    }

    /// Releases the metadata and parameter buffers of all aggregated groups.
    pub fn destroy_agg_block_groups(
        &mut self,
        config: &config::GPU,
        resources: &mut resources::ResourceAccounting,
    ) {
        let footprint = resources.child_param_footprint(config, self.entry.args_aligned_size);
        for (group_id, group) in std::mem::take(&mut self.agg_block_groups) {
            log::debug!(
                "{} release aggregated group {} ({:?})",
                self.id,
                group_id,
                group.kernel_queue_entry
            );
            resources.release_queue_entry(group.kernel_queue_entry, false);
            resources.release_param_size(footprint);
        }
    }

    fn agg_block_group(&self, group_id: usize) -> &AggregatedBlockGroup {
        self.agg_block_groups
            .get(&group_id)
            .unwrap_or_else(|| panic!("{} has no aggregated group {group_id}", self.id))
    }

    #[must_use]
    pub fn agg_dim(&self, group_id: usize) -> Dim {
        self.agg_block_group(group_id).agg_dim
    }

    #[must_use]
    pub fn agg_param_mem_base(&self, group_id: usize) -> address {
        self.agg_block_group(group_id).param_mem_base
    }

    #[must_use]
    pub fn kernel_queue_entry(&self, group_id: usize) -> resources::QueueEntry {
        self.agg_block_group(group_id).kernel_queue_entry
    }

    #[must_use]
    pub fn agg_block_groups(&self) -> &std::collections::BTreeMap<usize, AggregatedBlockGroup> {
        &self.agg_block_groups
    }

    #[must_use]
    pub fn total_agg_groups(&self) -> usize {
        self.total_agg_groups
    }

    /// Group of the next block to dispatch.
    #[must_use]
    pub fn next_group(&self) -> BlockGroup {
        self.next_group
    }
}
