pub mod aggregation;
pub mod block;
pub mod registry;

pub use aggregation::AggregatedBlockGroup;
pub use block::BlockState;
pub use registry::KernelRegistry;

use crate::{
    address, config,
    dim::Dim,
    resources,
    streams::{StreamId, StreamManager},
};
use std::collections::BTreeMap;
use std::sync::atomic::{self, AtomicU64};

static NEXT_KERNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "kernel({})", self.0)
    }
}

/// Entry point of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelEntry {
    pub name: String,
    /// Size of the kernel arguments after alignment.
    pub args_aligned_size: u64,
}

impl KernelEntry {
    pub fn new(name: impl Into<String>, args_aligned_size: u64) -> Self {
        Self {
            name: name.into(),
            args_aligned_size,
        }
    }
}

/// Group of blocks a block belongs to.
///
/// Native blocks are dispatched before any aggregated group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockGroup {
    Native,
    Aggregated(usize),
}

impl BlockGroup {
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Native => Self::Aggregated(0),
            Self::Aggregated(id) => Self::Aggregated(id + 1),
        }
    }
}

impl std::fmt::Display for BlockGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Aggregated(id) => write!(f, "group {id}"),
        }
    }
}

/// Block of a block group that owns streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtaStreamKey {
    pub group: BlockGroup,
    pub block: Dim,
}

impl Ord for CtaStreamKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let key = |k: &Self| (k.group, k.block.z, k.block.y, k.block.x);
        key(self).cmp(&key(other))
    }
}

impl PartialOrd for CtaStreamKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Position of a launching thread inside its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParentThread {
    pub block_idx: usize,
    pub thread_idx: usize,
}

/// Thread of the parent kernel that launched a child kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParentInfo {
    pub kernel: KernelId,
    pub group: BlockGroup,
    pub block: Dim,
    pub thread: Dim,
    pub block_idx: usize,
    pub thread_idx: usize,
}

impl ParentInfo {
    #[must_use]
    pub fn parent_thread(&self) -> ParentThread {
        ParentThread {
            block_idx: self.block_idx,
            thread_idx: self.thread_idx,
        }
    }
}

impl std::fmt::Display for ParentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "parent {} ({}, block {}, thread {})",
            self.kernel, self.group, self.block, self.thread
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("{stream} is not owned by block {block} of {group}")]
    NotOwned {
        stream: StreamId,
        group: BlockGroup,
        block: Dim,
    },
}

/// A launched grid of blocks and its execution state.
#[derive(Clone)]
pub struct Kernel {
    pub id: KernelId,
    pub entry: KernelEntry,
    grid_dim: Dim,
    block_dim: Dim,
    next_cta: Dim,
    next_tid: Dim,
    next_group: BlockGroup,
    num_cores_running: usize,
    /// Number of threads of this kernel that are still alive.
    pub active_threads: usize,
    pub param_mem_base: address,

    pub parent: Option<ParentInfo>,
    /// Launching threads of aggregated or coalesced launches.
    pub parent_threads: Vec<ParentThread>,
    pub children: Vec<KernelId>,
    cta_streams: BTreeMap<CtaStreamKey, Vec<StreamId>>,

    agg_block_groups: BTreeMap<usize, AggregatedBlockGroup>,
    total_agg_groups: usize,
    total_agg_blocks: usize,
    /// Aggregated groups that are expected but did not arrive yet.
    pub unissued_agg_groups: usize,

    /// Launched from device code.
    pub is_child: bool,
    /// Parent blocks wait for this kernel to finish.
    pub parent_child_dependency: bool,
    /// Number of coalesced launches sharing this kernel.
    pub metadata_count: u64,
    /// Metadata slots of coalesced launches.
    pub kernel_queue_entries: Vec<resources::QueueEntry>,

    block_state: Vec<BlockState>,
    pub preswitch_list: Vec<usize>,
    pub switching_list: Vec<usize>,
    pub preempted_list: Vec<usize>,

    pub launch_cycle: u64,
    pub start_cycle: u64,
    pub end_cycle: u64,
    pub launch_latency: u64,
    pub next_dispatchable_cycle: u64,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.entry.name)
            .field("id", &self.id)
            .field("grid", &self.grid_dim.to_string())
            .field("block", &self.block_dim.to_string())
            .field("running", &self.num_cores_running)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.entry.name)
            .field("id", &self.id.0)
            .finish()
    }
}

fn native_block_state(grid_dim: &Dim, block_dim: &Dim) -> Vec<BlockState> {
    let threads_per_block = block_dim.size() as usize;
    let mut blocks = Vec::with_capacity(grid_dim.size() as usize);
    if grid_dim.size() == 0 {
        return blocks;
    }
    let mut id = Dim::ZERO;
    loop {
        blocks.push(BlockState::new(id, threads_per_block));
        if id.increment_x_then_y_then_z(grid_dim) {
            break;
        }
    }
    blocks
}

impl Kernel {
    #[must_use]
    pub fn new(grid_dim: Dim, block_dim: Dim, entry: KernelEntry, config: &config::GPU) -> Self {
        let id = KernelId(NEXT_KERNEL_ID.fetch_add(1, atomic::Ordering::SeqCst));
        let block_state = native_block_state(&grid_dim, &block_dim);
        log::debug!(
            "create {} ({}) with grid {} and block {}",
            id,
            entry.name,
            grid_dim,
            block_dim
        );
        Self {
            id,
            entry,
            grid_dim,
            block_dim,
            next_cta: Dim::ZERO,
            next_tid: Dim::ZERO,
            next_group: BlockGroup::Native,
            num_cores_running: 0,
            active_threads: 0,
            param_mem_base: 0,
            parent: None,
            parent_threads: Vec::new(),
            children: Vec::new(),
            cta_streams: BTreeMap::new(),
            agg_block_groups: BTreeMap::new(),
            total_agg_groups: 0,
            total_agg_blocks: 0,
            unissued_agg_groups: 0,
            is_child: false,
            parent_child_dependency: false,
            metadata_count: 1,
            kernel_queue_entries: Vec::new(),
            block_state,
            preswitch_list: Vec::new(),
            switching_list: Vec::new(),
            preempted_list: Vec::new(),
            launch_cycle: 0,
            start_cycle: 0,
            end_cycle: 0,
            launch_latency: config.kernel_launch_latency,
            next_dispatchable_cycle: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn inc_running(&mut self) {
        self.num_cores_running += 1;
    }

    pub fn dec_running(&mut self) {
        assert!(
            self.num_cores_running > 0,
            "{} is not running on any core",
            self.id
        );
        self.num_cores_running -= 1;
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.num_cores_running > 0
    }

    #[must_use]
    pub fn num_cores_running(&self) -> usize {
        self.num_cores_running
    }

    /// All blocks were dispatched and none is running or preempted.
    #[must_use]
    pub fn done(&self) -> bool {
        self.no_more_ctas_to_run() && !self.running() && self.preempted_list.is_empty()
    }

    /// Native and aggregated blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.grid_dim.size() as usize + self.total_agg_blocks
    }

    #[must_use]
    pub fn threads_per_cta(&self) -> usize {
        self.block_dim.size() as usize
    }

    #[must_use]
    pub fn grid_dim(&self, group: BlockGroup) -> Dim {
        match group {
            BlockGroup::Native => self.grid_dim,
            BlockGroup::Aggregated(id) => self.agg_dim(id),
        }
    }

    pub fn set_grid_dim(&mut self, grid_dim: Dim) {
        self.grid_dim = grid_dim;
    }

    #[must_use]
    pub fn cta_dim(&self) -> Dim {
        self.block_dim
    }

    #[must_use]
    pub fn next_cta_id(&self) -> Dim {
        self.next_cta
    }

    /// Advances the dispatch cursor to the next block.
    ///
    /// After the last block of a group, the cursor moves on to the next group.
    pub fn increment_cta_id(
        &mut self,
        config: &config::GPU,
        resources: &mut resources::ResourceAccounting,
    ) {
        let next_grid_dim = self.grid_dim(self.next_group);
        if self.next_cta.increment_x_then_y_then_z(&next_grid_dim) {
            self.next_group = self.next_group.next();
            self.next_cta = Dim::ZERO;
            log::debug!(
                "{} overbound, next group {} of {} aggregated groups",
                self.id,
                self.next_group,
                self.total_agg_groups
            );

            if config.dcc_kernel_param_onchip && self.is_child {
                resources.param_buffer.release_kernel_entry();
            }
        }
        self.next_tid = Dim::ZERO;
    }

    #[must_use]
    pub fn no_more_ctas_to_run(&self) -> bool {
        match self.next_group {
            BlockGroup::Native => false,
            BlockGroup::Aggregated(id) => id >= self.total_agg_groups,
        }
    }

    pub fn increment_thread_id(&mut self) {
        self.next_tid.increment_x_then_y_then_z(&self.block_dim);
    }

    #[must_use]
    pub fn next_thread_id_3d(&self) -> Dim {
        self.next_tid
    }

    #[must_use]
    pub fn next_thread_id(&self) -> usize {
        self.next_tid.linear_index(&self.block_dim) as usize
    }

    #[must_use]
    pub fn next_block_id(&self) -> usize {
        self.next_cta.linear_index(&self.grid_dim) as usize
    }

    #[must_use]
    pub fn more_threads_in_cta(&self) -> bool {
        !self.next_tid.exceeds(&self.block_dim)
    }

    #[must_use]
    pub fn last_block(&self) -> bool {
        self.next_cta.x + 1 == self.grid_dim.x
            && self.next_cta.y + 1 == self.grid_dim.y
            && self.next_cta.z + 1 == self.grid_dim.z
    }

    /// Global index of a native block.
    #[must_use]
    pub fn find_block_idx(&self, block_id: &Dim) -> usize {
        block_id.linear_index(&self.grid_dim) as usize
    }

    /// Rebuilds the block state of the native grid.
    pub fn reset_block_state(&mut self) {
        self.block_state = native_block_state(&self.grid_dim, &self.block_dim);
        self.next_cta = Dim::ZERO;
    }

    #[must_use]
    pub fn param_mem_base(&self, group: BlockGroup) -> address {
        match group {
            BlockGroup::Native => self.param_mem_base,
            BlockGroup::Aggregated(id) => self.agg_param_mem_base(id),
        }
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn parent_info(&self) -> Option<&ParentInfo> {
        self.parent.as_ref()
    }

    /// Default stream of a block, created on first use.
    pub fn default_stream_cta(
        &mut self,
        group: BlockGroup,
        block: Dim,
        streams: &mut StreamManager,
    ) -> StreamId {
        let key = CtaStreamKey { group, block };
        if let Some(cta_streams) = self.cta_streams.get(&key) {
            return *cta_streams
                .first()
                .unwrap_or_else(|| panic!("block {block} of {group} lost its default stream"));
        }
        let stream = streams.add_stream();
        self.cta_streams.insert(key, vec![stream]);
        stream
    }

    /// Creates an additional stream for a block.
    ///
    /// The block must already own its default stream.
    pub fn create_stream_cta(
        &mut self,
        group: BlockGroup,
        block: Dim,
        streams: &mut StreamManager,
    ) -> StreamId {
        let key = CtaStreamKey { group, block };
        let cta_streams = self.cta_streams.get_mut(&key);
        let Some(cta_streams) = cta_streams.filter(|s| !s.is_empty()) else {
            panic!("block {block} of {group} has no default stream");
        };
        let stream = streams.add_stream();
        cta_streams.push(stream);
        stream
    }

    pub fn delete_stream_cta(
        &mut self,
        group: BlockGroup,
        block: Dim,
        stream: StreamId,
        streams: &mut StreamManager,
    ) -> Result<(), StreamError> {
        let key = CtaStreamKey { group, block };
        let cta_streams = self.cta_streams.get_mut(&key);
        let pos = cta_streams
            .as_ref()
            .and_then(|s| s.iter().position(|s| *s == stream));
        match (cta_streams, pos) {
            (Some(cta_streams), Some(pos)) => {
                cta_streams.remove(pos);
                streams.destroy_stream(stream);
                Ok(())
            }
            _ => Err(StreamError::NotOwned {
                stream,
                group,
                block,
            }),
        }
    }

    #[must_use]
    pub fn cta_has_stream(&self, group: BlockGroup, block: Dim, stream: StreamId) -> bool {
        self.cta_streams
            .get(&CtaStreamKey { group, block })
            .is_some_and(|s| s.contains(&stream))
    }

    /// Destroys all streams owned by blocks of this kernel.
    pub fn destroy_cta_streams(&mut self, streams: &mut StreamManager) {
        let mut num_streams = 0;
        for (_, cta_streams) in std::mem::take(&mut self.cta_streams) {
            num_streams += cta_streams.len();
            for stream in cta_streams {
                streams.destroy_stream(stream);
            }
        }
        log::debug!("destroy {} streams of {}", num_streams, self.id);
    }

    /// Releases everything this kernel holds.
    pub fn destroy(
        &mut self,
        config: &config::GPU,
        resources: &mut resources::ResourceAccounting,
        streams: &mut StreamManager,
    ) {
        assert_eq!(
            self.active_threads, 0,
            "destroying {} with active threads",
            self.id
        );
        self.destroy_cta_streams(streams);
        self.destroy_agg_block_groups(config, resources);

        if config.child_launch == config::ChildLaunchModel::Dkc {
            for entry in std::mem::take(&mut self.kernel_queue_entries) {
                resources.release_queue_entry(entry, true);
            }
            log::debug!(
                "coalesced {} ends, kernel queue used={} running={}",
                self.id,
                resources.kernel_queue.used,
                resources.kernel_queue.running
            );
        }
    }
}
