use crate::kernel::KernelId;
use std::collections::{HashSet, VecDeque};

/// Identifier of a device-side stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "stream({})", self.0)
    }
}

/// Registry of live streams and of kernels with a newly finished child.
#[derive(Debug, Default)]
pub struct StreamManager {
    next_id: u64,
    streams: HashSet<StreamId>,
    busy_streams: HashSet<StreamId>,
    finished_kernels: VecDeque<KernelId>,
}

impl StreamManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&mut self) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;
        self.streams.insert(id);
        log::trace!("add {} ({} live)", id, self.streams.len());
        id
    }

    pub fn destroy_stream(&mut self, id: StreamId) {
        self.busy_streams.remove(&id);
        if !self.streams.remove(&id) {
            log::warn!("destroying unknown {}", id);
        }
        log::trace!("destroy {} ({} live)", id, self.streams.len());
    }

    #[must_use]
    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains(&id)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn reserve_stream(&mut self, id: StreamId) {
        self.busy_streams.insert(id);
    }

    pub fn release_stream(&mut self, id: StreamId) {
        self.busy_streams.remove(&id);
    }

    #[must_use]
    pub fn is_busy(&self, id: StreamId) -> bool {
        self.busy_streams.contains(&id)
    }

    /// Records that a child of `kernel` finished.
    pub fn register_finished_kernel(&mut self, kernel: KernelId) {
        self.finished_kernels.push_back(kernel);
    }

    pub fn pop_finished_kernel(&mut self) -> Option<KernelId> {
        self.finished_kernels.pop_front()
    }

    pub fn finished_kernels(&self) -> impl Iterator<Item = &KernelId> + '_ {
        self.finished_kernels.iter()
    }
}
