use super::ParentThread;
use crate::dim::Dim;
use bitvec::vec::BitVec;

/// Scheduling state of a single block of a kernel.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockState {
    /// Global id of this block.
    pub block_id: Dim,
    pub issued: bool,
    pub done: bool,
    /// Temporarily descheduled.
    pub switched: bool,
    /// Descheduled while waiting for child kernels.
    pub preempted: bool,
    /// Eligible to be issued again after all children finished.
    pub reissue: bool,
    pub time_stamp_switching: u64,
    pub time_stamp_switching_issue: u64,
    /// Per-thread child dependency bits.
    ///
    /// A cleared bit marks a thread waiting for a child kernel.
    pub threads: BitVec,
    pub devsynced: bool,
}

impl std::fmt::Debug for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlockState")
            .field("block_id", &self.block_id.to_string())
            .field("issued", &self.issued)
            .field("done", &self.done)
            .field("switched", &self.switched)
            .field("preempted", &self.preempted)
            .field("reissue", &self.reissue)
            .field("pending_threads", &self.threads.count_zeros())
            .finish_non_exhaustive()
    }
}

impl BlockState {
    #[must_use]
    pub fn new(block_id: Dim, threads_per_block: usize) -> Self {
        Self {
            block_id,
            issued: false,
            done: false,
            switched: false,
            preempted: false,
            reissue: false,
            time_stamp_switching: 0,
            time_stamp_switching_issue: 0,
            threads: BitVec::repeat(true, threads_per_block),
            devsynced: false,
        }
    }

    /// Whether no thread of this block waits for a child kernel.
    #[must_use]
    pub fn children_finished(&self) -> bool {
        self.threads.all()
    }
}

impl super::Kernel {
    fn block_mut(&mut self, block_idx: usize) -> &mut BlockState {
        let num_blocks = self.block_state.len();
        self.block_state
            .get_mut(block_idx)
            .unwrap_or_else(|| panic!("block {block_idx} out of range ({num_blocks} blocks)"))
    }

    #[must_use]
    pub fn block(&self, block_idx: usize) -> &BlockState {
        let num_blocks = self.block_state.len();
        self.block_state
            .get(block_idx)
            .unwrap_or_else(|| panic!("block {block_idx} out of range ({num_blocks} blocks)"))
    }

    #[must_use]
    pub fn block_states(&self) -> &[BlockState] {
        &self.block_state
    }

    pub fn issue_block(&mut self, block_idx: usize) {
        let block = self.block_mut(block_idx);
        assert!(!block.done, "issuing finished block {block_idx}");
        block.issued = true;
    }

    pub fn block_done(&mut self, block_idx: usize) {
        let block = self.block_mut(block_idx);
        assert!(block.issued, "block {block_idx} finished without being issued");
        block.done = true;
        log::debug!("{}: block {} done", self.id, block_idx);
    }

    /// Marks `thread_idx` of `block_idx` as waiting for a child kernel.
    pub fn set_child_pending(&mut self, block_idx: usize, thread_idx: usize) {
        self.block_mut(block_idx).threads.set(thread_idx, false);
    }

    /// Records that the child kernel launched by `thread` finished.
    ///
    /// Once no thread of the block waits anymore, a preempted block becomes
    /// eligible for reissue and a block still switching out is kept on its core.
    pub fn child_finished(&mut self, thread: ParentThread, child_aware: bool) {
        let ParentThread {
            block_idx,
            thread_idx,
        } = thread;
        let id = self.id;
        let block = self.block_mut(block_idx);
        block.threads.set(thread_idx, true);
        if !block.children_finished() {
            return;
        }

        if child_aware {
            if block.switched {
                block.switched = false;
                log::debug!("{}: block {} no longer switched", id, block_idx);
            }
            return;
        }

        if block.preempted {
            block.reissue = true;
            log::debug!("{}: block {} ready for reissue", id, block_idx);
        } else if block.switched {
            block.switched = false;
            self.switching_list.retain(|idx| *idx != block_idx);
            self.preswitch_list.retain(|idx| *idx != block_idx);
            log::debug!("{}: block {} switch cancelled", id, block_idx);
        }
    }

    /// Starts switching `block_idx` out of its core.
    pub fn switch_out_block(&mut self, block_idx: usize, cycle: u64) {
        let block = self.block_mut(block_idx);
        block.switched = true;
        block.time_stamp_switching = cycle;
        if !self.switching_list.contains(&block_idx) {
            self.switching_list.push(block_idx);
        }
    }

    /// Marks `block_idx` as a candidate for switching out.
    pub fn preswitch_block(&mut self, block_idx: usize) {
        if !self.preswitch_list.contains(&block_idx) {
            self.preswitch_list.push(block_idx);
        }
    }

    /// Completes switching out `block_idx`.
    pub fn preempt_block(&mut self, block_idx: usize) {
        let block = self.block_mut(block_idx);
        block.preempted = true;
        self.switching_list.retain(|idx| *idx != block_idx);
        self.preswitch_list.retain(|idx| *idx != block_idx);
        if !self.preempted_list.contains(&block_idx) {
            self.preempted_list.push(block_idx);
        }
        log::debug!("{}: block {} preempted", self.id, block_idx);
    }

    /// Issues a preempted block again.
    pub fn resume_block(&mut self, block_idx: usize, cycle: u64) {
        let block = self.block_mut(block_idx);
        assert!(block.preempted, "resuming block {block_idx} that was not preempted");
        block.preempted = false;
        block.reissue = false;
        block.switched = false;
        block.time_stamp_switching_issue = cycle;
        self.preempted_list.retain(|idx| *idx != block_idx);
    }
}
