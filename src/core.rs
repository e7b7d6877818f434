use super::{
    address, config,
    instruction::{Reconvergence, WarpInstruction},
    register_set::{self, Access},
    simt_stack::{self, SimtStack},
    warp,
};
use bitvec::array::BitArray;
use warp::ToBitString;

/// Architectural state of a single hardware thread.
pub trait ThreadContext {
    /// PC of the next instruction this thread executes.
    fn pc(&self) -> address;

    fn is_done(&self) -> bool;

    /// Return address of the innermost call frame.
    fn return_pc(&self) -> address;

    /// Executes `inst` for this thread in `lane`.
    fn execute(&mut self, inst: &WarpInstruction, lane: usize);
}

/// Decodes the instruction at a given PC.
pub trait InstructionFetch {
    fn fetch(&self, pc: address) -> Option<&WarpInstruction>;
}

/// Called after every active lane executed an instruction.
///
/// Used to detect thread exits and barriers.
pub trait ExecutionStatusHook<T> {
    fn check_execution_status_and_update(
        &mut self,
        inst: &WarpInstruction,
        lane: usize,
        hw_tid: usize,
        thread: &mut T,
    );
}

impl<T, F> ExecutionStatusHook<T> for F
where
    F: FnMut(&WarpInstruction, usize, usize, &mut T),
{
    fn check_execution_status_and_update(
        &mut self,
        inst: &WarpInstruction,
        lane: usize,
        hw_tid: usize,
        thread: &mut T,
    ) {
        self(inst, lane, hw_tid, thread);
    }
}

/// Drives the threads and divergence stacks of a SIMT core.
#[derive(Debug)]
pub struct Core<T> {
    pub warp_size: usize,
    pub warp_count: usize,
    /// Hardware threads, indexed by `warp_id * warp_size + lane`.
    pub threads: Vec<Option<T>>,
    /// Issued instructions waiting for execution.
    pub issue_reg: register_set::RegisterSet,
    simt_stacks: Vec<SimtStack>,
    max_barriers_per_block: usize,
    reduction_storage: Box<[u32]>,
}

impl<T> Core<T>
where
    T: ThreadContext,
{
    #[must_use]
    pub fn new(config: &config::GPU) -> Self {
        let warp_size = config.warp_size;
        let warp_count = config.max_threads_per_core.div_ceil(warp_size);
        assert!(warp_count * warp_size > 0);

        let threads = (0..warp_count * warp_size).map(|_| None).collect();
        let reduction_storage =
            vec![0; config.max_concurrent_blocks_per_core * config.max_barriers_per_block]
                .into_boxed_slice();

        let mut core = Self {
            warp_size,
            warp_count,
            threads,
            issue_reg: register_set::RegisterSet::new(config.issue_width, 0),
            simt_stacks: Vec::new(),
            max_barriers_per_block: config.max_barriers_per_block,
            reduction_storage,
        };
        core.initialize_simt_stacks(warp_count, warp_size);
        core
    }

    pub fn initialize_simt_stacks(&mut self, warp_count: usize, warp_size: usize) {
        self.simt_stacks = (0..warp_count)
            .map(|warp_id| SimtStack::new(warp_id, warp_size))
            .collect();
        self.warp_size = warp_size;
        self.warp_count = warp_count;
    }

    pub fn delete_simt_stacks(&mut self) {
        self.simt_stacks.clear();
    }

    #[must_use]
    pub fn simt_stack(&self, warp_id: usize) -> &SimtStack {
        &self.simt_stacks[warp_id]
    }

    pub fn simt_stack_mut(&mut self, warp_id: usize) -> &mut SimtStack {
        &mut self.simt_stacks[warp_id]
    }

    pub fn set_thread(&mut self, hw_tid: usize, thread: T) {
        self.threads[hw_tid] = Some(thread);
    }

    pub fn take_thread(&mut self, hw_tid: usize) -> Option<T> {
        self.threads[hw_tid].take()
    }

    #[must_use]
    pub fn thread(&self, hw_tid: usize) -> Option<&T> {
        self.threads.get(hw_tid).and_then(Option::as_ref)
    }

    /// Executes the active lanes of `inst`.
    ///
    /// Without an explicit `warp_id`, the warp that issued the instruction is used.
    pub fn execute_warp_inst(
        &mut self,
        inst: &WarpInstruction,
        warp_id: Option<usize>,
        hook: &mut impl ExecutionStatusHook<T>,
    ) {
        let warp_id = warp_id.unwrap_or(inst.warp_id);
        for lane in 0..self.warp_size {
            if !inst.is_active(lane) {
                continue;
            }
            let hw_tid = self.warp_size * warp_id + lane;
            let Some(thread) = self.threads[hw_tid].as_mut() else {
                panic!("{inst} is active in lane {lane} of warp {warp_id} without a thread");
            };
            thread.execute(inst, lane);
            hook.check_execution_status_and_update(inst, lane, hw_tid, thread);
        }
    }

    #[must_use]
    pub fn thread_done(&self, hw_tid: usize) -> bool {
        self.threads[hw_tid]
            .as_ref()
            .map_or(true, ThreadContext::is_done)
    }

    /// Feeds the next PCs of all threads of `warp_id` into its divergence stack.
    pub fn update_simt_stack(
        &mut self,
        warp_id: usize,
        inst: &mut WarpInstruction,
        cycle: u64,
        stats: &mut stats::Stats,
    ) {
        let mut thread_done: warp::ActiveMask = BitArray::ZERO;
        let mut next_pc = Vec::with_capacity(self.warp_size);
        let wtid = warp_id * self.warp_size;
        for lane in 0..self.warp_size {
            let hw_tid = wtid + lane;
            match self.threads[hw_tid].as_ref() {
                Some(thread) if !thread.is_done() => {
                    if inst.reconvergence_pc == Reconvergence::Return {
                        inst.reconvergence_pc = Reconvergence::At(thread.return_pc());
                    }
                    next_pc.push(thread.pc());
                }
                _ => {
                    thread_done.set(lane, true);
                    next_pc.push(simt_stack::NULL_PC);
                }
            }
        }

        let recvg_pc = match inst.reconvergence_pc {
            Reconvergence::At(pc) => Some(pc),
            Reconvergence::None | Reconvergence::Return => None,
        };
        log::trace!(
            "update simt stack of warp {} after {} (done={})",
            warp_id,
            inst,
            thread_done[..self.warp_size].to_bit_string()
        );
        self.simt_stacks[warp_id].update(
            &thread_done,
            &next_pc,
            recvg_pc,
            inst.opcode,
            inst.instr_size,
            inst.pc,
            cycle,
            stats,
        );
    }

    /// Fetches the instruction at the top of the warp's divergence stack.
    #[must_use]
    pub fn get_execute_warp(
        &self,
        warp_id: usize,
        fetch: &impl InstructionFetch,
    ) -> Option<WarpInstruction> {
        let stack = &self.simt_stacks[warp_id];
        let (pc, _) = stack.top_info();
        let mut inst = fetch.fetch(pc)?.clone();
        inst.set_active(*stack.active_mask());
        Some(inst)
    }

    /// Issues the instruction at the top of the warp's divergence stack
    /// into a free issue register.
    ///
    /// Returns `false` if the issue stage is full or nothing can be fetched.
    pub fn issue_warp(
        &mut self,
        warp_id: usize,
        fetch: &impl InstructionFetch,
        cycle: u64,
        is_child: bool,
    ) -> bool {
        if !self.issue_reg.has_free() {
            return false;
        }
        let Some(mut inst) = self.get_execute_warp(warp_id, fetch) else {
            return false;
        };
        inst.issue(inst.active_mask, warp_id, cycle, warp_id, is_child);
        log::debug!("cycle {:02} issue {} for warp {}", cycle, inst, warp_id);
        self.issue_reg.move_in_from(Some(inst));
        true
    }

    /// Executes the oldest issued instruction and updates the divergence
    /// stack of its warp.
    pub fn execute_issued(
        &mut self,
        cycle: u64,
        hook: &mut impl ExecutionStatusHook<T>,
        stats: &mut stats::Stats,
    ) -> Option<WarpInstruction> {
        if !self.issue_reg.has_ready() {
            return None;
        }
        let mut ready = None;
        self.issue_reg.move_out_to(&mut ready);
        let mut inst = ready?;
        self.execute_warp_inst(&inst, None, hook);
        self.update_simt_stack(inst.warp_id, &mut inst, cycle, stats);
        Some(inst)
    }

    #[must_use]
    pub fn pdom_stack_top_info(&self, warp_id: usize) -> (address, Option<address>) {
        self.simt_stacks[warp_id].top_info()
    }

    fn reduction_slot(&mut self, block_id: usize, barrier_id: usize) -> &mut u32 {
        assert!(
            barrier_id < self.max_barriers_per_block,
            "barrier {barrier_id} exceeds maximum of {}",
            self.max_barriers_per_block
        );
        &mut self.reduction_storage[block_id * self.max_barriers_per_block + barrier_id]
    }

    pub fn and_reduction(&mut self, block_id: usize, barrier_id: usize, value: bool) {
        *self.reduction_slot(block_id, barrier_id) &= u32::from(value);
    }

    pub fn or_reduction(&mut self, block_id: usize, barrier_id: usize, value: bool) {
        *self.reduction_slot(block_id, barrier_id) |= u32::from(value);
    }

    pub fn popc_reduction(&mut self, block_id: usize, barrier_id: usize, value: bool) {
        *self.reduction_slot(block_id, barrier_id) += u32::from(value);
    }

    #[must_use]
    pub fn reduction_value(&self, block_id: usize, barrier_id: usize) -> u32 {
        self.reduction_storage[block_id * self.max_barriers_per_block + barrier_id]
    }

    pub fn reset_reduction(&mut self, block_id: usize, barrier_id: usize) {
        *self.reduction_slot(block_id, barrier_id) = 0;
    }
}
