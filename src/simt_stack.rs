use super::{address, opcodes::ArchOp, warp::ActiveMask};
use bitvec::array::BitArray;
use std::collections::BTreeMap;

/// PC of an entry that has not been assigned yet.
pub const NULL_PC: address = address::MAX;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    #[default]
    Normal,
    Call,
}

/// Entry of the reconvergence stack.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub pc: address,
    pub call_depth: usize,
    pub active_mask: ActiveMask,
    /// Reconvergence PC, if any.
    pub reconvergence_pc: Option<address>,
    /// Cycle at which the entry was last turned into a divergence point.
    pub branch_div_cycle: u64,
    pub kind: EntryKind,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            pc: NULL_PC,
            call_depth: 0,
            active_mask: BitArray::ZERO,
            reconvergence_pc: None,
            branch_div_cycle: 0,
            kind: EntryKind::Normal,
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use crate::warp::ToBitString;
        f.debug_struct("Entry")
            .field("pc", &self.pc)
            .field("rpc", &self.reconvergence_pc)
            .field("mask", &self.active_mask[..].to_bit_string())
            .field("kind", &self.kind)
            .field("call_depth", &self.call_depth)
            .finish()
    }
}

/// Immediate post-dominator reconvergence stack of a single warp.
///
/// The top of the stack holds the PC and active mask the warp executes next.
#[derive(Debug, Clone)]
pub struct SimtStack {
    warp_id: usize,
    warp_size: usize,
    stack: Vec<Entry>,
}

impl SimtStack {
    #[must_use]
    pub fn new(warp_id: usize, warp_size: usize) -> Self {
        assert!(warp_size <= crate::warp::MAX_WARP_SIZE);
        Self {
            warp_id,
            warp_size,
            stack: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Starts the warp at `start_pc` with `active_mask`.
    pub fn launch(&mut self, start_pc: address, active_mask: ActiveMask) {
        self.reset();
        self.stack.push(Entry {
            pc: start_pc,
            call_depth: 1,
            active_mask,
            kind: EntryKind::Normal,
            ..Entry::default()
        });
    }

    fn top(&self) -> &Entry {
        self.stack.last().expect("simt stack is empty")
    }

    fn top_mut(&mut self) -> &mut Entry {
        self.stack.last_mut().expect("simt stack is empty")
    }

    #[must_use]
    pub fn active_mask(&self) -> &ActiveMask {
        &self.top().active_mask
    }

    /// PC and reconvergence PC at the top of the stack.
    #[must_use]
    pub fn top_info(&self) -> (address, Option<address>) {
        let top = self.top();
        (top.pc, top.reconvergence_pc)
    }

    #[must_use]
    pub fn rp(&self) -> Option<address> {
        self.top().reconvergence_pc
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.stack
    }

    #[must_use]
    pub fn warp_id(&self) -> usize {
        self.warp_id
    }

    /// Updates the stack after the instruction at the top was executed.
    ///
    /// Threads set in `thread_done` are retired. The remaining active threads
    /// are grouped by `next_pc` and pushed as divergent paths that reconverge
    /// at `recvg_pc`.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        thread_done: &ActiveMask,
        next_pc: &[address],
        recvg_pc: Option<address>,
        next_inst_op: ArchOp,
        next_inst_size: u32,
        next_inst_pc: address,
        cycle: u64,
        stats: &mut stats::Stats,
    ) {
        assert_eq!(next_pc.len(), self.warp_size);

        let top = self.top();
        let mut top_active_mask = top.active_mask;
        let top_recvg_pc = top.reconvergence_pc;
        let top_pc = top.pc;
        let top_kind = top.kind;
        assert_eq!(
            top_pc, next_inst_pc,
            "warp {} executed {:#x} but stack top is at {:#x}",
            self.warp_id, next_inst_pc, top_pc
        );
        assert!(
            top_active_mask.any(),
            "warp {} has an empty active mask",
            self.warp_id
        );

        // group active threads by their next pc
        let mut divergent_paths: BTreeMap<address, ActiveMask> = BTreeMap::new();
        while top_active_mask.any() {
            let mut tmp_next_pc = None;
            let mut tmp_active_mask: ActiveMask = BitArray::ZERO;
            for lane in (0..self.warp_size).rev() {
                if !top_active_mask[lane] {
                    continue;
                }
                if thread_done[lane] {
                    top_active_mask.set(lane, false);
                } else if tmp_next_pc.is_none() || tmp_next_pc == Some(next_pc[lane]) {
                    tmp_next_pc = Some(next_pc[lane]);
                    tmp_active_mask.set(lane, true);
                    top_active_mask.set(lane, false);
                }
            }

            let Some(tmp_next_pc) = tmp_next_pc else {
                debug_assert!(top_active_mask.not_any());
                continue;
            };
            divergent_paths.insert(tmp_next_pc, tmp_active_mask);
        }

        let num_divergent_paths = divergent_paths.len();
        assert!(
            num_divergent_paths <= 2,
            "warp {} diverged into {} paths",
            self.warp_id,
            num_divergent_paths
        );

        let not_taken_pc = next_inst_pc + address::from(next_inst_size);
        let mut warp_diverged = false;
        let mut new_recvg_pc = None;

        for i in 0..num_divergent_paths {
            let (tmp_next_pc, tmp_active_mask) =
                if let Some(mask) = divergent_paths.remove(&not_taken_pc) {
                    assert_eq!(i, 0);
                    (not_taken_pc, mask)
                } else {
                    divergent_paths.pop_first().expect("divergent path")
                };

            match next_inst_op {
                ArchOp::CALL_OPS => {
                    assert_eq!(num_divergent_paths, 1, "divergent call");
                    self.stack.push(Entry {
                        pc: tmp_next_pc,
                        active_mask: tmp_active_mask,
                        branch_div_cycle: cycle,
                        kind: EntryKind::Call,
                        ..Entry::default()
                    });
                    return;
                }
                ArchOp::RET_OPS if top_kind == EntryKind::Call => {
                    assert_eq!(num_divergent_paths, 1, "divergent return");
                    self.stack.pop();
                    let new_top = self.top_mut();
                    new_top.pc = tmp_next_pc;
                    // the caller may reconverge right at the return address
                    if new_top.reconvergence_pc == Some(tmp_next_pc)
                        && new_top.kind != EntryKind::Call
                    {
                        self.stack.pop();
                    }
                    return;
                }
                _ => {}
            }

            if Some(tmp_next_pc) == top_recvg_pc && top_kind != EntryKind::Call {
                continue;
            }

            if num_divergent_paths > 1 && !warp_diverged {
                warp_diverged = true;
                new_recvg_pc = recvg_pc;
                if new_recvg_pc != top_recvg_pc {
                    let top = self.top_mut();
                    top.pc = new_recvg_pc.unwrap_or(NULL_PC);
                    top.branch_div_cycle = cycle;
                    self.stack.push(Entry::default());
                }
            }

            if warp_diverged && Some(tmp_next_pc) == new_recvg_pc {
                continue;
            }

            let top = self.top_mut();
            top.pc = tmp_next_pc;
            top.active_mask = tmp_active_mask;
            if warp_diverged {
                top.call_depth = 0;
                top.reconvergence_pc = new_recvg_pc;
            } else {
                top.reconvergence_pc = top_recvg_pc;
            }
            self.stack.push(Entry::default());
        }

        assert!(!self.stack.is_empty());
        self.stack.pop();

        if warp_diverged {
            log::trace!(
                "warp {} diverged at {:#x} (reconverge at {:?})",
                self.warp_id,
                top_pc,
                new_recvg_pc
            );
            stats.add_warp_divergence(top_pc, 1);
        }
    }
}

impl std::fmt::Display for SimtStack {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (k, entry) in self.stack.iter().enumerate() {
            if k == 0 {
                write!(f, "w{:02} {} ", self.warp_id, k)?;
            } else {
                write!(f, "    {k} ")?;
            }
            for lane in 0..self.warp_size {
                f.write_str(if entry.active_mask[lane] { "1" } else { "0" })?;
            }
            write!(f, " pc: {:#05x}", entry.pc)?;
            let kind = match entry.kind {
                EntryKind::Call => "C",
                EntryKind::Normal => "N",
            };
            match entry.reconvergence_pc {
                None => write!(f, " rp: ---- tp: {} cd: {:>2} ", kind, entry.call_depth)?,
                Some(rpc) => write!(f, " rp: {:>4} tp: {} cd: {:>2} ", rpc, kind, entry.call_depth)?,
            }
            if entry.branch_div_cycle == 0 {
                writeln!(f, " ")?;
            } else {
                writeln!(f, " bd@{:>6} ", entry.branch_div_cycle)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EntryKind, SimtStack};
    use crate::{address, opcodes::ArchOp, warp};
    use bitvec::array::BitArray;
    use pretty_assertions_sorted as diff;

    const WARP_SIZE: usize = 4;

    fn no_threads_done() -> warp::ActiveMask {
        BitArray::ZERO
    }

    fn step(
        stack: &mut SimtStack,
        next_pc: [address; WARP_SIZE],
        recvg_pc: Option<address>,
        op: ArchOp,
        stats: &mut stats::Stats,
    ) {
        let (pc, _) = stack.top_info();
        stack.update(&no_threads_done(), &next_pc, recvg_pc, op, 8, pc, 100, stats);
    }

    fn diverged_stack(stats: &mut stats::Stats) -> SimtStack {
        let mut stack = SimtStack::new(1, WARP_SIZE);
        stack.launch(0x10, warp::full_mask(WARP_SIZE));
        // lanes 0 and 1 fall through, lanes 2 and 3 branch to 0x40
        step(
            &mut stack,
            [0x18, 0x18, 0x40, 0x40],
            Some(0x80),
            ArchOp::BRANCH_OP,
            stats,
        );
        stack
    }

    #[test]
    fn test_launch() {
        let mut stack = SimtStack::new(0, WARP_SIZE);
        assert!(stack.is_empty());
        stack.launch(0x20, warp::full_mask(WARP_SIZE));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top_info(), (0x20, None));
        assert_eq!(stack.entries()[0].call_depth, 1);
        assert_eq!(stack.active_mask().count_ones(), WARP_SIZE);
        stack.reset();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_diverge_and_reconverge() {
        let mut stats = stats::Stats::default();
        let mut stack = diverged_stack(&mut stats);

        let entries = stack.entries();
        diff::assert_eq!(
            entries
                .iter()
                .map(|e| (e.pc, e.reconvergence_pc, e.active_mask))
                .collect::<Vec<_>>(),
            vec![
                (0x80, None, warp::full_mask(WARP_SIZE)),
                (0x18, Some(0x80), warp::mask_from_lanes([0, 1])),
                (0x40, Some(0x80), warp::mask_from_lanes([2, 3])),
            ]
        );
        assert_eq!(entries[0].branch_div_cycle, 100);
        assert_eq!(stats.pc.get(0x10).warp_divergence, 1);

        // sibling masks are disjoint and cover the parent
        let left = entries[1].active_mask;
        let right = entries[2].active_mask;
        assert!((0..WARP_SIZE).all(|lane| !(left[lane] && right[lane])));
        assert_eq!(
            warp::mask_from_lanes(left.iter_ones().chain(right.iter_ones())),
            entries[0].active_mask
        );

        // taken path reaches the reconvergence point
        step(&mut stack, [0, 0, 0x80, 0x80], None, ArchOp::ALU_OP, &mut stats);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top_info(), (0x18, Some(0x80)));

        step(&mut stack, [0x80, 0x80, 0, 0], None, ArchOp::ALU_OP, &mut stats);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top_info(), (0x80, None));
        assert_eq!(stack.active_mask(), &warp::full_mask(WARP_SIZE));
        assert_eq!(stats.pc.get(0x10).warp_divergence, 1);
    }

    #[test]
    fn test_uniform_branch_does_not_diverge() {
        let mut stats = stats::Stats::default();
        let mut stack = SimtStack::new(0, WARP_SIZE);
        stack.launch(0x10, warp::full_mask(WARP_SIZE));
        step(
            &mut stack,
            [0x40; WARP_SIZE],
            Some(0x80),
            ArchOp::BRANCH_OP,
            &mut stats,
        );
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top_info(), (0x40, None));
        assert_eq!(stats.pc.get(0x10).warp_divergence, 0);
    }

    #[test]
    fn test_call_and_return() {
        let mut stats = stats::Stats::default();
        let mut stack = SimtStack::new(0, WARP_SIZE);
        stack.launch(0x0, warp::full_mask(WARP_SIZE));

        step(&mut stack, [0x100; WARP_SIZE], None, ArchOp::CALL_OPS, &mut stats);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.entries()[1].kind, EntryKind::Call);
        assert_eq!(stack.top_info(), (0x100, None));

        step(&mut stack, [0x8; WARP_SIZE], None, ArchOp::RET_OPS, &mut stats);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top_info(), (0x8, None));
        assert_eq!(stack.entries()[0].kind, EntryKind::Normal);
    }

    #[test]
    fn test_return_to_reconvergence_point() {
        let mut stats = stats::Stats::default();
        let mut stack = diverged_stack(&mut stats);
        assert_eq!(stack.len(), 3);

        step(&mut stack, [0, 0, 0x200, 0x200], None, ArchOp::CALL_OPS, &mut stats);
        assert_eq!(stack.len(), 4);

        // returning to 0x80 immediately reconverges the caller's entry
        step(&mut stack, [0, 0, 0x80, 0x80], None, ArchOp::RET_OPS, &mut stats);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top_info(), (0x18, Some(0x80)));
    }

    #[test]
    fn test_all_threads_done_pops_entry() {
        let mut stats = stats::Stats::default();
        let mut stack = diverged_stack(&mut stats);
        let done = warp::mask_from_lanes([2, 3]);
        stack.update(
            &done,
            &[0; WARP_SIZE],
            None,
            ArchOp::ALU_OP,
            8,
            0x40,
            101,
            &mut stats,
        );
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top_info(), (0x18, Some(0x80)));
    }

    #[test]
    #[should_panic(expected = "stack top is at")]
    fn test_pc_mismatch_panics() {
        let mut stats = stats::Stats::default();
        let mut stack = SimtStack::new(0, WARP_SIZE);
        stack.launch(0x10, warp::full_mask(WARP_SIZE));
        stack.update(
            &no_threads_done(),
            &[0x18; WARP_SIZE],
            None,
            ArchOp::ALU_OP,
            8,
            0x20,
            0,
            &mut stats,
        );
    }

    /// Checks that every entry nests inside the entry it reconverges into
    /// and that entries reconverging into the same entry are disjoint.
    fn assert_masks_nest(stack: &SimtStack, launch_mask: &warp::ActiveMask) {
        let entries = stack.entries();
        let subset = |inner: &warp::ActiveMask, outer: &warp::ActiveMask| {
            inner.iter_ones().all(|lane| outer[lane])
        };
        let mut parents = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            assert!(subset(&entry.active_mask, launch_mask), "{stack}");
            if i == 0 {
                parents.push(None);
                continue;
            }
            let parent = entries[..i]
                .iter()
                .rposition(|below| Some(below.pc) == entry.reconvergence_pc);
            assert!(parent.is_some(), "entry {i} has no reconvergence entry\n{stack}");
            let parent = parent.unwrap();
            assert!(
                subset(&entry.active_mask, &entries[parent].active_mask),
                "entry {i} escapes entry {parent}\n{stack}"
            );
            parents.push(Some(parent));
        }
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                if parents[i].is_none() || parents[i] != parents[j] {
                    continue;
                }
                let overlap = entries[i]
                    .active_mask
                    .iter_ones()
                    .any(|lane| entries[j].active_mask[lane]);
                assert!(!overlap, "entries {i} and {j} overlap\n{stack}");
            }
        }
    }

    #[test]
    fn test_masks_stay_nested_across_updates() {
        const LANES: usize = 8;
        let mut stats = stats::Stats::default();
        let launch_mask = warp::full_mask(LANES);
        let mut stack = SimtStack::new(0, LANES);
        stack.launch(0x10, launch_mask);

        let mut step = |stack: &mut SimtStack,
                        done: &[usize],
                        next_pc: [address; LANES],
                        recvg_pc: Option<address>,
                        op: ArchOp| {
            let (pc, _) = stack.top_info();
            let done = warp::mask_from_lanes(done.iter().copied());
            stack.update(&done, &next_pc, recvg_pc, op, 8, pc, 7, &mut stats);
            assert_masks_nest(stack, &launch_mask);
        };

        // lanes 4..8 branch to 0x40
        step(
            &mut stack,
            &[],
            [0x18, 0x18, 0x18, 0x18, 0x40, 0x40, 0x40, 0x40],
            Some(0x80),
            ArchOp::BRANCH_OP,
        );
        assert_eq!(stack.len(), 3);
        assert_eq!(
            warp::mask_from_lanes(
                stack.entries()[1..]
                    .iter()
                    .flat_map(|entry| entry.active_mask.iter_ones())
            ),
            launch_mask
        );

        // nested divergence: lanes 6 and 7 branch to 0x60
        step(
            &mut stack,
            &[],
            [0, 0, 0, 0, 0x48, 0x48, 0x60, 0x60],
            Some(0x70),
            ArchOp::BRANCH_OP,
        );
        diff::assert_eq!(
            stack
                .entries()
                .iter()
                .map(|e| (e.pc, e.reconvergence_pc, e.active_mask.iter_ones().collect::<Vec<_>>()))
                .collect::<Vec<_>>(),
            vec![
                (0x80, None, (0..LANES).collect::<Vec<_>>()),
                (0x18, Some(0x80), vec![0, 1, 2, 3]),
                (0x70, Some(0x80), vec![4, 5, 6, 7]),
                (0x48, Some(0x70), vec![4, 5]),
                (0x60, Some(0x70), vec![6, 7]),
            ]
        );

        // lane 7 exits, lane 6 reaches the inner reconvergence point
        step(
            &mut stack,
            &[7],
            [0, 0, 0, 0, 0, 0, 0x70, 0],
            None,
            ArchOp::ALU_OP,
        );
        assert_eq!(stack.len(), 4);
        assert_eq!(stack.top_info(), (0x48, Some(0x70)));

        step(
            &mut stack,
            &[7],
            [0, 0, 0, 0, 0x50, 0x50, 0, 0],
            None,
            ArchOp::ALU_OP,
        );
        assert_eq!(stack.top_info(), (0x50, Some(0x70)));

        step(
            &mut stack,
            &[7],
            [0, 0, 0, 0, 0x70, 0x70, 0, 0],
            None,
            ArchOp::ALU_OP,
        );
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.top_info(), (0x70, Some(0x80)));

        step(
            &mut stack,
            &[7],
            [0, 0, 0, 0, 0x80, 0x80, 0x80, 0],
            None,
            ArchOp::ALU_OP,
        );
        assert_eq!(stack.top_info(), (0x18, Some(0x80)));

        step(
            &mut stack,
            &[7],
            [0x80, 0x80, 0x80, 0x80, 0, 0, 0, 0],
            None,
            ArchOp::ALU_OP,
        );
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top_info(), (0x80, None));
        assert_eq!(stack.active_mask(), &launch_mask);
        assert_eq!(stats.pc.get(0x10).warp_divergence, 1);
        assert_eq!(stats.pc.get(0x40).warp_divergence, 1);
    }

    #[test]
    #[should_panic(expected = "empty active mask")]
    fn test_update_with_empty_active_mask() {
        let mut stats = stats::Stats::default();
        let mut stack = SimtStack::new(0, WARP_SIZE);
        stack.launch(0x10, BitArray::ZERO);
        step(&mut stack, [0x18; WARP_SIZE], None, ArchOp::ALU_OP, &mut stats);
    }

    #[test]
    fn test_display() {
        let mut stats = stats::Stats::default();
        let stack = diverged_stack(&mut stats);
        let dump = stack.to_string();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("w01 0 1111 pc: 0x080 rp: ---- tp: N"));
        assert!(lines[0].contains("bd@   100"));
        assert!(lines[2].starts_with("    2 0011 pc: 0x040 rp:  128 tp: N cd:  0"));
    }
}
