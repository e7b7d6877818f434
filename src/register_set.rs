use super::instruction::WarpInstruction;

/// Fixed number of pipeline registers, each holding at most one instruction.
///
/// Instructions are moved in and out, never copied, so side effects such as
/// access generation happen once per instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    pub regs: Box<[Option<WarpInstruction>]>,
    pub id: usize,
}

/// Access to the slots of a register set.
pub trait Access<I> {
    #[must_use]
    fn get(&self, reg_id: usize) -> Option<&Option<I>>;

    #[must_use]
    fn size(&self) -> usize;

    #[must_use]
    fn has_free(&self) -> bool;

    #[must_use]
    fn has_ready(&self) -> bool;

    /// Slot of the oldest instruction.
    #[must_use]
    fn get_ready(&self) -> Option<(usize, &I)>;

    fn get_ready_mut(&mut self) -> Option<(usize, &mut Option<I>)>;

    fn get_free_mut(&mut self) -> Option<(usize, &mut Option<I>)>;

    fn move_in_from(&mut self, src: Option<I>) {
        let Some((_, free)) = self.get_free_mut() else {
            panic!("register set has no free register");
        };
        move_warp(src, free);
    }

    fn move_out_to(&mut self, dest: &mut Option<I>) {
        let Some((_, ready)) = self.get_ready_mut() else {
            panic!("register set has no ready register");
        };
        move_warp(ready.take(), dest);
    }
}

impl Access<WarpInstruction> for RegisterSet {
    fn get(&self, reg_id: usize) -> Option<&Option<WarpInstruction>> {
        self.regs.get(reg_id)
    }

    fn size(&self) -> usize {
        self.regs.len()
    }

    fn has_free(&self) -> bool {
        self.regs.iter().any(Option::is_none)
    }

    fn has_ready(&self) -> bool {
        self.regs.iter().any(Option::is_some)
    }

    fn get_ready(&self) -> Option<(usize, &WarpInstruction)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(idx, reg)| reg.as_ref().map(|inst| (idx, inst)))
            .min_by_key(|(_, inst)| inst.uid)
    }

    fn get_ready_mut(&mut self) -> Option<(usize, &mut Option<WarpInstruction>)> {
        let (oldest, _) = self.get_ready()?;
        log::trace!("register set {}: oldest instruction in slot {}", self.id, oldest);
        self.regs.get_mut(oldest).map(|reg| (oldest, reg))
    }

    fn get_free_mut(&mut self) -> Option<(usize, &mut Option<WarpInstruction>)> {
        self.regs
            .iter_mut()
            .enumerate()
            .find(|(_, reg)| reg.is_none())
    }
}

impl RegisterSet {
    #[must_use]
    pub fn new(size: usize, id: usize) -> Self {
        let regs = std::iter::repeat_with(|| None).take(size).collect();
        Self { regs, id }
    }
}

impl std::fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let slots = self
            .regs
            .iter()
            .map(|reg| reg.as_ref().map(ToString::to_string));
        f.debug_list().entries(slots).finish()
    }
}

/// Moves an instruction between pipeline registers.
///
/// The destination must be empty.
pub fn move_warp<T>(from: Option<T>, to: &mut Option<T>) {
    assert!(to.is_none(), "moving warp into occupied register");
    *to = from;
}
