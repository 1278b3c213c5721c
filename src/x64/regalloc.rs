// This module assigns every live value a physical location -- a general
// register, an RBP-relative frame slot, or the single condition-code
// pseudo-resource -- for the duration of one basic block. Liveness is a
// single backward pass over the block's operation list that records each
// value's last use and drops side-effect-free operations nobody consumes.
// The emission pass then allocates on the fly: operands pin their registers
// for the duration of the current instruction so the instruction cannot spill
// what it is consuming; when no register is free the occupant whose last use
// lies furthest in the future is spilled to a fresh slot. A value that was
// spilled never migrates back into the same register implicitly; reloads go
// to a newly chosen one. At most one value owns the condition code; before
// anything that clobbers the flags is emitted, that value is materialized
// into a register with SETcc/MOVZX (moves and spills themselves never touch
// the flags). Block boundaries are reconciled as a parallel-move problem
// with cycles broken through a temporary location. If a location is needed
// and even spilling cannot produce one, allocation fails fatally with a
// diagnostic naming the operation, since the frontend kept too many pinned
// values live at once.

//! Per-block register allocation with spilling and the condition-code
//! resource.

use hashbrown::HashMap;

use crate::core::buffer::CodeWriter;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{LabelId, OpNode, ResultKind, Value, VarId};
use crate::x64::calling_convention::FRAME_FIXED;
use crate::x64::operand::{Cond, Mem, Operand, Reg, RegSet};

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(Reg),
    /// RBP-relative displacement: negative for spill slots, positive for
    /// incoming stack arguments.
    Frame(i32),
    Cc(Cond),
    /// A constant carried across a block boundary.
    Imm(i64),
}

impl Loc {
    pub(crate) fn as_operand(&self) -> Operand {
        match self {
            Loc::Reg(r) => Operand::Reg(*r),
            Loc::Frame(d) => Operand::Mem(Mem::base(Reg::Rbp, *d)),
            Loc::Imm(i) => Operand::Imm(*i),
            Loc::Cc(_) => unreachable!("condition codes have no encodable operand"),
        }
    }
}

/// Sentinel last-use index for values that outlive the block.
const LIVE_PAST_END: i32 = i32::MAX;

/// Result of the backward liveness pass.
pub(crate) struct BlockAnalysis {
    last_use: HashMap<VarId, i32>,
    pub(crate) dead: Vec<bool>,
}

/// One backward sweep: record last uses, mark droppable operations.
pub(crate) fn analyze(ops: &[OpNode<'_>], finals: &[Value]) -> BlockAnalysis {
    let mut last_use: HashMap<VarId, i32> = HashMap::new();
    for v in finals {
        if let Value::Var(id) = v {
            last_use.insert(*id, LIVE_PAST_END);
        }
    }
    let mut dead = vec![false; ops.len()];
    for idx in (0..ops.len()).rev() {
        let node = &ops[idx];
        let produces = node.op.result_kind() != ResultKind::None;
        let live = node.op.has_side_effects() || (produces && last_use.contains_key(&node.result));
        if !live {
            dead[idx] = true;
            continue;
        }
        node.op.for_each_operand(|v| {
            if let Value::Var(id) = v {
                last_use.entry(id).or_insert(idx as i32);
            }
        });
    }
    BlockAnalysis { last_use, dead }
}

/// Allocator state for one block being emitted.
pub(crate) struct RegAllocator {
    pub(crate) mc: CodeWriter,
    locs: HashMap<VarId, Loc>,
    last_use: HashMap<VarId, i32>,
    free: RegSet,
    owner: [Option<VarId>; 16],
    /// Slot occupancy; slot i lives at rbp - (FRAME_FIXED + 8*(i+1)).
    slots: Vec<bool>,
    max_slots: u32,
    cc_owner: Option<(VarId, Cond)>,
    pinned: RegSet,
    cur_idx: i32,
    cur_name: &'static str,
    pub(crate) spills: u64,
    /// Largest outgoing call-argument area needed by this block, in words.
    pub(crate) outgoing_words: u32,
    /// Droppable operations, from the liveness pass.
    pub(crate) dead: Vec<bool>,
    /// Labels whose addresses were fixed inside this block; their frame
    /// depth becomes known once the block is complete.
    pub(crate) labels_in_block: Vec<LabelId>,
}

fn slot_disp(index: usize) -> i32 {
    -(FRAME_FIXED + 8 * (index as i32 + 1))
}

fn disp_slot(disp: i32) -> Option<usize> {
    if disp <= -(FRAME_FIXED + 8) && (-disp - FRAME_FIXED) % 8 == 0 {
        Some(((-disp - FRAME_FIXED) / 8 - 1) as usize)
    } else {
        None
    }
}

impl RegAllocator {
    pub(crate) fn new(mc: CodeWriter, analysis: BlockAnalysis) -> RegAllocator {
        RegAllocator {
            mc,
            locs: HashMap::new(),
            dead: analysis.dead,
            last_use: analysis.last_use,
            free: RegSet::ALLOCATABLE,
            owner: [None; 16],
            slots: Vec::new(),
            max_slots: 0,
            cc_owner: None,
            pinned: RegSet::EMPTY,
            cur_idx: 0,
            cur_name: "block entry",
            spills: 0,
            outgoing_words: 0,
            labels_in_block: Vec::new(),
        }
    }

    /// Record that `v` enters the block already sitting at `loc`.
    pub(crate) fn seed_input(&mut self, v: Value, loc: Loc) {
        let id = match v {
            Value::Var(id) => id,
            Value::Const(_) => return,
        };
        if self.locs.contains_key(&id) {
            return; // the same variable may be listed twice
        }
        if !self.last_use.contains_key(&id) {
            return; // dead on arrival
        }
        match loc {
            Loc::Reg(r) => {
                debug_assert!(self.free.contains(r), "two inputs share {}", r.name());
                self.free.remove(r);
                self.owner[r as usize] = Some(id);
            }
            Loc::Frame(d) => {
                if let Some(i) = disp_slot(d) {
                    if self.slots.len() <= i {
                        self.slots.resize(i + 1, false);
                    }
                    self.slots[i] = true;
                    self.max_slots = self.max_slots.max(i as u32 + 1);
                }
            }
            Loc::Cc(c) => {
                debug_assert!(self.cc_owner.is_none());
                self.cc_owner = Some((id, c));
            }
            Loc::Imm(_) => return,
        }
        self.locs.insert(id, loc);
    }

    /// Start allocating for the operation at `idx`.
    pub(crate) fn begin_op(&mut self, idx: usize, name: &'static str) {
        self.cur_idx = idx as i32;
        self.cur_name = name;
        self.pinned = RegSet::EMPTY;
    }

    pub(crate) fn loc(&self, v: Value) -> Option<Loc> {
        match v {
            Value::Const(i) => Some(Loc::Imm(i)),
            Value::Var(id) => self.locs.get(&id).copied(),
        }
    }

    /// Current operand for `v`, pinning its register for this instruction.
    /// A condition-code resident value is materialized first.
    pub(crate) fn operand(&mut self, v: Value) -> CompileResult<Operand> {
        match self.loc(v) {
            None => Err(CompileError::UndefinedValue { op: self.cur_name }),
            Some(Loc::Reg(r)) => {
                self.pinned.insert(r);
                Ok(Operand::Reg(r))
            }
            Some(Loc::Frame(d)) => Ok(Operand::Mem(Mem::base(Reg::Rbp, d))),
            Some(Loc::Imm(i)) => Ok(Operand::Imm(i)),
            Some(Loc::Cc(_)) => {
                let Value::Var(id) = v else { unreachable!() };
                let r = self.materialize_cc(id)?;
                self.pinned.insert(r);
                Ok(Operand::Reg(r))
            }
        }
    }

    /// Whether this use is the value's last.
    pub(crate) fn dies_here(&self, v: Value) -> bool {
        match v {
            Value::Const(_) => false,
            Value::Var(id) => self
                .last_use
                .get(&id)
                .map_or(true, |&lu| lu <= self.cur_idx),
        }
    }

    /// Whether anything later consumes the result of the current op.
    pub(crate) fn result_used(&self, id: VarId) -> bool {
        self.last_use.contains_key(&id)
    }

    /// Drop `v`'s location if this was its last use. Returns true when the
    /// location was freed (and may be claimed for an in-place result).
    pub(crate) fn release(&mut self, v: Value) -> bool {
        let id = match v {
            Value::Var(id) if self.dies_here(v) => id,
            _ => return false,
        };
        let Some(loc) = self.locs.remove(&id) else {
            return false;
        };
        self.free_loc(loc);
        true
    }

    fn free_loc(&mut self, loc: Loc) {
        match loc {
            Loc::Reg(r) => {
                self.owner[r as usize] = None;
                self.free.insert(r);
                self.pinned.remove(r);
            }
            Loc::Frame(d) => {
                if let Some(i) = disp_slot(d) {
                    self.slots[i] = false;
                }
            }
            Loc::Cc(_) => self.cc_owner = None,
            Loc::Imm(_) => {}
        }
    }

    fn alloc_slot(&mut self) -> i32 {
        let index = match self.slots.iter().position(|used| !used) {
            Some(i) => {
                self.slots[i] = true;
                i
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        };
        self.max_slots = self.max_slots.max(index as u32 + 1);
        slot_disp(index)
    }

    /// Obtain a register, spilling the value with the furthest last use if
    /// none is free. The register comes back pinned.
    pub(crate) fn alloc_reg(&mut self) -> CompileResult<Reg> {
        if let Some(r) = self.free.minus(self.pinned).first() {
            self.free.remove(r);
            self.pinned.insert(r);
            return Ok(r);
        }
        // Spill: furthest last use among unpinned occupants.
        let mut victim: Option<(Reg, i32)> = None;
        for r in RegSet::ALLOCATABLE.minus(self.pinned).iter() {
            if let Some(id) = self.owner[r as usize] {
                let lu = self.last_use.get(&id).copied().unwrap_or(LIVE_PAST_END);
                if victim.map_or(true, |(_, best)| lu > best) {
                    victim = Some((r, lu));
                }
            }
        }
        let Some((r, _)) = victim else {
            return Err(CompileError::RegisterPressure { op: self.cur_name });
        };
        let id = self.owner[r as usize].unwrap();
        let disp = self.alloc_slot();
        self.mc.mov_store(
            crate::x64::encoder::Width::Q,
            &Mem::base(Reg::Rbp, disp),
            r,
        )?;
        log::debug!("spill {} from {} to [rbp{:+}]", id.0, r.name(), disp);
        self.spills += 1;
        self.locs.insert(id, Loc::Frame(disp));
        self.owner[r as usize] = None;
        self.pinned.insert(r);
        Ok(r)
    }

    /// Define `id` in a freshly allocated register, optionally initialized
    /// by a move from `init`.
    pub(crate) fn def_reg(&mut self, id: VarId, init: Option<&Operand>) -> CompileResult<Reg> {
        let r = self.alloc_reg()?;
        if let Some(src) = init {
            if *src != Operand::Reg(r) {
                self.mc.mov(&Operand::Reg(r), src)?;
            }
        }
        self.owner[r as usize] = Some(id);
        self.locs.insert(id, Loc::Reg(r));
        Ok(r)
    }

    /// Define `id` exactly at a location just freed by a release.
    pub(crate) fn def_at(&mut self, id: VarId, loc: Loc) {
        match loc {
            Loc::Reg(r) => {
                debug_assert!(self.free.contains(r), "{} is still occupied", r.name());
                self.free.remove(r);
                self.owner[r as usize] = Some(id);
                self.pinned.insert(r);
            }
            Loc::Frame(d) => {
                if let Some(i) = disp_slot(d) {
                    debug_assert!(!self.slots[i]);
                    self.slots[i] = true;
                }
            }
            Loc::Cc(_) | Loc::Imm(_) => unreachable!("results live in registers or slots"),
        }
        self.locs.insert(id, loc);
    }

    /// Define `id` in a register previously reserved through
    /// [`RegAllocator::clobber_reg`] (division results, call results).
    pub(crate) fn def_fixed(&mut self, id: VarId, r: Reg) {
        debug_assert!(self.owner[r as usize].is_none());
        self.free.remove(r);
        self.owner[r as usize] = Some(id);
        self.pinned.insert(r);
        self.locs.insert(id, Loc::Reg(r));
    }

    /// Define `id` as the sole occupant of the condition code.
    pub(crate) fn def_cc(&mut self, id: VarId, cond: Cond) {
        debug_assert!(self.cc_owner.is_none(), "condition code already occupied");
        self.cc_owner = Some((id, cond));
        self.locs.insert(id, Loc::Cc(cond));
    }

    /// A register for intermediate results within one rule; give it back
    /// with [`RegAllocator::end_scratch`].
    pub(crate) fn scratch(&mut self, init: Option<&Operand>) -> CompileResult<Reg> {
        let r = self.alloc_reg()?;
        if let Some(src) = init {
            self.mc.mov(&Operand::Reg(r), src)?;
        }
        Ok(r)
    }

    pub(crate) fn end_scratch(&mut self, r: Reg) {
        self.pinned.remove(r);
        if self.owner[r as usize].is_none() {
            self.free.insert(r);
        }
    }

    /// Evacuate whatever lives in `r` (to a register outside `exclude`, or
    /// to a slot) and reserve `r` for the current rule. Released with
    /// [`RegAllocator::end_scratch`] or claimed via
    /// [`RegAllocator::def_fixed`].
    pub(crate) fn clobber_reg(&mut self, r: Reg, exclude: RegSet) -> CompileResult<()> {
        if let Some(id) = self.owner[r as usize] {
            if let Some(new) = self.free.minus(self.pinned).minus(exclude).minus(RegSet::of(&[r])).first() {
                self.mc.mov_rr(new, r)?;
                self.free.remove(new);
                self.owner[new as usize] = Some(id);
                self.locs.insert(id, Loc::Reg(new));
            } else {
                let disp = self.alloc_slot();
                self.mc.mov_store(
                    crate::x64::encoder::Width::Q,
                    &Mem::base(Reg::Rbp, disp),
                    r,
                )?;
                self.spills += 1;
                self.locs.insert(id, Loc::Frame(disp));
            }
            self.owner[r as usize] = None;
        } else {
            self.free.remove(r);
        }
        self.pinned.insert(r);
        Ok(())
    }

    /// Materialize the condition-code value (if any) into a register so the
    /// flags may be destroyed. SETcc/MOVZX leave the flags intact, so the
    /// code they produce is itself safe to emit while the flags are live.
    pub(crate) fn clobber_cc(&mut self) -> CompileResult<()> {
        if let Some((id, _)) = self.cc_owner {
            self.materialize_cc(id)?;
        }
        Ok(())
    }

    fn materialize_cc(&mut self, id: VarId) -> CompileResult<Reg> {
        let Some((owner, cond)) = self.cc_owner else {
            unreachable!("no condition-code value to materialize")
        };
        debug_assert_eq!(owner, id);
        let r = self.alloc_reg()?;
        self.mc.setcc(cond, r.low8())?;
        self.mc.movzx_rr8(r, r.low8())?;
        self.cc_owner = None;
        self.owner[r as usize] = Some(id);
        self.locs.insert(id, Loc::Reg(r));
        Ok(r)
    }

    /// The condition this value holds in the flags, if that is where it is.
    pub(crate) fn cc_of(&self, v: Value) -> Option<Cond> {
        match self.loc(v) {
            Some(Loc::Cc(c)) => Some(c),
            _ => None,
        }
    }

    /// Ensure a variable sits in a register, reloading it from its slot
    /// into a freshly chosen one if needed (never implicitly back into a
    /// register it was spilled from earlier).
    pub(crate) fn ensure_reg(&mut self, v: Value) -> CompileResult<Reg> {
        match self.loc(v) {
            None => Err(CompileError::UndefinedValue { op: self.cur_name }),
            Some(Loc::Reg(r)) => {
                self.pinned.insert(r);
                Ok(r)
            }
            Some(Loc::Frame(d)) => {
                let Value::Var(id) = v else { unreachable!() };
                let r = self.alloc_reg()?;
                self.mc.mov_load(r, &Mem::base(Reg::Rbp, d))?;
                if let Some(i) = disp_slot(d) {
                    self.slots[i] = false;
                }
                self.owner[r as usize] = Some(id);
                self.locs.insert(id, Loc::Reg(r));
                Ok(r)
            }
            Some(Loc::Cc(_)) => {
                let Value::Var(id) = v else { unreachable!() };
                let r = self.materialize_cc(id)?;
                self.pinned.insert(r);
                Ok(r)
            }
            Some(Loc::Imm(_)) => Err(CompileError::Unencodable),
        }
    }

    /// Note that a call in this block needs `words` outgoing stack words.
    pub(crate) fn reserve_outgoing(&mut self, words: u32) {
        self.outgoing_words = self.outgoing_words.max(words);
    }

    /// Total frame bytes this block needs below RBP, 16-byte aligned so
    /// RSP stays call-aligned, and at least `min_bytes` (the frame of any
    /// label this block jumps back into).
    pub(crate) fn frame_bytes(&self, min_bytes: i32) -> i32 {
        let own = FRAME_FIXED + 8 * self.max_slots as i32 + 8 * self.outgoing_words as i32;
        let total = own.max(min_bytes);
        (total + 15) & !15
    }

    /// Current locations of the values that leave this block.
    pub(crate) fn capture_locs(&self, finals: &[Value]) -> CompileResult<Vec<Loc>> {
        finals
            .iter()
            .map(|v| {
                self.loc(*v)
                    .ok_or(CompileError::UndefinedValue { op: "block exit" })
            })
            .collect()
    }

    /// Move every (value, destination) pair into place at once, solving
    /// the parallel-move problem; cycles are broken by bouncing one source
    /// through a fresh temporary.
    pub(crate) fn force_at_end(&mut self, pairs: &[(Value, Loc)]) -> CompileResult<()> {
        // A value still in the condition code is materialized first so all
        // sources are register/slot/immediate operands.
        self.clobber_cc()?;

        // A destination register may still hold a live value that is not
        // itself being moved; evacuate it so the move cannot destroy it.
        let mut dst_regs = RegSet::EMPTY;
        for (_, dst) in pairs {
            if let Loc::Reg(r) = dst {
                dst_regs.insert(*r);
            }
        }
        for (_, dst) in pairs {
            let Loc::Reg(r) = dst else { continue };
            let Some(id) = self.owner[*r as usize] else { continue };
            if pairs.iter().any(|(v, _)| *v == Value::Var(id)) {
                continue;
            }
            if let Some(new) = self.free.minus(dst_regs).first() {
                self.mc.mov_rr(new, *r)?;
                self.free.remove(new);
                self.owner[new as usize] = Some(id);
                self.locs.insert(id, Loc::Reg(new));
            } else {
                let disp = self.alloc_slot();
                self.mc.mov_store(
                    crate::x64::encoder::Width::Q,
                    &Mem::base(Reg::Rbp, disp),
                    *r,
                )?;
                self.spills += 1;
                self.locs.insert(id, Loc::Frame(disp));
            }
            self.owner[*r as usize] = None;
            self.free.insert(*r);
        }

        let mut pending: Vec<(Operand, Operand)> = Vec::new();
        for (v, dst) in pairs {
            let src = match self.loc(*v) {
                Some(l) => l.as_operand(),
                None => return Err(CompileError::UndefinedValue { op: "goto" }),
            };
            let dst_op = dst.as_operand();
            if src != dst_op {
                pending.push((src, dst_op));
            }
        }

        while !pending.is_empty() {
            if let Some(i) = (0..pending.len())
                .find(|&i| !pending.iter().any(|(s, _)| *s == pending[i].1))
            {
                let (src, dst) = pending.remove(i);
                self.emit_move(&dst, &src)?;
            } else {
                // Cycle: relocate one conflicting source into a fresh
                // temporary location, then retarget its other readers.
                let (src0, _) = pending[0];
                let tmp = Operand::Mem(Mem::base(Reg::Rbp, self.alloc_slot()));
                self.emit_move(&tmp, &src0)?;
                for (s, _) in pending.iter_mut() {
                    if *s == src0 {
                        *s = tmp;
                    }
                }
            }
        }

        for (v, dst) in pairs {
            if let Value::Var(id) = v {
                self.locs.insert(*id, *dst);
            }
        }
        Ok(())
    }

    /// One move, detouring through a register (or a preserved RAX) when
    /// the direct form is not encodable.
    fn emit_move(&mut self, dst: &Operand, src: &Operand) -> CompileResult<()> {
        match self.mc.mov(dst, src) {
            Err(CompileError::Unencodable) => {
                if let Some(r) = self.free.minus(self.pinned).first() {
                    self.mc.mov(&Operand::Reg(r), src)?;
                    self.mc.mov(dst, &Operand::Reg(r))
                } else {
                    self.mc.push(Reg::Rax)?;
                    self.mc.mov(&Operand::Reg(Reg::Rax), src)?;
                    self.mc.mov(dst, &Operand::Reg(Reg::Rax))?;
                    self.mc.pop(Reg::Rax)
                }
            }
            other => other,
        }
    }

    /// Force a value to live in a frame slot from here on (frame places);
    /// returns the slot displacement.
    pub(crate) fn force_to_slot(&mut self, v: Value) -> CompileResult<i32> {
        match self.loc(v) {
            Some(Loc::Frame(d)) => Ok(d),
            Some(Loc::Reg(r)) => {
                let disp = self.alloc_slot();
                self.mc.mov_store(
                    crate::x64::encoder::Width::Q,
                    &Mem::base(Reg::Rbp, disp),
                    r,
                )?;
                if let Value::Var(id) = v {
                    self.owner[r as usize] = None;
                    self.free.insert(r);
                    self.locs.insert(id, Loc::Frame(disp));
                }
                Ok(disp)
            }
            Some(Loc::Cc(_)) => {
                let Value::Var(id) = v else { unreachable!() };
                self.materialize_cc(id)?;
                self.force_to_slot(v)
            }
            Some(Loc::Imm(i)) => {
                let disp = self.alloc_slot();
                let dst = Mem::base(Reg::Rbp, disp);
                if self
                    .mc
                    .mov_store_imm(crate::x64::encoder::Width::Q, &dst, i)
                    .is_err()
                {
                    let r = self.scratch(Some(&Operand::Imm(i)))?;
                    self.mc
                        .mov_store(crate::x64::encoder::Width::Q, &dst, r)?;
                    self.end_scratch(r);
                }
                Ok(disp)
            }
            None => Err(CompileError::UndefinedValue { op: "frame place" }),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_set_last_use(&mut self, id: VarId, lu: i32) {
        self.last_use.insert(id, lu);
    }
}
