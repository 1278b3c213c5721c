// This module orchestrates code generation: the Generator owns the chunk
// pool, the arenas of builders/labels/switches/places and the statistics, and
// every frontend request goes through it with plain index handles. A Builder
// accumulates operations for one basic block; closing the block (pause, goto,
// return, flexswitch) runs liveness, allocates locations and emits machine
// code, then records where the block's surviving values ended up so the next
// block (or a jump) can pick them up. Forward control flow is deferred: a
// jump to a builder that has no code yet is a placeholder jump recorded in a
// side table and re-encoded through a patch window when that builder's first
// block is generated; when the new code starts exactly at the placeholder's
// end, the placeholder is seeked back over and overwritten instead. Every
// block starts with a `lea rsp, [rbp-FRAME]` whose displacement is patched
// once the block's spill and outgoing-call needs are known; a label records
// the frame depth of its block so back edges keep RSP at least that deep.
// The flexswitch reserves a UD2-guarded comparison area inline and grows by
// chaining fresh reservations with an unconditional jump, keeping previously
// emitted case jumps valid. Emission that overflows a chunk is backed out
// and retried once in a freshly mapped chunk; flexswitch case emission backs
// out into a fresh reservation.

//! Graph building: builders, labels, flexswitch, prologue/epilogue.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::buffer::{peek_word, poke_word, CodePool, CodeWriter};
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{
    BuilderId, LabelId, Op, OpNode, PlaceId, SwitchId, UnaryOp, Value, VarId,
};
use crate::core::session::GenStats;
use crate::core::token::{FieldToken, SigToken, VarSizeToken};
use crate::x64::calling_convention as conv;
use crate::x64::encoder::AluOp;
use crate::x64::operand::{Cond, Mem, Operand, Reg};
use crate::x64::regalloc::{analyze, Loc, RegAllocator};

/// Bytes reserved up front for one flexswitch dispatch area.
const SWITCH_RESERVE: usize = 64;

/// Room a chunk must still have after a block, for whatever the caller
/// appends behind it (epilogue, jump, or a fresh switch reservation).
const TAIL_ROOM: usize = SWITCH_RESERVE + 64;

/// Address of a generated function, callable with the native ABI
/// (word-sized integer arguments, one word-sized integer result).
///
/// The code stays valid for as long as the generator that produced it is
/// alive; calling through a dropped generator's entry point is undefined
/// behavior, as is calling before `finish_and_return` completed the graph.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint(pub(crate) usize);

impl EntryPoint {
    pub fn addr(&self) -> usize {
        self.0
    }

    /// The entry point as a value, e.g. to call one generated graph from
    /// another.
    pub fn as_value(&self) -> Value {
        Value::addr(self.0)
    }

    /// # Safety
    /// See the type-level contract; the graph must be complete and the
    /// generator alive.
    pub unsafe fn call0(&self) -> i64 {
        let f: extern "C" fn() -> i64 = std::mem::transmute(self.0);
        f()
    }

    /// # Safety
    /// See [`EntryPoint::call0`].
    pub unsafe fn call1(&self, a: i64) -> i64 {
        let f: extern "C" fn(i64) -> i64 = std::mem::transmute(self.0);
        f(a)
    }

    /// # Safety
    /// See [`EntryPoint::call0`].
    pub unsafe fn call2(&self, a: i64, b: i64) -> i64 {
        let f: extern "C" fn(i64, i64) -> i64 = std::mem::transmute(self.0);
        f(a, b)
    }

    /// # Safety
    /// See [`EntryPoint::call0`].
    pub unsafe fn call3(&self, a: i64, b: i64, c: i64) -> i64 {
        let f: extern "C" fn(i64, i64, i64) -> i64 = std::mem::transmute(self.0);
        f(a, b, c)
    }

    /// # Safety
    /// See [`EntryPoint::call0`].
    pub unsafe fn call4(&self, a: i64, b: i64, c: i64, d: i64) -> i64 {
        let f: extern "C" fn(i64, i64, i64, i64) -> i64 = std::mem::transmute(self.0);
        f(a, b, c, d)
    }
}

/// A jump emitted before its target existed, waiting to be re-encoded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingJump {
    start: usize,
    end: usize,
    cond: Option<Cond>,
}

pub(crate) struct BuilderState<'a> {
    /// Values this builder's next block receives.
    inputs: Vec<Value>,
    /// Where those values are when control arrives.
    input_locs: Vec<Loc>,
    /// Operations of the currently open block; None while closed.
    ops: Option<BumpVec<'a, OpNode<'a>>>,
    coming_from: Option<PendingJump>,
    /// Flexswitch whose default-case address this builder's first block
    /// address becomes.
    update_switch_default: Option<SwitchId>,
    /// Values to be forced into frame slots when the block closes.
    force_stack: Vec<(Value, PlaceId)>,
}

struct LabelState {
    target_addr: usize,
    /// Frame bytes of the block containing the label; jumps back into it
    /// must keep RSP at least this deep.
    frame_bytes: i32,
    operands: Option<Vec<Loc>>,
}

struct SwitchState {
    inputs: Vec<Value>,
    input_locs: Vec<Loc>,
    next_free: usize,
    end_free: usize,
    default_addr: usize,
}

struct PlaceState {
    var: Value,
    disp: Option<i32>,
}

/// Information for reading a frame-resident value from outside the
/// generated code.
#[derive(Debug, Clone, Copy)]
pub enum FrameInfo {
    Const(i64),
    Place(PlaceId),
}

pub(crate) struct GeneratedBlock {
    pub mc: CodeWriter,
    pub entry: usize,
}

/// One code-generator instance: executable memory pool, block/label/switch
/// arenas, statistics. All state is held here explicitly; nothing is
/// process-global. Single-threaded by construction.
pub struct Generator<'a> {
    arena: &'a Bump,
    pub(crate) pool: CodePool,
    pub(crate) builders: Vec<BuilderState<'a>>,
    labels: Vec<LabelState>,
    switches: Vec<SwitchState>,
    places: Vec<PlaceState>,
    next_var: u32,
    malloc_fn: usize,
    debug_trap: bool,
    pub(crate) stats: GenStats,
}

impl<'a> Generator<'a> {
    /// Create a generator instance backed by the given arena.
    pub fn new(arena: &'a Bump) -> Generator<'a> {
        Generator {
            arena,
            pool: CodePool::new(),
            builders: Vec::new(),
            labels: Vec::new(),
            switches: Vec::new(),
            places: Vec::new(),
            next_var: 0,
            malloc_fn: libc::malloc as usize,
            debug_trap: false,
            stats: GenStats::default(),
        }
    }

    /// Override the allocation function behind `malloc_fixedsize` and
    /// `malloc_varsize`. It must behave like `extern "C" fn(usize) -> ptr`.
    pub fn set_malloc_fn(&mut self, addr: usize) {
        self.malloc_fn = addr;
    }

    /// Emit a breakpoint at every graph entry.
    pub fn set_debug_trap(&mut self, on: bool) {
        self.debug_trap = on;
    }

    pub fn stats(&self) -> &GenStats {
        &self.stats
    }

    /// All chunks are back in the pool; nothing is being written.
    pub fn check_no_open_blocks(&self) -> bool {
        self.pool.check_no_open()
    }

    fn new_var(&mut self) -> VarId {
        let id = VarId(self.next_var);
        self.next_var += 1;
        id
    }

    fn new_builder(&mut self, inputs: Vec<Value>, input_locs: Vec<Loc>) -> BuilderId {
        let id = BuilderId(self.builders.len() as u32);
        self.builders.push(BuilderState {
            inputs,
            input_locs,
            ops: None,
            coming_from: None,
            update_switch_default: None,
            force_stack: Vec::new(),
        });
        id
    }

    pub(crate) fn builder_mut(&mut self, b: BuilderId) -> &mut BuilderState<'a> {
        &mut self.builders[b.0 as usize]
    }

    /// Bind a jump target's incoming value locations, captured at the
    /// jump that created it.
    pub(crate) fn set_builder_input_locs(&mut self, b: BuilderId, locs: Vec<Loc>) {
        self.builders[b.0 as usize].input_locs = locs;
    }

    /// Fix a label's address and operand homes at the point its block
    /// reached it.
    pub(crate) fn fix_label(&mut self, label: LabelId, addr: usize, locs: Vec<Loc>) {
        let l = &mut self.labels[label.0 as usize];
        l.target_addr = addr;
        l.operands = Some(locs);
    }

    // ==== GRAPH LIFECYCLE ====

    /// Open a new graph: emit the prologue, bind the argument locations per
    /// the calling convention and hand back a builder positioned right
    /// after it. The builder still needs `start_writing`.
    pub fn new_graph(
        &mut self,
        sig: SigToken,
        name: &str,
    ) -> CompileResult<(BuilderId, EntryPoint, Vec<Value>)> {
        let mut mc = self.pool.open()?;
        let entry = mc.tell();
        if self.debug_trap {
            mc.int3()?;
        }
        mc.push(Reg::Rbp)?;
        mc.mov_rr(Reg::Rbp, Reg::Rsp)?;
        for r in conv::CALLEE_SAVED {
            mc.push(r)?;
        }
        let mut inputs = Vec::with_capacity(sig.num_args as usize);
        let mut locs = Vec::with_capacity(sig.num_args as usize);
        for i in 0..sig.num_args as usize {
            inputs.push(Value::Var(self.new_var()));
            locs.push(match conv::arg_location(i) {
                conv::ArgLoc::Reg(r) => Loc::Reg(r),
                conv::ArgLoc::Frame(d) => Loc::Frame(d),
            });
        }
        let b = self.new_builder(inputs.clone(), locs);
        self.set_coming_from(b, &mut mc, None)?;
        self.pool.close(mc);
        self.stats.graphs_started += 1;
        log::info!(
            "graph '{}' ({} args) entry {:#x}",
            name,
            sig.num_args,
            entry
        );
        Ok((b, EntryPoint(entry), inputs))
    }

    /// Open the builder for a new block of operations.
    pub fn start_writing(&mut self, b: BuilderId) -> CompileResult<()> {
        let arena = self.arena;
        let st = self.builder_mut(b);
        if st.ops.is_some() {
            return Err(CompileError::AlreadyWriting);
        }
        st.ops = Some(BumpVec::new_in(arena));
        Ok(())
    }

    /// Close the current block, leave an open jump behind and release the
    /// chunk; `start_writing` resumes later. `alive` lists every value that
    /// must survive the pause.
    pub fn pause_writing(&mut self, b: BuilderId, alive: &[Value]) -> CompileResult<()> {
        let finals = dedup_vars(alive);
        let block = self.generate_block_code(b, &finals, &[], 0)?;
        let mut mc = block.mc;
        self.set_coming_from(b, &mut mc, None)?;
        self.finish_mc(mc, block.entry);
        Ok(())
    }

    /// Copy the result into the return register, tear the frame down and
    /// return from the generated function.
    pub fn finish_and_return(
        &mut self,
        b: BuilderId,
        _sig: SigToken,
        retval: Value,
    ) -> CompileResult<()> {
        let block = self.generate_block_code(
            b,
            &[retval],
            &[(retval, Loc::Reg(conv::RET_REG))],
            0,
        )?;
        let mut mc = block.mc;
        mc.lea(Reg::Rsp, &Mem::base(Reg::Rbp, -conv::FRAME_FIXED))?;
        for r in conv::CALLEE_SAVED.iter().rev() {
            mc.pop(*r)?;
        }
        mc.pop(Reg::Rbp)?;
        mc.ret()?;
        self.finish_mc(mc, block.entry);
        self.stats.graphs_finished += 1;
        Ok(())
    }

    /// Reconcile `outputs` against the label's expected locations and jump
    /// there.
    pub fn finish_and_goto(
        &mut self,
        b: BuilderId,
        outputs: &[Value],
        label: LabelId,
    ) -> CompileResult<()> {
        if self.labels[label.0 as usize].operands.is_none() {
            // The label sits in this builder's still-open block: close the
            // block (fixing the label) and reopen.
            self.pause_writing(b, outputs)?;
            self.start_writing(b)?;
            if self.labels[label.0 as usize].operands.is_none() {
                return Err(CompileError::Unsupported(
                    "finish_and_goto before the target label was generated",
                ));
            }
        }
        let (addr, frame, operand_locs) = {
            let l = &self.labels[label.0 as usize];
            (l.target_addr, l.frame_bytes, l.operands.clone().unwrap())
        };
        if operand_locs.len() != outputs.len() {
            return Err(CompileError::Unsupported("goto argument count mismatch"));
        }
        let pairs: Vec<(Value, Loc)> = outputs
            .iter()
            .copied()
            .zip(operand_locs.into_iter())
            .collect();
        let block = self.generate_block_code(b, outputs, &pairs, frame)?;
        let mut mc = block.mc;
        mc.emit_jump(None, addr)?;
        self.finish_mc(mc, block.entry);
        Ok(())
    }

    /// Insert a block entry: every argument is renamed through a copy, and
    /// the returned label remembers where those copies live so later jumps
    /// can be reconciled against it.
    pub fn enter_next_block(
        &mut self,
        b: BuilderId,
        args: &mut [Value],
    ) -> CompileResult<LabelId> {
        for slot in args.iter_mut() {
            *slot = self.push_op(b, Op::SameAs(*slot))?;
        }
        let label = LabelId(self.labels.len() as u32);
        self.labels.push(LabelState {
            target_addr: 0,
            frame_bytes: 0,
            operands: None,
        });
        let arena = self.arena;
        let mut a = BumpVec::with_capacity_in(args.len(), arena);
        for v in args.iter() {
            a.push(*v);
        }
        self.push_op(b, Op::Label { label, args: a })?;
        Ok(label)
    }

    fn jump_if(
        &mut self,
        b: BuilderId,
        cond: Value,
        args: &[Value],
        negate: bool,
    ) -> CompileResult<BuilderId> {
        let target = self.new_builder(args.to_vec(), Vec::new());
        let arena = self.arena;
        let mut a = BumpVec::with_capacity_in(args.len(), arena);
        for v in args {
            a.push(*v);
        }
        self.push_op(
            b,
            Op::JumpIf {
                cond,
                negate,
                target,
                args: a,
            },
        )?;
        Ok(target)
    }

    /// Fork: a new builder that receives control when the condition holds.
    pub fn jump_if_true(
        &mut self,
        b: BuilderId,
        cond: Value,
        args: &[Value],
    ) -> CompileResult<BuilderId> {
        self.jump_if(b, cond, args, false)
    }

    /// Fork: a new builder that receives control when the condition fails.
    pub fn jump_if_false(
        &mut self,
        b: BuilderId,
        cond: Value,
        args: &[Value],
    ) -> CompileResult<BuilderId> {
        self.jump_if(b, cond, args, true)
    }

    // ==== OPERATIONS ====

    pub(crate) fn push_op(&mut self, b: BuilderId, op: Op<'a>) -> CompileResult<Value> {
        let id = self.new_var();
        self.stats.count_op(op.name());
        let st = &mut self.builders[b.0 as usize];
        let ops = st.ops.as_mut().ok_or(CompileError::NotWriting)?;
        ops.push(OpNode { result: id, op });
        Ok(Value::Var(id))
    }

    /// One-operand operation.
    pub fn genop1(&mut self, b: BuilderId, op: UnaryOp, x: Value) -> CompileResult<Value> {
        let node = match op {
            UnaryOp::Neg => Op::Neg(x),
            UnaryOp::Abs => Op::Abs(x),
            UnaryOp::Invert => Op::Invert(x),
            UnaryOp::IsTrue => Op::Cmp0 { negated: false, x },
            UnaryOp::BoolNot => Op::Cmp0 { negated: true, x },
        };
        self.push_op(b, node)
    }

    /// Two-operand operation.
    pub fn genop2(
        &mut self,
        b: BuilderId,
        op: crate::core::ir::BinaryOp,
        x: Value,
        y: Value,
    ) -> CompileResult<Value> {
        use crate::core::ir::{ArithKind, BinaryOp, DivKind, ShiftOpKind};
        let node = match op {
            BinaryOp::Add => Op::Arith(ArithKind::Add, x, y),
            BinaryOp::Sub => Op::Arith(ArithKind::Sub, x, y),
            BinaryOp::And => Op::Arith(ArithKind::And, x, y),
            BinaryOp::Or => Op::Arith(ArithKind::Or, x, y),
            BinaryOp::Xor => Op::Arith(ArithKind::Xor, x, y),
            BinaryOp::Mul => Op::Mul(x, y),
            BinaryOp::FloorDiv => Op::DivRem {
                kind: DivKind::FloorDiv,
                x,
                y,
            },
            BinaryOp::Mod => Op::DivRem {
                kind: DivKind::Mod,
                x,
                y,
            },
            BinaryOp::UDiv => Op::DivRem {
                kind: DivKind::UDiv,
                x,
                y,
            },
            BinaryOp::UMod => Op::DivRem {
                kind: DivKind::UMod,
                x,
                y,
            },
            BinaryOp::Lshift => Op::Shift(ShiftOpKind::Lshift, x, y),
            BinaryOp::Rshift => Op::Shift(ShiftOpKind::RshiftArith, x, y),
            BinaryOp::URshift => Op::Shift(ShiftOpKind::RshiftLogic, x, y),
            BinaryOp::Lt => Op::Cmp { cc: Cond::L, x, y },
            BinaryOp::Le => Op::Cmp { cc: Cond::Le, x, y },
            BinaryOp::Eq => Op::Cmp { cc: Cond::E, x, y },
            BinaryOp::Ne => Op::Cmp { cc: Cond::Ne, x, y },
            BinaryOp::Gt => Op::Cmp { cc: Cond::G, x, y },
            BinaryOp::Ge => Op::Cmp { cc: Cond::Ge, x, y },
            BinaryOp::Ult => Op::Cmp { cc: Cond::B, x, y },
            BinaryOp::Ule => Op::Cmp { cc: Cond::Be, x, y },
            BinaryOp::Ugt => Op::Cmp { cc: Cond::A, x, y },
            BinaryOp::Uge => Op::Cmp { cc: Cond::Ae, x, y },
        };
        self.push_op(b, node)
    }

    /// Constants are copied into a fresh variable; variables come back
    /// unchanged.
    pub fn genop_same_as(&mut self, b: BuilderId, x: Value) -> CompileResult<Value> {
        if x.is_const() {
            self.push_op(b, Op::SameAs(x))
        } else {
            Ok(x)
        }
    }

    /// Adopt the currently established condition code as a value.
    pub fn genop_fetch_cc(&mut self, b: BuilderId, cond: Cond) -> CompileResult<Value> {
        self.push_op(b, Op::FetchCc(cond))
    }

    /// Call through a function value with the given signature.
    pub fn genop_call(
        &mut self,
        b: BuilderId,
        sig: SigToken,
        func: Value,
        args: &[Value],
    ) -> CompileResult<Value> {
        debug_assert_eq!(sig.num_args as usize, args.len());
        let arena = self.arena;
        let mut a = BumpVec::with_capacity_in(args.len(), arena);
        for v in args {
            a.push(*v);
        }
        self.push_op(b, Op::Call { sig, func, args: a })
    }

    /// Allocate `size` bytes through the configured allocation function.
    pub fn genop_malloc_fixedsize(&mut self, b: BuilderId, size: i64) -> CompileResult<Value> {
        let malloc = Value::addr(self.malloc_fn);
        self.genop_call(b, SigToken::new(1), malloc, &[Value::imm(size)])
    }

    /// Allocate a var-sized object and initialize its length field.
    pub fn genop_malloc_varsize(
        &mut self,
        b: BuilderId,
        tok: VarSizeToken,
        len: Value,
    ) -> CompileResult<Value> {
        let size = self.push_op(b, Op::ComputeSize { tok, len })?;
        let malloc = Value::addr(self.malloc_fn);
        let ptr = self.genop_call(b, SigToken::new(1), malloc, &[size])?;
        self.push_op(
            b,
            Op::SetField {
                tok: tok.length,
                ptr,
                val: len,
            },
        )?;
        Ok(ptr)
    }

    pub fn genop_getfield(
        &mut self,
        b: BuilderId,
        tok: FieldToken,
        ptr: Value,
    ) -> CompileResult<Value> {
        self.push_op(b, Op::GetField { tok, ptr })
    }

    pub fn genop_setfield(
        &mut self,
        b: BuilderId,
        tok: FieldToken,
        ptr: Value,
        val: Value,
    ) -> CompileResult<()> {
        self.push_op(b, Op::SetField { tok, ptr, val })?;
        Ok(())
    }

    /// An inner struct is just the outer pointer plus a constant offset.
    pub fn genop_getsubstruct(
        &mut self,
        b: BuilderId,
        tok: FieldToken,
        ptr: Value,
    ) -> CompileResult<Value> {
        self.genop2(
            b,
            crate::core::ir::BinaryOp::Add,
            ptr,
            Value::imm(tok.offset as i64),
        )
    }

    pub fn genop_getarrayitem(
        &mut self,
        b: BuilderId,
        tok: crate::core::token::ArrayToken,
        arr: Value,
        index: Value,
    ) -> CompileResult<Value> {
        self.push_op(b, Op::GetArrayItem { tok, arr, index })
    }

    pub fn genop_setarrayitem(
        &mut self,
        b: BuilderId,
        tok: crate::core::token::ArrayToken,
        arr: Value,
        index: Value,
        val: Value,
    ) -> CompileResult<()> {
        self.push_op(
            b,
            Op::SetArrayItem {
                tok,
                arr,
                index,
                val,
            },
        )?;
        Ok(())
    }

    pub fn genop_getarraysubstruct(
        &mut self,
        b: BuilderId,
        tok: crate::core::token::ArrayToken,
        arr: Value,
        index: Value,
    ) -> CompileResult<Value> {
        self.push_op(b, Op::GetArraySub { tok, arr, index })
    }

    /// The array length is an ordinary field read through the array
    /// token's length descriptor.
    pub fn genop_getarraysize(
        &mut self,
        b: BuilderId,
        tok: crate::core::token::ArrayToken,
        arr: Value,
    ) -> CompileResult<Value> {
        self.push_op(
            b,
            Op::GetField {
                tok: tok.length,
                ptr: arr,
            },
        )
    }

    /// Expose the frame pointer of the running function.
    pub fn genop_get_frame_base(&mut self, b: BuilderId) -> CompileResult<Value> {
        self.push_op(b, Op::FrameBase)
    }

    // ==== FRAME PLACES ====

    /// Force the listed values into known frame slots when the current
    /// block closes; constants pass through unchanged.
    pub fn get_frame_info(
        &mut self,
        b: BuilderId,
        vars: &[Value],
    ) -> CompileResult<Vec<FrameInfo>> {
        let mut infos = Vec::with_capacity(vars.len());
        for v in vars {
            match v {
                Value::Const(i) => infos.push(FrameInfo::Const(*i)),
                Value::Var(_) => {
                    let place = PlaceId(self.places.len() as u32);
                    self.places.push(PlaceState {
                        var: *v,
                        disp: None,
                    });
                    self.builder_mut(b).force_stack.push((*v, place));
                    infos.push(FrameInfo::Place(place));
                }
            }
        }
        Ok(infos)
    }

    /// Reserve a frame slot holding a copy of `init`, readable and
    /// writable from outside while the graph is paused or running.
    pub fn alloc_frame_place(&mut self, b: BuilderId, init: Value) -> CompileResult<PlaceId> {
        let v = self.push_op(b, Op::SameAs(init))?;
        let place = PlaceId(self.places.len() as u32);
        self.places.push(PlaceState { var: v, disp: None });
        self.builder_mut(b).force_stack.push((v, place));
        Ok(place)
    }

    /// The value stored in a frame place, usable in further operations.
    pub fn genop_absorb_place(&mut self, place: PlaceId) -> Value {
        self.places[place.0 as usize].var
    }

    /// RBP-relative offset of a place; known once its block was generated.
    pub fn place_offset(&self, place: PlaceId) -> CompileResult<i32> {
        self.places[place.0 as usize]
            .disp
            .ok_or(CompileError::Unsupported("frame place not yet generated"))
    }

    /// Read a place from a paused/running frame given its base pointer.
    ///
    /// # Safety
    /// `base` must be the frame base (RBP) of a live activation of a graph
    /// built by this generator.
    pub unsafe fn read_frame_place(&self, base: i64, place: PlaceId) -> CompileResult<i64> {
        let disp = self.place_offset(place)?;
        Ok(peek_word((base + disp as i64) as usize))
    }

    /// Write a place in a paused/running frame.
    ///
    /// # Safety
    /// See [`Generator::read_frame_place`].
    pub unsafe fn write_frame_place(
        &self,
        base: i64,
        place: PlaceId,
        value: i64,
    ) -> CompileResult<()> {
        let disp = self.place_offset(place)?;
        poke_word((base + disp as i64) as usize, value);
        Ok(())
    }

    /// Read one of the values registered through `get_frame_info`.
    ///
    /// # Safety
    /// See [`Generator::read_frame_place`].
    pub unsafe fn read_frame_var(&self, base: i64, info: &FrameInfo) -> CompileResult<i64> {
        match info {
            FrameInfo::Const(i) => Ok(*i),
            FrameInfo::Place(p) => self.read_frame_place(base, *p),
        }
    }

    // ==== FLEXSWITCH ====

    /// Close the block switching on `switch_value` and open a growable
    /// dispatch: returns the switch handle and the default-case builder,
    /// which must be generated before any case is added.
    pub fn flexswitch(
        &mut self,
        b: BuilderId,
        switch_value: Value,
        args: &[Value],
    ) -> CompileResult<(SwitchId, BuilderId)> {
        let finals = dedup_vars(args);
        let block =
            self.generate_block_code(b, &finals, &[(switch_value, Loc::Reg(Reg::Rax))], 0)?;
        let mut mc = block.mc;

        let sw = SwitchId(self.switches.len() as u32);
        let (inputs, input_locs) = {
            let st = &self.builders[b.0 as usize];
            (st.inputs.clone(), st.input_locs.clone())
        };
        self.switches.push(SwitchState {
            inputs: inputs.clone(),
            input_locs: input_locs.clone(),
            next_free: 0,
            end_free: 0,
            default_addr: 0,
        });
        self.switch_reserve(sw, &mut mc)?;

        let default_b = self.new_builder(inputs, input_locs);
        let (start, end) = {
            let s = &self.switches[sw.0 as usize];
            (s.next_free, s.end_free)
        };
        let mut w = unsafe { CodeWriter::window(start, end) };
        self.set_coming_from(default_b, &mut w, None)?;
        w.done();
        self.builder_mut(default_b).update_switch_default = Some(sw);
        self.start_writing(default_b)?;

        self.finish_mc(mc, block.entry);
        Ok((sw, default_b))
    }

    /// Seed a dispatch reservation at the writer's position: an illegal-
    /// instruction guard followed by zero fill.
    fn switch_reserve(&mut self, sw: SwitchId, mc: &mut CodeWriter) -> CompileResult<()> {
        let pos = mc.tell();
        mc.ud2()?;
        for _ in 0..SWITCH_RESERVE - 2 {
            mc.write_u8(0)?;
        }
        let s = &mut self.switches[sw.0 as usize];
        s.next_free = pos;
        s.end_free = pos + SWITCH_RESERVE;
        Ok(())
    }

    /// The reservation is exhausted: carve a new one and link the old area
    /// to it with an unconditional jump, keeping every previously emitted
    /// case jump valid.
    fn switch_reserve_more(&mut self, sw: SwitchId) -> CompileResult<()> {
        let (start, end) = {
            let s = &self.switches[sw.0 as usize];
            (s.next_free, s.end_free)
        };
        let mut newmc = self.pool.open()?;
        self.switch_reserve(sw, &mut newmc)?;
        self.pool.close(newmc);
        let target = self.switches[sw.0 as usize].next_free;
        let mut w = unsafe { CodeWriter::window(start, end) };
        w.emit_jump(None, target)?;
        w.done();
        log::debug!("flexswitch grew to a new reservation at {:#x}", target);
        Ok(())
    }

    /// Register a new case. The returned builder receives the switch
    /// block's values at the locations they had when the switch was
    /// created.
    pub fn switch_add_case(&mut self, sw: SwitchId, value: i64) -> CompileResult<BuilderId> {
        if self.switches[sw.0 as usize].default_addr == 0 {
            return Err(CompileError::SwitchDefaultMissing);
        }
        if i32::try_from(value).is_err() {
            return Err(CompileError::CaseRange(value));
        }
        let (inputs, input_locs) = {
            let s = &self.switches[sw.0 as usize];
            (s.inputs.clone(), s.input_locs.clone())
        };
        let target = self.new_builder(inputs, input_locs);
        match self.try_add_case(sw, value, target) {
            Ok(()) => {}
            Err(CompileError::BlockFull) => {
                self.switch_reserve_more(sw)?;
                self.try_add_case(sw, value, target)?;
            }
            Err(e) => return Err(e),
        }
        self.start_writing(target)?;
        Ok(target)
    }

    fn try_add_case(
        &mut self,
        sw: SwitchId,
        value: i64,
        target: BuilderId,
    ) -> CompileResult<()> {
        let (start, end, default_addr) = {
            let s = &self.switches[sw.0 as usize];
            (s.next_free, s.end_free, s.default_addr)
        };
        let mut w = unsafe { CodeWriter::window(start, end) };
        w.alu(AluOp::Cmp, &Operand::Reg(Reg::Rax), &Operand::Imm(value))?;
        self.set_coming_from(target, &mut w, Some(Cond::E))?;
        let pos = w.tell();
        w.emit_jump(None, default_addr)?;
        w.done();
        self.switches[sw.0 as usize].next_free = pos;
        Ok(())
    }

    // ==== BLOCK GENERATION ====

    /// Record an open jump at the writer's position, to be re-encoded once
    /// builder `b` has code.
    pub(crate) fn set_coming_from(
        &mut self,
        b: BuilderId,
        mc: &mut CodeWriter,
        cond: Option<Cond>,
    ) -> CompileResult<()> {
        let start = mc.tell();
        mc.emit_jump_placeholder(cond)?;
        let end = mc.tell();
        self.builder_mut(b).coming_from = Some(PendingJump { start, end, cond });
        Ok(())
    }

    /// Pick a chunk to write into and deal with the pending incoming jump:
    /// if the new code begins exactly where the placeholder ends, the
    /// placeholder is overwritten in place; otherwise it is left for
    /// patching after the block emits successfully.
    fn start_mc(
        &mut self,
        b: BuilderId,
        force_fresh: bool,
    ) -> CompileResult<(CodeWriter, usize, Option<PendingJump>)> {
        let mut mc = if force_fresh {
            self.pool.open_fresh()?
        } else {
            self.pool.open()?
        };
        let mut entry = mc.tell();
        let st = self.builder_mut(b);
        let mut fallthrough_restore = None;
        if let Some(pj) = st.coming_from.take() {
            if pj.end == entry && st.update_switch_default.is_none() {
                // The jump would land exactly after itself; drop it and
                // continue writing over it.
                mc.seekback(pj.end - pj.start);
                entry = pj.start;
                fallthrough_restore = Some(pj);
            } else {
                st.coming_from = Some(pj);
            }
        }
        Ok((mc, entry, fallthrough_restore))
    }

    /// Re-encode the pending incoming jump to land on `target`, and let a
    /// flexswitch know its default case address if this builder is one.
    fn patch_coming_from(&mut self, b: BuilderId, target: usize) -> CompileResult<()> {
        let upd = self.builder_mut(b).update_switch_default.take();
        if let Some(sw) = upd {
            self.switches[sw.0 as usize].default_addr = target;
        }
        if let Some(pj) = self.builder_mut(b).coming_from.take() {
            let mut w = unsafe { CodeWriter::window(pj.start, pj.end) };
            w.emit_jump(pj.cond, target)?;
            w.done();
        }
        Ok(())
    }

    /// Emit the frame-depth adjustment with a placeholder displacement;
    /// returns the displacement's address for the later patch.
    fn emit_frame_lea(mc: &mut CodeWriter) -> CompileResult<usize> {
        // lea rsp, [rbp + disp32]; always the 32-bit form so the patch
        // fits whatever depth the block turns out to need.
        mc.write_bytes(&[0x48, 0x8D, 0xA5])?;
        let at = mc.tell();
        mc.write_i32(0)?;
        Ok(at)
    }

    /// Generate machine code for the builder's accumulated operations.
    /// `finals` survive the block; `force_end` moves values into required
    /// locations at the end; `min_frame_bytes` keeps the frame at least as
    /// deep as a back-jump target expects. On success the builder's inputs
    /// are rebound to the finals at their end-of-block locations.
    pub(crate) fn generate_block_code(
        &mut self,
        b: BuilderId,
        finals: &[Value],
        force_end: &[(Value, Loc)],
        min_frame_bytes: i32,
    ) -> CompileResult<GeneratedBlock> {
        let ops = self
            .builder_mut(b)
            .ops
            .take()
            .ok_or(CompileError::NotWriting)?;
        let force_stack = std::mem::take(&mut self.builder_mut(b).force_stack);

        // Values the next block must still find: the caller's finals plus
        // every variable forced into a frame place.
        let mut keep: Vec<Value> = finals.to_vec();
        for (v, _) in &force_stack {
            if !keep.contains(v) {
                keep.push(*v);
            }
        }
        let mut all_finals = keep.clone();
        for (v, _) in force_end {
            all_finals.push(*v);
        }

        let mut attempt = 0;
        loop {
            let analysis = analyze(&ops, &all_finals);
            let (mc, entry, fallthrough_restore) = self.start_mc(b, attempt > 0)?;
            let mut alloc = RegAllocator::new(mc, analysis);
            {
                let st = &self.builders[b.0 as usize];
                for (v, loc) in st.inputs.iter().zip(st.input_locs.iter()) {
                    alloc.seed_input(*v, *loc);
                }
            }

            let outcome = (|| -> CompileResult<usize> {
                let frame_patch = Self::emit_frame_lea(&mut alloc.mc)?;
                for idx in 0..ops.len() {
                    if alloc.dead[idx] {
                        continue;
                    }
                    let node = &ops[idx];
                    alloc.begin_op(idx, node.op.name());
                    if node.op.clobbers_cc() {
                        alloc.clobber_cc()?;
                    }
                    self.gen_op(&mut alloc, node)?;
                }
                alloc.begin_op(ops.len(), "block exit");
                for (v, place) in &force_stack {
                    let disp = alloc.force_to_slot(*v)?;
                    self.places[place.0 as usize].disp = Some(disp);
                }
                alloc.force_at_end(force_end)?;
                Ok(frame_patch)
            })();

            // The caller emits a tail right behind the block; a chunk too
            // full for that counts as an overflow of this block.
            let outcome = match outcome {
                Ok(_) if alloc.mc.remaining() < TAIL_ROOM => Err(CompileError::BlockFull),
                other => other,
            };

            match outcome {
                Ok(frame_patch) => {
                    let frame = alloc.frame_bytes(min_frame_bytes);
                    let mut w = unsafe { CodeWriter::window(frame_patch, frame_patch + 4) };
                    w.write_i32(-frame)?;
                    w.done();
                    for label in alloc.labels_in_block.drain(..) {
                        self.labels[label.0 as usize].frame_bytes = frame;
                    }
                    let locs = alloc.capture_locs(&keep)?;
                    {
                        let st = self.builder_mut(b);
                        st.inputs = keep.clone();
                        st.input_locs = locs;
                    }
                    self.patch_coming_from(b, entry)?;
                    self.stats.blocks_closed += 1;
                    self.stats.spills += alloc.spills;
                    return Ok(GeneratedBlock {
                        mc: alloc.mc,
                        entry,
                    });
                }
                Err(CompileError::BlockFull) if attempt == 0 => {
                    // Back out and retry once in a fresh chunk. A consumed
                    // fall-through placeholder is re-established first.
                    if let Some(pj) = fallthrough_restore {
                        let mut w = unsafe { CodeWriter::window(pj.start, pj.end) };
                        w.emit_jump_placeholder(pj.cond)?;
                        w.done();
                        self.builder_mut(b).coming_from = Some(pj);
                    }
                    log::warn!("block overflowed its chunk; retrying in a fresh one");
                    self.pool.abandon(alloc.mc);
                    attempt = 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close out a finished block: dump it to the trace log, account its
    /// bytes and hand the chunk back to the pool.
    pub(crate) fn finish_mc(&mut self, mc: CodeWriter, start: usize) {
        let end = mc.tell();
        if log::log_enabled!(log::Level::Trace) && end > start {
            crate::x64::dump::trace_range(start, end);
        }
        self.stats.code_bytes += (end - start) as u64;
        self.pool.close(mc);
    }
}

/// Unique variables from a value list, in first-appearance order.
fn dedup_vars(values: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !v.is_const() && !out.contains(v) {
            out.push(*v);
        }
    }
    out
}
