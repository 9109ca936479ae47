// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The chain solver.
//!
//! A [`Solver`] is built from an immutable graph and a request vector and
//! driven by [`Solver::resume`]: it runs until every request is satisfied
//! or it needs something only the host can provide — a group shape, a
//! user-mapping result, a given value, or a model execution — and then
//! yields a [`Status`] describing the need. Host-supplied inputs land in
//! solver-owned caches (`shape`/`shape_table`, `provide_mapping`,
//! `give`/`give_all`, the model-call return slots), and the next `resume`
//! re-enters the suspended step, which now finds its input cached.
//!
//! The suspension machinery is a reified state machine: the main loop is a
//! phase cursor, chain selection runs on an explicit bounded frame stack,
//! and materialization on an explicit op stack, all owned by the solver.
//! Dropping the solver cancels everything and releases all of its state
//! at once; the graph is shared and untouched.
//!
//! Solving has two passes over the request vector, in request order:
//! first chain selection for every requested instance, then value
//! materialization plus the gather into request buffers, in subset
//! iteration order.

mod chain;
mod value;

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::bitmap;
use crate::graph::Graph;
use crate::idx::{Group, Idx, Inst, MAX_INST};
use crate::status::{EntityTag, ErrorCode, ErrorInfo, ErrorSite, Status};
use crate::subset::{InstRange, Subset, SubsetIter, SubsetPool};

pub(crate) use chain::{ChainFrame, ChainResult};
pub(crate) use value::ValueOp;

/// Maximum admissible chain cost. Kept well under 2^24 so the f32 cost
/// arithmetic stays exact enough for comparisons near the bound.
pub(crate) const MAX_COST: f32 = 1_000_000.0;

/// Chain-solver stack depth.
pub(crate) const CHAIN_STACK_DEPTH: usize = 32;

const SHAPE_UNSET: Inst = 0xffff;

const SP_CHAIN: u32 = 1 << 31;
const SP_VALUE: u32 = 1 << 30;
/// Negative-NaN sentinel: "this instance is on the search path right now".
const MARK_BITS: u32 = 0xffc0_0000;

/// Per-instance search state word.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ssp {
    pub(crate) cost: f32,
    pub(crate) state: u32,
}

impl Ssp {
    fn new(cost: f32) -> Self {
        Self { cost, state: 0 }
    }

    pub(crate) fn has_chain(self) -> bool {
        self.state & SP_CHAIN != 0
    }

    pub(crate) fn has_value(self) -> bool {
        self.state & SP_VALUE != 0
    }

    pub(crate) fn is_marked(self) -> bool {
        self.cost.to_bits() == MARK_BITS
    }

    /// Chain selected or proven unreachable; nothing more to search.
    pub(crate) fn is_done(self) -> bool {
        self.state != 0 || self.cost == f32::INFINITY
    }

    pub(crate) fn chain_edge(self) -> usize {
        ((self.state >> 16) & 0xff) as usize
    }

    pub(crate) fn chain_inst(self) -> Inst {
        (self.state & 0xffff) as Inst
    }

    pub(crate) fn set_mark(&mut self) {
        self.cost = f32::from_bits(MARK_BITS);
    }

    pub(crate) fn set_chain(&mut self, cost: f32, edge: usize, inst: Inst) {
        self.cost = cost;
        self.state = SP_CHAIN | ((edge as u32) << 16) | u32::from(inst);
    }

    pub(crate) fn set_model_chain(&mut self, cost: f32) {
        self.cost = cost;
        self.state = SP_CHAIN;
    }

    pub(crate) fn set_value_flag(&mut self) {
        self.state |= SP_VALUE;
    }
}

/// Value storage of one variable.
#[derive(Debug)]
enum ValueBuf {
    /// Solver-allocated or host-lent (`use_mem`) writable buffer.
    Vec(Vec<u8>),
    /// Host-shared read-only buffer (`give_all`).
    Shared(Bytes),
}

impl ValueBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Vec(v) => v.as_slice(),
            Self::Shared(b) => b.as_ref(),
        }
    }
}

/// Given-value tracking of one given variable.
#[derive(Debug, Default)]
enum GivenBits {
    /// Nothing supplied yet.
    #[default]
    None,
    /// `give_all`: every instance is present in the shared buffer.
    All {
        /// Buffer length validated against the group shape.
        checked: bool,
    },
    /// Per-instance bitmap.
    Bits(Box<[u64]>),
}

#[derive(Debug, Default)]
struct VarSlot {
    sp: Option<Box<[Ssp]>>,
    given: GivenBits,
    value: Option<ValueBuf>,
    /// Buffer came from `use_mem`; length still needs validation.
    mem_checked: bool,
}

#[derive(Debug, Default)]
struct ModelSlot {
    sp: Option<Box<[Ssp]>>,
    /// Per `(instance, return edge)` buffers, absent under direct writes.
    ret: Option<Box<[Option<Vec<u8>>]>>,
}

#[derive(Debug, Default)]
struct MapCache {
    fwd: Option<Box<[Subset]>>,
    inv: Option<Box<[Subset]>>,
}

/// One entry of the request vector.
#[derive(Debug)]
pub struct Request {
    idx: Idx,
    ss: Subset,
    buf: Option<Vec<u8>>,
}

impl Request {
    /// Requests `ss` of variable `idx` without an output buffer.
    #[must_use]
    pub fn new(idx: Idx, ss: Subset) -> Self {
        Self { idx, ss, buf: None }
    }

    /// Requests `ss` of variable `idx`, gathering values into `buf` (the
    /// buffer is resized to fit and recovered with
    /// [`Solver::take_buffer`] after completion).
    #[must_use]
    pub fn with_buffer(idx: Idx, ss: Subset, buf: Vec<u8>) -> Self {
        Self {
            idx,
            ss,
            buf: Some(buf),
        }
    }

    /// Requested variable.
    #[must_use]
    pub fn idx(&self) -> Idx {
        self.idx
    }

    /// Requested instances.
    #[must_use]
    pub fn subset(&self) -> Subset {
        self.ss
    }
}

/// Scratch buffer pool for gathering non-contiguous parameter subsets.
#[derive(Debug)]
struct Scratch {
    free: u32,
    slots: Vec<Vec<u8>>,
}

const SCRATCH_SLOTS: usize = 32;
const SCRATCH_MIN_ALLOC: usize = 512;

impl Scratch {
    fn new() -> Self {
        Self {
            free: u32::MAX,
            slots: (0..SCRATCH_SLOTS).map(|_| Vec::new()).collect(),
        }
    }

    /// Claims a slot with at least `size` bytes, growing one if needed.
    fn acquire(&mut self, size: usize) -> Result<u8, ErrorInfo> {
        let mut free = self.free;
        while free != 0 {
            let idx = free.trailing_zeros() as usize;
            free &= free - 1;
            if self.slots[idx].len() >= size && !self.slots[idx].is_empty() {
                self.free &= !(1 << idx);
                return Ok(idx as u8);
            }
        }
        if self.free == 0 {
            return Err(ErrorInfo::new(ErrorCode::Mem, ErrorSite::Scratch));
        }
        let idx = self.free.trailing_zeros() as usize;
        let grown = (size * 2).max(SCRATCH_MIN_ALLOC);
        self.slots[idx] = vec![0; grown];
        self.free &= !(1 << idx);
        Ok(idx as u8)
    }

    fn release(&mut self, mask: u32) {
        self.free |= mask;
    }
}

/// Where a staged model-call edge's bytes live.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallBuf {
    /// Empty mapped set; no data.
    Empty,
    /// Contiguous parameter bytes straight out of a value buffer.
    VarRead {
        xi: Idx,
        off: usize,
        len: usize,
    },
    /// Parameter bytes gathered into a scratch slot.
    Scratch {
        slot: u8,
        len: usize,
    },
    /// Return buffer slot of the called model.
    RetBuf {
        ri: u8,
    },
    /// Direct write into a consumer's value buffer.
    VarWrite {
        xi: Idx,
        off: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CallEdge {
    pub(crate) n: usize,
    pub(crate) buf: CallBuf,
}

/// A staged model call awaiting host execution.
#[derive(Debug)]
pub(crate) struct ModelCallState {
    pub(crate) mi: Idx,
    pub(crate) inst: Inst,
    pub(crate) np: u8,
    pub(crate) nr: u8,
    pub(crate) scratch_mask: u32,
    pub(crate) edges: Vec<CallEdge>,
}

/// What the last yield is waiting on.
#[derive(Debug, Clone, Copy)]
enum Pending {
    Shape(Group),
    Map {
        index: u16,
        inverse: bool,
        inst: Inst,
    },
    Given {
        var: Idx,
        inst: Inst,
    },
    Model,
}

/// Top-level solve cursor.
#[derive(Debug, Clone, Copy)]
enum Phase {
    SelectReq(usize),
    SelectIter {
        req: usize,
        it: SubsetIter,
    },
    CollectReq(usize),
    CollectIter {
        req: usize,
        it: SubsetIter,
    },
    CollectGather(usize),
    Done,
}

/// A cost write that must be rolled back unless a chain materialized:
/// infinities reached through a cycle depend on where the search entered
/// it and must not outlive the top-level selection.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Poison {
    Var {
        xi: Idx,
        inst: Inst,
        prev: f32,
    },
    Model {
        mi: Idx,
        inst: Inst,
        prev: f32,
    },
}

/// Cooperative chain solver over one request vector.
///
/// See the module docs for the drive loop. All state (search words, value
/// buffers, caches, scratch) is owned by the solver and dropped with it.
#[derive(Debug)]
pub struct Solver {
    g: Arc<Graph>,
    pool: SubsetPool,
    reqs: Vec<Request>,
    vars: Vec<VarSlot>,
    models: Vec<ModelSlot>,
    maps: Vec<MapCache>,
    shapes: Box<[Inst]>,
    scratch: Scratch,
    phase: Phase,
    pub(crate) chain: Vec<ChainFrame>,
    pub(crate) chain_result: ChainResult,
    pub(crate) poison: Vec<Poison>,
    pub(crate) value: Vec<ValueOp>,
    call: Option<ModelCallState>,
    pending: Option<Pending>,
    fatal: Option<ErrorInfo>,
}

impl Solver {
    /// Creates a solver over `graph` answering `requests`.
    ///
    /// `pool` must be the pool any complex request subsets were built in;
    /// it also backs mapping results the host supplies later.
    #[must_use]
    pub fn new(graph: Arc<Graph>, pool: SubsetPool, requests: Vec<Request>) -> Self {
        let nv = graph.var_count();
        let nm = graph.model_count();
        let nu = graph.user_map_count();
        let ng = usize::from(graph.group_count());
        Self {
            g: graph,
            pool,
            reqs: requests,
            vars: (0..nv).map(|_| VarSlot::default()).collect(),
            models: (0..nm).map(|_| ModelSlot::default()).collect(),
            maps: (0..nu).map(|_| MapCache::default()).collect(),
            shapes: vec![SHAPE_UNSET; ng].into_boxed_slice(),
            scratch: Scratch::new(),
            phase: Phase::SelectReq(0),
            chain: Vec::with_capacity(CHAIN_STACK_DEPTH),
            chain_result: ChainResult::default(),
            poison: Vec::new(),
            value: Vec::new(),
            call: None,
            pending: None,
            fatal: None,
        }
    }

    /// The graph this solver runs against.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.g
    }

    /// Advances the solve. Returns [`Status::Ok`] when every request is
    /// satisfied, a request status when host input is needed, or a sticky
    /// [`Status::Error`].
    pub fn resume(&mut self) -> Status {
        if let Some(e) = self.fatal {
            return Status::Error(e);
        }
        if let Some(p) = self.pending.take() {
            if let Err(e) = self.check_pending(p) {
                return self.fail(e);
            }
        }
        match self.run() {
            Ok(()) => Status::Ok,
            Err(Status::Error(e)) => {
                self.fatal = Some(e);
                Status::Error(e)
            }
            Err(status) => status,
        }
    }

    fn fail(&mut self, e: ErrorInfo) -> Status {
        self.fatal = Some(e);
        Status::Error(e)
    }

    /// Verifies that the input the last yield asked for actually arrived.
    fn check_pending(&mut self, p: Pending) -> Result<(), ErrorInfo> {
        match p {
            Pending::Shape(group) => {
                if self.shapes[usize::from(group)] == SHAPE_UNSET {
                    return Err(ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Shape)
                        .with(EntityTag::Group, group));
                }
            }
            Pending::Map {
                index,
                inverse,
                inst,
            } => {
                let cache = &self.maps[usize::from(index)];
                let dir = if inverse { &cache.inv } else { &cache.fwd };
                let missing = dir
                    .as_ref()
                    .is_none_or(|c| c[usize::from(inst)] == Subset::UNSET);
                if missing {
                    return Err(ErrorInfo::new(ErrorCode::Value, ErrorSite::Map)
                        .with(EntityTag::Map, index)
                        .with(EntityTag::Inst, inst));
                }
            }
            Pending::Given { var, inst } => {
                let ok = match &self.vars[var.var_slot()].given {
                    GivenBits::All { .. } => true,
                    GivenBits::Bits(b) => bitmap::is_set(b, inst),
                    GivenBits::None => false,
                };
                if !ok {
                    return Err(ErrorInfo::new(ErrorCode::Value, ErrorSite::Give)
                        .with(EntityTag::Var, var.wire())
                        .with(EntityTag::Inst, inst));
                }
            }
            Pending::Model => {}
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), Status> {
        loop {
            if !self.value.is_empty() {
                self.run_value()?;
                continue;
            }
            if !self.chain.is_empty() {
                self.run_chain()?;
                continue;
            }
            match self.phase {
                Phase::SelectReq(i) => {
                    if i >= self.reqs.len() {
                        self.phase = Phase::CollectReq(0);
                        continue;
                    }
                    let (idx, ss) = (self.reqs[i].idx, self.reqs[i].ss);
                    if !idx.is_var() || idx.var_slot() >= self.g.var_count() {
                        return Err(Status::Error(
                            ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Solver)
                                .with(EntityTag::Var, idx.wire()),
                        ));
                    }
                    if ss.is_empty() || self.g.var(idx).is_given() {
                        self.phase = Phase::SelectReq(i + 1);
                        continue;
                    }
                    self.ensure_var_sp(idx)?;
                    let it = ss.first(&self.pool);
                    self.phase = Phase::SelectIter { req: i, it };
                }
                Phase::SelectIter { req, it } => {
                    if it.is_done() {
                        self.phase = Phase::SelectReq(req + 1);
                        continue;
                    }
                    let (idx, ss) = (self.reqs[req].idx, self.reqs[req].ss);
                    let inst = it.inst();
                    let sp = match self.var_sp(idx).get(usize::from(inst)) {
                        Some(sp) => *sp,
                        None => {
                            // Requested instance outside the group shape.
                            return Err(Status::Error(
                                ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Solver)
                                    .with(EntityTag::Var, idx.wire())
                                    .with(EntityTag::Inst, inst),
                            ));
                        }
                    };
                    if sp.is_done() {
                        self.phase = Phase::SelectIter {
                            req,
                            it: it.next(ss, &self.pool),
                        };
                        continue;
                    }
                    self.push_chain_root(idx, inst)?;
                }
                Phase::CollectReq(i) => {
                    if i >= self.reqs.len() {
                        self.phase = Phase::Done;
                        continue;
                    }
                    let (idx, ss) = (self.reqs[i].idx, self.reqs[i].ss);
                    if ss.is_empty() {
                        self.phase = Phase::CollectReq(i + 1);
                        continue;
                    }
                    if self.g.var(idx).is_given() {
                        let n = self.ensure_shape(self.g.var(idx).group())?;
                        if ss.ranges(&self.pool).any(|r| r.end() > n) {
                            return Err(Status::Error(
                                ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Solver)
                                    .with(EntityTag::Var, idx.wire()),
                            ));
                        }
                        self.ensure_given(idx, ss)?;
                        self.phase = Phase::CollectGather(i);
                        continue;
                    }
                    let it = ss.first(&self.pool);
                    self.phase = Phase::CollectIter { req: i, it };
                }
                Phase::CollectIter { req, it } => {
                    if it.is_done() {
                        self.phase = Phase::CollectGather(req);
                        continue;
                    }
                    let (idx, ss) = (self.reqs[req].idx, self.reqs[req].ss);
                    let inst = it.inst();
                    let sp = self.var_sp(idx)[usize::from(inst)];
                    if !sp.has_chain() {
                        return Err(Status::Error(
                            ErrorInfo::new(ErrorCode::Chain, ErrorSite::Solver)
                                .with(EntityTag::Var, idx.wire())
                                .with(EntityTag::Inst, inst),
                        ));
                    }
                    if sp.has_value() {
                        self.phase = Phase::CollectIter {
                            req,
                            it: it.next(ss, &self.pool),
                        };
                        continue;
                    }
                    self.value.push(ValueOp::var(idx, inst));
                }
                Phase::CollectGather(i) => {
                    self.gather_request(i)?;
                    self.phase = Phase::CollectReq(i + 1);
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    /// Copies requested values into the request's buffer, subset order.
    fn gather_request(&mut self, i: usize) -> Result<(), Status> {
        let idx = self.reqs[i].idx;
        let ss = self.reqs[i].ss;
        if self.reqs[i].buf.is_none() {
            return Ok(());
        }
        let size = self.g.var(idx).size();
        let total = ss.size(&self.pool) * size;
        let src_missing = self.vars[idx.var_slot()].value.is_none();
        if src_missing {
            // Requested a given variable that was never supplied.
            return Err(Status::Error(
                ErrorInfo::new(ErrorCode::Value, ErrorSite::Give).with(EntityTag::Var, idx.wire()),
            ));
        }
        let ranges: Vec<InstRange> = ss.ranges(&self.pool).collect();
        let slot = &self.vars[idx.var_slot()];
        let src = slot.value.as_ref().map_or(&[][..], ValueBuf::as_slice);
        let buf = match self.reqs[i].buf.as_mut() {
            Some(b) => b,
            None => return Ok(()),
        };
        buf.clear();
        buf.reserve(total);
        for r in ranges {
            let a = usize::from(r.start()) * size;
            let b = usize::from(r.end()) * size;
            buf.extend_from_slice(&src[a..b]);
        }
        Ok(())
    }

    // ---- host inputs -------------------------------------------------

    /// Sets the instance count of `group`. A shape entry is immutable
    /// once set.
    pub fn shape(&mut self, group: Group, count: Inst) -> Result<(), ErrorInfo> {
        let gi = usize::from(group);
        if gi >= self.shapes.len() || count > MAX_INST {
            return Err(
                ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Shape).with(EntityTag::Group, group)
            );
        }
        if self.shapes[gi] != SHAPE_UNSET {
            return Err(
                ErrorInfo::new(ErrorCode::Rewrite, ErrorSite::Shape).with(EntityTag::Group, group)
            );
        }
        trace!(group, count, "shape");
        self.shapes[gi] = count;
        Ok(())
    }

    /// Sets every group's instance count at once.
    pub fn shape_table(&mut self, counts: &[Inst]) -> Result<(), ErrorInfo> {
        if counts.len() != self.shapes.len() || counts.iter().any(|&c| c > MAX_INST) {
            return Err(ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Shape));
        }
        if self.shapes.iter().any(|&s| s != SHAPE_UNSET) {
            return Err(ErrorInfo::new(ErrorCode::Rewrite, ErrorSite::Shape));
        }
        self.shapes.copy_from_slice(counts);
        Ok(())
    }

    /// Supplies one instance of a given variable.
    ///
    /// The group's shape must be known (it always is when answering a
    /// [`Status::GivenValue`]). Overwriting a supplied instance or a
    /// `give_all` buffer is a rewrite error.
    pub fn give(&mut self, var: Idx, inst: Inst, bytes: &[u8]) -> Result<(), ErrorInfo> {
        let arg_err = |code| {
            ErrorInfo::new(code, ErrorSite::Give)
                .with(EntityTag::Var, var.wire())
                .with(EntityTag::Inst, inst)
        };
        if !var.is_var()
            || var.var_slot() >= self.g.var_count()
            || !self.g.var(var).is_given()
            || bytes.len() != self.g.var(var).size()
        {
            return Err(arg_err(ErrorCode::Invalid));
        }
        let group = self.g.var(var).group();
        let Some(n) = self.shape_of(group) else {
            return Err(
                ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Shape).with(EntityTag::Group, group)
            );
        };
        if inst >= n {
            return Err(arg_err(ErrorCode::Invalid));
        }
        let size = self.g.var(var).size();
        let slot = &mut self.vars[var.var_slot()];
        let off = usize::from(inst) * size;
        if let Some(ValueBuf::Vec(v)) = &slot.value {
            // A lent buffer must actually cover the instance.
            if v.len() < off + size {
                return Err(arg_err(ErrorCode::Invalid));
            }
        }
        match &mut slot.given {
            GivenBits::All { .. } => return Err(arg_err(ErrorCode::Rewrite)),
            GivenBits::Bits(b) => {
                if bitmap::is_set(b, inst) {
                    return Err(arg_err(ErrorCode::Rewrite));
                }
                bitmap::set(b, inst);
            }
            g @ GivenBits::None => {
                let mut b = bitmap::alloc(usize::from(n));
                bitmap::set(&mut b, inst);
                *g = GivenBits::Bits(b);
            }
        }
        if slot.value.is_none() {
            slot.value = Some(ValueBuf::Vec(vec![0; usize::from(n) * size]));
        }
        if let Some(ValueBuf::Vec(v)) = &mut slot.value {
            v[off..off + size].copy_from_slice(bytes);
        }
        trace!(var = %self.g.label(var), inst, "give");
        Ok(())
    }

    /// Supplies every instance of a given variable from one shared buffer
    /// (length validated against the group shape on first use). May only
    /// be called once, and not after any per-instance `give`.
    pub fn give_all(&mut self, var: Idx, bytes: Bytes) -> Result<(), ErrorInfo> {
        let arg_err =
            |code| ErrorInfo::new(code, ErrorSite::Give).with(EntityTag::Var, var.wire());
        if !var.is_var() || var.var_slot() >= self.g.var_count() || !self.g.var(var).is_given() {
            return Err(arg_err(ErrorCode::Invalid));
        }
        let slot = &mut self.vars[var.var_slot()];
        if !matches!(slot.given, GivenBits::None) || slot.value.is_some() {
            return Err(arg_err(ErrorCode::Rewrite));
        }
        slot.given = GivenBits::All { checked: false };
        slot.value = Some(ValueBuf::Shared(bytes));
        trace!(var = %self.g.label(var), "give all");
        Ok(())
    }

    /// Lends a host buffer as the variable's value storage (validated
    /// against the group shape on first use; recover it with
    /// [`Solver::take_mem`]).
    pub fn use_mem(&mut self, var: Idx, buf: Vec<u8>) -> Result<(), ErrorInfo> {
        let arg_err =
            |code| ErrorInfo::new(code, ErrorSite::Mem).with(EntityTag::Var, var.wire());
        if !var.is_var() || var.var_slot() >= self.g.var_count() {
            return Err(arg_err(ErrorCode::Invalid));
        }
        let slot = &mut self.vars[var.var_slot()];
        if slot.value.is_some() {
            return Err(arg_err(ErrorCode::Invalid));
        }
        slot.value = Some(ValueBuf::Vec(buf));
        slot.mem_checked = false;
        Ok(())
    }

    /// Takes back a variable's value buffer (for buffers lent with
    /// [`Solver::use_mem`], or to read solver-computed values out).
    pub fn take_mem(&mut self, var: Idx) -> Option<Vec<u8>> {
        match self.vars[var.var_slot()].value.take() {
            Some(ValueBuf::Vec(v)) => Some(v),
            other => {
                self.vars[var.var_slot()].value = other;
                None
            }
        }
    }

    /// Writes a user-mapping result. Answers [`Status::MapCall`] /
    /// [`Status::MapCallInv`]; pre-supplying is allowed once the source
    /// group's shape is known. Each `(map, direction, instance)` cell is
    /// written once.
    pub fn provide_mapping(
        &mut self,
        index: u16,
        inverse: bool,
        inst: Inst,
        ranges: &[InstRange],
    ) -> Result<(), ErrorInfo> {
        let arg_err = |code| {
            ErrorInfo::new(code, ErrorSite::Map)
                .with(EntityTag::Map, index)
                .with(EntityTag::Inst, inst)
        };
        if usize::from(index) >= self.maps.len() {
            return Err(arg_err(ErrorCode::Invalid));
        }
        let um = *self.g.user_map(index);
        let group = if inverse { um.target } else { um.source };
        let Some(n) = self.shape_of(group) else {
            return Err(arg_err(ErrorCode::Invalid));
        };
        if inst >= n {
            return Err(arg_err(ErrorCode::Invalid));
        }
        // Result instances live in the opposite group; bound them when its
        // shape is already known.
        let result_group = if inverse { um.source } else { um.target };
        if let Some(rn) = self.shape_of(result_group) {
            if ranges.iter().any(|r| r.end() > rn) {
                return Err(arg_err(ErrorCode::Invalid));
            }
        }
        let ss = self
            .pool
            .subset(ranges)
            .map_err(|_| arg_err(ErrorCode::Invalid))?;
        let cache = &mut self.maps[usize::from(index)];
        let dir = if inverse { &mut cache.inv } else { &mut cache.fwd };
        let cells = dir.get_or_insert_with(|| vec![Subset::UNSET; usize::from(n)].into_boxed_slice());
        if cells[usize::from(inst)] != Subset::UNSET {
            return Err(arg_err(ErrorCode::Rewrite));
        }
        cells[usize::from(inst)] = ss;
        trace!(map = index, inverse, inst, subset = %ss, "mapping");
        Ok(())
    }

    /// Parameter bytes of the staged model call (slot `i < np`). Empty
    /// when the mapped set is empty or no call is staged.
    #[must_use]
    pub fn call_param(&self, i: usize) -> &[u8] {
        let Some(call) = &self.call else { return &[] };
        if i >= usize::from(call.np) {
            return &[];
        }
        match call.edges[i].buf {
            CallBuf::VarRead { xi, off, len } => {
                &self.vars[xi.var_slot()]
                    .value
                    .as_ref()
                    .map_or(&[][..], ValueBuf::as_slice)[off..off + len]
            }
            CallBuf::Scratch { slot, len } => &self.scratch.slots[usize::from(slot)][..len],
            _ => &[],
        }
    }

    /// Number of instances behind call slot `i` (parameters and returns).
    #[must_use]
    pub fn call_edge_len(&self, i: usize) -> usize {
        self.call.as_ref().map_or(0, |c| c.edges[i].n)
    }

    /// Writable return bytes of the staged model call (`i < nr`). The
    /// host writes the computed values here before resuming. Empty when
    /// the mapped return set is empty.
    pub fn call_return(&mut self, i: usize) -> &mut [u8] {
        let (mi, inst, nr, buf) = match &self.call {
            Some(c) if i < usize::from(c.nr) => (
                c.mi,
                c.inst,
                usize::from(c.nr),
                c.edges[usize::from(c.np) + i].buf,
            ),
            _ => return &mut [],
        };
        match buf {
            CallBuf::VarWrite { xi, off, len } => match &mut self.vars[xi.var_slot()].value {
                Some(ValueBuf::Vec(v)) => &mut v[off..off + len],
                _ => &mut [],
            },
            CallBuf::RetBuf { ri } => {
                match self.models[mi.model_slot()].ret.as_mut() {
                    Some(table) => match &mut table[inst as usize * nr + usize::from(ri)] {
                        Some(v) => v.as_mut_slice(),
                        None => &mut [],
                    },
                    None => &mut [],
                }
            }
            _ => &mut [],
        }
    }

    /// Recovers a request's gathered buffer after [`Status::Ok`].
    pub fn take_buffer(&mut self, req: usize) -> Option<Vec<u8>> {
        self.reqs.get_mut(req).and_then(|r| r.buf.take())
    }

    /// Read-only view of a variable's value buffer, when allocated.
    #[must_use]
    pub fn value_bytes(&self, var: Idx) -> Option<&[u8]> {
        self.vars[var.var_slot()]
            .value
            .as_ref()
            .map(ValueBuf::as_slice)
    }

    /// Cost of the chain selected for `(var, inst)`, once selection ran.
    #[must_use]
    pub fn chain_cost(&self, var: Idx, inst: Inst) -> Option<f32> {
        let sp = self.vars[var.var_slot()]
            .sp
            .as_deref()?
            .get(usize::from(inst))?;
        sp.has_chain().then_some(sp.cost)
    }

    // ---- internal plumbing -------------------------------------------

    pub(crate) fn shape_of(&self, group: Group) -> Option<Inst> {
        match self.shapes.get(usize::from(group)) {
            Some(&s) if s != SHAPE_UNSET => Some(s),
            _ => None,
        }
    }

    /// Shape of `group`, or a shape yield.
    pub(crate) fn ensure_shape(&mut self, group: Group) -> Result<Inst, Status> {
        if let Some(n) = self.shape_of(group) {
            return Ok(n);
        }
        self.pending = Some(Pending::Shape(group));
        Err(Status::Shape { group })
    }

    /// Resolves `map` for `inst`, yielding for shapes or host mappings.
    pub(crate) fn map_subset(
        &mut self,
        map: crate::mapping::MapRef,
        inst: Inst,
    ) -> Result<Subset, Status> {
        use crate::mapping::MapKind;
        match map.kind() {
            MapKind::Ident => Ok(Subset::point(inst)),
            MapKind::Space => {
                let n = self.ensure_shape(map.space_target())?;
                Ok(Subset::range(0, n))
            }
            MapKind::User => {
                let index = map.user_index();
                let inverse = map.is_inverse();
                let um = *self.g.user_map(index);
                let group = if inverse { um.target } else { um.source };
                let n = self.ensure_shape(group)?;
                let cache = &mut self.maps[usize::from(index)];
                let dir = if inverse { &mut cache.inv } else { &mut cache.fwd };
                let cells = dir
                    .get_or_insert_with(|| vec![Subset::UNSET; usize::from(n)].into_boxed_slice());
                let cell = cells[usize::from(inst)];
                if cell != Subset::UNSET {
                    return Ok(cell);
                }
                self.pending = Some(Pending::Map {
                    index,
                    inverse,
                    inst,
                });
                Err(if inverse {
                    Status::MapCallInv { index, inst }
                } else {
                    Status::MapCall { index, inst }
                })
            }
        }
    }

    pub(crate) fn var_sp(&self, xi: Idx) -> &[Ssp] {
        self.vars[xi.var_slot()].sp.as_deref().unwrap_or(&[])
    }

    pub(crate) fn var_sp_mut(&mut self, xi: Idx) -> &mut [Ssp] {
        self.vars[xi.var_slot()].sp.as_deref_mut().unwrap_or(&mut [])
    }

    pub(crate) fn model_sp(&self, mi: Idx) -> &[Ssp] {
        self.models[mi.model_slot()].sp.as_deref().unwrap_or(&[])
    }

    pub(crate) fn model_sp_mut(&mut self, mi: Idx) -> &mut [Ssp] {
        self.models[mi.model_slot()]
            .sp
            .as_deref_mut()
            .unwrap_or(&mut [])
    }

    /// Allocates the search-state array of a computed variable.
    pub(crate) fn ensure_var_sp(&mut self, xi: Idx) -> Result<(), Status> {
        if self.vars[xi.var_slot()].sp.is_some() {
            return Ok(());
        }
        let n = self.ensure_shape(self.g.var(xi).group())?;
        self.vars[xi.var_slot()].sp =
            Some(vec![Ssp::new(0.0); usize::from(n)].into_boxed_slice());
        Ok(())
    }

    /// Allocates the search-state array of a model, bounds seeded at `k`.
    pub(crate) fn ensure_model_sp(&mut self, mi: Idx) -> Result<(), Status> {
        if self.models[mi.model_slot()].sp.is_some() {
            return Ok(());
        }
        let m = self.g.model(mi);
        let (group, k) = (m.group(), m.k());
        let n = self.ensure_shape(group)?;
        self.models[mi.model_slot()].sp =
            Some(vec![Ssp::new(k); usize::from(n)].into_boxed_slice());
        Ok(())
    }

    /// Allocates (or validates) the value buffer of a variable.
    pub(crate) fn ensure_var_value(&mut self, xi: Idx) -> Result<(), Status> {
        let size = self.g.var(xi).size();
        let group = self.g.var(xi).group();
        let n = usize::from(self.ensure_shape(group)?);
        let slot = &mut self.vars[xi.var_slot()];
        match &slot.value {
            None => {
                slot.value = Some(ValueBuf::Vec(vec![0; n * size]));
                slot.mem_checked = true;
            }
            Some(buf) => {
                if !slot.mem_checked {
                    if buf.as_slice().len() < n * size {
                        return Err(Status::Error(
                            ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Mem)
                                .with(EntityTag::Var, xi.wire()),
                        ));
                    }
                    slot.mem_checked = true;
                }
            }
        }
        Ok(())
    }

    /// Ensures every instance of `ss` of a given variable has a value,
    /// yielding a given-value request per missing instance.
    pub(crate) fn ensure_given(&mut self, xi: Idx, ss: Subset) -> Result<(), Status> {
        debug_assert!(self.g.var(xi).is_given());
        let group = self.g.var(xi).group();
        let size = self.g.var(xi).size();
        match &self.vars[xi.var_slot()].given {
            GivenBits::All { checked: true } => return Ok(()),
            GivenBits::All { checked: false } => {
                let n = usize::from(self.ensure_shape(group)?);
                let slot = &mut self.vars[xi.var_slot()];
                let long_enough = slot
                    .value
                    .as_ref()
                    .is_some_and(|b| b.as_slice().len() >= n * size);
                if !long_enough {
                    return Err(Status::Error(
                        ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Give)
                            .with(EntityTag::Var, xi.wire()),
                    ));
                }
                slot.given = GivenBits::All { checked: true };
                return Ok(());
            }
            GivenBits::Bits(_) | GivenBits::None => {}
        }
        if matches!(self.vars[xi.var_slot()].given, GivenBits::None) {
            let n = usize::from(self.ensure_shape(group)?);
            let slot = &mut self.vars[xi.var_slot()];
            slot.given = GivenBits::Bits(bitmap::alloc(n));
            if slot.value.is_none() {
                slot.value = Some(ValueBuf::Vec(vec![0; n * size]));
            }
        }
        let missing = match &self.vars[xi.var_slot()].given {
            GivenBits::Bits(b) => bitmap::find_zero_subset(b, ss, &self.pool),
            _ => None,
        };
        if let Some(inst) = missing {
            self.pending = Some(Pending::Given { var: xi, inst });
            return Err(Status::GivenValue { var: xi, inst });
        }
        Ok(())
    }

    /// Value bytes of one instance. The buffer must exist.
    pub(crate) fn var_bytes(&self, xi: Idx, inst: Inst) -> &[u8] {
        let size = self.g.var(xi).size();
        let buf = self.vars[xi.var_slot()]
            .value
            .as_ref()
            .map_or(&[][..], ValueBuf::as_slice);
        let off = usize::from(inst) * size;
        &buf[off..off + size]
    }

    /// Evaluates a shadow predicate over every instance of `ss`.
    pub(crate) fn check_subset(&self, c: &crate::graph::Check, ss: Subset) -> bool {
        let mut it = ss.first(&self.pool);
        while !it.is_done() {
            if !c.pred.eval(self.var_bytes(c.edge.target, it.inst())) {
                return false;
            }
            it = it.next(ss, &self.pool);
        }
        true
    }

    /// Writes a variable's no-chain cost, recording an undo entry for
    /// infinities (they may stem from a cycle).
    pub(crate) fn write_var_cost(&mut self, xi: Idx, inst: Inst, cost: f32, prev: f32) {
        if cost.is_infinite() {
            self.poison.push(Poison::Var { xi, inst, prev });
        }
        self.var_sp_mut(xi)[usize::from(inst)].cost = cost;
    }

    /// Raises a model instance's cost bound, recording an undo entry for
    /// infinities.
    pub(crate) fn write_model_cost(&mut self, mi: Idx, inst: Inst, cost: f32) {
        let sp = &mut self.model_sp_mut(mi)[usize::from(inst)];
        if cost.is_infinite() {
            let prev = sp.cost;
            sp.cost = cost;
            self.poison.push(Poison::Model { mi, inst, prev });
            return;
        }
        sp.cost = cost;
    }

    /// Rolls back infinite costs that never became chains. Runs when the
    /// outermost selection frame finishes, so cyclic infinities don't
    /// leak into later selections where the cycle may not exist.
    pub(crate) fn undo_poison(&mut self) {
        while let Some(p) = self.poison.pop() {
            match p {
                Poison::Var { xi, inst, prev } => {
                    let sp = &mut self.var_sp_mut(xi)[usize::from(inst)];
                    if !sp.has_chain() && sp.cost == f32::INFINITY {
                        sp.cost = prev;
                    }
                }
                Poison::Model { mi, inst, prev } => {
                    let sp = &mut self.model_sp_mut(mi)[usize::from(inst)];
                    if !sp.has_chain() && sp.cost == f32::INFINITY {
                        sp.cost = prev;
                    }
                }
            }
        }
    }

    pub(crate) fn graph_arc(&self) -> Arc<Graph> {
        Arc::clone(&self.g)
    }

    pub(crate) fn pool_ref(&self) -> &SubsetPool {
        &self.pool
    }

    pub(crate) fn set_call(&mut self, call: ModelCallState) {
        self.pending = Some(Pending::Model);
        self.call = Some(call);
    }

    pub(crate) fn finish_call(&mut self) -> Option<ModelCallState> {
        self.call.take()
    }

    pub(crate) fn scratch_acquire(&mut self, size: usize) -> Result<u8, ErrorInfo> {
        self.scratch.acquire(size)
    }

    pub(crate) fn scratch_release(&mut self, mask: u32) {
        self.scratch.release(mask);
    }

    /// Gathers `len` value bytes of `xi` starting at `src_off` into a
    /// scratch slot.
    pub(crate) fn scratch_write(&mut self, slot: u8, off: usize, xi: Idx, src_off: usize, len: usize) {
        let src = self.vars[xi.var_slot()]
            .value
            .as_ref()
            .map_or(&[][..], ValueBuf::as_slice);
        self.scratch.slots[usize::from(slot)][off..off + len]
            .copy_from_slice(&src[src_off..src_off + len]);
    }
}
