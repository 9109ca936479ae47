// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Value materialization.
//!
//! Once chain selection has pinned a provider per instance, this machine
//! walks the chain and executes it: parameters are materialized (given
//! values requested, computed values recursively produced), parameter
//! subsets are gathered into contiguous spans (scratch-pooled when the
//! subset is multi-range), return buffers are allocated — or, for
//! single-identity-return models, aimed straight at the consumer's value
//! slot — and the call is staged for the host. The host writes returns
//! through the solver's call accessors and resumes; the commit step then
//! releases scratch and the consumer copies its element out of the return
//! buffer.
//!
//! The walk runs on an explicit op stack so it survives suspension at any
//! depth.

use tracing::trace;

use crate::idx::{Idx, Inst};
use crate::status::{EntityTag, ErrorCode, ErrorInfo, ErrorSite, Status};

use super::{CallBuf, CallEdge, ModelCallState, Solver};

/// Progress of a model-execution op.
#[derive(Clone, Copy, Debug)]
pub(crate) enum MStep {
    /// Materializing parameter `p` onward.
    Params {
        /// Next parameter edge to ensure.
        p: u8,
    },
    /// Parameters ready; gather spans, allocate returns, yield the call.
    Stage,
    /// Host executed the model; tear the staging down.
    Commit,
}

/// One level of the materialization walk.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ValueOp {
    /// Ensure a computed variable instance has its value.
    Var {
        /// The variable.
        xi: Idx,
        /// The instance.
        inst: Inst,
    },
    /// Execute a model instance.
    Model {
        /// The model.
        mi: Idx,
        /// The model instance.
        inst: Inst,
        /// Resume point.
        step: MStep,
    },
}

impl ValueOp {
    pub(crate) fn var(xi: Idx, inst: Inst) -> Self {
        Self::Var { xi, inst }
    }
}

impl Solver {
    /// Runs one step of the top materialization op.
    pub(crate) fn run_value(&mut self) -> Result<(), Status> {
        let op = match self.value.last() {
            Some(op) => *op,
            None => return Ok(()),
        };
        match op {
            ValueOp::Var { xi, inst } => self.value_var(xi, inst),
            ValueOp::Model { mi, inst, step } => match step {
                MStep::Params { p } => self.value_model_params(mi, inst, p),
                MStep::Stage => self.value_model_stage(mi, inst),
                MStep::Commit => self.value_model_commit(),
            },
        }
    }

    fn set_model_step(&mut self, mi: Idx, inst: Inst, step: MStep) {
        if let Some(top) = self.value.last_mut() {
            *top = ValueOp::Model { mi, inst, step };
        }
    }

    fn value_var(&mut self, xi: Idx, inst: Inst) -> Result<(), Status> {
        let sp = self.var_sp(xi)[usize::from(inst)];
        if !sp.has_chain() {
            return Err(Status::Error(
                ErrorInfo::new(ErrorCode::Chain, ErrorSite::Solver)
                    .with(EntityTag::Var, xi.wire())
                    .with(EntityTag::Inst, inst),
            ));
        }
        if sp.has_value() {
            self.value.pop();
            return Ok(());
        }
        let g = self.graph_arc();
        let e = g.backward(xi)[sp.chain_edge()];
        let m_inst = sp.chain_inst();
        let mi = e.target;
        if self.model_sp(mi)[usize::from(m_inst)].has_value() {
            self.copy_return(xi, inst, e.ex, mi, m_inst)?;
            self.var_sp_mut(xi)[usize::from(inst)].set_value_flag();
            trace!(var = %g.label(xi), inst, "value solved");
            self.value.pop();
            return Ok(());
        }
        self.value.push(ValueOp::Model {
            mi,
            inst: m_inst,
            step: MStep::Params { p: 0 },
        });
        Ok(())
    }

    /// Copies the consumer's element out of the model's return buffer
    /// (no-op for direct-write models, which already wrote in place).
    fn copy_return(
        &mut self,
        xi: Idx,
        inst: Inst,
        ret_edge: u8,
        mi: Idx,
        m_inst: Inst,
    ) -> Result<(), Status> {
        let g = self.graph_arc();
        let m = *g.model(mi);
        if m.writes_direct() {
            return Ok(());
        }
        self.ensure_var_value(xi)?;
        let re = g.returns(mi)[usize::from(ret_edge)];
        let ss = self.map_subset(re.map, m_inst)?;
        let size = g.var(xi).size();
        let internal = || {
            Status::Error(
                ErrorInfo::new(ErrorCode::Invalid, ErrorSite::Solver)
                    .with(EntityTag::Model, mi.wire())
                    .with(EntityTag::Inst, m_inst),
            )
        };
        let pos = ss.index_of(inst, self.pool_ref()).ok_or_else(internal)?;
        let nr = m.return_count();
        let table = self.models[mi.model_slot()].ret.as_ref().ok_or_else(internal)?;
        let src = table[usize::from(m_inst) * nr + usize::from(ret_edge)]
            .as_ref()
            .ok_or_else(internal)?;
        let src_off = pos * size;
        let dst_off = usize::from(inst) * size;
        match &mut self.vars[xi.var_slot()].value {
            Some(super::ValueBuf::Vec(dst)) => {
                dst[dst_off..dst_off + size].copy_from_slice(&src[src_off..src_off + size]);
                Ok(())
            }
            _ => Err(internal()),
        }
    }

    fn value_model_params(&mut self, mi: Idx, inst: Inst, p: u8) -> Result<(), Status> {
        let g = self.graph_arc();
        let m = *g.model(mi);
        if usize::from(p) >= m.param_count() {
            self.set_model_step(mi, inst, MStep::Stage);
            return Ok(());
        }
        let e = g.params(mi)[usize::from(p)];
        let ss = self.map_subset(e.map, inst)?;
        if ss.is_empty() {
            self.set_model_step(mi, inst, MStep::Params { p: p + 1 });
            return Ok(());
        }
        if p < m.cparam {
            // Computed parameter: every instance must have its value.
            let mut it = ss.first(self.pool_ref());
            while !it.is_done() {
                let j = it.inst();
                let sp = self.var_sp(e.target)[usize::from(j)];
                if !sp.has_value() {
                    self.value.push(ValueOp::var(e.target, j));
                    return Ok(());
                }
                it = it.next(ss, self.pool_ref());
            }
        } else {
            self.ensure_given(e.target, ss)?;
        }
        self.set_model_step(mi, inst, MStep::Params { p: p + 1 });
        Ok(())
    }

    /// Builds the host-visible call: parameter spans at their definition
    /// positions, return buffers after them, then yields.
    fn value_model_stage(&mut self, mi: Idx, inst: Inst) -> Result<(), Status> {
        let g = self.graph_arc();
        let m = *g.model(mi);
        let np = m.param_count();
        let nr = m.return_count();

        // Resolve every mapping up front; everything after this point must
        // not suspend (scratch claims would leak across a replayed stage).
        for i in 0..np {
            let e = g.params(mi)[i];
            self.map_subset(e.map, inst)?;
        }
        for i in 0..nr {
            let e = g.returns(mi)[i];
            self.map_subset(e.map, inst)?;
        }
        if m.writes_direct() {
            self.ensure_var_value(g.returns(mi)[0].target)?;
        } else {
            let n = usize::from(self.ensure_shape(m.group())?);
            let slot = &mut self.models[mi.model_slot()].ret;
            if slot.is_none() {
                *slot = Some(vec![None; n * nr].into_boxed_slice());
            }
        }

        let mut edges = vec![
            CallEdge {
                n: 0,
                buf: CallBuf::Empty,
            };
            np + nr
        ];
        let mut mask = 0_u32;

        for i in 0..np {
            let e = g.params(mi)[i];
            let ss = self.map_subset(e.map, inst)?;
            if ss.is_empty() {
                continue;
            }
            let size = g.var(e.target).size();
            let cnt = ss.size(self.pool_ref());
            let edge = if ss.count() == 1 {
                let start = match ss.ranges(self.pool_ref()).next() {
                    Some(r) => usize::from(r.start()),
                    None => 0,
                };
                CallEdge {
                    n: cnt,
                    buf: CallBuf::VarRead {
                        xi: e.target,
                        off: start * size,
                        len: cnt * size,
                    },
                }
            } else {
                // Multi-range subsets are gathered into scratch.
                let len = cnt * size;
                let slot = self.scratch_acquire(len).map_err(Status::Error)?;
                mask |= 1 << slot;
                let ranges: Vec<_> = ss.ranges(self.pool_ref()).collect();
                let mut off = 0;
                for r in ranges {
                    let n = r.len() * size;
                    self.scratch_write(slot, off, e.target, usize::from(r.start()) * size, n);
                    off += n;
                }
                CallEdge {
                    n: cnt,
                    buf: CallBuf::Scratch { slot, len },
                }
            };
            edges[usize::from(e.ex)] = edge;
        }

        if m.writes_direct() {
            let rv = g.returns(mi)[0].target;
            let size = g.var(rv).size();
            edges[np] = CallEdge {
                n: 1,
                buf: CallBuf::VarWrite {
                    xi: rv,
                    off: usize::from(inst) * size,
                    len: size,
                },
            };
        } else {
            for (ri, re) in g.returns(mi).iter().enumerate() {
                let ss = self.map_subset(re.map, inst)?;
                if ss.is_empty() {
                    continue;
                }
                let cnt = ss.size(self.pool_ref());
                let size = g.var(re.target).size();
                if let Some(table) = &mut self.models[mi.model_slot()].ret {
                    table[usize::from(inst) * nr + ri] = Some(vec![0; cnt * size]);
                }
                edges[np + ri] = CallEdge {
                    n: cnt,
                    buf: CallBuf::RetBuf { ri: ri as u8 },
                };
            }
        }

        // The flag is a promise: the host call is in flight.
        self.model_sp_mut(mi)[usize::from(inst)].set_value_flag();
        self.set_model_step(mi, inst, MStep::Commit);
        trace!(model = %g.label(mi), inst, np, nr, "model call");
        self.set_call(ModelCallState {
            mi,
            inst,
            np: np as u8,
            nr: nr as u8,
            scratch_mask: mask,
            edges,
        });
        Err(Status::ModelCall {
            model: mi,
            inst,
            np: np as u8,
            nr: nr as u8,
        })
    }

    fn value_model_commit(&mut self) -> Result<(), Status> {
        if let Some(call) = self.finish_call() {
            self.scratch_release(call.scratch_mask);
        }
        self.value.pop();
        Ok(())
    }
}
