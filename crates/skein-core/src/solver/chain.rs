// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chain selection.
//!
//! For each requested variable instance this machine picks the provider
//! model instance with the lowest cost and recursively solves the chosen
//! model's inputs under a β-cutoff. The candidate scan keeps the best and
//! second-best costs; the second-best becomes the β for the chosen
//! candidate, so the search abandons a candidate the moment it provably
//! loses to the runner-up and reselects with the updated bound.
//!
//! Recursion runs on an explicit, depth-bounded frame stack owned by the
//! solver so the whole search survives suspension. Re-entering a marked
//! variable instance is a cycle: the entering frame reports an infinite
//! bound back to its parent instead of failing the solve — another
//! provider may still satisfy the variable, and infinities produced this
//! way are rolled back once the outermost frame completes.

use tracing::trace;

use crate::idx::{Idx, Inst};
use crate::status::{EntityTag, ErrorCode, ErrorInfo, ErrorSite, Status};
use crate::subset::{Subset, SubsetIter};

use super::{Solver, ValueOp, CHAIN_STACK_DEPTH, MAX_COST};

/// Resume point inside a selection frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Pc {
    /// Cycle check + mark.
    Start,
    /// Candidate scan, given shadows, budget setup.
    Candidate,
    /// Advance to the next computed shadow edge.
    CCheckNext,
    /// Walk the current shadow subset instance by instance.
    CCheckInst,
    /// Whole subset valued; evaluate the predicate.
    CCheckEval,
    /// A child frame solved (or failed) a shadow instance.
    CCheckChild,
    /// Charge the current shadow's penalty.
    CCheckPenalty,
    /// Advance to the next computed parameter edge.
    ParamNext,
    /// Walk the current parameter subset instance by instance.
    ParamInst,
    /// A child frame solved (or failed) a parameter instance.
    ParamChild,
    /// Candidate held under budget; commit the chain.
    Accept,
}

/// One suspended level of the selection recursion.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChainFrame {
    pub(crate) xi: Idx,
    pub(crate) inst: Inst,
    pub(crate) beta: f32,
    /// Cost word before this frame marked the instance.
    pub(crate) prev_cost: f32,
    pub(crate) pc: Pc,
    // Selected candidate.
    pub(crate) m_ei: u8,
    pub(crate) m_mi: Idx,
    pub(crate) m_inst: Inst,
    pub(crate) m_beta_s: f32,
    pub(crate) m_rem_s: f32,
    // Computed-shadow walk.
    pub(crate) c_ei: u8,
    pub(crate) c_ss: Subset,
    pub(crate) c_it: SubsetIter,
    // Computed-parameter walk.
    pub(crate) p_ei: u8,
    pub(crate) p_ss: Subset,
    pub(crate) p_it: SubsetIter,
    pub(crate) p_ssmax: f32,
}

impl ChainFrame {
    fn new(xi: Idx, inst: Inst, beta: f32) -> Self {
        Self {
            xi,
            inst,
            beta,
            prev_cost: 0.0,
            pc: Pc::Start,
            m_ei: 0,
            m_mi: Idx::model(0),
            m_inst: 0,
            m_beta_s: 0.0,
            m_rem_s: 0.0,
            c_ei: 0,
            c_ss: Subset::EMPTY,
            c_it: SubsetIter::DONE,
            p_ei: 0,
            p_ss: Subset::EMPTY,
            p_it: SubsetIter::DONE,
            p_ssmax: 0.0,
        }
    }
}

/// Result a popped frame leaves for its parent.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ChainResult {
    pub(crate) ok: bool,
    pub(crate) cost: f32,
}

impl Solver {
    /// Seeds the selection stack for one requested instance.
    pub(crate) fn push_chain_root(&mut self, xi: Idx, inst: Inst) -> Result<(), Status> {
        debug_assert!(self.chain.is_empty());
        self.chain.push(ChainFrame::new(xi, inst, MAX_COST));
        Ok(())
    }

    fn push_chain_child(&mut self, xi: Idx, inst: Inst, beta: f32) -> Result<(), Status> {
        if self.chain.len() >= CHAIN_STACK_DEPTH {
            return Err(Status::Error(ErrorInfo::new(
                ErrorCode::Depth,
                ErrorSite::Solver,
            )));
        }
        self.chain.push(ChainFrame::new(xi, inst, beta));
        Ok(())
    }

    /// Pops the top frame with `result`; fails the solve when the root
    /// frame itself found no finite-cost chain.
    fn pop_chain(&mut self, result: ChainResult) -> Result<(), Status> {
        let f = match self.chain.pop() {
            Some(f) => f,
            None => return Ok(()),
        };
        if self.chain.is_empty() {
            self.undo_poison();
            if !result.ok {
                return Err(Status::Error(
                    ErrorInfo::new(ErrorCode::Chain, ErrorSite::Solver)
                        .with(EntityTag::Var, f.xi.wire())
                        .with(EntityTag::Inst, f.inst),
                ));
            }
        }
        self.chain_result = result;
        Ok(())
    }

    /// Runs one step of the top selection frame.
    pub(crate) fn run_chain(&mut self) -> Result<(), Status> {
        let fi = self.chain.len() - 1;
        match self.chain[fi].pc {
            Pc::Start => self.chain_start(fi),
            Pc::Candidate => self.chain_candidate(fi),
            Pc::CCheckNext => self.chain_ccheck_next(fi),
            Pc::CCheckInst => self.chain_ccheck_inst(fi),
            Pc::CCheckEval => self.chain_ccheck_eval(fi),
            Pc::CCheckChild => self.chain_ccheck_child(fi),
            Pc::CCheckPenalty => self.chain_ccheck_penalty(fi),
            Pc::ParamNext => self.chain_param_next(fi),
            Pc::ParamInst => self.chain_param_inst(fi),
            Pc::ParamChild => self.chain_param_child(fi),
            Pc::Accept => self.chain_accept(fi),
        }
    }

    fn chain_start(&mut self, fi: usize) -> Result<(), Status> {
        let (xi, inst) = (self.chain[fi].xi, self.chain[fi].inst);
        let sp = self.var_sp(xi)[usize::from(inst)];
        if sp.is_marked() {
            // Cycle: report an infinite bound without touching the marked
            // instance; an alternative provider upstream may still win.
            trace!(var = %self.g.label(xi), inst, "cycle");
            return self.pop_chain(ChainResult {
                ok: false,
                cost: f32::INFINITY,
            });
        }
        self.chain[fi].prev_cost = sp.cost;
        self.var_sp_mut(xi)[usize::from(inst)].set_mark();
        self.chain[fi].pc = Pc::Candidate;
        Ok(())
    }

    /// Candidate scan: two-best pass over every provider edge, then the
    /// given shadows of the winner, then the budget for its chain.
    fn chain_candidate(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let (xi, x_inst, beta) = (self.chain[fi].xi, self.chain[fi].inst, self.chain[fi].beta);

        let mut f1 = f32::INFINITY;
        let mut f2 = f32::INFINITY;
        let mut best_ei = 0_usize;
        let mut best_inst: Inst = 0;

        for (i, e) in g.backward(xi).iter().enumerate() {
            self.ensure_model_sp(e.target)?;
            let ss = self.map_subset(e.map, x_inst)?;
            let mut it = ss.first(self.pool_ref());
            while !it.is_done() {
                let j = it.inst();
                let cost = self.model_sp(e.target)[usize::from(j)].cost;
                if cost < f1 {
                    best_ei = i;
                    best_inst = j;
                }
                f2 = f2.min(f1.max(cost));
                f1 = f1.min(cost);
                it = it.next(ss, self.pool_ref());
            }
        }

        if f1 > beta {
            // No provider fits the budget; the variable is settled at the
            // lowest bound found. This also clears the cycle mark.
            trace!(var = %g.label(xi), inst = x_inst, beta, lowest = f1, "no candidate in budget");
            let prev = self.chain[fi].prev_cost;
            self.write_var_cost(xi, x_inst, f1, prev);
            return self.pop_chain(ChainResult {
                ok: false,
                cost: f1,
            });
        }

        let e = g.backward(xi)[best_ei];
        let mi = e.target;
        let m = *g.model(mi);
        self.chain[fi].m_ei = best_ei as u8;
        self.chain[fi].m_mi = mi;
        self.chain[fi].m_inst = best_inst;

        if self.model_sp(mi)[usize::from(best_inst)].has_chain() {
            // Exact cost already known and under the threshold.
            return self.chain_choose(fi, f1);
        }

        let m_beta_s = m.cost_inv(f2.min(beta));
        trace!(
            var = %g.label(xi), inst = x_inst, model = %g.label(mi), m_inst = best_inst,
            at_least = f1, budget_s = m_beta_s, "candidate"
        );

        // Given shadows first: they only need host values, no chains.
        let mut icost_s = 0.0_f32;
        let n_checks = g.checks(mi).len();
        for ci in usize::from(m.ccheck)..n_checks {
            let c = g.checks(mi)[ci];
            let ss = self.map_subset(c.edge.map, best_inst)?;
            if ss.is_empty() {
                continue;
            }
            self.ensure_given(c.edge.target, ss)?;
            if !self.check_subset(&c, ss) {
                trace!(
                    model = %g.label(mi), m_inst = best_inst, check = ci,
                    penalty = c.penalty, "given shadow violated"
                );
                icost_s += c.penalty;
            }
        }

        if icost_s > m_beta_s {
            let cost = m.cost(icost_s);
            trace!(model = %g.label(mi), m_inst = best_inst, cost, "initial cost too high");
            self.write_model_cost(mi, best_inst, cost);
            // Reselect with the raised bound.
            return Ok(());
        }

        self.chain[fi].m_beta_s = m_beta_s;
        self.chain[fi].m_rem_s = m_beta_s - icost_s;
        self.chain[fi].c_ei = 0;
        self.chain[fi].pc = Pc::CCheckNext;
        Ok(())
    }

    fn chain_ccheck_next(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let mi = self.chain[fi].m_mi;
        let ccheck = g.model(mi).ccheck;
        let c_ei = self.chain[fi].c_ei;
        if c_ei >= ccheck {
            self.chain[fi].p_ei = 0;
            self.chain[fi].pc = Pc::ParamNext;
            return Ok(());
        }
        let c = g.checks(mi)[usize::from(c_ei)];
        let ss = self.map_subset(c.edge.map, self.chain[fi].m_inst)?;
        if ss.is_empty() {
            self.chain[fi].c_ei = c_ei + 1;
            return Ok(());
        }
        self.ensure_var_sp(c.edge.target)?;
        self.chain[fi].c_ss = ss;
        self.chain[fi].c_it = ss.first(self.pool_ref());
        self.chain[fi].pc = Pc::CCheckInst;
        Ok(())
    }

    fn chain_ccheck_inst(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let it = self.chain[fi].c_it;
        if it.is_done() {
            self.chain[fi].pc = Pc::CCheckEval;
            return Ok(());
        }
        let mi = self.chain[fi].m_mi;
        let c = g.checks(mi)[usize::from(self.chain[fi].c_ei)];
        let cv = c.edge.target;
        let inst = it.inst();
        let sp = self.var_sp(cv)[usize::from(inst)];
        if sp.has_chain() {
            if sp.has_value() {
                self.chain[fi].c_it = it.next(self.chain[fi].c_ss, self.pool_ref());
                return Ok(());
            }
            // Materialize before judging the predicate.
            self.value.push(ValueOp::var(cv, inst));
            return Ok(());
        }
        if sp.cost == f32::INFINITY {
            self.chain[fi].pc = Pc::CCheckPenalty;
            return Ok(());
        }
        self.chain[fi].pc = Pc::CCheckChild;
        self.push_chain_child(cv, inst, MAX_COST)
    }

    fn chain_ccheck_child(&mut self, fi: usize) -> Result<(), Status> {
        if self.chain_result.ok {
            self.chain[fi].pc = Pc::CCheckInst;
        } else {
            self.chain[fi].pc = Pc::CCheckPenalty;
        }
        Ok(())
    }

    fn chain_ccheck_eval(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let mi = self.chain[fi].m_mi;
        let c = g.checks(mi)[usize::from(self.chain[fi].c_ei)];
        if self.check_subset(&c, self.chain[fi].c_ss) {
            self.chain[fi].c_ei += 1;
            self.chain[fi].pc = Pc::CCheckNext;
        } else {
            self.chain[fi].pc = Pc::CCheckPenalty;
        }
        Ok(())
    }

    fn chain_ccheck_penalty(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let mi = self.chain[fi].m_mi;
        let m_inst = self.chain[fi].m_inst;
        let m = *g.model(mi);
        let c = g.checks(mi)[usize::from(self.chain[fi].c_ei)];
        self.chain[fi].m_rem_s -= c.penalty;
        trace!(
            model = %g.label(mi), m_inst, penalty = c.penalty,
            rem_s = self.chain[fi].m_rem_s, "computed shadow violated"
        );
        if self.chain[fi].m_rem_s < 0.0 {
            let cost = m.cost(self.chain[fi].m_beta_s - self.chain[fi].m_rem_s);
            self.write_model_cost(mi, m_inst, cost);
            self.chain[fi].pc = Pc::Candidate;
        } else {
            self.chain[fi].c_ei += 1;
            self.chain[fi].pc = Pc::CCheckNext;
        }
        Ok(())
    }

    fn chain_param_next(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let mi = self.chain[fi].m_mi;
        let cparam = g.model(mi).cparam;
        let p_ei = self.chain[fi].p_ei;
        if p_ei >= cparam {
            self.chain[fi].pc = Pc::Accept;
            return Ok(());
        }
        let e = g.params(mi)[usize::from(p_ei)];
        let ss = self.map_subset(e.map, self.chain[fi].m_inst)?;
        if ss.is_empty() {
            // Empty parameter set costs nothing.
            self.chain[fi].p_ei = p_ei + 1;
            return Ok(());
        }
        self.ensure_var_sp(e.target)?;
        self.chain[fi].p_ss = ss;
        self.chain[fi].p_it = ss.first(self.pool_ref());
        self.chain[fi].p_ssmax = 0.0;
        self.chain[fi].pc = Pc::ParamInst;
        Ok(())
    }

    fn chain_param_inst(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let it = self.chain[fi].p_it;
        let mi = self.chain[fi].m_mi;
        let m = *g.model(mi);
        if it.is_done() {
            // Parameter solved; its cost is the max over the subset.
            self.chain[fi].m_rem_s -= self.chain[fi].p_ssmax;
            trace!(
                model = %g.label(mi), m_inst = self.chain[fi].m_inst,
                param = self.chain[fi].p_ei, cost = self.chain[fi].p_ssmax,
                rem_s = self.chain[fi].m_rem_s, "parameter solved"
            );
            self.chain[fi].p_ei += 1;
            self.chain[fi].pc = Pc::ParamNext;
            return Ok(());
        }
        let e = g.params(mi)[usize::from(self.chain[fi].p_ei)];
        let inst = it.inst();
        let sp = self.var_sp(e.target)[usize::from(inst)];
        if sp.is_done() {
            let ssmax = self.chain[fi].p_ssmax.max(sp.cost);
            self.chain[fi].p_ssmax = ssmax;
            self.chain[fi].p_it = it.next(self.chain[fi].p_ss, self.pool_ref());
            if self.chain[fi].m_rem_s < ssmax {
                let cost = m.cost(self.chain[fi].m_beta_s - self.chain[fi].m_rem_s + ssmax);
                self.write_model_cost(mi, self.chain[fi].m_inst, cost);
                self.chain[fi].pc = Pc::Candidate;
            }
            return Ok(());
        }
        // Chain not solved yet; recurse with the remaining budget.
        self.chain[fi].p_it = it.next(self.chain[fi].p_ss, self.pool_ref());
        self.chain[fi].pc = Pc::ParamChild;
        let beta = self.chain[fi].m_rem_s;
        self.push_chain_child(e.target, inst, beta)
    }

    fn chain_param_child(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let result = self.chain_result;
        if result.ok {
            self.chain[fi].p_ssmax = self.chain[fi].p_ssmax.max(result.cost);
            debug_assert!(self.chain[fi].p_ssmax <= self.chain[fi].m_rem_s);
            self.chain[fi].pc = Pc::ParamInst;
            return Ok(());
        }
        let mi = self.chain[fi].m_mi;
        let m = *g.model(mi);
        let cost = m.cost(self.chain[fi].m_beta_s - self.chain[fi].m_rem_s + result.cost);
        self.write_model_cost(mi, self.chain[fi].m_inst, cost);
        trace!(
            model = %g.label(mi), m_inst = self.chain[fi].m_inst, cost,
            "candidate over budget"
        );
        self.chain[fi].pc = Pc::Candidate;
        Ok(())
    }

    fn chain_accept(&mut self, fi: usize) -> Result<(), Status> {
        let g = self.graph_arc();
        let mi = self.chain[fi].m_mi;
        let m_inst = self.chain[fi].m_inst;
        let m = *g.model(mi);
        let cost = m.cost(self.chain[fi].m_beta_s - self.chain[fi].m_rem_s);
        self.model_sp_mut(mi)[usize::from(m_inst)].set_model_chain(cost);
        trace!(model = %g.label(mi), m_inst, cost, "chain solved");
        self.chain_choose(fi, cost)
    }

    /// Records the winning provider on the variable and pops the frame.
    fn chain_choose(&mut self, fi: usize, cost: f32) -> Result<(), Status> {
        let f = self.chain[fi];
        self.var_sp_mut(f.xi)[usize::from(f.inst)].set_chain(
            cost,
            usize::from(f.m_ei),
            f.m_inst,
        );
        trace!(
            var = %self.g.label(f.xi), inst = f.inst, edge = f.m_ei,
            m_inst = f.m_inst, cost, "selected"
        );
        self.pop_chain(ChainResult { ok: true, cost })
    }
}
