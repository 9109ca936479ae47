// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subgraph reduction.
//!
//! Given the roots that must be solvable and the variables the host will
//! supply, [`reduce`] computes `[lo, hi]` cost bounds for every reachable
//! node and selects the providers a solver could ever pick: for a root
//! bounded by `hi = β`, every provider with `lo < β`, topped up with one
//! provider achieving `hi = β` so the bound itself survives pruning.
//! Everything else is skipped.
//!
//! Bounds computed through a cycle carry a *cost overflow* flag and are
//! never cached: a cyclic path's bound depends on where the search entered
//! the cycle, and caching it would make unrelated entries wrong. The
//! selection rule also never prunes both directions of a cycle (the cost
//! function is nondecreasing, so pruning the non-cyclic chains of both
//! ends would force an infinite cost that the full graph does not have).

use thiserror::Error;
use tracing::trace;

use crate::graph::Graph;
use crate::idx::Idx;
use crate::mapping::MapKind;

/// Error from [`reduce`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReduceError {
    /// A variable the selection needs has no providers and was not
    /// declared given.
    #[error("variable {0} has no providers and is not given")]
    MissingProvider(Idx),
    /// A root or given index does not name a variable of the graph.
    #[error("unknown variable {0}")]
    UnknownVariable(Idx),
}

/// Old-to-new index mapping for a pruned graph.
///
/// `None` means the node (or user mapping) is skipped. Feed this to
/// [`crate::build_subgraph`] to emit the pruned graph.
#[derive(Debug, Clone)]
pub struct SubgraphMap {
    vars: Vec<Option<u16>>,
    models: Vec<Option<u16>>,
    maps: Vec<Option<u16>>,
    nv: u16,
    nm: u16,
    nu: u16,
}

impl SubgraphMap {
    fn new(g: &Graph) -> Self {
        Self {
            vars: vec![None; g.var_count()],
            models: vec![None; g.model_count()],
            maps: vec![None; g.user_map_count()],
            nv: 0,
            nm: 0,
            nu: 0,
        }
    }

    /// New index of a kept variable.
    #[must_use]
    pub fn var_new_index(&self, idx: Idx) -> Option<u16> {
        self.vars[idx.var_slot()]
    }

    /// New index of a kept model.
    #[must_use]
    pub fn model_new_index(&self, idx: Idx) -> Option<u16> {
        self.models[idx.model_slot()]
    }

    /// New index of a kept user mapping.
    #[must_use]
    pub fn map_new_index(&self, old: u16) -> Option<u16> {
        self.maps[usize::from(old)]
    }

    /// Number of variables kept.
    #[must_use]
    pub fn vars_kept(&self) -> usize {
        usize::from(self.nv)
    }

    /// Number of models kept.
    #[must_use]
    pub fn models_kept(&self) -> usize {
        usize::from(self.nm)
    }

    /// Number of user mappings kept.
    #[must_use]
    pub fn maps_kept(&self) -> usize {
        usize::from(self.nu)
    }

    /// Iterates kept variables as `(old slot, new slot)`.
    pub fn var_entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.vars
            .iter()
            .enumerate()
            .filter_map(|(old, new)| new.map(|n| (old, usize::from(n))))
    }

    /// Iterates kept models as `(old slot, new slot)`.
    pub fn model_entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.models
            .iter()
            .enumerate()
            .filter_map(|(old, new)| new.map(|n| (old, usize::from(n))))
    }

    /// Iterates kept user mappings as `(old index, new index)`.
    pub fn map_entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.maps
            .iter()
            .enumerate()
            .filter_map(|(old, new)| new.map(|n| (old, usize::from(n))))
    }
}

/// `[lo, hi]` cost bound with the cost-overflow lane.
///
/// `covf` set means the bound was computed along a cycle (or under an
/// exhausted budget) and must not be cached.
#[derive(Clone, Copy, Debug)]
struct Bound {
    lo: f32,
    hi: f32,
    covf: bool,
}

impl Bound {
    const UNREACHED: Self = Self {
        lo: f32::INFINITY,
        hi: f32::INFINITY,
        covf: false,
    };

    fn min(self, other: Self) -> Self {
        Self {
            lo: self.lo.min(other.lo),
            hi: self.hi.min(other.hi),
            covf: self.covf || other.covf,
        }
    }
}

#[derive(Clone, Copy, Default)]
struct VState {
    given: bool,
    mark: bool,
    done: bool,
    selected: bool,
    lo: f32,
    hi: f32,
}

#[derive(Clone, Copy, Default)]
struct MState {
    done: bool,
    selected: bool,
    lo: f32,
    hi: f32,
}

struct Reducer<'g> {
    g: &'g Graph,
    v: Vec<VState>,
    m: Vec<MState>,
    sub: SubgraphMap,
}

/// Computes the subgraph needed to solve `roots` when `given` variables
/// are host-supplied.
pub fn reduce(g: &Graph, roots: &[Idx], given: &[Idx]) -> Result<SubgraphMap, ReduceError> {
    let mut r = Reducer {
        g,
        v: vec![VState::default(); g.var_count()],
        m: vec![MState::default(); g.model_count()],
        sub: SubgraphMap::new(g),
    };

    for &idx in given {
        if !idx.is_var() || idx.var_slot() >= g.var_count() {
            return Err(ReduceError::UnknownVariable(idx));
        }
        r.v[idx.var_slot()].given = true;
    }

    for &idx in roots {
        if !idx.is_var() || idx.var_slot() >= g.var_count() {
            return Err(ReduceError::UnknownVariable(idx));
        }
        r.select_var(idx)?;
    }

    Ok(r.sub)
}

impl Reducer<'_> {
    /// Bound search for a non-root variable under budget `beta`.
    fn search_var(&mut self, xi: Idx, mut beta: f32) -> Bound {
        let slot = xi.var_slot();
        if self.v[slot].done {
            return Bound {
                lo: self.v[slot].lo,
                hi: self.v[slot].hi,
                covf: false,
            };
        }
        if self.v[slot].given {
            return Bound {
                lo: 0.0,
                hi: 0.0,
                covf: false,
            };
        }
        if self.v[slot].mark {
            trace!(var = %self.g.label(xi), "cycle");
            return Bound {
                lo: f32::INFINITY,
                hi: f32::INFINITY,
                covf: true,
            };
        }
        if beta <= 0.0 {
            return Bound {
                lo: 0.0,
                hi: f32::INFINITY,
                covf: true,
            };
        }

        self.v[slot].mark = true;
        let mut bound = Bound::UNREACHED;
        for i in 0..self.g.var(xi).provider_count() {
            let e = self.g.backward(xi)[i];
            let mut mb = self.search_model(e.target, beta);
            // A host-resolved mapping may produce an empty model set, in
            // which case this provider is unavailable.
            if !e.map.is_statically_nonempty() {
                mb.hi = f32::INFINITY;
            }
            bound = bound.min(mb);
            beta = beta.min(mb.hi);
        }
        self.v[slot].mark = false;

        trace!(var = %self.g.label(xi), lo = bound.lo, hi = bound.hi, covf = bound.covf, "bound");

        if !bound.covf {
            self.v[slot].done = true;
            self.v[slot].lo = bound.lo;
            self.v[slot].hi = bound.hi;
        }
        bound
    }

    fn search_model(&mut self, mi: Idx, beta: f32) -> Bound {
        let slot = mi.model_slot();
        if self.m[slot].done {
            return Bound {
                lo: self.m[slot].lo,
                hi: self.m[slot].hi,
                covf: false,
            };
        }

        let m = *self.g.model(mi);
        let beta_s = m.cost_inv(beta);
        if beta_s <= 0.0 {
            return Bound {
                lo: m.k,
                hi: f32::INFINITY,
                covf: true,
            };
        }

        // No cycle mark needed here: a cyclic path must pass through some
        // parameter variable, which carries the mark.
        let mut lo_s = 0.0_f32;
        let mut hi_s = 0.0_f32;
        let mut covf = false;
        for i in 0..usize::from(m.cparam) {
            let e = self.g.params(mi)[i];
            let mut xb = self.search_var(e.target, beta_s - lo_s);
            // An empty mapped set contributes nothing.
            if !e.map.is_statically_nonempty() {
                xb.lo = 0.0;
            }
            lo_s += xb.lo;
            hi_s += xb.hi;
            covf |= xb.covf;
        }

        let mut bound = Bound {
            lo: m.cost(lo_s),
            hi: m.cost(hi_s),
            covf,
        };

        if !covf {
            // Chains behind the checks don't bound the cost; the worst
            // case is every penalty firing.
            let penalty_sum: f32 = self.g.checks(mi).iter().map(|c| c.penalty).sum();
            bound.hi += m.c * penalty_sum;
            self.m[slot].done = true;
            self.m[slot].lo = bound.lo;
            self.m[slot].hi = bound.hi;
        }

        trace!(model = %self.g.label(mi), lo = bound.lo, hi = bound.hi, covf = bound.covf, "bound");
        bound
    }

    /// Root bound search: like [`Self::search_var`] but stores per-edge
    /// model bounds for the selection pass and always finalizes the
    /// variable (cycle-only paths cannot improve it).
    ///
    /// Model bounds must come from this walk rather than a later re-read:
    /// in a cyclic graph an uncached bound depends on the path taken.
    fn search_var_root(&mut self, xi: Idx, mbounds: &mut Vec<(f32, f32)>) -> f32 {
        let slot = xi.var_slot();
        self.v[slot].mark = true;

        let mut bound = Bound::UNREACHED;
        for i in 0..self.g.var(xi).provider_count() {
            let e = self.g.backward(xi)[i];
            let mut mb = self.search_model(e.target, bound.hi);
            if !e.map.is_statically_nonempty() {
                mb.hi = f32::INFINITY;
            }
            bound = bound.min(mb);
            mbounds.push((mb.lo, mb.hi));
        }

        self.v[slot].mark = false;
        trace!(var = %self.g.label(xi), lo = bound.lo, hi = bound.hi, covf = bound.covf, "root bound");

        self.v[slot].done = true;
        self.v[slot].lo = bound.lo;
        self.v[slot].hi = bound.hi;
        bound.hi
    }

    fn select_var(&mut self, xi: Idx) -> Result<(), ReduceError> {
        let slot = xi.var_slot();
        if self.v[slot].selected {
            return Ok(());
        }
        self.v[slot].selected = true;
        self.add_var(xi);

        if self.v[slot].given {
            return Ok(());
        }
        if self.g.var(xi).provider_count() == 0 {
            // Keeping this variable would make it silently given in the
            // emitted subgraph.
            return Err(ReduceError::MissingProvider(xi));
        }

        let mut bounds = Vec::new();
        let beta = self.search_var_root(xi, &mut bounds);
        trace!(var = %self.g.label(xi), beta, "selecting providers");

        // Take every provider that could beat the bound; remember whether
        // one of them attains it.
        let mut have_min = false;
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            if lo < beta {
                have_min |= hi == beta;
                let e = self.g.backward(xi)[i];
                self.add_map_of(e.map);
                self.select_model(e.target)?;
            }
        }
        if have_min {
            return Ok(());
        }

        // Nothing selected attains the bound; add one provider that does,
        // so the subgraph preserves hi(xi).
        for (i, &(lo, _)) in bounds.iter().enumerate() {
            if lo == beta {
                let e = self.g.backward(xi)[i];
                self.add_map_of(e.map);
                self.select_model(e.target)?;
                return Ok(());
            }
        }
        debug_assert!(false, "no provider attains the variable bound");
        Ok(())
    }

    fn select_model(&mut self, mi: Idx) -> Result<(), ReduceError> {
        let slot = mi.model_slot();
        if self.m[slot].selected {
            return Ok(());
        }
        self.m[slot].selected = true;
        self.add_model(mi);
        trace!(model = %self.g.label(mi), "select");

        for i in 0..self.g.model(mi).param_count() {
            let e = self.g.params(mi)[i];
            self.add_map_of(e.map);
            self.select_var(e.target)?;
        }
        for i in 0..self.g.checks(mi).len() {
            let e = self.g.checks(mi)[i].edge;
            self.add_map_of(e.map);
            self.select_var(e.target)?;
        }
        // Returns need no chains of their own, but the model caller writes
        // every return edge, so the variables must exist in the subgraph.
        for i in 0..self.g.model(mi).return_count() {
            let e = self.g.returns(mi)[i];
            self.add_map_of(e.map);
            self.add_var(e.target);
        }
        Ok(())
    }

    fn add_var(&mut self, xi: Idx) {
        let entry = &mut self.sub.vars[xi.var_slot()];
        if entry.is_none() {
            *entry = Some(self.sub.nv);
            self.sub.nv += 1;
        }
    }

    fn add_model(&mut self, mi: Idx) {
        let entry = &mut self.sub.models[mi.model_slot()];
        if entry.is_none() {
            *entry = Some(self.sub.nm);
            self.sub.nm += 1;
        }
    }

    fn add_map_of(&mut self, map: crate::mapping::MapRef) {
        if map.kind() != MapKind::User {
            return;
        }
        // Forward and inverse share one interned entry, so this keeps both.
        let entry = &mut self.sub.maps[usize::from(map.user_index())];
        if entry.is_none() {
            *entry = Some(self.sub.nu);
            self.sub.nu += 1;
        }
    }
}
