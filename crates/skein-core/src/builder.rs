// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph definition and emission.
//!
//! A [`GraphBuilder`] accumulates variables, models, and edges in growable
//! definition lists, then [`GraphBuilder::build`] emits the packed
//! [`Graph`]. Emission lays the edge arena out interleaved — each
//! variable's provider list followed by those providers' checks and
//! parameters — interns user mappings, partitions every model's parameter
//! and check lists so computed targets precede given ones, and flags
//! direct-write models.
//!
//! [`build_subgraph`] re-emits a pruned graph from a reducer's subgraph
//! map, renumbering nodes and mappings and re-running the partition pass
//! (a computed variable can become given when its providers are pruned).

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::graph::{Check, DebugNames, Edge, Graph, Model, Slice, UserMap, Var, M_NORETBUF};
use crate::idx::{
    Group, Idx, MAX_BACK_EDGE, MAX_EDGE, MAX_FWD_EDGE, MAX_GROUP, MAX_IDX, MAX_UMAP,
};
use crate::mapping::{MapKind, MapRef, Mapping};
use crate::reduce::SubgraphMap;
use crate::shadow::Predicate;

/// Error emitted by the builder.
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    /// Variable count would exceed the index space.
    #[error("too many variables (max {MAX_IDX})")]
    TooManyVars,
    /// Model count would exceed the index space.
    #[error("too many models (max {MAX_IDX})")]
    TooManyModels,
    /// User-mapping count would exceed the mapping index space.
    #[error("too many user mappings (max {MAX_UMAP})")]
    TooManyUserMaps,
    /// A model's parameter/return/check list is full.
    #[error("model {0} has too many edges (max {MAX_EDGE} per list)")]
    TooManyEdges(Idx),
    /// A variable is produced by too many models.
    #[error("variable {0} has too many providers (max {MAX_BACK_EDGE})")]
    TooManyProviders(Idx),
    /// A variable is consumed by too many models.
    #[error("variable {0} has too many consumers (max {MAX_FWD_EDGE})")]
    TooManyConsumers(Idx),
    /// Group tag is outside the representable range.
    #[error("group {0} exceeds the maximum tag {MAX_GROUP}")]
    GroupOutOfRange(Group),
    /// Cost coefficients must satisfy `k ≥ 0`, `c ≥ 1`, both finite.
    #[error("invalid cost coefficients k={k} c={c}")]
    InvalidCost {
        /// Constant term as given.
        k: f32,
        /// Slope as given.
        c: f32,
    },
    /// Identity mappings require both endpoints in the same group.
    #[error("identity mapping between groups {model_group} and {var_group}")]
    IdentGroupMismatch {
        /// The model's group.
        model_group: Group,
        /// The variable's group.
        var_group: Group,
    },
    /// A shadow predicate's operand width must match the variable size.
    #[error("shadow predicate expects {expected} value bytes, variable {var} has {actual}")]
    CheckSizeMismatch {
        /// The checked variable.
        var: Idx,
        /// Bytes the predicate reads.
        expected: usize,
        /// The variable's declared size.
        actual: usize,
    },
    /// An index argument does not name a node of this definition.
    #[error("unknown node {0}")]
    UnknownNode(Idx),
}

#[derive(Clone, Copy, Debug)]
struct DefVar {
    group: Group,
    size: u16,
    udata: u64,
}

#[derive(Clone, Copy, Debug)]
struct DefEdge {
    var: u16,
    map: MapRef,
}

#[derive(Clone, Copy, Debug)]
struct DefCheck {
    var: u16,
    map: MapRef,
    pred: Predicate,
    penalty: f32,
}

#[derive(Clone, Debug)]
struct DefModel {
    group: Group,
    k: f32,
    c: f32,
    udata: u64,
    params: Vec<DefEdge>,
    returns: Vec<DefEdge>,
    checks: Vec<DefCheck>,
}

/// Mutable graph definition.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    vars: Vec<DefVar>,
    models: Vec<DefModel>,
    umaps: Vec<UserMap>,
    umap_lookup: FxHashMap<(Group, Group, u64), u16>,
}

impl GraphBuilder {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the definition for reuse, keeping allocations.
    pub fn reset(&mut self) {
        self.vars.clear();
        self.models.clear();
        self.umaps.clear();
        self.umap_lookup.clear();
    }

    /// Number of variables defined so far.
    #[must_use]
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Number of models defined so far.
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Adds a variable with value byte width `size`.
    pub fn add_variable(&mut self, group: Group, size: u16, udata: u64) -> Result<Idx, BuildError> {
        if group > MAX_GROUP {
            return Err(BuildError::GroupOutOfRange(group));
        }
        if self.vars.len() > usize::from(MAX_IDX) {
            return Err(BuildError::TooManyVars);
        }
        self.vars.push(DefVar { group, size, udata });
        Ok(Idx::var((self.vars.len() - 1) as u16))
    }

    /// Adds a model with cost `k + c·S`.
    pub fn add_model(&mut self, group: Group, k: f32, c: f32, udata: u64) -> Result<Idx, BuildError> {
        if group > MAX_GROUP {
            return Err(BuildError::GroupOutOfRange(group));
        }
        if !(k.is_finite() && c.is_finite() && k >= 0.0 && c >= 1.0) {
            return Err(BuildError::InvalidCost { k, c });
        }
        if self.models.len() > usize::from(MAX_IDX) {
            return Err(BuildError::TooManyModels);
        }
        self.models.push(DefModel {
            group,
            k,
            c,
            udata,
            params: Vec::new(),
            returns: Vec::new(),
            checks: Vec::new(),
        });
        Ok(Idx::model((self.models.len() - 1) as u16))
    }

    /// Adds a parameter edge `model ← var` under `mapping`.
    pub fn add_param(&mut self, model: Idx, var: Idx, mapping: Mapping) -> Result<(), BuildError> {
        let map = self.derive_map(model, var, mapping)?;
        let dm = &mut self.models[model.model_slot()];
        if dm.params.len() >= MAX_EDGE {
            return Err(BuildError::TooManyEdges(model));
        }
        dm.params.push(DefEdge {
            var: var.var_slot() as u16,
            map,
        });
        Ok(())
    }

    /// Adds a return edge `model → var` under `mapping`.
    pub fn add_return(&mut self, model: Idx, var: Idx, mapping: Mapping) -> Result<(), BuildError> {
        let map = self.derive_map(model, var, mapping)?;
        let dm = &mut self.models[model.model_slot()];
        if dm.returns.len() >= MAX_EDGE {
            return Err(BuildError::TooManyEdges(model));
        }
        dm.returns.push(DefEdge {
            var: var.var_slot() as u16,
            map,
        });
        Ok(())
    }

    /// Adds a shadow edge on `model` checking `var` under `mapping`.
    pub fn add_check(
        &mut self,
        model: Idx,
        var: Idx,
        mapping: Mapping,
        pred: Predicate,
        penalty: f32,
    ) -> Result<(), BuildError> {
        let map = self.derive_map(model, var, mapping)?;
        let expected = pred.value_size();
        let actual = usize::from(self.vars[var.var_slot()].size);
        if expected != actual {
            return Err(BuildError::CheckSizeMismatch {
                var,
                expected,
                actual,
            });
        }
        let dm = &mut self.models[model.model_slot()];
        if dm.checks.len() >= MAX_EDGE {
            return Err(BuildError::TooManyEdges(model));
        }
        dm.checks.push(DefCheck {
            var: var.var_slot() as u16,
            map,
            pred,
            penalty,
        });
        Ok(())
    }

    fn derive_map(&mut self, model: Idx, var: Idx, mapping: Mapping) -> Result<MapRef, BuildError> {
        if !model.is_model() || self.models.len() <= model.model_slot() {
            return Err(BuildError::UnknownNode(model));
        }
        if !var.is_var() || self.vars.len() <= var.var_slot() {
            return Err(BuildError::UnknownNode(var));
        }
        let mg = self.models[model.model_slot()].group;
        let vg = self.vars[var.var_slot()].group;
        match mapping {
            Mapping::Ident => {
                if mg != vg {
                    return Err(BuildError::IdentGroupMismatch {
                        model_group: mg,
                        var_group: vg,
                    });
                }
                Ok(MapRef::ident())
            }
            Mapping::Space => Ok(MapRef::space(vg)),
            Mapping::User { token } => {
                let index = self.intern_umap(mg, vg, token)?;
                Ok(MapRef::user(mg, index, false))
            }
        }
    }

    fn intern_umap(&mut self, source: Group, target: Group, token: u64) -> Result<u16, BuildError> {
        if let Some(&i) = self.umap_lookup.get(&(source, target, token)) {
            return Ok(i);
        }
        if self.umaps.len() >= MAX_UMAP {
            return Err(BuildError::TooManyUserMaps);
        }
        let index = self.umaps.len() as u16;
        self.umaps.push(UserMap {
            source,
            target,
            token,
        });
        self.umap_lookup.insert((source, target, token), index);
        Ok(index)
    }

    /// Inverse of a model-side edge map, for the variable-side edge list.
    fn invert_map(map: MapRef, model_group: Group, var_group: Group) -> MapRef {
        match map.kind() {
            MapKind::Ident => map,
            MapKind::Space => MapRef::space(model_group),
            MapKind::User => MapRef::user(var_group, map.user_index(), true),
        }
    }

    /// Emits the packed immutable graph.
    pub fn build(&self) -> Result<Graph, BuildError> {
        let nv = self.vars.len();
        let nm = self.models.len();

        // backward: per var, (model slot, return-edge index)
        // forward:  per var, (model slot, param-edge index)
        let mut back: Vec<Vec<(u16, u8)>> = vec![Vec::new(); nv];
        let mut fwd: Vec<Vec<(u16, u8)>> = vec![Vec::new(); nv];
        for (mi, dm) in self.models.iter().enumerate() {
            for (j, e) in dm.returns.iter().enumerate() {
                back[usize::from(e.var)].push((mi as u16, j as u8));
            }
            for (j, e) in dm.params.iter().enumerate() {
                fwd[usize::from(e.var)].push((mi as u16, j as u8));
            }
        }
        for (xi, list) in back.iter().enumerate() {
            if list.len() > MAX_BACK_EDGE {
                return Err(BuildError::TooManyProviders(Idx::var(xi as u16)));
            }
        }
        for (xi, list) in fwd.iter().enumerate() {
            if list.len() > MAX_FWD_EDGE {
                return Err(BuildError::TooManyConsumers(Idx::var(xi as u16)));
            }
        }

        let mut g = Graph {
            vars: self
                .vars
                .iter()
                .map(|dv| Var {
                    group: dv.group,
                    size: dv.size,
                    udata: dv.udata,
                    back: Slice::default(),
                    fwd: Slice::default(),
                })
                .collect(),
            models: self
                .models
                .iter()
                .map(|dm| Model {
                    group: dm.group,
                    k: dm.k,
                    c: dm.c,
                    ki: -dm.k / dm.c,
                    ci: 1.0 / dm.c,
                    udata: dm.udata,
                    flags: 0,
                    cparam: 0,
                    ccheck: 0,
                    params: Slice::default(),
                    returns: Slice::default(),
                    checks: Slice::default(),
                })
                .collect(),
            edges: Vec::new(),
            checks: Vec::new(),
            umaps: self.umaps.clone(),
            ng: 0,
            names: None,
        };

        // Interleaved layout: each variable's provider edges followed by
        // the checks and parameters of providers first seen here, then all
        // consumer edges followed by those models' returns.
        let mut params_placed = vec![false; nm];
        let mut returns_placed = vec![false; nm];

        for xi in 0..nv {
            let off = g.edges.len() as u32;
            for &(mi, rj) in &back[xi] {
                let dm = &self.models[usize::from(mi)];
                let re = dm.returns[usize::from(rj)];
                g.edges.push(Edge {
                    target: Idx::model(mi),
                    map: Self::invert_map(re.map, dm.group, self.vars[xi].group),
                    ex: rj,
                });
            }
            g.vars[xi].back = Slice {
                off,
                len: back[xi].len() as u16,
            };
            for &(mi, _) in &back[xi] {
                let slot = usize::from(mi);
                if params_placed[slot] {
                    continue;
                }
                params_placed[slot] = true;
                Self::place_model_inputs(&mut g, &self.models[slot], slot);
            }
        }

        for xi in 0..nv {
            let off = g.edges.len() as u32;
            for &(mi, pj) in &fwd[xi] {
                let dm = &self.models[usize::from(mi)];
                let pe = dm.params[usize::from(pj)];
                g.edges.push(Edge {
                    target: Idx::model(mi),
                    map: Self::invert_map(pe.map, dm.group, self.vars[xi].group),
                    ex: pj,
                });
            }
            g.vars[xi].fwd = Slice {
                off,
                len: fwd[xi].len() as u16,
            };
            for &(mi, _) in &fwd[xi] {
                let slot = usize::from(mi);
                if returns_placed[slot] {
                    continue;
                }
                returns_placed[slot] = true;
                Self::place_model_returns(&mut g, &self.models[slot], slot);
            }
        }

        // Models referenced by no variable still need their lists placed.
        for slot in 0..nm {
            if !params_placed[slot] {
                Self::place_model_inputs(&mut g, &self.models[slot], slot);
            }
            if !returns_placed[slot] {
                Self::place_model_returns(&mut g, &self.models[slot], slot);
            }
        }

        reorder_edges(&mut g);
        compute_flags(&mut g);
        g.ng = group_count(&g);

        Ok(g)
    }

    fn place_model_inputs(g: &mut Graph, dm: &DefModel, slot: usize) {
        let coff = g.checks.len() as u32;
        for (j, dc) in dm.checks.iter().enumerate() {
            g.checks.push(Check {
                edge: Edge {
                    target: Idx::var(dc.var),
                    map: dc.map,
                    ex: j as u8,
                },
                pred: dc.pred,
                penalty: dc.penalty,
            });
        }
        g.models[slot].checks = Slice {
            off: coff,
            len: dm.checks.len() as u16,
        };

        let poff = g.edges.len() as u32;
        for (j, de) in dm.params.iter().enumerate() {
            g.edges.push(Edge {
                target: Idx::var(de.var),
                map: de.map,
                ex: j as u8,
            });
        }
        g.models[slot].params = Slice {
            off: poff,
            len: dm.params.len() as u16,
        };
    }

    fn place_model_returns(g: &mut Graph, dm: &DefModel, slot: usize) {
        let off = g.edges.len() as u32;
        for (j, de) in dm.returns.iter().enumerate() {
            g.edges.push(Edge {
                target: Idx::var(de.var),
                map: de.map,
                ex: j as u8,
            });
        }
        g.models[slot].returns = Slice {
            off,
            len: dm.returns.len() as u16,
        };
    }
}

/// Partitions every model's parameter and check lists so edges targeting
/// computed variables come first, recording the boundary.
fn reorder_edges(g: &mut Graph) {
    let provider_counts: Vec<u16> = g.vars.iter().map(|x| x.back.len).collect();
    let Graph {
        models,
        edges,
        checks,
        ..
    } = g;
    for m in models.iter_mut() {
        let params = &mut edges[m.params.range()];
        let mut nc = 0_usize;
        for j in 0..params.len() {
            if provider_counts[params[j].target.var_slot()] > 0 {
                params.swap(nc, j);
                nc += 1;
            }
        }
        m.cparam = nc as u8;

        let mchecks = &mut checks[m.checks.range()];
        let mut nc = 0_usize;
        for j in 0..mchecks.len() {
            if provider_counts[mchecks[j].edge.target.var_slot()] > 0 {
                mchecks.swap(nc, j);
                nc += 1;
            }
        }
        m.ccheck = nc as u8;
    }
}

/// Flags models that can write straight into their consumer's buffer.
fn compute_flags(g: &mut Graph) {
    for slot in 0..g.models.len() {
        let m = &g.models[slot];
        let returns = &g.edges[m.returns.range()];
        let norf = returns.len() == 1 && returns[0].map.kind() == MapKind::Ident;
        g.models[slot].flags = if norf { M_NORETBUF } else { 0 };
    }
}

fn group_count(g: &Graph) -> Group {
    let vmax = g.vars.iter().map(|x| x.group).max();
    let mmax = g.models.iter().map(|m| m.group).max();
    match (vmax, mmax) {
        (Some(a), Some(b)) => a.max(b) + 1,
        (Some(a), None) | (None, Some(a)) => a + 1,
        (None, None) => 0,
    }
}

/// Emits the pruned graph a [`SubgraphMap`] describes.
///
/// Kept nodes are renumbered densely, dropped edges removed, user-map
/// indices rewritten, and the computed/given partition recomputed (pruning
/// a variable's providers turns it given).
#[must_use]
pub fn build_subgraph(g: &Graph, map: &SubgraphMap) -> Graph {
    let mut h = Graph {
        vars: Vec::new(),
        models: Vec::new(),
        edges: Vec::new(),
        checks: Vec::new(),
        umaps: Vec::new(),
        ng: g.ng,
        names: None,
    };

    // Dense node tables; new indices were assigned in selection order, so
    // place by new slot rather than appending.
    let mut var_at = vec![0_usize; map.vars_kept()];
    for (old, new) in map.var_entries() {
        var_at[new] = old;
    }
    h.vars = var_at.iter().map(|&old| g.vars[old]).collect();

    let mut model_at = vec![0_usize; map.models_kept()];
    for (old, new) in map.model_entries() {
        model_at[new] = old;
    }
    h.models = model_at.iter().map(|&old| g.models[old]).collect();

    let mut map_at = vec![0_usize; map.maps_kept()];
    for (old, new) in map.map_entries() {
        map_at[new] = old;
    }
    h.umaps = map_at.iter().map(|&old| g.umaps[old]).collect();

    let remap_user = |m: MapRef| -> MapRef {
        if m.kind() == MapKind::User {
            // Selection unions every mapping it touches, so the entry exists.
            let new = map.map_new_index(m.user_index()).unwrap_or(m.user_index());
            m.with_user_index(new)
        } else {
            m
        }
    };

    let mut params_placed = vec![false; h.models.len()];
    let mut returns_placed = vec![false; h.models.len()];

    for new_xi in 0..h.vars.len() {
        let old_xi = var_at[new_xi];
        let off = h.edges.len() as u32;
        let mut kept = Vec::new();
        for e in &g.edges[g.vars[old_xi].back.range()] {
            if let Some(new_mi) = map.model_new_index(e.target) {
                kept.push(new_mi);
                h.edges.push(Edge {
                    target: Idx::model(new_mi),
                    map: remap_user(e.map),
                    ex: e.ex,
                });
            }
        }
        h.vars[new_xi].back = Slice {
            off,
            len: kept.len() as u16,
        };
        for new_mi in kept {
            let slot = usize::from(new_mi);
            if params_placed[slot] {
                continue;
            }
            params_placed[slot] = true;
            place_sub_inputs(&mut h, g, map, model_at[slot], slot, &remap_user);
        }
    }

    for new_xi in 0..h.vars.len() {
        let old_xi = var_at[new_xi];
        let off = h.edges.len() as u32;
        let mut kept = Vec::new();
        for e in &g.edges[g.vars[old_xi].fwd.range()] {
            if let Some(new_mi) = map.model_new_index(e.target) {
                kept.push(new_mi);
                h.edges.push(Edge {
                    target: Idx::model(new_mi),
                    map: remap_user(e.map),
                    ex: e.ex,
                });
            }
        }
        h.vars[new_xi].fwd = Slice {
            off,
            len: kept.len() as u16,
        };
        for new_mi in kept {
            let slot = usize::from(new_mi);
            if returns_placed[slot] {
                continue;
            }
            returns_placed[slot] = true;
            place_sub_returns(&mut h, g, map, model_at[slot], slot, &remap_user);
        }
    }

    for slot in 0..h.models.len() {
        if !params_placed[slot] {
            place_sub_inputs(&mut h, g, map, model_at[slot], slot, &remap_user);
        }
        if !returns_placed[slot] {
            place_sub_returns(&mut h, g, map, model_at[slot], slot, &remap_user);
        }
    }

    reorder_edges(&mut h);

    if let Some(names) = &g.names {
        h.names = Some(DebugNames {
            vars: var_at
                .iter()
                .map(|&old| names.vars.get(old).cloned().unwrap_or_default())
                .collect(),
            models: model_at
                .iter()
                .map(|&old| names.models.get(old).cloned().unwrap_or_default())
                .collect(),
        });
    }

    h
}

fn place_sub_inputs(
    h: &mut Graph,
    g: &Graph,
    map: &SubgraphMap,
    old_slot: usize,
    new_slot: usize,
    remap_user: &dyn Fn(MapRef) -> MapRef,
) {
    let old = &g.models[old_slot];

    let coff = h.checks.len() as u32;
    let mut n = 0_u16;
    for c in &g.checks[old.checks.range()] {
        if let Some(new_xi) = map.var_new_index(c.edge.target) {
            h.checks.push(Check {
                edge: Edge {
                    target: Idx::var(new_xi),
                    map: remap_user(c.edge.map),
                    ex: c.edge.ex,
                },
                pred: c.pred,
                penalty: c.penalty,
            });
            n += 1;
        }
    }
    h.models[new_slot].checks = Slice { off: coff, len: n };

    let poff = h.edges.len() as u32;
    let mut n = 0_u16;
    for e in &g.edges[old.params.range()] {
        if let Some(new_xi) = map.var_new_index(e.target) {
            h.edges.push(Edge {
                target: Idx::var(new_xi),
                map: remap_user(e.map),
                ex: e.ex,
            });
            n += 1;
        }
    }
    h.models[new_slot].params = Slice { off: poff, len: n };
}

fn place_sub_returns(
    h: &mut Graph,
    g: &Graph,
    map: &SubgraphMap,
    old_slot: usize,
    new_slot: usize,
    remap_user: &dyn Fn(MapRef) -> MapRef,
) {
    let old = &g.models[old_slot];
    let off = h.edges.len() as u32;
    let mut n = 0_u16;
    for e in &g.edges[old.returns.range()] {
        if let Some(new_xi) = map.var_new_index(e.target) {
            h.edges.push(Edge {
                target: Idx::var(new_xi),
                map: remap_user(e.map),
                ex: e.ex,
            });
            n += 1;
        }
    }
    h.models[new_slot].returns = Slice { off, len: n };
}
