// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable solver graph.
//!
//! A [`Graph`] is the packed, read-only form a [`crate::GraphBuilder`]
//! emits. All cross-references are dense indices into flat arenas; nothing
//! in the graph owns a pointer to anything else, so a graph can be shared
//! (`Arc`) between any number of solvers.
//!
//! Edge arenas are laid out so that a variable's provider list sits
//! immediately before the checks and parameters of those providers, which
//! keeps the candidate scan and the inner chain loops on warm lines. Every
//! model's parameter and check lists are partitioned: computed targets
//! first, given targets after, with the boundary stored per model, so hot
//! loops branch on a single index instead of per edge.

use crate::idx::{Group, Idx};
use crate::mapping::MapRef;
use crate::shadow::Predicate;

/// Model flag: single identity-mapped return, so the model writes its
/// result directly into the consumer's value buffer.
pub(crate) const M_NORETBUF: u8 = 0x1;

/// A directed edge between a model and a variable.
///
/// `ex` is the edge's position in its definition-order list before
/// reordering; model-call slots are addressed by it. On backward
/// (provider) edges `ex` is the index of the corresponding return edge.
#[derive(Clone, Copy, Debug)]
pub struct Edge {
    /// The node on the far end (variable for model-side lists, model for
    /// variable-side lists).
    pub target: Idx,
    /// Mapping from this edge's source instance to target instances.
    pub map: MapRef,
    /// Pre-reorder edge position (see type docs).
    pub ex: u8,
}

/// A shadow edge: predicate, penalty, and the checked variable.
#[derive(Clone, Copy, Debug)]
pub struct Check {
    /// Edge to the checked variable.
    pub edge: Edge,
    /// Predicate evaluated per instance of the mapped subset.
    pub pred: Predicate,
    /// Cost penalty charged when the predicate fails.
    pub penalty: f32,
}

/// Span into one of the graph's flat arenas.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Slice {
    pub(crate) off: u32,
    pub(crate) len: u16,
}

impl Slice {
    pub(crate) fn range(self) -> core::ops::Range<usize> {
        let off = self.off as usize;
        off..off + usize::from(self.len)
    }
}

/// A variable node.
#[derive(Clone, Copy, Debug)]
pub struct Var {
    pub(crate) group: Group,
    pub(crate) size: u16,
    pub(crate) udata: u64,
    pub(crate) back: Slice,
    pub(crate) fwd: Slice,
}

impl Var {
    /// Group tag.
    #[must_use]
    pub fn group(&self) -> Group {
        self.group
    }

    /// Value byte size.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// Opaque host data attached at definition time.
    #[must_use]
    pub fn udata(&self) -> u64 {
        self.udata
    }

    /// `true` iff the variable has no provider models and therefore must
    /// be supplied by the host.
    #[must_use]
    pub fn is_given(&self) -> bool {
        self.back.len == 0
    }

    /// Number of provider models.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        usize::from(self.back.len)
    }
}

/// A model node with its affine cost `k + c·S`.
#[derive(Clone, Copy, Debug)]
pub struct Model {
    pub(crate) group: Group,
    pub(crate) k: f32,
    pub(crate) c: f32,
    pub(crate) ki: f32,
    pub(crate) ci: f32,
    pub(crate) udata: u64,
    pub(crate) flags: u8,
    pub(crate) cparam: u8,
    pub(crate) ccheck: u8,
    pub(crate) params: Slice,
    pub(crate) returns: Slice,
    pub(crate) checks: Slice,
}

impl Model {
    /// Group tag.
    #[must_use]
    pub fn group(&self) -> Group {
        self.group
    }

    /// Constant cost term (`k ≥ 0`).
    #[must_use]
    pub fn k(&self) -> f32 {
        self.k
    }

    /// Cost slope (`c ≥ 1`).
    #[must_use]
    pub fn c(&self) -> f32 {
        self.c
    }

    /// Opaque host data attached at definition time.
    #[must_use]
    pub fn udata(&self) -> u64 {
        self.udata
    }

    /// Number of parameter edges.
    #[must_use]
    pub fn param_count(&self) -> usize {
        usize::from(self.params.len)
    }

    /// Number of return edges.
    #[must_use]
    pub fn return_count(&self) -> usize {
        usize::from(self.returns.len)
    }

    /// Total cost of the model at parameter-cost sum `s`.
    #[must_use]
    pub fn cost(&self, s: f32) -> f32 {
        self.k + self.c * s
    }

    /// Inverse of [`Self::cost`]: the parameter-cost budget admitting
    /// `cost`. Valid because `c ≥ 1`.
    #[must_use]
    pub fn cost_inv(&self, cost: f32) -> f32 {
        self.ki + self.ci * cost
    }

    /// `true` when the model writes directly into its sole consumer's
    /// buffer (single identity-mapped return).
    #[must_use]
    pub fn writes_direct(&self) -> bool {
        self.flags & M_NORETBUF != 0
    }
}

/// An interned user mapping. The forward direction maps instances of
/// `source` (the model group) to subsets of `target` (the variable
/// group); the paired inverse maps the other way.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserMap {
    /// Model-side group.
    pub source: Group,
    /// Variable-side group.
    pub target: Group,
    /// Opaque host key; edges with equal (source, target, token) share
    /// this mapping and its caches.
    pub token: u64,
}

/// Optional per-node labels for diagnostics.
#[derive(Clone, Debug, Default)]
pub(crate) struct DebugNames {
    pub(crate) vars: Vec<String>,
    pub(crate) models: Vec<String>,
}

/// Immutable post-build graph.
#[derive(Clone, Debug)]
pub struct Graph {
    pub(crate) vars: Vec<Var>,
    pub(crate) models: Vec<Model>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) checks: Vec<Check>,
    pub(crate) umaps: Vec<UserMap>,
    pub(crate) ng: Group,
    pub(crate) names: Option<DebugNames>,
}

impl Graph {
    /// Number of variables.
    #[must_use]
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Number of models.
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Number of groups (`max group tag + 1`).
    #[must_use]
    pub fn group_count(&self) -> Group {
        self.ng
    }

    /// Number of interned user mappings.
    #[must_use]
    pub fn user_map_count(&self) -> usize {
        self.umaps.len()
    }

    /// Variable record for `idx` (must name a variable in this graph).
    #[must_use]
    pub fn var(&self, idx: Idx) -> &Var {
        debug_assert!(idx.is_var());
        &self.vars[idx.var_slot()]
    }

    /// Model record for `idx` (must name a model in this graph).
    #[must_use]
    pub fn model(&self, idx: Idx) -> &Model {
        debug_assert!(idx.is_model());
        &self.models[idx.model_slot()]
    }

    /// Provider (backward) edges of a variable. Edge targets are models;
    /// maps are variable-instance → model-instances.
    #[must_use]
    pub fn backward(&self, idx: Idx) -> &[Edge] {
        &self.edges[self.var(idx).back.range()]
    }

    /// Consumer (forward) edges of a variable.
    #[must_use]
    pub fn forward(&self, idx: Idx) -> &[Edge] {
        &self.edges[self.var(idx).fwd.range()]
    }

    /// All parameter edges of a model, computed targets first.
    #[must_use]
    pub fn params(&self, idx: Idx) -> &[Edge] {
        &self.edges[self.model(idx).params.range()]
    }

    /// Parameter edges whose target is computed.
    #[must_use]
    pub fn computed_params(&self, idx: Idx) -> &[Edge] {
        let m = self.model(idx);
        &self.edges[m.params.range()][..usize::from(m.cparam)]
    }

    /// Parameter edges whose target is given.
    #[must_use]
    pub fn given_params(&self, idx: Idx) -> &[Edge] {
        let m = self.model(idx);
        &self.edges[m.params.range()][usize::from(m.cparam)..]
    }

    /// Return edges of a model, in definition order.
    #[must_use]
    pub fn returns(&self, idx: Idx) -> &[Edge] {
        &self.edges[self.model(idx).returns.range()]
    }

    /// All shadow edges of a model, computed targets first.
    #[must_use]
    pub fn checks(&self, idx: Idx) -> &[Check] {
        &self.checks[self.model(idx).checks.range()]
    }

    /// Shadow edges whose target is computed.
    #[must_use]
    pub fn computed_checks(&self, idx: Idx) -> &[Check] {
        let m = self.model(idx);
        &self.checks[m.checks.range()][..usize::from(m.ccheck)]
    }

    /// Shadow edges whose target is given.
    #[must_use]
    pub fn given_checks(&self, idx: Idx) -> &[Check] {
        let m = self.model(idx);
        &self.checks[m.checks.range()][usize::from(m.ccheck)..]
    }

    /// Interned user mapping `index`.
    #[must_use]
    pub fn user_map(&self, index: u16) -> &UserMap {
        &self.umaps[usize::from(index)]
    }

    /// Attaches diagnostic labels to nodes. Purely cosmetic; labels show
    /// up in [`Self::label`] and trace output.
    pub fn set_debug_names(&mut self, vars: Vec<String>, models: Vec<String>) {
        self.names = Some(DebugNames { vars, models });
    }

    /// Diagnostic label for a node: the debug name when set, otherwise the
    /// `v#`/`m#` form.
    #[must_use]
    pub fn label(&self, idx: Idx) -> String {
        if let Some(names) = &self.names {
            let list = if idx.is_var() {
                names.vars.get(idx.var_slot())
            } else {
                names.models.get(idx.model_slot())
            };
            if let Some(name) = list {
                return name.clone();
            }
        }
        idx.to_string()
    }

    /// Iterates all variable indices.
    pub fn var_indices(&self) -> impl Iterator<Item = Idx> {
        (0..self.vars.len() as u16).map(Idx::var)
    }

    /// Iterates all model indices.
    pub fn model_indices(&self) -> impl Iterator<Item = Idx> {
        (0..self.models.len() as u16).map(Idx::model)
    }
}
