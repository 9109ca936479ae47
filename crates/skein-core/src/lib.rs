// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! skein-core: deterministic cost-minimizing chain solver.
//!
//! Skein resolves requested variable instances over a bipartite graph of
//! variables and models: each model computes variables from parameters
//! under an affine cost `k + c·S` and optional shadow penalties, and the
//! solver picks, per instance, the cheapest provider chain and drives its
//! evaluation. Instances are grouped and batched through packed subsets,
//! cross-group edges go through host-resolved mappings, and the solver
//! suspends cooperatively whenever it needs a shape, a mapping, a given
//! value, or a model execution from the host.
//!
//! The pipeline is [`GraphBuilder`] → [`Graph`] → (optional [`reduce`] →
//! [`build_subgraph`]) → [`Solver`] per request vector.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    clippy::float_cmp
)]
// Cost comparisons are exact by construction (bounds propagate through
// min/+/· on the same values), so float equality is part of the algorithm,
// not an accident.

mod bitmap;
mod builder;
mod graph;
mod idx;
mod mapping;
mod reduce;
mod shadow;
mod solver;
mod status;
mod subset;

/// Graph definition and emission.
pub use builder::{build_subgraph, BuildError, GraphBuilder};
/// Immutable graph records.
pub use graph::{Check, Edge, Graph, Model, UserMap, Var};
/// Shared index space and size limits.
pub use idx::{
    Group, Idx, Inst, MAX_BACK_EDGE, MAX_EDGE, MAX_FWD_EDGE, MAX_GROUP, MAX_IDX, MAX_INST,
    MAX_UMAP,
};
/// Mapping descriptors.
pub use mapping::{MapKind, MapRef, Mapping};
/// Subgraph pruning.
pub use reduce::{reduce, ReduceError, SubgraphMap};
/// Shadow predicates.
pub use shadow::{BadOpcode, Predicate};
/// The cooperative solver and its request vector.
pub use solver::{Request, Solver};
/// Yield protocol statuses and packed error info.
pub use status::{
    EntityTag, ErrorCode, ErrorInfo, ErrorSite, Status, CODE_ERROR, CODE_GVAL, CODE_MAPCALL,
    CODE_MAPCALL_INV, CODE_MODCALL, CODE_OK, CODE_SHAPE,
};
/// Packed instance subsets.
pub use subset::{InstRange, Subset, SubsetError, SubsetIter, SubsetPool};
