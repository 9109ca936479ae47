// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
//! Reducer selection, failure, and idempotence.

mod common;

use std::sync::Arc;

use common::{drive, f64_of, write_f64, TestHost};
use skein_core::{
    build_subgraph, reduce, GraphBuilder, Idx, Mapping, Predicate, ReduceError, Request, Solver,
    Status, Subset, SubsetPool,
};

#[test]
fn unsolvable_variable_is_reported_by_index() {
    let mut b = GraphBuilder::new();
    let y = b.add_variable(0, 8, 0).expect("y");
    let z = b.add_variable(0, 8, 0).expect("z");
    let dep = b.add_variable(0, 8, 0).expect("dep");
    // Give z a consumer-only role: it feeds m but nothing produces it,
    // and the host does not declare it given.
    let m = b.add_model(0, 1.0, 1.0, 0).expect("m");
    b.add_param(m, z, Mapping::Ident).expect("p");
    b.add_return(m, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let err = reduce(&g, &[y], &[dep]).expect_err("z is unsolvable");
    assert_eq!(err, ReduceError::MissingProvider(z));
}

#[test]
fn dominated_provider_is_pruned() {
    let mut b = GraphBuilder::new();
    let y = b.add_variable(0, 8, 0).expect("y");
    let a = b.add_variable(0, 8, 0).expect("a");
    let m_cheap = b.add_model(0, 1.0, 1.0, 0).expect("m cheap");
    b.add_param(m_cheap, a, Mapping::Ident).expect("p");
    b.add_return(m_cheap, y, Mapping::Ident).expect("r");
    // Strictly dominated: lo = 50 > hi(m_cheap) = 1.
    let m_dear = b.add_model(0, 50.0, 1.0, 0).expect("m dear");
    b.add_param(m_dear, a, Mapping::Ident).expect("p");
    b.add_return(m_dear, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let map = reduce(&g, &[y], &[a]).expect("reduce");
    assert!(map.var_new_index(y).is_some());
    assert!(map.var_new_index(a).is_some());
    assert!(map.model_new_index(m_cheap).is_some());
    assert_eq!(map.model_new_index(m_dear), None);

    let sub = build_subgraph(&g, &map);
    assert_eq!(sub.model_count(), 1);
    assert_eq!(sub.var_count(), 2);
}

#[test]
fn uncertain_provider_survives_with_the_bound_holder() {
    // m_risky is cheaper in the best case but carries a shadow penalty,
    // so its interval [1, 31] straddles m_safe's [10, 10]: both stay.
    let mut b = GraphBuilder::new();
    let y = b.add_variable(0, 8, 0).expect("y");
    let a = b.add_variable(0, 8, 0).expect("a");
    let m_risky = b.add_model(0, 1.0, 1.0, 0).expect("m risky");
    b.add_param(m_risky, a, Mapping::Ident).expect("p");
    b.add_return(m_risky, y, Mapping::Ident).expect("r");
    b.add_check(m_risky, a, Mapping::Ident, Predicate::GeF64(0.0), 30.0)
        .expect("check");
    let m_safe = b.add_model(0, 10.0, 1.0, 0).expect("m safe");
    b.add_param(m_safe, a, Mapping::Ident).expect("p");
    b.add_return(m_safe, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let map = reduce(&g, &[y], &[a]).expect("reduce");
    assert!(map.model_new_index(m_risky).is_some());
    assert!(map.model_new_index(m_safe).is_some());
}

#[test]
fn cycle_providers_are_never_pruned_to_one_side() {
    let mut b = GraphBuilder::new();
    let x = b.add_variable(0, 8, 0).expect("x");
    let y = b.add_variable(0, 8, 0).expect("y");
    let gx = b.add_variable(0, 8, 0).expect("gx");
    let gy = b.add_variable(0, 8, 0).expect("gy");
    let m_xy = b.add_model(0, 0.0, 1.0, 0).expect("m_xy");
    b.add_param(m_xy, y, Mapping::Ident).expect("p");
    b.add_return(m_xy, x, Mapping::Ident).expect("r");
    let m_yx = b.add_model(0, 0.0, 1.0, 0).expect("m_yx");
    b.add_param(m_yx, x, Mapping::Ident).expect("p");
    b.add_return(m_yx, y, Mapping::Ident).expect("r");
    let m_gx = b.add_model(0, 2.0, 1.0, 0).expect("m_gx");
    b.add_param(m_gx, gx, Mapping::Ident).expect("p");
    b.add_return(m_gx, x, Mapping::Ident).expect("r");
    let m_gy = b.add_model(0, 5.0, 1.0, 0).expect("m_gy");
    b.add_param(m_gy, gy, Mapping::Ident).expect("p");
    b.add_return(m_gy, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let map = reduce(&g, &[x, y], &[gx, gy]).expect("reduce");
    // x is cheapest flat (2); y is cheapest through the surviving cycle
    // edge (c·cost(x) = 2). The selector must keep that edge even though
    // it lies on a cycle, and may prune the dominated alternatives.
    assert!(map.model_new_index(m_gx).is_some());
    assert!(map.model_new_index(m_yx).is_some());
    assert_eq!(map.model_new_index(m_xy), None);
    assert_eq!(map.model_new_index(m_gy), None);

    // The pruned graph still solves both roots at the optimal costs.
    let sub = build_subgraph(&g, &map);
    let rx = Idx::var(map.var_new_index(x).expect("x kept"));
    let ry = Idx::var(map.var_new_index(y).expect("y kept"));
    let rgx = Idx::var(map.var_new_index(gx).expect("gx kept"));
    let mut host = TestHost::new(&[1]);
    host.give_f64(rgx, 0, 1.0);
    let mut s = Solver::new(
        Arc::new(sub),
        SubsetPool::new(),
        vec![
            Request::new(rx, Subset::point(0)),
            Request::new(ry, Subset::point(0)),
        ],
    );
    let status = drive(&mut s, &host, |s, _, _| {
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(s.chain_cost(rx, 0), Some(2.0));
    assert_eq!(s.chain_cost(ry, 0), Some(2.0));
}

#[test]
fn reduction_is_idempotent() {
    let mut b = GraphBuilder::new();
    let y = b.add_variable(0, 8, 0).expect("y");
    let a = b.add_variable(0, 8, 0).expect("a");
    let t = b.add_variable(0, 8, 0).expect("t");
    let m1 = b.add_model(0, 1.0, 1.0, 0).expect("m1");
    b.add_param(m1, t, Mapping::Ident).expect("p");
    b.add_return(m1, y, Mapping::Ident).expect("r");
    let m2 = b.add_model(0, 1.0, 1.0, 0).expect("m2");
    b.add_param(m2, a, Mapping::Ident).expect("p");
    b.add_return(m2, t, Mapping::Ident).expect("r");
    let m_dead = b.add_model(0, 90.0, 1.0, 0).expect("m dead");
    b.add_param(m_dead, a, Mapping::Ident).expect("p");
    b.add_return(m_dead, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let map1 = reduce(&g, &[y], &[a]).expect("first reduction");
    let sub1 = build_subgraph(&g, &map1);

    let roots: Vec<Idx> = map1.var_new_index(y).map(Idx::var).into_iter().collect();
    let givens: Vec<Idx> = map1.var_new_index(a).map(Idx::var).into_iter().collect();
    let map2 = reduce(&sub1, &roots, &givens).expect("second reduction");

    // Fixed point: the second pass keeps everything the first kept.
    assert_eq!(map2.vars_kept(), sub1.var_count());
    assert_eq!(map2.models_kept(), sub1.model_count());
    let sub2 = build_subgraph(&sub1, &map2);
    assert_eq!(sub2.var_count(), sub1.var_count());
    assert_eq!(sub2.model_count(), sub1.model_count());
}

#[test]
fn reduced_graph_solves_with_the_same_cost() {
    let mut b = GraphBuilder::new();
    let y = b.add_variable(0, 8, 0).expect("y");
    let a = b.add_variable(0, 8, 0).expect("a");
    let t = b.add_variable(0, 8, 0).expect("t");
    let m1 = b.add_model(0, 1.0, 2.0, 0).expect("m1");
    b.add_param(m1, t, Mapping::Ident).expect("p");
    b.add_return(m1, y, Mapping::Ident).expect("r");
    let m2 = b.add_model(0, 3.0, 1.0, 0).expect("m2");
    b.add_param(m2, a, Mapping::Ident).expect("p");
    b.add_return(m2, t, Mapping::Ident).expect("r");
    let m_dead = b.add_model(0, 90.0, 1.0, 0).expect("m dead");
    b.add_param(m_dead, a, Mapping::Ident).expect("p");
    b.add_return(m_dead, y, Mapping::Ident).expect("r");
    let g = b.build().expect("build");

    let mut host = TestHost::new(&[1]);
    host.give_f64(a, 0, 1.0);

    let exec = |s: &mut Solver, _m: Idx, _i: u16| {
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v + 1.0);
    };

    let mut full = Solver::new(
        Arc::new(g.clone()),
        SubsetPool::new(),
        vec![Request::with_buffer(y, Subset::point(0), Vec::new())],
    );
    assert_eq!(drive(&mut full, &host, exec), Status::Ok);
    let full_cost = full.chain_cost(y, 0).expect("cost");

    let map = reduce(&g, &[y], &[a]).expect("reduce");
    let sub = build_subgraph(&g, &map);
    let ry = Idx::var(map.var_new_index(y).expect("y kept"));
    let ra = Idx::var(map.var_new_index(a).expect("a kept"));
    let mut host2 = TestHost::new(&[1]);
    host2.give_f64(ra, 0, 1.0);
    let mut reduced = Solver::new(
        Arc::new(sub),
        SubsetPool::new(),
        vec![Request::with_buffer(ry, Subset::point(0), Vec::new())],
    );
    assert_eq!(drive(&mut reduced, &host2, exec), Status::Ok);

    // Chain cost: m2 at 3 + 1·0, then m1 at 1 + 2·3.
    assert_eq!(full_cost, 7.0);
    assert_eq!(reduced.chain_cost(ry, 0), Some(full_cost));
    assert_eq!(
        f64_of(&reduced.take_buffer(0).expect("buffer")),
        f64_of(&full.take_buffer(0).expect("buffer"))
    );
}

#[test]
fn given_root_passes_through_reduction() {
    let mut b = GraphBuilder::new();
    let x = b.add_variable(0, 8, 0).expect("x");
    let g = b.build().expect("build");
    let map = reduce(&g, &[x], &[x]).expect("reduce");
    assert!(map.var_new_index(x).is_some());
    assert_eq!(map.models_kept(), 0);
}
