// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
//! End-to-end solves over small hand-built graphs.

mod common;

use std::sync::Arc;

use common::{drive, f64_at, f64_of, write_f64, write_f64_at, TestHost};
use skein_core::{
    GraphBuilder, Idx, Mapping, Predicate, Request, Solver, Status, Subset, SubsetPool,
};

fn solver_for(graph: skein_core::Graph, reqs: Vec<Request>) -> Solver {
    Solver::new(Arc::new(graph), SubsetPool::new(), reqs)
}

#[test]
fn trivial_given_round_trips_host_value() {
    let mut b = GraphBuilder::new();
    let x = b.add_variable(0, 8, 0).expect("var");
    let g = b.build().expect("build");
    assert!(g.var(x).is_given());

    let mut host = TestHost::new(&[1]);
    host.give_f64(x, 0, 3.14);

    let mut s = solver_for(g, vec![Request::with_buffer(x, Subset::point(0), Vec::new())]);
    let status = drive(&mut s, &host, |_, _, _| panic!("no models to call"));
    assert_eq!(status, Status::Ok);
    let buf = s.take_buffer(0).expect("buffer");
    assert_eq!(f64_of(&buf), 3.14);
}

#[test]
fn single_model_computes_from_given_parameter() {
    let mut b = GraphBuilder::new();
    let a = b.add_variable(0, 8, 0).expect("var a");
    let y = b.add_variable(0, 8, 0).expect("var y");
    let m = b.add_model(0, 1.0, 2.0, 0).expect("model");
    b.add_param(m, a, Mapping::Ident).expect("param");
    b.add_return(m, y, Mapping::Ident).expect("return");
    let g = b.build().expect("build");
    assert!(g.model(m).writes_direct());

    let mut host = TestHost::new(&[1]);
    host.give_f64(a, 0, 2.0);

    let mut s = solver_for(g, vec![Request::with_buffer(y, Subset::point(0), Vec::new())]);
    let mut calls = 0;
    let status = drive(&mut s, &host, |s, model, inst| {
        calls += 1;
        assert_eq!(model, m);
        assert_eq!(inst, 0);
        let a_val = f64_of(s.call_param(0));
        write_f64(s.call_return(0), 2.0 * a_val);
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(calls, 1);
    assert_eq!(f64_of(&s.take_buffer(0).expect("buffer")), 4.0);
    // k + c·S with no computed parameters: 1 + 2·0.
    assert_eq!(s.chain_cost(y, 0), Some(1.0));
}

/// Builds `y` with two provider models over given parameters `a`, `b`.
fn two_provider_graph(
    k1: f32,
    k2: f32,
) -> (skein_core::Graph, Idx, Idx, Idx, Idx, Idx) {
    let mut bld = GraphBuilder::new();
    let y = bld.add_variable(0, 8, 0).expect("y");
    let a = bld.add_variable(0, 8, 0).expect("a");
    let b = bld.add_variable(0, 8, 0).expect("b");
    let m1 = bld.add_model(0, k1, 1.0, 0).expect("m1");
    bld.add_param(m1, a, Mapping::Ident).expect("p");
    bld.add_return(m1, y, Mapping::Ident).expect("r");
    let m2 = bld.add_model(0, k2, 1.0, 0).expect("m2");
    bld.add_param(m2, b, Mapping::Ident).expect("p");
    bld.add_return(m2, y, Mapping::Ident).expect("r");
    (bld.build().expect("build"), y, a, b, m1, m2)
}

#[test]
fn cheapest_of_two_providers_wins() {
    let (g, y, a, b, m1, _m2) = two_provider_graph(0.0, 10.0);
    let mut host = TestHost::new(&[1]);
    host.give_f64(a, 0, 5.0);
    host.give_f64(b, 0, 7.0);

    let mut s = solver_for(g, vec![Request::with_buffer(y, Subset::point(0), Vec::new())]);
    let mut called = Vec::new();
    let status = drive(&mut s, &host, |s, model, _| {
        called.push(model);
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(called, vec![m1]);
    assert_eq!(f64_of(&s.take_buffer(0).expect("buffer")), 5.0);
    assert_eq!(s.chain_cost(y, 0), Some(0.0));
}

#[test]
fn violated_shadow_penalty_flips_the_winner() {
    let mut bld = GraphBuilder::new();
    let y = bld.add_variable(0, 8, 0).expect("y");
    let a = bld.add_variable(0, 8, 0).expect("a");
    let b = bld.add_variable(0, 8, 0).expect("b");
    let m1 = bld.add_model(0, 0.0, 1.0, 0).expect("m1");
    bld.add_param(m1, a, Mapping::Ident).expect("p");
    bld.add_return(m1, y, Mapping::Ident).expect("r");
    bld.add_check(m1, a, Mapping::Ident, Predicate::GeF64(100.0), 50.0)
        .expect("check");
    let m2 = bld.add_model(0, 10.0, 1.0, 0).expect("m2");
    bld.add_param(m2, b, Mapping::Ident).expect("p");
    bld.add_return(m2, y, Mapping::Ident).expect("r");
    let g = bld.build().expect("build");

    let mut host = TestHost::new(&[1]);
    host.give_f64(a, 0, 0.0);
    host.give_f64(b, 0, 7.0);

    let mut s = solver_for(g, vec![Request::with_buffer(y, Subset::point(0), Vec::new())]);
    let mut called = Vec::new();
    let status = drive(&mut s, &host, |s, model, _| {
        called.push(model);
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    // cost(m1) = 50 through the failed shadow, cost(m2) = 10.
    assert_eq!(called, vec![m2]);
    assert_eq!(f64_of(&s.take_buffer(0).expect("buffer")), 7.0);
    assert_eq!(s.chain_cost(y, 0), Some(10.0));
}

#[test]
fn satisfied_shadow_keeps_the_cheap_provider() {
    let mut bld = GraphBuilder::new();
    let y = bld.add_variable(0, 8, 0).expect("y");
    let a = bld.add_variable(0, 8, 0).expect("a");
    let b = bld.add_variable(0, 8, 0).expect("b");
    let m1 = bld.add_model(0, 0.0, 1.0, 0).expect("m1");
    bld.add_param(m1, a, Mapping::Ident).expect("p");
    bld.add_return(m1, y, Mapping::Ident).expect("r");
    bld.add_check(m1, a, Mapping::Ident, Predicate::GeF64(100.0), 50.0)
        .expect("check");
    let m2 = bld.add_model(0, 10.0, 1.0, 0).expect("m2");
    bld.add_param(m2, b, Mapping::Ident).expect("p");
    bld.add_return(m2, y, Mapping::Ident).expect("r");
    let g = bld.build().expect("build");

    let mut host = TestHost::new(&[1]);
    host.give_f64(a, 0, 250.0);
    host.give_f64(b, 0, 7.0);

    let mut s = solver_for(g, vec![Request::with_buffer(y, Subset::point(0), Vec::new())]);
    let mut called = Vec::new();
    let status = drive(&mut s, &host, |s, model, _| {
        called.push(model);
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(called, vec![m1]);
    assert_eq!(f64_of(&s.take_buffer(0).expect("buffer")), 250.0);
}

#[test]
fn cycle_with_an_acyclic_alternative_solves() {
    let mut bld = GraphBuilder::new();
    let x = bld.add_variable(0, 8, 0).expect("x");
    let y = bld.add_variable(0, 8, 0).expect("y");
    let given = bld.add_variable(0, 8, 0).expect("given");
    // x <- m_cycle(y), x <- m_flat(given), y <- m_back(x)
    let m_cycle = bld.add_model(0, 0.0, 1.0, 0).expect("m_cycle");
    bld.add_param(m_cycle, y, Mapping::Ident).expect("p");
    bld.add_return(m_cycle, x, Mapping::Ident).expect("r");
    let m_flat = bld.add_model(0, 1.0, 1.0, 0).expect("m_flat");
    bld.add_param(m_flat, given, Mapping::Ident).expect("p");
    bld.add_return(m_flat, x, Mapping::Ident).expect("r");
    let m_back = bld.add_model(0, 0.0, 1.0, 0).expect("m_back");
    bld.add_param(m_back, x, Mapping::Ident).expect("p");
    bld.add_return(m_back, y, Mapping::Ident).expect("r");
    let g = bld.build().expect("build");

    let mut host = TestHost::new(&[1]);
    host.give_f64(given, 0, 9.0);

    let mut s = solver_for(g, vec![Request::with_buffer(x, Subset::point(0), Vec::new())]);
    let mut called = Vec::new();
    let status = drive(&mut s, &host, |s, model, _| {
        called.push(model);
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(called, vec![m_flat]);
    assert_eq!(f64_of(&s.take_buffer(0).expect("buffer")), 9.0);
    assert_eq!(s.chain_cost(x, 0), Some(1.0));
}

#[test]
fn cycle_members_solve_one_after_another() {
    // Both ends of the cycle also have flat chains; requesting both must
    // not let the first search poison the second.
    let mut bld = GraphBuilder::new();
    let x = bld.add_variable(0, 8, 0).expect("x");
    let y = bld.add_variable(0, 8, 0).expect("y");
    let gx = bld.add_variable(0, 8, 0).expect("gx");
    let gy = bld.add_variable(0, 8, 0).expect("gy");
    let m_xy = bld.add_model(0, 0.0, 1.0, 0).expect("m_xy");
    bld.add_param(m_xy, y, Mapping::Ident).expect("p");
    bld.add_return(m_xy, x, Mapping::Ident).expect("r");
    let m_yx = bld.add_model(0, 0.0, 1.0, 0).expect("m_yx");
    bld.add_param(m_yx, x, Mapping::Ident).expect("p");
    bld.add_return(m_yx, y, Mapping::Ident).expect("r");
    let m_gx = bld.add_model(0, 2.0, 1.0, 0).expect("m_gx");
    bld.add_param(m_gx, gx, Mapping::Ident).expect("p");
    bld.add_return(m_gx, x, Mapping::Ident).expect("r");
    let m_gy = bld.add_model(0, 5.0, 1.0, 0).expect("m_gy");
    bld.add_param(m_gy, gy, Mapping::Ident).expect("p");
    bld.add_return(m_gy, y, Mapping::Ident).expect("r");
    let g = bld.build().expect("build");

    let mut host = TestHost::new(&[1]);
    host.give_f64(gx, 0, 1.0);
    host.give_f64(gy, 0, 2.0);

    let mut s = solver_for(
        g,
        vec![
            Request::new(x, Subset::point(0)),
            Request::new(y, Subset::point(0)),
        ],
    );
    let status = drive(&mut s, &host, |s, _, _| {
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v);
    });
    assert_eq!(status, Status::Ok);
    // x solves flat at 2; y then rides the cycle edge through x at cost
    // c·cost(x) = 2 rather than its own flat chain at 5.
    assert_eq!(s.chain_cost(x, 0), Some(2.0));
    assert_eq!(s.chain_cost(y, 0), Some(2.0));
}

#[test]
fn vector_return_sizes_buffers_per_mapping() {
    // One call returns `a` (identity in g0) and `b` (the whole of g1).
    let mut bld = GraphBuilder::new();
    let a = bld.add_variable(0, 8, 0).expect("a");
    let b = bld.add_variable(1, 8, 0).expect("b");
    let src = bld.add_variable(0, 8, 0).expect("src");
    let m = bld.add_model(0, 0.0, 1.0, 0).expect("m");
    bld.add_param(m, src, Mapping::Ident).expect("p");
    bld.add_return(m, a, Mapping::Ident).expect("ra");
    bld.add_return(m, b, Mapping::Space).expect("rb");
    let g = bld.build().expect("build");
    assert!(!g.model(m).writes_direct());

    let mut host = TestHost::new(&[1, 3]);
    host.give_f64(src, 0, 4.0);

    let mut s = solver_for(
        g,
        vec![
            Request::with_buffer(a, Subset::point(0), Vec::new()),
            Request::with_buffer(b, Subset::range(0, 3), Vec::new()),
        ],
    );
    let status = drive(&mut s, &host, |s, _, _| {
        assert_eq!(s.call_edge_len(1), 1);
        assert_eq!(s.call_edge_len(2), 3);
        let v = f64_of(s.call_param(0));
        write_f64(s.call_return(0), v + 1.0);
        let rb = s.call_return(1);
        assert_eq!(rb.len(), 24);
        for i in 0..3 {
            write_f64_at(rb, i, v * (i + 1) as f64);
        }
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(f64_of(&s.take_buffer(0).expect("a buffer")), 5.0);
    let bv = s.take_buffer(1).expect("b buffer");
    assert_eq!(
        (f64_at(&bv, 0), f64_at(&bv, 1), f64_at(&bv, 2)),
        (4.0, 8.0, 12.0)
    );
}

#[test]
fn user_mapping_feeds_cross_group_parameters() {
    // g1's variable depends on a user-selected window of g0 instances.
    let mut bld = GraphBuilder::new();
    let base = bld.add_variable(0, 8, 0).expect("base");
    let agg = bld.add_variable(1, 8, 0).expect("agg");
    let m = bld.add_model(1, 0.0, 1.0, 0).expect("m");
    bld.add_param(m, base, Mapping::User { token: 7 }).expect("p");
    bld.add_return(m, agg, Mapping::Ident).expect("r");
    let g = bld.build().expect("build");
    assert_eq!(g.user_map_count(), 1);
    assert_eq!(g.user_map(0).token, 7);

    let mut host = TestHost::new(&[4, 2]);
    for i in 0..4 {
        host.give_f64(base, i, f64::from(i) * 10.0);
    }
    // agg:0 sums base[0..2), agg:1 sums base[1..4).
    host.map_result(0, false, 0, &[(0, 2)]);
    host.map_result(0, false, 1, &[(1, 4)]);

    let mut s = solver_for(
        g,
        vec![Request::with_buffer(agg, Subset::range(0, 2), Vec::new())],
    );
    let status = drive(&mut s, &host, |s, _, inst| {
        let p = s.call_param(0);
        let sum: f64 = (0..p.len() / 8).map(|i| f64_at(p, i)).sum();
        let p_len = p.len();
        write_f64(s.call_return(0), sum);
        let expected_len = if inst == 0 { 16 } else { 24 };
        assert_eq!(p_len, expected_len);
    });
    assert_eq!(status, Status::Ok);
    let buf = s.take_buffer(0).expect("buffer");
    assert_eq!((f64_at(&buf, 0), f64_at(&buf, 1)), (10.0, 60.0));
}

#[test]
fn empty_request_subset_is_a_no_op() {
    let mut b = GraphBuilder::new();
    let x = b.add_variable(0, 8, 0).expect("var");
    let g = b.build().expect("build");
    let mut s = solver_for(g, vec![Request::new(x, Subset::EMPTY)]);
    assert_eq!(s.resume(), Status::Ok);
    assert_eq!(s.resume(), Status::Ok);
}
