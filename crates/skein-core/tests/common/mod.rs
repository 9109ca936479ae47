// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, dead_code)]
//! Shared test host: answers solver yields from prepared tables and a
//! per-test model executor.

use std::collections::HashMap;

use skein_core::{Idx, Inst, InstRange, Solver, Status};

/// Prepared answers for every request class except model execution.
#[derive(Default)]
pub struct TestHost {
    /// Instance count per group.
    pub shapes: Vec<Inst>,
    /// `(var slot, instance)` → value bytes.
    pub givens: HashMap<(u16, Inst), Vec<u8>>,
    /// `(map index, inverse, instance)` → ranges.
    pub maps: HashMap<(u16, bool, Inst), Vec<InstRange>>,
}

impl TestHost {
    pub fn new(shapes: &[Inst]) -> Self {
        Self {
            shapes: shapes.to_vec(),
            ..Self::default()
        }
    }

    pub fn give_f64(&mut self, var: Idx, inst: Inst, value: f64) {
        self.givens
            .insert((var.var_slot() as u16, inst), value.to_ne_bytes().to_vec());
    }

    pub fn map_result(&mut self, index: u16, inverse: bool, inst: Inst, ranges: &[(Inst, Inst)]) {
        self.maps.insert(
            (index, inverse, inst),
            ranges.iter().map(|&(a, b)| InstRange::new(a, b)).collect(),
        );
    }
}

/// Drives `solver` to completion (or error), answering shape, mapping,
/// and given requests from `host` and model calls through `exec`.
pub fn drive<F>(solver: &mut Solver, host: &TestHost, mut exec: F) -> Status
where
    F: FnMut(&mut Solver, Idx, Inst),
{
    for _ in 0..100_000 {
        match solver.resume() {
            Status::Ok => return Status::Ok,
            Status::Shape { group } => {
                let n = host.shapes[usize::from(group)];
                solver.shape(group, n).expect("shape accepted");
            }
            Status::GivenValue { var, inst } => {
                let bytes = host
                    .givens
                    .get(&(var.var_slot() as u16, inst))
                    .unwrap_or_else(|| panic!("no prepared value for {var}:{inst}"));
                solver.give(var, inst, bytes).expect("give accepted");
            }
            Status::MapCall { index, inst } => {
                let ranges = host
                    .maps
                    .get(&(index, false, inst))
                    .unwrap_or_else(|| panic!("no prepared mapping {index}:{inst}"));
                solver
                    .provide_mapping(index, false, inst, ranges)
                    .expect("mapping accepted");
            }
            Status::MapCallInv { index, inst } => {
                let ranges = host
                    .maps
                    .get(&(index, true, inst))
                    .unwrap_or_else(|| panic!("no prepared inverse mapping {index}:{inst}"));
                solver
                    .provide_mapping(index, true, inst, ranges)
                    .expect("inverse mapping accepted");
            }
            Status::ModelCall { model, inst, .. } => exec(solver, model, inst),
            err @ Status::Error(_) => return err,
        }
    }
    panic!("solver did not settle");
}

pub fn f64_of(bytes: &[u8]) -> f64 {
    f64::from_ne_bytes(bytes.try_into().expect("8 value bytes"))
}

pub fn f64_at(bytes: &[u8], i: usize) -> f64 {
    f64_of(&bytes[i * 8..(i + 1) * 8])
}

pub fn write_f64(slot: &mut [u8], value: f64) {
    slot[..8].copy_from_slice(&value.to_ne_bytes());
}

pub fn write_f64_at(slot: &mut [u8], i: usize, value: f64) {
    slot[i * 8..(i + 1) * 8].copy_from_slice(&value.to_ne_bytes());
}
