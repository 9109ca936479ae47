// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shadow predicates.
//!
//! A shadow is a soft constraint on a model: a predicate over one
//! variable's value plus the penalty added to the model's cost when the
//! predicate fails on any instance of the checked subset. Predicates never
//! make a chain invalid on their own; they only make it more expensive.
//!
//! The operator opcodes are wire-stable; the 8-byte argument is
//! interpreted per operator.

use thiserror::Error;

/// Shadow predicate operator plus its argument.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Predicate {
    /// `value: f64 >= arg`.
    GeF64(f64),
    /// `value: f64 <= arg`.
    LeF64(f64),
    /// `value: f32 >= arg`.
    GeF32(f32),
    /// `value: f32 <= arg`.
    LeF32(f32),
    /// `(1 << value: u8) & mask != 0`.
    U8Mask64(u64),
}

/// Error decoding a predicate from its wire form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown shadow opcode {0}")]
pub struct BadOpcode(pub u8);

impl Predicate {
    /// Wire opcode for `>= f64`.
    pub const OP_GE_F64: u8 = 0;
    /// Wire opcode for `<= f64`.
    pub const OP_LE_F64: u8 = 1;
    /// Wire opcode for `>= f32`.
    pub const OP_GE_F32: u8 = 2;
    /// Wire opcode for `<= f32`.
    pub const OP_LE_F32: u8 = 3;
    /// Wire opcode for the u8 mask test.
    pub const OP_U8_MASK64: u8 = 4;

    /// Stable wire opcode of this operator.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::GeF64(_) => Self::OP_GE_F64,
            Self::LeF64(_) => Self::OP_LE_F64,
            Self::GeF32(_) => Self::OP_GE_F32,
            Self::LeF32(_) => Self::OP_LE_F32,
            Self::U8Mask64(_) => Self::OP_U8_MASK64,
        }
    }

    /// Argument as the 8-byte wire union.
    #[must_use]
    pub fn arg_bits(&self) -> u64 {
        match *self {
            Self::GeF64(a) | Self::LeF64(a) => a.to_bits(),
            Self::GeF32(a) | Self::LeF32(a) => u64::from(a.to_bits()),
            Self::U8Mask64(a) => a,
        }
    }

    /// Decodes an `(opcode, argument)` wire pair.
    pub fn from_wire(opcode: u8, arg: u64) -> Result<Self, BadOpcode> {
        match opcode {
            Self::OP_GE_F64 => Ok(Self::GeF64(f64::from_bits(arg))),
            Self::OP_LE_F64 => Ok(Self::LeF64(f64::from_bits(arg))),
            Self::OP_GE_F32 => Ok(Self::GeF32(f32::from_bits(arg as u32))),
            Self::OP_LE_F32 => Ok(Self::LeF32(f32::from_bits(arg as u32))),
            Self::OP_U8_MASK64 => Ok(Self::U8Mask64(arg)),
            other => Err(BadOpcode(other)),
        }
    }

    /// Byte width the checked variable must have.
    #[must_use]
    pub const fn value_size(&self) -> usize {
        match self {
            Self::GeF64(_) | Self::LeF64(_) => 8,
            Self::GeF32(_) | Self::LeF32(_) => 4,
            Self::U8Mask64(_) => 1,
        }
    }

    /// Evaluates the predicate on one instance's value bytes.
    ///
    /// `bytes` must be exactly [`Self::value_size`] long (the builder
    /// enforces this against the variable's declared size); a mismatch
    /// reads as a failed predicate.
    #[must_use]
    pub(crate) fn eval(&self, bytes: &[u8]) -> bool {
        match *self {
            Self::GeF64(a) => read_f64(bytes).is_some_and(|v| v >= a),
            Self::LeF64(a) => read_f64(bytes).is_some_and(|v| v <= a),
            Self::GeF32(a) => read_f32(bytes).is_some_and(|v| v >= a),
            Self::LeF32(a) => read_f32(bytes).is_some_and(|v| v <= a),
            Self::U8Mask64(mask) => bytes
                .first()
                .is_some_and(|&b| b < 64 && (1_u64 << b) & mask != 0),
        }
    }
}

fn read_f64(bytes: &[u8]) -> Option<f64> {
    (bytes.len() == 8).then(|| bytemuck::pod_read_unaligned(bytes))
}

fn read_f32(bytes: &[u8]) -> Option<f32> {
    (bytes.len() == 4).then(|| bytemuck::pod_read_unaligned(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_stable() {
        assert_eq!(Predicate::GeF64(0.0).opcode(), 0);
        assert_eq!(Predicate::LeF64(0.0).opcode(), 1);
        assert_eq!(Predicate::GeF32(0.0).opcode(), 2);
        assert_eq!(Predicate::LeF32(0.0).opcode(), 3);
        assert_eq!(Predicate::U8Mask64(0).opcode(), 4);
    }

    #[test]
    fn wire_round_trip() {
        for p in [
            Predicate::GeF64(1.5),
            Predicate::LeF64(-2.0),
            Predicate::GeF32(3.25),
            Predicate::LeF32(0.0),
            Predicate::U8Mask64(0b1010),
        ] {
            let back = Predicate::from_wire(p.opcode(), p.arg_bits()).expect("decode");
            assert_eq!(back, p);
        }
        assert_eq!(Predicate::from_wire(9, 0), Err(BadOpcode(9)));
    }

    #[test]
    fn scalar_comparisons() {
        let ge = Predicate::GeF64(100.0);
        assert!(ge.eval(&100.0_f64.to_ne_bytes()));
        assert!(ge.eval(&250.5_f64.to_ne_bytes()));
        assert!(!ge.eval(&0.0_f64.to_ne_bytes()));

        let le = Predicate::LeF32(1.0);
        assert!(le.eval(&1.0_f32.to_ne_bytes()));
        assert!(!le.eval(&1.5_f32.to_ne_bytes()));
    }

    #[test]
    fn mask_test_checks_bit() {
        let p = Predicate::U8Mask64(0b100);
        assert!(p.eval(&[2]));
        assert!(!p.eval(&[1]));
        assert!(!p.eval(&[64]));
    }
}
