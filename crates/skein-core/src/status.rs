// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Suspension statuses and packed error info.
//!
//! [`Status`] is what [`crate::Solver::resume`] returns: either the
//! request is satisfied, the solver needs something from the host (shape,
//! mapping, given value, model execution), or it failed. Every status has
//! a stable 64-bit wire form: the low 16 bits are the code, the remaining
//! bits carry up to three 16-bit fields (`A` at 63..48, `B` at 47..32,
//! `C` at 31..16).
//!
//! [`ErrorInfo`] packs a 4-bit error code, a 4-bit location, and up to two
//! tagged 16-bit values naming the offending entities into 48 bits, so a
//! whole error fits in one status word.

use crate::idx::{Group, Idx, Inst};

/// Wire code: request satisfied.
pub const CODE_OK: u16 = 0;
/// Wire code: shape request.
pub const CODE_SHAPE: u16 = 1;
/// Wire code: forward mapping request.
pub const CODE_MAPCALL: u16 = 2;
/// Wire code: inverse mapping request.
pub const CODE_MAPCALL_INV: u16 = 3;
/// Wire code: given-value request.
pub const CODE_GVAL: u16 = 4;
/// Wire code: model execution request.
pub const CODE_MODCALL: u16 = 5;
/// Wire code: unrecoverable error.
pub const CODE_ERROR: u16 = 6;

/// Solver yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Every request is satisfied; results are readable.
    Ok,
    /// Call [`crate::Solver::shape`] (or `shape_table`) for `group`, then
    /// resume.
    Shape {
        /// Group whose instance count is needed.
        group: Group,
    },
    /// Resolve user mapping `index` for `inst` via
    /// [`crate::Solver::provide_mapping`], then resume.
    MapCall {
        /// Interned user-map index.
        index: u16,
        /// Source-group instance to map.
        inst: Inst,
    },
    /// Like [`Status::MapCall`] but for the inverse direction.
    MapCallInv {
        /// Interned user-map index.
        index: u16,
        /// Target-group instance to map back.
        inst: Inst,
    },
    /// Supply a value with [`crate::Solver::give`] (or `give_all`), then
    /// resume.
    GivenValue {
        /// The given variable.
        var: Idx,
        /// Missing instance.
        inst: Inst,
    },
    /// Execute model `model` instance `inst` and write its returns through
    /// the call accessors, then resume. Parameter slots are `0..np`,
    /// return slots `np..np + nr`.
    ModelCall {
        /// The model to execute.
        model: Idx,
        /// Model instance.
        inst: Inst,
        /// Parameter edge count.
        np: u8,
        /// Return edge count.
        nr: u8,
    },
    /// Unrecoverable failure; every further resume yields it again.
    Error(ErrorInfo),
}

impl Status {
    /// Wire code of this status.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => CODE_OK,
            Self::Shape { .. } => CODE_SHAPE,
            Self::MapCall { .. } => CODE_MAPCALL,
            Self::MapCallInv { .. } => CODE_MAPCALL_INV,
            Self::GivenValue { .. } => CODE_GVAL,
            Self::ModelCall { .. } => CODE_MODCALL,
            Self::Error(_) => CODE_ERROR,
        }
    }

    /// Packs the status into its 64-bit wire form.
    #[must_use]
    pub fn word(&self) -> u64 {
        let abc = |a: u16, b: u16, c: u16| {
            (u64::from(a) << 48) | (u64::from(b) << 32) | (u64::from(c) << 16)
        };
        let fields = match *self {
            Self::Ok => 0,
            Self::Shape { group } => abc(group, 0, 0),
            Self::MapCall { index, inst } | Self::MapCallInv { index, inst } => {
                abc(index, inst, 0)
            }
            Self::GivenValue { var, inst } => abc(var.wire(), inst, 0),
            Self::ModelCall {
                model,
                inst,
                np,
                nr,
            } => abc(model.wire(), inst, (u16::from(np) << 8) | u16::from(nr)),
            Self::Error(ei) => ei.pack() << 16,
        };
        fields | u64::from(self.code())
    }

    /// Decodes a wire word produced by [`Self::word`].
    #[must_use]
    pub fn from_word(word: u64) -> Option<Self> {
        let a = (word >> 48) as u16;
        let b = (word >> 32) as u16;
        let c = (word >> 16) as u16;
        match (word & 0xffff) as u16 {
            CODE_OK => Some(Self::Ok),
            CODE_SHAPE => Some(Self::Shape { group: a }),
            CODE_MAPCALL => Some(Self::MapCall { index: a, inst: b }),
            CODE_MAPCALL_INV => Some(Self::MapCallInv { index: a, inst: b }),
            CODE_GVAL => Some(Self::GivenValue {
                var: Idx::from_raw(a as i16),
                inst: b,
            }),
            CODE_MODCALL => Some(Self::ModelCall {
                model: Idx::from_raw(a as i16),
                inst: b,
                np: (c >> 8) as u8,
                nr: (c & 0xff) as u8,
            }),
            CODE_ERROR => ErrorInfo::unpack(word >> 16).map(Self::Error),
            _ => None,
        }
    }
}

/// Solver error code (4-bit wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ErrorCode {
    /// Functionality not implemented.
    Nyi = 1,
    /// Invalid argument or protocol misuse.
    Invalid = 2,
    /// Attempt to overwrite immutable data.
    Rewrite = 3,
    /// Chain-solver stack depth exceeded.
    Depth = 4,
    /// A requested external value was not supplied.
    Value = 5,
    /// Scratch pool exhausted.
    Mem = 6,
    /// No chain with finite cost.
    Chain = 7,
}

impl ErrorCode {
    fn from_wire(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::Nyi),
            2 => Some(Self::Invalid),
            3 => Some(Self::Rewrite),
            4 => Some(Self::Depth),
            5 => Some(Self::Value),
            6 => Some(Self::Mem),
            7 => Some(Self::Chain),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Nyi => "not implemented",
            Self::Invalid => "invalid argument",
            Self::Rewrite => "rewrite of immutable data",
            Self::Depth => "max chain depth exceeded",
            Self::Value => "value not given",
            Self::Mem => "out of scratch memory",
            Self::Chain => "no chain with finite cost",
        }
    }
}

/// Where in the solver an error originated (4-bit wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ErrorSite {
    /// Main chain solver.
    Solver = 1,
    /// Cycle handling.
    Cycle = 2,
    /// Shape table.
    Shape = 3,
    /// Given-value handling.
    Give = 4,
    /// External memory handling.
    Mem = 5,
    /// Mapping resolution.
    Map = 6,
    /// Scratch pool.
    Scratch = 7,
}

impl ErrorSite {
    fn from_wire(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::Solver),
            2 => Some(Self::Cycle),
            3 => Some(Self::Shape),
            4 => Some(Self::Give),
            5 => Some(Self::Mem),
            6 => Some(Self::Map),
            7 => Some(Self::Scratch),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Solver => "solver",
            Self::Cycle => "cycle",
            Self::Shape => "shape",
            Self::Give => "give",
            Self::Mem => "mem",
            Self::Map => "map",
            Self::Scratch => "scratch",
        }
    }
}

/// Tag of an error argument value (4-bit wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum EntityTag {
    /// Group tag.
    Group = 1,
    /// Variable index (shared index space wire form).
    Var = 2,
    /// Model index (shared index space wire form).
    Model = 3,
    /// User-mapping index.
    Map = 4,
    /// Instance index.
    Inst = 5,
}

impl EntityTag {
    fn from_wire(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::Group),
            2 => Some(Self::Var),
            3 => Some(Self::Model),
            4 => Some(Self::Map),
            5 => Some(Self::Inst),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Var => "var",
            Self::Model => "model",
            Self::Map => "map",
            Self::Inst => "inst",
        }
    }
}

/// Packed error: code, location, and up to two tagged entity values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorInfo {
    /// What went wrong.
    pub code: ErrorCode,
    /// Which subsystem reported it.
    pub site: ErrorSite,
    /// First tagged argument, if any.
    pub primary: Option<(EntityTag, u16)>,
    /// Second tagged argument, if any.
    pub secondary: Option<(EntityTag, u16)>,
}

impl ErrorInfo {
    /// Builds an error with no arguments.
    #[must_use]
    pub fn new(code: ErrorCode, site: ErrorSite) -> Self {
        Self {
            code,
            site,
            primary: None,
            secondary: None,
        }
    }

    /// Attaches the first tagged argument.
    #[must_use]
    pub fn with(mut self, tag: EntityTag, value: u16) -> Self {
        if self.primary.is_none() {
            self.primary = Some((tag, value));
        } else {
            self.secondary = Some((tag, value));
        }
        self
    }

    /// Packs into the 48-bit wire layout:
    /// `code | site << 4 | tag1 << 8 | tag2 << 12 | v1 << 16 | v2 << 32`.
    #[must_use]
    pub fn pack(&self) -> u64 {
        let (t1, v1) = self
            .primary
            .map_or((0, 0), |(t, v)| (t as u64, u64::from(v)));
        let (t2, v2) = self
            .secondary
            .map_or((0, 0), |(t, v)| (t as u64, u64::from(v)));
        (self.code as u64) | ((self.site as u64) << 4) | (t1 << 8) | (t2 << 12) | (v1 << 16)
            | (v2 << 32)
    }

    /// Decodes the wire layout; `None` for malformed words.
    #[must_use]
    pub fn unpack(word: u64) -> Option<Self> {
        let code = ErrorCode::from_wire(word & 0xf)?;
        let site = ErrorSite::from_wire((word >> 4) & 0xf)?;
        let decode_arg = |tag: u64, value: u64| -> Option<(EntityTag, u16)> {
            EntityTag::from_wire(tag).map(|t| (t, value as u16))
        };
        Some(Self {
            code,
            site,
            primary: decode_arg((word >> 8) & 0xf, (word >> 16) & 0xffff),
            secondary: decode_arg((word >> 12) & 0xf, (word >> 32) & 0xffff),
        })
    }
}

impl core::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.code.describe(), self.site.describe())?;
        for arg in [self.primary, self.secondary].into_iter().flatten() {
            write!(f, " {}={}", arg.0.describe(), arg.1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_words_round_trip() {
        let statuses = [
            Status::Ok,
            Status::Shape { group: 3 },
            Status::MapCall { index: 2, inst: 7 },
            Status::MapCallInv { index: 2, inst: 7 },
            Status::GivenValue {
                var: Idx::var(5),
                inst: 1,
            },
            Status::ModelCall {
                model: Idx::model(4),
                inst: 0,
                np: 2,
                nr: 1,
            },
            Status::Error(
                ErrorInfo::new(ErrorCode::Chain, ErrorSite::Solver)
                    .with(EntityTag::Var, 3)
                    .with(EntityTag::Inst, 9),
            ),
        ];
        for s in statuses {
            assert_eq!(Status::from_word(s.word()), Some(s), "{s:?}");
        }
    }

    #[test]
    fn code_field_is_low_16_bits() {
        assert_eq!(Status::Ok.word(), 0);
        assert_eq!(Status::Shape { group: 1 }.word() & 0xffff, 1);
        let gv = Status::GivenValue {
            var: Idx::var(8),
            inst: 2,
        };
        assert_eq!(gv.word() & 0xffff, u64::from(CODE_GVAL));
        assert_eq!((gv.word() >> 48) as u16, 8);
        assert_eq!((gv.word() >> 32) as u16 & 0xffff, 2);
    }

    #[test]
    fn error_info_display_names_entities() {
        let ei = ErrorInfo::new(ErrorCode::Value, ErrorSite::Give).with(EntityTag::Var, 12);
        assert_eq!(ei.to_string(), "value not given (give) var=12");
    }

    #[test]
    fn malformed_error_word_decodes_to_none() {
        assert_eq!(ErrorInfo::unpack(0), None);
        assert_eq!(ErrorInfo::unpack(0xf), None);
    }
}
