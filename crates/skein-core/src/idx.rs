// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Index types and graph size limits.
//!
//! Variables and models share one signed 16-bit index space: variable
//! indices are nonnegative, model indices are negative. The shared space is
//! what the wire-level status word and error info carry; typed accessors
//! below convert to dense array slots.

/// Group tag identifying an instance space (`0..group_count`).
pub type Group = u16;

/// Instance index within a group.
pub type Inst = u16;

/// Maximum valid (positive) node index per class.
pub const MAX_IDX: u16 = 0x7ffe;
/// Maximum parameter/return/check edges per model.
pub const MAX_EDGE: usize = 0x7f;
/// Maximum forward (variable → consumer model) edges per variable.
pub const MAX_FWD_EDGE: usize = 0xffff;
/// Maximum backward (provider model) edges per variable.
pub const MAX_BACK_EDGE: usize = 0xff;
/// Maximum valid instance index within a group.
pub const MAX_INST: Inst = 0xfffe;
/// Maximum number of user mappings.
pub const MAX_UMAP: usize = 0x7f;
/// Maximum group tag (13 bits, bounded by the mapping descriptor payload).
pub const MAX_GROUP: Group = 0x1fff;

/// Node index in the shared variable/model space.
///
/// Nonnegative raw values are variables, negative raw values are models
/// (model `m` is stored as `!m`, i.e. `-1 - m`). `Idx` is a plain wire
/// value; whether it actually names a node is a property of the graph it
/// is used against.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Idx(i16);

impl Idx {
    /// Wraps a raw signed index.
    #[must_use]
    pub const fn from_raw(raw: i16) -> Self {
        Self(raw)
    }

    /// Returns the raw signed index.
    #[must_use]
    pub const fn raw(self) -> i16 {
        self.0
    }

    /// Builds the index of variable slot `slot`.
    #[must_use]
    pub const fn var(slot: u16) -> Self {
        Self(slot as i16)
    }

    /// Builds the index of model slot `slot`.
    #[must_use]
    pub const fn model(slot: u16) -> Self {
        Self(!(slot as i16))
    }

    /// Returns `true` iff this index names a variable.
    #[must_use]
    pub const fn is_var(self) -> bool {
        self.0 >= 0
    }

    /// Returns `true` iff this index names a model.
    #[must_use]
    pub const fn is_model(self) -> bool {
        self.0 < 0
    }

    /// Dense variable-array slot. Only meaningful when [`Self::is_var`].
    #[must_use]
    pub const fn var_slot(self) -> usize {
        self.0 as usize
    }

    /// Dense model-array slot. Only meaningful when [`Self::is_model`].
    #[must_use]
    pub const fn model_slot(self) -> usize {
        (!self.0) as usize
    }

    /// The 16-bit field carried in status words and error info.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self.0 as u16
    }
}

impl core::fmt::Display for Idx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_var() {
            write!(f, "v{}", self.var_slot())
        } else {
            write!(f, "m{}", self.model_slot())
        }
    }
}
