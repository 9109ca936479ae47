// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mapping descriptors.
//!
//! Every edge carries a mapping that turns "model instance `i`" into a set
//! of variable instances (or, on inverted edges, the other way around).
//! The descriptor packs into 32 bits:
//!
//! ```text
//!          31..30   29    28..16         15..0
//! user     00       inv   source group   map index
//! ident    01       -     -              -
//! space    10       -     -              target group
//! ```
//!
//! Identity maps `i ↦ {i}` and require both endpoint groups to coincide.
//! Space maps `i ↦ 0..|target group|` independently of `i`. User maps are
//! resolved by the host through the suspension protocol and come paired
//! with their inverse (same index, inverse bit set).

use crate::idx::Group;

const TAG_SHIFT: u32 = 30;
const TAG_USER: u32 = 0;
const TAG_IDENT: u32 = 1;
const TAG_SPACE: u32 = 2;
const USER_INVERSE: u32 = 1 << 29;

/// Kind of a mapping descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapKind {
    /// Host-resolved mapping.
    User,
    /// `i ↦ {i}`.
    Ident,
    /// `i ↦ 0..|target group|`.
    Space,
}

/// Packed mapping descriptor carried on edges.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapRef(u32);

impl MapRef {
    /// The identity mapping.
    #[must_use]
    pub const fn ident() -> Self {
        Self(TAG_IDENT << TAG_SHIFT)
    }

    /// A space mapping onto `target` group.
    #[must_use]
    pub const fn space(target: Group) -> Self {
        Self((TAG_SPACE << TAG_SHIFT) | target as u32)
    }

    /// A user mapping with interned `index`, applied from `source` group.
    #[must_use]
    pub const fn user(source: Group, index: u16, inverse: bool) -> Self {
        let inv = if inverse { USER_INVERSE } else { 0 };
        Self((TAG_USER << TAG_SHIFT) | inv | ((source as u32) << 16) | index as u32)
    }

    /// The descriptor kind.
    #[must_use]
    pub const fn kind(self) -> MapKind {
        match self.0 >> TAG_SHIFT {
            TAG_USER => MapKind::User,
            TAG_IDENT => MapKind::Ident,
            _ => MapKind::Space,
        }
    }

    /// Interned user-map index. Only meaningful for user maps.
    #[must_use]
    pub const fn user_index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Whether this is the inverse direction of a user map.
    #[must_use]
    pub const fn is_inverse(self) -> bool {
        self.0 & USER_INVERSE != 0
    }

    /// Source group of a user map (the group the instance argument lives in).
    #[must_use]
    pub const fn user_source(self) -> Group {
        ((self.0 >> 16) & 0x1fff) as Group
    }

    /// Target group of a space map.
    #[must_use]
    pub const fn space_target(self) -> Group {
        (self.0 & 0xffff) as Group
    }

    /// Replaces the user-map index, preserving direction and source group.
    #[must_use]
    pub(crate) const fn with_user_index(self, index: u16) -> Self {
        Self((self.0 & !0xffff) | index as u32)
    }

    /// `true` when the mapped set is nonempty regardless of host input.
    ///
    /// Identity sets are singletons and space sets cover a whole group;
    /// only user maps may come back empty. (A zero-shape group can make a
    /// space set empty at solve time, but bound computation runs before
    /// shapes exist and treats it as populated.)
    #[must_use]
    pub(crate) const fn is_statically_nonempty(self) -> bool {
        !matches!(self.kind(), MapKind::User)
    }

    /// Raw packed descriptor.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for MapRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind() {
            MapKind::Ident => write!(f, "ident"),
            MapKind::Space => write!(f, "space:g{}", self.space_target()),
            MapKind::User => write!(
                f,
                "user:{}{}",
                if self.is_inverse() { "<" } else { ">" },
                self.user_index()
            ),
        }
    }
}

/// Builder-side mapping request on a parameter/return/check edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mapping {
    /// Identity; model and variable groups must coincide.
    Ident,
    /// Space map over the variable's group.
    Space,
    /// User mapping; `token` is the opaque host key. Edges sharing source
    /// group, target group, and token share one interned mapping.
    User {
        /// Opaque host key identifying the mapping function.
        token: u64,
    },
}
