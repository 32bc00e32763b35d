use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Identifier the pipeline assigns to every package it builds.
///
/// Identifiers are handed out in increasing order, so a package with a lower
/// id was built earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(pub u64);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg-{}", self.0)
    }
}

/// Bag of processing bits carried by a [`WorkPackage`].
///
/// Bit `i` (see [`ProcessFlags::stage`]) records that stage `i` of a pipeline
/// reported the package as done. The top bit is reserved for
/// [`ProcessFlags::UNPROCESSED`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessFlags(u32);

impl ProcessFlags {
    pub const NONE: Self = Self(0);

    /// A stage gave up on the package; it skipped the remaining stages.
    pub const UNPROCESSED: Self = Self(1 << 31);

    /// Number of stage bits available below [`ProcessFlags::UNPROCESSED`].
    pub const MAX_STAGES: usize = 31;

    /// Bit for the stage at `index`.
    ///
    /// # Panics
    /// If `index >= MAX_STAGES`.
    pub const fn stage(index: usize) -> Self {
        assert!(index < Self::MAX_STAGES, "stage index out of range");
        Self(1 << index)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Number of stage bits that are set, ignoring [`ProcessFlags::UNPROCESSED`].
    pub const fn stages_passed(self) -> u32 {
        (self.0 & !Self::UNPROCESSED.0).count_ones()
    }
}

impl BitOr for ProcessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProcessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Unit of work travelling through a pipeline.
///
/// A package is owned by exactly one stage at a time and moves by value from
/// one mailbox to the next, so whoever holds it may mutate the payload.
#[derive(Debug)]
pub struct WorkPackage<T> {
    id: PackageId,
    flags: ProcessFlags,
    payload: T,
}

impl<T> WorkPackage<T> {
    pub fn new(id: PackageId, payload: T) -> Self {
        Self {
            id,
            flags: ProcessFlags::NONE,
            payload,
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    /// Sets `flag` in addition to the bits already present.
    pub fn mark(&mut self, flag: ProcessFlags) {
        self.flags.insert(flag);
    }

    pub fn is_marked(&self, flag: ProcessFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Replaces the payload, keeping id and flags.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WorkPackage<U> {
        WorkPackage {
            id: self.id,
            flags: self.flags,
            payload: f(self.payload),
        }
    }
}
