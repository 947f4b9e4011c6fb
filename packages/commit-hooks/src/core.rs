//! Core vocabulary for commit hooks.
//!
//! # Overview
//!
//! A hook is addressed by a [`HookSlot`]: the lifecycle [`Phase`] it runs in
//! and the [`MutationKind`] that caused the entity to be tracked. There are
//! nine slots in total, named by the `{phase}_commit_from_{kind}` convention:
//!
//! | Phase    | Insert                      | Update                      | Delete                      |
//! |----------|-----------------------------|-----------------------------|-----------------------------|
//! | `before` | `before_commit_from_insert` | `before_commit_from_update` | `before_commit_from_delete` |
//! | `after`  | `after_commit_from_insert`  | `after_commit_from_update`  | `after_commit_from_delete`  |
//! | `failed` | `failed_commit_from_insert` | `failed_commit_from_update` | `failed_commit_from_delete` |
//!
//! An entity type declares the slots it implements as a [`HookSet`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::HookConfigError;

// =============================================================================
// Phase
// =============================================================================

/// The lifecycle point at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// After flush, before the physical commit.
    Before,
    /// After a successful physical commit.
    After,
    /// After a rollback that followed a commit attempt.
    Failed,
}

impl Phase {
    /// All phases, in lifecycle order.
    pub const ALL: [Phase; 3] = [Phase::Before, Phase::After, Phase::Failed];

    /// The name used in hook method names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
            Phase::Failed => "failed",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Phase::Before => 0,
            Phase::After => 1,
            Phase::Failed => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = HookConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(Phase::Before),
            "after" => Ok(Phase::After),
            "failed" => Ok(Phase::Failed),
            other => Err(HookConfigError::UnknownPhase {
                phase: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Mutation Kind
// =============================================================================

/// The nature of the change that caused an entity to be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    /// Fixed dispatch priority. Inserts settle before updates, updates
    /// before deletes, independent of flush order.
    pub const DISPATCH_ORDER: [MutationKind; 3] = [
        MutationKind::Insert,
        MutationKind::Update,
        MutationKind::Delete,
    ];

    /// The name used in hook method names.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            MutationKind::Insert => 0,
            MutationKind::Update => 1,
            MutationKind::Delete => 2,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = HookConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(MutationKind::Insert),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(HookConfigError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Kind Set
// =============================================================================

/// Deduplicated set of mutation kinds recorded for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KindSet(u8);

impl KindSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a kind. Returns `false` if it was already present.
    pub fn insert(&mut self, kind: MutationKind) -> bool {
        let bit = 1 << kind.index();
        let fresh = self.0 & bit == 0;
        self.0 |= bit;
        fresh
    }

    pub fn remove(&mut self, kind: MutationKind) {
        self.0 &= !(1 << kind.index());
    }

    pub fn contains(&self, kind: MutationKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate the contained kinds in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = MutationKind> + '_ {
        MutationKind::DISPATCH_ORDER
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<MutationKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = MutationKind>>(iter: I) -> Self {
        let mut set = KindSet::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

// =============================================================================
// Hook Slot
// =============================================================================

/// One of the nine (phase, kind) hook positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookSlot {
    pub phase: Phase,
    pub kind: MutationKind,
}

impl HookSlot {
    pub const fn new(phase: Phase, kind: MutationKind) -> Self {
        Self { phase, kind }
    }

    /// All nine slots, phase-major.
    pub fn all() -> impl Iterator<Item = HookSlot> {
        Phase::ALL.into_iter().flat_map(|phase| {
            MutationKind::DISPATCH_ORDER
                .into_iter()
                .map(move |kind| HookSlot::new(phase, kind))
        })
    }

    /// The conventional method name, e.g. `after_commit_from_delete`.
    pub fn method_name(&self) -> String {
        format!("{}_commit_from_{}", self.phase, self.kind)
    }

    fn bit(self) -> u16 {
        1 << (self.phase.index() * 3 + self.kind.index())
    }
}

impl fmt::Display for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_commit_from_{}", self.phase, self.kind)
    }
}

impl FromStr for HookSlot {
    type Err = HookConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let (phase, kind) =
            name.split_once("_commit_from_")
                .ok_or_else(|| HookConfigError::UnknownHook {
                    name: name.to_string(),
                })?;
        Ok(HookSlot::new(phase.parse()?, kind.parse()?))
    }
}

// =============================================================================
// Hook Set
// =============================================================================

/// The set of hook slots an entity type implements.
///
/// Only slots in this set are tracked and dispatched for the type.
///
/// ```ignore
/// let hooks = HookSet::new()
///     .with(Phase::Before, MutationKind::Insert)
///     .with(Phase::After, MutationKind::Insert);
///
/// // or, by conventional name
/// let hooks = HookSet::from_names(&["before_commit_from_insert", "after_commit_from_insert"])?;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HookSet(u16);

impl HookSet {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Every slot.
    pub fn all() -> Self {
        HookSlot::all().collect()
    }

    /// Every phase for a single mutation kind.
    pub fn for_kind(kind: MutationKind) -> Self {
        Phase::ALL
            .into_iter()
            .map(|phase| HookSlot::new(phase, kind))
            .collect()
    }

    /// Builder-style insert.
    pub fn with(mut self, phase: Phase, kind: MutationKind) -> Self {
        self.insert(HookSlot::new(phase, kind));
        self
    }

    /// Parse conventional hook method names.
    ///
    /// Duplicate names collapse into one slot. Any name that does not decode
    /// to a known phase and kind is a configuration error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, HookConfigError> {
        let mut set = HookSet::new();
        for name in names {
            set.insert(name.as_ref().parse()?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, slot: HookSlot) {
        self.0 |= slot.bit();
    }

    pub fn contains(&self, slot: HookSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = HookSlot> + '_ {
        HookSlot::all().filter(move |slot| self.contains(*slot))
    }

    /// Phases subscribed to mutations of `kind`, in lifecycle order.
    pub fn phases_for(&self, kind: MutationKind) -> SmallVec<[Phase; 3]> {
        Phase::ALL
            .into_iter()
            .filter(|phase| self.contains(HookSlot::new(*phase, kind)))
            .collect()
    }
}

impl FromIterator<HookSlot> for HookSet {
    fn from_iter<I: IntoIterator<Item = HookSlot>>(iter: I) -> Self {
        let mut set = HookSet::new();
        for slot in iter {
            set.insert(slot);
        }
        set
    }
}

// =============================================================================
// Session Id
// =============================================================================

/// Identifies one hosting session, and with it one change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
