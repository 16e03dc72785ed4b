//! Hardware key-slot pool.
//!
//! The secure element exposes a small, fixed range of temporary key objects.
//! `SlotPool` is the only place that marks one Allocated or Free. Each
//! allocated slot remembers the session it was handed to, so the vault can
//! account for a session's slots after `close()` and reject a slot that a
//! session tries to use on another session's behalf.

use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::error::AllocError;

/// Opaque handle to one hardware key slot.
///
/// Carries the device object id. There is no arithmetic on it and callers
/// cannot mint one: slots only come out of [`SlotPool::allocate`]. It
/// serializes for audit output but does not deserialize.
///
/// ```compile_fail
/// let slot: tlsvault::SlotId = serde_json::from_str("3").unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(u16);

impl SlotId {
    pub(crate) fn new(object_id: u16) -> Self {
        Self(object_id)
    }

    /// Device object id, as placed in command payloads.
    pub fn object_id(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Identity of one handshake/connection within a vault. Minted by
/// [`Vault::begin_handshake`](crate::Vault::begin_handshake) only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Fixed-capacity pool of slot handles.
#[derive(Debug, Clone)]
pub struct SlotPool {
    base: u16,
    owners: Vec<Option<SessionId>>,
}

impl SlotPool {
    /// A pool of `capacity` slots whose object ids start at `base`.
    pub fn new(base: u16, capacity: u16) -> Self {
        Self {
            base,
            owners: vec![None; usize::from(capacity)],
        }
    }

    /// Total slots, allocated or not.
    pub fn capacity(&self) -> usize {
        self.owners.len()
    }

    /// Hand out the lowest-numbered free slot.
    pub fn allocate(&mut self, owner: SessionId) -> Result<SlotId, AllocError> {
        let index = self
            .owners
            .iter()
            .position(Option::is_none)
            .ok_or(AllocError::SlotsExhausted)?;
        self.owners[index] = Some(owner);
        // index < capacity <= 256 and base + capacity fits in u16 (checked by config)
        let slot = SlotId(self.base.wrapping_add(index as u16));
        trace!(target: "tlsvault::slot", %slot, %owner, "allocated");
        Ok(slot)
    }

    /// Mark a slot Free. Returns whether it was allocated; freeing a free
    /// slot is a no-op.
    pub fn free(&mut self, slot: SlotId) -> Result<bool, AllocError> {
        let index = self.index_of(slot)?;
        let was_allocated = self.owners[index].take().is_some();
        if was_allocated {
            trace!(target: "tlsvault::slot", %slot, "freed");
        }
        Ok(was_allocated)
    }

    /// Whether `slot` is currently handed out.
    pub fn is_allocated(&self, slot: SlotId) -> bool {
        self.owner_of(slot).is_some()
    }

    /// The session a slot is allocated to, if any.
    pub fn owner_of(&self, slot: SlotId) -> Option<SessionId> {
        self.index_of(slot).ok().and_then(|i| self.owners[i])
    }

    /// Number of allocated slots across all sessions.
    pub fn allocated(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    /// Slots currently allocated to `owner`, lowest first.
    pub fn allocated_to(&self, owner: SessionId) -> Vec<SlotId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == Some(owner))
            .map(|(i, _)| SlotId(self.base.wrapping_add(i as u16)))
            .collect()
    }

    fn index_of(&self, slot: SlotId) -> Result<usize, AllocError> {
        let offset = slot.0.checked_sub(self.base).map(usize::from);
        match offset {
            Some(i) if i < self.owners.len() => Ok(i),
            _ => Err(AllocError::InvalidSlot(slot.0)),
        }
    }
}
