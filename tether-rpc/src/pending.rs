//! Outstanding-request table.
//!
//! Request ids are small monotonic integers, so pendings live in a
//! power-of-two slot ring indexed by `(id - 1) & mask` instead of a
//! hash map. The id counter wraps after 2³² − 1; an id whose slot is
//! still occupied by a live pending shifts forward to the next free id.

use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tether_core::cancel::CancelToken;
use tether_core::error::Error;
use tether_core::value::Value;

/// Largest id handed out before wrapping back to 1.
pub const MAX_REQUEST_ID: u64 = u32::MAX as u64;

const INITIAL_SLOTS: usize = 16;

/// One in-flight request awaiting its response.
pub struct Pending {
    pub id: u64,
    /// Method name, kept for timeout diagnostics.
    pub method: String,
    pub deadline: Instant,
    /// The timeout that produced `deadline`, for error reporting.
    pub timeout: Duration,
    pub resolver: oneshot::Sender<Result<Value, Error>>,
    pub cancel: Option<CancelToken>,
}

/// Dense table of in-flight requests.
pub struct PendingTable {
    slots: Vec<Option<Pending>>,
    live: usize,
    next_id: u64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_SLOTS).map(|_| None).collect(),
            live: 0,
            next_id: 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    fn slot_of(&self, id: u64) -> usize {
        ((id - 1) as usize) & (self.slots.len() - 1)
    }

    fn bump_id(&mut self) {
        self.next_id = if self.next_id >= MAX_REQUEST_ID {
            1
        } else {
            self.next_id + 1
        };
    }

    /// Pick the next free id without inserting.
    ///
    /// Grows the ring when full so assignment always terminates.
    pub fn assign_id(&mut self) -> u64 {
        if self.live == self.slots.len() {
            self.grow();
        }
        loop {
            let id = self.next_id;
            let slot = self.slot_of(id);
            self.bump_id();
            if self.slots[slot].is_none() {
                return id;
            }
            // Live pending occupies this slot; shift forward.
        }
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let mut bigger: Vec<Option<Pending>> = (0..doubled).map(|_| None).collect();
        for entry in self.slots.drain(..).flatten() {
            let slot = ((entry.id - 1) as usize) & (doubled - 1);
            debug_assert!(bigger[slot].is_none());
            bigger[slot] = Some(entry);
        }
        self.slots = bigger;
    }

    /// Store a pending under its pre-assigned id.
    pub fn insert(&mut self, pending: Pending) {
        let slot = self.slot_of(pending.id);
        debug_assert!(self.slots[slot].is_none(), "id collision in pending table");
        self.slots[slot] = Some(pending);
        self.live += 1;
    }

    /// Remove the pending for `id`, if still in flight.
    pub fn remove(&mut self, id: u64) -> Option<Pending> {
        let slot = self.slot_of(id);
        match &self.slots[slot] {
            Some(entry) if entry.id == id => {
                self.live -= 1;
                self.slots[slot].take()
            }
            _ => None,
        }
    }

    /// Earliest deadline among live pendings.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(|entry| entry.deadline)
            .min()
    }

    /// Remove and return every pending whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Pending> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|entry| entry.deadline <= now) {
                self.live -= 1;
                expired.push(slot.take().expect("checked above"));
            }
        }
        expired
    }

    /// Remove and return every pending, for channel teardown.
    pub fn take_all(&mut self) -> Vec<Pending> {
        self.live = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Deadline helper: `now + timeout`, saturating.
#[must_use]
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: u64, deadline: Instant) -> (Pending, oneshot::Receiver<Result<Value, Error>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending {
                id,
                method: "m".to_string(),
                deadline,
                timeout: Duration::from_secs(1),
                resolver: tx,
                cancel: None,
            },
            rx,
        )
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut table = PendingTable::new();
        assert_eq!(table.assign_id(), 1);
        assert_eq!(table.assign_id(), 2);
        assert_eq!(table.assign_id(), 3);
    }

    #[test]
    fn insert_remove_round_trip() {
        let mut table = PendingTable::new();
        let far = Instant::now() + Duration::from_secs(60);

        let id = table.assign_id();
        let (entry, _rx) = pending(id, far);
        table.insert(entry);
        assert_eq!(table.len(), 1);

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn collision_shifts_forward() {
        let mut table = PendingTable::new();
        let far = Instant::now() + Duration::from_secs(60);

        // Occupy slot for id 1, then wind the counter around the ring so
        // the next assignment lands on the occupied slot.
        let (entry, _rx) = pending(1, far);
        table.next_id = 2;
        table.insert(entry);
        table.next_id = 1;

        let id = table.assign_id();
        assert_ne!(table.slot_of(id), table.slot_of(1));
    }

    #[test]
    fn wraps_after_max_id() {
        let mut table = PendingTable::new();
        table.next_id = MAX_REQUEST_ID;
        assert_eq!(table.assign_id(), MAX_REQUEST_ID);
        assert_eq!(table.assign_id(), 1);
    }

    #[test]
    fn grows_when_full() {
        let mut table = PendingTable::new();
        let far = Instant::now() + Duration::from_secs(60);
        let mut receivers = Vec::new();

        for _ in 0..100 {
            let id = table.assign_id();
            let (entry, rx) = pending(id, far);
            table.insert(entry);
            receivers.push(rx);
        }
        assert_eq!(table.len(), 100);
        for id in 1..=100 {
            assert!(table.remove(id).is_some(), "id {id} lost in growth");
        }
    }

    #[test]
    fn expiry_takes_only_overdue() {
        let mut table = PendingTable::new();
        let now = Instant::now();

        let id1 = table.assign_id();
        let (entry, _rx1) = pending(id1, now - Duration::from_millis(1));
        table.insert(entry);

        let id2 = table.assign_id();
        let (entry, _rx2) = pending(id2, now + Duration::from_secs(60));
        table.insert(entry);

        let expired = table.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn take_all_drains() {
        let mut table = PendingTable::new();
        let far = Instant::now() + Duration::from_secs(60);
        for _ in 0..5 {
            let id = table.assign_id();
            let (entry, rx) = pending(id, far);
            table.insert(entry);
            std::mem::forget(rx);
        }
        assert_eq!(table.take_all().len(), 5);
        assert!(table.is_empty());
    }
}
