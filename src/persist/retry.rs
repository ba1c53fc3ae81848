//! Bounded per-sink retry queue with drop-oldest overflow semantics.

// std
use std::collections::VecDeque;
// self
use crate::{_prelude::*, fetch::message::StoreMessage};

fn batch_point_count(batch: &[StoreMessage]) -> u64 {
	batch.iter().map(|msg| msg.point_count() as u64).sum()
}

/// A sink's pending-retry state: the queue itself plus the bookkeeping needed
/// to drive the drain cadence.
pub struct RetryQueue {
	items: VecDeque<Vec<StoreMessage>>,
	max_items: usize,
	last_try: Option<Instant>,
	in_error: bool,
	last_drop_warn: Option<Instant>,
}
impl RetryQueue {
	/// Build an empty queue bounded at `max_items` batches.
	pub fn new(max_items: usize) -> Self {
		Self {
			items: VecDeque::new(),
			max_items,
			last_try: None,
			in_error: false,
			last_drop_warn: None,
		}
	}

	/// Whether the queue currently holds anything.
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// Number of queued batches.
	pub fn len(&self) -> usize {
		self.items.len()
	}

	/// Push `batch` to the front (newest), evicting from the back (oldest)
	/// until the queue is back within `max_items`. Returns the number of
	/// points dropped, if any.
	pub fn push_front(&mut self, batch: Vec<StoreMessage>) -> u64 {
		self.items.push_front(batch);

		let mut dropped_points = 0u64;

		while self.items.len() > self.max_items {
			if let Some(evicted) = self.items.pop_back() {
				dropped_points += batch_point_count(&evicted);
			}
		}

		dropped_points
	}

	/// Pop the oldest batch for a drain attempt.
	pub fn pop_back(&mut self) -> Option<Vec<StoreMessage>> {
		self.items.pop_back()
	}

	/// Put a drained-but-failed batch back at the back (it was the oldest).
	pub fn requeue_back(&mut self, batch: Vec<StoreMessage>) {
		self.items.push_back(batch);
	}

	/// Mark a failed direct-write or drain attempt.
	pub fn mark_in_error(&mut self, now: Instant) {
		self.in_error = true;
		self.last_try = Some(now);
	}

	/// Mark a successful drain pass, clearing the error flag.
	pub fn mark_ok(&mut self) {
		self.in_error = false;
	}

	/// Whether this queue is eligible for a drain attempt right now: not in
	/// error, or its last attempt was more than 10s ago.
	pub fn eligible_for_drain(&self, now: Instant) -> bool {
		!self.in_error
			|| self.last_try.is_none_or(|last| now.duration_since(last) >= Duration::from_secs(10))
	}

	/// Whether a drop-warning log should fire now, rate-limited to once per 10s.
	pub fn should_warn_drop(&mut self, now: Instant) -> bool {
		match self.last_drop_warn {
			Some(last) if now.duration_since(last) < Duration::from_secs(10) => false,
			_ => {
				self.last_drop_warn = Some(now);

				true
			},
		}
	}
}
