//! Standard memory orderings for node and pool access.
//!
//! These constants keep ordering usage consistent across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for sampling a state word during optimistic traversal.
/// Pairs with the writer's Release publish.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing a new state word or pointer cell under latch.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for latch CAS success.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for latch CAS failure.
/// Only needs to observe the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads inside a latched region.
/// Safe because the latch provides synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;
