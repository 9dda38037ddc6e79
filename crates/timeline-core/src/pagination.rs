use tracing::{debug, warn};

use crate::{
    error::{PaginationError, TransportError},
    types::{Direction, PaginationState, PaginationStatus, TimelineFocus},
};

/// Hard upper bound for a single pagination request.
pub const MAX_PAGINATE_LIMIT: u16 = 100;

/// Clamp a requested pagination limit against safety and server caps.
///
/// The result is always in `1..=100`.
pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = server_cap.max(1);
    safe_requested.min(safe_cap).min(MAX_PAGINATE_LIMIT)
}

/// What the caller should do after asking to paginate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationStart {
    /// A transport request must be issued from `cursor`.
    Started { cursor: Option<String> },
    /// A request for this direction is already in flight; wait for it.
    Coalesced,
    /// Nothing more to load in this direction.
    Exhausted,
}

#[derive(Debug)]
struct DirectionTracker<W> {
    status: PaginationStatus,
    cursor: Option<String>,
    waiters: Vec<W>,
}

impl<W> DirectionTracker<W> {
    fn new(status: PaginationStatus, cursor: Option<String>) -> Self {
        Self {
            status,
            cursor,
            waiters: Vec::new(),
        }
    }
}

/// Per-direction pagination state machine with request coalescing.
///
/// `W` is whatever the caller parks while a request is in flight (typically a
/// response channel); at most one request per direction is outstanding.
#[derive(Debug)]
pub struct PaginationController<W> {
    backward: DirectionTracker<W>,
    forward: DirectionTracker<W>,
}

impl<W> PaginationController<W> {
    pub fn new(focus: &TimelineFocus) -> Self {
        match focus {
            TimelineFocus::Live => Self {
                backward: DirectionTracker::new(PaginationStatus::Idle, None),
                forward: DirectionTracker::new(PaginationStatus::Exhausted, None),
            },
            TimelineFocus::Cursor(cursor) => Self {
                backward: DirectionTracker::new(PaginationStatus::Idle, Some(cursor.clone())),
                forward: DirectionTracker::new(PaginationStatus::Idle, Some(cursor.clone())),
            },
        }
    }

    pub fn state(&self) -> PaginationState {
        PaginationState {
            backward: self.backward.status.clone(),
            forward: self.forward.status.clone(),
        }
    }

    pub fn status(&self, direction: Direction) -> &PaginationStatus {
        &self.tracker(direction).status
    }

    /// Request a page. `Idle` and `Failed` enter `Loading`; `Loading` coalesces.
    pub fn begin(&mut self, direction: Direction) -> PaginationStart {
        let tracker = self.tracker_mut(direction);
        match tracker.status {
            PaginationStatus::Loading => PaginationStart::Coalesced,
            PaginationStatus::Exhausted => PaginationStart::Exhausted,
            PaginationStatus::Idle | PaginationStatus::Failed { .. } => {
                tracker.status = PaginationStatus::Loading;
                debug!(?direction, cursor = ?tracker.cursor, "pagination started");
                PaginationStart::Started {
                    cursor: tracker.cursor.clone(),
                }
            }
        }
    }

    /// Park a waiter until the in-flight request for `direction` resolves.
    pub fn park(&mut self, direction: Direction, waiter: W) {
        self.tracker_mut(direction).waiters.push(waiter);
    }

    /// Finish the in-flight request successfully.
    ///
    /// `next_cursor == None` means the server has nothing more in this direction.
    pub fn complete(
        &mut self,
        direction: Direction,
        next_cursor: Option<String>,
    ) -> Result<Vec<W>, PaginationError> {
        let tracker = self.loading_tracker(direction)?;
        tracker.status = match next_cursor {
            Some(_) => PaginationStatus::Idle,
            None => PaginationStatus::Exhausted,
        };
        tracker.cursor = next_cursor;
        Ok(std::mem::take(&mut tracker.waiters))
    }

    /// Finish the in-flight request with a transport failure; the cursor is kept for retry.
    pub fn fail(
        &mut self,
        direction: Direction,
        error: TransportError,
    ) -> Result<Vec<W>, PaginationError> {
        let tracker = self.loading_tracker(direction)?;
        tracker.status = PaginationStatus::Failed { error };
        Ok(std::mem::take(&mut tracker.waiters))
    }

    /// Drop all parked waiters, e.g. on teardown.
    pub fn abandon(&mut self) -> Vec<W> {
        let mut waiters = std::mem::take(&mut self.backward.waiters);
        waiters.append(&mut self.forward.waiters);
        waiters
    }

    fn loading_tracker(
        &mut self,
        direction: Direction,
    ) -> Result<&mut DirectionTracker<W>, PaginationError> {
        let tracker = self.tracker_mut(direction);
        if tracker.status != PaginationStatus::Loading {
            warn!(?direction, status = ?tracker.status, "pagination result without request");
            return Err(PaginationError::InvalidTransition {
                direction,
                status: tracker.status.clone(),
            });
        }
        Ok(tracker)
    }

    fn tracker(&self, direction: Direction) -> &DirectionTracker<W> {
        match direction {
            Direction::Backward => &self.backward,
            Direction::Forward => &self.forward,
        }
    }

    fn tracker_mut(&mut self, direction: Direction) -> &mut DirectionTracker<W> {
        match direction {
            Direction::Backward => &mut self.backward,
            Direction::Forward => &mut self.forward,
        }
    }
}
