use std::time::{Duration, Instant};

use crate::FrameNumber;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaceDecision {
    Wait,
    Request(FrameNumber),
    /// The previous request stalled: drop partial slots, then request.
    RecoverAndRequest(FrameNumber),
}

/// Drop-to-latest frame selection.
///
/// Only ever requests the newest produced frame. A new request goes out once
/// the previous one was answered and nothing is half-joined, or once the
/// previous one has been pending longer than the stall timeout.
#[derive(Debug)]
pub struct Pacer {
    stall_timeout: Duration,
    last_requested: Option<FrameNumber>,
    requested_at: Option<Instant>,
    answered: bool,
}

impl Pacer {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            stall_timeout,
            last_requested: None,
            requested_at: None,
            answered: false,
        }
    }

    pub fn set_stall_timeout(&mut self, stall_timeout: Duration) {
        self.stall_timeout = stall_timeout;
    }

    pub fn last_requested(&self) -> Option<FrameNumber> {
        self.last_requested
    }

    pub fn decide(&self, latest: Option<FrameNumber>, has_partial: bool, now: Instant) -> PaceDecision {
        let Some(latest) = latest else {
            return PaceDecision::Wait;
        };
        let Some(last) = self.last_requested else {
            return PaceDecision::Request(latest);
        };
        if latest <= last {
            return PaceDecision::Wait;
        }
        if self.answered && !has_partial {
            return PaceDecision::Request(latest);
        }
        let stalled = self
            .requested_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.stall_timeout);
        if stalled {
            PaceDecision::RecoverAndRequest(latest)
        } else {
            PaceDecision::Wait
        }
    }

    pub fn mark_requested(&mut self, frame_number: FrameNumber, now: Instant) {
        self.last_requested = Some(frame_number);
        self.requested_at = Some(now);
        self.answered = false;
    }

    pub fn mark_answered(&mut self, frame_number: FrameNumber) {
        if self.last_requested == Some(frame_number) {
            self.answered = true;
        }
    }
}
