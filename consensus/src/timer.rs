// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::Instant;

/// The per-instance view-change timer. Armed when a replica enters a view
/// or votes and expects a response; reset on valid progress; disarmed when
/// the instance has nothing in flight.
pub struct ViewTimer {
    duration: Duration,
    deadline: Instant,
    armed: bool,
}

impl ViewTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: Instant::now(),
            armed: false,
        }
    }

    pub fn arm(&mut self) {
        self.deadline = Instant::now() + self.duration;
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The instant the select loop sleeps until. Only meaningful while
    /// armed; the loop guards on `is_armed`.
    pub fn deadline(&self) -> Instant {
        if self.armed {
            self.deadline
        } else {
            // Far enough that an unarmed timer never wakes the loop.
            Instant::now() + Duration::from_secs(3600)
        }
    }
}
