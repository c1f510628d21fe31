//! Playback clock
//!
//! Simulated time advances with real elapsed time between frames. Until the
//! simulation end time is known playback tracks real time one to one, so it
//! stays close to the live stream; afterwards elapsed time is multiplied by
//! the timescale.

use shared::{PRIMARY_VARIABLE, Sample};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::history::{HistoryMiss, HistoryStore};
use crate::session::SharedSession;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub simulated_time: f64,
    pub end_time: Option<f64>,
    pub timescale: f64,
    /// When false, incoming bus updates are read and discarded.
    pub handshake_active: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            simulated_time: 0.0,
            end_time: None,
            timescale: 1.0,
            handshake_active: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    /// No frame seen since the last (re)start.
    Idle,
    Running,
    /// End time known and reached. Ticks keep coming.
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tick<'a> {
    /// First frame after a (re)start; the cursor was pinned to zero.
    Started,
    Pending { time: f64, miss: HistoryMiss },
    Ready { time: f64, sample: &'a Sample },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("timescale must be a positive finite number, got {0}")]
pub struct InvalidTimescale(pub f64);

#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    state: PlaybackState,
    previous_frame: Option<Instant>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PlaybackState {
        &mut self.state
    }

    pub fn phase(&self) -> ClockPhase {
        match (self.previous_frame, self.state.end_time) {
            (None, _) => ClockPhase::Idle,
            (Some(_), Some(end)) if self.state.simulated_time >= end => ClockPhase::Complete,
            (Some(_), _) => ClockPhase::Running,
        }
    }

    /// Advance to frame time `now` and resolve the primary sample to show.
    pub fn tick<'a>(&mut self, now: Instant, history: &'a HistoryStore) -> Tick<'a> {
        let Some(previous) = self.previous_frame.replace(now) else {
            self.state.simulated_time = 0.0;
            return Tick::Started;
        };

        let mut dt = now.saturating_duration_since(previous).as_secs_f64();
        if self.state.end_time.is_some() {
            dt *= self.state.timescale;
        }
        self.state.simulated_time += dt;

        let time = self.state.simulated_time;
        match history.latest_at_or_before(PRIMARY_VARIABLE, time) {
            Ok(sample) => Tick::Ready { time, sample },
            Err(miss) => Tick::Pending { time, miss },
        }
    }

    pub fn reset(&mut self) {
        self.state = PlaybackState::default();
        self.previous_frame = None;
    }

    /// Jump the cursor. The frame cadence is kept, so playback continues from `time`.
    pub fn seek(&mut self, time: f64) {
        self.state.simulated_time = time.max(0.0);
    }

    pub fn set_timescale(&mut self, timescale: f64) -> Result<(), InvalidTimescale> {
        if !timescale.is_finite() || timescale <= 0.0 {
            return Err(InvalidTimescale(timescale));
        }
        self.state.timescale = timescale;
        Ok(())
    }

    /// Record the simulation end time. Returns false if it was already known.
    pub fn finish(&mut self, end_time: f64) -> bool {
        if self.state.end_time.is_some() {
            return false;
        }
        self.state.end_time = Some(end_time);
        true
    }
}

/// Drive the session's clock at a fixed frame rate. Never returns.
pub async fn drive_frames(session: SharedSession, frame_interval: Duration) {
    let mut interval = tokio::time::interval(frame_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let now = interval.tick().await;
        session.lock().await.advance_frame(now);
    }
}

/// Drive the clock until a frame finds playback complete. Returns the time reached.
pub async fn drive_until_complete(session: SharedSession, frame_interval: Duration) -> f64 {
    let mut interval = tokio::time::interval(frame_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let now = interval.tick().await;
        let mut session = session.lock().await;
        session.advance_frame(now);
        if session.clock().phase() == ClockPhase::Complete {
            return session.playback().simulated_time;
        }
    }
}

pub fn frame_interval(frame_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(frame_rate.max(1)))
}
