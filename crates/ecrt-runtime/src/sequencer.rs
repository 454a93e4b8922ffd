//! Time-triggered multi-track event sequencer.
//!
//! A sequence holds independent tracks of events sorted by time, each with
//! a cursor and a dispatch handler. Running the sequence merges the tracks
//! by time and calls each handler when sequence time reaches its event.
//!
//! Sequence time is mapped onto the clock through `T0 = now - seq_time`,
//! captured when a run starts:
//!
//! ```text
//! seq   0         e1        e2                        e3
//!       |    '    |         |                         |
//!       +----'----+---------+-------------------------+--> t
//!            '
//!   T0 ----->| now          |<------- remaining ----->|
//!                           |  sleep  |<- wake_latency->|  spin  |
//! ```
//!
//! While the next event is more than `wake_latency + scheduler_uncertainty`
//! away, the sequencer sleeps to an absolute deadline `wake_latency` before
//! the event; inside that margin it spins on the clock until the event is
//! due. Ties across tracks go to the lowest track index.

use crate::clock::Clock;
use ecrt_common::config::SequencerConfig;
use ecrt_common::error::{RtError, RtResult};
use ecrt_common::time::Timestamp;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A timed event carrying an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    /// Time of the event relative to the sequence origin.
    pub time: Timestamp,
    /// Application data handed to the track handler.
    pub payload: T,
}

impl<T> Event<T> {
    /// Create an event at `time`.
    pub fn new(time: Timestamp, payload: T) -> Self {
        Self { time, payload }
    }
}

/// Track handler, called with the track index and the due event.
pub type Handler<T> = Box<dyn FnMut(usize, &Event<T>) + Send>;

/// An ordered timeline of events with a cursor and a handler.
pub struct Track<T> {
    name: String,
    events: Vec<Event<T>>,
    cursor: usize,
    handler: Handler<T>,
}

impl<T> Track<T> {
    /// Create a track; events are sorted by time, keeping the given order
    /// among equal times.
    pub fn new<F>(name: impl Into<String>, mut events: Vec<Event<T>>, handler: F) -> Self
    where
        F: FnMut(usize, &Event<T>) + Send + 'static,
    {
        events.sort_by_key(|event| event.time);
        Self {
            name: name.into(),
            events,
            cursor: 0,
            handler: Box::new(handler),
        }
    }

    /// Track name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Events in time order.
    #[must_use]
    pub fn events(&self) -> &[Event<T>] {
        &self.events
    }

    /// Index of the next event to dispatch.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the track has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true once every event has been dispatched.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.events.len()
    }

    /// Event under the cursor.
    #[must_use]
    pub fn current(&self) -> Option<&Event<T>> {
        self.events.get(self.cursor)
    }

    /// Time of the final event.
    #[must_use]
    pub fn last_time(&self) -> Option<Timestamp> {
        self.events.last().map(|event| event.time)
    }

    fn dispatch(&mut self, index: usize) {
        if let Some(event) = self.events.get(self.cursor) {
            (self.handler)(index, event);
            self.cursor += 1;
        }
    }
}

impl<T> fmt::Debug for Track<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name)
            .field("events", &self.events.len())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Index of the event nearest to `key` in a time-sorted slice.
///
/// The split point is the midpoint between the two neighbouring events, so
/// it scales with their spacing rather than being a fixed half-second
/// window. A key exactly halfway selects the earlier event. Keys before the
/// first or after the last event select that event. Returns `None` only for
/// an empty slice.
#[must_use]
pub fn nearest_index<T>(events: &[Event<T>], key: Timestamp) -> Option<usize> {
    let last = events.len().checked_sub(1)?;
    let after = events.partition_point(|event| event.time < key);
    if after == 0 {
        return Some(0);
    }
    if after > last {
        return Some(last);
    }
    let before = after - 1;
    let to_before = key.diff_ns(events[before].time);
    let to_after = events[after].time.diff_ns(key);
    Some(if to_after < to_before { after } else { before })
}

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every track has dispatched all of its events.
    Exhausted,
    /// The next event lies after the requested stop time.
    StopTimeReached,
    /// The stop flag was set.
    Stopped,
}

/// Dispatch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequencerStats {
    /// Events dispatched.
    pub dispatched: u64,
    /// Events dispatched later than the scheduler uncertainty margin.
    pub late_dispatches: u64,
    /// Largest observed dispatch lateness in nanoseconds.
    pub max_lateness_ns: u64,
    /// Sleeps taken while waiting for events.
    pub sleeps: u64,
    /// Busy-wait iterations.
    pub spin_iterations: u64,
}

/// Multi-track event sequencer.
pub struct Sequencer<T, C: Clock> {
    clock: C,
    tracks: Vec<Track<T>>,
    seq_time: Timestamp,
    wake_latency_ns: u64,
    uncertainty_ns: u64,
    stop: Arc<AtomicBool>,
    stats: SequencerStats,
}

impl<T, C: Clock> Sequencer<T, C> {
    /// Create an empty sequencer.
    pub fn new(clock: C, config: &SequencerConfig) -> Self {
        let as_ns = |d: std::time::Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self {
            clock,
            tracks: Vec::new(),
            seq_time: Timestamp::ZERO,
            wake_latency_ns: as_ns(config.wake_latency),
            uncertainty_ns: as_ns(config.scheduler_uncertainty),
            stop: Arc::new(AtomicBool::new(false)),
            stats: SequencerStats::default(),
        }
    }

    /// Append a track and return its index.
    pub fn add_track(&mut self, track: Track<T>) -> usize {
        self.tracks.push(track);
        self.tracks.len() - 1
    }

    /// Builder form of [`add_track`](Self::add_track).
    #[must_use]
    pub fn with_track(mut self, track: Track<T>) -> Self {
        self.add_track(track);
        self
    }

    /// All tracks.
    pub fn tracks(&self) -> &[Track<T>] {
        &self.tracks
    }

    /// A single track.
    pub fn track(&self, index: usize) -> Option<&Track<T>> {
        self.tracks.get(index)
    }

    /// Current sequence time.
    pub fn time(&self) -> Timestamp {
        self.seq_time
    }

    /// Dispatch statistics since creation or the last reset.
    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    /// Shared flag that ends a run at its next check when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Returns true once every track has dispatched all of its events.
    pub fn is_finished(&self) -> bool {
        self.tracks.iter().all(Track::is_finished)
    }

    /// The earliest pending event across all tracks.
    ///
    /// Ties go to the lowest track index. Returns `None` when every cursor
    /// has reached the end of its track.
    pub fn next_due_event(&self) -> Option<(usize, &Event<T>)> {
        let mut next: Option<(usize, &Event<T>)> = None;
        for (index, track) in self.tracks.iter().enumerate() {
            if let Some(event) = track.current() {
                match next {
                    Some((_, best)) if best.time <= event.time => {}
                    _ => next = Some((index, event)),
                }
            }
        }
        next
    }

    /// Time of the final event across all tracks.
    pub fn end_time(&self) -> Option<Timestamp> {
        self.tracks.iter().filter_map(Track::last_time).max()
    }

    /// Dispatch the next pending event immediately, regardless of the clock,
    /// and move sequence time to it.
    ///
    /// Returns the track index and event time, or `None` when finished.
    pub fn step(&mut self) -> Option<(usize, Timestamp)> {
        let (index, time) = self
            .next_due_event()
            .map(|(index, event)| (index, event.time))?;
        self.seq_time = self.seq_time.max(time);
        self.tracks[index].dispatch(index);
        self.stats.dispatched += 1;
        Some((index, time))
    }

    /// Dispatch events in time order until the next one lies after
    /// `stop_time`, none remain, or the stop flag is set.
    ///
    /// Events already due are dispatched immediately. Lateness is recorded
    /// in [`SequencerStats`] and never skips or reorders events.
    pub fn run_until(&mut self, stop_time: Timestamp) -> RunOutcome {
        // Clock minus sequence time; negative when sequence time is ahead.
        let offset_ns = signed_nanos(self.clock.now()) - signed_nanos(self.seq_time);
        debug!(start = %self.seq_time, stop = %stop_time, "Sequence run started");

        let outcome = loop {
            if self.stop.load(Ordering::Relaxed) {
                break RunOutcome::Stopped;
            }

            let Some((index, event_time)) = self
                .next_due_event()
                .map(|(index, event)| (index, event.time))
            else {
                break RunOutcome::Exhausted;
            };
            if event_time > stop_time {
                break RunOutcome::StopTimeReached;
            }

            let dt = self.seq_time.diff_ns(event_time);
            if let Ok(lateness_ns) = u64::try_from(dt) {
                self.record_lateness(lateness_ns);
                trace!(track = index, time = %event_time, lateness_ns, "Dispatching event");
                self.tracks[index].dispatch(index);
                self.stats.dispatched += 1;
                continue;
            }

            let remaining_ns = dt.unsigned_abs();
            if remaining_ns > self.wake_latency_ns.saturating_add(self.uncertainty_ns) {
                let wake_ns = i64::try_from(self.wake_latency_ns).unwrap_or(i64::MAX);
                let deadline = signed_nanos(event_time)
                    .saturating_add(offset_ns)
                    .saturating_sub(wake_ns);
                self.clock.sleep_until(timestamp_at(deadline));
                self.stats.sleeps += 1;
            } else {
                self.clock.spin_hint();
                self.stats.spin_iterations += 1;
            }

            self.seq_time = timestamp_at(signed_nanos(self.clock.now()).saturating_sub(offset_ns));
        };

        debug!(?outcome, time = %self.seq_time, dispatched = self.stats.dispatched, "Sequence run ended");
        outcome
    }

    /// Run to the final event across all tracks.
    ///
    /// # Errors
    ///
    /// [`RtError::SequenceEmpty`] if no track has any event.
    pub fn run(&mut self) -> RtResult<RunOutcome> {
        let end = self.end_time().ok_or(RtError::SequenceEmpty)?;
        Ok(self.run_until(end))
    }

    /// The event of `track` nearest to `key`; see [`nearest_index`].
    pub fn seek(&self, track: usize, key: Timestamp) -> Option<&Event<T>> {
        let events = self.tracks.get(track)?.events();
        nearest_index(events, key).map(|index| &events[index])
    }

    /// Index form of [`seek`](Self::seek).
    pub fn seek_index(&self, track: usize, key: Timestamp) -> Option<usize> {
        nearest_index(self.tracks.get(track)?.events(), key)
    }

    /// Move every cursor to `index`, clamped to the track's last event.
    ///
    /// Empty tracks stay at zero. Sequence time is left unchanged.
    pub fn set_index(&mut self, index: usize) {
        for track in &mut self.tracks {
            track.cursor = index.min(track.events.len().saturating_sub(1));
        }
    }

    /// Set sequence time to `time` and move every cursor to its first event
    /// at or after `time`.
    pub fn set_time(&mut self, time: Timestamp) {
        for track in &mut self.tracks {
            track.cursor = track.events.partition_point(|event| event.time < time);
        }
        self.seq_time = time;
    }

    /// Rewind cursors and time to zero, clear the stop flag and statistics.
    pub fn reset(&mut self) {
        for track in &mut self.tracks {
            track.cursor = 0;
        }
        self.seq_time = Timestamp::ZERO;
        self.stop.store(false, Ordering::Relaxed);
        self.stats = SequencerStats::default();
    }

    fn record_lateness(&mut self, lateness_ns: u64) {
        self.stats.max_lateness_ns = self.stats.max_lateness_ns.max(lateness_ns);
        if lateness_ns > self.uncertainty_ns {
            self.stats.late_dispatches += 1;
            trace!(lateness_ns, "Late dispatch");
        }
    }
}

fn signed_nanos(t: Timestamp) -> i64 {
    // u32 seconds always fit.
    i64::try_from(t.as_nanos()).unwrap_or(i64::MAX)
}

fn timestamp_at(ns: i64) -> Timestamp {
    u64::try_from(ns).map_or(Timestamp::ZERO, Timestamp::from_nanos)
}

impl<T, C: Clock> fmt::Debug for Sequencer<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("tracks", &self.tracks)
            .field("time", &self.seq_time)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
