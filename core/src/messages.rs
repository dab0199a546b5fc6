//! Input events for the event-driven filter loop.
//!
//! The filter consumes two kinds of messages: odometry ticks, which drive the predict/update cycle, and
//! multibeam scans, which are only stored and picked up by the next odometry tick. [`EventStream`] holds a
//! time-ordered sequence of both, either recorded or produced by [`crate::sim`], and can be replayed through
//! [`crate::controller::FilterController::handle`] or sent over a channel to a running filter thread.
use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};

use crate::{Odometry, SonarScan};

/// A single message delivered to the filter.
///
/// ## Example
///
/// ```rust
/// use auvpf::messages::Event;
/// use auvpf::{Odometry, SonarScan};
///
/// let tick = Event::Odometry(Odometry { stamp: 1.5, ..Odometry::default() });
/// let ping = Event::Sonar(SonarScan::new(1.2, Vec::new()));
/// assert!(ping.stamp() < tick.stamp());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Dead-reckoning tick; triggers a filter cycle.
    Odometry(Odometry),
    /// Multibeam ping in the map frame; stored until the next tick.
    Sonar(SonarScan),
}
impl Event {
    /// Message time in seconds.
    pub fn stamp(&self) -> f64 {
        match self {
            Event::Odometry(odom) => odom.stamp,
            Event::Sonar(scan) => scan.stamp,
        }
    }
    pub fn is_odometry(&self) -> bool {
        matches!(self, Event::Odometry(_))
    }
    // Scans sort ahead of odometry at equal stamps so the tick sees them.
    fn rank(&self) -> u8 {
        match self {
            Event::Sonar(_) => 0,
            Event::Odometry(_) => 1,
        }
    }
}

/// Time-ordered events with the wall-clock time that stamp zero corresponds to.
#[derive(Clone, Debug)]
pub struct EventStream {
    pub start_time: DateTime<Utc>,
    pub events: Vec<Event>,
}
impl EventStream {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        EventStream {
            start_time,
            events: Vec::new(),
        }
    }
    pub fn len(&self) -> usize {
        self.events.len()
    }
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
    pub fn odometry_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_odometry()).count()
    }
    pub fn scan_count(&self) -> usize {
        self.events.len() - self.odometry_count()
    }
    /// Add an event, keeping the stream ordered by stamp.
    pub fn push(&mut self, event: Event) {
        let position = self
            .events
            .partition_point(|e| compare_events(e, &event) != Ordering::Greater);
        self.events.insert(position, event);
    }
    /// Wall-clock time of a stamp relative to `start_time`.
    pub fn timestamp(&self, stamp: f64) -> DateTime<Utc> {
        self.start_time + Duration::microseconds((stamp * 1e6).round() as i64)
    }
    /// Time span covered by the stream in seconds.
    pub fn duration(&self) -> f64 {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.stamp() - first.stamp(),
            _ => 0.0,
        }
    }
}
impl IntoIterator for EventStream {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;
    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

fn compare_events(a: &Event, b: &Event) -> Ordering {
    a.stamp()
        .total_cmp(&b.stamp())
        .then_with(|| a.rank().cmp(&b.rank()))
}

/// Merge odometry and sonar messages into a single stream ordered by stamp.
///
/// The sort is stable: messages with the same stamp and kind keep their input order, and a scan stamped at
/// the same time as an odometry tick is delivered first.
pub fn build_event_stream(
    odometry: Vec<Odometry>,
    scans: Vec<SonarScan>,
    start_time: DateTime<Utc>,
) -> EventStream {
    let mut events: Vec<Event> = odometry
        .into_iter()
        .map(Event::Odometry)
        .chain(scans.into_iter().map(Event::Sonar))
        .collect();
    events.sort_by(compare_events);
    EventStream { start_time, events }
}
