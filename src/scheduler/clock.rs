//! Clock and trigger source.
//!
//! Turns the configured schedule into an endless sequence of
//! [`ClockEvent`]s. The source only looks forward from the moment it was
//! created: occurrences before that are never replayed, and one wake-up that
//! covers several occurrences (after a suspend, or a wall-clock jump)
//! delivers each kind at most once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use futures::Stream;
use tracing::{debug, trace};

use crate::pipeline::config::{PipelineConfig, ScheduleSlot};

/// Longest single sleep, so wall-clock changes are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Event produced by the trigger source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockEvent {
    Slot { tag: String },
    HealthCheck,
    DailyReset { date: NaiveDate },
}

impl ClockEvent {
    /// Delivery priority for events due at the same instant.
    fn priority(&self) -> u8 {
        match self {
            ClockEvent::DailyReset { .. } => 0,
            ClockEvent::Slot { .. } => 1,
            ClockEvent::HealthCheck => 2,
        }
    }
}

/// Source of local wall-clock time.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Wall clock that starts at a fixed local time and advances with tokio's
/// clock. Under a paused tokio runtime it follows virtual time, which makes
/// whole simulated days run instantly.
#[derive(Debug, Clone)]
pub struct SimulatedTimeSource {
    start: NaiveDateTime,
    origin: tokio::time::Instant,
}

impl SimulatedTimeSource {
    pub fn starting_at(start: NaiveDateTime) -> Self {
        Self {
            start,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for SimulatedTimeSource {
    fn now(&self) -> NaiveDateTime {
        let elapsed = self.origin.elapsed();
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
        self.start + elapsed
    }
}

/// Produces slot, health-check and daily-reset events from the schedule.
pub struct TriggerSource {
    slots: Vec<ScheduleSlot>,
    reset_time: NaiveTime,
    health_interval: chrono::Duration,
    time: Arc<dyn TimeSource>,
    cursor: NaiveDateTime,
    next_health: NaiveDateTime,
    pending: VecDeque<ClockEvent>,
}

impl TriggerSource {
    /// Creates a source whose cursor starts at the current time.
    pub fn new(config: &PipelineConfig, time: Arc<dyn TimeSource>) -> Self {
        let now = time.now();
        let health_interval = chrono::Duration::from_std(config.health_check_interval())
            .unwrap_or(chrono::Duration::seconds(300))
            .max(chrono::Duration::seconds(1));

        Self {
            slots: config.schedule_slots.clone(),
            reset_time: config.daily_reset_time,
            health_interval,
            time,
            cursor: now,
            next_health: now + health_interval,
            pending: VecDeque::new(),
        }
    }

    /// Waits for and returns the next event.
    pub async fn next_event(&mut self) -> ClockEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                debug!(?event, "Clock event");
                return event;
            }

            let now = self.time.now();
            let due = self.collect_due(now);
            if !due.is_empty() {
                self.pending.extend(due);
                continue;
            }

            let wait = (self.next_occurrence(now) - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP);
            trace!(wait_ms = wait.as_millis() as u64, "Clock sleeping");
            tokio::time::sleep(wait).await;
        }
    }

    /// The same sequence as [`next_event`](Self::next_event), as a stream.
    pub fn into_stream(mut self) -> impl Stream<Item = ClockEvent> + Send {
        async_stream::stream! {
            loop {
                yield self.next_event().await;
            }
        }
    }

    /// Events due in `(cursor, now]`, in delivery order. Advances the cursor.
    ///
    /// Each slot tag, the reset and the health check appear at most once.
    pub fn collect_due(&mut self, now: NaiveDateTime) -> Vec<ClockEvent> {
        let from = self.cursor;
        if now <= from {
            // Clock went backwards; wait for it to pass the cursor again.
            return Vec::new();
        }

        // (occurrence, priority, configuration order, event)
        let mut due: Vec<(NaiveDateTime, u8, usize, ClockEvent)> = Vec::new();

        if let Some(at) = latest_occurrence(self.reset_time, from, now) {
            let event = ClockEvent::DailyReset { date: at.date() };
            due.push((at, event.priority(), 0, event));
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(at) = latest_occurrence(slot.time, from, now) else {
                continue;
            };
            match due.iter_mut().find(
                |(_, _, _, event)| matches!(event, ClockEvent::Slot { tag } if *tag == slot.tag),
            ) {
                Some(existing) if existing.0 < at => {
                    existing.0 = at;
                    existing.2 = index;
                }
                Some(_) => {}
                None => {
                    let event = ClockEvent::Slot {
                        tag: slot.tag.clone(),
                    };
                    due.push((at, event.priority(), index, event));
                }
            }
        }

        if self.next_health <= now {
            let mut at = self.next_health;
            while self.next_health <= now {
                at = self.next_health;
                self.next_health += self.health_interval;
            }
            due.push((at, ClockEvent::HealthCheck.priority(), 0, ClockEvent::HealthCheck));
        }

        self.cursor = now;
        due.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        due.into_iter().map(|(_, _, _, event)| event).collect()
    }

    /// Earliest scheduled instant strictly after `now`.
    fn next_occurrence(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.slots
            .iter()
            .map(|slot| slot.time)
            .chain(std::iter::once(self.reset_time))
            .map(|time| next_after(time, now))
            .chain(std::iter::once(self.next_health))
            .min()
            .unwrap_or(self.next_health)
    }
}

/// Most recent occurrence of `time` in `(from, to]`, if any.
fn latest_occurrence(
    time: NaiveTime,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let mut candidate = to.date().and_time(time);
    if candidate > to {
        candidate -= chrono::Duration::days(1);
    }
    (candidate > from).then_some(candidate)
}

/// First occurrence of `time` strictly after `now`.
fn next_after(time: NaiveTime, now: NaiveDateTime) -> NaiveDateTime {
    let candidate = now.date().and_time(time);
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}
