use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta};

use crate::config::BusinessHours;
use crate::model::*;

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Open windows of `date` as absolute spans: opening hours minus breaks.
/// Empty on closed weekdays or when the day has no length.
pub fn open_windows(date: NaiveDate, hours: &BusinessHours) -> Vec<Span> {
    if hours.open >= hours.close || hours.closed_weekdays.contains(&date.weekday()) {
        return Vec::new();
    }
    let offset = hours.offset();
    let day = Span::new(
        instant(date, hours.open, offset),
        instant(date, hours.close, offset),
    );
    let mut breaks: Vec<Span> = hours
        .breaks
        .iter()
        .filter(|b| b.start < b.end)
        .map(|b| Span::new(instant(date, b.start, offset), instant(date, b.end, offset)))
        .collect();
    breaks.sort_by_key(|s| s.start);
    subtract_intervals(&[day], &merge_overlapping(&breaks))
}

/// Lazy, restartable grid of candidate slots for one day.
///
/// Candidates sit on `open + k * step`. One is yielded when it fits entirely
/// inside an open window and does not start before `now`. A clone iterates
/// independently from the position it was cloned at.
#[derive(Debug, Clone)]
pub struct SlotGrid {
    windows: Vec<Span>,
    window: usize,
    cursor: Ms,
    day_start: Ms,
    step: Ms,
    duration: Ms,
    now: Ms,
    open: NaiveTime,
}

impl SlotGrid {
    pub fn new(
        date: NaiveDate,
        duration_minutes: u32,
        hours: &BusinessHours,
        step_minutes: u32,
        now: Ms,
    ) -> Self {
        let offset: FixedOffset = hours.offset();
        let day_start = instant(date, hours.open, offset);
        let duration = minutes(duration_minutes);
        let day_len = instant(date, hours.close, offset) - day_start;

        let windows = if step_minutes == 0 || duration_minutes == 0 || duration >= day_len {
            Vec::new()
        } else {
            open_windows(date, hours)
        };

        Self {
            windows,
            window: 0,
            cursor: day_start,
            day_start,
            step: minutes(step_minutes),
            duration,
            now,
            open: hours.open,
        }
    }

    fn slot_at(&self, start: Ms) -> Slot {
        Slot {
            start,
            end: start + self.duration,
            time: self.open + TimeDelta::milliseconds(start - self.day_start),
            available: true,
            reason: None,
        }
    }
}

impl Iterator for SlotGrid {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        while let Some(window) = self.windows.get(self.window).copied() {
            let start = self.cursor;
            if start + self.duration > window.end {
                self.window += 1;
                continue;
            }
            self.cursor += self.step;
            if start < window.start || start < self.now {
                continue;
            }
            return Some(self.slot_at(start));
        }
        None
    }
}

/// The full grid, ordered by start.
pub fn generate_slots(
    date: NaiveDate,
    duration_minutes: u32,
    hours: &BusinessHours,
    step_minutes: u32,
    now: Ms,
) -> Vec<Slot> {
    SlotGrid::new(date, duration_minutes, hours, step_minutes, now).collect()
}
