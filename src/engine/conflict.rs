use chrono::FixedOffset;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Range check on a raw start, before any span arithmetic touches it.
pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > minutes(MAX_DURATION_MINUTES) {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

/// Window to hand `find_bookings` so that every booking able to collide with
/// `requested` is returned. The store filters on booking start, so look back
/// by the longest possible booking plus the buffer.
pub fn search_window(requested: &Span, buffer: Ms) -> Span {
    Span::new(
        requested.start - minutes(MAX_DURATION_MINUTES) - buffer,
        requested.end + buffer,
    )
}

/// The first scheduled booking whose occupied interval (end extended by
/// `buffer`) intersects `candidate` extended by the same buffer.
fn first_collision<'a>(
    candidate: &Span,
    bookings: &'a [BookingRecord],
    exclude: Option<Ulid>,
    buffer: Ms,
) -> Option<&'a BookingRecord> {
    let occupied = candidate.extend_end(buffer);
    bookings.iter().find(|b| {
        b.status == AppointmentStatus::Scheduled
            && Some(b.id) != exclude
            && b.span().extend_end(buffer).overlaps(&occupied)
    })
}

/// Pre-commit check: is `requested` free of every scheduled booking?
pub fn check_conflict(
    requested: &Span,
    bookings: &[BookingRecord],
    exclude: Option<Ulid>,
    buffer: Ms,
) -> Result<(), EngineError> {
    match first_collision(requested, bookings, exclude, buffer) {
        Some(b) => Err(EngineError::SchedulingConflict {
            requested: *requested,
            existing: b.id,
            conflicting: b.span(),
        }),
        None => Ok(()),
    }
}

/// Mark every slot that collides with a scheduled booking as unavailable,
/// with the colliding booking's local times as the reason.
pub fn annotate(
    mut slots: Vec<Slot>,
    bookings: &[BookingRecord],
    buffer: Ms,
    offset: FixedOffset,
) -> Vec<Slot> {
    for slot in &mut slots {
        let candidate = Span::new(slot.start, slot.end);
        match first_collision(&candidate, bookings, None, buffer) {
            Some(b) => {
                slot.available = false;
                slot.reason = Some(occupied_reason(&b.span(), offset));
            }
            None => {
                slot.available = true;
                slot.reason = None;
            }
        }
    }
    slots
}

fn occupied_reason(span: &Span, offset: FixedOffset) -> String {
    let clock = |t: Ms| {
        local_datetime(t, offset)
            .map(|dt| dt.format("%H:%M").to_string())
            .unwrap_or_else(|| t.to_string())
    };
    format!("booked {}-{}", clock(span.start), clock(span.end))
}
