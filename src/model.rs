use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn minutes(m: u32) -> Ms {
    Ms::from(m) * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_minutes(start: Ms, duration_minutes: u32) -> Self {
        Self::new(start, start + minutes(duration_minutes))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Extend the end by `extra` ms (buffer after an appointment).
    pub fn extend_end(&self, extra: Ms) -> Self {
        Self::new(self.start, self.end + extra)
    }
}

// ── Money ────────────────────────────────────────────────────────

/// Monetary amount in cents. Two-place decimal at every boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount: {0:?}")]
pub struct ParseMoneyError(pub String);

impl FromStr for Money {
    type Err = ParseMoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMoneyError(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || frac.len() > 2 {
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let whole: i64 = whole.parse().map_err(|_| err())?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| err())? * 10,
            _ => frac.parse().map_err(|_| err())?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(err)?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ── Appointment ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown appointment status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for AppointmentStatus {
    type Err = ParseStatusError;

    /// Accepts the English names plus the Portuguese ones used by salon staff.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" | "agendado" => Ok(AppointmentStatus::Scheduled),
            "completed" | "concluido" | "concluído" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" | "cancelado" => Ok(AppointmentStatus::Cancelled),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Which booking list an appointment occupies. Appointments without a
/// professional share one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKey {
    Unassigned,
    Professional(Ulid),
}

impl From<Option<Ulid>> for ResourceKey {
    fn from(professional_id: Option<Ulid>) -> Self {
        match professional_id {
            Some(id) => ResourceKey::Professional(id),
            None => ResourceKey::Unassigned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub service: String,
    pub price: Money,
    pub notes: String,
    pub status: AppointmentStatus,
    pub professional_id: Option<Ulid>,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }

    pub fn resource(&self) -> ResourceKey {
        ResourceKey::from(self.professional_id)
    }

    pub fn booking(&self) -> BookingRecord {
        BookingRecord {
            id: self.id,
            start: self.start,
            duration_minutes: self.duration_minutes,
            status: self.status,
        }
    }
}

/// What the bookings query hands back: just enough to run the overlap test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
}

impl BookingRecord {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(AppointmentStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: AppointmentStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(s) => *s == status,
        }
    }
}

// ── Catalog, clients, ledger ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub price: Money,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Bronze,
    Prata,
    Ouro,
    Diamante,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Bronze => "Bronze",
            Tier::Prata => "Prata",
            Tier::Ouro => "Ouro",
            Tier::Diamante => "Diamante",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub points: u64,
    pub tier: Tier,
    /// 1..=5 stars, if the salon rated the client.
    pub rating: Option<u8>,
}

impl Client {
    pub fn new(id: Ulid, name: String, rating: Option<u8>) -> Self {
        Self {
            id,
            name,
            points: 0,
            tier: Tier::Bronze,
            rating,
        }
    }
}

/// Revenue record written when an appointment completes. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialTransaction {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub client_id: Ulid,
    pub amount: Money,
    pub date: Ms,
    pub description: String,
}

/// A candidate bookable time. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    /// Wall-clock start in the business's offset.
    pub time: NaiveTime,
    pub available: bool,
    pub reason: Option<String>,
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted(Service),
    ClientUpserted(Client),
    AppointmentInserted(Appointment),
    AppointmentUpdated(Appointment),
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentDeleted {
        id: Ulid,
    },
    TransactionRecorded(FinancialTransaction),
    LoyaltyUpdated {
        client_id: Ulid,
        points: u64,
        tier: Tier,
    },
}

// ── Calendar conversion ──────────────────────────────────────────

/// Absolute instant of a wall-clock time on `date` at `offset`.
pub fn instant(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Ms {
    let local = date.and_time(time).and_utc().timestamp_millis();
    local - Ms::from(offset.local_minus_utc()) * 1000
}

pub fn local_datetime(t: Ms, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&offset))
}

pub fn local_date(t: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    local_datetime(t, offset).map(|dt| dt.date_naive())
}

/// RFC 3339 with offset, e.g. `2026-10-20T10:00:00-03:00`.
pub fn format_instant(t: Ms, offset: FixedOffset) -> String {
    match local_datetime(t, offset) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, false),
        None => t.to_string(),
    }
}

/// Accepts RFC 3339 (offset required) or raw Unix milliseconds.
pub fn parse_instant(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
