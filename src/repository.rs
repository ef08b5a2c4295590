//! Capabilities the engine needs from the outside world.
//!
//! The engine never talks to a concrete store. It holds these traits as
//! `Arc<dyn …>` so one authoritative store (or a test double) can be swapped
//! in. [`crate::store::MemoryStore`] implements all four.

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Storage-level backstop: the insert would overlap a scheduled booking.
    #[error("overlaps scheduled appointment {existing}")]
    Overlap { existing: Ulid, span: Span },
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Bookings on `resource` whose start lies in `window`, filtered by status.
    async fn find_bookings(
        &self,
        resource: ResourceKey,
        window: Span,
        filter: StatusFilter,
    ) -> Result<Vec<BookingRecord>, StoreError>;

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// Insert a new appointment. A `Scheduled` appointment that overlaps
    /// another `Scheduled` one on the same resource is refused with
    /// [`StoreError::Overlap`].
    async fn insert_appointment(&self, appointment: Appointment) -> Result<Ulid, StoreError>;

    /// Replace the stored fields of an existing appointment (same overlap rule).
    async fn update_appointment(&self, appointment: Appointment) -> Result<(), StoreError>;

    async fn update_status(&self, id: Ulid, status: AppointmentStatus) -> Result<(), StoreError>;

    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError>;

    async fn appointments_for_client(&self, client_id: Ulid) -> Result<Vec<Appointment>, StoreError>;

    /// All appointments starting in `window`, optionally for one resource,
    /// ordered by start.
    async fn appointments_in(
        &self,
        window: Span,
        resource: Option<ResourceKey>,
    ) -> Result<Vec<Appointment>, StoreError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record revenue for an appointment. At most one transaction exists per
    /// appointment: recording a second one is [`StoreError::AlreadyExists`].
    async fn record_transaction(&self, transaction: FinancialTransaction) -> Result<(), StoreError>;

    async fn transaction_for_appointment(
        &self,
        appointment_id: Ulid,
    ) -> Result<Option<FinancialTransaction>, StoreError>;

    async fn list_transactions(&self) -> Result<Vec<FinancialTransaction>, StoreError>;
}

#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn get_client(&self, id: Ulid) -> Result<Option<Client>, StoreError>;

    async fn upsert_client(&self, client: Client) -> Result<(), StoreError>;

    async fn update_loyalty(&self, client_id: Ulid, points: u64, tier: Tier) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Case-insensitive lookup by name.
    async fn get_service(&self, name: &str) -> Result<Option<Service>, StoreError>;

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError>;

    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;
}
