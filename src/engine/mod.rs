mod conflict;
mod error;
mod lifecycle;
mod loyalty;
mod mutations;
mod queries;
mod slots;

pub use conflict::{annotate, check_conflict, search_window};
pub use error::{EngineError, SideEffectFailure};
pub use lifecycle::{plan_transition, Transition};
pub use loyalty::{compute_loyalty, tier_for, LoyaltySummary};
pub use mutations::{AppointmentEdit, BookingRequest, StatusChange};
pub use queries::SlotQuery;
pub use slots::{generate_slots, merge_overlapping, open_windows, subtract_intervals, SlotGrid};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::repository::*;

/// The collaborators an engine talks to. Usually all four are the same store.
#[derive(Clone)]
pub struct Repositories {
    pub appointments: Arc<dyn AppointmentStore>,
    pub ledger: Arc<dyn Ledger>,
    pub clients: Arc<dyn ClientDirectory>,
    pub services: Arc<dyn ServiceCatalog>,
}

impl Repositories {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: AppointmentStore + Ledger + ClientDirectory + ServiceCatalog + 'static,
    {
        Self {
            appointments: store.clone(),
            ledger: store.clone(),
            clients: store.clone(),
            services: store,
        }
    }
}

type PairGuard = (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>);

/// Booking orchestrator for one business.
pub struct Engine {
    pub(super) repos: Repositories,
    pub(super) schedule: ScheduleConfig,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes check + commit per resource.
    commit_locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
    /// Serializes loyalty recomputation per client.
    loyalty_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        repos: Repositories,
        schedule: ScheduleConfig,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repos,
            schedule,
            notify,
            clock,
            commit_locks: DashMap::new(),
            loyalty_locks: DashMap::new(),
        }
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub(super) fn buffer_ms(&self) -> Ms {
        minutes(self.schedule.buffer_minutes)
    }

    pub(super) async fn lock_resource(&self, key: ResourceKey) -> OwnedMutexGuard<()> {
        let lock = self.commit_locks.entry(key).or_default().value().clone();
        lock.lock_owned().await
    }

    pub(super) async fn lock_client(&self, client_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.loyalty_locks.entry(client_id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Lock the appointment's resource and read it back under the lock,
    /// retrying if a concurrent edit moved it in between.
    pub(super) async fn lock_appointment(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<()>, Appointment), EngineError> {
        let ((guard, _), current) = self.lock_appointment_to(id, None).await?;
        Ok((guard, current))
    }

    /// Like [`lock_appointment`](Self::lock_appointment), additionally holding
    /// the resource the appointment moves to when `target` reassigns it.
    pub(super) async fn lock_appointment_to(
        &self,
        id: Ulid,
        target: Option<Option<Ulid>>,
    ) -> Result<(PairGuard, Appointment), EngineError> {
        loop {
            let resource = self.get_appointment(id).await?.resource();
            let destination = target.map_or(resource, ResourceKey::from);
            let guard = self.lock_pair(resource, destination).await;
            let current = self.get_appointment(id).await?;
            if current.resource() == resource {
                return Ok((guard, current));
            }
        }
    }

    /// Lock two resources in key order so concurrent moves cannot deadlock.
    pub(super) async fn lock_pair(
        &self,
        a: ResourceKey,
        b: ResourceKey,
    ) -> PairGuard {
        if a == b {
            return (self.lock_resource(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.lock_resource(first).await;
        let g2 = self.lock_resource(second).await;
        (g1, Some(g2))
    }

    /// Scheduled bookings on `resource` that could collide with `span`.
    pub(super) async fn bookings_near(
        &self,
        resource: ResourceKey,
        span: &Span,
    ) -> Result<Vec<BookingRecord>, EngineError> {
        let window = search_window(span, self.buffer_ms());
        Ok(self
            .repos
            .appointments
            .find_bookings(resource, window, StatusFilter::Only(AppointmentStatus::Scheduled))
            .await?)
    }
}

/// Translate the store's overlap backstop into the user-facing conflict.
pub(super) fn store_conflict(requested: Span, err: StoreError) -> EngineError {
    match err {
        StoreError::Overlap { existing, span } => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "source" => "store").increment(1);
            EngineError::SchedulingConflict {
                requested,
                existing,
                conflicting: span,
            }
        }
        other => EngineError::Persistence(other),
    }
}
