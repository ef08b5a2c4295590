use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{AppointmentNotice, NoticeKind};
use crate::observability::*;
use crate::repository::StoreError;

use super::conflict::{check_conflict, validate_span, validate_start};
use super::lifecycle::{plan_transition, Transition};
use super::loyalty::{compute_loyalty, LoyaltySummary};
use super::{store_conflict, Engine, EngineError, SideEffectFailure};

/// A request to book. Duration and price fall back to the service's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    pub duration_minutes: Option<u32>,
    pub service: String,
    pub price: Option<Money>,
    pub notes: String,
    pub professional_id: Option<Ulid>,
}

impl BookingRequest {
    pub fn new(client_id: Ulid, service: impl Into<String>, start: Ms) -> Self {
        Self {
            id: Ulid::new(),
            client_id,
            start,
            duration_minutes: None,
            service: service.into(),
            price: None,
            notes: String::new(),
            professional_id: None,
        }
    }
}

/// Field changes to a scheduled appointment. `None` leaves a field alone;
/// `professional_id: Some(None)` unassigns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentEdit {
    pub id: Ulid,
    pub start: Option<Ms>,
    pub duration_minutes: Option<u32>,
    pub price: Option<Money>,
    pub notes: Option<String>,
    pub service: Option<String>,
    pub professional_id: Option<Option<Ulid>>,
}

impl AppointmentEdit {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            start: None,
            duration_minutes: None,
            price: None,
            notes: None,
            service: None,
            professional_id: None,
        }
    }

    fn moves(&self) -> bool {
        self.start.is_some() || self.duration_minutes.is_some() || self.professional_id.is_some()
    }
}

/// Outcome of a committed status change. `failures` lists side effects that
/// did not happen; the status change stands regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub appointment: Appointment,
    pub previous: AppointmentStatus,
    pub transaction: Option<FinancialTransaction>,
    pub loyalty: Option<LoyaltySummary>,
    pub failures: Vec<SideEffectFailure>,
}

impl StatusChange {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// A partial success becomes [`EngineError::SideEffectFailure`].
    pub fn into_result(self) -> Result<StatusChange, EngineError> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(EngineError::SideEffectFailure {
            appointment_id: self.appointment.id,
            status: self.appointment.status,
            failures: self.failures,
        })
    }
}

fn validate_duration(duration: u32) -> Result<(), EngineError> {
    if duration == 0 {
        return Err(EngineError::invalid("duration must be positive"));
    }
    if duration > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

fn validate_price(price: Money) -> Result<(), EngineError> {
    if price.is_negative() {
        return Err(EngineError::invalid("price must not be negative"));
    }
    Ok(())
}

fn validate_name(what: &'static str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_notes(notes: &str) -> Result<(), EngineError> {
    if notes.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_service(&self, service: Service) -> Result<(), EngineError> {
        validate_name("service name", &service.name)?;
        validate_price(service.price)?;
        validate_duration(service.duration_minutes)?;
        let service = Service {
            name: service.name.trim().to_string(),
            ..service
        };
        self.repos.services.upsert_service(service).await?;
        Ok(())
    }

    /// Create a client, or rename/re-rate an existing one. Loyalty is kept.
    pub async fn register_client(
        &self,
        id: Ulid,
        name: String,
        rating: Option<u8>,
    ) -> Result<Client, EngineError> {
        validate_name("client name", &name)?;
        if let Some(r) = rating
            && !(1..=5).contains(&r)
        {
            return Err(EngineError::invalid("rating must be between 1 and 5"));
        }
        let client = match self.repos.clients.get_client(id).await? {
            Some(existing) => Client {
                name,
                rating,
                ..existing
            },
            None => Client::new(id, name, rating),
        };
        self.repos.clients.upsert_client(client.clone()).await?;
        Ok(client)
    }

    pub async fn book_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let result = self.try_book(req).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::SchedulingConflict { .. }) => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_book(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        validate_name("service", &req.service)?;
        validate_notes(&req.notes)?;
        if let Some(d) = req.duration_minutes {
            validate_duration(d)?;
        }
        if let Some(p) = req.price {
            validate_price(p)?;
        }

        let service = self
            .repos
            .services
            .get_service(&req.service)
            .await?
            .ok_or_else(|| EngineError::not_found("service", &req.service))?;
        if self.repos.clients.get_client(req.client_id).await?.is_none() {
            return Err(EngineError::not_found("client", req.client_id));
        }

        let duration = req.duration_minutes.unwrap_or(service.duration_minutes);
        validate_duration(duration)?;
        validate_start(req.start)?;
        let appointment = Appointment {
            id: req.id,
            client_id: req.client_id,
            start: req.start,
            duration_minutes: duration,
            service: service.name,
            price: req.price.unwrap_or(service.price),
            notes: req.notes,
            status: AppointmentStatus::Scheduled,
            professional_id: req.professional_id,
        };
        let span = appointment.span();
        validate_span(&span)?;

        let resource = appointment.resource();
        let _commit = self.lock_resource(resource).await;
        let bookings = self.bookings_near(resource, &span).await?;
        if let Err(e) = check_conflict(&span, &bookings, None, self.buffer_ms()) {
            metrics::counter!(CONFLICTS_TOTAL, "source" => "check").increment(1);
            debug!(appointment = %appointment.id, "booking rejected: {e}");
            return Err(e);
        }
        self.repos
            .appointments
            .insert_appointment(appointment.clone())
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(id) => {
                    EngineError::invalid(format!("appointment {id} already exists"))
                }
                other => store_conflict(span, other),
            })?;

        info!(
            appointment = %appointment.id,
            client = %appointment.client_id,
            start = appointment.start,
            "appointment booked"
        );
        self.notify.publish(&AppointmentNotice {
            kind: NoticeKind::Booked,
            appointment: appointment.clone(),
        });
        Ok(appointment)
    }

    pub async fn update_appointment(&self, edit: AppointmentEdit) -> Result<Appointment, EngineError> {
        if let Some(d) = edit.duration_minutes {
            validate_duration(d)?;
        }
        if let Some(p) = edit.price {
            validate_price(p)?;
        }
        if let Some(n) = &edit.notes {
            validate_notes(n)?;
        }
        if let Some(s) = &edit.service {
            validate_name("service", s)?;
        }
        if let Some(start) = edit.start {
            validate_start(start)?;
        }

        let (_commit, current) = self.lock_appointment_to(edit.id, edit.professional_id).await?;
        if current.status != AppointmentStatus::Scheduled {
            return Err(EngineError::invalid(format!(
                "appointment {} is {} and can no longer be edited",
                current.id, current.status
            )));
        }

        let service = match &edit.service {
            Some(name) => self
                .repos
                .services
                .get_service(name)
                .await?
                .ok_or_else(|| EngineError::not_found("service", name))?
                .name,
            None => current.service.clone(),
        };
        let updated = Appointment {
            start: edit.start.unwrap_or(current.start),
            duration_minutes: edit.duration_minutes.unwrap_or(current.duration_minutes),
            price: edit.price.unwrap_or(current.price),
            notes: edit.notes.clone().unwrap_or_else(|| current.notes.clone()),
            service,
            professional_id: edit.professional_id.unwrap_or(current.professional_id),
            ..current.clone()
        };
        let span = updated.span();
        validate_span(&span)?;

        if edit.moves() {
            let bookings = self.bookings_near(updated.resource(), &span).await?;
            if let Err(e) = check_conflict(&span, &bookings, Some(updated.id), self.buffer_ms()) {
                metrics::counter!(CONFLICTS_TOTAL, "source" => "check").increment(1);
                debug!(appointment = %updated.id, "reschedule rejected: {e}");
                return Err(e);
            }
        }
        self.repos
            .appointments
            .update_appointment(updated.clone())
            .await
            .map_err(|e| store_conflict(span, e))?;

        info!(appointment = %updated.id, start = updated.start, "appointment updated");
        self.notify.publish(&AppointmentNotice {
            kind: NoticeKind::Updated,
            appointment: updated.clone(),
        });
        Ok(updated)
    }

    /// Move an appointment to `to`. Side-effect failures are collected in the
    /// returned [`StatusChange`], never rolled back into the status.
    pub async fn change_status(
        &self,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<StatusChange, EngineError> {
        let (commit, current) = self.lock_appointment(id).await?;
        let from = current.status;
        let transition = plan_transition(from, to, self.schedule.restore)?;

        if transition == Transition::Unchanged {
            // Completing again retries side effects a previous completion
            // missed. The commit lock keeps the status from moving meanwhile.
            let (transaction, loyalty, failures) = if from == AppointmentStatus::Completed {
                self.completion_effects(&current, true).await
            } else {
                (None, None, Vec::new())
            };
            drop(commit);
            return Ok(StatusChange {
                appointment: current,
                previous: from,
                transaction,
                loyalty,
                failures,
            });
        }

        if transition == Transition::Restore {
            warn!(appointment = %id, client = %current.client_id, %from, "restoring appointment to scheduled");
            let span = current.span();
            let bookings = self.bookings_near(current.resource(), &span).await?;
            check_conflict(&span, &bookings, Some(id), self.buffer_ms()).inspect_err(|_| {
                metrics::counter!(CONFLICTS_TOTAL, "source" => "check").increment(1);
            })?;
        }

        self.repos
            .appointments
            .update_status(id, to)
            .await
            .map_err(|e| store_conflict(current.span(), e))?;
        drop(commit);

        let appointment = Appointment { status: to, ..current };
        metrics::counter!(STATUS_CHANGES_TOTAL, "to" => to.as_str()).increment(1);
        info!(appointment = %id, %from, %to, "status changed");

        let (transaction, loyalty, failures) = if transition == Transition::Complete {
            self.completion_effects(&appointment, true).await
        } else if transition.touches_completed(from) {
            self.completion_effects(&appointment, false).await
        } else {
            (None, None, Vec::new())
        };

        self.notify.publish(&AppointmentNotice {
            kind: NoticeKind::StatusChanged { from, to },
            appointment: appointment.clone(),
        });
        Ok(StatusChange {
            appointment,
            previous: from,
            transaction,
            loyalty,
            failures,
        })
    }

    /// Revenue (when `revenue` is set) and loyalty after a change that
    /// involves a completed appointment. Failures are collected, not raised.
    async fn completion_effects(
        &self,
        appointment: &Appointment,
        revenue: bool,
    ) -> (Option<FinancialTransaction>, Option<LoyaltySummary>, Vec<SideEffectFailure>) {
        let mut failures = Vec::new();
        let transaction = if revenue {
            self.record_revenue(appointment).await.unwrap_or_else(|e| {
                failures.push(SideEffectFailure::Revenue(e.to_string()));
                None
            })
        } else {
            None
        };
        let loyalty = match self.refresh_loyalty(appointment.client_id).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                failures.push(SideEffectFailure::Loyalty(e.to_string()));
                None
            }
        };
        for f in &failures {
            metrics::counter!(SIDE_EFFECT_FAILURES_TOTAL, "kind" => f.kind()).increment(1);
            warn!(appointment = %appointment.id, "{f}");
        }
        (transaction, loyalty, failures)
    }

    /// Record the appointment's revenue once. Free appointments, and ones that
    /// already have a transaction, record nothing.
    async fn record_revenue(
        &self,
        appointment: &Appointment,
    ) -> Result<Option<FinancialTransaction>, StoreError> {
        if !appointment.price.is_positive() {
            return Ok(None);
        }
        if self
            .repos
            .ledger
            .transaction_for_appointment(appointment.id)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        let tx = FinancialTransaction {
            id: Ulid::new(),
            appointment_id: appointment.id,
            client_id: appointment.client_id,
            amount: appointment.price,
            date: self.clock.now_ms(),
            description: appointment.service.clone(),
        };
        match self.repos.ledger.record_transaction(tx.clone()).await {
            Ok(()) => Ok(Some(tx)),
            Err(StoreError::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Recompute from the full history and store the result on the client.
    pub(super) async fn refresh_loyalty(&self, client_id: Ulid) -> Result<LoyaltySummary, StoreError> {
        // History read and write must not interleave with another recompute.
        let _client = self.lock_client(client_id).await;
        let history = self
            .repos
            .appointments
            .appointments_for_client(client_id)
            .await?;
        let summary = compute_loyalty(&history);
        self.repos
            .clients
            .update_loyalty(client_id, summary.points, summary.tier)
            .await?;
        Ok(summary)
    }

    /// Remove an appointment in any state. Deleting a completed appointment
    /// recomputes the client's loyalty.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let (commit, appointment) = self.lock_appointment(id).await?;
        self.repos
            .appointments
            .delete_appointment(id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => EngineError::not_found("appointment", id),
                other => EngineError::Persistence(other),
            })?;
        drop(commit);

        info!(appointment = %id, status = %appointment.status, "appointment deleted");
        self.notify.publish(&AppointmentNotice {
            kind: NoticeKind::Deleted,
            appointment: appointment.clone(),
        });

        if appointment.status == AppointmentStatus::Completed
            && let Err(e) = self.refresh_loyalty(appointment.client_id).await
        {
            let failure = SideEffectFailure::Loyalty(e.to_string());
            metrics::counter!(SIDE_EFFECT_FAILURES_TOTAL, "kind" => failure.kind()).increment(1);
            warn!(appointment = %id, "{failure}");
            return Err(EngineError::SideEffectFailure {
                appointment_id: id,
                status: appointment.status,
                failures: vec![failure],
            });
        }
        Ok(appointment)
    }
}
