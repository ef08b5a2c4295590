use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;

use super::conflict::annotate;
use super::loyalty::{compute_loyalty, LoyaltySummary};
use super::slots::SlotGrid;
use super::{search_window, Engine, EngineError};

/// Which slots to list. Without an explicit duration the service's is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub date: NaiveDate,
    pub service: Option<String>,
    pub duration_minutes: Option<u32>,
    pub professional_id: Option<Ulid>,
}

impl Engine {
    /// The day's slot grid for the query, with booked slots marked unavailable.
    pub async fn available_slots(&self, query: SlotQuery) -> Result<Vec<Slot>, EngineError> {
        let service_duration = match &query.service {
            Some(name) => Some(
                self.repos
                    .services
                    .get_service(name)
                    .await?
                    .ok_or_else(|| EngineError::not_found("service", name))?
                    .duration_minutes,
            ),
            None => None,
        };
        let duration = query
            .duration_minutes
            .or(service_duration)
            .ok_or_else(|| EngineError::invalid("slots need a service or a duration"))?;
        if duration == 0 {
            return Err(EngineError::invalid("duration must be positive"));
        }

        let hours = &self.schedule.hours;
        let slots: Vec<Slot> = SlotGrid::new(
            query.date,
            duration,
            hours,
            self.schedule.step_minutes,
            self.clock.now_ms(),
        )
        .collect();
        let (Some(first), Some(last)) = (slots.first(), slots.last()) else {
            return Ok(slots);
        };

        let covered = Span::new(first.start, last.end);
        let bookings = self
            .repos
            .appointments
            .find_bookings(
                ResourceKey::from(query.professional_id),
                search_window(&covered, self.buffer_ms()),
                StatusFilter::Only(AppointmentStatus::Scheduled),
            )
            .await?;
        Ok(annotate(slots, &bookings, self.buffer_ms(), hours.offset()))
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.repos
            .appointments
            .get_appointment(id)
            .await?
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Appointments starting on `date` (business-local day), any status.
    /// Without a professional, every resource is listed.
    pub async fn appointments_on(
        &self,
        date: NaiveDate,
        professional_id: Option<Ulid>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let offset = self.schedule.hours.offset();
        let start = instant(date, NaiveTime::MIN, offset);
        let day = Span::new(start, start + TimeDelta::days(1).num_milliseconds());
        Ok(self
            .repos
            .appointments
            .appointments_in(day, professional_id.map(ResourceKey::Professional))
            .await?)
    }

    pub async fn appointments_for_client(&self, client_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        Ok(self
            .repos
            .appointments
            .appointments_for_client(client_id)
            .await?)
    }

    pub async fn client(&self, id: Ulid) -> Result<Client, EngineError> {
        self.repos
            .clients
            .get_client(id)
            .await?
            .ok_or_else(|| EngineError::not_found("client", id))
    }

    /// Loyalty recomputed from history, not read back from the client record.
    pub async fn loyalty_for_client(&self, client_id: Ulid) -> Result<LoyaltySummary, EngineError> {
        self.client(client_id).await?;
        let history = self.appointments_for_client(client_id).await?;
        Ok(compute_loyalty(&history))
    }

    pub async fn transactions(
        &self,
        appointment_id: Option<Ulid>,
    ) -> Result<Vec<FinancialTransaction>, EngineError> {
        let ledger = &self.repos.ledger;
        let found = match appointment_id {
            Some(id) => ledger.transaction_for_appointment(id).await?.into_iter().collect(),
            None => ledger.list_transactions().await?,
        };
        Ok(found)
    }

    pub async fn services(&self) -> Result<Vec<Service>, EngineError> {
        Ok(self.repos.services.list_services().await?)
    }
}
