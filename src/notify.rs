use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, AppointmentStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    Booked,
    Updated,
    StatusChanged {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Deleted,
}

/// What an outside notifier (SMS, e-mail, push) gets told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentNotice {
    pub kind: NoticeKind,
    pub appointment: Appointment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every notice for the business.
    Business,
    Professional(Ulid),
    Client(Ulid),
}

/// Broadcast hub for appointment notices.
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<AppointmentNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<AppointmentNotice> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan a notice out to the business, professional and client channels.
    /// No-op for channels nobody listens on.
    pub fn publish(&self, notice: &AppointmentNotice) {
        let appointment = &notice.appointment;
        self.send(Channel::Business, notice);
        if let Some(pid) = appointment.professional_id {
            self.send(Channel::Professional(pid), notice);
        }
        self.send(Channel::Client(appointment.client_id), notice);
    }

    fn send(&self, channel: Channel, notice: &AppointmentNotice) {
        if let Some(sender) = self.channels.get(&channel) {
            let _ = sender.send(notice.clone());
        }
    }

    pub fn remove(&self, channel: &Channel) {
        self.channels.remove(channel);
    }
}
