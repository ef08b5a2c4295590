use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::repository::*;
use crate::wal::Wal;

/// Appointments on one resource, sorted by `start`.
#[derive(Debug, Clone)]
pub struct ResourceBook {
    pub key: ResourceKey,
    pub appointments: Vec<Appointment>,
}

impl ResourceBook {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose start lies in `window`.
    pub fn starting_in(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let lo = self.appointments.partition_point(|a| a.start < window.start);
        let hi = self.appointments.partition_point(|a| a.start < window.end);
        self.appointments[lo..hi].iter()
    }

    /// First scheduled appointment (other than `exclude`) overlapping `span`.
    /// Everything at or past the partition point starts after `span` ends.
    pub fn scheduled_overlap(&self, span: &Span, exclude: Ulid) -> Option<&Appointment> {
        let right_bound = self.appointments.partition_point(|a| a.start < span.end);
        self.appointments[..right_bound].iter().find(|a| {
            a.id != exclude && a.status == AppointmentStatus::Scheduled && a.span().overlaps(span)
        })
    }
}

pub type SharedBook = Arc<RwLock<ResourceBook>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Blocks for the first append, drains
/// whatever else is already queued, and commits the batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // A compact or counter request queued behind the batch runs after it.
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale buffered bytes do not leak
    // into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let _ = response.send(wal.append_buffered(&event).and_then(|()| wal.flush_sync()));
        }
    }
}

// ── Store ────────────────────────────────────────────────

/// In-memory, WAL-backed implementation of every repository capability.
///
/// Every mutation is appended to the WAL before it is applied. The store
/// refuses overlapping scheduled appointments on one resource, which backs up
/// the engine's own conflict check.
pub struct MemoryStore {
    books: DashMap<ResourceKey, SharedBook>,
    /// Reverse lookup: appointment id → resource key.
    index: DashMap<Ulid, ResourceKey>,
    clients: DashMap<Ulid, Client>,
    /// Keyed by lowercased service name.
    services: DashMap<String, Service>,
    /// Keyed by appointment id: at most one transaction per appointment.
    transactions: DashMap<Ulid, FinancialTransaction>,
    ledger_lock: Mutex<()>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot and the log swap see the same state.
    compaction: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

#[derive(Default)]
struct Replayed {
    books: HashMap<ResourceKey, ResourceBook>,
    index: HashMap<Ulid, ResourceKey>,
    clients: HashMap<Ulid, Client>,
    services: HashMap<String, Service>,
    transactions: HashMap<Ulid, FinancialTransaction>,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::ServiceUpserted(service) => {
                self.services.insert(service_key(&service.name), service);
            }
            Event::ClientUpserted(client) => {
                self.clients.insert(client.id, client);
            }
            Event::AppointmentInserted(appointment) | Event::AppointmentUpdated(appointment) => {
                if let Some(old_key) = self.index.get(&appointment.id)
                    && let Some(book) = self.books.get_mut(old_key)
                {
                    book.remove(appointment.id);
                }
                let key = appointment.resource();
                self.index.insert(appointment.id, key);
                self.books
                    .entry(key)
                    .or_insert_with(|| ResourceBook::new(key))
                    .insert(appointment);
            }
            Event::AppointmentStatusChanged { id, status } => {
                if let Some(key) = self.index.get(&id)
                    && let Some(appointment) = self.books.get_mut(key).and_then(|b| b.get_mut(id))
                {
                    appointment.status = status;
                }
            }
            Event::AppointmentDeleted { id } => {
                if let Some(key) = self.index.remove(&id)
                    && let Some(book) = self.books.get_mut(&key)
                {
                    book.remove(id);
                }
            }
            Event::TransactionRecorded(tx) => {
                self.transactions.insert(tx.appointment_id, tx);
            }
            Event::LoyaltyUpdated { client_id, points, tier } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.points = points;
                    client.tier = tier;
                }
            }
        }
    }
}

fn service_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn wal_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Wal(e.to_string())
}

impl MemoryStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a
    /// tokio runtime.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let mut replayed = Replayed::default();
        for event in Wal::replay(&path)? {
            replayed.apply(event);
        }
        let wal = Wal::open(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let books = DashMap::new();
        for (key, book) in replayed.books {
            books.insert(key, Arc::new(RwLock::new(book)));
        }
        Ok(Self {
            books,
            index: replayed.index.into_iter().collect(),
            clients: replayed.clients.into_iter().collect(),
            services: replayed.services.into_iter().collect(),
            transactions: replayed.transactions.into_iter().collect(),
            ledger_lock: Mutex::new(()),
            compaction: RwLock::new(()),
            wal_tx,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(wal_err)
    }

    fn book(&self, key: ResourceKey) -> Option<SharedBook> {
        self.books.get(&key).map(|e| e.value().clone())
    }

    fn book_or_create(&self, key: ResourceKey) -> SharedBook {
        self.books
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceBook::new(key))))
            .value()
            .clone()
    }

    fn key_of(&self, id: Ulid) -> Result<ResourceKey, StoreError> {
        self.index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))
    }

    pub fn appointment_count(&self) -> usize {
        self.index.len()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;

        let mut events: Vec<Event> = Vec::new();
        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        events.extend(services.into_iter().map(Event::ServiceUpserted));
        events.extend(self.clients.iter().map(|e| Event::ClientUpserted(e.value().clone())));

        let books: Vec<SharedBook> = self.books.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            events.extend(guard.appointments.iter().cloned().map(Event::AppointmentInserted));
        }
        events.extend(
            self.transactions
                .iter()
                .map(|e| Event::TransactionRecorded(e.value().clone())),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(wal_err)
    }
}

#[async_trait]
impl AppointmentStore for MemoryStore {
    async fn find_bookings(
        &self,
        resource: ResourceKey,
        window: Span,
        filter: StatusFilter,
    ) -> Result<Vec<BookingRecord>, StoreError> {
        let Some(book) = self.book(resource) else {
            return Ok(Vec::new());
        };
        let guard = book.read().await;
        Ok(guard
            .starting_in(&window)
            .filter(|a| filter.matches(a.status))
            .map(Appointment::booking)
            .collect())
    }

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let Ok(key) = self.key_of(id) else {
            return Ok(None);
        };
        let Some(book) = self.book(key) else {
            return Ok(None);
        };
        let guard = book.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<Ulid, StoreError> {
        let _shared = self.compaction.read().await;
        if self.index.contains_key(&appointment.id) {
            return Err(StoreError::AlreadyExists(appointment.id));
        }
        let id = appointment.id;
        let key = appointment.resource();
        let book = self.book_or_create(key);
        let mut guard = book.write().await;
        if appointment.status == AppointmentStatus::Scheduled
            && let Some(existing) = guard.scheduled_overlap(&appointment.span(), id)
        {
            return Err(StoreError::Overlap {
                existing: existing.id,
                span: existing.span(),
            });
        }

        self.wal_append(Event::AppointmentInserted(appointment.clone())).await?;
        guard.insert(appointment);
        self.index.insert(id, key);
        Ok(id)
    }

    async fn update_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let id = appointment.id;
        let old_key = self.key_of(id)?;
        let new_key = appointment.resource();

        if old_key == new_key {
            let book = self.book(old_key).ok_or(StoreError::NotFound(id))?;
            let mut guard = book.write().await;
            if appointment.status == AppointmentStatus::Scheduled
                && let Some(existing) = guard.scheduled_overlap(&appointment.span(), id)
            {
                return Err(StoreError::Overlap {
                    existing: existing.id,
                    span: existing.span(),
                });
            }
            guard.get(id).ok_or(StoreError::NotFound(id))?;
            self.wal_append(Event::AppointmentUpdated(appointment.clone())).await?;
            guard.remove(id);
            guard.insert(appointment);
            return Ok(());
        }

        // Moving between resources: lock both books in key order.
        let old_book = self.book(old_key).ok_or(StoreError::NotFound(id))?;
        let new_book = self.book_or_create(new_key);
        let (mut old_guard, mut new_guard) = if old_key < new_key {
            let o = old_book.write().await;
            let n = new_book.write().await;
            (o, n)
        } else {
            let n = new_book.write().await;
            let o = old_book.write().await;
            (o, n)
        };
        old_guard.get(id).ok_or(StoreError::NotFound(id))?;
        if appointment.status == AppointmentStatus::Scheduled
            && let Some(existing) = new_guard.scheduled_overlap(&appointment.span(), id)
        {
            return Err(StoreError::Overlap {
                existing: existing.id,
                span: existing.span(),
            });
        }
        self.wal_append(Event::AppointmentUpdated(appointment.clone())).await?;
        old_guard.remove(id);
        new_guard.insert(appointment);
        self.index.insert(id, new_key);
        Ok(())
    }

    async fn update_status(&self, id: Ulid, status: AppointmentStatus) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let key = self.key_of(id)?;
        let book = self.book(key).ok_or(StoreError::NotFound(id))?;
        let mut guard = book.write().await;
        let span = guard.get(id).ok_or(StoreError::NotFound(id))?.span();
        if status == AppointmentStatus::Scheduled
            && let Some(existing) = guard.scheduled_overlap(&span, id)
        {
            return Err(StoreError::Overlap {
                existing: existing.id,
                span: existing.span(),
            });
        }

        self.wal_append(Event::AppointmentStatusChanged { id, status }).await?;
        if let Some(appointment) = guard.get_mut(id) {
            appointment.status = status;
        }
        Ok(())
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let key = self.key_of(id)?;
        let book = self.book(key).ok_or(StoreError::NotFound(id))?;
        let mut guard = book.write().await;
        guard.get(id).ok_or(StoreError::NotFound(id))?;
        self.wal_append(Event::AppointmentDeleted { id }).await?;
        guard.remove(id);
        self.index.remove(&id);
        Ok(())
    }

    async fn appointments_for_client(&self, client_id: Ulid) -> Result<Vec<Appointment>, StoreError> {
        let books: Vec<SharedBook> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for book in books {
            let guard = book.read().await;
            found.extend(guard.appointments.iter().filter(|a| a.client_id == client_id).cloned());
        }
        found.sort_by_key(|a| a.start);
        Ok(found)
    }

    async fn appointments_in(
        &self,
        window: Span,
        resource: Option<ResourceKey>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let books: Vec<SharedBook> = match resource {
            Some(key) => self.book(key).into_iter().collect(),
            None => self.books.iter().map(|e| e.value().clone()).collect(),
        };
        let mut found = Vec::new();
        for book in books {
            let guard = book.read().await;
            found.extend(guard.starting_in(&window).cloned());
        }
        found.sort_by_key(|a| a.start);
        Ok(found)
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn record_transaction(&self, transaction: FinancialTransaction) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let _serial = self.ledger_lock.lock().await;
        if self.transactions.contains_key(&transaction.appointment_id) {
            return Err(StoreError::AlreadyExists(transaction.appointment_id));
        }
        self.wal_append(Event::TransactionRecorded(transaction.clone())).await?;
        self.transactions.insert(transaction.appointment_id, transaction);
        Ok(())
    }

    async fn transaction_for_appointment(
        &self,
        appointment_id: Ulid,
    ) -> Result<Option<FinancialTransaction>, StoreError> {
        Ok(self.transactions.get(&appointment_id).map(|e| e.value().clone()))
    }

    async fn list_transactions(&self) -> Result<Vec<FinancialTransaction>, StoreError> {
        let mut all: Vec<FinancialTransaction> =
            self.transactions.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| (t.date, t.id));
        Ok(all)
    }
}

#[async_trait]
impl ClientDirectory for MemoryStore {
    async fn get_client(&self, id: Ulid) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.get(&id).map(|e| e.value().clone()))
    }

    async fn upsert_client(&self, client: Client) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        self.wal_append(Event::ClientUpserted(client.clone())).await?;
        self.clients.insert(client.id, client);
        Ok(())
    }

    async fn update_loyalty(&self, client_id: Ulid, points: u64, tier: Tier) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        if !self.clients.contains_key(&client_id) {
            return Err(StoreError::NotFound(client_id));
        }
        self.wal_append(Event::LoyaltyUpdated { client_id, points, tier }).await?;
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.points = points;
            client.tier = tier;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceCatalog for MemoryStore {
    async fn get_service(&self, name: &str) -> Result<Option<Service>, StoreError> {
        Ok(self.services.get(&service_key(name)).map(|e| e.value().clone()))
    }

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        self.wal_append(Event::ServiceUpserted(service.clone())).await?;
        self.services.insert(service_key(&service.name), service);
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let mut all: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}
