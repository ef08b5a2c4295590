use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::compactor;
use crate::config::ScheduleConfig;
use crate::engine::{Engine, Repositories};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::store::MemoryStore;

/// One engine per business. Business = database name from the pgwire
/// connection; each gets its own WAL file and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    schedule: ScheduleConfig,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, schedule: ScheduleConfig) -> Self {
        Self::with_clock(data_dir, compact_threshold, schedule, Arc::new(SystemClock))
    }

    pub fn with_clock(
        data_dir: PathBuf,
        compact_threshold: u64,
        schedule: ScheduleConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            schedule,
            clock,
        }
    }

    /// Get or lazily open the engine for `tenant`, replaying its WAL.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes exactly one of them replay the WAL.
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let store = Arc::new(MemoryStore::open(wal_path)?);
        info!(
            "opened business {tenant:?} with {} appointments",
            store.appointment_count()
        );
        let engine = Arc::new(Engine::new(
            Repositories::shared(store.clone()),
            self.schedule.clone(),
            Arc::new(NotifyHub::new()),
            self.clock.clone(),
        ));

        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(store, threshold).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, ScheduleConfig::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));

        let salon_a = tm.get_or_create("salon_a").unwrap();
        let salon_b = tm.get_or_create("salon_b").unwrap();

        salon_a
            .register_service(Service {
                name: "Corte".into(),
                price: Money::from_cents(8000),
                duration_minutes: 60,
            })
            .await
            .unwrap();

        assert_eq!(salon_a.services().await.unwrap().len(), 1);
        assert!(salon_b.services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_salon").unwrap();
        assert!(dir.join("my_salon.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_reopens_from_wal() {
        let dir = test_data_dir("reopen");
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("salon").unwrap();
            eng.register_service(Service {
                name: "Manicure".into(),
                price: Money::from_cents(4000),
                duration_minutes: 30,
            })
            .await
            .unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("salon").unwrap();
        let services = eng.services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "Manicure");
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
