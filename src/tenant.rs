//! Tenant isolation: one fully independent engine (state, WAL,
//! background loops) per organization, created lazily on first touch.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::expander::run_expander;
use crate::limits::{MAX_TENANTS, MAX_TENANT_NAME_LEN};
use crate::notify::NotifyHub;
use crate::observability;
use crate::sweeper::{run_compactor, run_sweeper};

pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: Config,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: Config) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
        }
    }

    /// Tenant names become WAL file names; anything that could escape
    /// the data directory is rejected outright.
    fn validate_name(name: &str) -> Result<(), EngineError> {
        if name.is_empty() || name.len() > MAX_TENANT_NAME_LEN {
            return Err(EngineError::LimitExceeded("tenant name out of range"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::InvalidState(
                "tenant name must be alphanumeric, '_' or '-'",
            ));
        }
        Ok(())
    }

    /// Get the tenant's engine, booting it (WAL replay + background
    /// loops) on first access.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Engine>, EngineError> {
        if let Some(engine) = self.engines.get(name) {
            return Ok(engine.clone());
        }
        Self::validate_name(name)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }

        // entry() serializes racing creators for the same name.
        let entry = self.engines.entry(name.to_string());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(
                    Engine::new(wal_path, notify)
                        .map_err(|e| EngineError::WalError(e.to_string()))?,
                );

                tokio::spawn(run_sweeper(
                    engine.clone(),
                    self.config.release,
                    self.config.sweep_interval,
                ));
                tokio::spawn(run_expander(
                    engine.clone(),
                    self.config.expand,
                    self.config.expand_interval,
                ));
                tokio::spawn(run_compactor(
                    engine.clone(),
                    self.config.compact_threshold,
                    self.config.sweep_interval,
                ));

                info!(tenant = name, "tenant engine started");
                e.insert(engine.clone());
                metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
                engine
            }
        };
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingKind, Span};
    use ulid::Ulid;

    fn manager() -> TenantManager {
        let dir = std::env::temp_dir()
            .join("parkd_test_tenant")
            .join(Ulid::new().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        TenantManager::new(dir, Config::from_lookup(|_| None))
    }

    #[tokio::test]
    async fn engines_are_created_lazily_and_cached() {
        let mgr = manager();
        assert_eq!(mgr.tenant_count(), 0);
        let a = mgr.get_or_create("acme").unwrap();
        assert_eq!(mgr.tenant_count(), 1);
        let a2 = mgr.get_or_create("acme").unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let mgr = manager();
        let acme = mgr.get_or_create("acme").unwrap();
        let globex = mgr.get_or_create("globex").unwrap();

        let lot = Ulid::new();
        acme.create_lot(lot, "Garage".into(), "1 Main St".into()).await.unwrap();
        let slot = Ulid::new();
        acme.create_slot(slot, lot, "A1".into()).await.unwrap();
        let span = Span::new(1_700_000_000_000, 1_700_003_600_000);
        acme.create_booking(Ulid::new(), lot, Some(slot), "u1".into(), span, BookingKind::OneOff)
            .await
            .unwrap();

        // The other tenant sees none of it.
        assert!(globex.get_lot(&lot).await.is_none());
        assert!(globex.list_lots().await.is_empty());
    }

    #[tokio::test]
    async fn hostile_names_rejected() {
        let mgr = manager();
        assert!(mgr.get_or_create("../escape").is_err());
        assert!(mgr.get_or_create("").is_err());
        assert!(mgr.get_or_create("a b").is_err());
        assert!(mgr.get_or_create("acme_2-west").is_ok());
    }

    #[tokio::test]
    async fn tenant_limit_enforced() {
        let mgr = manager();
        for i in 0..MAX_TENANTS {
            mgr.get_or_create(&format!("t{i}")).unwrap();
        }
        assert!(matches!(
            mgr.get_or_create("one-too-many"),
            Err(EngineError::LimitExceeded(_))
        ));
        // Existing tenants keep working.
        assert!(mgr.get_or_create("t0").is_ok());
    }
}
