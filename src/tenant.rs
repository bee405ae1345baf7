use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Per-clinic engines, keyed by the sanitized database name a client
/// connects to. Names that sanitize alike share one engine and one WAL file.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for a tenant, replaying its WAL.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Hold the map entry while replaying so two first connections to the
        // same tenant do not open the WAL twice.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(
            engine.clone(),
            self.compact_threshold,
            compactor::COMPACT_CHECK_PERIOD,
        ));

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {safe_name} loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::model::*;
    use chrono::{Days, Local, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("medslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let clinic_a = tm.get_or_create("clinic_a").unwrap();
        let clinic_b = tm.get_or_create("clinic_b").unwrap();

        let doctor = Ulid::new();
        clinic_a
            .register_doctor(doctor, "Dr. Wickramasinghe".into(), "Pediatrics".into())
            .await
            .unwrap();

        let date = Local::now().date_naive().checked_add_days(Days::new(5)).unwrap();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let sid = clinic_a
            .create_schedule(Ulid::new(), doctor, date, start, end, 2, 1500)
            .await
            .unwrap();

        // Clinic B has never heard of that doctor or schedule.
        let err = clinic_b
            .create_schedule(Ulid::new(), doctor, date, start, end, 2, 1500)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "doctor", .. }));
        assert!(clinic_b.get_schedule(sid).await.is_err());
        assert!(clinic_b.list_schedules(&ScheduleFilter::default()).await.is_empty());
        assert_eq!(clinic_a.list_schedules(&ScheduleFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_clinic").unwrap();
        assert!(dir.join("my_clinic.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_wal_file_share_an_engine() {
        let dir = test_data_dir("shared_wal");
        let tm = TenantManager::new(dir.clone(), 1000);

        let dotted = tm.get_or_create("clinic.a").unwrap();
        let plain = tm.get_or_create("clinica").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));
        assert_eq!(tm.tenant_count(), 1);

        dotted
            .register_doctor(Ulid::new(), "Dr. Perera".into(), "ENT".into())
            .await
            .unwrap();
        assert_eq!(plain.list_doctors().len(), 1);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_state_reloads_from_disk() {
        let dir = test_data_dir("reload");
        let doctor = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("clinic").unwrap();
            engine
                .register_doctor(doctor, "Dr. Gunasekara".into(), "ENT".into())
                .await
                .unwrap();
        }
        let tm = TenantManager::new(dir, 1000);
        let engine = tm.get_or_create("clinic").unwrap();
        assert_eq!(engine.list_doctors()[0].id, doctor);
    }
}
