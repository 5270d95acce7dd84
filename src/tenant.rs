use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::directory::RoomDirectory;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Supplies the physical-room directory for a hotel id.
pub type DirectoryFactory = Arc<dyn Fn(&str) -> Arc<dyn RoomDirectory> + Send + Sync>;

/// Per-hotel engines. Each hotel gets its own Engine, log file and notify hub.
pub struct HotelRegistry {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    directories: DirectoryFactory,
}

/// File stem for a hotel id: alphanumerics, `_` and `-` only.
pub fn log_file_stem(hotel_id: &str) -> std::io::Result<String> {
    if hotel_id.len() > MAX_HOTEL_ID_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "hotel id too long",
        ));
    }
    let safe: String = hotel_id
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty hotel id",
        ));
    }
    Ok(safe)
}

impl HotelRegistry {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, directories: DirectoryFactory) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            directories,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get or lazily open the engine for `hotel_id`, replaying its log.
    pub fn get_or_create(&self, hotel_id: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(hotel_id) {
            return Ok(engine.value().clone());
        }
        let stem = log_file_stem(hotel_id)?;
        if self.engines.len() >= MAX_HOTELS {
            return Err(std::io::Error::other("too many hotels"));
        }

        let entry = self.engines.entry(hotel_id.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            (self.directories)(hotel_id),
            Arc::new(NotifyHub::new()),
        )?);
        entry.or_insert(engine.clone());

        metrics::gauge!(crate::observability::HOTELS_ACTIVE).set(self.engines.len() as f64);
        info!("hotel {hotel_id} opened ({} events replayed)", engine.replayed_events());
        Ok(engine)
    }

    pub fn get(&self, hotel_id: &str) -> Option<Arc<Engine>> {
        self.engines.get(hotel_id).map(|e| e.value().clone())
    }

    /// Loaded hotel ids, sorted.
    pub fn hotels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Compact every loaded hotel whose log grew by at least the threshold since its
    /// last compaction. Returns the hotels that were compacted.
    pub async fn compact_over_threshold(&self) -> Vec<String> {
        let engines: Vec<(String, Arc<Engine>)> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut compacted = Vec::new();
        for (hotel_id, engine) in engines {
            if engine.wal_appends_since_compact().await < self.compact_threshold {
                continue;
            }
            match engine.compact_wal().await {
                Ok(()) => compacted.push(hotel_id),
                Err(e) => warn!("compaction of hotel {hotel_id} failed: {e}"),
            }
        }
        compacted.sort();
        compacted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::directory::InMemoryDirectory;
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomledger_test_registry").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn empty_directories() -> DirectoryFactory {
        Arc::new(|_: &str| Arc::new(InMemoryDirectory::new()) as Arc<dyn RoomDirectory>)
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    #[tokio::test]
    async fn hotels_are_isolated() {
        let registry = HotelRegistry::new(test_data_dir("isolation"), 1000, empty_directories());
        let a = registry.get_or_create("harbour").unwrap();
        let b = registry.get_or_create("alpine").unwrap();
        let ctx = RequestContext::system();

        let rt = Ulid::new();
        a.create_room_type(&ctx, rt, None, 1, 100).await.unwrap();
        b.create_room_type(&ctx, rt, None, 1, 100).await.unwrap();
        a.create_reservation(&ctx, BookingRequest::new(rt, d(1), d(3)))
            .await
            .unwrap();

        let in_a = a.check_availability(rt, d(1), d(3), 1).await.unwrap();
        let in_b = b.check_availability(rt, d(1), d(3), 1).await.unwrap();
        assert_eq!(in_a.free_units, 0);
        assert_eq!(in_b.free_units, 1);
    }

    #[tokio::test]
    async fn lazy_creation_writes_log_file() {
        let dir = test_data_dir("lazy");
        let registry = HotelRegistry::new(dir.clone(), 1000, empty_directories());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        registry.get_or_create("city-centre").unwrap();
        assert!(dir.join("city-centre.wal").exists());
        assert_eq!(registry.hotels(), vec!["city-centre".to_string()]);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let registry = HotelRegistry::new(test_data_dir("same"), 1000, empty_directories());
        let first = registry.get_or_create("h1").unwrap();
        let second = registry.get_or_create("h1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &registry.get("h1").unwrap()));
        assert!(registry.get("h2").is_none());
    }

    #[tokio::test]
    async fn hotel_id_sanitized() {
        let dir = test_data_dir("sanitize");
        let registry = HotelRegistry::new(dir.clone(), 1000, empty_directories());

        registry.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(registry.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn hotel_id_too_long() {
        let registry = HotelRegistry::new(test_data_dir("too_long"), 1000, empty_directories());
        let err = registry
            .get_or_create(&"x".repeat(MAX_HOTEL_ID_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("hotel id too long"));
    }

    #[tokio::test]
    async fn reopened_hotel_replays_log() {
        let dir = test_data_dir("reopen");
        let rt = Ulid::new();
        {
            let registry = HotelRegistry::new(dir.clone(), 1000, empty_directories());
            let engine = registry.get_or_create("h").unwrap();
            engine
                .create_room_type(&RequestContext::system(), rt, Some("Suite".into()), 2, 50_000)
                .await
                .unwrap();
        }
        let registry = HotelRegistry::new(dir, 1000, empty_directories());
        let engine = registry.get_or_create("h").unwrap();
        assert_eq!(engine.replayed_events(), 1);
        assert_eq!(engine.unit_count(rt).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn compacts_only_busy_hotels() {
        let registry = HotelRegistry::new(test_data_dir("compact"), 3, empty_directories());
        let busy = registry.get_or_create("busy").unwrap();
        registry.get_or_create("quiet").unwrap();

        let ctx = RequestContext::system();
        let rt = Ulid::new();
        busy.create_room_type(&ctx, rt, None, 5, 100).await.unwrap();
        for day in 1..4 {
            busy.create_reservation(&ctx, BookingRequest::new(rt, d(day), d(day + 1)))
                .await
                .unwrap();
        }

        assert_eq!(registry.compact_over_threshold().await, vec!["busy".to_string()]);
        assert_eq!(busy.wal_appends_since_compact().await, 0);
        assert!(registry.compact_over_threshold().await.is_empty());
    }
}
