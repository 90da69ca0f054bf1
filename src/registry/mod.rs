//! Plate authorization registry.
//!
//! Maps normalized plate strings to an authorized flag. Every operation
//! re-reads the backing store, and every mutation rewrites it in full, all
//! under one lock so concurrent API calls cannot interleave a
//! read-modify-write. Successful mutations publish a `plates_list` snapshot.

mod store;

use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::broadcast::{BroadcastEvent, Broadcaster};
use crate::plate::normalize;

pub use store::{CsvPlateStore, PlateStore};

/// One registry entry.
///
/// On the wire `authorized` is the literal `"True"` / `"False"`, the same
/// form the CSV store uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlateRecord {
    pub plate: String,
    #[serde(serialize_with = "serialize_flag")]
    pub authorized: bool,
}

impl PlateRecord {
    pub fn new(plate: impl Into<String>, authorized: bool) -> Self {
        Self {
            plate: plate.into(),
            authorized,
        }
    }
}

fn serialize_flag<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "True" } else { "False" })
}

/// Rejections reported to registry callers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Plate is required")]
    InvalidInput,
    #[error("Plate already exists")]
    AlreadyExists,
    #[error("Plate not found")]
    NotFound,
    #[error("plate store failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub struct PlateRegistry {
    store: Mutex<Box<dyn PlateStore>>,
    notifier: Option<Broadcaster>,
}

impl PlateRegistry {
    /// Registry over a CSV file.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_store(CsvPlateStore::new(path))
    }

    pub fn with_store<S: PlateStore + 'static>(store: S) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
            notifier: None,
        }
    }

    /// Publish `plates_list` to `broadcaster` after each mutation.
    pub fn with_notifier(mut self, broadcaster: Broadcaster) -> Self {
        self.notifier = Some(broadcaster);
        self
    }

    pub fn list(&self) -> Result<Vec<PlateRecord>, RegistryError> {
        let store = self.lock()?;
        Ok(store.load()?)
    }

    /// Add an unauthorized plate.
    pub fn add(&self, plate: &str) -> Result<PlateRecord, RegistryError> {
        let plate = normalize(plate);
        if plate.is_empty() {
            return Err(RegistryError::InvalidInput);
        }
        let (record, snapshot) = {
            let store = self.lock()?;
            let mut records = store.load()?;
            if records.iter().any(|r| r.plate == plate) {
                return Err(RegistryError::AlreadyExists);
            }
            let record = PlateRecord::new(plate, false);
            records.push(record.clone());
            store.save(&records)?;
            (record, records)
        };
        log::info!("registry: added {}", record.plate);
        self.notify(snapshot);
        Ok(record)
    }

    /// Flip the authorized flag of one plate.
    pub fn toggle(&self, plate: &str) -> Result<PlateRecord, RegistryError> {
        let plate = normalize(plate);
        let (record, snapshot) = {
            let store = self.lock()?;
            let mut records = store.load()?;
            let Some(entry) = records.iter_mut().find(|r| r.plate == plate) else {
                return Err(RegistryError::NotFound);
            };
            entry.authorized = !entry.authorized;
            let record = entry.clone();
            store.save(&records)?;
            (record, records)
        };
        log::info!(
            "registry: {} authorized={}",
            record.plate,
            record.authorized
        );
        self.notify(snapshot);
        Ok(record)
    }

    pub fn delete(&self, plate: &str) -> Result<(), RegistryError> {
        let plate = normalize(plate);
        let snapshot = {
            let store = self.lock()?;
            let mut records = store.load()?;
            let before = records.len();
            records.retain(|r| r.plate != plate);
            if records.len() == before {
                return Err(RegistryError::NotFound);
            }
            store.save(&records)?;
            records
        };
        log::info!("registry: deleted {}", plate);
        self.notify(snapshot);
        Ok(())
    }

    /// Whether `plate` is present and authorized. Absence is not an error.
    pub fn is_authorized(&self, plate: &str) -> bool {
        let plate = normalize(plate);
        match self.list() {
            Ok(records) => records.iter().any(|r| r.plate == plate && r.authorized),
            Err(err) => {
                log::warn!("registry: authorization lookup failed: {}", err);
                false
            }
        }
    }

    /// Publish the current snapshot (used by list requests).
    pub fn broadcast_snapshot(&self) -> Result<Vec<PlateRecord>, RegistryError> {
        let records = self.list()?;
        self.notify(records.clone());
        Ok(records)
    }

    fn notify(&self, records: Vec<PlateRecord>) {
        if let Some(notifier) = &self.notifier {
            notifier.publish(BroadcastEvent::PlatesList(records));
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn PlateStore>>, RegistryError> {
        self.store
            .lock()
            .map_err(|_| RegistryError::Storage(anyhow::anyhow!("plate registry lock poisoned")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<PlateRecord>>,
        saves: Arc<AtomicUsize>,
        fail_saves: bool,
    }

    impl PlateStore for MemoryStore {
        fn load(&self) -> Result<Vec<PlateRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        fn save(&self, records: &[PlateRecord]) -> Result<()> {
            if self.fail_saves {
                return Err(anyhow!("disk full"));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.records.lock().unwrap() = records.to_vec();
            Ok(())
        }
    }

    fn registry_with(records: Vec<PlateRecord>) -> (PlateRegistry, Arc<AtomicUsize>) {
        let saves = Arc::new(AtomicUsize::new(0));
        let store = MemoryStore {
            records: Mutex::new(records),
            saves: saves.clone(),
            fail_saves: false,
        };
        (PlateRegistry::with_store(store), saves)
    }

    #[test]
    fn add_normalizes_and_defaults_to_unauthorized() {
        let (registry, saves) = registry_with(vec![]);
        let record = registry.add(" 12 34-abc ").unwrap();
        assert_eq!(record, PlateRecord::new("1234ABC", false));
        assert_eq!(registry.list().unwrap(), vec![record]);
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_rejects_duplicates_regardless_of_case_and_spacing() {
        let (registry, _) = registry_with(vec![]);
        registry.add("1234ABC").unwrap();
        let err = registry.add("  1234abc").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists));
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn add_rejects_empty_input() {
        let (registry, saves) = registry_with(vec![]);
        assert!(matches!(registry.add(""), Err(RegistryError::InvalidInput)));
        assert!(matches!(registry.add(" - "), Err(RegistryError::InvalidInput)));
        assert_eq!(saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn toggle_flips_only_the_target() {
        let (registry, _) = registry_with(vec![
            PlateRecord::new("1111AAA", false),
            PlateRecord::new("2222BBB", true),
            PlateRecord::new("3333CCC", false),
        ]);
        let record = registry.toggle("2222bbb").unwrap();
        assert!(!record.authorized);
        assert_eq!(
            registry.list().unwrap(),
            vec![
                PlateRecord::new("1111AAA", false),
                PlateRecord::new("2222BBB", false),
                PlateRecord::new("3333CCC", false),
            ]
        );
    }

    #[test]
    fn toggle_missing_plate_does_not_rewrite() {
        let (registry, saves) = registry_with(vec![PlateRecord::new("1111AAA", false)]);
        assert!(matches!(
            registry.toggle("9999ZZZ"),
            Err(RegistryError::NotFound)
        ));
        assert_eq!(saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delete_removes_and_reports_missing() {
        let (registry, saves) = registry_with(vec![PlateRecord::new("1111AAA", true)]);
        registry.delete("1111 aaa").unwrap();
        assert!(registry.list().unwrap().is_empty());
        assert!(matches!(
            registry.delete("1111AAA"),
            Err(RegistryError::NotFound)
        ));
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn authorization_lookup_is_normalized() {
        let (registry, _) = registry_with(vec![
            PlateRecord::new("1234ABC", true),
            PlateRecord::new("5678XYZ", false),
        ]);
        assert!(registry.is_authorized(" 1234abc "));
        assert!(!registry.is_authorized("5678XYZ"));
        assert!(!registry.is_authorized("0000AAA"));
    }

    #[test]
    fn storage_failure_surfaces_to_caller() {
        let store = MemoryStore {
            fail_saves: true,
            ..MemoryStore::default()
        };
        let registry = PlateRegistry::with_store(store);
        assert!(matches!(
            registry.add("1234ABC"),
            Err(RegistryError::Storage(_))
        ));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn mutations_publish_snapshot() {
        let broadcaster = Broadcaster::new(8);
        let sub = broadcaster.subscribe();
        let (registry, _) = registry_with(vec![]);
        let registry = registry.with_notifier(broadcaster);

        registry.add("1234ABC").unwrap();
        registry.toggle("1234ABC").unwrap();
        let _ = registry.toggle("0000XXX");

        let first = sub.try_recv().expect("add notification");
        assert_eq!(first.name(), "plates_list");
        let second = sub.try_recv().expect("toggle notification");
        assert_eq!(
            second.data_json().unwrap(),
            r#"[{"plate":"1234ABC","authorized":"True"}]"#
        );
        assert!(sub.try_recv().is_none());
    }
}
