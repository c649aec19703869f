//! Named volumes.
//!
//! Volumes are host directories under `<run-root>/volumes/<name>/_data`,
//! owned by this manager. Removal honours in-use rules: the native force
//! flag only suppresses "no such volume" and never detaches a volume from a
//! live container; the Docker-compat endpoint's force means the same
//! "ignore missing" and nothing more.

use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::reports::{PruneReport, VolumeInspect};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// One volume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
    pub options: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Options for `volume create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCreateOptions {
    /// Random 64-hex name when absent.
    pub name: Option<String>,
    pub driver: Option<String>,
    pub labels: HashMap<String, String>,
    pub options: HashMap<String, String>,
}

/// Filters accepted by `volume list`.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilters {
    pub driver: Option<String>,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Callback the manager uses to ask whether a container still references a
/// volume; returns the using container's ID.
pub type InUseCheck = dyn Fn(&str) -> Option<String> + Send + Sync;

/// The volume manager.
pub struct VolumeManager {
    storage: Storage,
    events: EventBus,
    volumes: RwLock<HashMap<String, Volume>>,
    in_use: Box<InUseCheck>,
}

impl VolumeManager {
    pub fn new(storage: Storage, events: EventBus, in_use: Box<InUseCheck>) -> Self {
        Self {
            storage,
            events,
            volumes: RwLock::new(HashMap::new()),
            in_use,
        }
    }

    /// Creates a volume. Unnamed volumes get a random 64-hex name.
    pub fn create(&self, opts: VolumeCreateOptions) -> Result<Volume> {
        let name = match opts.name {
            Some(n) => {
                crate::container::config::validate_name(&n)?;
                n
            }
            None => crate::container::config::new_id(),
        };

        {
            let volumes = self.volumes.read().unwrap();
            if volumes.contains_key(&name) {
                return Err(Error::AlreadyExists {
                    kind: "volume",
                    name,
                });
            }
        }

        let data_dir = self.storage.volume_data_dir(&name);
        std::fs::create_dir_all(&data_dir).map_err(|e| Error::Storage {
            path: data_dir.clone(),
            reason: e.to_string(),
        })?;

        let volume = Volume {
            name: name.clone(),
            driver: opts.driver.unwrap_or_else(|| "local".to_string()),
            labels: opts.labels,
            options: opts.options,
            created_at: Utc::now(),
        };
        self.volumes
            .write()
            .unwrap()
            .insert(name.clone(), volume.clone());
        self.events
            .publish(EventKind::Volume, "create", &name, Some(&name));
        info!(volume = %name, "volume created");
        Ok(volume)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.volumes.read().unwrap().contains_key(name)
    }

    pub fn inspect(&self, name: &str) -> Result<VolumeInspect> {
        let volumes = self.volumes.read().unwrap();
        let volume = volumes
            .get(name)
            .ok_or_else(|| Error::NoSuchVolume(name.to_string()))?;
        Ok(self.to_inspect(volume))
    }

    fn to_inspect(&self, volume: &Volume) -> VolumeInspect {
        VolumeInspect {
            name: volume.name.clone(),
            driver: volume.driver.clone(),
            mountpoint: self
                .storage
                .volume_data_dir(&volume.name)
                .to_string_lossy()
                .to_string(),
            labels: volume.labels.clone(),
            options: volume.options.clone(),
            scope: "local".to_string(),
            created_at: volume.created_at,
        }
    }

    pub fn list(&self, filters: &VolumeFilters) -> Vec<VolumeInspect> {
        let volumes = self.volumes.read().unwrap();
        let mut out: Vec<VolumeInspect> = volumes
            .values()
            .filter(|v| {
                if let Some(driver) = &filters.driver {
                    if &v.driver != driver {
                        return false;
                    }
                }
                if !filters.names.is_empty()
                    && !filters.names.iter().any(|n| v.name.contains(n.as_str()))
                {
                    return false;
                }
                filters
                    .labels
                    .iter()
                    .all(|(k, want)| v.labels.get(k).is_some_and(|have| have == want))
            })
            .map(|v| self.to_inspect(v))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Removes a volume.
    ///
    /// A referenced volume always fails with `VolumeBeingUsed`; force does
    /// NOT override that, it only suppresses "no such volume".
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        if !self.exists(name) {
            if force {
                return Ok(());
            }
            return Err(Error::NoSuchVolume(name.to_string()));
        }
        if let Some(container) = (self.in_use)(name) {
            return Err(Error::VolumeBeingUsed {
                name: name.to_string(),
                container,
            });
        }

        let mount_dir = self.storage.volume_data_dir(name);
        if let Some(volume_dir) = mount_dir.parent() {
            if volume_dir.exists() {
                std::fs::remove_dir_all(volume_dir).map_err(|e| Error::Storage {
                    path: volume_dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }
        self.volumes.write().unwrap().remove(name);
        self.events
            .publish(EventKind::Volume, "remove", name, Some(name));
        debug!(volume = %name, "volume removed");
        Ok(())
    }

    /// Removes all unused volumes. Filters are deliberately rejected; this
    /// contract predates us and clients depend on the explicit error.
    pub fn prune(&self, filters: &HashMap<String, Vec<String>>) -> Result<PruneReport> {
        if !filters.is_empty() {
            return Err(Error::NotImplemented(
                "filters are not applicable to volume prune".to_string(),
            ));
        }

        let names: Vec<String> = self.volumes.read().unwrap().keys().cloned().collect();
        let mut report = PruneReport::default();
        for name in names {
            if (self.in_use)(&name).is_some() {
                continue;
            }
            let size = dir_size(&self.storage.volume_data_dir(&name));
            if self.remove(&name, false).is_ok() {
                report.removed.push(name);
                report.space_reclaimed += size;
            }
        }
        Ok(report)
    }

    pub fn count(&self) -> usize {
        self.volumes.read().unwrap().len()
    }

    /// Total bytes under all volume data directories.
    pub fn total_size(&self) -> u64 {
        self.volumes
            .read()
            .unwrap()
            .keys()
            .map(|name| dir_size(&self.storage.volume_data_dir(name)))
            .sum()
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn manager() -> (TempDir, VolumeManager, Arc<Mutex<Option<String>>>) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("graph"), dir.path().join("run")).unwrap();
        // Test hook: which container claims any volume right now.
        let user: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let user_clone = user.clone();
        let manager = VolumeManager::new(
            storage,
            EventBus::new(),
            Box::new(move |_name| user_clone.lock().unwrap().clone()),
        );
        (dir, manager, user)
    }

    #[test]
    fn create_inspect_list_remove() {
        let (_dir, manager, _) = manager();
        let volume = manager
            .create(VolumeCreateOptions {
                name: Some("data".to_string()),
                labels: [("app".to_string(), "web".to_string())].into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(volume.driver, "local");

        let inspect = manager.inspect("data").unwrap();
        assert!(inspect.mountpoint.ends_with("volumes/data/_data"));
        assert_eq!(inspect.scope, "local");

        assert_eq!(manager.list(&VolumeFilters::default()).len(), 1);
        manager.remove("data", false).unwrap();
        assert!(!manager.exists("data"));
    }

    #[test]
    fn unnamed_volume_gets_64_hex_name() {
        let (_dir, manager, _) = manager();
        let volume = manager.create(VolumeCreateOptions::default()).unwrap();
        assert_eq!(volume.name.len(), 64);
        assert!(volume.name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_dir, manager, _) = manager();
        manager
            .create(VolumeCreateOptions {
                name: Some("v".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            manager.create(VolumeCreateOptions {
                name: Some("v".to_string()),
                ..Default::default()
            }),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn remove_in_use_fails_even_with_force() {
        let (_dir, manager, user) = manager();
        manager
            .create(VolumeCreateOptions {
                name: Some("busy".to_string()),
                ..Default::default()
            })
            .unwrap();
        *user.lock().unwrap() = Some("c1".to_string());

        let err = manager.remove("busy", false).unwrap_err();
        assert!(matches!(err, Error::VolumeBeingUsed { .. }));
        assert_eq!(err.http_status(), 409);

        // Force still refuses: it only means "ignore missing".
        let err = manager.remove("busy", true).unwrap_err();
        assert!(matches!(err, Error::VolumeBeingUsed { .. }));
    }

    #[test]
    fn remove_missing_with_force_is_ok() {
        let (_dir, manager, _) = manager();
        assert!(matches!(
            manager.remove("ghost", false),
            Err(Error::NoSuchVolume(_))
        ));
        manager.remove("ghost", true).unwrap();
    }

    #[test]
    fn prune_rejects_filters() {
        let (_dir, manager, _) = manager();
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["app=web".to_string()]);
        assert!(matches!(
            manager.prune(&filters),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn prune_skips_in_use() {
        let (_dir, manager, user) = manager();
        manager
            .create(VolumeCreateOptions {
                name: Some("keep".to_string()),
                ..Default::default()
            })
            .unwrap();
        *user.lock().unwrap() = Some("c1".to_string());
        let report = manager.prune(&HashMap::new()).unwrap();
        assert!(report.removed.is_empty());
        assert!(manager.exists("keep"));

        *user.lock().unwrap() = None;
        let report = manager.prune(&HashMap::new()).unwrap();
        assert_eq!(report.removed, vec!["keep".to_string()]);
    }

    #[test]
    fn list_filters() {
        let (_dir, manager, _) = manager();
        manager
            .create(VolumeCreateOptions {
                name: Some("web-data".to_string()),
                labels: [("tier".to_string(), "front".to_string())].into(),
                ..Default::default()
            })
            .unwrap();
        manager
            .create(VolumeCreateOptions {
                name: Some("db-data".to_string()),
                ..Default::default()
            })
            .unwrap();

        let by_name = manager.list(&VolumeFilters {
            names: vec!["web".to_string()],
            ..Default::default()
        });
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name, "web-data");

        let by_label = manager.list(&VolumeFilters {
            labels: [("tier".to_string(), "front".to_string())].into(),
            ..Default::default()
        });
        assert_eq!(by_label.len(), 1);

        let none = manager.list(&VolumeFilters {
            driver: Some("nfs".to_string()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }
}
