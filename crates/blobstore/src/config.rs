//! Store configuration
//!
//! Read from `blobstore.json` in the config directory (see the `config`
//! crate). When no file exists, everything is rooted in the platform data
//! directory with a single message volume and the local file backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::info;
use serde::{Deserialize, Serialize};

use crate::models::{Volume, VolumeId, VolumeKind};
use crate::store::{
    ContentAddressableStoreManager, ExternalStoreManager, FileBlobStore, LocalCasStore,
    SimpleStore, StoreManager,
};

/// Config filename in the config directory
pub const CONFIG_FILE: &str = "blobstore.json";

/// Which backend serves blobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local volumes, locator = volume id
    File,
    /// Directory-backed external store
    Simple { base_dir: PathBuf },
    /// Content-addressed directory store
    ContentAddressable {
        base_dir: PathBuf,
        #[serde(default)]
        single_instance: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub incoming_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Enables resumable uploads on backends that support them
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
    /// Overrides each volume's compression threshold
    #[serde(default)]
    pub compression_threshold: Option<u64>,
    pub volumes: Vec<Volume>,
    pub current_volume: VolumeId,
    pub catalog_path: PathBuf,
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = config::data_dir().unwrap_or_else(|| PathBuf::from("mailstore-data"));
        Self::rooted_at(&root)
    }
}

impl StoreConfig {
    /// Defaults with every directory under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            incoming_dir: root.join("incoming"),
            cache_dir: root.join("cache"),
            upload_dir: None,
            compression_threshold: None,
            volumes: vec![Volume::new(1, VolumeKind::Message, root.join("store"))],
            current_volume: 1,
            catalog_path: root.join("catalog.db"),
            backend: BackendConfig::File,
        }
    }

    /// Load from the config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        let config: Self = config::load_json_or_default(CONFIG_FILE)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse store config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Write to the config directory, returning the file path
    pub fn save(&self) -> Result<PathBuf> {
        config::save_json(CONFIG_FILE, self)
    }

    pub fn validate(&self) -> Result<()> {
        let current = self
            .volumes
            .iter()
            .find(|v| v.id == self.current_volume)
            .ok_or_else(|| anyhow!("current volume {} is not configured", self.current_volume))?;
        if !current.kind.holds_blobs() {
            return Err(anyhow!(
                "current volume {} is a {} volume",
                current.id,
                current.kind.as_str()
            ));
        }
        let mut ids: Vec<VolumeId> = self.volumes.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.volumes.len() {
            return Err(anyhow!("duplicate volume ids in store config"));
        }
        Ok(())
    }

    /// Volumes with the configured compression threshold applied
    pub fn effective_volumes(&self) -> Vec<Volume> {
        self.volumes
            .iter()
            .cloned()
            .map(|mut v| {
                if let Some(threshold) = self.compression_threshold {
                    v.compression_threshold = threshold;
                }
                v
            })
            .collect()
    }

    pub fn volume(&self, id: VolumeId) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == id)
    }
}

/// Build and start the store manager the config asks for
pub fn open_store_manager(config: &StoreConfig) -> Result<Arc<dyn StoreManager>> {
    let manager: Arc<dyn StoreManager> = match &config.backend {
        BackendConfig::File => Arc::new(FileBlobStore::new(
            &config.incoming_dir,
            config.effective_volumes(),
            config.current_volume,
        )?),
        BackendConfig::Simple { base_dir } => {
            let mut store = SimpleStore::new(base_dir)?;
            if let Some(upload_dir) = &config.upload_dir {
                store = store.with_uploads(upload_dir)?;
            }
            Arc::new(ExternalStoreManager::new(
                store,
                &config.incoming_dir,
                &config.cache_dir,
            )?)
        }
        BackendConfig::ContentAddressable {
            base_dir,
            single_instance,
        } => {
            let mut store = LocalCasStore::new(base_dir)?;
            if *single_instance {
                store = store.with_single_instance();
            }
            Arc::new(ContentAddressableStoreManager::new(
                store,
                &config.incoming_dir,
                &config.cache_dir,
            )?)
        }
    };
    manager.startup()?;
    info!("[STORE] Opened {:?} store manager", config.backend);
    Ok(manager)
}
