//! Lease records and their persistent store.
//!
//! The external service keeps no lease file of its own; every lease event
//! reaches the lease hook, which records it here. Records are keyed by
//! hardware address, so at most one lease exists per MAC.
//!
//! The store is a JSON file rewritten atomically (temporary file + rename)
//! after every mutation, because each hook invocation is a separate
//! short-lived process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const MISSING_FIELD: &str = "*";

/// A single client lease as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Lease expiry as a Unix timestamp in seconds.
    #[serde(default)]
    pub expiry_time: Option<i64>,
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub client_hostname: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl LeaseRecord {
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            expiry_time: None,
            mac_address: mac_address.into(),
            ip_address: None,
            client_hostname: None,
            client_id: None,
        }
    }

    /// Expiry as a UTC timestamp, if one is recorded and representable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_time
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
    }

    /// Copies every field that `other` carries, leaving the rest untouched.
    fn merge(&mut self, other: LeaseRecord) {
        if other.expiry_time.is_some() {
            self.expiry_time = other.expiry_time;
        }
        if other.ip_address.is_some() {
            self.ip_address = other.ip_address;
        }
        if other.client_hostname.is_some() {
            self.client_hostname = other.client_hostname;
        }
        if other.client_id.is_some() {
            self.client_id = other.client_id;
        }
    }
}

/// `expiry mac ip hostname client-id`, with `*` for missing fields.
impl fmt::Display for LeaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expiry = self
            .expiry_time
            .map(|seconds| seconds.to_string())
            .unwrap_or_else(|| MISSING_FIELD.to_string());
        write!(
            f,
            "{} {} {} {} {}",
            expiry,
            self.mac_address,
            self.ip_address.as_deref().unwrap_or(MISSING_FIELD),
            self.client_hostname.as_deref().unwrap_or(MISSING_FIELD),
            self.client_id.as_deref().unwrap_or(MISSING_FIELD),
        )
    }
}

/// On-disk layout of the lease file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LeaseFile {
    #[serde(default)]
    leases: BTreeMap<String, LeaseRecord>,
}

fn normalize_mac(mac: &str) -> String {
    mac.to_ascii_lowercase()
}

/// MAC-keyed lease store backed by a JSON file.
#[derive(Debug)]
pub struct LeaseStore {
    path: PathBuf,
    leases: BTreeMap<String, LeaseRecord>,
}

impl LeaseStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = Self::load_file(&path).await?;
        Ok(Self {
            path,
            leases: file.leases,
        })
    }

    async fn load_file(path: &Path) -> Result<LeaseFile> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            if content.trim().is_empty() {
                return Ok(LeaseFile::default());
            }
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(LeaseFile::default())
        }
    }

    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = LeaseFile {
            leases: self.leases.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the lease for a MAC address, if one exists.
    pub fn get(&self, mac: &str) -> Option<&LeaseRecord> {
        self.leases.get(&normalize_mac(mac))
    }

    /// Returns all leases ordered by MAC address.
    pub fn list(&self) -> Vec<LeaseRecord> {
        self.leases.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Inserts a new lease, replacing any previous lease for the same MAC.
    pub async fn insert(&mut self, mut record: LeaseRecord) -> Result<()> {
        let key = normalize_mac(&record.mac_address);
        record.mac_address = key.clone();
        debug!("lease add {}", record);
        self.leases.insert(key, record);
        self.save().await
    }

    /// Updates the fields `record` carries, inserting it when the MAC is unknown.
    pub async fn update(&mut self, mut record: LeaseRecord) -> Result<()> {
        let key = normalize_mac(&record.mac_address);
        record.mac_address = key.clone();
        match self.leases.get_mut(&key) {
            Some(existing) => {
                existing.merge(record);
                debug!("lease update {}", existing);
            }
            None => {
                debug!("lease update inserts {}", record);
                self.leases.insert(key, record);
            }
        }
        self.save().await
    }

    /// Deletes the lease for `mac`. Returns false when no lease existed.
    pub async fn delete(&mut self, mac: &str) -> Result<bool> {
        let removed = self.leases.remove(&normalize_mac(mac)).is_some();
        if removed {
            debug!("lease delete {}", mac);
            self.save().await?;
        }
        Ok(removed)
    }

    /// Removes every lease and returns how many were dropped.
    pub async fn clear(&mut self) -> Result<usize> {
        let count = self.leases.len();
        self.leases.clear();
        self.save().await?;
        Ok(count)
    }
}
