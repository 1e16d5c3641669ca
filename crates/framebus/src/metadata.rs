//! Tracking metadata published next to the frames.
//!
//! Region `{name}_meta` holds a little-endian `u32` payload length followed by
//! the JSON-encoded object list. Each write replaces the whole list. A zeroed
//! region reads as an empty list. The region has its own lock, so metadata
//! traffic never waits on frame traffic.

use crate::config::BusConfig;
use crate::errors::BufferError;
use crate::paths;
use crate::region::{MappedRegion, Opened};
use crate::registry::CleanupReport;
use crate::semaphore::{Semaphore, SemaphoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_MAX_OBJECTS: usize = 20;

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// A detection that the tracker has followed across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: u64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_name: String,
    pub is_trusted: bool,
    pub face_name: Option<String>,
    pub camera_label: String,
    /// Seconds since the Unix epoch.
    pub last_seen: f64,
}

pub struct SharedMetadata {
    name: String,
    region: MappedRegion,
    lock: Semaphore,
    namespace: String,
    lock_timeout: Duration,
}

impl SharedMetadata {
    /// Allocate room for `max_objects` records, or join an existing region.
    pub fn create(config: &BusConfig, name: &str, max_objects: usize) -> Result<Self, BufferError> {
        paths::validate_name(name)?;
        let capacity = max_objects.max(1) * config.metadata_record_bytes;
        let (region, opened) = match MappedRegion::create_or_attach(
            &config.shm_dir,
            &paths::metadata_name(name),
            LENGTH_PREFIX + capacity,
        ) {
            Ok(opened) => opened,
            Err(BufferError::SizeMismatch { actual, .. }) => {
                tracing::warn!(name, requested = capacity, actual, "Joining metadata region with a different capacity");
                return Self::attach(config, name);
            }
            Err(e) => return Err(e),
        };

        let lock_name = paths::metadata_lock_semaphore_name(&config.namespace, name);
        if opened == Opened::Created {
            Semaphore::unlink(&lock_name)?;
        }
        let lock = Semaphore::ensure(&lock_name, 1)?;

        tracing::debug!(name, capacity, ?opened, "Opened shared metadata");
        Ok(Self {
            name: name.to_string(),
            region,
            lock,
            namespace: config.namespace.clone(),
            lock_timeout: config.lock_timeout,
        })
    }

    pub fn attach(config: &BusConfig, name: &str) -> Result<Self, BufferError> {
        paths::validate_name(name)?;
        let region = MappedRegion::attach(&config.shm_dir, &paths::metadata_name(name))?;
        if region.size() <= LENGTH_PREFIX {
            return Err(BufferError::SizeMismatch {
                expected: LENGTH_PREFIX + 1,
                actual: region.size(),
            });
        }

        let lock = Semaphore::ensure(&paths::metadata_lock_semaphore_name(&config.namespace, name), 1)?;

        tracing::debug!(name, size = region.size(), "Attached to shared metadata");
        Ok(Self {
            name: name.to_string(),
            region,
            lock,
            namespace: config.namespace.clone(),
            lock_timeout: config.lock_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest payload the region accepts, in bytes.
    pub fn capacity(&self) -> usize {
        self.region.size() - LENGTH_PREFIX
    }

    /// Replace the published list. An oversized list is rejected before the
    /// region is touched, so readers keep seeing the previous one.
    pub fn write_objects(&mut self, objects: &[TrackedObject]) -> Result<(), BufferError> {
        let payload = serde_json::to_vec(objects)?;
        let capacity = self.capacity();
        if payload.len() > capacity {
            tracing::warn!(
                name = %self.name,
                needed = payload.len(),
                capacity,
                "Metadata too large for region"
            );
            return Err(BufferError::MetadataOverflow {
                needed: payload.len(),
                capacity,
            });
        }

        let _guard = self.lock.lock(self.lock_timeout).map_err(|e| match e {
            SemaphoreError::Timeout => BufferError::LockTimeout(self.name.clone()),
            other => other.into(),
        })?;
        let bytes = self.region.bytes_mut()?;
        bytes[LENGTH_PREFIX..LENGTH_PREFIX + payload.len()].copy_from_slice(&payload);
        bytes[..LENGTH_PREFIX].copy_from_slice(&(payload.len() as u32).to_le_bytes());

        tracing::trace!(name = %self.name, count = objects.len(), "Wrote metadata");
        Ok(())
    }

    pub fn read_objects(&self) -> Result<Vec<TrackedObject>, BufferError> {
        let _guard = self.lock.lock(self.lock_timeout).map_err(|e| match e {
            SemaphoreError::Timeout => BufferError::LockTimeout(self.name.clone()),
            other => other.into(),
        })?;
        let bytes = self.region.bytes()?;

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&bytes[..LENGTH_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > bytes.len() - LENGTH_PREFIX {
            return Err(BufferError::SizeMismatch {
                expected: bytes.len() - LENGTH_PREFIX,
                actual: len,
            });
        }

        Ok(serde_json::from_slice(&bytes[LENGTH_PREFIX..LENGTH_PREFIX + len])?)
    }

    pub fn close(&mut self) {
        self.region.close();
    }

    /// Close and remove the region and its lock. Repeated calls are fine.
    pub fn unlink(&mut self) -> Result<bool, BufferError> {
        let removed = self.region.unlink()?;
        Semaphore::unlink(&paths::metadata_lock_semaphore_name(&self.namespace, &self.name))?;
        Ok(removed)
    }

    pub fn unlink_by_name(config: &BusConfig, name: &str) -> Result<bool, BufferError> {
        paths::validate_name(name)?;
        let removed = MappedRegion::remove(&config.shm_dir, &paths::metadata_name(name))?;
        Semaphore::unlink(&paths::metadata_lock_semaphore_name(&config.namespace, name))?;
        Ok(removed)
    }
}

type Shared = Arc<Mutex<SharedMetadata>>;

fn lock_metadata(metadata: &Shared) -> MutexGuard<'_, SharedMetadata> {
    metadata.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local map of metadata regions, the counterpart of
/// [`crate::FrameRegistry`] for tracking records.
pub struct MetadataRegistry {
    config: BusConfig,
    regions: Mutex<HashMap<String, Shared>>,
}

impl MetadataRegistry {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_metadata(&self, name: &str, max_objects: usize) -> Result<(), BufferError> {
        let mut regions = self.regions();
        if regions.contains_key(name) {
            tracing::debug!(name, "Metadata already registered");
            return Ok(());
        }

        let metadata = SharedMetadata::create(&self.config, name, max_objects)?;
        regions.insert(name.to_string(), Arc::new(Mutex::new(metadata)));
        Ok(())
    }

    /// Publish `objects` under `name`, attaching to an existing region if needed.
    pub fn write_objects(&self, name: &str, objects: &[TrackedObject]) -> Result<(), BufferError> {
        let metadata = self
            .region_or_attach(name)?
            .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))?;
        lock_metadata(&metadata).write_objects(objects)
    }

    /// Current list for `name`, or `None` when no process has created it.
    pub fn read_objects(&self, name: &str) -> Result<Option<Vec<TrackedObject>>, BufferError> {
        match self.region_or_attach(name)? {
            Some(metadata) => lock_metadata(&metadata).read_objects().map(Some),
            None => Ok(None),
        }
    }

    pub fn close_all(&self) {
        let regions: Vec<(String, Shared)> = self.regions().drain().collect();
        for (name, metadata) in regions {
            lock_metadata(&metadata).close();
            tracing::debug!(name, "Closed shared metadata");
        }
    }

    pub fn cleanup_all(&self) -> CleanupReport {
        let regions: Vec<(String, Shared)> = self.regions().drain().collect();
        let mut report = CleanupReport::default();

        for (name, metadata) in regions {
            match lock_metadata(&metadata).unlink() {
                Ok(_) => report.cleaned += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(name, error = %e, "Failed to clean up shared metadata");
                }
            }
        }

        tracing::info!(
            cleaned = report.cleaned,
            errors = report.errors,
            "Metadata cleanup finished"
        );
        report
    }

    fn regions(&self) -> MutexGuard<'_, HashMap<String, Shared>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn region_or_attach(&self, name: &str) -> Result<Option<Shared>, BufferError> {
        let mut regions = self.regions();
        if let Some(metadata) = regions.get(name) {
            return Ok(Some(Arc::clone(metadata)));
        }

        match SharedMetadata::attach(&self.config, name) {
            Ok(metadata) => {
                let metadata = Arc::new(Mutex::new(metadata));
                regions.insert(name.to_string(), Arc::clone(&metadata));
                Ok(Some(metadata))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for MetadataRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
