//! Process-local map from logical buffer names to ring buffer handles.
//!
//! Construct one [`FrameRegistry`] at process start and share it by reference
//! (or `Arc`) with every component that publishes or consumes frames.

use crate::config::BusConfig;
use crate::errors::BufferError;
use crate::frame::{Frame, FrameShape};
use crate::resize;
use crate::ring_buffer::{Origin, RingBuffer};
use crate::shape::InferredShape;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

#[derive(Clone)]
struct Entry {
    shape: InferredShape,
    buffer: Arc<Mutex<RingBuffer>>,
}

impl Entry {
    fn new(buffer: RingBuffer, shape: InferredShape) -> Self {
        Self {
            shape,
            buffer: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of one registered buffer, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub name: String,
    pub shape: InferredShape,
    pub origin: Origin,
    pub shared_index: bool,
    pub sequence: u64,
    pub last_write: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cleaned: usize,
    pub errors: usize,
}

pub struct FrameRegistry {
    config: BusConfig,
    buffers: Mutex<HashMap<String, Entry>>,
}

impl FrameRegistry {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(BusConfig::from_env())
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a buffer for writing, creating its segments if needed.
    ///
    /// Shapes above the configured maximum are downscaled before allocation.
    /// Returns the shape actually allocated; a name already registered in this
    /// process keeps its existing handle and shape.
    pub fn create_ring_buffer(&self, name: &str, shape: FrameShape) -> Result<FrameShape, BufferError> {
        let mut buffers = self.buffers();
        if let Some(entry) = buffers.get(name) {
            tracing::debug!(name, shape = %entry.shape.shape, "Ring buffer already registered");
            return Ok(entry.shape.shape);
        }

        if shape.is_empty() {
            return Err(BufferError::InvalidShape(shape));
        }

        let capped = self.config.policy.cap_shape(shape);
        if capped != shape {
            tracing::warn!(name, requested = %shape, allocated = %capped, "Downscaling oversized ring buffer");
        }

        let buffer = RingBuffer::create(&self.config, name, capped)?;
        buffers.insert(name.to_string(), Entry::new(buffer, InferredShape::declared(capped)));

        tracing::info!(name, shape = %capped, "Registered ring buffer");
        Ok(capped)
    }

    /// Write a frame to a registered buffer, resizing it to the buffer's shape.
    pub fn write_frame(&self, name: &str, frame: &Frame) -> Result<(), BufferError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| BufferError::UnknownBuffer(name.to_string()))?;

        let fitted = resize::fit_frame(frame, entry.shape.shape, self.config.policy.aspect_tolerance)?;
        entry.lock().write(&fitted)
    }

    /// Next unread frame, waiting up to the read timeout. Single consumer per name.
    pub fn read_frame(&self, name: &str) -> Result<Option<Frame>, BufferError> {
        match self.entry_or_attach(name)? {
            Some(entry) => entry.lock().read(),
            None => Ok(None),
        }
    }

    /// Latest completed frame, blind-attaching when this process never registered `name`.
    ///
    /// `Ok(None)` means the buffer does not exist yet or holds no frame.
    pub fn force_read_frame(&self, name: &str) -> Result<Option<Frame>, BufferError> {
        match self.entry_or_attach(name)? {
            Some(entry) => entry.lock().force_read(),
            None => Ok(None),
        }
    }

    /// Make sure `name` is registered, blind-attaching if necessary.
    ///
    /// Returns how the shape was determined, or `None` when the segments don't exist.
    pub fn attach_existing(&self, name: &str) -> Result<Option<InferredShape>, BufferError> {
        Ok(self.entry_or_attach(name)?.map(|entry| entry.shape))
    }

    pub fn info(&self, name: &str) -> Option<BufferInfo> {
        let entry = self.entry(name)?;
        let buffer = entry.lock();
        Some(BufferInfo {
            name: name.to_string(),
            shape: entry.shape,
            origin: buffer.origin(),
            shared_index: buffer.has_shared_index(),
            sequence: buffer.sequence().unwrap_or(0),
            last_write: buffer.last_write(),
        })
    }

    /// Time since any process last wrote to `name`, when the buffer records it.
    ///
    /// Staleness policy is left to the caller.
    pub fn frame_age(&self, name: &str) -> Option<Duration> {
        let last_write = self.entry(name)?.lock().last_write()?;
        SystemTime::now().duration_since(last_write).ok()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.buffers().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every handle without destroying the segments.
    pub fn close_all(&self) {
        let entries: Vec<(String, Entry)> = self.buffers().drain().collect();
        for (name, entry) in entries {
            entry.lock().close();
            tracing::debug!(name, "Closed registered ring buffer");
        }
    }

    /// Unlink every registered buffer, continuing past failures.
    pub fn cleanup_all(&self) -> CleanupReport {
        let entries: Vec<(String, Entry)> = self.buffers().drain().collect();
        let mut report = CleanupReport::default();

        for (name, entry) in entries {
            match entry.lock().unlink() {
                Ok(()) => report.cleaned += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(name, error = %e, "Failed to clean up ring buffer");
                }
            }
        }

        tracing::info!(
            cleaned = report.cleaned,
            errors = report.errors,
            "Ring buffer cleanup finished"
        );
        report
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, name: &str) -> Option<Entry> {
        self.buffers().get(name).cloned()
    }

    fn entry_or_attach(&self, name: &str) -> Result<Option<Entry>, BufferError> {
        let mut buffers = self.buffers();
        if let Some(entry) = buffers.get(name) {
            return Ok(Some(entry.clone()));
        }

        let (buffer, inferred) = match RingBuffer::blind_attach(&self.config, name) {
            Ok(attached) => attached,
            Err(e) if e.is_not_found() => {
                tracing::debug!(name, "No shared memory for buffer yet");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if inferred.is_fallback() {
            tracing::warn!(name, shape = %inferred.shape, "Blind attach fell back to the default shape");
        } else {
            tracing::info!(name, shape = %inferred.shape, source = ?inferred.source, "Blind-attached ring buffer");
        }

        let entry = Entry::new(buffer, inferred);
        buffers.insert(name.to_string(), entry.clone());
        Ok(Some(entry))
    }
}

impl Drop for FrameRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
