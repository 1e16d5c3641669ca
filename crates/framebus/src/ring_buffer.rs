use crate::config::BusConfig;
use crate::control::Control;
use crate::errors::BufferError;
use crate::frame::{self, Frame, FrameShape, FrameStats};
use crate::paths;
use crate::region::{MappedRegion, Opened};
use crate::semaphore::{Semaphore, SemaphoreError, SemaphoreGuard};
use crate::shape::{InferredShape, ShapeSource, infer_shape};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// How this handle came to know the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Created,
    Attached,
    BlindAttached(ShapeSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Closed,
    Unlinked,
}

/// Two-slot ping-pong frame buffer shared between processes.
///
/// Slots live in `{name}_0` and `{name}_1`. A named semaphore initialized to 1
/// serializes every slot access and index update across processes, and a
/// second named semaphore signals "new frame" to [`RingBuffer::read`].
///
/// When the `{name}_ctl` control block is present the write index and
/// sequence are shared, so every handle agrees on which slot is newest.
/// Without it the handle keeps a local guess and [`RingBuffer::force_read`]
/// compares both slots to recover from a wrong guess. That recovery is
/// best-effort: a black or frozen scene looks the same as an empty slot.
pub struct RingBuffer {
    name: String,
    shape: FrameShape,
    slots: [MappedRegion; 2],
    control: Option<Control>,
    lock: Semaphore,
    ready: Semaphore,
    shm_dir: PathBuf,
    namespace: String,
    read_timeout: Duration,
    lock_timeout: Duration,
    local_write_index: usize,
    local_sequence: u64,
    last_read_sequence: u64,
    origin: Origin,
    state: BufferState,
}

impl RingBuffer {
    /// Allocate the buffer, or join it when another process already did.
    pub fn create(config: &BusConfig, name: &str, shape: FrameShape) -> Result<Self, BufferError> {
        paths::validate_name(name)?;
        if shape.is_empty() {
            return Err(BufferError::InvalidShape(shape));
        }

        let dir = config.shm_dir.as_path();
        let (mut slot0, opened0) =
            MappedRegion::create_or_attach(dir, &paths::slot_name(name, 0), shape.byte_len())?;
        let (slot1, opened1) =
            match MappedRegion::create_or_attach(dir, &paths::slot_name(name, 1), shape.byte_len()) {
                Ok(opened) => opened,
                Err(e) => {
                    if opened0 == Opened::Created {
                        slot0.unlink()?;
                    }
                    return Err(e);
                }
            };
        let fresh = opened0 == Opened::Created || opened1 == Opened::Created;

        let (control, opened_ctl) = Control::create_or_attach(dir, &paths::control_name(name))?;
        match control.shape() {
            // A live buffer with the same byte size but another layout
            Some(recorded) if !fresh && opened_ctl == Opened::Attached && recorded != shape => {
                return Err(BufferError::ShapeMismatch {
                    expected: recorded,
                    actual: shape,
                });
            }
            Some(_) if !fresh && opened_ctl == Opened::Attached => {}
            _ => control.initialize(shape)?,
        }

        let lock_name = paths::lock_semaphore_name(&config.namespace, name);
        let ready_name = paths::ready_semaphore_name(&config.namespace, name);
        if fresh {
            // Semaphores left behind by a crashed owner may be stuck at 0
            Semaphore::unlink(&lock_name)?;
            Semaphore::unlink(&ready_name)?;
        }
        let lock = Semaphore::ensure(&lock_name, 1)?;
        let ready = Semaphore::ensure(&ready_name, 0)?;

        let origin = if fresh {
            Origin::Created
        } else {
            Origin::Attached
        };
        tracing::debug!(name, %shape, ?origin, "Opened ring buffer for writing");

        Ok(Self::assemble(
            config,
            name,
            shape,
            [slot0, slot1],
            Some(control),
            lock,
            ready,
            origin,
        ))
    }

    /// Attach to an existing buffer whose shape the caller already knows.
    pub fn attach(config: &BusConfig, name: &str, shape: FrameShape) -> Result<Self, BufferError> {
        paths::validate_name(name)?;
        let dir = config.shm_dir.as_path();

        let slots = attach_slots(dir, name)?;
        for slot in &slots {
            if slot.size() != shape.byte_len() {
                return Err(BufferError::SizeMismatch {
                    expected: shape.byte_len(),
                    actual: slot.size(),
                });
            }
        }

        let control = attach_control(dir, name)?;
        if let Some(recorded) = control.as_ref().and_then(Control::shape)
            && recorded != shape
        {
            tracing::warn!(name, %recorded, requested = %shape, "Attaching with a shape that differs from the recorded one");
        }

        let (lock, ready) = open_semaphores(config, name)?;
        tracing::debug!(name, %shape, shared_index = control.is_some(), "Attached to ring buffer");

        Ok(Self::assemble(
            config,
            name,
            shape,
            slots,
            control,
            lock,
            ready,
            Origin::Attached,
        ))
    }

    /// Attach without knowing the shape, inferring it from the segment size.
    ///
    /// A region larger than the inferred shape is used through a prefix view;
    /// a smaller one cannot hold a frame and fails with
    /// [`BufferError::SizeMismatch`].
    pub fn blind_attach(config: &BusConfig, name: &str) -> Result<(Self, InferredShape), BufferError> {
        paths::validate_name(name)?;
        let dir = config.shm_dir.as_path();

        let slots = attach_slots(dir, name)?;
        let size = slots[0].size();
        if slots[1].size() != size {
            return Err(BufferError::SizeMismatch {
                expected: size,
                actual: slots[1].size(),
            });
        }

        let control = attach_control(dir, name)?;
        let inferred = infer_shape(size, control.as_ref().and_then(Control::shape));
        if inferred.shape.byte_len() > size {
            return Err(BufferError::SizeMismatch {
                expected: inferred.shape.byte_len(),
                actual: size,
            });
        }

        let (lock, ready) = open_semaphores(config, name)?;
        tracing::debug!(
            name,
            shape = %inferred.shape,
            source = ?inferred.source,
            shared_index = control.is_some(),
            "Blind-attached to ring buffer"
        );

        let buffer = Self::assemble(
            config,
            name,
            inferred.shape,
            slots,
            control,
            lock,
            ready,
            Origin::BlindAttached(inferred.source),
        );
        Ok((buffer, inferred))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: &BusConfig,
        name: &str,
        shape: FrameShape,
        slots: [MappedRegion; 2],
        control: Option<Control>,
        lock: Semaphore,
        ready: Semaphore,
        origin: Origin,
    ) -> Self {
        Self {
            name: name.to_string(),
            shape,
            slots,
            control,
            lock,
            ready,
            shm_dir: config.shm_dir.clone(),
            namespace: config.namespace.clone(),
            read_timeout: config.read_timeout,
            lock_timeout: config.lock_timeout,
            local_write_index: 0,
            local_sequence: 0,
            last_read_sequence: 0,
            origin,
            state: BufferState::Open,
        }
    }

    /// Copy `frame` into the next slot and publish it.
    ///
    /// Copy, index flip and the ready signal happen under one lock hold, so no
    /// reader can observe the flip before the copy or the signal before the flip.
    pub fn write(&mut self, frame: &Frame) -> Result<(), BufferError> {
        self.ensure_open()?;
        let actual = FrameShape::of(frame);
        if actual != self.shape {
            return Err(BufferError::ShapeMismatch {
                expected: self.shape,
                actual,
            });
        }

        let len = self.shape.byte_len();
        let _guard = acquire(&self.lock, self.lock_timeout, &self.name)?;

        let index = match &self.control {
            Some(control) => control.write_index()?,
            None => self.local_write_index,
        };
        frame::copy_frame_into(frame, &mut self.slots[index].bytes_mut()?[..len]);

        let sequence = match &self.control {
            Some(control) => control.publish(index)?,
            None => self.local_sequence + 1,
        };
        self.local_write_index = 1 - index;
        self.local_sequence = sequence;

        self.ready.raise()?;

        tracing::trace!(name = %self.name, slot = index, sequence, "Wrote frame");
        Ok(())
    }

    /// Wait up to the read timeout for a frame this handle has not returned yet.
    ///
    /// Single consumer only: the ready signal is consumed by whichever reader
    /// wakes first. Handles without a shared control block cannot tell new
    /// frames from old ones and always return `None`; use
    /// [`RingBuffer::force_read`] for them and for multiple readers.
    pub fn read(&mut self) -> Result<Option<Frame>, BufferError> {
        self.ensure_open()?;
        if self.control.is_none() {
            return Ok(None);
        }

        if !self.ready.wait_timeout(self.read_timeout)? {
            return Ok(None);
        }

        let _guard = acquire(&self.lock, self.lock_timeout, &self.name)?;
        let Some(control) = &self.control else {
            return Ok(None);
        };

        let sequence = control.sequence()?;
        if sequence == 0 || sequence == self.last_read_sequence {
            self.ready.drain()?;
            return Ok(None);
        }

        let index = 1 - control.write_index()?;
        let frame = self.slot_frame(index)?;
        self.last_read_sequence = sequence;
        self.ready.drain()?;

        Ok(Some(frame))
    }

    /// The most recently completed frame, regardless of whether it was read before.
    ///
    /// Never waits on the ready signal. Returns `None` only when a shared
    /// control block shows that nothing has been written yet.
    pub fn force_read(&mut self) -> Result<Option<Frame>, BufferError> {
        self.ensure_open()?;
        let _guard = acquire(&self.lock, self.lock_timeout, &self.name)?;

        if let Some(control) = &self.control {
            if control.sequence()? == 0 {
                return Ok(None);
            }
            let index = 1 - control.write_index()?;
            return Ok(Some(self.slot_frame(index)?));
        }

        let primary = 1 - self.local_write_index;
        let alternate = self.local_write_index;
        let len = self.shape.byte_len();

        let primary_stats = FrameStats::from_bytes(&self.slots[primary].bytes()?[..len]);
        let alternate_stats = FrameStats::from_bytes(&self.slots[alternate].bytes()?[..len]);

        if primary_stats.prefers(&alternate_stats) {
            tracing::debug!(
                name = %self.name,
                slot = alternate,
                primary_mean = primary_stats.mean,
                primary_variance = primary_stats.variance,
                "Switching to alternate slot"
            );
            // The alternate holds the newest frame, so the next write goes to the other slot
            self.local_write_index = primary;
            return Ok(Some(self.slot_frame(alternate)?));
        }

        Ok(Some(self.slot_frame(primary)?))
    }

    /// Drop this handle's mappings. The segments stay alive for other processes.
    pub fn close(&mut self) {
        if self.state != BufferState::Open {
            return;
        }
        for slot in &mut self.slots {
            slot.close();
        }
        if let Some(control) = &mut self.control {
            control.close();
        }
        self.state = BufferState::Closed;
        tracing::debug!(name = %self.name, "Closed ring buffer");
    }

    /// Close and destroy every OS object of the buffer. Safe to call repeatedly
    /// and from several handles.
    pub fn unlink(&mut self) -> Result<(), BufferError> {
        self.close();
        if self.state == BufferState::Unlinked {
            tracing::debug!(name = %self.name, "Ring buffer already unlinked");
            return Ok(());
        }

        for slot in &mut self.slots {
            slot.unlink()?;
        }
        match &mut self.control {
            Some(control) => {
                control.unlink()?;
            }
            None => {
                MappedRegion::remove(&self.shm_dir, &paths::control_name(&self.name))?;
            }
        }
        Semaphore::unlink(&paths::lock_semaphore_name(&self.namespace, &self.name))?;
        Semaphore::unlink(&paths::ready_semaphore_name(&self.namespace, &self.name))?;

        self.state = BufferState::Unlinked;
        tracing::debug!(name = %self.name, "Unlinked ring buffer");
        Ok(())
    }

    /// Destroy a buffer's OS objects without attaching to it.
    ///
    /// Returns `true` if any of its shared memory segments existed.
    pub fn unlink_by_name(config: &BusConfig, name: &str) -> Result<bool, BufferError> {
        paths::validate_name(name)?;
        let dir = config.shm_dir.as_path();

        let mut removed = false;
        for index in 0..2 {
            removed |= MappedRegion::remove(dir, &paths::slot_name(name, index))?;
        }
        removed |= MappedRegion::remove(dir, &paths::control_name(name))?;
        Semaphore::unlink(&paths::lock_semaphore_name(&config.namespace, name))?;
        Semaphore::unlink(&paths::ready_semaphore_name(&config.namespace, name))?;

        Ok(removed)
    }

    /// Whether the slot segments of `name` exist.
    pub fn exists(config: &BusConfig, name: &str) -> bool {
        (0..2).all(|i| MappedRegion::exists(&config.shm_dir, &paths::slot_name(name, i)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BufferState::Open
    }

    /// Whether the write index comes from a shared control block rather than a guess.
    pub fn has_shared_index(&self) -> bool {
        self.control.is_some()
    }

    /// Slot the next write targets, as this handle currently sees it.
    pub fn write_index(&self) -> Result<usize, BufferError> {
        match &self.control {
            Some(control) => control.write_index(),
            None => Ok(self.local_write_index),
        }
    }

    /// Completed writes, shared across processes when a control block exists.
    pub fn sequence(&self) -> Result<u64, BufferError> {
        match &self.control {
            Some(control) => control.sequence(),
            None => Ok(self.local_sequence),
        }
    }

    /// Time of the last completed write by any process, when recorded.
    pub fn last_write(&self) -> Option<SystemTime> {
        self.control.as_ref().and_then(Control::last_write)
    }

    fn slot_frame(&self, index: usize) -> Result<Frame, BufferError> {
        let bytes = self.slots[index].bytes()?;
        Ok(frame::frame_from_bytes(self.shape, bytes))
    }

    fn ensure_open(&self) -> Result<(), BufferError> {
        match self.state {
            BufferState::Open => Ok(()),
            _ => Err(BufferError::Closed(self.name.clone())),
        }
    }
}

fn acquire<'a>(
    lock: &'a Semaphore,
    timeout: Duration,
    name: &str,
) -> Result<SemaphoreGuard<'a>, BufferError> {
    lock.lock(timeout).map_err(|e| match e {
        SemaphoreError::Timeout => BufferError::LockTimeout(name.to_string()),
        other => other.into(),
    })
}

fn attach_slots(dir: &Path, name: &str) -> Result<[MappedRegion; 2], BufferError> {
    let slot0 = MappedRegion::attach(dir, &paths::slot_name(name, 0))?;
    let slot1 = MappedRegion::attach(dir, &paths::slot_name(name, 1))?;
    Ok([slot0, slot1])
}

/// The control block, if one exists and has been initialized.
fn attach_control(dir: &Path, name: &str) -> Result<Option<Control>, BufferError> {
    match Control::attach(dir, &paths::control_name(name)) {
        Ok(control) if control.is_initialized() => Ok(Some(control)),
        Ok(_) => Ok(None),
        Err(BufferError::NotFound(_)) | Err(BufferError::SizeMismatch { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn open_semaphores(config: &BusConfig, name: &str) -> Result<(Semaphore, Semaphore), BufferError> {
    let lock = Semaphore::ensure(&paths::lock_semaphore_name(&config.namespace, name), 1)?;
    let ready = Semaphore::ensure(&paths::ready_semaphore_name(&config.namespace, name), 0)?;
    Ok((lock, ready))
}
