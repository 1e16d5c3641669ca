use crate::errors::BufferError;
use crate::frame::FrameShape;
use crate::region::{MappedRegion, Opened};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// "FBUS" in little-endian, written last during initialization.
pub const CONTROL_MAGIC: u32 = 0x5355_4246;

/// Shared state of one ring buffer, living in its `{name}_ctl` region.
///
/// Every field is read and written under the ring's cross-process mutex;
/// the atomics only guarantee that a process attaching mid-initialization
/// never reads a torn word. `magic` is stored last with `Release` so a
/// reader that sees it with `Acquire` also sees the shape fields.
///
/// `write_index` names the slot the next write goes to, so the most
/// recently completed frame is always in slot `1 - write_index`.
#[repr(C, align(8))]
pub struct ControlBlock {
    pub magic: AtomicU32,
    pub write_index: AtomicU32,
    /// Completed writes since creation. 0 means "nothing written yet".
    pub sequence: AtomicU64,
    pub height: AtomicU32,
    pub width: AtomicU32,
    pub channels: AtomicU32,
    pub reserved: AtomicU32,
    /// Wall clock of the last completed write, nanoseconds since the epoch.
    pub last_write_ns: AtomicU64,
}

impl ControlBlock {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// A mapped control region.
pub(crate) struct Control {
    region: MappedRegion,
}

impl Control {
    pub fn create_or_attach(dir: &Path, name: &str) -> Result<(Self, Opened), BufferError> {
        let (region, opened) = MappedRegion::create_or_attach(dir, name, ControlBlock::SIZE)?;
        Ok((Self { region }, opened))
    }

    pub fn attach(dir: &Path, name: &str) -> Result<Self, BufferError> {
        let region = MappedRegion::attach(dir, name)?;
        if region.size() < ControlBlock::SIZE {
            return Err(BufferError::SizeMismatch {
                expected: ControlBlock::SIZE,
                actual: region.size(),
            });
        }
        Ok(Self { region })
    }

    fn block(&self) -> Result<&ControlBlock, BufferError> {
        let bytes = self.region.bytes()?;
        // mmap returns page-aligned memory at least SIZE bytes long
        Ok(unsafe { &*(bytes.as_ptr() as *const ControlBlock) })
    }

    /// Reset the block for a freshly allocated buffer: slot 0 next, nothing written.
    pub fn initialize(&self, shape: FrameShape) -> Result<(), BufferError> {
        let block = self.block()?;
        block.write_index.store(0, Ordering::Relaxed);
        block.sequence.store(0, Ordering::Relaxed);
        block.height.store(shape.height as u32, Ordering::Relaxed);
        block.width.store(shape.width as u32, Ordering::Relaxed);
        block.channels.store(shape.channels as u32, Ordering::Relaxed);
        block.last_write_ns.store(0, Ordering::Relaxed);
        block.magic.store(CONTROL_MAGIC, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.block()
            .map(|b| b.magic.load(Ordering::Acquire) == CONTROL_MAGIC)
            .unwrap_or(false)
    }

    /// The shape recorded by the creator, if the block has been initialized.
    pub fn shape(&self) -> Option<FrameShape> {
        let block = self.block().ok()?;
        if block.magic.load(Ordering::Acquire) != CONTROL_MAGIC {
            return None;
        }
        Some(FrameShape::new(
            block.height.load(Ordering::Relaxed) as usize,
            block.width.load(Ordering::Relaxed) as usize,
            block.channels.load(Ordering::Relaxed) as usize,
        ))
    }

    pub fn write_index(&self) -> Result<usize, BufferError> {
        Ok((self.block()?.write_index.load(Ordering::Acquire) & 1) as usize)
    }

    pub fn sequence(&self) -> Result<u64, BufferError> {
        Ok(self.block()?.sequence.load(Ordering::Acquire))
    }

    /// Record a completed write into `written_index`, flipping the next target.
    ///
    /// Returns the new sequence number.
    pub fn publish(&self, written_index: usize) -> Result<u64, BufferError> {
        let block = self.block()?;
        block
            .write_index
            .store((1 - written_index) as u32, Ordering::Release);
        block.last_write_ns.store(now_ns(), Ordering::Release);
        let sequence = block.sequence.load(Ordering::Acquire) + 1;
        block.sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    pub fn last_write(&self) -> Option<SystemTime> {
        let ns = self.block().ok()?.last_write_ns.load(Ordering::Acquire);
        (ns != 0).then(|| UNIX_EPOCH + Duration::from_nanos(ns))
    }

    pub fn close(&mut self) {
        self.region.close();
    }

    pub fn unlink(&mut self) -> Result<bool, BufferError> {
        self.region.unlink()
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_control_block_layout() {
        assert_eq!(std::mem::align_of::<ControlBlock>(), 8);
        assert_eq!(ControlBlock::SIZE, 40);
    }

    #[test]
    fn test_uninitialized_block_has_no_shape() {
        let dir = tempdir().unwrap();
        let (control, opened) = Control::create_or_attach(dir.path(), "cam_ctl").unwrap();
        assert_eq!(opened, Opened::Created);
        assert!(!control.is_initialized());
        assert_eq!(control.shape(), None);
        assert_eq!(control.last_write(), None);
    }

    #[test]
    fn test_publish_flips_index_and_counts() {
        let dir = tempdir().unwrap();
        let shape = FrameShape::rgb(480, 640);
        let (control, _) = Control::create_or_attach(dir.path(), "cam_ctl").unwrap();
        control.initialize(shape).unwrap();

        assert_eq!(control.shape(), Some(shape));
        assert_eq!(control.write_index().unwrap(), 0);
        assert_eq!(control.sequence().unwrap(), 0);

        assert_eq!(control.publish(0).unwrap(), 1);
        assert_eq!(control.write_index().unwrap(), 1);
        assert_eq!(control.publish(1).unwrap(), 2);
        assert_eq!(control.write_index().unwrap(), 0);
        assert!(control.last_write().is_some());
    }

    #[test]
    fn test_attached_handle_sees_published_state() {
        let dir = tempdir().unwrap();
        let shape = FrameShape::rgb(2, 2);
        let (writer, _) = Control::create_or_attach(dir.path(), "cam_ctl").unwrap();
        writer.initialize(shape).unwrap();
        writer.publish(0).unwrap();

        let reader = Control::attach(dir.path(), "cam_ctl").unwrap();
        assert_eq!(reader.shape(), Some(shape));
        assert_eq!(reader.write_index().unwrap(), 1);
        assert_eq!(reader.sequence().unwrap(), 1);
    }
}
