pub mod config;
mod control;
pub mod errors;
pub mod frame;
pub mod metadata;
pub mod paths;
pub mod region;
pub mod registry;
pub mod resize;
pub mod ring_buffer;
pub mod semaphore;
pub mod shape;

pub use config::{BusConfig, FramePolicy};
pub use control::{CONTROL_MAGIC, ControlBlock};
pub use errors::BufferError;
pub use frame::{Frame, FrameShape, FrameStats, placeholder_frame};
pub use metadata::{BoundingBox, MetadataRegistry, SharedMetadata, TrackedObject};
pub use region::{MappedRegion, Opened};
pub use registry::{BufferInfo, CleanupReport, FrameRegistry};
pub use ring_buffer::{BufferState, Origin, RingBuffer};
pub use semaphore::{Semaphore, SemaphoreError};
pub use shape::{InferredShape, ShapeSource, infer_shape};
