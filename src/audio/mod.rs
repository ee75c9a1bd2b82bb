//! Audio relay and output

pub mod buffer;
#[cfg(feature = "device-output")]
pub mod playback;
pub mod sink;

pub use buffer::{create_shared_queue, AudioFrame, AudioRelayQueue, SharedRelayQueue};
#[cfg(feature = "device-output")]
pub use playback::DeviceSink;
pub use sink::{AudioSink, NullSink, SinkStats, SinkWorker};
