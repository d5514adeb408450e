//! Recording: bounded frame queue drained to the backing store by a worker thread

mod writer;

pub use writer::{
    FrameProducer, FrameWriter, RecordingSummary, WriterConfig, WriterStats, WriterStopHandle,
};
