pub mod accumulator;
pub mod analysis;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod history;
pub mod hotness;
pub mod record;
pub mod snapshot;
pub mod source;
pub mod streaming;

pub use accumulator::{AccumulatorRegistry, LockContentionAccumulator};
pub use analysis::ContentionAnalyzer;
pub use capture::SnapshotCapture;
pub use config::Config;
pub use engine::{ContentionState, EngineReport, EngineStats, LockscopeEngine};
pub use error::{TransportError, TransportResult};
pub use graph::{Deadlock, WaitForGraph};
pub use history::{HistoryStore, LockHistory, ThreadHistory};
pub use hotness::LockHotnessWave;
pub use record::{ContentionRecord, ContentionSummary, LockContentionReport, ProfilingWindow};
pub use snapshot::{LockEvent, LockKind, StackFrame, ThreadId, ThreadSnapshot, ThreadState};
pub use source::{ReplaySource, SnapshotSource, SyntheticSource};
pub use streaming::{MemoryTransport, SnapshotConsumer, SnapshotProducer, Transport};
