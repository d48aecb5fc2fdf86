//! State persistence for debate runs
//!
//! The event log is the durable source of truth of a run. Everything else
//! stored here is either static (the run record) or a cache that can be
//! rebuilt from the log (the snapshot), plus the write-once vote tally.
//!
//! - [`MemoryEventStore`]: in-process, for tests and embedded use
//! - [`FileEventStore`]: one directory per run, JSON lines for events
//!
//! # Usage
//!
//! ```ignore
//! use debate_coordination::state::{EventStore, FileEventStore, RunRecord};
//!
//! let store = FileEventStore::open("./debate-runs")?;
//! let record = RunRecord::new(config);
//! store.create_run(&record)?;
//! for event in store.events(&record.run_id)? {
//!     println!("{}: {}", event.speaker, event.content);
//! }
//! ```

pub mod file_store;
pub mod store;
pub mod types;

pub use file_store::FileEventStore;
pub use store::{EventStore, MemoryEventStore, SharedEventStore, StoreError, StoreResult};
pub use types::{RunId, RunRecord};
