//! Event-driven notifications for debate runs
//!
//! 1. **Event Types** (`types.rs`): the lifecycle events of a run, from
//!    start through each committed statement to the vote tally.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub with
//!    run / type filtering.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   RunLoop    │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use debate_coordination::events::{EventFilter, DebateEvent};
//!
//! let mut finished = engine
//!     .event_bus()
//!     .subscribe_filtered(EventFilter::new().run(&run_id).types(vec!["run_finished"]));
//! let event = finished.recv().await?;
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::DebateEvent;
