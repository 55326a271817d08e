pub mod filter;
pub mod handle;
pub mod state;
pub mod tracker;

pub use filter::JobFilter;
pub use handle::JobHandle;
pub use state::{FinishedRecord, JobEvent, LifecycleState, KILLED_EXIT_STATUS};
pub use tracker::{JobTracker, Lookup, TrackedJob};
