pub mod external;
pub mod pool;
pub mod record;
pub mod store;
pub mod sync;

pub use external::ArcoBackend;
pub use pool::{ConnectionManager, ConnectionPool, PooledConnection, SqliteManager};
pub use record::AccountingRecord;
pub use store::{FinishedStore, SyncCursor};
pub use sync::{AccountingSynchronizer, PassOutcome};
