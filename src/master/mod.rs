pub mod monitor;
pub mod probe;

use async_trait::async_trait;

use crate::error::Result;

pub use monitor::LivenessMonitor;
pub use probe::TcpProbe;

/// A lightweight reachability check against the qmaster.
#[async_trait]
pub trait MasterProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// A stream of lifecycle notifications that must be (re)opened whenever the
/// qmaster comes back.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

/// An open subscription returned by [`EventSource::subscribe`].
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn close(self: Box<Self>) -> Result<()>;
}
