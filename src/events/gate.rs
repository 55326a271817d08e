use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::master::{EventSource, Subscription};

/// Event source for notifications pushed over HTTP. Pushed notifications are
/// only accepted while the liveness monitor holds the gate's subscription.
#[derive(Debug, Clone, Default)]
pub struct NotificationGate {
    open: Arc<AtomicBool>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct GateSubscription {
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for GateSubscription {
    async fn close(self: Box<Self>) -> Result<()> {
        self.open.store(false, Ordering::Release);
        tracing::debug!("Notification gate closed");
        Ok(())
    }
}

#[async_trait]
impl EventSource for NotificationGate {
    fn name(&self) -> &str {
        "http-notifications"
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        self.open.store(true, Ordering::Release);
        tracing::debug!("Notification gate opened");
        Ok(Box::new(GateSubscription {
            open: self.open.clone(),
        }))
    }
}
