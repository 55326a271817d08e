pub mod gate;
pub mod translator;

pub use gate::NotificationGate;
pub use translator::{translate, EventTranslator, Notification};
