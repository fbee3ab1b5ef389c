use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

/// Published after any operation that added, replaced or removed credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsChanged {
    pub profile_id: Option<String>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CredentialsChanged>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CredentialsChanged> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        receiver
    }

    pub fn broadcast(&self, event: CredentialsChanged) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
