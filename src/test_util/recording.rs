use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time;

use crate::ids::MemberId;
use crate::membership::member_events::{MemberEvent, MemberListener};
use crate::message::{MessageListener, ReceivedMessage};

/// A member listener that records the events it receives as `(member id, joined)`
#[derive(Default)]
pub struct RecordingMemberListener {
    events: Mutex<Vec<(MemberId, bool)>>,
}

impl RecordingMemberListener {
    pub fn new() -> Arc<RecordingMemberListener> {
        Arc::new(RecordingMemberListener::default())
    }

    pub fn events(&self) -> Vec<(MemberId, bool)> {
        self.events.lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn joined(&self) -> Vec<MemberId> {
        self.events().into_iter()
            .filter(|(_, joined)| *joined)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn left(&self) -> Vec<MemberId> {
        self.events().into_iter()
            .filter(|(_, joined)| !*joined)
            .map(|(id, _)| id)
            .collect()
    }
}

impl MemberListener for RecordingMemberListener {
    fn on_member_event(&self, event: &MemberEvent) {
        let entry = (event.member().id(), matches!(event, MemberEvent::Joined(_)));
        if let Ok(mut events) = self.events.lock() {
            events.push(entry);
        }
    }
}

#[derive(Default)]
pub struct RecordingMessageListener {
    messages: Mutex<Vec<ReceivedMessage>>,
}

impl RecordingMessageListener {
    pub fn new() -> Arc<RecordingMessageListener> {
        Arc::new(RecordingMessageListener::default())
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages().iter()
            .map(|m| m.payload.to_vec())
            .collect()
    }

    /// Waits until at least `n` messages were received, polling in steps of 10ms. Returns
    ///  `false` if that did not happen within `timeout`.
    pub async fn await_messages(&self, n: usize, timeout: Duration) -> bool {
        let polling = async {
            while self.messages().len() < n {
                time::sleep(Duration::from_millis(10)).await;
            }
        };
        time::timeout(timeout, polling).await.is_ok()
    }
}

impl MessageListener for RecordingMessageListener {
    fn on_message(&self, message: &ReceivedMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.clone());
        }
    }
}
