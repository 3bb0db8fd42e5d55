//! User notifications for terminal analysis states.
//!
//! Delivery is fire-and-forget: the pipeline never waits on or fails with a
//! notification backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::types::{RequestId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Completed { request_id: RequestId, message: String },
    Failed { request_id: RequestId, message: String },
}

impl AnalysisEvent {
    /// Notification copy truncates the query so long questions don't flood
    /// the channel.
    pub fn completed(request_id: RequestId, query: &str) -> Self {
        AnalysisEvent::Completed {
            request_id,
            message: format!("Analysis complete: {}", truncate(query, 50)),
        }
    }

    pub fn failed(request_id: RequestId, query: &str, reason: &str) -> Self {
        AnalysisEvent::Failed {
            request_id,
            message: format!("Analysis failed: {} ({reason})", truncate(query, 50)),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, event: AnalysisEvent);
}

/// Logs events; the default when no delivery backend is wired.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: UserId, event: AnalysisEvent) {
        match &event {
            AnalysisEvent::Completed {
                request_id,
                message,
            } => info!(%user_id, %request_id, %message, "analysis completed"),
            AnalysisEvent::Failed {
                request_id,
                message,
            } => info!(%user_id, %request_id, %message, "analysis failed"),
        }
    }
}

/// Records events for test assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(UserId, AnalysisEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(UserId, AnalysisEvent)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: UserId, event: AnalysisEvent) {
        self.events.lock().push((user_id, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_truncate_long_queries() {
        let id = RequestId::new();
        let long_query = "why ".repeat(40);
        if let AnalysisEvent::Completed { message, .. } = AnalysisEvent::completed(id, &long_query)
        {
            assert!(message.len() < long_query.len());
            assert!(message.ends_with("..."));
        } else {
            panic!("wrong event variant");
        }
    }

    #[tokio::test]
    async fn recording_notifier_captures_events() {
        let notifier = RecordingNotifier::new();
        let user = uuid::Uuid::new_v4();
        let id = RequestId::new();
        notifier
            .notify(user, AnalysisEvent::failed(id, "short query", "sandbox timeout"))
            .await;

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, user);
        assert!(matches!(events[0].1, AnalysisEvent::Failed { .. }));
    }
}
