//! Download events and their subscriptions.
//!
//! Every event names the download it belongs to. Subscribers get their own
//! unbounded channel, optionally filtered to a single download id, so a slow
//! reader never stalls a transfer and never misses an event. Dropping a
//! [`Subscription`] unsubscribes it.

use crate::types::DownloadId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "download-progress")]
    Progress {
        /// Percentage in `[0, 100]`; `0` while the total size is unknown.
        progress: f64,
        /// Bytes per second.
        speed: f64,
        downloaded: u64,
        total: Option<u64>,
    },
    #[serde(rename = "download-complete")]
    Complete { filename: String, path: PathBuf },
    #[serde(rename = "download-error")]
    Error { error: String },
    #[serde(rename = "download-paused")]
    Paused { downloaded: u64 },
    #[serde(rename = "download-resumed")]
    Resumed { downloaded: u64 },
    /// Resume was not possible; `discarded` bytes were thrown away.
    #[serde(rename = "download-restarted")]
    Restarted { discarded: u64 },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Progress { .. } => "download-progress",
            EventKind::Complete { .. } => "download-complete",
            EventKind::Error { .. } => "download-error",
            EventKind::Paused { .. } => "download-paused",
            EventKind::Resumed { .. } => "download-resumed",
            EventKind::Restarted { .. } => "download-restarted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Complete { .. } | EventKind::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub download_id: DownloadId,
    #[serde(flatten)]
    pub kind: EventKind,
}

struct Subscriber {
    filter: Option<DownloadId>,
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Events published after this call are delivered.
    pub fn subscribe(&self, filter: Option<DownloadId>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { filter, tx });
        Subscription { rx }
    }

    pub fn publish(&self, event: DownloadEvent) {
        tracing::trace!("{} for {}", event.kind.name(), event.download_id);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if sub
                .filter
                .as_ref()
                .is_some_and(|id| *id != event.download_id)
            {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers.len()
    }
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl Subscription {
    /// Next event, or `None` once the supervisor is gone.
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paused(id: &str) -> DownloadEvent {
        DownloadEvent {
            download_id: DownloadId::from(id),
            kind: EventKind::Paused { downloaded: 10 },
        }
    }

    #[test]
    fn test_filtered_subscription_sees_only_its_job() {
        let hub = EventHub::new();
        let mut all = hub.subscribe(None);
        let mut only_a = hub.subscribe(Some(DownloadId::from("a")));

        hub.publish(paused("a"));
        hub.publish(paused("b"));

        assert_eq!(all.try_recv().unwrap().download_id.as_str(), "a");
        assert_eq!(all.try_recv().unwrap().download_id.as_str(), "b");
        assert_eq!(only_a.try_recv().unwrap().download_id.as_str(), "a");
        assert!(only_a.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let hub = EventHub::new();
        let sub = hub.subscribe(None);
        let _keep = hub.subscribe(Some(DownloadId::from("x")));
        assert_eq!(hub.subscriber_count(), 2);

        drop(sub);
        hub.publish(paused("a"));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_event_wire_format() {
        let event = DownloadEvent {
            download_id: DownloadId::from("17"),
            kind: EventKind::Progress {
                progress: 50.0,
                speed: 1024.0,
                downloaded: 512,
                total: Some(1024),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "download-progress");
        assert_eq!(json["downloadId"], "17");
        assert_eq!(json["downloaded"], 512);
        assert_eq!(json["total"], 1024);

        let back: DownloadEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
