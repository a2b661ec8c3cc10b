use std::fmt;

use tokio::sync::broadcast;

use crate::engine::MediaKind;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtcLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtcTag {
    Signaling,
    Rtc,
    Adapter,
}

impl fmt::Display for RtcTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcTag::Signaling => f.write_str("Signaling"),
            RtcTag::Rtc => f.write_str("RTC"),
            RtcTag::Adapter => f.write_str("Adapter"),
        }
    }
}

/// Events delivered to the application layer.
#[derive(Clone, Debug, PartialEq)]
pub enum DialogEvent {
    Connected,
    FatalConnectionError { reason: String },
    StreamUpdated { peer_id: String, kind: MediaKind },
    Rtc {
        level: RtcLevel,
        tag: RtcTag,
        time: String,
        message: String,
    },
}

/// Fan-out point for [`DialogEvent`]s, shared by every component of a client.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<DialogEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DialogEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DialogEvent) {
        // No receivers is fine: events are advisory.
        let _ = self.tx.send(event);
    }

    /// Emits a diagnostic event. `message` is only evaluated when someone
    /// is listening or the matching tracing level is enabled.
    pub fn rtc<F>(&self, level: RtcLevel, tag: RtcTag, message: F)
    where
        F: FnOnce() -> String,
    {
        let listening = self.tx.receiver_count() > 0;
        let traced = match level {
            RtcLevel::Info => tracing::enabled!(target: "dialog::rtc", tracing::Level::INFO),
            RtcLevel::Warn => tracing::enabled!(target: "dialog::rtc", tracing::Level::WARN),
            RtcLevel::Error => tracing::enabled!(target: "dialog::rtc", tracing::Level::ERROR),
        };
        if !listening && !traced {
            return;
        }

        let message = message();
        match level {
            RtcLevel::Info => tracing::info!(target: "dialog::rtc", tag = %tag, "{message}"),
            RtcLevel::Warn => tracing::warn!(target: "dialog::rtc", tag = %tag, "{message}"),
            RtcLevel::Error => tracing::error!(target: "dialog::rtc", tag = %tag, "{message}"),
        }
        if listening {
            let time = chrono::Local::now().format("%H:%M:%S").to_string();
            self.emit(DialogEvent::Rtc {
                level,
                tag,
                time,
                message,
            });
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_message_is_lazy_without_listeners() {
        let sink = EventSink::new();
        let mut evaluated = false;
        sink.rtc(RtcLevel::Info, RtcTag::Rtc, || {
            evaluated = true;
            "unused".to_string()
        });
        // No subscriber is installed in unit tests, so nothing is enabled.
        assert!(!evaluated);
    }

    #[tokio::test]
    async fn rtc_events_reach_subscribers() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.rtc(RtcLevel::Error, RtcTag::Signaling, || "Closed".into());
        match rx.recv().await.unwrap() {
            DialogEvent::Rtc {
                level,
                tag,
                message,
                ..
            } => {
                assert_eq!(level, RtcLevel::Error);
                assert_eq!(tag, RtcTag::Signaling);
                assert_eq!(message, "Closed");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
