use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use super::{ClientInner, SessionParts};
use crate::events::{RtcLevel, RtcTag};
use crate::signaling::{ServerNotification, ServerRequest, SignalingEvent};

/// Routes one session's signaling events until the channel closes or the
/// session is torn down.
pub(super) async fn run(
    client: Weak<ClientInner>,
    parts: Weak<SessionParts>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = parts.upgrade() else {
            return;
        };
        match event {
            SignalingEvent::Notification(notification) => {
                on_notification(&session, notification);
            }
            SignalingEvent::Request(incoming) => {
                let (request, responder) = incoming.into_parts();
                match request {
                    ServerRequest::NewConsumer(new_consumer) => {
                        let session = Arc::clone(&session);
                        tokio::spawn(async move {
                            let transport = session.transports.recv_transport();
                            if let Err(err) = session
                                .consumers
                                .handle_new_consumer(transport, new_consumer, responder)
                                .await
                            {
                                tracing::warn!(
                                    target: "dialog::consumer",
                                    generation = session.scope.generation(),
                                    error = %err,
                                    "newConsumer not accepted"
                                );
                            }
                        });
                    }
                    ServerRequest::Unknown { method, .. } => {
                        tracing::debug!(target: "dialog::session", method = %method, "unsupported server request");
                        responder.reject(501, format!("unsupported method '{method}'"));
                    }
                }
            }
            SignalingEvent::Error(err) => {
                session
                    .events
                    .rtc(RtcLevel::Error, RtcTag::Signaling, || format!("Error: {err}"));
            }
            SignalingEvent::Closed { locally_initiated } => {
                if !locally_initiated && session.scope.cancel() {
                    session
                        .events
                        .rtc(RtcLevel::Warn, RtcTag::Signaling, || "Closed".to_string());
                    if let Some(client) = client.upgrade() {
                        let generation = session.scope.generation();
                        tokio::spawn(client.handle_channel_lost(generation));
                    }
                }
                return;
            }
        }
    }
}

fn on_notification(session: &SessionParts, notification: ServerNotification) {
    match notification {
        ServerNotification::NewProducer { producer_id } => {
            session.consumers.handle_new_producer(&producer_id);
        }
        ServerNotification::ProducerClosed { producer_id } => {
            let closed = session.consumers.handle_producer_closed(&producer_id);
            tracing::debug!(target: "dialog::consumer", producer_id = %producer_id, closed, "producer closed");
        }
        ServerNotification::ConsumerClosed { consumer_id } => {
            session.consumers.remove(&consumer_id);
        }
        ServerNotification::DownlinkBwe(value) => {
            session.consumers.set_downlink_bwe(value);
        }
        ServerNotification::Unknown { method, .. } => {
            tracing::trace!(target: "dialog::session", method = %method, "ignoring notification");
        }
    }
}
