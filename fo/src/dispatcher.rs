//! Inbound dispatcher - answers requests arriving on the direct channel

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::envelope::RequestEnvelope;
use crate::error::FanoutError;
use crate::registry::HandlerRegistry;

/// What the dispatcher did with one inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and its result was sent back
    Replied,
    /// No handler for the topic; nothing sent
    NoHandler,
    /// Handler failed; nothing sent
    HandlerFailed,
    /// Packet was not a request envelope
    Malformed,
    /// Reply could not be handed to the parent
    SendFailed,
}

/// Serves requests from sibling instances
pub struct Dispatcher {
    registry: HandlerRegistry,
    connection: Arc<ConnectionManager>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, connection: Arc<ConnectionManager>) -> Self {
        Self { registry, connection }
    }

    /// Answer one inbound packet
    ///
    /// Unknown topics and failing handlers are dropped silently from the
    /// requester's point of view; it will time out for this instance.
    pub async fn handle(&self, packet: Value) -> DispatchOutcome {
        let request = match RequestEnvelope::from_packet(packet) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dispatcher: ignoring packet that is not a request");
                return DispatchOutcome::Malformed;
            }
        };
        debug!(topic = %request.topic, request_id = %request.request_id, reply_to = ?request.target_instance_id, "Dispatcher::handle: called");

        let message = match self.registry.invoke(&request.topic, request.payload.clone()).await {
            Ok(message) => message,
            Err(FanoutError::HandlerNotFound(topic)) => {
                debug!(%topic, "Dispatcher: no handler, dropping request");
                return DispatchOutcome::NoHandler;
            }
            Err(e) => {
                warn!(topic = %request.topic, request_id = %request.request_id, error = %e, "Dispatcher: handler failed, no reply sent");
                return DispatchOutcome::HandlerFailed;
            }
        };

        let identity = self.connection.identity();
        if !identity.is_managed() {
            warn!(topic = %request.topic, "Dispatcher: replying without an instance id; requester will drop it");
        }

        let reply = request.reply(identity.instance_id, message);
        let sent = match reply.to_packet() {
            Ok(packet) => self
                .connection
                .manager()
                .send_to_parent(packet)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match sent {
            Ok(()) => {
                debug!(topic = %request.topic, request_id = %request.request_id, "Dispatcher: replied");
                DispatchOutcome::Replied
            }
            Err(e) => {
                warn!(topic = %request.topic, request_id = %request.request_id, error = %e, "Dispatcher: failed to send reply");
                DispatchOutcome::SendFailed
            }
        }
    }

    /// Serve an inbox until it closes
    ///
    /// Each request runs on its own task, so a slow handler only delays its own reply.
    pub fn spawn(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(instance_id = ?self.connection.identity().instance_id, "Dispatcher: serving inbound requests");
            while let Some(packet) = inbox.recv().await {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.handle(packet).await;
                });
            }
            info!("Dispatcher: inbox closed");
        })
    }
}
