//! Correlated requests over the connection
//!
//! Each request carries a fresh `id`. The dispatcher completes the matching
//! [`PendingRequests`] entry when an `ACK`, a correlated reply or an
//! `OPERATION_FAILED` with that id arrives.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use convene_core::PendingRequests;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::Operation;

pub(crate) type Pending = PendingRequests<Value, Error>;

/// A registered request waiting for its reply
pub(crate) struct Ticket {
    pub id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

#[derive(Clone)]
pub(crate) struct Signaling {
    connection: Connection,
    pending: Arc<Pending>,
    request_timeout: Option<Duration>,
}

impl Signaling {
    pub fn new(connection: Connection, request_timeout: Option<Duration>) -> Self {
        Self {
            connection,
            pending: Arc::new(Pending::new()),
            request_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    /// Register a fresh correlation id
    pub fn register(&self) -> Result<Ticket> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.add(id.clone(), move |result| {
            let _ = tx.send(result);
        })?;
        Ok(Ticket { id, rx })
    }

    /// Wait for the reply to `ticket`, bounded by the request timeout
    pub async fn wait(&self, ticket: Ticket) -> Result<Value> {
        let Ticket { id, rx } = ticket;
        let reply = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(request_id = %id, "Request timed out");
                    self.pending.reject(&id, Error::Timeout(id.clone()));
                    return Err(Error::Timeout(format!("No reply to request {}", id)));
                }
            },
            None => rx.await,
        };
        reply.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Send `payload` under `name` with an `id` field added and wait for the
    /// reply. `payload` must serialize to a JSON object.
    pub async fn request_named(&self, name: &str, payload: impl Serialize) -> Result<Value> {
        let mut payload = serde_json::to_value(payload)?;
        let Some(fields) = payload.as_object_mut() else {
            return Err(Error::Protocol(format!(
                "{} payload must be a JSON object",
                name
            )));
        };
        let ticket = self.register()?;
        fields.insert("id".into(), Value::String(ticket.id.clone()));

        debug!(request = name, request_id = %ticket.id, "Sending request");
        if let Err(e) = self.connection.send(name, &payload) {
            self.pending.reject(&ticket.id, Error::NotConnected);
            return Err(e);
        }
        self.wait(ticket).await
    }

    pub async fn request(&self, operation: Operation, payload: impl Serialize) -> Result<Value> {
        self.request_named(operation.as_str(), payload).await
    }

    /// Fire-and-forget message
    pub fn send(&self, name: &str, payload: impl Serialize) -> Result<()> {
        self.connection.send(name, payload)
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.connection.send_binary(bytes)
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.pending.resolve(id, value)
    }

    pub fn reject(&self, id: &str, err: Error) -> bool {
        self.pending.reject(id, err)
    }
}
