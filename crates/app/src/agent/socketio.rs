//! Socket.IO implementation of [`ChannelTransport`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use rust_socketio::{ClientBuilder, Event, Payload, RawClient, client::Client};
use serde_json::Value;
use tracing::debug;

use crate::agent::channel::{ChannelError, ChannelTransport, HandlerRegistry, InboundKind};

pub struct SocketIoTransport {
    url: String,
    client: Mutex<Option<Client>>,
}

impl SocketIoTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Client>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First argument of an event, or `null`.
fn first_argument(payload: Payload) -> Value {
    match payload {
        Payload::Text(values) => values.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

impl ChannelTransport for SocketIoTransport {
    fn connect(&self, handlers: HandlerRegistry) -> Result<(), ChannelError> {
        let mut builder = ClientBuilder::new(self.url.as_str()).reconnect(true);

        for kind in InboundKind::ALL {
            let Some(handler) = handlers.handler(kind) else {
                continue;
            };
            let event: Event = match (kind, kind.event_name()) {
                (_, Some(name)) => Event::from(name),
                (InboundKind::Connected, None) => Event::Connect,
                (_, None) => Event::Close,
            };
            builder = builder.on(event, move |payload: Payload, _socket: RawClient| {
                handler(first_argument(payload));
            });
        }
        builder = builder.on(Event::Error, |payload: Payload, _socket: RawClient| {
            debug!("Socket.IO error event: {:?}", first_argument(payload));
        });

        let client = builder.connect().map_err(|err| ChannelError::Connect {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        *self.lock() = Some(client);
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let guard = self.lock();
        let client = guard.as_ref().ok_or(ChannelError::NotConnected)?;
        client
            .emit(event, payload)
            .map_err(|err| ChannelError::Emit(err.to_string()))
    }

    fn disconnect(&self) -> Result<(), ChannelError> {
        let Some(client) = self.lock().take() else {
            return Ok(());
        };
        client
            .disconnect()
            .map_err(|err| ChannelError::Emit(err.to_string()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
