//! Hooks Module
//!
//! Extension points the broker calls at connection and message boundaries.
//! Every method has a default, so an implementation overrides only what it
//! needs. The defaults accept every client and ignore every event.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::QoS;


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// The hook could not decide; CONNACK 3 (server unavailable)
    Internal(String),
    /// Credentials were checked and rejected; CONNACK 4
    AuthenticationFailed,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Decide whether a CONNECT is accepted
    ///
    /// `Ok(false)` refuses the connection with CONNACK return code 5 (not
    /// authorized). Errors map as documented on [`HookError`].
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called once a CONNECT has been accepted, before CONNACK is written
    async fn on_client_connected(&self, _client_id: &str) {}

    /// Called once per connection after its subscriptions are removed.
    /// `graceful` is true when the client sent DISCONNECT.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called after a publish has been routed to its subscribers
    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Lets `Arc`-wrapped hook providers be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_authenticate(client_id, username, password)
            .await
    }

    async fn on_client_connected(&self, client_id: &str) {
        (**self).on_client_connected(client_id).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        (**self).on_message_published(topic, payload, qos).await;
    }
}
