// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! [`ConnectionManager`] owns the single broker connection and channel of the process.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                           Connecting --attempts exhausted--> Disconnected
//! Connected --unexpected close--> Disconnected --(detached)--> Connecting
//! Connected --close()--> Disconnected
//! ```
//!
//! Connection attempts back off exponentially from `reconnect_delay_ms`, capped at
//! `max_reconnect_delay_ms`. An individual attempt has no timeout of its own, so a hung
//! connect stalls the loop until the broker answers or the OS gives up.
//!
//! An explicit [`ConnectionManager::close`] is terminal for every connect or reconnect
//! already in flight: they give up at their next step, release any session they opened
//! and notify no listener.

use crate::{
    channel::{AmqpChannel, AmqpConnection, AmqpConnector, AmqpSession},
    config::RabbitMQConfigs,
    errors::AmqpError,
    message::Message,
};
use futures_util::future::BoxFuture;
use std::{
    fmt, ptr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, error, info, warn};

type ReconnectedCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&AmqpError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

struct Session {
    state: ConnectionState,
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    /// Bumped on every established session so stale close signals can be told apart
    generation: u64,
    /// Bumped on every explicit close; connects started under an older epoch give up
    epoch: u64,
}

/// What became of a freshly opened session.
enum Installed {
    Active(u64),
    /// Another connect got there first.
    Superseded,
    /// The manager was closed while connecting.
    Closed,
}

#[derive(Default)]
struct Listeners {
    reconnected: Vec<ReconnectedCallback>,
    error: Vec<ErrorCallback>,
}

struct Inner {
    connector: Arc<dyn AmqpConnector>,
    cfg: RabbitMQConfigs,
    session: Mutex<Session>,
    listeners: Mutex<Listeners>,
}

/// Owner of the broker connection and channel.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// # Parameters
    /// * `connector` - Opens broker sessions, [`crate::channel::LapinConnector`] in production
    /// * `cfg` - Broker address and reconnection policy
    pub fn new(connector: Arc<dyn AmqpConnector>, cfg: RabbitMQConfigs) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                connector,
                cfg,
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    connection: None,
                    channel: None,
                    generation: 0,
                    epoch: 0,
                }),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    /// Connects with bounded exponential backoff.
    ///
    /// Makes up to `reconnect_attempts + 1` attempts and fails with
    /// [`AmqpError::Connection`] once they are exhausted, or as soon as [`Self::close`]
    /// is called. Does nothing when already connected.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let epoch = {
            let session = self.inner.session();
            if session.state == ConnectionState::Connected {
                debug!("amqp connection already established");
                return Ok(());
            }
            session.epoch
        };

        Inner::connect(self.inner.clone(), epoch).await
    }

    /// The active channel, or [`AmqpError::Connection`] while disconnected.
    pub fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.inner
            .session()
            .channel
            .clone()
            .ok_or_else(|| AmqpError::connection("no active channel, call connect first"))
    }

    /// The channel `message` must be acknowledged on: the one it was delivered on, or
    /// the active channel for messages that carry none.
    pub fn channel_for(&self, message: &Message) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        match message.delivery_channel() {
            Some(channel) => Ok(channel.clone()),
            None => self.get_channel(),
        }
    }

    /// Whether `message` was delivered on the active channel.
    ///
    /// A message delivered on a channel that has since been replaced can no longer be
    /// acknowledged; the broker redelivers it on its own.
    pub fn is_current_delivery(&self, message: &Message) -> bool {
        let Some(channel) = message.delivery_channel() else {
            return true;
        };

        self.inner
            .session()
            .channel
            .as_ref()
            .is_some_and(|current| ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(channel)))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }

    /// Closes the channel, then the connection.
    ///
    /// The manager is `Disconnected` when this returns, whether or not closing failed.
    /// Neither the resulting close notification nor a connect still in flight brings
    /// the connection back.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let (channel, connection) = {
            let mut session = self.inner.session();
            session.state = ConnectionState::Disconnected;
            session.epoch += 1;
            (session.channel.take(), session.connection.take())
        };

        info!("closing amqp connection");

        let channel_result = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        let connection_result = match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        channel_result.and(connection_result)
    }

    /// Registers a callback fired after an automatic reconnection succeeds.
    pub fn on_reconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.listeners().reconnected.push(Arc::new(callback));
    }

    /// Registers a callback fired when an automatic reconnection gives up.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&AmqpError) + Send + Sync + 'static,
    {
        self.inner.listeners().error.push(Arc::new(callback));
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error() -> AmqpError {
        AmqpError::connection("connection manager closed while connecting")
    }

    fn is_closed_since(&self, epoch: u64) -> bool {
        self.session().epoch != epoch
    }

    fn connect(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, Result<(), AmqpError>> {
        Box::pin(async move {
            {
                let mut session = self.session();
                if session.epoch != epoch {
                    return Err(Self::closed_error());
                }
                if session.state != ConnectionState::Connected {
                    session.state = ConnectionState::Connecting;
                }
            }

            let max_attempts = self.cfg.reconnect_attempts.saturating_add(1);
            let mut last_error = None;

            for attempt in 0..max_attempts {
                info!(attempt = attempt + 1, max_attempts, "connecting to amqp broker");

                match self.connector.connect().await {
                    Ok(session) => return self.install(session, epoch).await,
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            attempt = attempt + 1,
                            max_attempts,
                            "failure to connect"
                        );
                        last_error = Some(err);

                        if attempt + 1 < max_attempts {
                            let delay = self.cfg.reconnect_delay(attempt);
                            info!(delay_ms = delay, "waiting before next connection attempt");
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                    }
                }

                if self.is_closed_since(epoch) {
                    info!("connection manager closed, abandoning connect");
                    return Err(Self::closed_error());
                }
            }

            {
                let mut session = self.session();
                if session.epoch == epoch && session.state == ConnectionState::Connecting {
                    session.state = ConnectionState::Disconnected;
                }
            }

            let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
            error!(
                error = last_error,
                max_attempts, "giving up connecting to amqp broker"
            );

            Err(AmqpError::connection(format!(
                "failed to connect after {} attempts",
                max_attempts
            ))
            .with_context("lastError", last_error)
            .with_context("attempts", max_attempts.to_string()))
        })
    }

    /// Makes `session` the active one unless the manager was closed or another connect
    /// already succeeded, in which case the session is released.
    async fn install(self: &Arc<Self>, session: AmqpSession, epoch: u64) -> Result<(), AmqpError> {
        let AmqpSession {
            connection,
            channel,
            closed,
        } = session;

        let installed = {
            let mut current = self.session();
            if current.epoch != epoch {
                Installed::Closed
            } else if current.state == ConnectionState::Connected {
                Installed::Superseded
            } else {
                current.generation += 1;
                current.state = ConnectionState::Connected;
                current.connection = Some(connection.clone());
                current.channel = Some(channel.clone());
                Installed::Active(current.generation)
            }
        };

        match installed {
            Installed::Active(generation) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    // A dropped sender means the connection was released, not lost.
                    if let Ok(reason) = closed.await {
                        inner.handle_unexpected_close(generation, reason);
                    }
                });
                info!(generation, "amqp connection established");
                Ok(())
            }
            Installed::Superseded => {
                debug!("amqp connection already established elsewhere, releasing the new one");
                release(channel, connection).await;
                Ok(())
            }
            Installed::Closed => {
                info!("connection manager closed while connecting, releasing the new session");
                release(channel, connection).await;
                Err(Self::closed_error())
            }
        }
    }

    fn handle_unexpected_close(self: &Arc<Self>, generation: u64, reason: String) {
        let (epoch, stale) = {
            let mut session = self.session();
            if session.state != ConnectionState::Connected || session.generation != generation {
                return;
            }

            warn!(reason, "amqp connection closed unexpectedly");
            session.channel = None;
            session.state = ConnectionState::Disconnected;
            (session.epoch, session.connection.take())
        };

        self.spawn_reconnect(epoch, stale);
    }

    /// Only one reconnection runs per lost session: the close signal is acted on while
    /// `Connected`, and the state is not `Connected` again until a new session exists.
    fn spawn_reconnect(self: &Arc<Self>, epoch: u64, stale: Option<Arc<dyn AmqpConnection>>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Some(connection) = stale {
                if let Err(err) = connection.close().await {
                    debug!(error = err.to_string(), "stale amqp connection already gone");
                }
            }

            let result = inner.clone().connect(epoch).await;

            if inner.is_closed_since(epoch) {
                info!("connection manager closed during reconnection, listeners not notified");
                return;
            }

            match result {
                Ok(()) => {
                    info!("amqp connection re-established");
                    let callbacks = inner.listeners().reconnected.clone();
                    for callback in callbacks {
                        callback();
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to re-establish amqp connection");
                    let callbacks = inner.listeners().error.clone();
                    for callback in callbacks {
                        callback(&err);
                    }
                }
            }
        });
    }
}

async fn release(channel: Arc<dyn AmqpChannel>, connection: Arc<dyn AmqpConnection>) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to release channel");
    }
    if let Err(err) = connection.close().await {
        debug!(error = err.to_string(), "failure to release connection");
    }
}
