// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Test doubles shared by the unit tests.

use crate::{
    channel::{
        AmqpChannel, AmqpConnection, AmqpConnector, AmqpSession, MockAmqpChannel,
        MockAmqpConnection,
    },
    config::RabbitMQConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::oneshot;

enum Outcome {
    Session(Arc<dyn AmqpConnection>, Arc<dyn AmqpChannel>),
    Failure(String),
}

/// Connector replaying a fixed list of outcomes, one per `connect` call.
pub(crate) struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    close_signals: Mutex<Vec<Option<oneshot::Sender<String>>>>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        ScriptedConnector {
            outcomes: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            close_signals: Mutex::new(Vec::new()),
        }
    }

    /// Queues a session whose channel and connection accept `close`.
    pub(crate) fn push_success(&self) {
        let mut channel = MockAmqpChannel::new();
        channel.expect_close().returning(|| Ok(()));
        let mut connection = MockAmqpConnection::new();
        connection.expect_close().returning(|| Ok(()));

        self.push_session(Arc::new(connection), Arc::new(channel));
    }

    pub(crate) fn push_session(
        &self,
        connection: Arc<dyn AmqpConnection>,
        channel: Arc<dyn AmqpChannel>,
    ) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Outcome::Session(connection, channel));
    }

    pub(crate) fn push_failure(&self, reason: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Outcome::Failure(reason.to_owned()));
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Simulates the broker dropping the `index`-th established session.
    pub(crate) fn fire_close(&self, index: usize, reason: &str) {
        let sender = self
            .close_signals
            .lock()
            .unwrap()
            .get_mut(index)
            .and_then(Option::take)
            .expect("no such session");
        let _ = sender.send(reason.to_owned());
    }
}

#[async_trait]
impl AmqpConnector for ScriptedConnector {
    async fn connect(&self) -> Result<AmqpSession, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Outcome::Session(connection, channel)) => {
                let (tx, rx) = oneshot::channel();
                self.close_signals.lock().unwrap().push(Some(tx));
                Ok(AmqpSession {
                    connection,
                    channel,
                    closed: rx,
                })
            }
            Some(Outcome::Failure(reason)) => Err(AmqpError::connection(reason)),
            None => Err(AmqpError::connection("no scripted outcome left")),
        }
    }
}

/// A connected manager whose channel is `channel`.
pub(crate) async fn connected_manager(channel: MockAmqpChannel) -> ConnectionManager {
    let connector = Arc::new(ScriptedConnector::new());
    let mut connection = MockAmqpConnection::new();
    connection.expect_close().returning(|| Ok(()));
    connector.push_session(Arc::new(connection), Arc::new(channel));

    let manager = ConnectionManager::new(connector, RabbitMQConfigs::default());
    manager.connect().await.expect("scripted connect");
    manager
}

pub(crate) fn header<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    headers.inner().get(key)
}
