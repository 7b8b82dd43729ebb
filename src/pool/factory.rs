//! Per-target connection cache
//!
//! [`ConnectionFactory`] hands out at most one live [`Connection`] per
//! distinct [`ConnectionTarget`]. Each cached connection gets a watcher task
//! that evicts the entry once the connection has released its instance, so the
//! next request for the same target builds a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId, ConnectionSettings};
use crate::bridge::{InstanceFactory, MemberInvoker};
use crate::error::{Error, Result};
use crate::target::ConnectionTarget;

type ConnectionMap = Mutex<HashMap<ConnectionTarget, Arc<Connection>>>;

/// Single-flight cache of connections keyed by target
pub struct ConnectionFactory {
    settings: ConnectionSettings,
    instance_factory: Arc<dyn InstanceFactory>,
    invoker: Arc<dyn MemberInvoker>,
    connections: Arc<ConnectionMap>,
}

impl ConnectionFactory {
    pub fn new(
        settings: ConnectionSettings,
        instance_factory: Arc<dyn InstanceFactory>,
        invoker: Arc<dyn MemberInvoker>,
    ) -> Self {
        Self {
            settings,
            instance_factory,
            invoker,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Return the live connection for `target`, creating it on first use
    ///
    /// The connection is not connected yet; call [`Connection::connect`]. If
    /// the cached connection is tearing down, this waits until it has released
    /// its instance so that two instances never serve the same target.
    pub async fn get_connection(
        &self,
        target: &ConnectionTarget,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        loop {
            let mut connections = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                connections = self.connections.lock() => connections,
            };

            let closing = match connections.get(target) {
                Some(existing) if !existing.is_closing() => return Ok(Arc::clone(existing)),
                Some(existing) if !existing.is_closed() => Some(Arc::clone(existing)),
                _ => None,
            };

            if let Some(closing) = closing {
                drop(connections);

                debug!(address = %target.address(), id = %closing.id(), "Waiting for teardown");
                let cancelled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = closing.closed() => false,
                };
                if cancelled {
                    return Err(Error::Cancelled);
                }
                continue;
            }

            let connection = Arc::new(Connection::new(
                target.clone(),
                self.settings.clone(),
                Arc::clone(&self.instance_factory),
                Arc::clone(&self.invoker),
            ));
            connections.insert(target.clone(), Arc::clone(&connection));
            drop(connections);

            info!(address = %target.address(), id = %connection.id(), "Created connection");

            tokio::spawn(watch_teardown(
                Arc::downgrade(&self.connections),
                target.clone(),
                connection.id(),
                connection.closed_token(),
            ));

            return Ok(connection);
        }
    }

    /// Number of cached connections that are not tearing down
    pub async fn instances_count(&self) -> usize {
        let connections = self.connections.lock().await;
        connections.values().filter(|c| !c.is_closing()).count()
    }

    /// Tear down every cached connection now and wait for all of them
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, connection)| connection).collect()
        };

        debug!(count = drained.len(), "Shutting down connections");

        for connection in drained {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Evict `target` once the connection identified by `id` has torn down
async fn watch_teardown(
    connections: Weak<ConnectionMap>,
    target: ConnectionTarget,
    id: ConnectionId,
    closed: CancellationToken,
) {
    closed.cancelled().await;

    let Some(connections) = connections.upgrade() else {
        return;
    };

    let mut connections = connections.lock().await;
    if connections.get(&target).is_some_and(|c| c.id() == id) {
        connections.remove(&target);
        debug!(address = %target.address(), id = %id, "Evicted connection");
    }
}
