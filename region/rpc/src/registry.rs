// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks the live RPC connections of every rack controller and lets callers
//! wait, with a timeout, for a controller to connect.
//!
//! Each rack identifier moves between having no connections and having one or
//! more. A caller asking for a connection that does not exist yet becomes a
//! waiter; a waiter is resolved by the next [`ConnectionRegistry::register()`]
//! for one of its identifiers, fails when its timeout elapses, or is discarded
//! when the caller stops polling. In every case the waiter's bookkeeping is
//! removed by the [`WaiterGuard`] owned by the waiting future.

use rand::seq::SliceRandom;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A live connection to one rack controller process.
///
/// Handles are cloned freely; two handles with the same `connection_id()`
/// refer to the same underlying connection.
pub trait RackConnection: Clone + Send + Sync + 'static {
    fn connection_id(&self) -> Uuid;
}

/// A connection handed out by the registry, along with the identifier of the
/// rack it belongs to.
#[derive(Clone, Debug)]
pub struct RackClient<C> {
    pub ident: String,
    pub connection: C,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { ident: String, connection_id: Uuid },
    Disconnected { ident: String, connection_id: Uuid },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(
        "Unable to connect to rack controller {}; no connections available.",
        describe_identifiers(.identifiers)
    )]
    NoConnectionsAvailable { identifiers: Vec<String> },
    #[error("connection registry is shutting down")]
    ShuttingDown,
    #[error("connection registry internal error: {0}")]
    Internal(String),
}

fn describe_identifiers(identifiers: &[String]) -> String {
    if identifiers.is_empty() {
        "(any)".to_string()
    } else {
        identifiers.join(", ")
    }
}

type WaiterId = u64;
type WaiterResult<C> = Result<RackClient<C>, RegistryError>;

struct Waiter<C> {
    identifiers: Vec<String>,
    tx: oneshot::Sender<WaiterResult<C>>,
}

struct Inner<C> {
    connections: BTreeMap<String, Vec<C>>,
    waiters: HashMap<WaiterId, Waiter<C>>,
    waiters_by_ident: HashMap<String, BTreeSet<WaiterId>>,
    next_waiter_id: WaiterId,
    shut_down: bool,
}

impl<C> Inner<C> {
    /// Removes a waiter from every identifier it was waiting on.
    fn take_waiter(&mut self, id: WaiterId) -> Option<Waiter<C>> {
        let waiter = self.waiters.remove(&id)?;
        for ident in &waiter.identifiers {
            if let Some(ids) = self.waiters_by_ident.get_mut(ident) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.waiters_by_ident.remove(ident);
                }
            }
        }
        Some(waiter)
    }
}

enum Lookup<C> {
    Found(RackClient<C>),
    Waiting { id: WaiterId, rx: oneshot::Receiver<WaiterResult<C>> },
}

pub struct ConnectionRegistry<C> {
    log: Logger,
    inner: Mutex<Inner<C>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<C: RackConnection> ConnectionRegistry<C> {
    pub fn new(log: &Logger) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ConnectionRegistry {
            log: log.new(o!("component" => "ConnectionRegistry")),
            inner: Mutex::new(Inner {
                connections: BTreeMap::new(),
                waiters: HashMap::new(),
                waiters_by_ident: HashMap::new(),
                next_waiter_id: 0,
                shut_down: false,
            }),
            events,
        }
    }

    /// Records a newly established connection for rack `ident` and hands it
    /// to everyone currently waiting on that rack.
    pub fn register(
        &self,
        ident: &str,
        connection: C,
    ) -> Result<(), RegistryError> {
        let connection_id = connection.connection_id();
        let woken = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return Err(RegistryError::ShuttingDown);
            }
            inner
                .connections
                .entry(ident.to_string())
                .or_default()
                .push(connection.clone());
            let ids = inner
                .waiters_by_ident
                .get(ident)
                .cloned()
                .unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| inner.take_waiter(id))
                .collect::<Vec<_>>()
        };

        info!(
            self.log,
            "rack connected";
            "ident" => ident,
            "connection_id" => %connection_id,
            "waiters_woken" => woken.len(),
        );
        for waiter in woken {
            // The receiver is gone only if its future was dropped after we
            // took the waiter, which is the same as a cancellation.
            let _ = waiter.tx.send(Ok(RackClient {
                ident: ident.to_string(),
                connection: connection.clone(),
            }));
        }
        // No subscribers is not an error.
        let _ = self.events.send(RegistryEvent::Connected {
            ident: ident.to_string(),
            connection_id,
        });
        Ok(())
    }

    /// Removes exactly `connection` from rack `ident`, leaving any other
    /// connection for that rack in place. Returns whether anything was
    /// removed.
    pub fn unregister(&self, ident: &str, connection: &C) -> bool {
        let connection_id = connection.connection_id();
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = false;
            if let Some(conns) = inner.connections.get_mut(ident) {
                let before = conns.len();
                conns.retain(|c| c.connection_id() != connection_id);
                removed = conns.len() != before;
            }
            if inner.connections.get(ident).is_some_and(|conns| conns.is_empty())
            {
                inner.connections.remove(ident);
            }
            removed
        };

        if removed {
            info!(
                self.log,
                "rack disconnected";
                "ident" => ident,
                "connection_id" => %connection_id,
            );
            let _ = self.events.send(RegistryEvent::Disconnected {
                ident: ident.to_string(),
                connection_id,
            });
        } else {
            debug!(
                self.log,
                "ignoring unregister of unknown connection";
                "ident" => ident,
                "connection_id" => %connection_id,
            );
        }
        removed
    }

    /// Returns a connection for rack `ident`, waiting up to `timeout` for one
    /// to be registered.
    pub async fn get(
        &self,
        ident: &str,
        timeout: Duration,
    ) -> Result<RackClient<C>, RegistryError> {
        self.get_any_of([ident], timeout).await
    }

    /// Returns a connection for any of `identifiers`, waiting up to `timeout`
    /// for the first of them to connect.
    ///
    /// If several are connected already, the connection is chosen uniformly
    /// at random among all of their connections.
    pub async fn get_any_of<I, S>(
        &self,
        identifiers: I,
        timeout: Duration,
    ) -> Result<RackClient<C>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut idents: Vec<String> = Vec::new();
        for ident in identifiers {
            let ident = ident.into();
            if !idents.contains(&ident) {
                idents.push(ident);
            }
        }
        if idents.is_empty() {
            return Err(RegistryError::NoConnectionsAvailable {
                identifiers: idents,
            });
        }

        let (id, rx) = match self.lookup_or_wait(&idents)? {
            Lookup::Found(client) => return Ok(client),
            Lookup::Waiting { id, rx } => (id, rx),
        };
        let _guard = WaiterGuard { registry: self, id };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(client))) => {
                if idents.contains(&client.ident) {
                    Ok(client)
                } else {
                    Err(RegistryError::Internal(format!(
                        "waiter for {:?} resolved with a connection for {:?}",
                        idents, client.ident
                    )))
                }
            }
            Ok(Ok(Err(error))) => Err(error),
            // The sender is only dropped unsent when the registry itself is
            // torn down.
            Ok(Err(_)) => Err(RegistryError::ShuttingDown),
            Err(_) => {
                warn!(
                    self.log,
                    "timed out waiting for rack connection";
                    "identifiers" => ?idents,
                    "timeout" => ?timeout,
                );
                Err(RegistryError::NoConnectionsAvailable { identifiers: idents })
            }
        }
    }

    fn lookup_or_wait(
        &self,
        idents: &[String],
    ) -> Result<Lookup<C>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return Err(RegistryError::ShuttingDown);
        }

        let available = idents
            .iter()
            .flat_map(|ident| {
                inner.connections.get(ident).into_iter().flatten().map(
                    move |connection| RackClient {
                        ident: ident.clone(),
                        connection: connection.clone(),
                    },
                )
            })
            .collect::<Vec<_>>();
        if let Some(client) = available.choose(&mut rand::thread_rng()) {
            return Ok(Lookup::Found(client.clone()));
        }

        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        for ident in idents {
            inner.waiters_by_ident.entry(ident.clone()).or_default().insert(id);
        }
        inner.waiters.insert(id, Waiter { identifiers: idents.to_vec(), tx });
        debug!(
            self.log,
            "waiting for rack connection";
            "identifiers" => ?idents,
            "waiter_id" => id,
        );
        Ok(Lookup::Waiting { id, rx })
    }

    /// Returns every registered connection.
    pub fn get_all(&self) -> Vec<RackClient<C>> {
        let inner = self.inner.lock().unwrap();
        inner
            .connections
            .iter()
            .flat_map(|(ident, conns)| {
                conns.iter().map(move |connection| RackClient {
                    ident: ident.clone(),
                    connection: connection.clone(),
                })
            })
            .collect()
    }

    /// Returns one registered connection chosen uniformly at random.
    pub fn get_random(&self) -> Result<RackClient<C>, RegistryError> {
        self.get_all().choose(&mut rand::thread_rng()).cloned().ok_or(
            RegistryError::NoConnectionsAvailable { identifiers: Vec::new() },
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Fails every pending waiter with [`RegistryError::ShuttingDown`] and
    /// drops all connections. Later calls to `register()` and `get()` fail
    /// the same way.
    pub fn shutdown(&self) {
        let (waiters, connections) = {
            let mut inner = self.inner.lock().unwrap();
            inner.shut_down = true;
            inner.waiters_by_ident.clear();
            let waiters = std::mem::take(&mut inner.waiters);
            let connections = std::mem::take(&mut inner.connections);
            (waiters, connections)
        };

        info!(
            self.log,
            "shutting down connection registry";
            "pending_waiters" => waiters.len(),
        );
        for (_, waiter) in waiters {
            let _ = waiter.tx.send(Err(RegistryError::ShuttingDown));
        }
        for (ident, conns) in connections {
            for connection in conns {
                let _ = self.events.send(RegistryEvent::Disconnected {
                    ident: ident.clone(),
                    connection_id: connection.connection_id(),
                });
            }
        }
    }

    /// Number of callers currently waiting for a connection.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

/// Owned by a waiting future; removes the waiter when the future completes or
/// is dropped.
struct WaiterGuard<'a, C> {
    registry: &'a ConnectionRegistry<C>,
    id: WaiterId,
}

impl<C> Drop for WaiterGuard<'_, C> {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock().unwrap();
        inner.take_waiter(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use futures::FutureExt;
    use maas_test_utils::dev::poll::wait_for_condition;
    use maas_test_utils::dev::poll::CondCheckError;
    use maas_test_utils::dev::test_setup_log;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Clone, Debug)]
    struct TestConnection {
        id: Uuid,
    }

    impl TestConnection {
        fn new() -> Self {
            TestConnection { id: Uuid::new_v4() }
        }
    }

    impl RackConnection for TestConnection {
        fn connection_id(&self) -> Uuid {
            self.id
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn wait_for_waiters(
        registry: &ConnectionRegistry<TestConnection>,
        count: usize,
    ) {
        wait_for_condition(
            || async move {
                if registry.waiter_count() == count {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(5),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_existing_connection() {
        let logctx = test_setup_log("test_get_existing_connection");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);

        let conn = TestConnection::new();
        registry.register("rack-a", conn.clone()).unwrap();

        let client = registry.get("rack-a", TIMEOUT).await.unwrap();
        assert_eq!(client.ident, "rack-a");
        assert_eq!(client.connection.id, conn.id);
        assert_eq!(registry.waiter_count(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_waits_for_register() {
        let logctx = test_setup_log("test_get_waits_for_register");
        let registry =
            Arc::new(ConnectionRegistry::<TestConnection>::new(&logctx.log));

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("rack-a", TIMEOUT).await })
        };
        wait_for_waiters(&registry, 1).await;

        let conn = TestConnection::new();
        registry.register("rack-a", conn.clone()).unwrap();
        let client = task.await.unwrap().unwrap();
        assert_eq!(client.ident, "rack-a");
        assert_eq!(client.connection.id, conn.id);
        assert_eq!(registry.waiter_count(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_times_out() {
        let logctx = test_setup_log("test_get_times_out");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);

        let start = tokio::time::Instant::now();
        let error = registry
            .get("rack-a", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            RegistryError::NoConnectionsAvailable {
                identifiers: vec!["rack-a".to_string()]
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(registry.waiter_count(), 0);

        // A connection arriving after the timeout is simply kept for the next
        // caller.
        registry.register("rack-a", TestConnection::new()).unwrap();
        assert_eq!(registry.get_all().len(), 1);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_removed() {
        let logctx = test_setup_log("test_cancelled_waiter_removed");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);
        let mut events = registry.subscribe();

        // Polls the future once, which registers the waiter, then drops it.
        assert!(registry.get("rack-a", TIMEOUT).now_or_never().is_none());
        assert_eq!(registry.waiter_count(), 0);
        assert!(registry
            .get_any_of(["rack-a", "rack-b"], TIMEOUT)
            .now_or_never()
            .is_none());
        assert_eq!(registry.waiter_count(), 0);
        assert_matches!(events.try_recv(), Err(TryRecvError::Empty));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_any_of_waits_for_first() {
        let logctx = test_setup_log("test_get_any_of_waits_for_first");
        let registry =
            Arc::new(ConnectionRegistry::<TestConnection>::new(&logctx.log));

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.get_any_of(["rack-a", "rack-b"], TIMEOUT).await
            })
        };
        wait_for_waiters(&registry, 1).await;

        registry.register("rack-c", TestConnection::new()).unwrap();
        assert_eq!(registry.waiter_count(), 1);

        let conn = TestConnection::new();
        registry.register("rack-b", conn.clone()).unwrap();
        let client = task.await.unwrap().unwrap();
        assert_eq!(client.ident, "rack-b");
        assert_eq!(client.connection.id, conn.id);

        // The single logical waiter is gone from both identifiers.
        assert_eq!(registry.waiter_count(), 0);
        assert!(registry.inner.lock().unwrap().waiters_by_ident.is_empty());

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_any_of_existing() {
        let logctx = test_setup_log("test_get_any_of_existing");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);

        let a = TestConnection::new();
        let b1 = TestConnection::new();
        let b2 = TestConnection::new();
        registry.register("rack-a", a.clone()).unwrap();
        registry.register("rack-b", b1.clone()).unwrap();
        registry.register("rack-b", b2.clone()).unwrap();
        registry.register("rack-c", TestConnection::new()).unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            let client = registry
                .get_any_of(["rack-a", "rack-b", "rack-a"], TIMEOUT)
                .await
                .unwrap();
            assert_ne!(client.ident, "rack-c");
            seen.insert(client.connection.id);
        }
        assert_eq!(seen, BTreeSet::from([a.id, b1.id, b2.id]));

        let error =
            registry.get_any_of(Vec::<String>::new(), TIMEOUT).await.unwrap_err();
        assert_matches!(error, RegistryError::NoConnectionsAvailable { .. });

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unregister_keeps_replacement() {
        let logctx = test_setup_log("test_unregister_keeps_replacement");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);
        let mut events = registry.subscribe();

        let old = TestConnection::new();
        let new = TestConnection::new();
        registry.register("rack-a", old.clone()).unwrap();
        registry.register("rack-a", new.clone()).unwrap();

        assert!(registry.unregister("rack-a", &old));
        let remaining = registry.get_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].connection.id, new.id);

        // A second unregister of the same connection changes nothing.
        assert!(!registry.unregister("rack-a", &old));
        assert!(!registry.unregister("rack-z", &old));

        assert!(registry.unregister("rack-a", &new));
        assert!(registry.get_all().is_empty());

        let expected = [
            RegistryEvent::Connected {
                ident: "rack-a".to_string(),
                connection_id: old.id,
            },
            RegistryEvent::Connected {
                ident: "rack-a".to_string(),
                connection_id: new.id,
            },
            RegistryEvent::Disconnected {
                ident: "rack-a".to_string(),
                connection_id: old.id,
            },
            RegistryEvent::Disconnected {
                ident: "rack-a".to_string(),
                connection_id: new.id,
            },
        ];
        for event in expected {
            assert_eq!(events.try_recv().unwrap(), event);
        }
        assert_matches!(events.try_recv(), Err(TryRecvError::Empty));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_get_random() {
        let logctx = test_setup_log("test_get_random");
        let registry = ConnectionRegistry::<TestConnection>::new(&logctx.log);

        let error = registry.get_random().unwrap_err();
        assert_eq!(
            error,
            RegistryError::NoConnectionsAvailable { identifiers: vec![] }
        );
        assert_eq!(
            error.to_string(),
            "Unable to connect to rack controller (any); no connections \
             available."
        );

        let a = TestConnection::new();
        let b = TestConnection::new();
        registry.register("rack-a", a.clone()).unwrap();
        registry.register("rack-b", b.clone()).unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            seen.insert(registry.get_random().unwrap().connection.id);
        }
        assert_eq!(seen, BTreeSet::from([a.id, b.id]));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_waiters() {
        let logctx = test_setup_log("test_shutdown_fails_waiters");
        let registry =
            Arc::new(ConnectionRegistry::<TestConnection>::new(&logctx.log));
        registry.register("rack-a", TestConnection::new()).unwrap();

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("rack-b", TIMEOUT).await })
        };
        wait_for_waiters(&registry, 1).await;

        registry.shutdown();
        assert_eq!(task.await.unwrap().unwrap_err(), RegistryError::ShuttingDown);
        assert_eq!(registry.waiter_count(), 0);
        assert!(registry.get_all().is_empty());
        assert_eq!(
            registry.register("rack-a", TestConnection::new()).unwrap_err(),
            RegistryError::ShuttingDown
        );
        assert_eq!(
            registry.get("rack-a", TIMEOUT).await.unwrap_err(),
            RegistryError::ShuttingDown
        );

        logctx.cleanup_successful();
    }
}
