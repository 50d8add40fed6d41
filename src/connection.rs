// src/connection.rs - single logical store connection with reconnect backoff
use crate::config::ReconnectSettings;
use crate::{RelqError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Opens connections to the store.
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    fn connect(&self) -> BoxFuture<'static, std::result::Result<Self::Connection, String>>;
}

/// Connector for a redis server, yielding a multiplexed connection.
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }
}

impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    fn connect(&self) -> BoxFuture<'static, std::result::Result<Self::Connection, String>> {
        let client = self.client.clone();
        async move {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| e.to_string())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up reconnecting. Needs [`ConnectionManager::restart`].
    Failed { attempts: u32 },
}

/// Backoff before reconnect attempt `attempt`: `delay_sec * 2^min(attempt, 10)`.
pub fn reconnect_delay(delay_sec: u64, attempt: u32) -> Duration {
    Duration::from_secs(delay_sec.saturating_mul(1u64 << attempt.min(10)))
}

type PendingConnect<C> = Shared<BoxFuture<'static, std::result::Result<C, String>>>;

struct Inner<C> {
    state: ConnectionState,
    connection: Option<C>,
    /// In-flight connect shared by every concurrent caller, tagged with its id.
    pending: Option<(u64, PendingConnect<C>)>,
    next_attempt_id: u64,
    /// Bumped for every established connection.
    generation: u64,
    closed: bool,
}

/// Owns the store connection and drives reconnection.
pub struct ConnectionManager<K: Connector> {
    connector: Arc<K>,
    settings: ReconnectSettings,
    inner: Arc<Mutex<Inner<K::Connection>>>,
}

impl<K: Connector> Clone for ConnectionManager<K> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            settings: self.settings,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(connector: K, settings: ReconnectSettings) -> Self {
        Self {
            connector: Arc::new(connector),
            settings,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                connection: None,
                pending: None,
                next_attempt_id: 0,
                generation: 0,
                closed: false,
            })),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Current connection, connecting first if none was established yet.
    pub async fn connection(&self) -> Result<K::Connection> {
        self.checkout().await.map(|(conn, _)| conn)
    }

    /// Like [`connection`](Self::connection), plus the generation to pass to
    /// [`connection_lost`](Self::connection_lost).
    pub async fn checkout(&self) -> Result<(K::Connection, u64)> {
        let (attempt_id, pending) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Connected => {
                    if let Some(conn) = &inner.connection {
                        return Ok((conn.clone(), inner.generation));
                    }
                }
                ConnectionState::Reconnecting { attempt } => {
                    return Err(RelqError::StoreUnavailable(format!(
                        "reconnecting to store (attempt {attempt})"
                    )));
                }
                ConnectionState::Failed { attempts } => {
                    return Err(RelqError::PersistentDisconnect(attempts));
                }
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
            if inner.closed {
                return Err(RelqError::StoreUnavailable("connection closed".into()));
            }

            inner.state = ConnectionState::Connecting;
            match &inner.pending {
                Some((id, pending)) => (*id, pending.clone()),
                None => {
                    let id = inner.next_attempt_id;
                    inner.next_attempt_id += 1;
                    let pending = self.connector.connect().shared();
                    inner.pending = Some((id, pending.clone()));
                    debug!(attempt_id = id, "Connecting to store");
                    (id, pending)
                }
            }
        };

        let result = pending.await;

        let mut inner = self.inner.lock().await;
        let settles = matches!(&inner.pending, Some((id, _)) if *id == attempt_id);
        if settles {
            inner.pending = None;
            match &result {
                Ok(conn) => {
                    inner.connection = Some(conn.clone());
                    inner.generation += 1;
                    inner.state = ConnectionState::Connected;
                    info!("Successfully connected to store");
                }
                Err(e) => {
                    inner.state = ConnectionState::Disconnected;
                    warn!(error = %e, "Connecting to store failed");
                }
            }
        }
        match result {
            Ok(conn) => Ok((conn, inner.generation)),
            Err(e) => Err(RelqError::StoreUnavailable(e)),
        }
    }

    /// Reports a connection-level error or close seen on `generation`.
    ///
    /// Only the first report for the live connection starts a reconnect.
    pub async fn connection_lost(&self, generation: u64, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            return;
        }
        inner.connection = None;

        if !self.settings.enabled() {
            inner.state = ConnectionState::Failed { attempts: 0 };
            warn!(reason, "Store connection lost and reconnecting is disabled");
            return;
        }

        warn!(reason, "Store connection lost, reconnecting");
        inner.state = ConnectionState::Reconnecting { attempt: 0 };
        drop(inner);

        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        let mut attempt: u32 = 0;
        loop {
            let limit = self.settings.attempts;
            if limit >= 0 && attempt > limit as u32 {
                let mut inner = self.inner.lock().await;
                inner.state = ConnectionState::Failed { attempts: attempt };
                error!(
                    max_attempts = limit,
                    "Not reconnecting anymore since max reconnect attempts are reached"
                );
                return;
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return;
                }
                inner.state = ConnectionState::Reconnecting { attempt };
            }

            let delay = reconnect_delay(self.settings.delay_sec, attempt);
            debug!(attempt, delay_secs = delay.as_secs(), "Scheduling reconnect");
            tokio::time::sleep(delay).await;

            match self.connector.connect().await {
                Ok(conn) => {
                    let mut inner = self.inner.lock().await;
                    if inner.closed {
                        return;
                    }
                    inner.connection = Some(conn);
                    inner.generation += 1;
                    inner.state = ConnectionState::Connected;
                    info!(attempt, "Reconnected to store");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Leaves the `Failed` state so the next request connects again.
    pub async fn restart(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, ConnectionState::Failed { .. }) {
            info!("Restarting store connection");
            inner.state = ConnectionState::Disconnected;
            inner.connection = None;
            inner.closed = false;
        }
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.connection = None;
        inner.pending = None;
        inner.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Fails the connects whose call number falls in `failing`, each connect
    /// taking `latency`.
    struct FakeConnector {
        calls: Arc<AtomicUsize>,
        failing: Range<usize>,
        latency: Duration,
        attempted_at: Arc<StdMutex<Vec<Instant>>>,
    }

    impl FakeConnector {
        fn new(failures: usize, latency: Duration) -> Self {
            Self::failing_calls(0..failures, latency)
        }

        fn failing_calls(failing: Range<usize>, latency: Duration) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                failing,
                latency,
                attempted_at: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    impl Connector for FakeConnector {
        type Connection = usize;

        fn connect(&self) -> BoxFuture<'static, std::result::Result<usize, String>> {
            let calls = Arc::clone(&self.calls);
            let attempted_at = Arc::clone(&self.attempted_at);
            let failing = self.failing.clone();
            let latency = self.latency;
            async move {
                attempted_at.lock().unwrap().push(Instant::now());
                let n = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(latency).await;
                if failing.contains(&n) {
                    Err(format!("refused #{n}"))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        }
    }

    fn settings(attempts: i32, delay_sec: u64) -> ReconnectSettings {
        ReconnectSettings {
            attempts,
            delay_sec,
        }
    }

    #[test]
    fn delay_doubles_and_caps_at_ten_doublings() {
        assert_eq!(reconnect_delay(30, 0), Duration::from_secs(30));
        assert_eq!(reconnect_delay(30, 1), Duration::from_secs(60));
        assert_eq!(reconnect_delay(30, 2), Duration::from_secs(120));
        assert_eq!(reconnect_delay(30, 10), Duration::from_secs(30 * 1024));
        assert_eq!(reconnect_delay(30, 25), Duration::from_secs(30 * 1024));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_attempt() {
        let connector = FakeConnector::new(0, Duration::from_millis(50));
        let calls = Arc::clone(&connector.calls);
        let manager = ConnectionManager::new(connector, settings(0, 1));

        let (a, b, c) = tokio::join!(
            manager.connection(),
            manager.connection(),
            manager.connection()
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), 0);
        assert_eq!(b.unwrap(), 0);
        assert_eq!(c.unwrap(), 0);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_connect_is_retried_on_next_request() {
        let connector = FakeConnector::new(1, Duration::from_millis(1));
        let manager = ConnectionManager::new(connector, settings(0, 1));

        assert!(matches!(
            manager.connection().await,
            Err(RelqError::StoreUnavailable(_))
        ));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(manager.connection().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_reconnect_backs_off_exponentially() {
        // call 0 connects, calls 1..4 are the failing reconnects
        let connector = FakeConnector::failing_calls(1..4, Duration::ZERO);
        let attempted_at = Arc::clone(&connector.attempted_at);
        let calls = Arc::clone(&connector.calls);
        let manager = ConnectionManager::new(connector, settings(-1, 30));

        let (_, generation) = manager.checkout().await.unwrap();
        let lost_at = Instant::now();
        manager.connection_lost(generation, "closed by peer").await;
        assert_eq!(
            manager.state().await,
            ConnectionState::Reconnecting { attempt: 0 }
        );
        assert!(matches!(
            manager.connection().await,
            Err(RelqError::StoreUnavailable(_))
        ));

        tokio::time::sleep(Duration::from_secs(1_000)).await;

        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let offsets: Vec<u64> = attempted_at.lock().unwrap()[1..]
            .iter()
            .map(|at| at.duration_since(lost_at).as_secs())
            .collect();
        assert_eq!(offsets, vec![30, 90, 210, 450]);
        assert_eq!(manager.connection().await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_limit() {
        let connector = FakeConnector::new(usize::MAX, Duration::ZERO);
        let manager = ConnectionManager::new(connector, settings(2, 1));
        {
            let mut inner = manager.inner.lock().await;
            inner.state = ConnectionState::Connected;
            inner.connection = Some(7);
            inner.generation = 1;
        }

        manager.connection_lost(1, "io error").await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(
            manager.state().await,
            ConnectionState::Failed { attempts: 3 }
        );
        assert!(matches!(
            manager.connection().await,
            Err(RelqError::PersistentDisconnect(3))
        ));

        manager.restart().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reconnect_stays_down() {
        let connector = FakeConnector::new(0, Duration::ZERO);
        let calls = Arc::clone(&connector.calls);
        let manager = ConnectionManager::new(connector, settings(0, 1));
        let (_, generation) = manager.checkout().await.unwrap();

        manager.connection_lost(generation, "closed").await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.connection().await,
            Err(RelqError::PersistentDisconnect(0))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_does_not_trigger_reconnect() {
        let connector = FakeConnector::new(0, Duration::ZERO);
        let manager = ConnectionManager::new(connector, settings(-1, 1));
        let (_, generation) = manager.checkout().await.unwrap();

        manager.connection_lost(generation + 1, "old connection").await;
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }
}
