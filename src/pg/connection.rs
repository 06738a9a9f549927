//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP (or caller-supplied stream) connection establishment and startup
//! - The open / closing / closed / terminated state machine
//! - Interrupting every in-flight operation on close, terminate or transport loss
//! - The statement cache and the public query surface
//!
//! All protocol traffic goes through a single [`Wire`] behind an async mutex,
//! so concurrent callers queue rather than interleave. Each operation holds a
//! [`Ticket`] in the interrupt registry while it waits; shutting the
//! connection down fires every ticket, which resolves the waiting operations
//! with [`PgError::ClosedMidOperation`] no matter which task they run on.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use super::cache::{CacheStats, StatementCache};
use super::config::Config;
use super::error::{PgError, PgResult};
use super::protocol::TransactionStatus;
use super::row::Row;
use super::statement::{PreparedStatement, StatementState};
use super::types::Value;
use super::wire::{BackendKey, ServerParameters, Wire};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Savepoint used by `EXPLAIN ANALYZE` inside an open transaction.
const EXPLAIN_SAVEPOINT: &str = "pgprep_explain";

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting operations.
    Open,
    /// Graceful close in progress.
    Closing,
    /// Closed by the caller or lost to the server.
    Closed,
    /// Closed abruptly by [`Connection::terminate`].
    Terminated,
}

struct Control {
    state: ConnectionState,
    next_ticket: u64,
    in_flight: HashMap<u64, oneshot::Sender<()>>,
}

/// Registration of one in-flight operation.
struct Ticket<'a> {
    inner: &'a Inner,
    id: u64,
    interrupted: oneshot::Receiver<()>,
}

impl Ticket<'_> {
    /// Run `fut` unless the connection shuts down first.
    async fn interruptible<T>(&mut self, fut: impl Future<Output = PgResult<T>>) -> PgResult<T> {
        tokio::select! {
            biased;
            _ = &mut self.interrupted => Err(PgError::ClosedMidOperation),
            result = fut => result,
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.inner.control.lock().in_flight.remove(&self.id);
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Inner {
    io: AsyncMutex<Option<Wire>>,
    control: Mutex<Control>,
    cache: Mutex<StatementCache>,
    config: Config,
    next_statement: AtomicU64,
    parameters: ServerParameters,
    backend_key: BackendKey,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.control.lock().state
    }

    fn ticket(&self) -> PgResult<Ticket<'_>> {
        let mut control = self.control.lock();
        if control.state != ConnectionState::Open {
            return Err(PgError::ConnectionClosed);
        }

        let id = control.next_ticket;
        control.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        control.in_flight.insert(id, tx);

        Ok(Ticket {
            inner: self,
            id,
            interrupted: rx,
        })
    }

    /// Fire every registered ticket.
    fn interrupt_all(&self) {
        let waiting: Vec<_> = self
            .control
            .lock()
            .in_flight
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        if !waiting.is_empty() {
            debug!(operations = waiting.len(), "interrupting in-flight operations");
        }
        for tx in waiting {
            let _ = tx.send(());
        }
    }

    /// Move out of `Open` (or from `Closing` to `Terminated`). Returns false
    /// when the connection is already on its way down.
    fn begin_shutdown(&self, target: ConnectionState) -> bool {
        let mut control = self.control.lock();
        let allowed = match (control.state, target) {
            (ConnectionState::Open, _) => true,
            (ConnectionState::Closing, ConnectionState::Terminated) => true,
            _ => false,
        };
        if allowed {
            control.state = target;
        }
        allowed
    }

    /// Drop the transport if nobody is using it.
    fn release_transport(&self) {
        if let Ok(mut io) = self.io.try_lock() {
            if io.take().is_some() {
                trace!("transport released");
            }
        }
    }

    /// The transport failed underneath us.
    fn lose(&self) {
        if !self.begin_shutdown(ConnectionState::Closed) {
            return;
        }
        self.interrupt_all();
        self.cache.lock().drain();
        self.release_transport();
    }

    /// Run one exchange on the wire.
    ///
    /// Waiting for the wire and the exchange itself are both interruptible.
    /// Transport failures close the connection and are reported as
    /// [`PgError::ClosedMidOperation`].
    async fn with_wire<T, F>(&self, op: F) -> PgResult<T>
    where
        F: for<'w> FnOnce(&'w mut Wire) -> BoxFuture<'w, PgResult<T>>,
    {
        let mut ticket = self.ticket()?;
        let mut poisoned = false;

        let result = ticket
            .interruptible(async {
                let mut io = self.io.lock().await;
                let wire = match io.as_mut() {
                    Some(wire) if self.state() == ConnectionState::Open => wire,
                    _ => return Err(PgError::ClosedMidOperation),
                };

                let queued = self.cache.lock().take_close_queue();
                wire.queue_closes(queued);

                // An earlier caller may have walked away inside a guarded block
                let result = match wire.end_guarded().await {
                    Ok(()) => op(wire).await,
                    Err(err) => Err(err),
                };
                poisoned = wire.is_poisoned();
                result
            })
            .await;
        drop(ticket);

        match result {
            Err(PgError::Io(err)) => {
                warn!(error = %err, "connection lost");
                self.lose();
                Err(PgError::ClosedMidOperation)
            }
            Err(err) if poisoned => {
                warn!(error = %err, "protocol stream corrupted, closing connection");
                self.lose();
                Err(err)
            }
            result => {
                if matches!(
                    self.state(),
                    ConnectionState::Closed | ConnectionState::Terminated
                ) {
                    self.release_transport();
                }
                result
            }
        }
    }

    /// Cached statement for `query`, preparing it on a miss.
    async fn prepare(self: &Arc<Self>, query: &str) -> PgResult<PreparedStatement> {
        if self.state() != ConnectionState::Open {
            return Err(PgError::ConnectionClosed);
        }

        let conn = Arc::downgrade(self);
        let hit = self.cache.lock().lookup(query, &conn);
        if let Some(stmt) = hit {
            return Ok(stmt);
        }

        let name = format!(
            "__pgprep_{}",
            self.next_statement.fetch_add(1, Ordering::Relaxed)
        );
        trace!(statement = %name, %query, "statement cache miss");

        let description = {
            let name = name.clone();
            let query = query.to_string();
            self.with_wire(move |wire| Box::pin(async move { wire.prepare(&name, &query).await }))
                .await?
        };

        let state = Arc::new(StatementState::new(name, query.to_string(), description));
        let stmt = self.cache.lock().insert(state, &conn);
        stmt
    }

    /// Bind and execute a statement.
    pub(crate) async fn run(
        &self,
        state: &Arc<StatementState>,
        params: &[Value],
        max_rows: i32,
    ) -> PgResult<Vec<Row>> {
        let bound = state.encode_params(params)?;
        let state = Arc::clone(state);

        self.with_wire(move |wire| {
            Box::pin(async move {
                // Closed while we were queued for the wire
                if state.is_closed() {
                    return Err(PgError::StatementClosed);
                }
                wire.execute(&state, &bound, max_rows).await
            })
        })
        .await
    }

    pub(crate) async fn explain(
        self: &Arc<Self>,
        state: &Arc<StatementState>,
        params: &[Value],
        analyze: bool,
    ) -> PgResult<serde_json::Value> {
        let query = format!(
            "EXPLAIN (FORMAT JSON, VERBOSE{}) {}",
            if analyze { ", ANALYZE" } else { "" },
            state.query
        );
        let plan = self.prepare(&query).await?;

        let rows = if analyze {
            let bound = plan.state().encode_params(params)?;
            let plan_state = Arc::clone(plan.state());
            self.with_wire(move |wire| {
                Box::pin(async move {
                    // Run the analysed statement in a transaction we can undo
                    let (begin, undo) = match wire.transaction_status() {
                        TransactionStatus::Idle => ("BEGIN".to_string(), "ROLLBACK".to_string()),
                        _ => (
                            format!("SAVEPOINT {}", EXPLAIN_SAVEPOINT),
                            format!(
                                "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                                EXPLAIN_SAVEPOINT
                            ),
                        ),
                    };
                    wire.begin_guarded(&begin, &undo).await?;
                    let result = wire.execute(&plan_state, &bound, 0).await;
                    wire.end_guarded().await?;
                    result
                })
            })
            .await?
        } else {
            self.run(plan.state(), params, 0).await?
        };

        let text = rows
            .into_iter()
            .next()
            .and_then(|row| row.take(0))
            .ok_or_else(|| PgError::Protocol("EXPLAIN returned no plan".to_string()))?;
        let text = match &text {
            Value::Json(s) | Value::Text(s) => s.as_str(),
            other => {
                return Err(PgError::Protocol(format!(
                    "EXPLAIN returned {:?} instead of JSON",
                    other
                )))
            }
        };
        serde_json::from_str(text)
            .map_err(|e| PgError::Protocol(format!("invalid EXPLAIN output: {}", e)))
    }

    async fn execute_script(&self, sql: &str) -> PgResult<String> {
        let sql = sql.to_string();
        self.with_wire(move |wire| Box::pin(async move { wire.simple_query(&sql).await }))
            .await
    }

    /// Last handle to `state` dropped.
    pub(crate) fn release(&self, state: &Arc<StatementState>) {
        self.cache.lock().release(state);
    }

    pub(crate) fn close_statement(&self, state: &Arc<StatementState>) {
        debug!(statement = %state.name, "closing statement");
        self.cache.lock().remove(state);
    }

    async fn close(&self) {
        if !self.begin_shutdown(ConnectionState::Closing) {
            return;
        }
        debug!("closing connection");

        self.interrupt_all();
        let names = self.cache.lock().drain();

        let farewell = async {
            let mut io = self.io.lock().await;
            match io.take() {
                Some(wire) => wire.goodbye(names).await,
                None => Ok(()),
            }
        };
        match tokio::time::timeout(self.config.close_timeout, farewell).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "error while saying goodbye"),
            Err(_) => debug!("timed out while saying goodbye"),
        }

        {
            let mut control = self.control.lock();
            if control.state == ConnectionState::Closing {
                control.state = ConnectionState::Closed;
            }
        }
        self.release_transport();
        debug!("connection closed");
    }

    fn terminate(&self) {
        if !self.begin_shutdown(ConnectionState::Terminated) {
            return;
        }
        debug!("terminating connection");

        self.interrupt_all();
        self.cache.lock().drain();
        self.release_transport();
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection with a prepared statement cache.
///
/// Operations may be issued concurrently from several tasks through a shared
/// reference; they are serialised on the wire. Dropping the connection
/// terminates it.
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.config.host)
            .field("database", &self.inner.config.database)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Connect to a PostgreSQL server.
    pub async fn connect(url: &str) -> PgResult<Self> {
        let config = Config::from_url(url)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: Config) -> PgResult<Self> {
        let timeout = config.connect_timeout;
        let connect = async {
            let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
            stream.set_nodelay(true)?;
            Self::establish(Box::new(stream), config.clone()).await
        };
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| PgError::Timeout)?
    }

    /// Run the startup handshake over an already connected stream.
    pub async fn connect_stream<S>(stream: S, config: Config) -> PgResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let timeout = config.connect_timeout;
        tokio::time::timeout(timeout, Self::establish(Box::new(stream), config))
            .await
            .map_err(|_| PgError::Timeout)?
    }

    async fn establish(stream: Box<dyn super::wire::Socket>, config: Config) -> PgResult<Self> {
        let parameters = ServerParameters::default();
        let (wire, backend_key) =
            Wire::startup(stream, &config, Arc::clone(&parameters)).await?;
        debug!(
            host = %config.host,
            database = %config.database,
            backend_pid = backend_key.process_id,
            "connected"
        );

        let inner = Arc::new(Inner {
            io: AsyncMutex::new(Some(wire)),
            control: Mutex::new(Control {
                state: ConnectionState::Open,
                next_ticket: 0,
                in_flight: HashMap::new(),
            }),
            cache: Mutex::new(StatementCache::new(config.statement_cache_capacity)),
            config,
            next_statement: AtomicU64::new(1),
            parameters,
            backend_key,
        });
        Ok(Self { inner })
    }

    /// Prepare `query`, reusing the cached statement for identical text.
    ///
    /// Server errors (syntax, unknown columns) surface here, and nothing is
    /// cached for a failed prepare.
    pub async fn prepare(&self, query: &str) -> PgResult<PreparedStatement> {
        self.inner.prepare(query).await
    }

    /// `prepare(query)` then [`PreparedStatement::fetch`].
    pub async fn fetch(&self, query: &str, params: &[Value]) -> PgResult<Vec<Row>> {
        self.prepare(query).await?.fetch(params).await
    }

    /// `prepare(query)` then [`PreparedStatement::fetch_row`].
    pub async fn fetch_row(&self, query: &str, params: &[Value]) -> PgResult<Option<Row>> {
        self.prepare(query).await?.fetch_row(params).await
    }

    /// `prepare(query)` then [`PreparedStatement::fetch_value`].
    pub async fn fetch_value(&self, query: &str, params: &[Value]) -> PgResult<Option<Value>> {
        self.prepare(query).await?.fetch_value(params).await
    }

    /// Run one or more SQL commands with the simple query protocol and
    /// return the last command tag (e.g. `"INSERT 0 1"`). Rows are discarded.
    pub async fn execute(&self, sql: &str) -> PgResult<String> {
        self.inner.execute_script(sql).await
    }

    /// Close gracefully.
    ///
    /// In-flight operations fail with [`PgError::ClosedMidOperation`], every
    /// statement is closed, and queued statement closes plus `Terminate` are
    /// sent best-effort within the configured close timeout. Closing an
    /// already closed connection does nothing.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Close immediately, without talking to the server.
    pub fn terminate(&self) {
        self.inner.terminate()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    /// A parameter the server reported (e.g. `server_version`).
    pub fn server_parameter(&self, name: &str) -> Option<String> {
        self.inner.parameters.read().get(name).cloned()
    }

    /// Process id of the server backend.
    pub fn backend_pid(&self) -> i32 {
        self.inner.backend_key.process_id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.terminate();
    }
}
