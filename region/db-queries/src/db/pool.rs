// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database connection pooling
//!
//! Ordinary queries and transactions borrow a connection from the bb8 pool
//! for as long as they run.  Session-scoped advisory locks need more than
//! that: they stay with the PostgreSQL backend that took them, so a pooled
//! connection handed back with a lock still held would leak it to whoever
//! borrows it next.  [`Pool::claim`] therefore opens a dedicated
//! [`Connection`] outside the pool, and closing (or dropping) that connection
//! ends the backend session along with every lock it holds.

use super::config::DatabaseConfig;
use super::error::Error;
use async_bb8_diesel::AsyncSimpleConnection;
use async_bb8_diesel::ConnectionError;
use async_bb8_diesel::ConnectionManager;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::Connection as _;
use diesel::QueryableByName;
use slog::Logger;
use std::fmt;

pub type DbConnection = diesel::PgConnection;

/// A connection borrowed from the pool, returned to it when dropped.
pub type DataStoreConnection<'a> =
    bb8::PooledConnection<'a, ConnectionManager<DbConnection>>;

/// Identifies one database session: the process id of its backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wrapper around a database connection pool.
///
/// Expected to be used as the primary interface to the database.
#[derive(Clone)]
pub struct Pool {
    log: Logger,
    url: String,
    pool: bb8::Pool<ConnectionManager<DbConnection>>,
}

impl Pool {
    /// Creates a new pool for the database at `config.url`.
    ///
    /// No connection is attempted until one is needed; a database that is
    /// not up yet shows up as errors from [`Pool::pool`] users and
    /// [`Pool::claim`].
    pub fn new(log: &Logger, config: &DatabaseConfig) -> Self {
        let url = config.url.clone();
        let log = log.new(o!(
            "database_url" => url.clone(),
            "component" => "db::Pool"
        ));
        info!(&log, "database connection pool");
        let error_sink = LoggingErrorSink::new(log.clone());
        let manager = ConnectionManager::<DbConnection>::new(&url);
        let pool = bb8::Builder::new()
            .max_size(config.max_connections)
            .error_sink(Box::new(error_sink))
            .build_unchecked(manager);
        Pool { log, url, pool }
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &bb8::Pool<ConnectionManager<DbConnection>> {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens a new session outside the pool, for work that takes
    /// session-scoped advisory locks.
    pub async fn claim(&self) -> Result<Connection, Error> {
        let url = self.url.clone();
        let conn = tokio::task::spawn_blocking(move || {
            DbConnection::establish(&url)
        })
        .await
        .map_err(|e| {
            Error::internal_error(&format!("connection task failed: {e}"))
        })?
        .map_err(|e| Error::ServiceUnavailable {
            internal_message: format!("Failed to open database session: {e}"),
        })?;
        let conn = async_bb8_diesel::Connection::new(conn);

        let BackendPid { pid } = diesel::sql_query(
            "SELECT pg_backend_pid() AS pid",
        )
        .get_result_async(&conn)
        .await
        .map_err(|e| Error::ServiceUnavailable {
            internal_message: format!("Failed to identify database session: {e}"),
        })?;
        let session = SessionId(pid);
        let log = self.log.new(o!("session" => session.to_string()));
        debug!(&log, "opened session");
        Ok(Connection { log, session, conn: Some(conn) })
    }
}

#[derive(QueryableByName)]
struct BackendPid {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pid: i32,
}

/// One database session, held outside the pool.
pub struct Connection {
    log: Logger,
    session: SessionId,
    conn: Option<async_bb8_diesel::Connection<DbConnection>>,
}

impl Connection {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// The underlying connection, or `None` once this session is closed.
    pub fn session(&self) -> Option<&async_bb8_diesel::Connection<DbConnection>> {
        self.conn.as_ref()
    }

    /// Ends the session.  Every advisory lock it holds is released before
    /// this returns.
    pub async fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // Dropping the connection also releases them, but only once the
        // backend has noticed the disconnect.
        if let Err(error) =
            conn.batch_execute_async("SELECT pg_advisory_unlock_all()").await
        {
            warn!(
                &self.log,
                "failed to release advisory locks before closing";
                "error_message" => #%error,
            );
        }
        debug!(&self.log, "closed session");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Clone, Debug)]
struct LoggingErrorSink {
    log: Logger,
}

impl LoggingErrorSink {
    fn new(log: Logger) -> LoggingErrorSink {
        LoggingErrorSink { log }
    }
}

impl bb8::ErrorSink<ConnectionError> for LoggingErrorSink {
    fn sink(&self, error: ConnectionError) {
        error!(
            &self.log,
            "database connection error";
            "error_message" => #%error
        );
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<ConnectionError>> {
        Box::new(self.clone())
    }
}
