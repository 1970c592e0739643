// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Advisory locks
//!
//! These are PostgreSQL's advisory locks, in their two-key form. A lock is
//! identified by a fixed namespace and an integer key, and is held either
//! for the lifetime of a session ([`DatabaseLock`]) or until the end of the
//! current transaction ([`DatabaseXactLock`]).
//!
//! Locks are reentrant: a session may take the same lock several times and
//! must release it as many times. A session never conflicts with itself. An
//! exclusive hold conflicts with every hold by another session; a shared
//! hold conflicts only with another session's exclusive hold.  Locks are
//! taken in the current database, so every region process sharing that
//! database contends for them.

use super::pool::Connection;
use super::pool::DbConnection;
use super::pool::Pool;
use async_bb8_diesel::AsyncConnection;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::connection::TransactionManager;
use diesel::sql_types;
use diesel::QueryableByName;
use std::fmt;

/// Namespace shared by every advisory lock the region takes.
pub const LOCK_NAMESPACE: i32 = 20120116;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId {
    pub namespace: i32,
    pub key: i32,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "advisory lock ({}, {})", self.namespace, self.key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Exclusive => f.write_str("exclusive"),
            LockMode::Shared => f.write_str("shared"),
        }
    }
}

/// Misuse of an advisory lock, or a failure talking to the database while
/// taking or releasing one.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("{lock} cannot be taken: the connection is not open")]
    LockAttemptWithoutConnection { lock: LockId },
    #[error("{lock} cannot be taken: no transaction is in progress")]
    LockAttemptOutsideTransaction { lock: LockId },
    #[error("{lock} is not held in {mode} mode by this session")]
    LockNotHeld { lock: LockId, mode: LockMode },
    #[error("{lock} is held by another session")]
    LockNotAvailable { lock: LockId },
    #[error("{lock}: database error: {message}")]
    Database { lock: LockId, message: String },
}

#[derive(QueryableByName)]
struct LockResult {
    #[diesel(sql_type = sql_types::Bool)]
    locked: bool,
}

// Runs one of the `pg_*advisory*` functions on `lock`.  Functions that wait
// return void, and report `true` once they do.
async fn advisory_call(
    conn: &async_bb8_diesel::Connection<DbConnection>,
    function: &str,
    lock: LockId,
) -> Result<bool, LockError> {
    let query = if function.contains("try") || function.contains("unlock") {
        format!("SELECT {function}($1, $2) AS locked")
    } else {
        format!("SELECT TRUE AS locked FROM {function}($1, $2)")
    };
    let result: LockResult = diesel::sql_query(query)
        .bind::<sql_types::Integer, _>(lock.namespace)
        .bind::<sql_types::Integer, _>(lock.key)
        .get_result_async(conn)
        .await
        .map_err(|e| LockError::Database { lock, message: e.to_string() })?;
    Ok(result.locked)
}

async fn is_locked(pool: &Pool, lock: LockId) -> Result<bool, LockError> {
    let conn = pool
        .pool()
        .get()
        .await
        .map_err(|e| LockError::Database { lock, message: e.to_string() })?;
    let result: LockResult = diesel::sql_query(
        "SELECT EXISTS (\
            SELECT 1 FROM pg_locks \
            WHERE locktype = 'advisory' AND granted \
            AND database = (\
                SELECT oid FROM pg_database WHERE datname = current_database()\
            ) \
            AND classid::bigint = $1 AND objid::bigint = $2 AND objsubid = 2\
        ) AS locked",
    )
    .bind::<sql_types::BigInt, _>(i64::from(lock.namespace))
    .bind::<sql_types::BigInt, _>(i64::from(lock.key))
    .get_result_async(&*conn)
    .await
    .map_err(|e| LockError::Database { lock, message: e.to_string() })?;
    Ok(result.locked)
}

/// A session-scoped advisory lock.
///
/// Taken with [`DatabaseLock::acquire`] and given back with
/// [`DatabaseLock::release`], or scoped with [`DatabaseLock::guard`].
/// Closing the connection releases it too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatabaseLock {
    id: LockId,
    mode: LockMode,
    wait: bool,
}

impl DatabaseLock {
    pub const fn new(key: i32) -> Self {
        DatabaseLock {
            id: LockId { namespace: LOCK_NAMESPACE, key },
            mode: LockMode::Exclusive,
            wait: true,
        }
    }

    /// This lock, but failing fast instead of waiting when it is busy.
    pub const fn nowait(self) -> Self {
        DatabaseLock { wait: false, ..self }
    }

    /// This lock, taken in shared mode.
    pub const fn shared(self) -> Self {
        DatabaseLock { mode: LockMode::Shared, ..self }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    fn session<'c>(
        &self,
        conn: &'c Connection,
    ) -> Result<&'c async_bb8_diesel::Connection<DbConnection>, LockError> {
        conn.session()
            .ok_or(LockError::LockAttemptWithoutConnection { lock: self.id })
    }

    pub async fn acquire(&self, conn: &Connection) -> Result<bool, LockError> {
        let function = match (self.mode, self.wait) {
            (LockMode::Exclusive, true) => "pg_advisory_lock",
            (LockMode::Exclusive, false) => "pg_try_advisory_lock",
            (LockMode::Shared, true) => "pg_advisory_lock_shared",
            (LockMode::Shared, false) => "pg_try_advisory_lock_shared",
        };
        advisory_call(self.session(conn)?, function, self.id).await
    }

    pub async fn try_acquire(
        &self,
        conn: &Connection,
    ) -> Result<bool, LockError> {
        self.nowait().acquire(conn).await
    }

    pub async fn release(&self, conn: &Connection) -> Result<(), LockError> {
        let function = match self.mode {
            LockMode::Exclusive => "pg_advisory_unlock",
            LockMode::Shared => "pg_advisory_unlock_shared",
        };
        if advisory_call(self.session(conn)?, function, self.id).await? {
            Ok(())
        } else {
            Err(LockError::LockNotHeld { lock: self.id, mode: self.mode })
        }
    }

    /// Whether any session holds this lock, in any mode.
    pub async fn is_locked(&self, pool: &Pool) -> Result<bool, LockError> {
        is_locked(pool, self.id).await
    }

    /// Takes the lock on `conn`, returning a guard that owns the connection
    /// until the lock is released.
    pub async fn guard(
        &self,
        conn: Connection,
    ) -> Result<DatabaseLockGuard, LockError> {
        if self.acquire(&conn).await? {
            Ok(DatabaseLockGuard { lock: *self, conn })
        } else {
            Err(LockError::LockNotAvailable { lock: self.id })
        }
    }
}

impl fmt::Display for DatabaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.mode)
    }
}

/// A held [`DatabaseLock`] and the session holding it.
///
/// [`DatabaseLockGuard::release`] gives the lock back and returns the
/// connection.  Dropping the guard instead closes the session, which
/// releases this lock along with anything else the session held.
#[derive(Debug)]
#[must_use = "dropping the guard closes the session holding the lock"]
pub struct DatabaseLockGuard {
    lock: DatabaseLock,
    conn: Connection,
}

impl DatabaseLockGuard {
    pub fn lock(&self) -> DatabaseLock {
        self.lock
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn release(self) -> Result<Connection, LockError> {
        self.lock.release(&self.conn).await?;
        Ok(self.conn)
    }
}

/// A transaction-scoped advisory lock.
///
/// Held until the transaction in progress on the connection commits or
/// rolls back; there is no way to give it back earlier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatabaseXactLock {
    id: LockId,
    mode: LockMode,
    wait: bool,
}

impl DatabaseXactLock {
    pub const fn new(key: i32) -> Self {
        DatabaseXactLock {
            id: LockId { namespace: LOCK_NAMESPACE, key },
            mode: LockMode::Exclusive,
            wait: true,
        }
    }

    pub const fn nowait(self) -> Self {
        DatabaseXactLock { wait: false, ..self }
    }

    pub const fn shared(self) -> Self {
        DatabaseXactLock { mode: LockMode::Shared, ..self }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Takes the lock in the transaction open on `conn`.
    ///
    /// Outside a transaction PostgreSQL would release the lock again as soon
    /// as the statement finished, so that is refused.
    pub async fn acquire(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
    ) -> Result<bool, LockError> {
        let depth = conn
            .run(|c| {
                <DbConnection as diesel::Connection>::TransactionManager::transaction_manager_status_mut(c)
                    .transaction_depth()
                    .map(|depth| depth.map_or(0, |d| d.get()))
            })
            .await
            .map_err(|e| LockError::Database {
                lock: self.id,
                message: e.to_string(),
            })?;
        if depth == 0 {
            return Err(LockError::LockAttemptOutsideTransaction {
                lock: self.id,
            });
        }
        let function = match (self.mode, self.wait) {
            (LockMode::Exclusive, true) => "pg_advisory_xact_lock",
            (LockMode::Exclusive, false) => "pg_try_advisory_xact_lock",
            (LockMode::Shared, true) => "pg_advisory_xact_lock_shared",
            (LockMode::Shared, false) => "pg_try_advisory_xact_lock_shared",
        };
        advisory_call(conn, function, self.id).await
    }

    pub async fn try_acquire(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
    ) -> Result<bool, LockError> {
        self.nowait().acquire(conn).await
    }

    pub async fn is_locked(&self, pool: &Pool) -> Result<bool, LockError> {
        is_locked(pool, self.id).await
    }
}

impl fmt::Display for DatabaseXactLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, transaction)", self.id, self.mode)
    }
}
