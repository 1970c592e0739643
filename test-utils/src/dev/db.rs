// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tools for managing a PostgreSQL server during development

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use camino_tempfile::Builder;
use camino_tempfile::Utf8TempDir;
use dropshot::test_util::log_prefix_for_test;
use dropshot::test_util::LogContext;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use crate::dev::poll;

/// Names a server to run the tests against instead of starting one.
///
/// The value is a URL without a database name, for example
/// `postgresql://postgres@127.0.0.1:5432`.  Each test creates (and drops) its
/// own database on that server.
pub const TEST_DATABASE_URL_ENV: &str = "REGION_TEST_DATABASE_URL";

/// Directory holding `initdb` and `postgres`, when they are not on `PATH`.
pub const PG_BINDIR_ENV: &str = "PG_BINDIR";

// Timeout used when starting up the postgres subprocess.
const POSTGRES_TIMEOUT: Duration = Duration::from_secs(30);

// The string to look for in the server log that indicates that the server is
// ready.
const POSTGRES_READY: &str = "database system is ready to accept connections";

/// User created by `initdb` and used for every test connection.
const POSTGRES_USER: &str = "postgres";

#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("failed to read postgres log file")]
    Io(#[from] std::io::Error),

    #[error("failed to detect postgres subprocess within timeout")]
    Timeout,
}

/// Builds the command lines for, and then starts, a throwaway server.
#[derive(Debug)]
pub struct PostgresStarter {
    temp_dir: Utf8TempDir,
    bindir: Option<Utf8PathBuf>,
    port: u16,
}

impl PostgresStarter {
    pub fn new(logctx: &LogContext) -> Result<Self, anyhow::Error> {
        let (parent_dir, prefix) = log_prefix_for_test(logctx.test_name());
        let temp_dir = Builder::new()
            .prefix(&format!("{prefix}-postgres-"))
            .tempdir_in(parent_dir)
            .context("failed to create tempdir for postgres data")?;
        let bindir = std::env::var(PG_BINDIR_ENV).ok().map(Utf8PathBuf::from);

        // postgres cannot be asked to pick its own port.  Find one that is
        // free now and hope no one takes it before the server binds it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .context("failed to find a free port")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        Ok(PostgresStarter { temp_dir, bindir, port })
    }

    pub fn temp_dir(&self) -> &Utf8Path {
        self.temp_dir.path()
    }

    pub fn data_dir(&self) -> Utf8PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn log_path(&self) -> Utf8PathBuf {
        self.temp_dir.path().join("postgres.log")
    }

    fn command(&self, program: &str) -> tokio::process::Command {
        let program = match &self.bindir {
            Some(dir) => dir.join(program).into_string(),
            None => program.to_string(),
        };
        tokio::process::Command::new(program)
    }

    pub fn cmdline(&self) -> Vec<String> {
        vec![
            "postgres".to_string(),
            "-D".to_string(),
            self.data_dir().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-k".to_string(),
            self.temp_dir().to_string(),
            "-c".to_string(),
            "listen_addresses=127.0.0.1".to_string(),
            "-c".to_string(),
            "fsync=off".to_string(),
        ]
    }

    /// Initialize a cluster in the temporary directory and start a server on
    /// it, returning once the server accepts connections.
    pub async fn start(self) -> Result<PostgresInstance, anyhow::Error> {
        let data_dir = self.data_dir();
        let output = self
            .command("initdb")
            .args(["-D", data_dir.as_str()])
            .args(["-U", POSTGRES_USER])
            .args(["--auth=trust", "--no-sync", "--encoding=UTF8"])
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to spawn `initdb`")?;
        if !output.status.success() {
            anyhow::bail!(
                "initdb failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let log_file = std::fs::File::create(self.log_path())
            .context("failed to create postgres log file")?;
        let args = self.cmdline();
        let child = self
            .command(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log_file)
            .spawn()
            .with_context(|| {
                format!("failed to spawn `postgres` (with args: {:?})", &args)
            })?;

        let log_path = self.log_path();
        let mut instance = PostgresInstance {
            server_url: format!(
                "postgresql://{POSTGRES_USER}@127.0.0.1:{}",
                self.port
            ),
            child: Some(child),
            temp_dir: Some(self.temp_dir),
        };
        if let Err(error) = wait_for_ready(&log_path).await {
            let _ = instance.cleanup().await;
            return Err(error);
        }
        Ok(instance)
    }
}

/// A running server, or one named by [`TEST_DATABASE_URL_ENV`].
#[derive(Debug)]
pub struct PostgresInstance {
    server_url: String,
    child: Option<tokio::process::Child>,
    temp_dir: Option<Utf8TempDir>,
}

impl PostgresInstance {
    /// An instance for a server someone else runs; cleaning it up leaves the
    /// server alone.
    pub fn external(server_url: &str) -> Self {
        PostgresInstance {
            server_url: server_url.trim_end_matches('/').to_string(),
            child: None,
            temp_dir: None,
        }
    }

    /// URL of the server, without a database name.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// URL for the database `name` on this server.
    pub fn database_url(&self, name: &str) -> String {
        format!("{}/{}", self.server_url, name)
    }

    /// Return the child PID, if we started the server
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// Kill the server process, if we started one, and remove its directory.
    pub async fn cleanup(&mut self) -> Result<(), anyhow::Error> {
        if let Some(mut child) = self.child.take() {
            child.start_kill().context("Sending SIGKILL to child")?;
            child.wait().await.context("waiting for child")?;
        }
        if let Some(dir) = self.temp_dir.take() {
            dir.close().context("cleaning up postgres temporary directory")?;
        }
        Ok(())
    }
}

impl Drop for PostgresInstance {
    fn drop(&mut self) {
        if self.child.is_some() || self.temp_dir.is_some() {
            let maybe_pid = self
                .pid()
                .map(|id| format!("(PID {})", id))
                .unwrap_or_else(String::new);
            eprintln!(
                "WARN: dropped PostgresInstance without cleaning it up first \
                (there may still be a child process running {maybe_pid} and a \
                temporary directory leaked)"
            );
            if let Some(child) = self.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

// Wait for the server log to report that connections are accepted.
async fn wait_for_ready(log_path: &Utf8Path) -> Result<(), anyhow::Error> {
    poll::wait_for_condition(
        || async {
            match log_contains(log_path, POSTGRES_READY).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(poll::CondCheckError::NotYet),
                Err(e) => Err(poll::CondCheckError::Failed(e)),
            }
        },
        &Duration::from_millis(100),
        &POSTGRES_TIMEOUT,
    )
    .await
    .map_err(|error| match error {
        poll::Error::TimedOut(_) => PostgresError::Timeout,
        poll::Error::PermanentError(e) => e,
    })
    .with_context(|| {
        format!("waiting for postgres to be ready (log: {log_path})")
    })
}

async fn log_contains(
    path: &Utf8Path,
    needle: &str,
) -> Result<bool, PostgresError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        if line.contains(needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Start a server for one test, or use the one named by
/// [`TEST_DATABASE_URL_ENV`].
pub async fn start_for_test(
    logctx: &LogContext,
) -> Result<PostgresInstance, anyhow::Error> {
    if let Ok(url) = std::env::var(TEST_DATABASE_URL_ENV) {
        return Ok(PostgresInstance::external(&url));
    }
    PostgresStarter::new(logctx)?.start().await
}
