//! The command envelope shared with the server-side script.
//!
//! Every queue operation is a single `EVALSHA` of the script loaded at
//! construction: `(command, now, arg...)` in, an opaque reply out. The
//! script is the authority for queue semantics; this module only owns the
//! envelope and the error translation.

use crate::clock::{format_seconds, SharedClock};
use crate::error::{QuillError, QuillResult};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Value;
use tracing::debug;

/// The seam between the client and the server.
///
/// `ScriptClient` is the production implementation; tests substitute a stub
/// that scripts the replies.
#[async_trait]
pub trait ScriptInvoker: Send + Sync {
    /// Invoke the loaded script with `(command, now, args...)`.
    async fn invoke(&self, command: &str, args: Vec<String>) -> QuillResult<Value>;

    /// Run a plain command on the same connection pool. Used for the few
    /// keys the client reads and writes directly, bypassing the script.
    async fn command(&self, cmd: redis::Cmd) -> QuillResult<Value>;

    /// Run a pipeline on the same connection pool.
    async fn pipeline(&self, pipe: redis::Pipeline) -> QuillResult<Value>;
}

/// Production invoker: a connection pool plus the script registered on it.
pub struct ScriptClient {
    pool: Pool,
    script: redis::Script,
    clock: SharedClock,
}

impl ScriptClient {
    /// Build an invoker from a pool and the script source. The sha is
    /// computed locally; `redis::Script` re-sends the source once if the
    /// server has evicted it.
    pub fn new(pool: Pool, source: &str, clock: SharedClock) -> Self {
        Self {
            pool,
            script: redis::Script::new(source),
            clock,
        }
    }

    async fn conn(&self) -> QuillResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

/// The script reports every semantic rejection as a redis response error;
/// anything else is a transport problem.
fn translate(err: redis::RedisError) -> QuillError {
    if err.kind() == redis::ErrorKind::ResponseError {
        let message = err
            .detail()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        QuillError::Domain(message)
    } else {
        QuillError::Transport(err)
    }
}

#[async_trait]
impl ScriptInvoker for ScriptClient {
    async fn invoke(&self, command: &str, args: Vec<String>) -> QuillResult<Value> {
        let mut conn = self.conn().await?;
        let now = format_seconds(self.clock.now());
        debug!(command, args = args.len(), "Invoking script");

        let mut invocation = self.script.prepare_invoke();
        invocation.arg(command).arg(&now);
        for arg in &args {
            invocation.arg(arg);
        }
        invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(translate)
    }

    async fn command(&self, cmd: redis::Cmd) -> QuillResult<Value> {
        let mut conn = self.conn().await?;
        Ok(cmd.query_async(&mut *conn).await?)
    }

    async fn pipeline(&self, pipe: redis::Pipeline) -> QuillResult<Value> {
        let mut conn = self.conn().await?;
        Ok(pipe.query_async(&mut *conn).await?)
    }
}

/// Create the command connection pool.
pub async fn create_pool(url: &str, size: usize) -> QuillResult<Pool> {
    let cfg = deadpool_redis::Config::from_url(url);
    let pool = cfg
        .builder()
        .map_err(|e| QuillError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(size)
        .runtime(deadpool_redis::Runtime::Tokio1)
        .build()
        .map_err(|e| QuillError::Configuration(format!("Failed to create pool: {}", e)))?;
    Ok(pool)
}
