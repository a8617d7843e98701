use r2d2::{Pool, PooledConnection};
use rusqlite::InterruptHandle;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::db_pool::SqliteConnectionManager;
use crate::db::executor::{self, ErrorClass, ExecutionOutcome};
use crate::db::inspector;
use crate::db::schema::SchemaDescriptor;
use crate::db::SchemaReadError;

type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// One checked-out connection, owned by the request that is answering a question.
///
/// All database work runs on the blocking pool. Dropping a pending call (timeout or
/// cancellation) interrupts whatever statement the connection is running.
pub struct DatabaseHandle {
    name: String,
    conn: Arc<Mutex<SqliteConnection>>,
    interrupt: InterruptHandle,
}

impl DatabaseHandle {
    pub async fn checkout(
        name: &str,
        pool: &Pool<SqliteConnectionManager>,
    ) -> Result<Self, SchemaReadError> {
        let pool = pool.clone();
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| SchemaReadError::Unavailable(format!("connection task failed: {}", e)))??;
        let interrupt = conn.get_interrupt_handle();

        debug!("Checked out connection for database {}", name);
        Ok(Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn inspect_schema(
        &self,
        sample_size: usize,
    ) -> Result<SchemaDescriptor, SchemaReadError> {
        let conn = Arc::clone(&self.conn);
        let mut guard = InterruptOnDrop::new(&self.interrupt);

        let result = tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| SchemaReadError::Unavailable("connection lock poisoned".to_string()))?;
            inspector::inspect(&conn, sample_size)
        })
        .await;
        guard.disarm();

        result.map_err(|e| SchemaReadError::Unavailable(format!("schema task failed: {}", e)))?
    }

    /// Runs an accepted statement with a wall-clock bound and a row cap.
    pub async fn execute(
        &self,
        statement: &str,
        timeout: Duration,
        row_cap: usize,
    ) -> ExecutionOutcome {
        let conn = Arc::clone(&self.conn);
        let statement = statement.to_string();
        let mut guard = InterruptOnDrop::new(&self.interrupt);

        let task = tokio::task::spawn_blocking(move || match conn.lock() {
            Ok(mut conn) => executor::execute_read_only(&mut conn, &statement, row_cap),
            Err(_) => ExecutionOutcome::Failure {
                message: "connection lock poisoned".to_string(),
                class: ErrorClass::Engine,
            },
        });

        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => ExecutionOutcome::Failure {
                message: format!("execution task failed: {}", join_err),
                class: ErrorClass::Engine,
            },
            Err(_) => {
                warn!("Query on {} exceeded {:?}, interrupting", self.name, timeout);
                self.interrupt.interrupt();
                ExecutionOutcome::Failure {
                    message: format!(
                        "query exceeded the execution timeout of {} ms",
                        timeout.as_millis()
                    ),
                    class: ErrorClass::Timeout,
                }
            }
        };
        guard.disarm();
        outcome
    }
}

/// Interrupts the connection unless the blocking call it guards finished normally.
struct InterruptOnDrop<'a> {
    handle: Option<&'a InterruptHandle>,
}

impl<'a> InterruptOnDrop<'a> {
    fn new(handle: &'a InterruptHandle) -> Self {
        Self { handle: Some(handle) }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Pending database call dropped, interrupting connection");
            handle.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::build_pool;
    use crate::db::test_support::employees_db;

    #[tokio::test]
    async fn inspect_and_execute_through_handle() {
        let (_dir, path) = employees_db();
        let pool = build_pool(path, 1, Duration::from_millis(100)).unwrap();
        let handle = DatabaseHandle::checkout("company", &pool).await.unwrap();

        let schema = handle.inspect_schema(3).await.unwrap();
        assert_eq!(schema.table_names(), vec!["employees"]);

        let outcome = handle
            .execute("SELECT name FROM employees ORDER BY salary DESC", Duration::from_secs(5), 10)
            .await;
        match outcome {
            ExecutionOutcome::Success(result) => {
                assert_eq!(result.rows[0][0], serde_json::json!("Carol"))
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn runaway_query_is_interrupted_at_timeout() {
        let (_dir, path) = employees_db();
        let pool = build_pool(path, 1, Duration::from_millis(100)).unwrap();
        let handle = DatabaseHandle::checkout("company", &pool).await.unwrap();

        let endless = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                       SELECT COUNT(*) FROM n";
        let outcome = handle.execute(endless, Duration::from_millis(200), 10).await;
        assert!(matches!(outcome, ExecutionOutcome::Failure { class: ErrorClass::Timeout, .. }));

        // The interrupted statement released the connection for the next attempt
        let outcome = handle
            .execute("SELECT COUNT(*) FROM employees", Duration::from_secs(5), 10)
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Success(_)));
    }
}
