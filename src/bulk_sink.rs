//! Batched bulk sink: a typed-input node terminating in a tabular store.
//!
//! The internal graph is `input → batcher(N) → writer`: a [`BatchBlock`]
//! groups records into arrays of the configured bulk size, and an
//! [`ActionBlock`] writes each array to the store inside one transaction. A
//! periodic flush timer triggers the batcher so a slow trickle of records
//! still reaches the store; the timer stops when the sink completes.
//!
//! Each array moves through `queued → writing → committed` or
//! `queued → writing → rolled back`; a store error rolls back only the
//! current array's transaction, fails the sink, and is never retried.
//!
//! The store itself sits behind the [`BulkStore`] seam. [`PgBulkStore`] is
//! the PostgreSQL implementation over sqlx; an object-to-column
//! [`RowMapper`] supplies the column projection named by the target table's
//! mapping label.

use crate::block::{ActionBlock, BatchBlock, InputEndpoint};
use crate::dependency::ChildOptions;
use crate::error::FlowError;
use crate::flow::{next_default_name, Flow, FlowCore, FlowGraph};
use crate::input_flow::{FlowInput, InputFlow};
use crate::options::FlowOptions;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::{Connection, Postgres};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Default number of records per bulk write.
pub const DEFAULT_BULK_SIZE: usize = 4096 * 2;

/// Default period of the flush timer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Statement timeout applied to each bulk write connection.
///
/// Carried over verbatim from the legacy ingest job: thirty minutes written
/// as milliseconds, applied to a setting that reads bare numbers as seconds.
/// TODO: confirm the intended unit with the warehouse operators before
/// changing it.
const BULK_WRITE_TIMEOUT_SECS: u64 = 30 * 60 * 1000;

/// Descriptor of the table a bulk sink writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTable {
  /// Connection URL of the store.
  pub connection_url: String,
  /// Physical table name.
  pub table_name: String,
  /// Label naming which column projection the row mapper implements.
  pub mapping: String,
}

impl TargetTable {
  /// Creates a descriptor with an empty mapping label.
  #[must_use]
  pub fn new(connection_url: impl Into<String>, table_name: impl Into<String>) -> Self {
    Self {
      connection_url: connection_url.into(),
      table_name: table_name.into(),
      mapping: String::new(),
    }
  }

  /// Sets the mapping label.
  #[must_use]
  pub fn with_mapping(mut self, mapping: impl Into<String>) -> Self {
    self.mapping = mapping.into();
    self
  }
}

/// Configuration of a bulk sink.
#[derive(Debug, Clone)]
pub struct BulkSinkConfig {
  /// Records per bulk write.
  pub bulk_size: usize,
  /// Period of the unconditional flush trigger.
  pub flush_interval: Duration,
  /// Node name; generated when absent.
  pub name: Option<String>,
}

impl Default for BulkSinkConfig {
  fn default() -> Self {
    Self {
      bulk_size: DEFAULT_BULK_SIZE,
      flush_interval: DEFAULT_FLUSH_INTERVAL,
      name: None,
    }
  }
}

impl BulkSinkConfig {
  /// Sets the bulk size.
  #[must_use]
  pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
    self.bulk_size = bulk_size;
    self
  }

  /// Sets the flush interval.
  #[must_use]
  pub fn with_flush_interval(mut self, interval: Duration) -> Self {
    self.flush_interval = interval;
    self
  }

  /// Sets the node name.
  #[must_use]
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }
}

/// Object-to-column seam: projects a record onto the columns named by the
/// target table's mapping label.
pub trait RowMapper<T>: Send + Sync + 'static {
  /// Column names, in bind order.
  fn columns(&self) -> &[String];

  /// Column values for one record, in [`columns`](RowMapper::columns) order.
  fn values(&self, row: &T) -> Vec<serde_json::Value>;
}

/// Transactional store seam used by the bulk sink.
///
/// One connection serves one array: `open` connects and begins the
/// transaction, `write` streams the array into the store, and exactly one of
/// `commit` / `rollback` ends it. The connection closes when dropped.
#[async_trait]
pub trait BulkStore<T>: Send + Sync + 'static {
  /// Open connection with a started transaction.
  type Conn: Send;
  /// Store-side error type.
  type Error: std::error::Error + Send + Sync + 'static;

  /// Connects to the store and begins a transaction.
  async fn open(&self, table: &TargetTable) -> Result<Self::Conn, Self::Error>;

  /// Writes the array inside the open transaction.
  async fn write(
    &self,
    conn: &mut Self::Conn,
    table: &TargetTable,
    rows: &[T],
  ) -> Result<(), Self::Error>;

  /// Commits the open transaction.
  async fn commit(&self, conn: &mut Self::Conn) -> Result<(), Self::Error>;

  /// Rolls the open transaction back.
  async fn rollback(&self, conn: &mut Self::Conn) -> Result<(), Self::Error>;

  /// True when the error reports a null value hitting a non-nullable column.
  fn is_null_violation(&self, _error: &Self::Error) -> bool {
    false
  }
}

/// PostgreSQL implementation of [`BulkStore`] over sqlx.
pub struct PgBulkStore<T, M> {
  mapper: M,
  _marker: PhantomData<fn(T) -> T>,
}

impl<T, M> PgBulkStore<T, M>
where
  M: RowMapper<T>,
{
  /// Creates a store writing through `mapper`.
  pub fn new(mapper: M) -> Self {
    Self {
      mapper,
      _marker: PhantomData,
    }
  }

  /// The row mapper backing this store.
  pub fn mapper(&self) -> &M {
    &self.mapper
  }
}

#[async_trait]
impl<T, M> BulkStore<T> for PgBulkStore<T, M>
where
  T: Send + Sync + 'static,
  M: RowMapper<T>,
{
  type Conn = PgConnection;
  type Error = sqlx::Error;

  async fn open(&self, table: &TargetTable) -> Result<PgConnection, sqlx::Error> {
    let mut conn = PgConnection::connect(&table.connection_url).await?;
    sqlx::query(&format!(
      "SET statement_timeout = '{BULK_WRITE_TIMEOUT_SECS}s'"
    ))
    .execute(&mut conn)
    .await?;
    sqlx::query("BEGIN").execute(&mut conn).await?;
    Ok(conn)
  }

  async fn write(
    &self,
    conn: &mut PgConnection,
    table: &TargetTable,
    rows: &[T],
  ) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
      return Ok(());
    }
    let columns = self.mapper.columns();
    if columns.is_empty() {
      return Err(sqlx::Error::Protocol(format!(
        "row mapping '{}' produced no columns",
        table.mapping
      )));
    }
    // Stay under the wire protocol's u16 bind-parameter limit.
    let rows_per_statement = (u16::MAX as usize / columns.len()).max(1);
    for chunk in rows.chunks(rows_per_statement) {
      let mut tuples = Vec::with_capacity(chunk.len());
      for row_index in 0..chunk.len() {
        let placeholders: Vec<String> = (0..columns.len())
          .map(|col_index| format!("${}", row_index * columns.len() + col_index + 1))
          .collect();
        tuples.push(format!("({})", placeholders.join(", ")));
      }
      let statement = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.table_name,
        columns.join(", "),
        tuples.join(", ")
      );
      let mut query = sqlx::query(&statement);
      for row in chunk {
        for value in self.mapper.values(row) {
          query = bind_value(query, value)?;
        }
      }
      query.execute(&mut *conn).await?;
    }
    Ok(())
  }

  async fn commit(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(())
  }

  async fn rollback(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("ROLLBACK").execute(&mut *conn).await?;
    Ok(())
  }

  fn is_null_violation(&self, error: &sqlx::Error) -> bool {
    // SQLSTATE 23502: not-null violation.
    error
      .as_database_error()
      .and_then(|db| db.code())
      .is_some_and(|code| code == "23502")
  }
}

fn bind_value<'q>(
  query: sqlx::query::Query<'q, Postgres, PgArguments>,
  value: serde_json::Value,
) -> Result<sqlx::query::Query<'q, Postgres, PgArguments>, sqlx::Error> {
  let bound = match value {
    serde_json::Value::Null => query.bind(None::<String>),
    serde_json::Value::Bool(b) => query.bind(b),
    serde_json::Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        query.bind(i)
      } else if let Some(f) = n.as_f64() {
        query.bind(f)
      } else {
        return Err(sqlx::Error::Protocol(
          "unsupported number type for a bind parameter".into(),
        ));
      }
    }
    serde_json::Value::String(s) => query.bind(s),
    value @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
      let json = serde_json::to_string(&value)
        .map_err(|e| sqlx::Error::Protocol(format!("unserialisable bind parameter: {e}")))?;
      query.bind(json)
    }
  };
  Ok(bound)
}

/// Hook invoked after a batch commits, on the same open connection, before
/// the connection closes.
pub type PostInsertHook<T, C> = Arc<
  dyn for<'a> Fn(&'a mut C, &'a TargetTable, &'a [T]) -> BoxFuture<'a, Result<(), FlowError>>
    + Send
    + Sync,
>;

/// Typed-input node batching records and writing them transactionally to a
/// tabular store.
pub struct DbBulkSink<T, S>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  inner: InputFlow<T>,
  target: TargetTable,
  store: Arc<S>,
  bulk_size: usize,
  trigger: Arc<Notify>,
}

impl<T, S> Clone for DbBulkSink<T, S>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      target: self.target.clone(),
      store: self.store.clone(),
      bulk_size: self.bulk_size,
      trigger: self.trigger.clone(),
    }
  }
}

impl<T, S> DbBulkSink<T, S>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  /// Creates a sink without a post-insert hook.
  pub fn new(target: TargetTable, store: S, options: FlowOptions, config: BulkSinkConfig) -> Self {
    Self::build(target, store, options, config, None)
  }

  /// Creates a sink whose hook runs after every committed batch.
  pub fn with_hook(
    target: TargetTable,
    store: S,
    options: FlowOptions,
    config: BulkSinkConfig,
    hook: PostInsertHook<T, S::Conn>,
  ) -> Self {
    Self::build(target, store, options, config, Some(hook))
  }

  fn build(
    target: TargetTable,
    store: S,
    options: FlowOptions,
    config: BulkSinkConfig,
    hook: Option<PostInsertHook<T, S::Conn>>,
  ) -> Self {
    let name = config
      .name
      .unwrap_or_else(|| next_default_name("DbBulkSink"));
    let bulk_size = config.bulk_size.max(1);
    let store = Arc::new(store);
    let flow = Flow::named(name.clone(), options.clone());

    // The writer queue holds whole arrays, so its bound and concurrency are
    // the configured item bound divided by the bulk size: row-level pressure
    // stays within the configured ceiling.
    let batch_bound = options.bounded_capacity.map(|c| (c / bulk_size).max(1));
    let concurrency = options
      .bounded_capacity
      .map(|c| (c / bulk_size).max(1))
      .unwrap_or(1);
    let writer_options = options
      .to_execution_block_options()
      .with_bounded_capacity(batch_bound);

    let action_store = store.clone();
    let action_target = target.clone();
    let action_hook = hook.clone();
    let action_name = name.clone();
    let writer = ActionBlock::new(
      format!("{name}.writer"),
      writer_options,
      concurrency,
      move |batch: Vec<T>| {
        let store = action_store.clone();
        let target = action_target.clone();
        let hook = action_hook.clone();
        let flow = action_name.clone();
        async move { write_batch(store, target, hook, flow, batch).await }
      },
    );

    let batcher = BatchBlock::new(
      format!("{name}.batcher"),
      options.to_grouping_block_options(),
      bulk_size,
      writer.input().clone(),
    );

    flow
      .register_block_with(
        batcher.handle(),
        ChildOptions::default().with_display_name("batcher"),
      )
      .expect("fresh block cannot collide with an existing child");
    flow
      .register_block_with(
        writer.handle(),
        ChildOptions::default().with_display_name("writer"),
      )
      .expect("fresh block cannot collide with an existing child");

    // Operators read row-level pressure: pending arrays count as bulk_size
    // rows each.
    let batcher_handle = batcher.handle().clone();
    let writer_handle = writer.handle().clone();
    flow.core().set_status_override(Box::new(move || {
      let (batch_in, _) = batcher_handle.buffer_status();
      let (writer_in, _) = writer_handle.buffer_status();
      (batch_in + writer_in * bulk_size, 0)
    }));

    let trigger = batcher.trigger_handle();
    let inner = InputFlow::new(flow, batcher.input().clone());

    // Flush timer, bound to the sink's completion so it never outlives the
    // graph.
    let mut completion = inner.completion();
    let timer_trigger = trigger.clone();
    let flush_interval = config.flush_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(flush_interval);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = &mut completion => break,
          _ = ticker.tick() => timer_trigger.notify_one(),
        }
      }
    });

    Self {
      inner,
      target,
      store,
      bulk_size,
      trigger,
    }
  }

  /// Flushes the current partial batch, if any.
  pub fn trigger_batch(&self) {
    self.trigger.notify_one();
  }

  /// Descriptor of the table being written.
  pub fn target_table(&self) -> &TargetTable {
    &self.target
  }

  /// The store behind this sink.
  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Records per bulk write.
  pub fn bulk_size(&self) -> usize {
    self.bulk_size
  }
}

async fn write_batch<T, S>(
  store: Arc<S>,
  target: TargetTable,
  hook: Option<PostInsertHook<T, S::Conn>>,
  flow: String,
  batch: Vec<T>,
) -> Result<(), FlowError>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  debug!(flow = %flow, rows = batch.len(), "bulk write started");
  let mut conn = store
    .open(&target)
    .await
    .map_err(|e| store_error(&flow, e))?;
  if let Err(err) = store.write(&mut conn, &target, &batch).await {
    if store.is_null_violation(&err) {
      error!(
        flow = %flow,
        table = %target.table_name,
        "null value for a non-nullable column; the row mapping may be missing a non-null guard"
      );
    }
    if let Err(rollback_err) = store.rollback(&mut conn).await {
      warn!(flow = %flow, error = %rollback_err, "rollback failed after write error");
    }
    error!(flow = %flow, rows = batch.len(), error = %err, "bulk write rolled back");
    return Err(store_error(&flow, err));
  }
  store
    .commit(&mut conn)
    .await
    .map_err(|e| store_error(&flow, e))?;
  info!(flow = %flow, rows = batch.len(), table = %target.table_name, "batch committed");
  if let Some(hook) = hook.as_ref() {
    (hook.as_ref())(&mut conn, &target, &batch).await?;
  }
  Ok(())
}

fn store_error(flow: &str, err: impl std::error::Error + Send + Sync + 'static) -> FlowError {
  FlowError::Store {
    flow: flow.to_string(),
    inner: Arc::new(err),
  }
}

impl<T, S> FlowGraph for DbBulkSink<T, S>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  fn core(&self) -> &Arc<FlowCore> {
    self.inner.core()
  }
}

impl<T, S> FlowInput<T> for DbBulkSink<T, S>
where
  T: Send + Sync + 'static,
  S: BulkStore<T>,
{
  fn input_endpoint(&self) -> &InputEndpoint<T> {
    self.inner.input_endpoint()
  }
}
