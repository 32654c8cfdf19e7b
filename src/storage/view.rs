//! Materialized view controller.
//!
//! A view's rows live in a target table: either an existing table named at
//! creation (`TO` form) or an inner table the view creates and owns.
//! Incremental propagation of inserts into the view's source table is the
//! fan-out writer's job; this controller covers reads, direct writes,
//! on-demand total rebuild, scheduled periodic refresh, and the rename /
//! drop / truncate / alter lifecycle.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::block::{Block, SendableBlockStream};
use crate::catalog::{
    Catalog, SharedTableLock, Storage, StorageId, TableLock, TableType,
};
use crate::copy::copy_blocks;
use crate::error::{CinderError, Result};
use crate::fanout::PushingToViewsSink;
use crate::schedule::{SchedulePool, TaskHandle};
use crate::sink::{BoxedSink, Sink};
use crate::storage::MemoryTable;
use crate::transform::{BlockTransform, ConvertingTransform, TransformingBlockStream};
use crate::EngineSettings;

/// The saved SELECT of a view, in executable form.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    /// Table whose writes feed the view
    pub source_table_id: StorageId,
    /// Converts source-shaped batches into view-shaped batches
    pub transform: Arc<dyn BlockTransform>,
}

impl ViewDefinition {
    pub fn new(source_table_id: StorageId, transform: Arc<dyn BlockTransform>) -> Self {
        Self {
            source_table_id,
            transform,
        }
    }
}

/// Where a view's rows are stored.
#[derive(Debug, Clone)]
pub enum ViewTarget {
    /// An existing table supplied at creation
    To(StorageId),
    /// An inner table owned by the view; `attach` reuses the inner name
    /// without creating the table
    Inner { attach: bool },
}

/// Everything needed to create a materialized view.
#[derive(Debug, Clone)]
pub struct CreateViewParams {
    pub id: StorageId,
    /// Declared result shape of the view
    pub schema: SchemaRef,
    pub definition: ViewDefinition,
    pub target: ViewTarget,
    /// Refresh period for the scheduled mode
    pub periodic_refresh: Option<Duration>,
}

/// Commands accepted by [`MaterializedView::alter`].
#[derive(Debug, Clone)]
pub enum AlterViewCommand {
    /// Always allowed
    Comment(String),
    /// Requires `allow_experimental_alter_view_structure`
    ModifySelect(ViewDefinition),
}

fn generate_inner_table_name(view_id: &StorageId) -> String {
    match view_id.uuid {
        Some(uuid) => format!(".inner_id.{}", uuid),
        None => format!(".inner.{}", view_id.table),
    }
}

/// A materialized view and its lifecycle state.
#[derive(Debug)]
pub struct MaterializedView {
    id: RwLock<StorageId>,
    schema: SchemaRef,
    definition: RwLock<ViewDefinition>,
    target_table_id: RwLock<StorageId>,
    has_inner_table: bool,
    is_periodically_refreshed: bool,
    refresh_period: Option<Duration>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_task: TaskHandle,
    /// Serializes refreshes; the scheduled task is single-fire, so a
    /// periodic refresh can never race itself.
    refresh_mutex: Mutex<()>,
    comment: RwLock<Option<String>>,
    catalog: Arc<Catalog>,
    lock: TableLock,
}

impl MaterializedView {
    /// Create a view, materialize its inner table when asked to, and wire
    /// the dependency edge from its source table.
    ///
    /// The returned view is not yet registered in the catalog and its
    /// periodic task is dormant until [`MaterializedView::startup`].
    pub fn create(
        catalog: Arc<Catalog>,
        schedule_pool: &SchedulePool,
        params: CreateViewParams,
    ) -> Result<Arc<Self>> {
        if let ViewTarget::To(target) = &params.target {
            let points_to_itself_by_name = target.database == params.id.database
                && target.table == params.id.table;
            let points_to_itself_by_uuid = matches!(
                (target.uuid, params.id.uuid),
                (Some(a), Some(b)) if a == b
            );
            if points_to_itself_by_name || points_to_itself_by_uuid {
                return Err(CinderError::invalid_argument(format!(
                    "Materialized view {} cannot point to itself",
                    params.id
                )));
            }
        }

        let has_inner_table = matches!(params.target, ViewTarget::Inner { .. });
        let target_table_id = match &params.target {
            ViewTarget::To(target) => target.clone(),
            ViewTarget::Inner { attach } => {
                let inner_name = generate_inner_table_name(&params.id);
                let inner_id = StorageId::new(&params.id.database, &inner_name);
                if !*attach {
                    let inner = Arc::new(MemoryTable::empty(
                        inner_id.clone(),
                        params.schema.clone(),
                    ));
                    catalog
                        .get_database(&inner_id.database)?
                        .register_table(&inner_name, inner)?;
                }
                inner_id
            }
        };

        catalog.add_dependency(
            params.definition.source_table_id.clone(),
            params.id.clone(),
        );

        let is_periodically_refreshed = params.periodic_refresh.is_some();

        let view = Arc::new_cyclic(|weak: &std::sync::Weak<MaterializedView>| {
            let task_weak = weak.clone();
            let refresh_task = schedule_pool.create_task(
                format!("{} periodic refresh", params.id),
                Box::new(move || {
                    if let Some(view) = task_weak.upgrade() {
                        view.periodic_refresh_task_func();
                    }
                }),
            );

            Self {
                id: RwLock::new(params.id.clone()),
                schema: params.schema.clone(),
                definition: RwLock::new(params.definition.clone()),
                target_table_id: RwLock::new(target_table_id),
                has_inner_table,
                is_periodically_refreshed,
                refresh_period: params.periodic_refresh,
                last_refresh: Mutex::new(None),
                refresh_task,
                refresh_mutex: Mutex::new(()),
                comment: RwLock::new(None),
                catalog,
                lock: TableLock::new(),
            }
        });

        Ok(view)
    }

    /// Id of the table the view's rows live in.
    pub fn target_table_id(&self) -> StorageId {
        self.target_table_id.read().clone()
    }

    /// The view's saved SELECT transform.
    pub fn select_transform(&self) -> Arc<dyn BlockTransform> {
        self.definition.read().transform.clone()
    }

    /// Id of the view's source table.
    pub fn source_table_id(&self) -> StorageId {
        self.definition.read().source_table_id.clone()
    }

    /// Whether the view owns an inner table.
    pub fn has_inner_table(&self) -> bool {
        self.has_inner_table
    }

    /// When the last successful refresh completed.
    pub fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.lock()
    }

    /// The view's comment.
    pub fn comment(&self) -> Option<String> {
        self.comment.read().clone()
    }

    /// Resolve the target table, failing when missing.
    pub fn get_target_table(&self) -> Result<Arc<dyn Storage>> {
        self.catalog.get_table(&self.target_table_id())
    }

    /// Resolve the target table if it exists.
    pub fn try_get_target_table(&self) -> Option<Arc<dyn Storage>> {
        self.catalog.try_get_table(&self.target_table_id())
    }

    /// Activate the periodic refresh task.
    pub fn startup(&self) {
        if self.is_periodically_refreshed {
            self.refresh_task.activate();
            self.refresh_task.schedule_after(Duration::ZERO);
        }
    }

    /// Deactivate the task and detach from the source table.
    pub fn shutdown(&self) {
        if self.is_periodically_refreshed {
            self.refresh_task.deactivate();
        }
        let source = self.source_table_id();
        self.catalog.remove_dependency(&source, &self.storage_id());
    }

    /// Rebuild the view's contents from its saved SELECT.
    ///
    /// Builds a shadow table, fills it, then atomically exchanges it with
    /// the target; readers see either the old contents or the new, never
    /// the shadow.
    pub fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_mutex.lock();
        self.refresh_unlocked()
    }

    fn refresh_unlocked(&self) -> Result<()> {
        debug!(view = %self.storage_id(), "refreshing materialized view");

        let target_id = self.target_table_id();
        let database = self.catalog.get_database(&target_id.database)?;
        let target = self.catalog.get_table(&target_id)?;

        let tmp_name = format!(".tmp{}", generate_inner_table_name(&self.storage_id()));
        let tmp_id = StorageId::new(&target_id.database, &tmp_name);

        let mut created = false;
        let mut replaced = false;

        let result = (|| -> Result<()> {
            let tmp_table = Arc::new(MemoryTable::empty(tmp_id.clone(), target.schema()));
            database.register_table(&tmp_name, tmp_table)?;
            created = true;

            let definition = self.definition.read().clone();
            let source = self.catalog.get_table(&definition.source_table_id)?;
            let mut stream =
                TransformingBlockStream::new(source.read(None)?, definition.transform);
            let mut sink = PushingToViewsSink::new(&self.catalog, &tmp_id, false)?;
            copy_blocks(&mut stream, &mut sink, None)?;

            database.exchange_tables(&tmp_name, &target_id.table)?;
            replaced = true;

            // The former target now sits under the shadow name.
            database.deregister_table(&tmp_name)?;
            Ok(())
        })();

        if let Err(e) = result {
            if created && !replaced {
                let _ = database.deregister_table(&tmp_name);
            }
            return Err(e);
        }

        let renewed = self.catalog.get_table(&target_id)?;
        *self.target_table_id.write() = renewed.storage_id();
        *self.last_refresh.lock() = Some(Instant::now());
        debug!(view = %self.storage_id(), "refresh complete");
        Ok(())
    }

    fn periodic_refresh_task_func(&self) {
        let _guard = self.refresh_mutex.lock();
        self.schedule_next_periodic_refresh();
    }

    fn schedule_next_periodic_refresh(&self) {
        let period = match self.refresh_period {
            Some(period) => period,
            None => return,
        };

        let due = self
            .last_refresh
            .lock()
            .map_or(true, |last| last.elapsed() >= period);
        if due {
            if let Err(e) = self.refresh_unlocked() {
                warn!(
                    view = %self.storage_id(),
                    error = %e,
                    "periodic refresh failed, previous contents remain visible"
                );
            }
        }

        let now = Instant::now();
        let delay = match *self.last_refresh.lock() {
            Some(last) => {
                let next = last + period;
                if now >= next {
                    Duration::ZERO
                } else {
                    next - now
                }
            }
            None => period,
        };
        self.refresh_task.schedule_after(delay);
    }

    /// Apply an alter command.
    pub fn alter(&self, command: AlterViewCommand, settings: &EngineSettings) -> Result<()> {
        match command {
            AlterViewCommand::Comment(comment) => {
                *self.comment.write() = Some(comment);
                Ok(())
            }
            AlterViewCommand::ModifySelect(new_definition) => {
                if !settings.allow_experimental_alter_view_structure {
                    return Err(CinderError::not_implemented(
                        "Altering a view's SELECT requires allow_experimental_alter_view_structure",
                    ));
                }
                let id = self.storage_id();
                let old_source = self.source_table_id();
                self.catalog.update_dependency(
                    &old_source,
                    &id,
                    new_definition.source_table_id.clone(),
                    id.clone(),
                );
                *self.definition.write() = new_definition;
                Ok(())
            }
        }
    }

    fn check_statement_can_be_forwarded(&self) -> Result<()> {
        if !self.has_inner_table {
            return Err(CinderError::invalid_argument(format!(
                "Materialized view targets existing table {}. Execute the statement directly on it.",
                self.target_table_id()
            )));
        }
        Ok(())
    }

    /// Shape shared by the view header and the target header, in the
    /// view's column order and with the view's declared types.
    fn common_header(&self, target_schema: &SchemaRef) -> SchemaRef {
        let fields: Vec<_> = self
            .schema
            .fields()
            .iter()
            .filter(|field| target_schema.field_with_name(field.name()).is_ok())
            .map(|field| field.as_ref().clone())
            .collect();
        Arc::new(Schema::new(fields))
    }
}

impl Storage for MaterializedView {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        self.id.read().clone()
    }

    fn table_type(&self) -> TableType {
        TableType::View
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_lock(&self) -> &TableLock {
        &self.lock
    }

    fn read(&self, projection: Option<&[usize]>) -> Result<SendableBlockStream> {
        let target = self.get_target_table()?;
        let lock = target.table_lock().lock_for_share();

        let stream = target.read(None)?;

        // Convert the target's shape to the view's, ignoring columns only
        // one side has.
        let mut result_schema = self.common_header(&target.schema());
        if let Some(indices) = projection {
            result_schema = Arc::new(result_schema.project(indices)?);
        }

        let converting = Arc::new(ConvertingTransform::new(result_schema));
        // The shared lock rides with the stream and is released when the
        // pipeline finishes.
        Ok(Box::new(
            TransformingBlockStream::new(stream, converting).with_guard(Box::new(lock)),
        ))
    }

    fn write(&self) -> Result<BoxedSink> {
        let target = self.get_target_table()?;
        let lock = target.table_lock().lock_for_share();
        let sink = target.write()?;
        Ok(Box::new(SinkWithLock {
            inner: sink,
            _lock: lock,
        }))
    }

    fn truncate(&self) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        self.get_target_table()?.truncate()
    }

    fn rename_in_memory(&self, new_id: StorageId) -> Result<()> {
        let old_id = self.storage_id();

        if self.has_inner_table && self.try_get_target_table().is_some() {
            let target_id = self.target_table_id();
            let new_target_name = generate_inner_table_name(&new_id);
            self.catalog
                .get_database(&target_id.database)?
                .rename_table(&target_id.table, &new_target_name)?;

            let mut target = self.target_table_id.write();
            target.database = new_id.database.clone();
            target.table = new_target_name;
        }

        *self.id.write() = new_id.clone();

        let source = self.source_table_id();
        self.catalog
            .update_dependency(&source, &old_id, source.clone(), new_id);
        Ok(())
    }

    fn on_drop(&self) -> Result<()> {
        if self.is_periodically_refreshed {
            self.refresh_task.deactivate();
        }

        let source = self.source_table_id();
        self.catalog.remove_dependency(&source, &self.storage_id());

        if self.has_inner_table {
            if let Some(target) = self.try_get_target_table() {
                self.catalog.drop_table(&target.storage_id())?;
            }
        }
        Ok(())
    }
}

/// Sink wrapper carrying a shared table lock for its lifetime.
struct SinkWithLock {
    inner: BoxedSink,
    _lock: SharedTableLock,
}

impl Sink for SinkWithLock {
    fn set_sample_block(&mut self, batch: &RecordBatch) -> Result<()> {
        self.inner.set_sample_block(batch)
    }

    fn write_prefix(&mut self) -> Result<()> {
        self.inner.write_prefix()
    }

    fn write(&mut self, block: &Block) -> Result<()> {
        self.inner.write(block)
    }

    fn write_suffix(&mut self) -> Result<()> {
        self.inner.write_suffix()
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
