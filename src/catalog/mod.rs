//! Catalog management for cinder.
//!
//! The catalog is the exclusive owner of every storage object. It holds
//! databases (name → storage maps), resolves [`StorageId`] handles, and
//! maintains the source-table → derived-view dependency edges that the
//! fan-out writer consults when a sink is constructed.

mod storage;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

pub use storage::{ExclusiveTableLock, SharedTableLock, Storage, TableLock, TableType};

use crate::error::{CinderError, Result};

/// An opaque storage handle: database, table, optional UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageId {
    /// Database name
    pub database: String,
    /// Table name
    pub table: String,
    /// Optional stable identity surviving renames
    pub uuid: Option<Uuid>,
}

impl StorageId {
    /// Create a handle without a UUID.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            uuid: None,
        }
    }

    /// Create a handle with a fresh UUID.
    pub fn with_new_uuid(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            uuid: Some(Uuid::new_v4()),
        }
    }

    /// Fully qualified name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    /// Whether this handle carries a UUID.
    pub fn has_uuid(&self) -> bool {
        self.uuid.is_some()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// A database: a named collection of storages.
#[derive(Debug)]
pub struct Database {
    name: String,
    tables: RwLock<HashMap<String, Arc<dyn Storage>>>,
}

impl Database {
    /// Create an empty database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Get the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// List all table names.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Check if a table exists.
    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.tables.read().get(name).cloned()
    }

    /// Register a table. Fails if the name is taken.
    pub fn register_table(&self, name: impl Into<String>, table: Arc<dyn Storage>) -> Result<()> {
        let name = name.into();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(CinderError::already_exists(format!(
                "Table '{}.{}' already exists",
                self.name, name
            )));
        }
        tables.insert(name, table);
        Ok(())
    }

    /// Deregister a table and run its drop hook.
    pub fn deregister_table(&self, name: &str) -> Result<Arc<dyn Storage>> {
        let removed = {
            let mut tables = self.tables.write();
            tables.remove(name)
        };
        let storage = removed.ok_or_else(|| {
            CinderError::catalog(format!("Table '{}.{}' not found", self.name, name))
        })?;
        storage.on_drop()?;
        Ok(storage)
    }

    /// Rename a table, updating the storage's own id.
    ///
    /// The rename hook runs with the table map unlocked: a materialized
    /// view renames its inner table in the same database from that hook.
    pub fn rename_table(&self, old_name: &str, new_name: &str) -> Result<()> {
        let storage = {
            let mut tables = self.tables.write();
            if tables.contains_key(new_name) {
                return Err(CinderError::already_exists(format!(
                    "Table '{}.{}' already exists",
                    self.name, new_name
                )));
            }
            tables.remove(old_name).ok_or_else(|| {
                CinderError::catalog(format!("Table '{}.{}' not found", self.name, old_name))
            })?
        };
        let mut new_id = storage.storage_id();
        new_id.table = new_name.to_string();
        storage.rename_in_memory(new_id)?;
        self.tables.write().insert(new_name.to_string(), storage);
        Ok(())
    }

    /// Atomically swap the names of two tables.
    ///
    /// Readers either see both tables under their old names or both under
    /// the new ones; the swap happens under one write lock.
    pub fn exchange_tables(&self, left: &str, right: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let left_storage = tables.remove(left).ok_or_else(|| {
            CinderError::catalog(format!("Table '{}.{}' not found", self.name, left))
        })?;
        let right_storage = match tables.remove(right) {
            Some(storage) => storage,
            None => {
                tables.insert(left.to_string(), left_storage);
                return Err(CinderError::catalog(format!(
                    "Table '{}.{}' not found",
                    self.name, right
                )));
            }
        };

        let mut left_id = left_storage.storage_id();
        left_id.table = right.to_string();
        left_storage.rename_in_memory(left_id)?;

        let mut right_id = right_storage.storage_id();
        right_id.table = left.to_string();
        right_storage.rename_in_memory(right_id)?;

        tables.insert(right.to_string(), left_storage);
        tables.insert(left.to_string(), right_storage);
        Ok(())
    }
}

/// The global catalog: databases plus the derived-view dependency edges.
#[derive(Debug)]
pub struct Catalog {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    /// source storage → views that must receive its writes, in creation order
    dependencies: RwLock<HashMap<StorageId, Vec<StorageId>>>,
}

impl Catalog {
    /// Default database every catalog starts with.
    pub const DEFAULT_DATABASE: &'static str = "default";

    /// Create a catalog with the default database.
    pub fn new() -> Self {
        let catalog = Self {
            databases: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(HashMap::new()),
        };
        catalog.databases.write().insert(
            Self::DEFAULT_DATABASE.to_string(),
            Arc::new(Database::new(Self::DEFAULT_DATABASE)),
        );
        catalog
    }

    /// List all database names.
    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    /// Create a new database.
    pub fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(CinderError::already_exists(format!(
                "Database '{}' already exists",
                name
            )));
        }
        let database = Arc::new(Database::new(name));
        databases.insert(name.to_string(), database.clone());
        Ok(database)
    }

    /// Get a database by name.
    pub fn get_database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CinderError::catalog(format!("Database '{}' not found", name)))
    }

    /// Resolve a storage handle, failing with suggestions when missing.
    pub fn get_table(&self, id: &StorageId) -> Result<Arc<dyn Storage>> {
        let database = self.get_database(&id.database)?;
        database
            .table(&id.table)
            .ok_or_else(|| CinderError::catalog_with_suggestions(&id.table, &database.table_names()))
    }

    /// Resolve a storage handle, returning `None` when missing.
    pub fn try_get_table(&self, id: &StorageId) -> Option<Arc<dyn Storage>> {
        self.databases
            .read()
            .get(&id.database)
            .and_then(|db| db.table(&id.table))
    }

    /// Register a storage under its own id.
    pub fn register_table(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let id = storage.storage_id();
        self.get_database(&id.database)?
            .register_table(&id.table, storage)
    }

    /// Remove a storage, running its drop hook.
    pub fn drop_table(&self, id: &StorageId) -> Result<()> {
        self.get_database(&id.database)?.deregister_table(&id.table)?;
        Ok(())
    }

    /// Record that writes to `source` must fan out to `view`.
    pub fn add_dependency(&self, source: StorageId, view: StorageId) {
        self.dependencies
            .write()
            .entry(source)
            .or_default()
            .push(view);
    }

    /// Remove a fan-out edge.
    pub fn remove_dependency(&self, source: &StorageId, view: &StorageId) {
        let mut dependencies = self.dependencies.write();
        if let Some(views) = dependencies.get_mut(source) {
            views.retain(|v| v != view);
            if views.is_empty() {
                dependencies.remove(source);
            }
        }
    }

    /// Rewire an edge in one step, keeping readers from seeing a gap.
    pub fn update_dependency(
        &self,
        old_source: &StorageId,
        old_view: &StorageId,
        new_source: StorageId,
        new_view: StorageId,
    ) {
        let mut dependencies = self.dependencies.write();
        if let Some(views) = dependencies.get_mut(old_source) {
            views.retain(|v| v != old_view);
            if views.is_empty() {
                dependencies.remove(old_source);
            }
        }
        dependencies.entry(new_source).or_default().push(new_view);
    }

    /// Views that must receive writes targeting `source`.
    pub fn dependent_views(&self, source: &StorageId) -> Vec<StorageId> {
        self.dependencies
            .read()
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTable;
    use arrow::datatypes::{DataType, Field, Schema};

    fn test_schema() -> arrow::datatypes::SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn make_table(name: &str) -> Arc<MemoryTable> {
        Arc::new(MemoryTable::empty(
            StorageId::new(Catalog::DEFAULT_DATABASE, name),
            test_schema(),
        ))
    }

    #[test]
    fn test_default_database_present() {
        let catalog = Catalog::new();
        assert!(catalog.get_database("default").is_ok());
        assert!(catalog.get_database("nope").is_err());
    }

    #[test]
    fn test_register_and_resolve() {
        let catalog = Catalog::new();
        catalog.register_table(make_table("events")).unwrap();

        let id = StorageId::new("default", "events");
        assert!(catalog.get_table(&id).is_ok());
        assert!(catalog.try_get_table(&id).is_some());

        let missing = StorageId::new("default", "event");
        let err = catalog.get_table(&missing).unwrap_err();
        assert!(err.to_string().contains("Did you mean"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let catalog = Catalog::new();
        catalog.register_table(make_table("events")).unwrap();
        assert!(catalog.register_table(make_table("events")).is_err());
    }

    #[test]
    fn test_rename_updates_storage_id() {
        let catalog = Catalog::new();
        catalog.register_table(make_table("old")).unwrap();

        let database = catalog.get_database("default").unwrap();
        database.rename_table("old", "new").unwrap();

        let storage = catalog.get_table(&StorageId::new("default", "new")).unwrap();
        assert_eq!(storage.storage_id().table, "new");
        assert!(catalog.try_get_table(&StorageId::new("default", "old")).is_none());
    }

    #[test]
    fn test_exchange_tables() {
        let catalog = Catalog::new();
        catalog.register_table(make_table("a")).unwrap();
        catalog.register_table(make_table("b")).unwrap();

        let database = catalog.get_database("default").unwrap();
        let a_before = catalog.get_table(&StorageId::new("default", "a")).unwrap();
        database.exchange_tables("a", "b").unwrap();

        let b_after = catalog.get_table(&StorageId::new("default", "b")).unwrap();
        assert!(Arc::ptr_eq(&a_before, &b_after));
        assert_eq!(b_after.storage_id().table, "b");
    }

    #[test]
    fn test_exchange_missing_right_restores_left() {
        let catalog = Catalog::new();
        catalog.register_table(make_table("a")).unwrap();
        let database = catalog.get_database("default").unwrap();

        assert!(database.exchange_tables("a", "missing").is_err());
        assert!(database.table_exists("a"));
    }

    #[test]
    fn test_dependency_edges() {
        let catalog = Catalog::new();
        let source = StorageId::new("default", "src");
        let view_a = StorageId::new("default", "view_a");
        let view_b = StorageId::new("default", "view_b");

        catalog.add_dependency(source.clone(), view_a.clone());
        catalog.add_dependency(source.clone(), view_b.clone());
        assert_eq!(catalog.dependent_views(&source), vec![view_a.clone(), view_b.clone()]);

        catalog.remove_dependency(&source, &view_a);
        assert_eq!(catalog.dependent_views(&source), vec![view_b.clone()]);

        let new_source = StorageId::new("default", "src2");
        catalog.update_dependency(&source, &view_b, new_source.clone(), view_b.clone());
        assert!(catalog.dependent_views(&source).is_empty());
        assert_eq!(catalog.dependent_views(&new_source), vec![view_b]);
    }
}
