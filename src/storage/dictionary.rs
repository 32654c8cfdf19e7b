//! Read-only storage projecting a registry dictionary as a table.

use std::any::Any;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use parking_lot::RwLock;

use crate::block::{BlocksStream, SendableBlockStream};
use crate::catalog::{Storage, StorageId, TableLock, TableType};
use crate::dictionary::{dictionary_schema, Dictionary, DictionaryStructure};
use crate::error::{CinderError, Result};
use crate::registry::LoadableRegistry;

/// A table whose rows come from a dictionary held by the registry.
///
/// The table resolves the dictionary on every read, so a background
/// reload is visible to the next query without re-registering anything.
#[derive(Debug)]
pub struct DictionaryTable {
    id: RwLock<StorageId>,
    dictionary_name: String,
    registry: Arc<LoadableRegistry>,
    schema: SchemaRef,
    lock: TableLock,
}

impl DictionaryTable {
    /// Create the projection, validating the declared structure.
    pub fn new(
        id: StorageId,
        registry: Arc<LoadableRegistry>,
        dictionary_name: impl Into<String>,
        structure: &DictionaryStructure,
    ) -> Result<Self> {
        let schema = dictionary_schema(structure)?;
        Ok(Self {
            id: RwLock::new(id),
            dictionary_name: dictionary_name.into(),
            registry,
            schema,
            lock: TableLock::new(),
        })
    }

    /// Name of the dictionary backing this table.
    pub fn dictionary_name(&self) -> &str {
        &self.dictionary_name
    }
}

impl Storage for DictionaryTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        self.id.read().clone()
    }

    fn table_type(&self) -> TableType {
        TableType::External
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_lock(&self) -> &TableLock {
        &self.lock
    }

    fn read(&self, projection: Option<&[usize]>) -> Result<SendableBlockStream> {
        let loadable = self.registry.get(&self.dictionary_name)?;
        let dictionary = loadable
            .as_any()
            .downcast_ref::<Dictionary>()
            .ok_or_else(|| {
                CinderError::internal(format!(
                    "Loadable '{}' is not a dictionary",
                    self.dictionary_name
                ))
            })?;

        let batches = match dictionary.rows() {
            Some(rows) => {
                let batch = match projection {
                    Some(indices) => rows.project(indices)?,
                    None => rows.clone(),
                };
                vec![batch]
            }
            None => Vec::new(),
        };

        Ok(Box::new(BlocksStream::one_frame(batches)))
    }

    fn rename_in_memory(&self, new_id: StorageId) -> Result<()> {
        *self.id.write() = new_id;
        Ok(())
    }
}
