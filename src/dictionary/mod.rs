//! Externally-defined dictionaries.
//!
//! A dictionary is the registry's flagship loadable: its shape comes from
//! a validated [`DictionaryStructure`], its reload cadence from a
//! [`Lifetime`], and its data from a configured source. The `inline`
//! source materializes rows straight out of the config, which is all the
//! engine itself needs; network-backed sources live behind the same
//! config surface but belong to external collaborators.

pub mod structure;

use std::any::Any;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde_json::Value;

use crate::error::{CinderError, Result};
use crate::registry::{Config, Lifetime, Loadable};

pub use structure::{
    AttributeUnderlyingType, DictionaryAttribute, DictionarySpecialAttribute,
    DictionaryStructure, DictionaryTypedSpecialAttribute,
};

/// Arrow rendition of an attribute kind.
fn arrow_type(kind: AttributeUnderlyingType) -> Result<DataType> {
    use AttributeUnderlyingType::*;
    match kind {
        UInt8 => Ok(DataType::UInt8),
        UInt16 => Ok(DataType::UInt16),
        UInt32 => Ok(DataType::UInt32),
        UInt64 => Ok(DataType::UInt64),
        Int8 => Ok(DataType::Int8),
        Int16 => Ok(DataType::Int16),
        Int32 => Ok(DataType::Int32),
        Int64 => Ok(DataType::Int64),
        Float32 => Ok(DataType::Float32),
        Float64 => Ok(DataType::Float64),
        String => Ok(DataType::Utf8),
        other => Err(CinderError::not_implemented(format!(
            "Projecting dictionary attribute type {} as a column",
            other.name()
        ))),
    }
}

/// Column shape of a dictionary: key, range bounds, then attributes.
pub fn dictionary_schema(structure: &DictionaryStructure) -> Result<SchemaRef> {
    let mut fields = Vec::new();

    if let Some(id) = &structure.id {
        fields.push(Field::new(&id.name, DataType::UInt64, false));
    }
    if let Some(range_min) = &structure.range_min {
        fields.push(Field::new(
            &range_min.name,
            arrow_type(range_min.underlying_type)?,
            false,
        ));
    }
    if let Some(range_max) = &structure.range_max {
        fields.push(Field::new(
            &range_max.name,
            arrow_type(range_max.underlying_type)?,
            false,
        ));
    }
    for attribute in structure.key.iter().flatten() {
        fields.push(Field::new(
            &attribute.name,
            arrow_type(attribute.underlying_type)?,
            false,
        ));
    }
    for attribute in &structure.attributes {
        fields.push(Field::new(
            &attribute.name,
            arrow_type(attribute.underlying_type)?,
            true,
        ));
    }

    Ok(Arc::new(Schema::new(fields)))
}

macro_rules! build_numeric_column {
    ($values:expr, $name:expr, $cast:ident, $native:ty, $array:ty) => {{
        let mut out: Vec<Option<$native>> = Vec::with_capacity($values.len());
        for value in $values {
            match value {
                Value::Null => out.push(None),
                other => {
                    let number = other.$cast().ok_or_else(|| {
                        CinderError::type_error(format!(
                            "Inline row value {:?} does not fit column '{}'",
                            other, $name
                        ))
                    })?;
                    out.push(Some(number as $native));
                }
            }
        }
        Ok(Arc::new(<$array>::from(out)) as ArrayRef)
    }};
}

fn build_column(values: &[&Value], field: &Field) -> Result<ArrayRef> {
    let name = field.name();
    match field.data_type() {
        DataType::UInt8 => build_numeric_column!(values, name, as_u64, u8, UInt8Array),
        DataType::UInt16 => build_numeric_column!(values, name, as_u64, u16, UInt16Array),
        DataType::UInt32 => build_numeric_column!(values, name, as_u64, u32, UInt32Array),
        DataType::UInt64 => build_numeric_column!(values, name, as_u64, u64, UInt64Array),
        DataType::Int8 => build_numeric_column!(values, name, as_i64, i8, Int8Array),
        DataType::Int16 => build_numeric_column!(values, name, as_i64, i16, Int16Array),
        DataType::Int32 => build_numeric_column!(values, name, as_i64, i32, Int32Array),
        DataType::Int64 => build_numeric_column!(values, name, as_i64, i64, Int64Array),
        DataType::Float32 => build_numeric_column!(values, name, as_f64, f32, Float32Array),
        DataType::Float64 => build_numeric_column!(values, name, as_f64, f64, Float64Array),
        DataType::Utf8 => {
            let mut out: Vec<Option<String>> = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    Value::Null => out.push(None),
                    Value::String(s) => out.push(Some(s.clone())),
                    other => out.push(Some(other.to_string())),
                }
            }
            Ok(Arc::new(StringArray::from(out)) as ArrayRef)
        }
        other => Err(CinderError::not_implemented(format!(
            "Inline rows for column type {:?}",
            other
        ))),
    }
}

/// Materialize `source.inline.rows` (an array of row arrays) as a batch.
fn build_inline_rows(source: &Config, schema: &SchemaRef) -> Result<RecordBatch> {
    let rows = source.get_array("inline.rows");

    let mut cells: Vec<Vec<&Value>> = vec![Vec::with_capacity(rows.len()); schema.fields().len()];
    let row_values: Vec<Vec<Config>> = rows.iter().map(|row| row.get_array("")).collect();

    for (row_index, row) in row_values.iter().enumerate() {
        if row.len() != schema.fields().len() {
            return Err(CinderError::config(format!(
                "Inline row {} has {} values, the dictionary shape has {} columns",
                row_index,
                row.len(),
                schema.fields().len()
            )));
        }
        for (column, value) in cells.iter_mut().zip(row.iter()) {
            column.push(value.as_value());
        }
    }

    let mut columns = Vec::with_capacity(schema.fields().len());
    for (values, field) in cells.iter().zip(schema.fields().iter()) {
        columns.push(build_column(values, field)?);
    }

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// A loaded dictionary.
#[derive(Debug)]
pub struct Dictionary {
    name: String,
    structure: DictionaryStructure,
    lifetime: Lifetime,
    /// The single layout kind declared in the config
    layout: String,
    schema: SchemaRef,
    /// Rows materialized from an inline source, if that is the source kind
    rows: Option<RecordBatch>,
    /// The defining config, replayed by `clone_loadable`
    defining_config: Config,
    key_prefix: String,
}

impl Dictionary {
    /// The validated structure.
    pub fn structure(&self) -> &DictionaryStructure {
        &self.structure
    }

    /// Column shape of the dictionary when projected as a table.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// The declared layout kind.
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Current rows, when the source is inline.
    pub fn rows(&self) -> Option<&RecordBatch> {
        self.rows.as_ref()
    }
}

impl Loadable for Dictionary {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    fn supports_updates(&self) -> bool {
        // Inline data never changes underneath us.
        self.rows.is_none()
    }

    fn is_modified(&self) -> bool {
        self.rows.is_none()
    }

    fn clone_loadable(&self) -> Result<Arc<dyn Loadable>> {
        create_dictionary_from_config(&self.name, &self.defining_config, &self.key_prefix)
    }
}

/// Registry factory: build a dictionary from the subtree under
/// `key_prefix` of a scanned config file.
pub fn create_dictionary_from_config(
    name: &str,
    config: &Config,
    key_prefix: &str,
) -> Result<Arc<dyn Loadable>> {
    let structure = DictionaryStructure::from_config(config, &format!("{}.structure", key_prefix))?;
    let lifetime = Lifetime::from_config(config, &format!("{}.lifetime", key_prefix))?;

    let layout_keys = config.keys(&format!("{}.layout", key_prefix));
    if layout_keys.len() != 1 {
        return Err(CinderError::config(format!(
            "Dictionary '{}' layout may contain only one parameter",
            name
        )));
    }
    let layout = layout_keys.into_iter().next().unwrap_or_default();

    let source = config
        .child(&format!("{}.source", key_prefix))
        .ok_or_else(|| {
            CinderError::config(format!("Dictionary '{}' has no source defined", name))
        })?;

    let schema = dictionary_schema(&structure)?;
    let rows = if source.has("inline") {
        Some(build_inline_rows(&source, &schema)?)
    } else {
        None
    };

    Ok(Arc::new(Dictionary {
        name: name.to_string(),
        structure,
        lifetime,
        layout,
        schema,
        rows,
        defining_config: config.clone(),
        key_prefix: key_prefix.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DICTIONARY: &str = r#"{
        "dictionary": {
            "name": "regions",
            "layout": {"flat": {}},
            "lifetime": {"min": 0, "max": 0},
            "source": {
                "inline": {
                    "rows": [
                        [1, "Europe", 0],
                        [2, "Benelux", 1]
                    ]
                }
            },
            "structure": {
                "id": {"name": "region_id"},
                "attribute": [
                    {"name": "region_name", "type": "String", "null_value": ""},
                    {"name": "parent_id", "type": "UInt64", "null_value": "0", "hierarchical": true}
                ]
            }
        }
    }"#;

    fn make_dictionary() -> Arc<dyn Loadable> {
        let config = Config::parse(DICTIONARY).unwrap();
        create_dictionary_from_config("regions", &config, "dictionary").unwrap()
    }

    #[test]
    fn test_create_from_config() {
        let loadable = make_dictionary();
        let dictionary = loadable
            .as_any()
            .downcast_ref::<Dictionary>()
            .expect("a Dictionary");

        assert_eq!(dictionary.name(), "regions");
        assert_eq!(dictionary.layout(), "flat");
        assert_eq!(dictionary.lifetime(), Lifetime::new(0, 0));

        let schema = dictionary.schema();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(0).name(), "region_id");
        assert_eq!(schema.field(0).data_type(), &DataType::UInt64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_inline_rows_materialized() {
        let loadable = make_dictionary();
        let dictionary = loadable.as_any().downcast_ref::<Dictionary>().unwrap();

        let rows = dictionary.rows().expect("inline rows");
        assert_eq!(rows.num_rows(), 2);

        let names = rows
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "Europe");
    }

    #[test]
    fn test_inline_dictionary_does_not_update() {
        let loadable = make_dictionary();
        assert!(!loadable.supports_updates());
        assert!(!loadable.is_modified());
    }

    #[test]
    fn test_clone_rebuilds_from_config() {
        let loadable = make_dictionary();
        let cloned = loadable.clone_loadable().unwrap();
        let dictionary = cloned.as_any().downcast_ref::<Dictionary>().unwrap();
        assert_eq!(dictionary.rows().unwrap().num_rows(), 2);
    }

    #[test]
    fn test_ragged_inline_row_rejected() {
        let config = Config::parse(
            r#"{
            "dictionary": {
                "name": "bad",
                "layout": {"flat": {}},
                "lifetime": 0,
                "source": {"inline": {"rows": [[1, "x", 0], [2]]}},
                "structure": {
                    "id": {"name": "id"},
                    "attribute": [
                        {"name": "a", "type": "String", "null_value": ""},
                        {"name": "b", "type": "UInt64", "null_value": "0"}
                    ]
                }
            }
        }"#,
        )
        .unwrap();
        assert!(create_dictionary_from_config("bad", &config, "dictionary").is_err());
    }

    #[test]
    fn test_missing_source_rejected() {
        let config = Config::parse(
            r#"{
            "dictionary": {
                "name": "bad",
                "layout": {"flat": {}},
                "lifetime": 0,
                "structure": {
                    "id": {"name": "id"},
                    "attribute": [{"name": "a", "type": "String", "null_value": ""}]
                }
            }
        }"#,
        )
        .unwrap();
        assert!(create_dictionary_from_config("bad", &config, "dictionary").is_err());
    }

    #[test]
    fn test_two_layout_parameters_rejected() {
        let config = Config::parse(
            r#"{
            "dictionary": {
                "name": "bad",
                "layout": {"flat": {}, "hashed": {}},
                "lifetime": 0,
                "source": {"inline": {"rows": []}},
                "structure": {
                    "id": {"name": "id"},
                    "attribute": [{"name": "a", "type": "String", "null_value": ""}]
                }
            }
        }"#,
        )
        .unwrap();
        assert!(create_dictionary_from_config("bad", &config, "dictionary").is_err());
    }
}
