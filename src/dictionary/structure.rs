//! Dictionary structure schema: parsing and validation of a dictionary's
//! shape (key layout, attributes, optional range bounds).

use std::collections::HashSet;

use crate::error::{CinderError, Result};
use crate::registry::Config;

/// Storage-level kind behind a declared attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeUnderlyingType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal32,
    Decimal64,
    Decimal128,
    String,
}

impl AttributeUnderlyingType {
    /// Resolve a declared type name.
    ///
    /// A static table covers the plain types; `Decimal32/64/128` are
    /// recognized by prefix.
    pub fn from_type_name(type_name: &str) -> Result<Self> {
        let known = match type_name {
            "UInt8" => Some(Self::UInt8),
            "UInt16" | "Date" => Some(Self::UInt16),
            "UInt32" | "DateTime" => Some(Self::UInt32),
            "UInt64" => Some(Self::UInt64),
            "UUID" => Some(Self::UInt128),
            "Int8" => Some(Self::Int8),
            "Int16" => Some(Self::Int16),
            "Int32" => Some(Self::Int32),
            "Int64" => Some(Self::Int64),
            "Float32" => Some(Self::Float32),
            "Float64" => Some(Self::Float64),
            "String" => Some(Self::String),
            _ => None,
        };
        if let Some(kind) = known {
            return Ok(kind);
        }

        if let Some(rest) = type_name.strip_prefix("Decimal") {
            if rest.starts_with("32") {
                return Ok(Self::Decimal32);
            }
            if rest.starts_with("64") {
                return Ok(Self::Decimal64);
            }
            if rest.starts_with("128") {
                return Ok(Self::Decimal128);
            }
        }

        Err(CinderError::type_error(format!(
            "Unknown type {}",
            type_name
        )))
    }

    /// Canonical name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UInt8 => "UInt8",
            Self::UInt16 => "UInt16",
            Self::UInt32 => "UInt32",
            Self::UInt64 => "UInt64",
            Self::UInt128 => "UUID",
            Self::Int8 => "Int8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::Decimal32 => "Decimal32",
            Self::Decimal64 => "Decimal64",
            Self::Decimal128 => "Decimal128",
            Self::String => "String",
        }
    }

    /// Fixed in-memory width, or `None` for variable-length values.
    pub fn fixed_byte_width(&self) -> Option<usize> {
        match self {
            Self::UInt8 | Self::Int8 => Some(1),
            Self::UInt16 | Self::Int16 => Some(2),
            Self::UInt32 | Self::Int32 | Self::Float32 | Self::Decimal32 => Some(4),
            Self::UInt64 | Self::Int64 | Self::Float64 | Self::Decimal64 => Some(8),
            Self::UInt128 | Self::Decimal128 => Some(16),
            Self::String => None,
        }
    }

    /// Whether values of this kind are represented by an integer, as
    /// range bounds must be.
    pub fn is_value_represented_by_integer(&self) -> bool {
        matches!(
            self,
            Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
                | Self::UInt128
                | Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
        )
    }

    /// Lossless widening between attribute kinds.
    ///
    /// Deliberately partial; integers never convert to floats here.
    pub fn is_convertible_to(&self, to: AttributeUnderlyingType) -> bool {
        use AttributeUnderlyingType::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (UInt8, UInt16)
                | (UInt8, UInt32)
                | (UInt8, UInt64)
                | (UInt16, UInt32)
                | (UInt16, UInt64)
                | (UInt32, UInt64)
                | (UInt8, Int16)
                | (UInt8, Int32)
                | (UInt8, Int64)
                | (UInt16, Int32)
                | (UInt16, Int64)
                | (UInt32, Int64)
                | (Int8, Int16)
                | (Int8, Int32)
                | (Int8, Int64)
                | (Int16, Int32)
                | (Int16, Int64)
                | (Int32, Int64)
                | (Float32, Float64)
        )
    }
}

/// The `id` special attribute: a name and an optional expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionarySpecialAttribute {
    pub name: String,
    pub expression: String,
}

impl DictionarySpecialAttribute {
    fn from_config(config: &Config, prefix: &str) -> Result<Self> {
        let name = config
            .get_string(&format!("{}.name", prefix))
            .unwrap_or_default();
        let expression = config
            .get_string(&format!("{}.expression", prefix))
            .unwrap_or_default();
        if name.is_empty() && !expression.is_empty() {
            return Err(CinderError::config(format!(
                "Element {}.name is empty",
                prefix
            )));
        }
        Ok(Self { name, expression })
    }
}

/// A typed special attribute (`range_min` / `range_max`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryTypedSpecialAttribute {
    pub name: String,
    pub expression: String,
    pub type_name: String,
    pub underlying_type: AttributeUnderlyingType,
}

impl DictionaryTypedSpecialAttribute {
    fn from_config(config: &Config, prefix: &str, default_type: &str) -> Result<Self> {
        let name = config
            .get_string(&format!("{}.name", prefix))
            .unwrap_or_default();
        let expression = config
            .get_string(&format!("{}.expression", prefix))
            .unwrap_or_default();
        if name.is_empty() && !expression.is_empty() {
            return Err(CinderError::config(format!(
                "Element {}.name is empty",
                prefix
            )));
        }
        let type_name = config
            .get_string(&format!("{}.type", prefix))
            .unwrap_or_else(|| default_type.to_string());
        let underlying_type = AttributeUnderlyingType::from_type_name(&type_name)?;
        Ok(Self {
            name,
            expression,
            type_name,
            underlying_type,
        })
    }
}

/// One data attribute of a dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryAttribute {
    pub name: String,
    pub underlying_type: AttributeUnderlyingType,
    pub type_name: String,
    pub expression: String,
    /// Value substituted for missing keys; `None` means the type default
    pub null_value: Option<String>,
    pub hierarchical: bool,
    pub injective: bool,
    pub is_object_id: bool,
}

const VALID_ATTRIBUTE_KEYS: &[&str] = &[
    "name",
    "type",
    "expression",
    "null_value",
    "hierarchical",
    "injective",
    "is_object_id",
];

fn check_attribute_keys(attribute: &Config) -> Result<()> {
    for key in attribute.keys("") {
        if !VALID_ATTRIBUTE_KEYS.contains(&key.as_str()) {
            return Err(CinderError::config(format!(
                "Unknown key '{}' inside attribute section",
                key
            )));
        }
    }
    Ok(())
}

/// The validated shape of a dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryStructure {
    /// Simple numeric key; exactly one of `id` / `key` is set
    pub id: Option<DictionarySpecialAttribute>,
    /// Composite key attributes, in declared order
    pub key: Option<Vec<DictionaryAttribute>>,
    pub range_min: Option<DictionaryTypedSpecialAttribute>,
    pub range_max: Option<DictionaryTypedSpecialAttribute>,
    /// Data attributes, in declared order; never empty
    pub attributes: Vec<DictionaryAttribute>,
    /// Whether any attribute carries a source expression
    pub has_expressions: bool,
}

impl DictionaryStructure {
    /// Parse and validate a structure under `prefix` (e.g.
    /// `"dictionary.structure"`).
    pub fn from_config(config: &Config, prefix: &str) -> Result<Self> {
        let has_id = config.has(&format!("{}.id", prefix));
        let has_key = config.has(&format!("{}.key", prefix));

        if has_id && has_key {
            return Err(CinderError::config(
                "Only one of 'id' and 'key' should be specified",
            ));
        }

        let mut has_expressions = false;

        let id = if has_id {
            let id = DictionarySpecialAttribute::from_config(config, &format!("{}.id", prefix))?;
            if id.name.is_empty() {
                return Err(CinderError::config("'id' cannot be empty"));
            }
            Some(id)
        } else {
            None
        };

        let key = if has_key {
            let key_attributes = Self::attributes_from_config(
                config,
                &format!("{}.key", prefix),
                false,
                false,
                &mut has_expressions,
            )?;
            if key_attributes.is_empty() {
                return Err(CinderError::config("Empty 'key' supplied"));
            }
            Some(key_attributes)
        } else {
            None
        };

        if id.is_none() && key.is_none() {
            return Err(CinderError::config(
                "Dictionary structure should specify either 'id' or 'key'",
            ));
        }

        let mut range_min = None;
        let mut range_max = None;
        if let Some(id) = &id {
            const RANGE_DEFAULT_TYPE: &str = "Date";
            if config.has(&format!("{}.range_min", prefix)) {
                range_min = Some(DictionaryTypedSpecialAttribute::from_config(
                    config,
                    &format!("{}.range_min", prefix),
                    RANGE_DEFAULT_TYPE,
                )?);
            }
            if config.has(&format!("{}.range_max", prefix)) {
                range_max = Some(DictionaryTypedSpecialAttribute::from_config(
                    config,
                    &format!("{}.range_max", prefix),
                    RANGE_DEFAULT_TYPE,
                )?);
            }

            if range_min.is_some() != range_max.is_some() {
                return Err(CinderError::config(
                    "Dictionary structure should have both 'range_min' and 'range_max' either specified or not.",
                ));
            }

            if let (Some(min), Some(max)) = (&range_min, &range_max) {
                if min.type_name != max.type_name {
                    return Err(CinderError::type_error(format!(
                        "Dictionary structure 'range_min' and 'range_max' should have same type, \
                         'range_min' type: {}, 'range_max' type: {}",
                        min.type_name, max.type_name
                    )));
                }
                if !min.underlying_type.is_value_represented_by_integer() {
                    return Err(CinderError::config(format!(
                        "Dictionary structure type of 'range_min' and 'range_max' should be an \
                         integer, Date, or DateTime. Actual 'range_min' and 'range_max' type is {}",
                        min.type_name
                    )));
                }
            }

            if !id.expression.is_empty()
                || range_min.as_ref().map_or(false, |r| !r.expression.is_empty())
                || range_max.as_ref().map_or(false, |r| !r.expression.is_empty())
            {
                has_expressions = true;
            }
        }

        let attributes =
            Self::attributes_from_config(config, prefix, true, true, &mut has_expressions)?;
        if attributes.is_empty() {
            return Err(CinderError::config("Dictionary has no attributes defined"));
        }

        Ok(Self {
            id,
            key,
            range_min,
            range_max,
            attributes,
            has_expressions,
        })
    }

    fn attributes_from_config(
        config: &Config,
        prefix: &str,
        hierarchy_allowed: bool,
        allow_null_values: bool,
        has_expressions: &mut bool,
    ) -> Result<Vec<DictionaryAttribute>> {
        let mut has_hierarchy = false;
        let mut result = Vec::new();

        for attribute in config.get_array(&format!("{}.attribute", prefix)) {
            check_attribute_keys(&attribute)?;

            let name = attribute.get_string("name").unwrap_or_default();
            let type_name = attribute.get_string("type").unwrap_or_default();
            if name.is_empty() || type_name.is_empty() {
                return Err(CinderError::config(
                    "Properties 'name' and 'type' of an attribute cannot be empty",
                ));
            }
            let underlying_type = AttributeUnderlyingType::from_type_name(&type_name)?;

            let expression = attribute.get_string("expression").unwrap_or_default();
            if !expression.is_empty() {
                *has_expressions = true;
            }

            let null_value = if allow_null_values {
                attribute.get_string("null_value").filter(|v| !v.is_empty())
            } else {
                None
            };

            let hierarchical = attribute.get_bool("hierarchical").unwrap_or(false);
            let injective = attribute.get_bool("injective").unwrap_or(false);
            let is_object_id = attribute.get_bool("is_object_id").unwrap_or(false);

            if hierarchical && !hierarchy_allowed {
                return Err(CinderError::config(format!(
                    "Hierarchy not allowed in '{}'",
                    prefix
                )));
            }
            if has_hierarchy && hierarchical {
                return Err(CinderError::config(
                    "Only one hierarchical attribute supported",
                ));
            }
            has_hierarchy = has_hierarchy || hierarchical;

            result.push(DictionaryAttribute {
                name,
                underlying_type,
                type_name,
                expression,
                null_value,
                hierarchical,
                injective,
                is_object_id,
            });
        }

        let names: HashSet<&str> = result.iter().map(|a| a.name.as_str()).collect();
        if names.len() != result.len() {
            return Err(CinderError::config(
                "Attribute names must be unique within a dictionary",
            ));
        }

        Ok(result)
    }

    /// Compare an ordered list of actual key type names with the declared
    /// composite key.
    pub fn validate_key_types(&self, key_types: &[String]) -> Result<()> {
        let key = self.key.as_ref().ok_or_else(|| {
            CinderError::type_error("Dictionary has a simple key, not a composite one")
        })?;

        if key_types.len() != key.len() {
            return Err(CinderError::type_error(format!(
                "Key structure does not match, expected {}",
                self.key_description()
            )));
        }

        for (i, (declared, actual)) in key.iter().zip(key_types.iter()).enumerate() {
            if &declared.type_name != actual {
                return Err(CinderError::type_error(format!(
                    "Key type at position {} does not match, expected {}, found {}",
                    i, declared.type_name, actual
                )));
            }
        }
        Ok(())
    }

    /// `"UInt64"` for a simple key, `"(T1, T2, …)"` for a composite one.
    pub fn key_description(&self) -> String {
        if self.id.is_some() {
            return "UInt64".to_string();
        }
        let types: Vec<&str> = self
            .key
            .iter()
            .flatten()
            .map(|attribute| attribute.type_name.as_str())
            .collect();
        format!("({})", types.join(", "))
    }

    /// Whether every key component has a fixed width.
    pub fn is_key_size_fixed(&self) -> bool {
        match &self.key {
            None => true,
            Some(key) => key
                .iter()
                .all(|attribute| attribute.underlying_type != AttributeUnderlyingType::String),
        }
    }

    /// Total key width in bytes; `None` when any component is
    /// variable-length.
    pub fn key_size(&self) -> Option<usize> {
        match &self.key {
            None => Some(std::mem::size_of::<u64>()),
            Some(key) => key
                .iter()
                .map(|attribute| attribute.underlying_type.fixed_byte_width())
                .sum(),
        }
    }
}
