//! Entity-to-table mappings consulted by the plan builder.

use crate::error::{QueryError, Result};
use crate::types::DataType;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    property: String,
    column: String,
    data_type: DataType,
    db_type: DataType,
    nullable: bool,
    primary_key: bool,
    auto_increment: bool,
}

impl ColumnMap {
    /// A column whose storage type equals the property type.
    pub fn new(property: impl Into<String>, data_type: DataType) -> Self {
        let property = property.into();
        Self {
            column: property.clone(),
            property,
            db_type: data_type.clone(),
            nullable: data_type.is_nullable(),
            data_type,
            primary_key: false,
            auto_increment: false,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Storage type differs from the property type; a value converter is
    /// required when reading and writing.
    pub fn with_db_type(mut self, db_type: DataType) -> Self {
        self.db_type = db_type;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn db_type(&self) -> &DataType {
        &self.db_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn needs_conversion(&self) -> bool {
        self.db_type.non_null() != self.data_type.non_null()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMap {
    entity_type: String,
    table: String,
    columns: Vec<ColumnMap>,
}

impl EntityMap {
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>, columns: Vec<ColumnMap>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            columns,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnMap] {
        &self.columns
    }

    pub fn column_for(&self, property: &str) -> Result<&ColumnMap> {
        self.columns
            .iter()
            .find(|c| c.property() == property)
            .ok_or_else(|| QueryError::ColumnNotFound(format!("{}.{}", self.entity_type, property)))
    }

    pub fn column_named(&self, column: &str) -> Result<&ColumnMap> {
        self.columns
            .iter()
            .find(|c| c.column() == column)
            .ok_or_else(|| QueryError::ColumnNotFound(format!("{}.{}", self.table, column)))
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &ColumnMap> {
        self.columns.iter().filter(|c| c.is_primary_key())
    }

    pub fn auto_increment_column(&self) -> Option<&ColumnMap> {
        self.columns.iter().find(|c| c.is_auto_increment())
    }
}

/// Looks up the mapping for an entity type.
pub trait MappingRegistry: Send + Sync {
    fn get_mapping(&self, entity_type: &str) -> Result<EntityMap>;
}

/// In-memory mapping registry.
#[derive(Debug, Default)]
pub struct Mappings {
    maps: RwLock<HashMap<String, EntityMap>>,
}

impl Mappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, map: EntityMap) {
        self.maps.write().insert(map.entity_type().to_string(), map);
    }

    pub fn with(self, map: EntityMap) -> Self {
        self.register(map);
        self
    }
}

impl MappingRegistry for Mappings {
    fn get_mapping(&self, entity_type: &str) -> Result<EntityMap> {
        self.maps
            .read()
            .get(entity_type)
            .cloned()
            .ok_or_else(|| QueryError::MappingNotFound(entity_type.to_string()))
    }
}

/// A named persistence context. Entities materialized with tracking are
/// stamped with its name, and its table overrides redirect mapped tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceEnvironment {
    name: String,
    table_overrides: HashMap<String, String>,
}

impl PersistenceEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_overrides: HashMap::new(),
        }
    }

    pub fn with_table_override(mut self, table: impl Into<String>, target: impl Into<String>) -> Self {
        self.table_overrides.insert(table.into(), target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolve_table<'a>(&'a self, table: &'a str) -> &'a str {
        self.table_overrides
            .get(table)
            .map(String::as_str)
            .unwrap_or(table)
    }

    /// Overrides change the generated command text, so they are part of
    /// every cache key prefix.
    pub fn key_fragment(&self) -> String {
        let mut overrides: Vec<_> = self.table_overrides.iter().collect();
        overrides.sort();
        let mut out = format!("{}:{}", self.name.len(), self.name);
        for (from, to) in overrides {
            out.push_str(&format!("|{}>{}", from, to));
        }
        out
    }
}
