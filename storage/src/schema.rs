//! Seam to the schema services that describe tables and translate row
//! payloads.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;

use statedb_types::{
    AccountId, EntityDescriptor, IndexId, OrderDef, ScopeId, TableDef, TableId,
};

use crate::error::Error;

/// Provider of table definitions and payload translation.
///
/// Table definitions are owned per account; scopes share the definition of
/// their table and only subdivide its rows.
pub trait SchemaProvider {
    /// Resolves a table of an account's schema, or `None` when the schema
    /// does not define it.
    fn find_table(
        &self,
        code: AccountId,
        scope: ScopeId,
        table: TableId,
    ) -> Option<EntityDescriptor>;

    /// Resolves one index of a table, or `None` when either is undefined.
    fn find_index(
        &self,
        code: AccountId,
        scope: ScopeId,
        table: TableId,
        index: IndexId,
    ) -> Option<EntityDescriptor> {
        let descriptor = self.find_table(code, scope, table)?;
        let index = descriptor.table.find_index(index)?.clone();
        Some(descriptor.with_index(Arc::new(index)))
    }

    /// The primary-key index of a table. A plain table descriptor already
    /// orders by primary key, so this is the descriptor itself.
    fn find_pk_index(&self, table: &EntityDescriptor) -> EntityDescriptor {
        EntityDescriptor {
            index: None,
            ..table.clone()
        }
    }

    /// The primary-key order of a table.
    fn find_pk_order(&self, table: &EntityDescriptor) -> OrderDef {
        table.pk_order().clone()
    }

    /// Every table the provider defines, for structure verification during
    /// database initialization.
    fn tables(&self) -> Vec<EntityDescriptor>;

    /// Decodes a serialized row payload into a document.
    fn to_object(&self, table: &EntityDescriptor, bytes: &[u8]) -> Result<Value, Error>;

    /// Decodes a serialized index key. Scalar keys decode as a one-element
    /// key tuple.
    fn index_key_to_object(&self, index: &EntityDescriptor, bytes: &[u8]) -> Result<Value, Error>;

    /// Encodes a document into its serialized row payload.
    fn to_bytes(&self, table: &EntityDescriptor, value: &Value) -> Result<Vec<u8>, Error>;
}

/// The shipping schema provider: table definitions registered up front,
/// JSON payload translation.
#[derive(Debug, Default)]
pub struct DocumentSchema {
    tables: BTreeMap<(AccountId, TableId), Arc<TableDef>>,
}

impl DocumentSchema {
    /// Creates an empty registry.
    pub fn new() -> DocumentSchema {
        DocumentSchema::default()
    }

    /// Registers a table definition for an account, replacing any previous
    /// definition of the same table.
    pub fn register_table(&mut self, code: AccountId, def: TableDef) {
        self.tables.insert((code, def.name), Arc::new(def));
    }

    /// Builder form of [`register_table`](Self::register_table).
    pub fn with_table(mut self, code: AccountId, def: TableDef) -> DocumentSchema {
        self.register_table(code, def);
        self
    }
}

impl SchemaProvider for DocumentSchema {
    fn find_table(
        &self,
        code: AccountId,
        scope: ScopeId,
        table: TableId,
    ) -> Option<EntityDescriptor> {
        let def = self.tables.get(&(code, table))?;
        Some(EntityDescriptor::table(code, scope, Arc::clone(def)))
    }

    fn tables(&self) -> Vec<EntityDescriptor> {
        self.tables
            .iter()
            .map(|((code, _), def)| EntityDescriptor::table(*code, ScopeId(0), Arc::clone(def)))
            .collect()
    }

    fn to_object(&self, _table: &EntityDescriptor, bytes: &[u8]) -> Result<Value, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn index_key_to_object(
        &self,
        _index: &EntityDescriptor,
        bytes: &[u8],
    ) -> Result<Value, Error> {
        let key: Value = serde_json::from_slice(bytes)?;
        match key {
            Value::Array(_) => Ok(key),
            scalar => Ok(Value::Array(vec![scalar])),
        }
    }

    fn to_bytes(&self, _table: &EntityDescriptor, value: &Value) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(value)?)
    }
}
