use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    name::{AccountId, IndexId, ScopeId, TableId},
    primary_key::PrimaryKey,
    service::{ServiceState, TableKey},
};

/// One ordering component of an index: a dot-separated field path into the
/// row document plus a direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDef {
    /// Dot-separated path of the ordered field.
    pub field: String,
    /// `true` for descending order.
    #[serde(default)]
    pub descending: bool,
}

impl OrderDef {
    /// An ascending order over `field`.
    pub fn asc(field: impl Into<String>) -> OrderDef {
        OrderDef {
            field: field.into(),
            descending: false,
        }
    }

    /// A descending order over `field`.
    pub fn desc(field: impl Into<String>) -> OrderDef {
        OrderDef {
            field: field.into(),
            descending: true,
        }
    }

    /// Projects the ordered field out of a row document. Missing fields
    /// project as `Null`.
    pub fn project<'a>(&self, value: &'a Value) -> &'a Value {
        let mut current = value;
        for step in self.field.split('.') {
            match current.get(step) {
                Some(next) => current = next,
                None => return &Value::Null,
            }
        }
        current
    }
}

/// Definition of a secondary index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index identifier, unique within the table.
    pub name: IndexId,
    /// Whether keys are unique within the index.
    pub unique: bool,
    /// Ordering components, most significant first.
    pub orders: Vec<OrderDef>,
}

/// Definition of a table: its primary-key order and secondary indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table identifier, unique within the owning account's schema.
    pub name: TableId,
    /// Ordering of the primary key (a single `u64` field).
    pub pk_order: OrderDef,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// Looks up a secondary index definition by id.
    pub fn find_index(&self, index: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|def| def.name == index)
    }
}

/// Whether a descriptor addresses a whole table or one of its indexes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntityKind {
    /// The table itself (reads and writes by primary key).
    Table,
    /// One index of the table (ordered reads).
    Index,
}

/// A resolved table or index: identity, schema reference and primary-key
/// order in one value.
///
/// Table and index requests share this descriptor; index descriptors
/// additionally carry the index definition.
#[derive(Clone, Debug)]
pub struct EntityDescriptor {
    /// Owning account of the schema.
    pub code: AccountId,
    /// Subdivision of the table.
    pub scope: ScopeId,
    /// The table definition in force.
    pub table: Arc<TableDef>,
    /// The addressed index, when the descriptor is an index descriptor.
    pub index: Option<Arc<IndexDef>>,
}

impl EntityDescriptor {
    /// Builds a table descriptor.
    pub fn table(code: AccountId, scope: ScopeId, table: Arc<TableDef>) -> EntityDescriptor {
        EntityDescriptor {
            code,
            scope,
            table,
            index: None,
        }
    }

    /// Narrows a table descriptor to one of its indexes.
    pub fn with_index(&self, index: Arc<IndexDef>) -> EntityDescriptor {
        EntityDescriptor {
            index: Some(index),
            ..self.clone()
        }
    }

    /// Whether this descriptor addresses a table or an index.
    pub fn kind(&self) -> EntityKind {
        if self.index.is_some() {
            EntityKind::Index
        } else {
            EntityKind::Table
        }
    }

    /// The table's identity.
    pub fn table_key(&self) -> TableKey {
        TableKey {
            code: self.code,
            scope: self.scope,
            table: self.table.name,
        }
    }

    /// The primary-key order of the table.
    pub fn pk_order(&self) -> &OrderDef {
        &self.table.pk_order
    }

    /// The id of the addressed index; the primary index when the descriptor
    /// is a plain table descriptor.
    pub fn index_id(&self) -> IndexId {
        self.index
            .as_ref()
            .map(|def| def.name)
            .unwrap_or(IndexId::PRIMARY)
    }

    /// A service header addressing `pk` in this table.
    pub fn to_service(&self, pk: PrimaryKey) -> ServiceState {
        ServiceState {
            code: self.code,
            scope: self.scope,
            table: self.table.name,
            pk,
            ..ServiceState::default()
        }
    }
}

/// Reads a `u64` out of a row document at a dot-separated path. Returns
/// `None` when the path is missing or the value is not an unsigned integer.
pub fn extract_u64(value: &Value, path: &str) -> Option<u64> {
    let mut current = value;
    for step in path.split('.') {
        current = current.get(step)?;
    }
    current.as_u64()
}
