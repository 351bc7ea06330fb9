//! # Records
//!
//! A [`Record`] wraps one entity value with its identity and the snapshot of what storage
//! last held for it. Fields are reached through the entity's [`RecordDescriptor`], a static
//! table of name to getter/setter pairs built once per type.
//!
//! ## Unset fields
//!
//! A getter returning `None` means the field is unset: it is left out of inserts and
//! never reported dirty. Nullable columns return `Some(Value::Null)` when empty.
//!
//! After hydration the snapshot holds exactly the columns the row carried, normalized
//! through the accessors. Columns a narrow projection skipped stay out of the snapshot;
//! such a column is written by `save` once its value moves away from what hydration left
//! in it, or unconditionally after [`Record::set`].

use crate::database::value::{as_i64, coerce};
use crate::database::Row;
use crate::error::{KeelError, Result};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::ops::{Deref, DerefMut};

pub type Getter<E> = fn(&E) -> Option<Value>;
pub type Setter<E> = fn(&mut E, Value) -> Result<()>;

/// Name plus get/set pair for one persisted column
pub struct FieldAccessor<E> {
    pub name: &'static str,
    pub get: Getter<E>,
    pub set: Setter<E>,
}

impl<E> std::fmt::Debug for FieldAccessor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("name", &self.name)
            .finish()
    }
}

/// Static description of how an entity maps onto its table
#[derive(Debug)]
pub struct RecordDescriptor<E> {
    pub table: &'static str,
    pub entity: &'static str,
    fields: Vec<FieldAccessor<E>>,
    generated: Vec<&'static str>,
}

impl<E> RecordDescriptor<E> {
    pub fn new(table: &'static str, entity: &'static str) -> Self {
        Self {
            table,
            entity,
            fields: Vec::new(),
            generated: Vec::new(),
        }
    }

    pub fn field(mut self, name: &'static str, get: Getter<E>, set: Setter<E>) -> Self {
        self.fields.push(FieldAccessor { name, get, set });
        self
    }

    /// A column filled by the database; never written by `save`
    pub fn generated(mut self, name: &'static str, get: Getter<E>, set: Setter<E>) -> Self {
        self.generated.push(name);
        self.field(name, get, set)
    }

    pub fn fields(&self) -> &[FieldAccessor<E>] {
        &self.fields
    }

    pub fn accessor(&self, name: &str) -> Option<&FieldAccessor<E>> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_generated(&self, name: &str) -> bool {
        self.generated.contains(&name)
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }
}

/// A persistable entity type.
///
/// Implementations build their descriptor once, typically behind a `OnceLock`.
pub trait Entity: Default + Clone + Send + Sync + 'static {
    fn descriptor() -> &'static RecordDescriptor<Self>;
}

/// One entity instance with identity and last-persisted snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Record<E> {
    id: Option<i64>,
    data: E,
    original: IndexMap<String, Value>,
    /// Values held after hydration for columns the row did not carry
    unloaded: IndexMap<String, Value>,
    touched: IndexSet<String>,
    is_new: bool,
}

impl<E: Entity> Default for Record<E> {
    fn default() -> Self {
        Self::new(E::default())
    }
}

impl<E: Entity> Record<E> {
    /// Wrap a value that has never been persisted
    pub fn new(data: E) -> Self {
        Self {
            id: None,
            data,
            original: IndexMap::new(),
            unloaded: IndexMap::new(),
            touched: IndexSet::new(),
            is_new: true,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Assign the storage id. Ids are immutable once set.
    pub fn set_id(&mut self, id: i64) -> Result<()> {
        match self.id {
            Some(existing) => Err(KeelError::InvalidState(format!(
                "{} already has id {existing}; cannot reassign to {id}",
                E::descriptor().entity
            ))),
            None => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn data(&self) -> &E {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut E {
        &mut self.data
    }

    pub fn into_inner(self) -> E {
        self.data
    }

    /// Assign a field through its accessor. The field is written by the next `save` even
    /// when the value equals what the record already held.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let descriptor = E::descriptor();
        let field = descriptor.accessor(name).ok_or_else(|| {
            KeelError::InvalidInput(format!("{} has no field `{name}`", descriptor.entity))
        })?;
        if descriptor.is_generated(name) {
            return Err(KeelError::InvalidInput(format!(
                "`{name}` is generated by the database"
            )));
        }

        (field.set)(&mut self.data, value)?;
        self.touched.insert(field.name.to_string());
        Ok(())
    }

    /// Values last read from or written to storage, including `id`
    pub fn original_values(&self) -> &IndexMap<String, Value> {
        &self.original
    }

    /// Set field values (coerced), including `id` when assigned
    pub fn current_values(&self) -> IndexMap<String, Value> {
        let mut values = IndexMap::new();
        if let Some(id) = self.id {
            values.insert("id".to_string(), Value::from(id));
        }
        for field in E::descriptor().fields() {
            if let Some(value) = (field.get)(&self.data) {
                values.insert(field.name.to_string(), coerce(value));
            }
        }
        values
    }

    /// Fields whose current value differs from the snapshot.
    ///
    /// A field the snapshot never saw is dirty once it was assigned with [`Record::set`] or
    /// its value differs from what hydration left in it, so saving a narrowly projected
    /// record never overwrites unselected columns it did not change.
    pub fn dirty_fields(&self) -> IndexMap<String, Value> {
        let descriptor = E::descriptor();
        let mut dirty = IndexMap::new();

        for field in descriptor.fields() {
            if descriptor.is_generated(field.name) {
                continue;
            }
            let Some(value) = (field.get)(&self.data).map(coerce) else {
                continue;
            };
            let changed = match self.original.get(field.name) {
                Some(original) => *original != value,
                None => {
                    self.touched.contains(field.name)
                        || self
                            .unloaded
                            .get(field.name)
                            .map_or(true, |held| *held != value)
                }
            };
            if changed {
                dirty.insert(field.name.to_string(), value);
            }
        }

        dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_fields().is_empty()
    }

    /// Set, non-generated values for an INSERT
    pub fn insertable_values(&self) -> IndexMap<String, Value> {
        let descriptor = E::descriptor();
        descriptor
            .fields()
            .iter()
            .filter(|f| !descriptor.is_generated(f.name))
            .filter_map(|f| (f.get)(&self.data).map(|v| (f.name.to_string(), coerce(v))))
            .collect()
    }

    /// Build a persisted record from a fetched row.
    ///
    /// With a prefix, only columns starting with it are considered and the prefix is
    /// stripped. The row must carry `id`; columns the entity does not map are ignored and
    /// missing ones stay unset.
    pub fn hydrate(row: &Row, prefix: Option<&str>) -> Result<Self> {
        let descriptor = E::descriptor();
        let mut record = Self::new(E::default());

        for (column, value) in row {
            let name = match prefix {
                Some(prefix) => match column.strip_prefix(prefix) {
                    Some(stripped) => stripped,
                    None => continue,
                },
                None => column.as_str(),
            };

            if name == "id" {
                let id = as_i64(value).ok_or_else(|| {
                    KeelError::InvalidInput(format!(
                        "{} row has a non-integer id: {value}",
                        descriptor.entity
                    ))
                })?;
                record.id = Some(id);
                continue;
            }

            if let Some(field) = descriptor.accessor(name) {
                (field.set)(&mut record.data, value.clone())?;
                let normalized = (field.get)(&record.data)
                    .map(coerce)
                    .unwrap_or(Value::Null);
                record.original.insert(name.to_string(), normalized);
            }
        }

        if record.id.is_none() {
            return Err(KeelError::InvalidInput(format!(
                "cannot hydrate {} without an id column",
                descriptor.entity
            )));
        }

        if let Some(id) = record.id {
            record.original.insert("id".to_string(), Value::from(id));
        }
        for field in descriptor.fields() {
            if !record.original.contains_key(field.name) {
                let held = (field.get)(&record.data).map(coerce).unwrap_or(Value::Null);
                record.unloaded.insert(field.name.to_string(), held);
            }
        }
        record.is_new = false;
        Ok(record)
    }

    /// Copy database-held values into fields that are generated or still unset
    pub fn absorb_row(&mut self, row: &Row) -> Result<()> {
        let descriptor = E::descriptor();
        for field in descriptor.fields() {
            let Some(value) = row.get(field.name) else {
                continue;
            };
            if descriptor.is_generated(field.name) || (field.get)(&self.data).is_none() {
                (field.set)(&mut self.data, value.clone())?;
            }
        }
        Ok(())
    }

    /// Snapshot := current values
    pub fn sync_original(&mut self) {
        self.original = self.current_values();
        self.unloaded.clear();
        self.touched.clear();
    }

    /// Fold values just written by an UPDATE into the snapshot
    pub fn accept_changes(&mut self, changes: IndexMap<String, Value>) {
        for name in changes.keys() {
            self.unloaded.shift_remove(name);
            self.touched.shift_remove(name);
        }
        self.original.extend(changes);
    }

    pub fn mark_persisted(&mut self) {
        self.is_new = false;
        self.sync_original();
    }
}

impl<E> Deref for Record<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.data
    }
}

impl<E> DerefMut for Record<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.data
    }
}
