//! JSON and SQL externalization.
//!
//! Exports carry storage attributes and foreign-key values only:
//! calculated, alias and pure-relation attributes never travel, and derived
//! (extended) classes and adapter-backed classes are skipped at the
//! datastore level. Import targets the engine's own storage format and
//! rebuilds secondary indexes afterwards.

use crate::collection::EntityCollection;
use crate::context::ExecutionContext;
use crate::engine::{ClassRt, DatastoreInner};
use crate::error::{DbError, DbResult};
use crate::index::ClassIndexes;
use crate::store;
use crate::types::EntityKey;
use indexmap::IndexMap;
use savanna_model::{ScalarType, Value};
use serde_json::json;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Converts a dynamic value into its JSON travel form. Dates render as
/// ISO-8601 text, UUIDs as their canonical text, blobs as byte arrays.
pub(crate) fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Long(n) => json!(n),
        Value::Number(n) => json!(n),
        Value::Text(s) => json!(s),
        Value::Date(d) => json!(d.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        Value::Uuid(u) => json!(u.to_string()),
        Value::Blob(bytes) => serde_json::Value::Array(
            bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
        ),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect(),
        ),
    }
}

/// Converts arbitrary JSON into a dynamic value without schema knowledge.
pub(crate) fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Long(i)
            } else {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Object(
            map.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        ),
    }
}

/// Converts JSON into a value of the scalar type the schema declares,
/// falling back to the generic conversion when the shapes disagree.
pub(crate) fn coerce_json(scalar: Option<ScalarType>, json: &serde_json::Value) -> Value {
    match (scalar, json) {
        (_, serde_json::Value::Null) => Value::Null,
        (Some(ScalarType::Date), serde_json::Value::String(s)) => {
            Value::parse_date(s).map_or_else(|| Value::Text(s.clone()), Value::Date)
        }
        (Some(ScalarType::Uuid), serde_json::Value::String(s)) => s
            .parse()
            .map_or_else(|_| Value::Text(s.clone()), Value::Uuid),
        (Some(ScalarType::Blob | ScalarType::Image), serde_json::Value::Array(items)) => {
            Value::Blob(
                items
                    .iter()
                    .filter_map(|v| v.as_u64().map(|n| n as u8))
                    .collect(),
            )
        }
        (Some(t), serde_json::Value::Number(n)) if t.is_numeric() => {
            if t == ScalarType::Number {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            } else {
                n.as_i64().map_or_else(
                    || Value::Number(n.as_f64().unwrap_or(f64::NAN)),
                    Value::Long,
                )
            }
        }
        _ => json_to_value(json),
    }
}

fn class_file(dir: &Path, class: &ClassRt, extension: &str) -> std::path::PathBuf {
    dir.join(format!("{}.{extension}", class.name()))
}

fn exportable_values(class: &ClassRt, values: &IndexMap<String, Value>) -> serde_json::Value {
    let mut row = serde_json::Map::new();
    for name in class.def.storage_attribute_names() {
        let value = values.get(name).cloned().unwrap_or(Value::Null);
        row.insert(name.to_owned(), value_to_json(&value));
    }
    serde_json::Value::Object(row)
}

/// Writes one class extent as newline-delimited JSON objects.
pub(crate) fn export_class_json(
    _inner: &Arc<DatastoreInner>,
    class: &Arc<ClassRt>,
    dir: &Path,
) -> DbResult<()> {
    if class.is_virtual() {
        return Err(DbError::invalid_operation(
            "adapter-backed classes are not exported",
        ));
    }
    fs::create_dir_all(dir)?;
    let file = fs::File::create(class_file(dir, class, "json"))?;
    let mut out = BufWriter::new(file);
    let map = class.store.read();
    for record in map.values() {
        serde_json::to_writer(&mut out, &exportable_values(class, &record.values))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    debug!(class = class.name(), records = map.len(), "exported JSON");
    Ok(())
}

/// Reads a class extent back from its JSON file, replacing matching keys
/// and rebuilding the secondary indexes.
pub(crate) fn import_class_json(
    _inner: &Arc<DatastoreInner>,
    class: &Arc<ClassRt>,
    dir: &Path,
) -> DbResult<()> {
    if class.is_virtual() {
        return Err(DbError::invalid_operation(
            "adapter-backed classes are not imported",
        ));
    }
    let file = fs::File::open(class_file(dir, class, "json"))?;
    let reader = BufReader::new(file);

    let mut map = class.store.write();
    let mut max_seq: i64 = 0;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: serde_json::Value = serde_json::from_str(&line)?;
        let serde_json::Value::Object(fields) = row else {
            return Err(DbError::invalid_operation(
                "import expects one JSON object per line",
            ));
        };
        let mut values = IndexMap::new();
        for attr in class.def.attributes.values().filter(|a| a.is_stored()) {
            if let Some(field) = fields.get(&attr.name) {
                values.insert(attr.name.clone(), coerce_json(attr.scalar_type(), field));
            }
        }
        let pk = &class.def.primary_key;
        let key = values
            .get(pk)
            .and_then(EntityKey::from_value)
            .ok_or_else(|| {
                DbError::invalid_operation(format!("imported record is missing {pk}"))
            })?;
        if let EntityKey::Long(n) = key {
            max_seq = max_seq.max(n);
        }
        store::apply_put(&mut map, key, values);
    }
    class.store.set_sequence(max_seq + 1);

    let mut indexes = class.indexes.write();
    *indexes = ClassIndexes::new(&class.def);
    for (key, record) in map.iter() {
        indexes.insert_record(key, &record.values);
    }
    debug!(class = class.name(), records = map.len(), "imported JSON");
    Ok(())
}

/// Exports every native, non-derived class to `<dir>/<Class>.json`.
pub(crate) fn export_datastore_json(inner: &Arc<DatastoreInner>, dir: &Path) -> DbResult<()> {
    for class in inner.classes() {
        if class.is_virtual() || class.def.extends.is_some() {
            continue;
        }
        export_class_json(inner, class, dir)?;
    }
    Ok(())
}

/// Imports every class whose JSON file is present in `dir`.
pub(crate) fn import_datastore_json(inner: &Arc<DatastoreInner>, dir: &Path) -> DbResult<()> {
    for class in inner.classes() {
        if class.is_virtual() || class.def.extends.is_some() {
            continue;
        }
        if class_file(dir, class, "json").exists() {
            import_class_json(inner, class, dir)?;
        }
    }
    Ok(())
}

fn sql_type(scalar: Option<ScalarType>) -> &'static str {
    match scalar {
        Some(ScalarType::Bool) => "BOOLEAN",
        Some(ScalarType::Byte | ScalarType::Word | ScalarType::Long) => "INTEGER",
        Some(ScalarType::Long64 | ScalarType::Duration) => "BIGINT",
        Some(ScalarType::Number) => "DOUBLE PRECISION",
        Some(ScalarType::Date) => "TIMESTAMP",
        Some(ScalarType::Uuid) => "VARCHAR(36)",
        Some(ScalarType::Blob | ScalarType::Image) => "BLOB",
        _ => "TEXT",
    }
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_owned(),
        Value::Long(n) => n.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d %H:%M:%S")),
        Value::Uuid(u) => format!("'{u}'"),
        Value::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("X'{hex}'")
        }
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!(
            "'{}'",
            serde_json::to_string(&value_to_json(other))
                .unwrap_or_default()
                .replace('\'', "''")
        ),
    }
}

/// Writes one class extent as SQL DDL + INSERT statements.
pub(crate) fn export_class_sql(
    _inner: &Arc<DatastoreInner>,
    class: &Arc<ClassRt>,
    dir: &Path,
) -> DbResult<()> {
    if class.is_virtual() {
        return Err(DbError::invalid_operation(
            "adapter-backed classes are not exported",
        ));
    }
    fs::create_dir_all(dir)?;
    let file = fs::File::create(class_file(dir, class, "sql"))?;
    let mut out = BufWriter::new(file);

    let columns: Vec<&str> = class.def.storage_attribute_names().collect();
    let ddl: Vec<String> = columns
        .iter()
        .map(|name| {
            let attr = class.def.attribute(name).map(|a| a.scalar_type());
            format!("[{name}] {}", sql_type(attr.flatten()))
        })
        .collect();
    writeln!(out, "CREATE TABLE [{}] ({});", class.name(), ddl.join(", "))?;

    let map = class.store.read();
    for record in map.values() {
        let rendered: Vec<String> = columns
            .iter()
            .map(|name| {
                sql_literal(record.values.get(*name).unwrap_or(&Value::Null))
            })
            .collect();
        writeln!(
            out,
            "INSERT INTO [{}] ([{}]) VALUES ({});",
            class.name(),
            columns.join("],["),
            rendered.join(", ")
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Exports every native, non-derived class to `<dir>/<Class>.sql`.
pub(crate) fn export_datastore_sql(inner: &Arc<DatastoreInner>, dir: &Path) -> DbResult<()> {
    for class in inner.classes() {
        if class.is_virtual() || class.def.extends.is_some() {
            continue;
        }
        export_class_sql(inner, class, dir)?;
    }
    Ok(())
}

/// Generates (and saves) one entity per row. Rows carrying `__KEY` update
/// the matching entity, with `__STAMP` checked against the stored stamp
/// when present; attributes the class does not declare are ignored.
pub(crate) fn from_array(
    inner: &Arc<DatastoreInner>,
    ctx: &ExecutionContext,
    class: &Arc<ClassRt>,
    rows: &[serde_json::Value],
) -> DbResult<EntityCollection> {
    let mut keys = Vec::new();
    for row in rows {
        let serde_json::Value::Object(fields) = row else {
            return Err(DbError::invalid_operation("fromArray expects object rows"));
        };

        let mut entity = match fields.get("__KEY") {
            Some(key_field) => {
                let key = EntityKey::from_value(&json_to_value(key_field)).ok_or_else(|| {
                    DbError::invalid_operation("__KEY is not a usable key value")
                })?;
                let Some((values, stamp)) = inner.load_record(ctx, class, &key)? else {
                    return Err(DbError::invalid_operation(format!(
                        "__KEY {key} does not exist in {}",
                        class.name()
                    )));
                };
                if let Some(expected) = fields.get("__STAMP").and_then(serde_json::Value::as_u64)
                {
                    if expected != stamp {
                        return Err(DbError::StampConflict {
                            class: class.name().to_owned(),
                            key: key.clone(),
                            expected: crate::types::Stamp::new(expected),
                            found: crate::types::Stamp::new(stamp),
                        });
                    }
                }
                crate::entity::Entity::loaded(
                    Arc::clone(class),
                    Arc::clone(inner),
                    key,
                    values,
                    stamp,
                )
            }
            None => crate::entity::Entity::create(Arc::clone(class), Arc::clone(inner))?,
        };

        for attr in class.def.attributes.values().filter(|a| a.is_stored()) {
            if let Some(field) = fields.get(&attr.name) {
                entity.set_raw(&attr.name, coerce_json(attr.scalar_type(), field));
            }
        }
        entity.save(ctx)?;
        if let Some(key) = entity.get_key() {
            keys.push(key.clone());
        }
    }
    Ok(EntityCollection::from_keys(
        Arc::clone(class),
        Arc::clone(inner),
        keys,
        false,
    ))
}
