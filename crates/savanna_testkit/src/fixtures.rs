//! Test fixtures: catalogs, seeded datastores and an in-memory adapter.

use savanna_core::{
    AdapterResult, AttrRow, Datastore, DbResult, EntityKey, ExecutionContext, VirtualAdapter,
};
use savanna_model::{
    Attribute, Catalog, DataClassDef, IndexKind, OnGet, OnQuery, OnSet, OnSort, ScalarType,
    SealedCatalog, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A datastore with convenience accessors for tests.
pub struct TestDatastore {
    /// The datastore under test.
    pub ds: Datastore,
}

impl TestDatastore {
    /// A datastore over [`employee_catalog`], empty.
    #[must_use]
    pub fn employees() -> Self {
        Self {
            ds: Datastore::new(employee_catalog()),
        }
    }

    /// A datastore over [`employee_catalog`] with the standard seed data.
    ///
    /// # Panics
    ///
    /// Panics when seeding fails; fixtures are test-only.
    #[must_use]
    pub fn seeded() -> Self {
        let fixture = Self::employees();
        let ctx = fixture.ds.context();
        seed_employees(&fixture.ds, &ctx, 10).expect("seeding failed");
        fixture
    }
}

impl std::ops::Deref for TestDatastore {
    type Target = Datastore;

    fn deref(&self) -> &Self::Target {
        &self.ds
    }
}

/// Runs a test against an empty employee datastore.
pub fn with_datastore<F, R>(f: F) -> R
where
    F: FnOnce(&Datastore, &ExecutionContext) -> R,
{
    let fixture = TestDatastore::employees();
    let ctx = fixture.ds.context();
    f(&fixture.ds, &ctx)
}

/// Runs a test against a datastore seeded with 10 employees (salaries
/// 1000, 2000, ... 10000) across two companies.
pub fn with_seeded_datastore<F, R>(f: F) -> R
where
    F: FnOnce(&Datastore, &ExecutionContext) -> R,
{
    let fixture = TestDatastore::seeded();
    let ctx = fixture.ds.context();
    f(&fixture.ds, &ctx)
}

/// The standard two-class schema: `Company` and `Employee`, with indexed
/// storage attributes, a relation pair, an alias, and three calculated
/// attributes exercising `on_get`, `on_set`, `on_query` and `on_sort`.
#[must_use]
pub fn employee_catalog() -> SealedCatalog {
    let full_name_get: OnGet = Arc::new(|record| {
        let first = record
            .attribute("firstName")
            .and_then(|v| v.as_text().map(str::to_owned))
            .unwrap_or_default();
        let last = record
            .attribute("lastName")
            .and_then(|v| v.as_text().map(str::to_owned))
            .unwrap_or_default();
        Ok(Value::Text(format!("{first} {last}").trim().to_owned()))
    });
    let full_name_set: OnSet = Arc::new(|record, value| {
        let text = value.as_text().unwrap_or_default().to_owned();
        let mut parts = text.splitn(2, ' ');
        record.set_attribute(
            "firstName",
            Value::Text(parts.next().unwrap_or_default().to_owned()),
        );
        record.set_attribute(
            "lastName",
            Value::Text(parts.next().unwrap_or_default().to_owned()),
        );
        Ok(())
    });

    // `hired` is true when a hiring date is present; querying it rewrites
    // onto the storage attribute.
    let hired_get: OnGet = Arc::new(|record| {
        let date = record.attribute("hiringDate").unwrap_or(Value::Null);
        Ok(Value::Bool(!date.is_null()))
    });
    let hired_query: OnQuery = Arc::new(|op, value| {
        let truthy = matches!(value, Value::Bool(true));
        let equality = matches!(op, "=" | "==" | "===");
        let want_hired = truthy == equality;
        Ok(if want_hired {
            "hiringDate is not null".to_owned()
        } else {
            "hiringDate is null".to_owned()
        })
    });

    // `startDate` exposes the hiring date and sorts through a surrogate.
    let start_date_get: OnGet =
        Arc::new(|record| Ok(record.attribute("hiringDate").unwrap_or(Value::Null)));
    let start_date_sort: OnSort = Arc::new(|ascending| {
        if ascending {
            "hiringDate".to_owned()
        } else {
            "hiringDate desc".to_owned()
        }
    });

    Catalog::new()
        .class(
            DataClassDef::new("Company")
                .attribute(
                    Attribute::storage("name", ScalarType::Text)
                        .indexed(IndexKind::BTree)
                        .not_null(),
                )
                .attribute(Attribute::storage("city", ScalarType::Text))
                .attribute(Attribute::related_entities("staff", "Employee", "employer")),
        )
        .expect("catalog")
        .class(
            DataClassDef::new("Employee")
                .attribute(Attribute::storage("firstName", ScalarType::Text))
                .attribute(
                    Attribute::storage("lastName", ScalarType::Text).indexed(IndexKind::BTree),
                )
                .attribute(
                    Attribute::storage("salary", ScalarType::Number).indexed(IndexKind::BTree),
                )
                .attribute(Attribute::storage("hiringDate", ScalarType::Date))
                .attribute(Attribute::related_entity("employer", "Company"))
                .attribute(Attribute::alias(
                    "employerCity",
                    ScalarType::Text,
                    "employer.city",
                ))
                .attribute(
                    Attribute::calculated("fullName", ScalarType::Text)
                        .on_get(full_name_get)
                        .on_set(full_name_set),
                )
                .attribute(
                    Attribute::calculated("hired", ScalarType::Bool)
                        .on_get(hired_get)
                        .on_query(hired_query),
                )
                .attribute(
                    Attribute::calculated("startDate", ScalarType::Date)
                        .on_get(start_date_get)
                        .on_sort(start_date_sort),
                ),
        )
        .expect("catalog")
        .seal()
        .expect("seal")
}

/// Last names used by the seed data, in hire order.
pub const SEED_NAMES: [&str; 10] = [
    "Smith", "Jones", "Brown", "Taylor", "Wilson", "Davies", "Evans", "Thomas", "Johnson",
    "Roberts",
];

/// Seeds two companies and `n` employees (n <= 10): salaries `1000 * i`,
/// hiring dates in hire order, employers alternating.
///
/// # Errors
///
/// Propagates save failures.
pub fn seed_employees(ds: &Datastore, ctx: &ExecutionContext, n: usize) -> DbResult<()> {
    let companies = ds.dataclass("Company")?;
    let mut acme = companies.create_entity()?;
    acme.set("name", Value::from("ACME"))?;
    acme.set("city", Value::from("Memphis"))?;
    acme.save(ctx)?;
    let mut globex = companies.create_entity()?;
    globex.set("name", Value::from("Globex"))?;
    globex.set("city", Value::from("New York"))?;
    globex.save(ctx)?;

    let employees = ds.dataclass("Employee")?;
    for i in 1..=n.min(SEED_NAMES.len()) {
        let mut emp = employees.create_entity()?;
        emp.set("firstName", Value::from(format!("First{i}")))?;
        emp.set("lastName", Value::from(SEED_NAMES[i - 1]))?;
        emp.set("salary", Value::Number(1000.0 * i as f64))?;
        let date = Value::parse_date(&format!("2015-01-{i:02}")).expect("seed date");
        emp.set("hiringDate", Value::Date(date))?;
        emp.set_related("employer", if i % 2 == 0 { &globex } else { &acme })?;
        emp.save(ctx)?;
    }
    Ok(())
}

/// An in-memory virtual backend: rows keyed by a numeric `ID`, with
/// per-row stamps so optimistic conflicts are observable through the
/// adapter path too.
#[derive(Default)]
pub struct MemoryAdapter {
    rows: Mutex<Vec<AttrRow>>,
    stamps: Mutex<HashMap<i64, u64>>,
    next_id: AtomicI64,
}

impl MemoryAdapter {
    /// An empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            stamps: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn key_of(row: &AttrRow) -> Option<i64> {
        row.get("ID").and_then(Value::as_long)
    }
}

impl VirtualAdapter for MemoryAdapter {
    fn all_entities(&self) -> AdapterResult<Vec<AttrRow>> {
        Ok(self.rows.lock().expect("poisoned").clone())
    }

    fn get_entity_by_key(&self, key: &EntityKey) -> AdapterResult<Option<AttrRow>> {
        let EntityKey::Long(wanted) = key else {
            return Ok(None);
        };
        Ok(self
            .rows
            .lock()
            .expect("poisoned")
            .iter()
            .find(|row| Self::key_of(row) == Some(*wanted))
            .cloned())
    }

    fn save_entity(&self, key: Option<&EntityKey>, values: &AttrRow) -> AdapterResult<EntityKey> {
        let mut rows = self.rows.lock().expect("poisoned");
        let id = match key {
            Some(EntityKey::Long(id)) => *id,
            _ => self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let mut row = values.clone();
        row.insert("ID".to_owned(), Value::Long(id));
        match rows.iter_mut().find(|r| Self::key_of(r) == Some(id)) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        *self.stamps.lock().expect("poisoned").entry(id).or_insert(0) += 1;
        Ok(EntityKey::Long(id))
    }

    fn drop_entity(&self, key: &EntityKey) -> AdapterResult<()> {
        if let EntityKey::Long(id) = key {
            self.rows
                .lock()
                .expect("poisoned")
                .retain(|row| Self::key_of(row) != Some(*id));
            self.stamps.lock().expect("poisoned").remove(id);
        }
        Ok(())
    }

    fn get_stamp(&self, key: &EntityKey) -> AdapterResult<u64> {
        let EntityKey::Long(id) = key else {
            return Ok(0);
        };
        Ok(*self.stamps.lock().expect("poisoned").get(id).unwrap_or(&0))
    }
}

/// A catalog with one adapter-friendly class (`Board`: ID, name, desc).
#[must_use]
pub fn board_catalog() -> SealedCatalog {
    Catalog::new()
        .class(
            DataClassDef::new("Board")
                .attribute(
                    Attribute::storage("ID", ScalarType::Long)
                        .primary_key()
                        .read_only(),
                )
                .attribute(Attribute::storage("name", ScalarType::Text))
                .attribute(Attribute::storage("desc", ScalarType::Text)),
        )
        .expect("catalog")
        .seal()
        .expect("seal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_fixture_has_ten_employees() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            assert_eq!(employees.length(ctx).unwrap(), 10);
            let companies = ds.dataclass("Company").unwrap();
            assert_eq!(companies.length(ctx).unwrap(), 2);
        });
    }

    #[test]
    fn memory_adapter_stamps_count_saves() {
        let adapter = MemoryAdapter::new();
        let mut row = AttrRow::new();
        row.insert("name".to_owned(), Value::from("alpha"));
        let key = adapter.save_entity(None, &row).unwrap();
        assert_eq!(adapter.get_stamp(&key).unwrap(), 1);
        adapter.save_entity(Some(&key), &row).unwrap();
        assert_eq!(adapter.get_stamp(&key).unwrap(), 2);
    }
}
