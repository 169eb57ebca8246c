//! Cross-crate integration scenarios.
//!
//! These exercise the engine end to end through its public surface: entity
//! lifecycle and stamps, collection algebra, the query language, nested
//! transactions, locks, adapters and the export boundary.

use savanna_core::{DbResult, Entity, ExecutionContext};
use savanna_model::Value;

/// Saves a fresh employee and returns it (helper shared by scenarios).
///
/// # Errors
///
/// Propagates save failures.
pub fn quick_employee(
    ds: &savanna_core::Datastore,
    ctx: &ExecutionContext,
    last_name: &str,
    salary: f64,
) -> DbResult<Entity> {
    let employees = ds.dataclass("Employee")?;
    let mut emp = employees.create_entity()?;
    emp.set("lastName", Value::from(last_name))?;
    emp.set("salary", Value::Number(salary))?;
    emp.save(ctx)?;
    Ok(emp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{board_catalog, with_datastore, with_seeded_datastore, MemoryAdapter};
    use savanna_core::{Datastore, DbError, EntityKey, QueryOptions};
    use std::sync::Arc;

    const NO_OPTS: QueryOptions = QueryOptions {
        query_path: false,
        query_plan: false,
        allow_javascript: false,
    };

    // === Entity lifecycle ===

    #[test]
    fn save_increments_stamp_and_clears_modified() {
        with_datastore(|ds, ctx| {
            let mut emp = quick_employee(ds, ctx, "Smith", 5000.0).unwrap();
            assert_eq!(emp.get_stamp(), 1);
            assert!(!emp.is_new());
            assert!(!emp.is_modified());

            emp.set("salary", Value::Number(5100.0)).unwrap();
            assert!(emp.is_modified());
            assert_eq!(emp.get_modified_attributes(), vec!["salary".to_owned()]);
            emp.save(ctx).unwrap();
            assert_eq!(emp.get_stamp(), 2);
            assert!(!emp.is_modified());
        });
    }

    #[test]
    fn unmodified_save_is_a_noop() {
        with_datastore(|ds, ctx| {
            let mut emp = quick_employee(ds, ctx, "Smith", 5000.0).unwrap();
            emp.save(ctx).unwrap();
            emp.save(ctx).unwrap();
            assert_eq!(emp.get_stamp(), 1);
        });
    }

    #[test]
    fn release_reloads_transparently() {
        with_datastore(|ds, ctx| {
            let mut emp = quick_employee(ds, ctx, "Smith", 5000.0).unwrap();
            emp.release();
            assert!(!emp.is_loaded());
            assert_eq!(emp.get(ctx, "lastName").unwrap(), Value::from("Smith"));
            assert!(emp.is_loaded());
        });
    }

    #[test]
    fn refresh_discards_unsaved_changes() {
        with_datastore(|ds, ctx| {
            let mut emp = quick_employee(ds, ctx, "Smith", 5000.0).unwrap();
            emp.set("salary", Value::Number(9999.0)).unwrap();
            emp.refresh(ctx).unwrap();
            assert!(!emp.is_modified());
            assert_eq!(emp.get(ctx, "salary").unwrap(), Value::Number(5000.0));
        });
    }

    #[test]
    fn validation_rejects_and_nothing_persists() {
        with_datastore(|ds, ctx| {
            let companies = ds.dataclass("Company").unwrap();
            let mut c = companies.create_entity().unwrap();
            // name is not_null
            let err = c.save(ctx).unwrap_err();
            assert!(matches!(err, DbError::Validation { .. }));
            assert_eq!(companies.length(ctx).unwrap(), 0);
        });
    }

    #[test]
    fn calculated_attribute_get_and_set() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let mut emp = employees.create_entity().unwrap();
            emp.set("fullName", Value::from("John Smith")).unwrap();
            assert_eq!(emp.get(ctx, "firstName").unwrap(), Value::from("John"));
            assert_eq!(emp.get(ctx, "lastName").unwrap(), Value::from("Smith"));
            assert_eq!(emp.get(ctx, "fullName").unwrap(), Value::from("John Smith"));
        });
    }

    #[test]
    fn alias_reads_through_the_relation() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let mut smith = employees
                .find(ctx, "lastName == :1", &[Value::from("Smith")], &NO_OPTS)
                .unwrap()
                .unwrap();
            assert_eq!(
                smith.get(ctx, "employerCity").unwrap(),
                Value::from("Memphis")
            );
        });
    }

    #[test]
    fn relation_pair_resolves_both_ways() {
        with_seeded_datastore(|ds, ctx| {
            let companies = ds.dataclass("Company").unwrap();
            let mut acme = companies
                .find(ctx, "name == :1", &[Value::from("ACME")], &NO_OPTS)
                .unwrap()
                .unwrap();
            let staff = acme.related_entities(ctx, "staff").unwrap();
            assert_eq!(staff.length(), 5);

            let employees = ds.dataclass("Employee").unwrap();
            let mut smith = employees
                .find(ctx, "lastName == :1", &[Value::from("Smith")], &NO_OPTS)
                .unwrap()
                .unwrap();
            let employer = smith.related_entity(ctx, "employer").unwrap().unwrap();
            assert_eq!(employer.get_key(), acme.get_key());
            // the plain get on a relation attribute yields the foreign key
            assert_eq!(
                smith.get(ctx, "employer").unwrap(),
                acme.get_key().unwrap().to_value()
            );
        });
    }

    // === Locks ===

    #[test]
    fn locks_are_exclusive_and_unlock_is_idempotent() {
        with_datastore(|ds, ctx_a| {
            let emp = quick_employee(ds, ctx_a, "Smith", 1000.0).unwrap();
            let ctx_b = ds.context();

            assert!(emp.lock(ctx_a).unwrap());
            assert!(emp.lock(ctx_a).unwrap()); // re-entry by the owner
            assert!(!emp.lock(&ctx_b).unwrap());

            emp.unlock(ctx_a);
            emp.unlock(ctx_a); // second unlock: no-op, no panic
            assert!(emp.lock(&ctx_b).unwrap());
            emp.unlock(&ctx_b);
        });
    }

    // === Optimistic concurrency ===

    #[test]
    fn stale_modified_save_conflicts_unmodified_is_noop() {
        with_datastore(|ds, ctx_a| {
            let fresh = quick_employee(ds, ctx_a, "Smith", 5000.0).unwrap();
            let key = fresh.get_key().unwrap().clone();
            let employees = ds.dataclass("Employee").unwrap();

            let mut in_a = employees.get_entity_by_key(ctx_a, &key).unwrap().unwrap();
            let ctx_b = ds.context();
            let mut in_b = employees.get_entity_by_key(&ctx_b, &key).unwrap().unwrap();

            in_b.set("salary", Value::Number(6000.0)).unwrap();
            in_b.save(&ctx_b).unwrap();
            assert_eq!(in_b.get_stamp(), 2);

            // A's unmodified save skips
            in_a.save(ctx_a).unwrap();
            assert_eq!(in_a.get_stamp(), 1);

            // A's modified save conflicts
            in_a.set("salary", Value::Number(7000.0)).unwrap();
            let err = in_a.save(ctx_a).unwrap_err();
            assert!(matches!(err, DbError::StampConflict { .. }));

            // catch, reload, resave: the documented recovery
            in_a.refresh(ctx_a).unwrap();
            in_a.set("salary", Value::Number(7000.0)).unwrap();
            in_a.save(ctx_a).unwrap();
            assert_eq!(in_a.get_stamp(), 3);
        });
    }

    // === Collections ===

    #[test]
    fn set_algebra_is_identity_based_and_unsorted() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let cheap = employees
                .query(ctx, "salary <= :1", &[Value::Number(5000.0)], &NO_OPTS)
                .unwrap();
            let acme = employees
                .query(ctx, "employer.name == :1", &[Value::from("ACME")], &NO_OPTS)
                .unwrap();

            let both = cheap.and(&acme).unwrap();
            assert!(!both.is_sorted());
            assert_eq!(both.length(), 3); // salaries 1000, 3000, 5000

            let either = cheap.or(&acme).unwrap();
            assert_eq!(either.length(), 7); // 5 cheap + 5 acme - 3 common

            let only_cheap = cheap.minus(&acme).unwrap();
            assert_eq!(only_cheap.length(), 2);
            assert_eq!(cheap.minus(&cheap).unwrap().length(), 0);
        });
    }

    #[test]
    fn unsorted_collections_permit_duplicates_sorted_dont() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let first = employees.first(ctx).unwrap().unwrap();

            let mut unsorted = employees.create_entity_collection(false).unwrap();
            unsorted.add(&first, false).unwrap();
            unsorted.add(&first, false).unwrap();
            assert_eq!(unsorted.length(), 2);

            let mut sorted = employees.create_entity_collection(true).unwrap();
            sorted.add(&first, false).unwrap();
            sorted.add(&first, false).unwrap();
            assert_eq!(sorted.length(), 1);
        });
    }

    #[test]
    fn slice_follows_negative_index_semantics() {
        with_seeded_datastore(|ds, ctx| {
            let all = ds
                .dataclass("Employee")
                .unwrap()
                .all(ctx)
                .unwrap()
                .order_by(ctx, "salary")
                .unwrap();

            assert_eq!(all.slice(None, None).length(), 10);
            assert_eq!(all.slice(Some(0), Some(3)).length(), 3);
            assert_eq!(all.slice(Some(-3), None).length(), 3);
            assert_eq!(all.slice(Some(2), Some(-2)).length(), 6);
            assert_eq!(all.slice(Some(8), Some(2)).length(), 0);
            // the source is untouched
            assert_eq!(all.length(), 10);
        });
    }

    #[test]
    fn order_by_sorts_with_ties_left_to_right() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let sorted = employees
                .all(ctx)
                .unwrap()
                .order_by(ctx, "employer.name, salary desc")
                .unwrap();
            assert!(sorted.is_sorted());

            let mut rows: Vec<(String, f64)> = Vec::new();
            for pos in 0..sorted.length() {
                let mut e = sorted.entity(ctx, pos).unwrap().unwrap();
                let mut employer = e.related_entity(ctx, "employer").unwrap().unwrap();
                let company = employer
                    .get(ctx, "name")
                    .unwrap()
                    .as_text()
                    .unwrap()
                    .to_owned();
                let salary = e.get(ctx, "salary").unwrap().as_f64().unwrap();
                rows.push((company, salary));
            }
            // companies ascending, salaries descending within a company
            for pair in rows.windows(2) {
                let (ref c1, s1) = pair[0];
                let (ref c2, s2) = pair[1];
                assert!(c1 <= c2);
                if c1 == c2 {
                    assert!(s1 >= s2);
                }
            }
            assert_eq!(rows[0], ("ACME".to_owned(), 9000.0));
        });
    }

    #[test]
    fn order_by_calculated_uses_the_sort_surrogate() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let by_surrogate = employees
                .all(ctx)
                .unwrap()
                .order_by(ctx, "startDate desc")
                .unwrap();
            let by_storage = employees
                .all(ctx)
                .unwrap()
                .order_by(ctx, "hiringDate desc")
                .unwrap();
            assert_eq!(by_surrogate.keys(), by_storage.keys());
            // latest hire first
            let mut latest = by_surrogate.first(ctx).unwrap().unwrap();
            assert_eq!(latest.get(ctx, "lastName").unwrap(), Value::from("Roberts"));
        });
    }

    #[test]
    fn for_each_autosaves_modified_entities_once() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let low = employees
                .query(ctx, "salary < :1", &[Value::Number(5000.0)], &NO_OPTS)
                .unwrap();
            assert_eq!(low.length(), 4);

            low.for_each(ctx, |emp, _| {
                let salary = emp.get(ctx, "salary")?.as_f64().unwrap_or_default();
                emp.set("salary", Value::Number(salary * 1.05))
            })
            .unwrap();

            // every touched entity saved exactly once: stamp went 1 -> 2
            let raised = employees
                .query(ctx, "salary == :1", &[Value::Number(1050.0)], &NO_OPTS)
                .unwrap();
            let e = raised.first(ctx).unwrap().unwrap();
            assert_eq!(e.get_stamp(), 2);
        });
    }

    #[test]
    fn for_each_respects_explicit_saves() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            employees
                .all(ctx)
                .unwrap()
                .for_each(ctx, |emp, _| {
                    let salary = emp.get(ctx, "salary")?.as_f64().unwrap_or_default();
                    emp.set("salary", Value::Number(salary + 1.0))?;
                    emp.save(ctx) // explicit save suppresses the automatic one
                })
                .unwrap();
            let one = employees.first(ctx).unwrap().unwrap();
            assert_eq!(one.get_stamp(), 2);
        });
    }

    // === Aggregation ===

    #[test]
    fn salary_scenario_matches_the_reference_numbers() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let high = employees
                .query(ctx, "salary > :1", &[Value::Number(5000.0)], &NO_OPTS)
                .unwrap();
            assert_eq!(high.count(ctx).unwrap(), 5);
            assert_eq!(high.sum(ctx, "salary", false).unwrap(), 40_000.0);
            assert_eq!(high.average(ctx, "salary", false).unwrap(), Some(8_000.0));
            assert_eq!(
                high.min(ctx, "salary").unwrap(),
                Some(Value::Number(6000.0))
            );
            assert_eq!(
                high.max(ctx, "salary").unwrap(),
                Some(Value::Number(10_000.0))
            );
        });
    }

    #[test]
    fn compute_reports_everything_in_one_pass() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let report = employees
                .all(ctx)
                .unwrap()
                .compute(ctx, "salary, lastName")
                .unwrap();
            let salary = &report["salary"];
            assert_eq!(salary.count, 10);
            assert_eq!(salary.sum, 55_000.0);
            assert_eq!(salary.average, Some(5_500.0));
            let names = &report["lastName"];
            assert_eq!(names.count_distinct, 10);
        });
    }

    #[test]
    fn distinct_values_are_sorted_and_deduplicated() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let cities = employees
                .all(ctx)
                .unwrap()
                .distinct_values(ctx, "employer.city")
                .unwrap();
            assert_eq!(
                cities,
                vec![Value::from("Memphis"), Value::from("New York")]
            );
        });
    }

    // === Query language ===

    #[test]
    fn wildcard_anchors_both_ends() {
        with_datastore(|ds, ctx| {
            for name in ["Smith", "Smooth", "Smithy"] {
                quick_employee(ds, ctx, name, 1000.0).unwrap();
            }
            let employees = ds.dataclass("Employee").unwrap();
            let matches = employees
                .query(ctx, "lastName == :1", &[Value::from("Sm*th")], &NO_OPTS)
                .unwrap();
            assert_eq!(matches.length(), 1); // Smith only; Smithy must not match
            let mut hit = matches.first(ctx).unwrap().unwrap();
            assert_eq!(hit.get(ctx, "lastName").unwrap(), Value::from("Smith"));

            let contains = employees
                .query(ctx, "lastName == :1", &[Value::from("*mit*")], &NO_OPTS)
                .unwrap();
            assert_eq!(contains.length(), 2); // Smith, Smithy
        });
    }

    #[test]
    fn like_is_case_and_diacritic_insensitive_strict_is_not() {
        with_datastore(|ds, ctx| {
            quick_employee(ds, ctx, "Émile", 1000.0).unwrap();
            let employees = ds.dataclass("Employee").unwrap();
            assert_eq!(
                employees
                    .query(ctx, "lastName == :1", &[Value::from("emile")], &NO_OPTS)
                    .unwrap()
                    .length(),
                1
            );
            assert_eq!(
                employees
                    .query(ctx, "lastName === :1", &[Value::from("emile")], &NO_OPTS)
                    .unwrap()
                    .length(),
                0
            );
            assert_eq!(
                employees
                    .query(ctx, "lastName === :1", &[Value::from("Émile")], &NO_OPTS)
                    .unwrap()
                    .length(),
                1
            );
        });
    }

    #[test]
    fn boolean_operators_honor_the_precedence_table() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            // & binds tighter than |
            let found = employees
                .query(
                    ctx,
                    "salary > :1 & employer.name == :2 | lastName == :3",
                    &[
                        Value::Number(9_500.0),
                        Value::from("Globex"),
                        Value::from("Smith"),
                    ],
                    &NO_OPTS,
                )
                .unwrap();
            // (salary > 9500 & Globex) -> Roberts; | Smith -> 2 hits
            assert_eq!(found.length(), 2);

            // except removes from the left operand
            let except = employees
                .query(
                    ctx,
                    "salary > :1 ^ employer.name == :2",
                    &[Value::Number(8_500.0), Value::from("Globex")],
                    &NO_OPTS,
                )
                .unwrap();
            // salary > 8500 -> {Johnson(9000), Roberts(10000)}; minus Globex -> Johnson
            assert_eq!(except.length(), 1);

            // parentheses override
            let grouped = employees
                .query(
                    ctx,
                    "(lastName == :1 | lastName == :2) & salary > :3",
                    &[
                        Value::from("Smith"),
                        Value::from("Jones"),
                        Value::Number(1_500.0),
                    ],
                    &NO_OPTS,
                )
                .unwrap();
            assert_eq!(grouped.length(), 1); // Jones at 2000
        });
    }

    #[test]
    fn comparator_family_works() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let q = |text: &str, params: &[Value]| {
                employees.query(ctx, text, params, &NO_OPTS).unwrap().length()
            };
            assert_eq!(q("salary >= :1", &[Value::Number(9000.0)]), 2);
            assert_eq!(q("salary < :1", &[Value::Number(2000.0)]), 1);
            assert_eq!(q("lastName begin :1", &[Value::from("Jo")]), 2); // Jones, Johnson
            assert_eq!(
                q(
                    "lastName in :1",
                    &[Value::Array(vec![
                        Value::from("Smith"),
                        Value::from("Evans"),
                        Value::from("Nobody"),
                    ])]
                ),
                2
            );
            assert_eq!(q("lastName != :1", &[Value::from("Smith")]), 9);
            assert_eq!(q("lastName =% :1", &[Value::from("^.o")]), 3); // Jones, Johnson, Roberts
            assert_eq!(q("!(salary > :1)", &[Value::Number(5000.0)]), 5);
        });
    }

    #[test]
    fn find_is_query_plus_first() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let found = employees
                .find(ctx, "salary === :1", &[Value::Number(4000.0)], &NO_OPTS)
                .unwrap();
            assert!(found.is_some());
            assert!(employees
                .find(ctx, "salary === :1", &[Value::Number(-1.0)], &NO_OPTS)
                .unwrap()
                .is_none());
        });
    }

    #[test]
    fn calculated_attribute_queries_rewrite_through_on_query() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            // everyone in the seed has a hiring date
            assert_eq!(
                employees
                    .query(ctx, "hired == :1", &[Value::Bool(true)], &NO_OPTS)
                    .unwrap()
                    .length(),
                10
            );
            let mut unhired = employees.create_entity().unwrap();
            unhired.set("lastName", Value::from("Newcomer")).unwrap();
            unhired.save(ctx).unwrap();
            assert_eq!(
                employees
                    .query(ctx, "hired == :1", &[Value::Bool(false)], &NO_OPTS)
                    .unwrap()
                    .length(),
                1
            );
            // a calculated attribute without on_query cannot be queried
            let err = employees
                .query(ctx, "fullName == :1", &[Value::from("x")], &NO_OPTS)
                .unwrap_err();
            assert!(matches!(
                err,
                DbError::Query(savanna_core::QueryError::NoQueryHook { .. })
            ));
        });
    }

    #[test]
    fn query_diagnostics_report_plan_and_path() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let opts = QueryOptions::with_diagnostics();
            let found = employees
                .query(
                    ctx,
                    "salary > :1 & hired == :2",
                    &[Value::Number(5000.0), Value::Bool(true)],
                    &opts,
                )
                .unwrap();
            let plan = found.query_plan().unwrap();
            assert!(plan.contains("index scan on Employee.salary"), "{plan}");
            assert!(plan.contains("sequential scan"), "{plan}");
            let path = found.query_path().unwrap();
            // the calculated clause was rewritten onto storage
            assert!(path.contains("hiringDate"), "{path}");
            assert!(!path.contains("hired"), "{path}");
        });
    }

    #[test]
    fn javascript_clauses_need_the_option_and_an_evaluator() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let err = employees
                .query(ctx, "$(candidate)", &[], &NO_OPTS)
                .unwrap_err();
            assert!(matches!(err, DbError::Query(_)));

            let allow = QueryOptions {
                allow_javascript: true,
                ..QueryOptions::default()
            };
            // no evaluator installed yet
            assert!(employees.query(ctx, "$(candidate)", &[], &allow).is_err());

            ds.set_script_evaluator(Arc::new(|_, record| {
                Ok(record
                    .attribute("lastName")
                    .and_then(|v| v.as_text().map(|t| t.len() == 5))
                    .unwrap_or(false))
            }));
            let five_letter = employees.query(ctx, "$(candidate)", &[], &allow).unwrap();
            // Smith, Jones, Brown, Evans
            assert_eq!(five_letter.length(), 4);
        });
    }

    #[test]
    fn collection_scoped_queries_stay_inside_the_collection() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let acme = employees
                .query(ctx, "employer.name == :1", &[Value::from("ACME")], &NO_OPTS)
                .unwrap();
            let rich_acme = acme
                .query(ctx, "salary > :1", &[Value::Number(4000.0)], &NO_OPTS)
                .unwrap();
            assert_eq!(rich_acme.length(), 3); // 5000, 7000, 9000
        });
    }

    // === Transactions ===

    #[test]
    fn nested_rollback_discards_only_the_inner_level() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            ctx.start_transaction();
            quick_employee(ds, ctx, "Outer", 1000.0).unwrap();
            ctx.start_transaction();
            quick_employee(ds, ctx, "Inner", 2000.0).unwrap();
            ctx.rollback().unwrap();
            assert_eq!(ctx.transaction_level(), 1);
            ctx.commit().unwrap();

            assert_eq!(employees.length(ctx).unwrap(), 1);
            let mut survivor = employees.first(ctx).unwrap().unwrap();
            assert_eq!(survivor.get(ctx, "lastName").unwrap(), Value::from("Outer"));
        });
    }

    #[test]
    fn buffered_writes_are_read_your_writes_and_isolated() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            ctx.start_transaction();
            quick_employee(ds, ctx, "Hidden", 1000.0).unwrap();

            // visible to the buffering context
            assert_eq!(employees.length(ctx).unwrap(), 1);
            assert!(employees
                .find(ctx, "lastName == :1", &[Value::from("Hidden")], &NO_OPTS)
                .unwrap()
                .is_some());

            // invisible to a fresh context until commit returns
            let other = ds.context();
            assert_eq!(employees.length(&other).unwrap(), 0);

            ctx.commit().unwrap();
            assert_eq!(employees.length(&other).unwrap(), 1);
        });
    }

    #[test]
    fn stamp_and_hooks_defer_to_the_outer_commit() {
        with_datastore(|ds, ctx| {
            let mut emp = quick_employee(ds, ctx, "Smith", 1000.0).unwrap();
            ctx.start_transaction();
            emp.set("salary", Value::Number(2000.0)).unwrap();
            emp.save(ctx).unwrap();
            // buffered: stamp unchanged, flags already settled
            assert_eq!(emp.get_stamp(), 1);
            assert!(!emp.is_modified());
            ctx.commit().unwrap();

            emp.refresh(ctx).unwrap();
            assert_eq!(emp.get_stamp(), 2);
        });
    }

    #[test]
    fn failed_outer_commit_rejects_the_whole_set() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let fresh = quick_employee(ds, ctx, "Smith", 1000.0).unwrap();
            let key = fresh.get_key().unwrap().clone();

            ctx.start_transaction();
            quick_employee(ds, ctx, "Fine", 2000.0).unwrap();
            let mut stale = employees.get_entity_by_key(ctx, &key).unwrap().unwrap();
            stale.set("salary", Value::Number(1500.0)).unwrap();
            stale.save(ctx).unwrap();

            // another context moves the stamp under the open transaction
            let other = ds.context();
            let mut racer = employees.get_entity_by_key(&other, &key).unwrap().unwrap();
            racer.set("salary", Value::Number(1750.0)).unwrap();
            racer.save(&other).unwrap();

            let err = ctx.commit().unwrap_err();
            assert!(matches!(err, DbError::StampConflict { .. }));
            assert_eq!(ctx.transaction_level(), 0);

            // the whole buffered set was rejected, including the clean save
            assert!(employees
                .find(ctx, "lastName == :1", &[Value::from("Fine")], &NO_OPTS)
                .unwrap()
                .is_none());
        });
    }

    #[test]
    fn pause_and_resume_restore_the_buffer() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            ctx.pause_transaction(); // level 0: error-free no-op
            ctx.start_transaction();
            quick_employee(ds, ctx, "Buffered", 1000.0).unwrap();

            ctx.pause_transaction();
            assert_eq!(ctx.transaction_level(), 0);
            // autocommitted while paused, durable immediately
            quick_employee(ds, ctx, "Direct", 2000.0).unwrap();
            let other = ds.context();
            assert_eq!(employees.length(&other).unwrap(), 1);

            ctx.resume_transaction();
            assert_eq!(ctx.transaction_level(), 1);
            ctx.commit().unwrap();
            assert_eq!(employees.length(&other).unwrap(), 2);
        });
    }

    #[test]
    fn inner_commit_does_not_flush() {
        with_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            ctx.start_transaction();
            ctx.start_transaction();
            quick_employee(ds, ctx, "Deep", 1000.0).unwrap();
            ctx.commit().unwrap(); // level 2 -> 1, nothing durable yet

            let other = ds.context();
            assert_eq!(employees.length(&other).unwrap(), 0);

            ctx.commit().unwrap();
            assert_eq!(employees.length(&other).unwrap(), 1);
        });
    }

    #[test]
    fn removed_entities_are_logically_absent_from_collections() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let all = employees.all(ctx).unwrap();
            assert_eq!(all.length(), 10);

            let mut victim = all.first(ctx).unwrap().unwrap();
            victim.remove(ctx).unwrap();

            // the stale key is skipped, not an error
            assert_eq!(all.length(), 10);
            assert_eq!(all.count(ctx).unwrap(), 9);
            let first = all.first(ctx).unwrap().unwrap();
            assert_ne!(first.get_key(), victim.get_key());
        });
    }

    // === Projection and the export boundary ===

    #[test]
    fn to_array_projects_relations_and_key_stamp() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let rows = employees
                .all(ctx)
                .unwrap()
                .to_array(
                    ctx,
                    "lastName, salary, employer.name",
                    Some("salary"),
                    true,
                    Some(0),
                    Some(1),
                )
                .unwrap();
            assert_eq!(rows.len(), 1);
            let row = rows[0].as_object().unwrap();
            assert_eq!(row["lastName"], serde_json::json!("Smith"));
            assert_eq!(row["salary"], serde_json::json!(1000.0));
            assert_eq!(row["employer"]["name"], serde_json::json!("ACME"));
            assert!(row.contains_key("__KEY"));
            assert_eq!(row["__STAMP"], serde_json::json!(1));
        });
    }

    #[test]
    fn to_array_from_array_roundtrip() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let rows = employees
                .all(ctx)
                .unwrap()
                .to_array(ctx, "lastName, salary", None, false, None, None)
                .unwrap();

            let other = Datastore::new(crate::fixtures::employee_catalog());
            let other_ctx = other.context();
            let restored = other
                .dataclass("Employee")
                .unwrap()
                .from_array(&other_ctx, &rows)
                .unwrap();
            assert_eq!(restored.length(), 10);

            let mut names: Vec<String> = Vec::new();
            restored
                .for_each(&other_ctx, |e, _| {
                    names.push(e.get(&other_ctx, "lastName")?.as_text().unwrap().to_owned());
                    Ok(())
                })
                .unwrap();
            let mut expected: Vec<String> =
                crate::fixtures::SEED_NAMES.iter().map(|s| (*s).to_owned()).collect();
            names.sort();
            expected.sort();
            assert_eq!(names, expected);
        });
    }

    #[test]
    fn from_array_with_key_and_stamp_updates() {
        with_seeded_datastore(|ds, ctx| {
            let employees = ds.dataclass("Employee").unwrap();
            let mut smith = employees
                .find(ctx, "lastName == :1", &[Value::from("Smith")], &NO_OPTS)
                .unwrap()
                .unwrap();
            let key = smith.get_key().unwrap().to_string();

            let row = serde_json::json!({
                "__KEY": key.parse::<i64>().unwrap(),
                "__STAMP": 1,
                "salary": 1234.5,
            });
            employees.from_array(ctx, &[row]).unwrap();
            smith.refresh(ctx).unwrap();
            assert_eq!(smith.get(ctx, "salary").unwrap(), Value::Number(1234.5));

            // a stale __STAMP conflicts
            let stale = serde_json::json!({
                "__KEY": key.parse::<i64>().unwrap(),
                "__STAMP": 1,
                "salary": 1.0,
            });
            let err = employees.from_array(ctx, &[stale]).unwrap_err();
            assert!(matches!(err, DbError::StampConflict { .. }));
        });
    }

    #[test]
    fn json_export_import_roundtrip() {
        with_seeded_datastore(|ds, ctx| {
            let dir = tempfile::tempdir().unwrap();
            ds.export_as_json(dir.path()).unwrap();
            assert!(dir.path().join("Employee.json").exists());
            assert!(dir.path().join("Company.json").exists());

            let other = Datastore::new(crate::fixtures::employee_catalog());
            other.import_from_json(dir.path()).unwrap();
            let other_ctx = other.context();
            let employees = other.dataclass("Employee").unwrap();
            assert_eq!(employees.length(&other_ctx).unwrap(), 10);

            // indexes were rebuilt: an indexed query works immediately
            let found = employees
                .query(&other_ctx, "lastName == :1", &[Value::from("Smith")], &NO_OPTS)
                .unwrap();
            assert_eq!(found.length(), 1);

            // relations survive through foreign keys
            let mut smith = found.first(&other_ctx).unwrap().unwrap();
            assert_eq!(
                smith.get(&other_ctx, "employerCity").unwrap(),
                Value::from("Memphis")
            );
        });
    }

    #[test]
    fn sql_export_writes_ddl_and_inserts() {
        with_seeded_datastore(|ds, _ctx| {
            let dir = tempfile::tempdir().unwrap();
            ds.export_as_sql(dir.path()).unwrap();
            let sql = std::fs::read_to_string(dir.path().join("Employee.sql")).unwrap();
            assert!(sql.contains("CREATE TABLE [Employee]"));
            assert_eq!(sql.matches("INSERT INTO [Employee]").count(), 10);
            // calculated attributes never travel
            assert!(!sql.contains("fullName"));
        });
    }

    // === Named storage ===

    #[test]
    fn named_storage_is_shared_and_lockable() {
        with_datastore(|ds, ctx| {
            let storage = ds.get_storage("session");
            storage.set_item("visits", Value::Long(1));
            assert_eq!(
                ds.get_storage("session").get_item("visits"),
                Some(Value::Long(1))
            );

            let other = ds.context();
            assert!(storage.try_lock(ctx.id()));
            assert!(!storage.try_lock(other.id()));
            storage.unlock(ctx.id());
            assert!(storage.try_lock(other.id()));
            storage.unlock(other.id());

            ds.remove_storage("session");
            assert_eq!(ds.get_storage("session").length(), 0);
        });
    }

    // === Virtual backend adapters ===

    #[test]
    fn adapter_class_is_indistinguishable_for_crud_and_queries() {
        let ds = Datastore::new(board_catalog());
        ds.register_adapter("Board", Arc::new(MemoryAdapter::new()))
            .unwrap();
        let ctx = ds.context();
        let boards = ds.dataclass("Board").unwrap();

        let mut board = boards.create_entity().unwrap();
        board.set("name", Value::from("Launch")).unwrap();
        board.set("desc", Value::from("plan the launch")).unwrap();
        board.save(&ctx).unwrap();
        assert!(!board.is_new());
        assert_eq!(board.get_stamp(), 1); // MemoryAdapter implements get_stamp

        let mut second = boards.create_entity().unwrap();
        second.set("name", Value::from("Retro")).unwrap();
        second.save(&ctx).unwrap();
        assert_eq!(boards.length(&ctx).unwrap(), 2);

        // the engine filters all_entities when the adapter has no query
        let found = boards
            .query(&ctx, "name == :1", &[Value::from("La*")], &NO_OPTS)
            .unwrap();
        assert_eq!(found.length(), 1);
        let mut hit = found.first(&ctx).unwrap().unwrap();
        assert_eq!(hit.get(&ctx, "name").unwrap(), Value::from("Launch"));

        // ordering falls back to the engine sort
        let sorted = boards.all(&ctx).unwrap().order_by(&ctx, "name").unwrap();
        let mut first = sorted.first(&ctx).unwrap().unwrap();
        assert_eq!(first.get(&ctx, "name").unwrap(), Value::from("Launch"));

        // deletes dispatch to drop_entity
        let key = hit.get_key().unwrap().clone();
        hit.remove(&ctx).unwrap();
        assert!(boards.get_entity_by_key(&ctx, &key).unwrap().is_none());
        assert_eq!(boards.length(&ctx).unwrap(), 1);
    }

    #[test]
    fn adapter_errors_propagate_verbatim() {
        struct Failing;
        impl savanna_core::VirtualAdapter for Failing {
            fn all_entities(&self) -> savanna_core::AdapterResult<Vec<savanna_core::AttrRow>> {
                Err(savanna_core::AdapterError::new("remote service down"))
            }
            fn get_entity_by_key(
                &self,
                _key: &EntityKey,
            ) -> savanna_core::AdapterResult<Option<savanna_core::AttrRow>> {
                Err(savanna_core::AdapterError::new("remote service down"))
            }
            fn save_entity(
                &self,
                _key: Option<&EntityKey>,
                _values: &savanna_core::AttrRow,
            ) -> savanna_core::AdapterResult<EntityKey> {
                Err(savanna_core::AdapterError::new("remote service down"))
            }
            fn drop_entity(&self, _key: &EntityKey) -> savanna_core::AdapterResult<()> {
                Err(savanna_core::AdapterError::new("remote service down"))
            }
        }

        let ds = Datastore::new(board_catalog());
        ds.register_adapter("Board", Arc::new(Failing)).unwrap();
        let ctx = ds.context();
        let boards = ds.dataclass("Board").unwrap();
        let err = boards.all(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "adapter error: remote service down");
    }

    #[test]
    fn adapter_query_by_string_short_circuits() {
        struct Canned;
        impl savanna_core::VirtualAdapter for Canned {
            fn all_entities(&self) -> savanna_core::AdapterResult<Vec<savanna_core::AttrRow>> {
                Ok(Vec::new())
            }
            fn get_entity_by_key(
                &self,
                key: &EntityKey,
            ) -> savanna_core::AdapterResult<Option<savanna_core::AttrRow>> {
                if !matches!(key, EntityKey::Long(7)) {
                    return Ok(None);
                }
                let mut row = savanna_core::AttrRow::new();
                row.insert("ID".to_owned(), Value::Long(7));
                row.insert("name".to_owned(), Value::from("canned"));
                Ok(Some(row))
            }
            fn save_entity(
                &self,
                _key: Option<&EntityKey>,
                _values: &savanna_core::AttrRow,
            ) -> savanna_core::AdapterResult<EntityKey> {
                Ok(EntityKey::Long(7))
            }
            fn drop_entity(&self, _key: &EntityKey) -> savanna_core::AdapterResult<()> {
                Ok(())
            }
            fn query_by_string(
                &self,
                query: &str,
            ) -> savanna_core::AdapterResult<Option<Vec<savanna_core::AttrRow>>> {
                if query.starts_with('+') {
                    let mut row = savanna_core::AttrRow::new();
                    row.insert("ID".to_owned(), Value::Long(7));
                    row.insert("name".to_owned(), Value::from("canned"));
                    Ok(Some(vec![row]))
                } else {
                    Ok(None)
                }
            }
        }

        let ds = Datastore::new(board_catalog());
        ds.register_adapter("Board", Arc::new(Canned)).unwrap();
        let ctx = ds.context();
        let boards = ds.dataclass("Board").unwrap();

        // a '+'-prefixed query string is source-native syntax: the adapter
        // answers it before the engine grammar ever sees the text
        let canned = boards.query(&ctx, "+7", &[], &NO_OPTS).unwrap();
        assert_eq!(canned.length(), 1);
        let mut hit = canned.first(&ctx).unwrap().unwrap();
        assert_eq!(hit.get(&ctx, "name").unwrap(), Value::from("canned"));
    }
}
