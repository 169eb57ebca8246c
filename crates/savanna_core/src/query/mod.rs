//! The query evaluator: textual predicates, planning and execution.

mod exec;
mod parser;

use crate::collection::EntityCollection;
use crate::context::ExecutionContext;
use crate::engine::{ClassRt, DatastoreInner};
use crate::error::{DbResult, QueryError};
use crate::types::EntityKey;
use savanna_model::{AttributeKind, Value};
use std::sync::Arc;

pub(crate) use parser::{parse, Clause, Comparator, Predicate};

/// Options accepted by `query` and `find`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Attach a description of the query as actually performed.
    pub query_path: bool,
    /// Attach a description of the planned execution.
    pub query_plan: bool,
    /// Permit `$`-prefixed opaque script clauses.
    pub allow_javascript: bool,
}

impl QueryOptions {
    /// Options with both diagnostics enabled.
    #[must_use]
    pub fn with_diagnostics() -> Self {
        Self {
            query_path: true,
            query_plan: true,
            allow_javascript: false,
        }
    }
}

/// Rewrites a parsed predicate against a class: alias paths expand, and
/// every clause on a calculated attribute is replaced by the predicate its
/// `on_query` hook returns. A calculated attribute without a hook cannot be
/// queried.
pub(crate) fn rewrite(class: &Arc<ClassRt>, pred: Predicate) -> DbResult<Predicate> {
    Ok(match pred {
        Predicate::Clause(clause) => rewrite_clause(class, clause)?,
        Predicate::Not(p) => Predicate::Not(Box::new(rewrite(class, *p)?)),
        Predicate::And(list) => Predicate::And(
            list.into_iter()
                .map(|p| rewrite(class, p))
                .collect::<DbResult<_>>()?,
        ),
        Predicate::Or(list) => Predicate::Or(
            list.into_iter()
                .map(|p| rewrite(class, p))
                .collect::<DbResult<_>>()?,
        ),
        Predicate::Except(a, b) => Predicate::Except(
            Box::new(rewrite(class, *a)?),
            Box::new(rewrite(class, *b)?),
        ),
        Predicate::Js(body) => Predicate::Js(body),
    })
}

fn rewrite_clause(class: &Arc<ClassRt>, clause: Clause) -> DbResult<Predicate> {
    let head = clause.path.split('.').next().unwrap_or_default();
    let head = head.strip_suffix("[]").unwrap_or(head);
    let attr = class.def.attribute(head).ok_or_else(|| QueryError::UnknownAttribute {
        class: class.name().to_owned(),
        attribute: head.to_owned(),
    })?;
    match attr.kind {
        AttributeKind::Calculated => {
            let hook = attr.on_query.as_ref().ok_or_else(|| QueryError::NoQueryHook {
                attribute: attr.name.clone(),
            })?;
            let rewritten = hook(clause.comparator.symbol(), &clause.value).map_err(|e| {
                QueryError::Parse {
                    offset: 0,
                    message: format!("on_query hook failed: {e}"),
                }
            })?;
            let sub = parse(&rewritten, &[])?;
            // the hook may itself name calculated attributes
            rewrite(class, sub)
        }
        _ => Ok(Predicate::Clause(clause)),
    }
}

/// Renders a predicate back to its textual form (the `queryPath`
/// diagnostic: the query as actually performed, rewrites applied).
pub(crate) fn render_predicate(pred: &Predicate) -> String {
    fn atom(p: &Predicate) -> String {
        match p {
            Predicate::Clause(_) | Predicate::Js(_) | Predicate::Not(_) => render_predicate(p),
            _ => format!("({})", render_predicate(p)),
        }
    }
    match pred {
        Predicate::Clause(c) => format!("{} {} {}", c.path, c.comparator.symbol(), c.value),
        Predicate::Not(p) => format!("!{}", atom(p)),
        Predicate::And(list) => list.iter().map(atom).collect::<Vec<_>>().join(" & "),
        Predicate::Or(list) => list.iter().map(atom).collect::<Vec<_>>().join(" | "),
        Predicate::Except(a, b) => format!("{} ^ {}", atom(a), atom(b)),
        Predicate::Js(body) => format!("$({body})"),
    }
}

/// Renders the plan chosen for each clause (the `queryPlan` diagnostic).
pub(crate) fn render_plan(class: &Arc<ClassRt>, pred: &Predicate) -> String {
    fn atom(class: &Arc<ClassRt>, p: &Predicate) -> String {
        match p {
            Predicate::Clause(_) | Predicate::Js(_) | Predicate::Not(_) => render_plan(class, p),
            _ => format!("({})", render_plan(class, p)),
        }
    }
    match pred {
        Predicate::Clause(c) => exec::access_description(class, c),
        Predicate::Not(p) => format!("!{}", atom(class, p)),
        Predicate::And(list) => list
            .iter()
            .map(|p| atom(class, p))
            .collect::<Vec<_>>()
            .join(" & "),
        Predicate::Or(list) => list
            .iter()
            .map(|p| atom(class, p))
            .collect::<Vec<_>>()
            .join(" | "),
        Predicate::Except(a, b) => format!("{} ^ {}", atom(class, a), atom(class, b)),
        Predicate::Js(_) => format!("sequential scan on {} [javascript clause]", class.name()),
    }
}

/// Parses, rewrites, plans and executes one textual query.
pub(crate) fn run_query(
    inner: &Arc<DatastoreInner>,
    ctx: &ExecutionContext,
    class: &Arc<ClassRt>,
    text: &str,
    params: &[Value],
    options: &QueryOptions,
    base: Option<&[EntityKey]>,
) -> DbResult<EntityCollection> {
    // An adapter gets the raw text first: a source-native query string does
    // not have to satisfy the engine grammar.
    if base.is_none() {
        if let Some(adapter) = class.adapter() {
            if let Some(rows) = adapter.query_by_string(text)? {
                let keys = rows
                    .iter()
                    .map(|r| class.row_key(r))
                    .collect::<DbResult<Vec<_>>>()?;
                return Ok(EntityCollection::from_keys(
                    Arc::clone(class),
                    Arc::clone(inner),
                    keys,
                    false,
                ));
            }
        }
    }

    let parsed = parse(text, params)?;
    if parsed.contains_js() && !options.allow_javascript {
        return Err(QueryError::Parse {
            offset: 0,
            message: "$ clauses require the allowJavascript option".to_owned(),
        }
        .into());
    }
    let predicate = rewrite(class, parsed)?;
    let plan = options
        .query_plan
        .then(|| render_plan(class, &predicate));
    let keys = exec::execute(inner, ctx, class, &predicate, base)?;
    let path = options
        .query_path
        .then(|| render_predicate(&predicate));

    let mut collection =
        EntityCollection::from_keys(Arc::clone(class), Arc::clone(inner), keys, false);
    collection.set_diagnostics(path, plan);
    Ok(collection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_roundtrips_the_shape() {
        let pred = parse(
            "a == 1 | b == 2 & !c == 3 ^ d == 4",
            &[],
        )
        .unwrap();
        let text = render_predicate(&pred);
        assert_eq!(text, "a == 1 | ((b == 2 & !c == 3) ^ d == 4)");
        // parsing the rendering yields the same rendering
        let again = parse(&text, &[]).unwrap();
        assert_eq!(render_predicate(&again), text);
    }

    #[test]
    fn rendering_quotes_text_operands() {
        let pred = parse("name == :1", &[Value::Text("Sm*th".into())]).unwrap();
        assert_eq!(render_predicate(&pred), "name == 'Sm*th'");
    }
}
