//! Predicate execution: index selection, scans and boolean set algebra.

use crate::adapter::Criterion;
use crate::context::ExecutionContext;
use crate::engine::{ClassRt, DatastoreInner, ValuesRef};
use crate::error::{DbResult, QueryError};
use crate::query::parser::{Clause, Comparator, Predicate};
use crate::types::EntityKey;
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use savanna_model::{fold_text, keywords, wildcard_to_regex, Value};
use std::sync::Arc;
use tracing::trace;

/// A clause with its precompiled matching machinery.
struct ClauseNode {
    path: String,
    comparator: Comparator,
    value: Value,
    regex: Option<Regex>,
}

enum Node {
    Clause(ClauseNode),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
    Except(Box<Node>, Box<Node>),
    Js(String),
}

fn build(pred: &Predicate) -> DbResult<Node> {
    Ok(match pred {
        Predicate::Clause(c) => Node::Clause(build_clause(c)?),
        Predicate::Not(p) => Node::Not(Box::new(build(p)?)),
        Predicate::And(list) => Node::And(list.iter().map(build).collect::<DbResult<_>>()?),
        Predicate::Or(list) => Node::Or(list.iter().map(build).collect::<DbResult<_>>()?),
        Predicate::Except(a, b) => Node::Except(Box::new(build(a)?), Box::new(build(b)?)),
        Predicate::Js(body) => Node::Js(body.clone()),
    })
}

fn build_clause(clause: &Clause) -> DbResult<ClauseNode> {
    let regex = match clause.comparator {
        Comparator::Like | Comparator::NotLike | Comparator::Keyword => match &clause.value {
            Value::Text(pattern) if pattern.contains('*') => Some(
                Regex::new(&wildcard_to_regex(pattern)).map_err(|e| QueryError::BadRegex {
                    message: e.to_string(),
                })?,
            ),
            _ => None,
        },
        Comparator::Matches | Comparator::NotMatches => match &clause.value {
            Value::Text(pattern) => Some(Regex::new(pattern).map_err(|e| QueryError::BadRegex {
                message: e.to_string(),
            })?),
            _ => None,
        },
        _ => None,
    };
    Ok(ClauseNode {
        path: clause.path.clone(),
        comparator: clause.comparator,
        value: clause.value.clone(),
        regex,
    })
}

impl ClauseNode {
    fn like_matches(&self, candidate: &Value) -> bool {
        match (&self.regex, candidate) {
            (Some(re), Value::Text(text)) => re.is_match(&fold_text(text)),
            (Some(_), _) => false,
            (None, _) => candidate.compare(&self.value) == Some(std::cmp::Ordering::Equal),
        }
    }

    fn matches(&self, candidates: &[Value]) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self.comparator {
            Comparator::Like => candidates.iter().any(|v| self.like_matches(v)),
            Comparator::NotLike => !candidates.iter().any(|v| self.like_matches(v)),
            Comparator::StrictEq => candidates.iter().any(|v| v.strict_eq(&self.value)),
            Comparator::StrictNe => !candidates.iter().any(|v| v.strict_eq(&self.value)),
            Comparator::Gt => candidates
                .iter()
                .any(|v| v.compare(&self.value) == Some(Greater)),
            Comparator::Ge => candidates
                .iter()
                .any(|v| matches!(v.compare(&self.value), Some(Greater | Equal))),
            Comparator::Lt => candidates
                .iter()
                .any(|v| v.compare(&self.value) == Some(Less)),
            Comparator::Le => candidates
                .iter()
                .any(|v| matches!(v.compare(&self.value), Some(Less | Equal))),
            Comparator::In => match &self.value {
                Value::Array(items) => candidates
                    .iter()
                    .any(|v| items.iter().any(|item| v.compare(item) == Some(Equal))),
                _ => false,
            },
            Comparator::Begin => match &self.value {
                Value::Text(prefix) => candidates.iter().any(|v| {
                    v.as_text()
                        .is_some_and(|t| fold_text(t).starts_with(&fold_text(prefix)))
                }),
                _ => false,
            },
            Comparator::Keyword => candidates.iter().any(|v| {
                let Some(text) = v.as_text() else {
                    return false;
                };
                keywords(text).iter().any(|word| match &self.regex {
                    Some(re) => re.is_match(word),
                    None => self
                        .value
                        .as_text()
                        .is_some_and(|operand| *word == fold_text(operand)),
                })
            }),
            Comparator::Matches => candidates.iter().any(|v| {
                v.as_text()
                    .is_some_and(|t| self.regex.as_ref().is_some_and(|re| re.is_match(t)))
            }),
            Comparator::NotMatches => !candidates.iter().any(|v| {
                v.as_text()
                    .is_some_and(|t| self.regex.as_ref().is_some_and(|re| re.is_match(t)))
            }),
        }
    }
}

/// How a clause can use an index.
pub(crate) enum Access {
    /// Equality posting lookup.
    Eq(Value),
    /// Text prefix scan.
    Prefix(String),
    /// Ordered range scan.
    Range {
        min: Option<(Value, bool)>,
        max: Option<(Value, bool)>,
    },
    /// One equality lookup per element.
    In(Vec<Value>),
    /// Keyword posting lookup.
    Keyword(String),
}

/// Splits a wildcard pattern into a prefix when it is index-friendly
/// (`"abc*"` and nothing else).
fn trailing_wildcard_prefix(pattern: &str) -> Option<&str> {
    let stripped = pattern.strip_suffix('*')?;
    if stripped.is_empty() || stripped.contains('*') {
        None
    } else {
        Some(stripped)
    }
}

/// Decides whether a clause can be served from an index.
pub(crate) fn index_access(class: &ClassRt, clause: &Clause) -> Option<Access> {
    if clause.path.contains('.') {
        return None;
    }
    let attr = class.def.attribute(&clause.path)?;
    if !attr.is_stored() {
        return None;
    }
    let indexes = class.indexes.read();
    let ordered = indexes.has_ordered(&clause.path);
    match clause.comparator {
        Comparator::Like => {
            if !ordered {
                return None;
            }
            match &clause.value {
                Value::Text(pattern) if pattern.contains('*') => trailing_wildcard_prefix(pattern)
                    .map(|p| Access::Prefix(p.to_owned())),
                Value::Null => None,
                v => Some(Access::Eq(v.clone())),
            }
        }
        Comparator::StrictEq => match (&clause.value, ordered) {
            (Value::Null, _) | (_, false) => None,
            (v, true) => Some(Access::Eq(v.clone())),
        },
        Comparator::Gt => ordered.then(|| Access::Range {
            min: Some((clause.value.clone(), false)),
            max: None,
        }),
        Comparator::Ge => ordered.then(|| Access::Range {
            min: Some((clause.value.clone(), true)),
            max: None,
        }),
        Comparator::Lt => ordered.then(|| Access::Range {
            min: None,
            max: Some((clause.value.clone(), false)),
        }),
        Comparator::Le => ordered.then(|| Access::Range {
            min: None,
            max: Some((clause.value.clone(), true)),
        }),
        Comparator::Begin => match &clause.value {
            Value::Text(prefix) if ordered => Some(Access::Prefix(prefix.clone())),
            _ => None,
        },
        Comparator::In => match &clause.value {
            Value::Array(items) if ordered => Some(Access::In(items.clone())),
            _ => None,
        },
        Comparator::Keyword => match &clause.value {
            Value::Text(word) if !word.contains('*') && indexes.has_keyword(&clause.path) => {
                Some(Access::Keyword(word.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}

/// One-line description of how a clause will be executed, for `queryPlan`.
pub(crate) fn access_description(class: &ClassRt, clause: &Clause) -> String {
    let detail = format!(
        "{} {} {}",
        clause.path,
        clause.comparator.symbol(),
        clause.value
    );
    match index_access(class, clause) {
        Some(Access::Keyword(_)) => {
            format!("keyword index scan on {}.{} [{detail}]", class.name(), clause.path)
        }
        Some(_) => format!("index scan on {}.{} [{detail}]", class.name(), clause.path),
        None => format!("sequential scan on {} [{detail}]", class.name()),
    }
}

struct Exec<'a> {
    inner: &'a DatastoreInner,
    ctx: &'a ExecutionContext,
    class: &'a Arc<ClassRt>,
}

impl Exec<'_> {
    fn eval_record(&self, node: &Node, values: &IndexMap<String, Value>) -> DbResult<bool> {
        match node {
            Node::Clause(c) => {
                let candidates =
                    self.inner
                        .record_path_values(self.ctx, self.class, values, &c.path)?;
                Ok(c.matches(&candidates))
            }
            Node::Not(p) => Ok(!self.eval_record(p, values)?),
            Node::And(list) => {
                for p in list {
                    if !self.eval_record(p, values)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Node::Or(list) => {
                for p in list {
                    if self.eval_record(p, values)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Node::Except(a, b) => {
                Ok(self.eval_record(a, values)? && !self.eval_record(b, values)?)
            }
            Node::Js(body) => {
                let eval = self
                    .inner
                    .js_eval
                    .get()
                    .ok_or(QueryError::NoScriptEvaluator)?;
                eval(body, &ValuesRef { values })
            }
        }
    }

    fn scan(&self, candidates: &[EntityKey], node: &Node) -> DbResult<Vec<EntityKey>> {
        let mut keys = Vec::new();
        for key in candidates {
            if let Some((values, _)) = self.inner.load_record(self.ctx, self.class, key)? {
                if self.eval_record(node, &values)? {
                    keys.push(key.clone());
                }
            }
        }
        Ok(keys)
    }

    fn extent(&self) -> DbResult<Vec<EntityKey>> {
        self.inner.class_extent(self.ctx, self.class)
    }

    fn eval_set(&self, node: &Node) -> DbResult<IndexSet<EntityKey>> {
        match node {
            Node::And(list) => {
                let mut iter = list.iter();
                let Some(first) = iter.next() else {
                    return Ok(self.extent()?.into_iter().collect());
                };
                let mut result = self.eval_set(first)?;
                for p in iter {
                    let next = self.eval_set(p)?;
                    result.retain(|k| next.contains(k));
                }
                Ok(result)
            }
            Node::Or(list) => {
                let mut result = IndexSet::new();
                for p in list {
                    result.extend(self.eval_set(p)?);
                }
                Ok(result)
            }
            Node::Except(a, b) => {
                let mut result = self.eval_set(a)?;
                let minus = self.eval_set(b)?;
                result.retain(|k| !minus.contains(k));
                Ok(result)
            }
            Node::Not(p) => {
                let matched = self.eval_set(p)?;
                Ok(self
                    .extent()?
                    .into_iter()
                    .filter(|k| !matched.contains(k))
                    .collect())
            }
            Node::Js(_) => Ok(self.scan(&self.extent()?, node)?.into_iter().collect()),
            Node::Clause(c) => self.clause_set(node, c),
        }
    }

    /// Serves a clause from an index when possible, verifying every
    /// candidate against the full matcher (index entries only prune).
    fn clause_set(&self, node: &Node, c: &ClauseNode) -> DbResult<IndexSet<EntityKey>> {
        let clause = Clause {
            path: c.path.clone(),
            comparator: c.comparator,
            value: c.value.clone(),
        };
        let candidates = match index_access(self.class, &clause) {
            Some(access) => {
                trace!(class = self.class.name(), path = %c.path, "index scan");
                let indexes = self.class.indexes.read();
                match access {
                    Access::Eq(v) => indexes.lookup_eq(&c.path, &v).unwrap_or_default(),
                    Access::Prefix(p) => indexes.lookup_prefix(&c.path, &p).unwrap_or_default(),
                    Access::Range { min, max } => indexes
                        .lookup_range(
                            &c.path,
                            min.as_ref().map(|(v, i)| (v, *i)),
                            max.as_ref().map(|(v, i)| (v, *i)),
                        )
                        .unwrap_or_default(),
                    Access::In(items) => {
                        let mut keys = Vec::new();
                        for item in items {
                            keys.extend(indexes.lookup_eq(&c.path, &item).unwrap_or_default());
                        }
                        keys
                    }
                    Access::Keyword(word) => {
                        indexes.lookup_keyword(&c.path, &word).unwrap_or_default()
                    }
                }
            }
            None => self.extent()?,
        };
        Ok(self.scan(&candidates, node)?.into_iter().collect())
    }
}

/// Lowers a predicate into flat criteria for `query_by_criteria`, when its
/// shape allows (a conjunction of simple text comparisons).
pub(crate) fn lower_criteria(pred: &Predicate) -> Option<Vec<Criterion>> {
    fn clause_criterion(c: &Clause) -> Option<Criterion> {
        if c.path.contains('.') {
            return None;
        }
        let text = c.value.as_text()?;
        let (value, begins, ends, equal) = match c.comparator {
            Comparator::Begin => (text.to_owned(), true, false, false),
            Comparator::StrictEq => (text.to_owned(), false, false, true),
            Comparator::Like => {
                if !text.contains('*') {
                    (text.to_owned(), false, false, true)
                } else if let Some(prefix) = trailing_wildcard_prefix(text) {
                    (prefix.to_owned(), true, false, false)
                } else if let Some(suffix) = text
                    .strip_prefix('*')
                    .filter(|rest| !rest.is_empty() && !rest.contains('*'))
                {
                    (suffix.to_owned(), false, true, false)
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        Some(Criterion {
            attribute_name: c.path.clone(),
            value,
            begins_with: begins,
            ends_with: ends,
            equal,
        })
    }

    match pred {
        Predicate::Clause(c) => Some(vec![clause_criterion(c)?]),
        Predicate::And(list) => list
            .iter()
            .map(|p| match p {
                Predicate::Clause(c) => clause_criterion(c),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Executes a compiled predicate and returns the matching keys.
///
/// `base` restricts the search to an existing collection's members. Native
/// classes go through index-aware set evaluation unless the context holds
/// buffered writes for the class, in which case an overlay-aware scan keeps
/// read-your-writes exact. Virtual classes (whose `query_by_string` already
/// declined upstream) try lowered criteria, then an engine-side filter over
/// `all_entities`.
pub(crate) fn execute(
    inner: &DatastoreInner,
    ctx: &ExecutionContext,
    class: &Arc<ClassRt>,
    pred: &Predicate,
    base: Option<&[EntityKey]>,
) -> DbResult<Vec<EntityKey>> {
    let exec = Exec { inner, ctx, class };
    let node = build(pred)?;

    if let Some(adapter) = class.adapter() {
        if base.is_none() {
            if let Some(criteria) = lower_criteria(pred) {
                if let Some(rows) = adapter.query_by_criteria(&criteria)? {
                    return rows.iter().map(|r| class.row_key(r)).collect();
                }
            }
            let mut keys = Vec::new();
            for row in adapter.all_entities()? {
                if exec.eval_record(&node, &row)? {
                    keys.push(class.row_key(&row)?);
                }
            }
            return Ok(keys);
        }
    }

    match base {
        Some(candidates) => exec.scan(candidates, &node),
        None if ctx.touches_class(class.id()) => {
            let extent = exec.extent()?;
            exec.scan(&extent, &node)
        }
        None => Ok(exec.eval_set(&node)?.into_iter().collect()),
    }
}
