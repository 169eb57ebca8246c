//! Dynamic attribute values and the engine collation.

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// A dynamic attribute value.
///
/// Every storage attribute holds one of these. Scalar variants map onto the
/// schema scalar types; `Array` and `Object` back structured (object-typed)
/// attributes and are traversable with [`Value::walk_path`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null / absent value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value (byte, word, long and long64 all normalize here).
    Long(i64),
    /// Floating point value.
    Number(f64),
    /// UTF-8 text.
    Text(String),
    /// Date-time value (stored as naive UTC).
    Date(NaiveDateTime),
    /// UUID value.
    Uuid(Uuid),
    /// Binary value.
    Blob(Vec<u8>),
    /// Array of values.
    Array(Vec<Value>),
    /// Structured object value with ordered properties.
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Returns the type name used in diagnostics and plan descriptions.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Date(_) => "date",
            Value::Uuid(_) => "uuid",
            Value::Blob(_) => "blob",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Checks for the null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as an `i64` when it is an integer.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as an `f64`, coercing integers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Long(n) => Some(*n as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text content when the value is a string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Parses an ISO-8601 date-time or plain date literal.
    #[must_use]
    pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
        const FORMATS: [&str; 4] = [
            "%Y-%m-%dT%H:%M:%S%.fZ",
            "%Y-%m-%dT%H:%M:%SZ",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S",
        ];
        for f in FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, f) {
                return Some(dt);
            }
        }
        text.parse::<chrono::NaiveDate>()
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    }

    /// Engine collation: compares two values the way the query comparators
    /// (`>`, `>=`, `<`, `<=`, and the equality family) do.
    ///
    /// Integers and numbers coerce to a common numeric axis; text compares
    /// case- and diacritic-insensitively. Values of unrelated types (and any
    /// comparison involving null) return `None`.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(fold_text(a).cmp(&fold_text(b))),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Strict equality for the `===` / `!==` comparators: case-sensitive
    /// text, no wildcard expansion. Numeric coercion still applies (a long
    /// and a number holding the same quantity are the same value).
    #[must_use]
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Long(_) | Value::Number(_), Value::Long(_) | Value::Number(_)) => {
                self.as_f64() == other.as_f64()
            }
            _ => self == other,
        }
    }

    /// Total order used by sorted collections and btree indexes.
    ///
    /// Nulls sort first; mixed types order by a fixed type rank so the order
    /// is total even over heterogeneous extents.
    #[must_use]
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        if let Some(ord) = self.compare(other) {
            return ord;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.sort_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Long(_) | Value::Number(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::Uuid(_) => 5,
            Value::Blob(_) => 6,
            Value::Array(_) => 7,
            Value::Object(_) => 8,
        }
    }

    /// Walks a dotted attribute path through structured values.
    ///
    /// Each segment names an object property; a `seg[]` segment additionally
    /// fans out over the elements of an array property. Traversal through an
    /// intermediate array fans out implicitly, so `"keywords.pages[]"` and
    /// `"dims.bWidth"` both yield every reachable leaf.
    #[must_use]
    pub fn walk_path<'a>(&'a self, path: &str) -> Vec<&'a Value> {
        let mut current: Vec<&Value> = vec![self];
        for raw_seg in path.split('.') {
            let (seg, spread) = match raw_seg.strip_suffix("[]") {
                Some(s) => (s, true),
                None => (raw_seg, false),
            };
            let mut next = Vec::new();
            for value in current {
                collect_segment(value, seg, spread, &mut next);
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }
}

fn collect_segment<'a>(value: &'a Value, seg: &str, spread: bool, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(seg) {
                if spread {
                    if let Value::Array(items) = v {
                        out.extend(items.iter());
                    } else {
                        out.push(v);
                    }
                } else {
                    out.push(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_segment(item, seg, spread, out);
            }
        }
        _ => {}
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%dT%H:%M:%SZ")),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

/// Folds text for the engine collation: lowercases and strips the common
/// Latin diacritics, so `"Émile"` and `"emile"` compare equal.
#[must_use]
pub fn fold_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => out.push('a'),
            'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => out.push('e'),
            'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => out.push('i'),
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => out.push('o'),
            'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => out.push('u'),
            'ç' | 'Ç' => out.push('c'),
            'ñ' | 'Ñ' => out.push('n'),
            'ý' | 'ÿ' | 'Ý' => out.push('y'),
            _ => {
                for lower in ch.to_lowercase() {
                    out.push(lower);
                }
            }
        }
    }
    out
}

/// Translates a wildcard pattern into an anchored regular expression over
/// folded text. `*` matches any run of characters; everything else is
/// literal. The pattern is anchored at both ends, so `Sm*th` matches
/// `Smith` but not `Smithy`.
#[must_use]
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in fold_text(pattern).chars() {
        if ch == '*' {
            re.push_str(".*");
        } else {
            if regex_syntax_char(ch) {
                re.push('\\');
            }
            re.push(ch);
        }
    }
    re.push('$');
    re
}

fn regex_syntax_char(ch: char) -> bool {
    matches!(
        ch,
        '.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

/// Splits text into the keywords the `%%` comparator and keyword indexes
/// operate on: maximal alphanumeric runs, folded.
#[must_use]
pub fn keywords(text: &str) -> Vec<String> {
    fold_text(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion() {
        assert_eq!(
            Value::Long(5).compare(&Value::Number(5.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Number(2.5).compare(&Value::Long(3)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn text_collation_is_insensitive() {
        let a = Value::Text("Émile".into());
        let b = Value::Text("emile".into());
        assert_eq!(a.compare(&b), Some(Ordering::Equal));
        assert!(!a.strict_eq(&b));
    }

    #[test]
    fn null_never_compares() {
        assert_eq!(Value::Null.compare(&Value::Long(1)), None);
        assert_eq!(Value::Long(1).compare(&Value::Null), None);
    }

    #[test]
    fn sort_cmp_is_total() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Null,
            Value::Long(2),
            Value::Bool(true),
            Value::Text("a".into()),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1], Value::Bool(true));
        assert_eq!(values[2], Value::Long(2));
        assert_eq!(values[3], Value::Text("a".into()));
    }

    #[test]
    fn wildcard_anchors_both_ends() {
        let re = regex::Regex::new(&wildcard_to_regex("Sm*th")).unwrap();
        assert!(re.is_match(&fold_text("Smith")));
        assert!(re.is_match(&fold_text("Smooth...th")));
        assert!(!re.is_match(&fold_text("Smithy")));
    }

    #[test]
    fn walk_simple_path() {
        let mut dims = IndexMap::new();
        dims.insert("bWidth".to_owned(), Value::Long(20));
        let mut obj = IndexMap::new();
        obj.insert("dims".to_owned(), Value::Object(dims));
        let value = Value::Object(obj);

        let found = value.walk_path("dims.bWidth");
        assert_eq!(found, vec![&Value::Long(20)]);
        assert!(value.walk_path("dims.missing").is_empty());
    }

    #[test]
    fn walk_array_spread() {
        let mut kw = IndexMap::new();
        kw.insert(
            "pages".to_owned(),
            Value::Array(vec![Value::Long(1), Value::Long(4)]),
        );
        let mut obj = IndexMap::new();
        obj.insert("keywords".to_owned(), Value::Object(kw));
        let value = Value::Object(obj);

        let found = value.walk_path("keywords.pages[]");
        assert_eq!(found.len(), 2);
        assert_eq!(found[1], &Value::Long(4));
    }

    #[test]
    fn keywords_split_and_fold() {
        assert_eq!(keywords("Hello, Wide-World"), ["hello", "wide", "world"]);
    }

    #[test]
    fn date_literal_parsing() {
        assert!(Value::parse_date("2011-11-12T23:00:00Z").is_some());
        assert!(Value::parse_date("2011-11-12").is_some());
        assert!(Value::parse_date("not a date").is_none());
    }
}
