//! Lexer and recursive-descent parser for the textual predicate grammar.
//!
//! Grammar (locked precedence, left-associative):
//!
//! ```text
//! or     := except ( ('|' | 'or') except )*
//! except := and ( '^' and )*
//! and    := unary ( ('&' | 'and') unary )*
//! unary  := ('!' | 'not')* primary
//! primary:= '(' or ')' | '$(' ... ')' | clause
//! clause := attrPath [not] comparator operand
//! ```
//!
//! Placeholders `:1`, `:2`, ... bind positionally against the argument
//! slice at parse time. Bare words on the operand side are text literals
//! (`name == DOE`), ISO date tokens become date values, and bracketed
//! lists become arrays for `in`.

use crate::error::QueryError;
use savanna_model::Value;

/// Comparators of the predicate grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparator {
    /// `==` / `=`: like-equality, `*` glob, engine collation.
    Like,
    /// `===` (and `is`): strict equality.
    StrictEq,
    /// `!=`: negated like.
    NotLike,
    /// `!==` (and `is not`): strict inequality.
    StrictNe,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `in`: membership in an array operand.
    In,
    /// `begin`: text prefix.
    Begin,
    /// `%%`: keyword containment.
    Keyword,
    /// `=%`: regular expression match.
    Matches,
    /// `!=%`: regular expression non-match.
    NotMatches,
}

impl Comparator {
    /// The symbol handed to `on_query` rewrite hooks and used in rendered
    /// predicates.
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Like => "==",
            Self::StrictEq => "===",
            Self::NotLike => "!=",
            Self::StrictNe => "!==",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::In => "in",
            Self::Begin => "begin",
            Self::Keyword => "%%",
            Self::Matches => "=%",
            Self::NotMatches => "!=%",
        }
    }
}

/// One comparison clause.
#[derive(Debug, Clone)]
pub(crate) struct Clause {
    /// Attribute path, possibly dotted and with `[]` array hops.
    pub path: String,
    /// The comparator.
    pub comparator: Comparator,
    /// The resolved operand.
    pub value: Value,
}

/// A parsed predicate tree.
#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    /// A comparison clause.
    Clause(Clause),
    /// Logical negation.
    Not(Box<Predicate>),
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// Left minus right.
    Except(Box<Predicate>, Box<Predicate>),
    /// An opaque script clause (`$...`), only legal with `allow_javascript`.
    Js(String),
}

impl Predicate {
    /// True when any script clause appears in the tree.
    pub(crate) fn contains_js(&self) -> bool {
        match self {
            Self::Js(_) => true,
            Self::Clause(_) => false,
            Self::Not(p) => p.contains_js(),
            Self::Except(a, b) => a.contains_js() || b.contains_js(),
            Self::And(list) | Self::Or(list) => list.iter().any(Predicate::contains_js),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Amp,
    Pipe,
    Caret,
    Bang,
    Cmp(Comparator),
    And,
    Or,
    Not,
    Is,
    Word(String),
    Str(String),
    Num(f64),
    Date(chrono::NaiveDateTime),
    Placeholder(usize),
    True,
    False,
    Null,
    LBracket,
    RBracket,
    Comma,
    Js(String),
}

struct Lexer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, QueryError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                    continue;
                }
                b'(' => {
                    self.pos += 1;
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((start, Token::RParen));
                }
                b'[' => {
                    self.pos += 1;
                    tokens.push((start, Token::LBracket));
                }
                b']' => {
                    self.pos += 1;
                    tokens.push((start, Token::RBracket));
                }
                b',' => {
                    self.pos += 1;
                    tokens.push((start, Token::Comma));
                }
                b'&' => {
                    self.pos += 1;
                    tokens.push((start, Token::Amp));
                }
                b'|' => {
                    self.pos += 1;
                    tokens.push((start, Token::Pipe));
                }
                b'^' => {
                    self.pos += 1;
                    tokens.push((start, Token::Caret));
                }
                b'$' => {
                    self.pos += 1;
                    tokens.push((start, Token::Js(self.js_clause()?)));
                }
                b'\'' | b'"' => tokens.push((start, Token::Str(self.string(c)?))),
                b':' => tokens.push((start, self.placeholder()?)),
                b'!' => tokens.push((start, self.bang())),
                b'=' => tokens.push((start, self.equals())),
                b'>' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        tokens.push((start, Token::Cmp(Comparator::Ge)));
                    } else {
                        tokens.push((start, Token::Cmp(Comparator::Gt)));
                    }
                }
                b'<' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        tokens.push((start, Token::Cmp(Comparator::Le)));
                    } else {
                        tokens.push((start, Token::Cmp(Comparator::Lt)));
                    }
                }
                b'%' => {
                    self.pos += 1;
                    if self.peek() == Some(b'%') {
                        self.pos += 1;
                        tokens.push((start, Token::Cmp(Comparator::Keyword)));
                    } else {
                        return Err(self.error("expected %%"));
                    }
                }
                b'0'..=b'9' => tokens.push((start, self.number_or_date()?)),
                b'-' => tokens.push((start, self.number_or_date()?)),
                _ => tokens.push((start, self.word()?)),
            }
        }
        Ok(tokens)
    }

    fn js_clause(&mut self) -> Result<String, QueryError> {
        if self.peek() != Some(b'(') {
            return Err(self.error("expected ( after $"));
        }
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            match c {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = self.text[start..self.pos].to_owned();
                        self.pos += 1;
                        return Ok(body);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error("unterminated $ clause"))
    }

    fn string(&mut self, quote: u8) -> Result<String, QueryError> {
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c == b'\\' {
                if let Some(escaped) = self.peek() {
                    self.pos += 1;
                    out.push(escaped as char);
                }
            } else {
                // multi-byte chars arrive byte by byte; recover the str slice
                let ch_start = self.pos - 1;
                let ch = self.text[ch_start..].chars().next().unwrap_or('?');
                self.pos = ch_start + ch.len_utf8();
                out.push(ch);
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn placeholder(&mut self) -> Result<Token, QueryError> {
        self.pos += 1;
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected placeholder index after :"));
        }
        let index: usize = self.text[start..self.pos]
            .parse()
            .map_err(|_| self.error("invalid placeholder index"))?;
        if index == 0 {
            return Err(self.error("placeholders are 1-based"));
        }
        Ok(Token::Placeholder(index))
    }

    fn bang(&mut self) -> Token {
        self.pos += 1;
        match (self.peek(), self.bytes.get(self.pos + 1).copied()) {
            (Some(b'='), Some(b'=')) => {
                self.pos += 2;
                Token::Cmp(Comparator::StrictNe)
            }
            (Some(b'='), Some(b'%')) => {
                self.pos += 2;
                Token::Cmp(Comparator::NotMatches)
            }
            (Some(b'='), _) => {
                self.pos += 1;
                Token::Cmp(Comparator::NotLike)
            }
            _ => Token::Bang,
        }
    }

    fn equals(&mut self) -> Token {
        self.pos += 1;
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Token::Cmp(Comparator::StrictEq)
                } else {
                    Token::Cmp(Comparator::Like)
                }
            }
            Some(b'%') => {
                self.pos += 1;
                Token::Cmp(Comparator::Matches)
            }
            // single '=' is accepted as like-equality
            _ => Token::Cmp(Comparator::Like),
        }
    }

    fn number_or_date(&mut self) -> Result<Token, QueryError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'.' | b'-' | b':' | b'T' | b'Z')
        ) {
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let digits_only = text
            .trim_start_matches('-')
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.');
        if digits_only {
            let n: f64 = text
                .parse()
                .map_err(|_| self.error(format!("invalid number {text}")))?;
            Ok(Token::Num(n))
        } else if let Some(date) = Value::parse_date(text) {
            Ok(Token::Date(date))
        } else {
            Err(self.error(format!("invalid literal {text}")))
        }
    }

    fn word(&mut self) -> Result<Token, QueryError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let ch = self.text[self.pos..].chars().next().unwrap_or('\0');
            if ch.is_alphanumeric() || c == b'_' || c == b'.' {
                self.pos += ch.len_utf8();
            } else if c == b'[' && self.bytes.get(self.pos + 1) == Some(&b']') {
                self.pos += 2;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("unexpected character"));
        }
        let word = &self.text[start..self.pos];
        Ok(match word.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "is" => Token::Is,
            "in" => Token::Cmp(Comparator::In),
            "begin" => Token::Cmp(Comparator::Begin),
            "like" => Token::Cmp(Comparator::Like),
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Word(word.to_owned()),
        })
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    params: &'a [Value],
}

impl<'a> Parser<'a> {
    fn error_at(&self, message: impl Into<String>) -> QueryError {
        let offset = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |(o, _)| *o);
        QueryError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Predicate, QueryError> {
        let mut parts = vec![self.parse_except()?];
        while self.eat(&Token::Pipe) || self.eat(&Token::Or) {
            parts.push(self.parse_except()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap_or(Predicate::And(Vec::new()))
        } else {
            Predicate::Or(parts)
        })
    }

    fn parse_except(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Caret) {
            let right = self.parse_and()?;
            left = Predicate::Except(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, QueryError> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat(&Token::Amp) || self.eat(&Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap_or(Predicate::And(Vec::new()))
        } else {
            Predicate::And(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate, QueryError> {
        if self.eat(&Token::Bang) || self.eat(&Token::Not) {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, QueryError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error_at("expected )"));
                }
                Ok(inner)
            }
            Some(Token::Js(_)) => {
                if let Some(Token::Js(body)) = self.advance() {
                    Ok(Predicate::Js(body))
                } else {
                    Err(self.error_at("expected script clause"))
                }
            }
            Some(Token::Word(_)) => self.parse_clause(),
            _ => Err(self.error_at("expected a clause")),
        }
    }

    fn parse_clause(&mut self) -> Result<Predicate, QueryError> {
        let Some(Token::Word(path)) = self.advance() else {
            return Err(self.error_at("expected an attribute path"));
        };
        // "attr not like x" / "attr not in x"
        let negated_kw = self.eat(&Token::Not);
        let comparator = match self.advance() {
            Some(Token::Cmp(c)) => c,
            Some(Token::Is) => {
                if self.eat(&Token::Not) {
                    Comparator::StrictNe
                } else {
                    Comparator::StrictEq
                }
            }
            _ => return Err(self.error_at("expected a comparator")),
        };
        let value = self.parse_operand()?;
        let clause = Predicate::Clause(Clause {
            path,
            comparator,
            value,
        });
        Ok(if negated_kw {
            Predicate::Not(Box::new(clause))
        } else {
            clause
        })
    }

    fn parse_operand(&mut self) -> Result<Value, QueryError> {
        match self.advance() {
            Some(Token::Placeholder(index)) => self
                .params
                .get(index - 1)
                .cloned()
                .ok_or(QueryError::UnboundPlaceholder { index }),
            Some(Token::Str(s)) => Ok(Value::Text(s)),
            Some(Token::Num(n)) => Ok(if n.fract() == 0.0 && n.abs() < 9.2e18 {
                Value::Long(n as i64)
            } else {
                Value::Number(n)
            }),
            Some(Token::Date(d)) => Ok(Value::Date(d)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Word(w)) => Ok(Value::Text(w)),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.parse_operand()?);
                    if self.eat(&Token::RBracket) {
                        return Ok(Value::Array(items));
                    }
                    if !self.eat(&Token::Comma) {
                        return Err(self.error_at("expected , or ] in list"));
                    }
                }
            }
            _ => Err(self.error_at("expected an operand")),
        }
    }
}

/// Parses a predicate, binding placeholders from `params`.
pub(crate) fn parse(text: &str, params: &[Value]) -> Result<Predicate, QueryError> {
    let tokens = Lexer::new(text).tokenize()?;
    if tokens.is_empty() {
        return Err(QueryError::Parse {
            offset: 0,
            message: "empty predicate".to_owned(),
        });
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
    };
    let predicate = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error_at("unexpected trailing input"));
    }
    Ok(predicate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(pred: &Predicate) -> &Clause {
        match pred {
            Predicate::Clause(c) => c,
            other => panic!("expected clause, got {other:?}"),
        }
    }

    #[test]
    fn placeholder_binding() {
        let pred = parse("salary > :1", &[Value::Long(5000)]).unwrap();
        let c = clause(&pred);
        assert_eq!(c.path, "salary");
        assert_eq!(c.comparator, Comparator::Gt);
        assert_eq!(c.value, Value::Long(5000));
    }

    #[test]
    fn unbound_placeholder_fails() {
        let err = parse("salary > :2", &[Value::Long(1)]).unwrap_err();
        assert!(matches!(err, QueryError::UnboundPlaceholder { index: 2 }));
    }

    #[test]
    fn precedence_not_and_except_or() {
        // a == 1 | b == 2 & !c == 3 ^ d == 4
        // parses as Or(a, Except(And(b, Not(c)), d))
        let pred = parse(
            "a == 1 | b == 2 & !c == 3 ^ d == 4",
            &[],
        )
        .unwrap();
        let Predicate::Or(parts) = &pred else {
            panic!("expected or at the top: {pred:?}");
        };
        assert_eq!(parts.len(), 2);
        let Predicate::Except(left, _) = &parts[1] else {
            panic!("expected except under or: {:?}", parts[1]);
        };
        let Predicate::And(inner) = left.as_ref() else {
            panic!("expected and under except: {left:?}");
        };
        assert!(matches!(inner[1], Predicate::Not(_)));
    }

    #[test]
    fn parentheses_override() {
        let pred = parse("(a == 1 | b == 2) & c == 3", &[]).unwrap();
        let Predicate::And(parts) = &pred else {
            panic!("expected and: {pred:?}");
        };
        assert!(matches!(parts[0], Predicate::Or(_)));
    }

    #[test]
    fn word_operators_and_bare_literals() {
        let pred = parse("lastname == dubois and firstname == jules", &[]).unwrap();
        let Predicate::And(parts) = &pred else {
            panic!("expected and: {pred:?}");
        };
        assert_eq!(clause(&parts[0]).value, Value::Text("dubois".into()));
    }

    #[test]
    fn single_equals_is_like() {
        let pred = parse("name = :1", &[Value::Text("Jones".into())]).unwrap();
        assert_eq!(clause(&pred).comparator, Comparator::Like);
    }

    #[test]
    fn comparator_family_lexes() {
        for (text, cmp) in [
            ("a == 1", Comparator::Like),
            ("a === 1", Comparator::StrictEq),
            ("a != 1", Comparator::NotLike),
            ("a !== 1", Comparator::StrictNe),
            ("a >= 1", Comparator::Ge),
            ("a <= 1", Comparator::Le),
            ("a begin 'x'", Comparator::Begin),
            ("a %% 'x'", Comparator::Keyword),
            ("a =% 'x'", Comparator::Matches),
            ("a !=% 'x'", Comparator::NotMatches),
        ] {
            assert_eq!(clause(&parse(text, &[]).unwrap()).comparator, cmp, "{text}");
        }
    }

    #[test]
    fn not_like_keyword_form() {
        let pred = parse("name not like :1", &[Value::Text("T*".into())]).unwrap();
        let Predicate::Not(inner) = &pred else {
            panic!("expected not: {pred:?}");
        };
        assert_eq!(clause(inner).comparator, Comparator::Like);
    }

    #[test]
    fn is_null_forms() {
        let pred = parse("hiringDate is null", &[]).unwrap();
        let c = clause(&pred);
        assert_eq!(c.comparator, Comparator::StrictEq);
        assert_eq!(c.value, Value::Null);

        let pred = parse("hiringDate is not null", &[]).unwrap();
        assert_eq!(clause(&pred).comparator, Comparator::StrictNe);
    }

    #[test]
    fn date_and_list_literals() {
        let pred = parse("dateHired <= 2011-11-12T23:00:00Z", &[]).unwrap();
        assert!(matches!(clause(&pred).value, Value::Date(_)));

        let pred = parse("country in ['US','SP','GM']", &[]).unwrap();
        match &clause(&pred).value {
            Value::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("expected array: {other:?}"),
        }
    }

    #[test]
    fn object_path_clause() {
        let pred = parse("dimensions.bLength > :1", &[Value::Long(200)]).unwrap();
        assert_eq!(clause(&pred).path, "dimensions.bLength");

        let pred = parse("keywords.pages[] == 4", &[]).unwrap();
        assert_eq!(clause(&pred).path, "keywords.pages[]");
    }

    #[test]
    fn js_clause_lexes_balanced() {
        let pred = parse("$(this.name.length == this.firstname.length)", &[]).unwrap();
        let Predicate::Js(body) = &pred else {
            panic!("expected js: {pred:?}");
        };
        assert_eq!(body, "this.name.length == this.firstname.length");
        assert!(pred.contains_js());
    }

    #[test]
    fn trailing_garbage_fails() {
        assert!(parse("a == 1 b", &[]).is_err());
        assert!(parse("", &[]).is_err());
        assert!(parse("a == ", &[]).is_err());
    }
}
