//! A small query evaluator over an in-memory store.
//!
//! Two front ends compile to the same [`Plan`]:
//!
//! - N1QL: `SELECT * | prop, ... FROM source [WHERE cond [AND cond ...]]
//!   [ORDER BY prop [ASC|DESC], ...] [LIMIT n]`, where a condition compares
//!   a property path, a `$parameter` or a literal.
//! - JSON: `{"WHAT": [...], "WHERE": [...], "ORDER_BY": [...], "LIMIT": n}`
//!   with property paths written `[".a.b"]` and parameters `["$p"]`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::store::Connection;
use crate::engine::QueryLanguage;
use crate::error::{codes, NativeError};
use crate::value::{Dict, NativeValue};

pub(super) type QueryListener = Arc<dyn Fn(&[Dict]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Property(Vec<String>),
    Parameter(String),
    Literal(NativeValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" | "==" => CmpOp::Eq,
            "!=" | "<>" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            _ => return None,
        })
    }

    fn holds(self, ord: Option<Ordering>) -> bool {
        match (self, ord) {
            (CmpOp::Ne, None) => true,
            (_, None) => false,
            (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
            (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
            (CmpOp::Lt, Some(o)) => o == Ordering::Less,
            (CmpOp::Le, Some(o)) => o != Ordering::Greater,
            (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
            (CmpOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    left: Operand,
    op: CmpOp,
    right: Operand,
}

#[derive(Debug, Clone, PartialEq)]
struct OrderTerm {
    operand: Operand,
    descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Plan {
    source: String,
    /// Property paths to project; empty selects whole documents.
    columns: Vec<Vec<String>>,
    /// Conjunction of comparisons.
    filter: Vec<Condition>,
    order: Vec<OrderTerm>,
    limit: Option<Operand>,
}

const DEFAULT_SOURCE: &str = "_default";

fn invalid(message: impl Into<String>) -> NativeError {
    NativeError::cbl(codes::INVALID_QUERY, message)
}

impl Plan {
    pub fn compile(language: QueryLanguage, text: &str) -> Result<Self, NativeError> {
        match language {
            QueryLanguage::N1ql => n1ql::parse(text),
            QueryLanguage::Json => json::parse(text),
        }
    }

    /// Run against a list of `(id, properties)` documents.
    pub fn run(&self, docs: Vec<(String, Dict)>, params: &Dict) -> Result<Vec<Dict>, NativeError> {
        let mut matched: Vec<Dict> = docs
            .into_iter()
            .map(|(_, props)| props)
            .filter(|props| self.filter.iter().all(|c| c.holds(props, params)))
            .collect();

        matched.sort_by(|a, b| {
            self.order
                .iter()
                .map(|term| {
                    let ord = sort_order(
                        term.operand.eval(a, params).as_ref(),
                        term.operand.eval(b, params).as_ref(),
                    );
                    if term.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        if let Some(limit) = &self.limit {
            let n = limit
                .eval(&Dict::new(), params)
                .and_then(|v| v.as_i64())
                .filter(|n| *n >= 0)
                .ok_or_else(|| invalid("LIMIT must be a non-negative integer"))?;
            matched.truncate(n as usize);
        }

        Ok(matched.into_iter().map(|props| self.project(props)).collect())
    }

    fn project(&self, props: Dict) -> Dict {
        if self.columns.is_empty() {
            return Dict::from([(self.source.clone(), NativeValue::Dict(props))]);
        }
        self.columns
            .iter()
            .filter_map(|path| {
                let name = path.last()?.clone();
                lookup(&props, path).map(|v| (name, v.clone()))
            })
            .collect()
    }

    pub fn explain(&self) -> String {
        let mut out = format!("SCAN {}", self.source);
        if !self.filter.is_empty() {
            let conditions: Vec<String> = self.filter.iter().map(Condition::to_string).collect();
            out.push_str(&format!("\nFILTER {}", conditions.join(" AND ")));
        }
        if !self.order.is_empty() {
            let terms: Vec<String> = self
                .order
                .iter()
                .map(|t| format!("{}{}", t.operand, if t.descending { " DESC" } else { "" }))
                .collect();
            out.push_str(&format!("\nSORT {}", terms.join(", ")));
        }
        if let Some(limit) = &self.limit {
            out.push_str(&format!("\nLIMIT {}", limit));
        }
        out
    }
}

fn lookup<'a>(props: &'a Dict, path: &[String]) -> Option<&'a NativeValue> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(props.get(first)?, |current, key| current.as_dict()?.get(key))
}

impl Operand {
    fn eval(&self, props: &Dict, params: &Dict) -> Option<NativeValue> {
        match self {
            Operand::Property(path) => lookup(props, path).cloned(),
            Operand::Parameter(name) => Some(params.get(name).cloned().unwrap_or(NativeValue::Null)),
            Operand::Literal(v) => Some(v.clone()),
        }
    }
}

impl Condition {
    fn holds(&self, props: &Dict, params: &Dict) -> bool {
        match (self.left.eval(props, params), self.right.eval(props, params)) {
            (Some(l), Some(r)) => self.op.holds(compare(&l, &r)),
            _ => false,
        }
    }
}

/// Ordering of two values of the same kind; `None` when they do not compare.
fn compare(left: &NativeValue, right: &NativeValue) -> Option<Ordering> {
    match (left, right) {
        (NativeValue::String(a), NativeValue::String(b)) => Some(a.cmp(b)),
        (NativeValue::Bool(a), NativeValue::Bool(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ if left == right => Some(Ordering::Equal),
            _ => None,
        },
    }
}

/// Missing values sort first, then values of unrelated kinds stay in place.
fn sort_order(left: Option<&NativeValue>, right: Option<&NativeValue>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Property(path) => write!(f, ".{}", path.join(".")),
            Operand::Parameter(name) => write!(f, "${}", name),
            Operand::Literal(v) => write!(f, "{}", v.to_json()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{} {} {}", self.left, op, self.right)
    }
}

mod n1ql {
    use super::*;

    /// Split into words, quoted strings and operator/punctuation tokens.
    /// Quoted strings keep their quotes so they stay distinct from words.
    fn tokenize(text: &str) -> Result<Vec<String>, NativeError> {
        let mut tokens = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                c if c.is_whitespace() => {}
                '\'' | '"' => {
                    let mut literal = String::from('\'');
                    loop {
                        match chars.next() {
                            Some(q) if q == c => break,
                            Some(ch) => literal.push(ch),
                            None => return Err(invalid("N1QL syntax error: unterminated string")),
                        }
                    }
                    tokens.push(literal);
                }
                '*' | ',' => tokens.push(c.to_string()),
                '=' | '!' | '<' | '>' => {
                    let mut op = c.to_string();
                    if let Some(next) = chars.next_if(|n| *n == '=' || (c == '<' && *n == '>')) {
                        op.push(next);
                    }
                    tokens.push(op);
                }
                c if c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '-') => {
                    let mut word = c.to_string();
                    while let Some(next) =
                        chars.next_if(|n| n.is_alphanumeric() || matches!(*n, '_' | '.'))
                    {
                        word.push(next);
                    }
                    tokens.push(word);
                }
                other => return Err(invalid(format!("N1QL syntax error near '{}'", other))),
            }
        }
        Ok(tokens)
    }

    const KEYWORDS: &[&str] = &["SELECT", "FROM", "WHERE", "AND", "ORDER", "BY", "ASC", "DESC", "LIMIT"];

    struct Parser {
        tokens: Vec<String>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<&str> {
            self.tokens.get(self.pos).map(String::as_str)
        }

        fn error_here(&self) -> NativeError {
            match self.peek() {
                Some(token) => invalid(format!("N1QL syntax error near '{}'", token)),
                None => invalid("N1QL syntax error: unexpected end of query"),
            }
        }

        fn eat(&mut self, expected: &str) -> bool {
            if self.peek().is_some_and(|t| t.eq_ignore_ascii_case(expected)) {
                self.pos += 1;
                true
            } else {
                false
            }
        }

        fn expect(&mut self, expected: &str) -> Result<(), NativeError> {
            if self.eat(expected) {
                Ok(())
            } else {
                Err(self.error_here())
            }
        }

        fn identifier(&mut self) -> Result<String, NativeError> {
            match self.peek() {
                Some(w)
                    if w.starts_with(|c: char| c.is_alphabetic() || c == '_')
                        && !KEYWORDS.iter().any(|k| w.eq_ignore_ascii_case(k)) =>
                {
                    let w = w.to_string();
                    self.pos += 1;
                    Ok(w)
                }
                _ => Err(self.error_here()),
            }
        }

        fn path(&mut self) -> Result<Vec<String>, NativeError> {
            Ok(self.identifier()?.split('.').map(str::to_string).collect())
        }

        fn operand(&mut self) -> Result<Operand, NativeError> {
            let token = self.peek().ok_or_else(|| self.error_here())?;
            let literal = if let Some(s) = token.strip_prefix('\'') {
                Some(NativeValue::String(s.to_string()))
            } else if let Some(name) = token.strip_prefix('$').filter(|n| !n.is_empty()) {
                let name = name.to_string();
                self.pos += 1;
                return Ok(Operand::Parameter(name));
            } else if token.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                let number = match token.parse::<i64>() {
                    Ok(n) => NativeValue::Int(n),
                    Err(_) => NativeValue::Double(token.parse::<f64>().map_err(|_| {
                        invalid(format!("N1QL syntax error: bad number '{}'", token))
                    })?),
                };
                Some(number)
            } else {
                None
            };
            match literal {
                Some(value) => {
                    self.pos += 1;
                    Ok(Operand::Literal(value))
                }
                None => Ok(Operand::Property(self.path()?)),
            }
        }

        fn condition(&mut self) -> Result<Condition, NativeError> {
            let left = self.operand()?;
            let op = self.peek().and_then(CmpOp::parse).ok_or_else(|| self.error_here())?;
            self.pos += 1;
            let right = self.operand()?;
            Ok(Condition { left, op, right })
        }

        fn query(&mut self) -> Result<Plan, NativeError> {
            self.expect("SELECT")?;
            let mut columns = Vec::new();
            if !self.eat("*") {
                loop {
                    columns.push(self.path()?);
                    if !self.eat(",") {
                        break;
                    }
                }
            }

            self.expect("FROM")?;
            let source = self.identifier()?;

            let mut filter = Vec::new();
            if self.eat("WHERE") {
                loop {
                    filter.push(self.condition()?);
                    if !self.eat("AND") {
                        break;
                    }
                }
            }

            let mut order = Vec::new();
            if self.eat("ORDER") {
                self.expect("BY")?;
                loop {
                    let operand = self.operand()?;
                    let descending = self.eat("DESC");
                    if !descending {
                        self.eat("ASC");
                    }
                    order.push(OrderTerm { operand, descending });
                    if !self.eat(",") {
                        break;
                    }
                }
            }

            let limit = if self.eat("LIMIT") {
                Some(self.operand()?)
            } else {
                None
            };

            if self.peek().is_some() {
                return Err(self.error_here());
            }
            Ok(Plan {
                source,
                columns,
                filter,
                order,
                limit,
            })
        }
    }

    pub(super) fn parse(text: &str) -> Result<Plan, NativeError> {
        let tokens = tokenize(text)?;
        Parser { tokens, pos: 0 }.query()
    }
}

mod json {
    use serde_json::Value;

    use super::*;

    fn path(value: &Value) -> Option<Vec<String>> {
        match value.as_array()?.as_slice() {
            [Value::String(head)] if head.len() > 1 => {
                Some(head.strip_prefix('.')?.split('.').map(str::to_string).collect())
            }
            _ => None,
        }
    }

    fn operand(value: &Value) -> Result<Operand, NativeError> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [Value::String(head)] if head.starts_with('$') && head.len() > 1 => {
                    Ok(Operand::Parameter(head[1..].to_string()))
                }
                _ => path(value)
                    .map(Operand::Property)
                    .ok_or_else(|| invalid(format!("JSON query: unsupported operand {}", value))),
            },
            Value::Object(_) => Err(invalid("JSON query: objects are not valid operands")),
            scalar => Ok(Operand::Literal(NativeValue::from_json(scalar.clone()))),
        }
    }

    /// A comparison, or an `AND` of comparisons.
    fn conditions(value: &Value, out: &mut Vec<Condition>) -> Result<(), NativeError> {
        let bad = || invalid(format!("JSON query: unsupported expression {}", value));
        let (op, args) = match value.as_array().map(Vec::as_slice) {
            Some([Value::String(op), args @ ..]) => (op.as_str(), args),
            _ => return Err(bad()),
        };
        if op.eq_ignore_ascii_case("AND") && !args.is_empty() {
            return args.iter().try_for_each(|arg| conditions(arg, out));
        }
        match (CmpOp::parse(op), args) {
            (Some(op), [l, r]) => {
                out.push(Condition {
                    left: operand(l)?,
                    op,
                    right: operand(r)?,
                });
                Ok(())
            }
            _ => Err(bad()),
        }
    }

    fn order_term(value: &Value) -> Result<OrderTerm, NativeError> {
        if let Some([Value::String(op), inner]) = value.as_array().map(Vec::as_slice) {
            if op.eq_ignore_ascii_case("DESC") || op.eq_ignore_ascii_case("ASC") {
                return Ok(OrderTerm {
                    operand: operand(inner)?,
                    descending: op.eq_ignore_ascii_case("DESC"),
                });
            }
        }
        Ok(OrderTerm {
            operand: operand(value)?,
            descending: false,
        })
    }

    pub(super) fn parse(text: &str) -> Result<Plan, NativeError> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| invalid(format!("JSON query: {}", e)))?;
        let root = root
            .as_object()
            .ok_or_else(|| invalid("JSON query must be an object"))?;

        let source = root
            .get("FROM")
            .and_then(Value::as_array)
            .and_then(|from| from.first())
            .and_then(|first| first.get("AS"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SOURCE)
            .to_string();

        let columns = match root.get("WHAT") {
            None => Vec::new(),
            Some(Value::Array(what)) => what
                .iter()
                .map(|v| path(v).ok_or_else(|| invalid(format!("JSON query: bad WHAT entry {}", v))))
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(invalid(format!("JSON query: bad WHAT {}", other))),
        };

        let mut filter = Vec::new();
        if let Some(cond) = root.get("WHERE") {
            conditions(cond, &mut filter)?;
        }

        let order = match root.get("ORDER_BY") {
            None => Vec::new(),
            Some(Value::Array(terms)) => terms.iter().map(order_term).collect::<Result<_, _>>()?,
            Some(other) => return Err(invalid(format!("JSON query: bad ORDER_BY {}", other))),
        };

        let limit = root.get("LIMIT").map(operand).transpose()?;

        Ok(Plan {
            source,
            columns,
            filter,
            order,
            limit,
        })
    }
}

/// A compiled query bound to one connection.
pub(super) struct QueryState {
    connection: Arc<Connection>,
    plan: Plan,
    parameters: Mutex<Dict>,
    listeners: Mutex<Vec<(u64, QueryListener)>>,
    last: Mutex<Option<Vec<Dict>>>,
}

impl QueryState {
    pub fn compile(
        connection: Arc<Connection>,
        language: QueryLanguage,
        text: &str,
    ) -> Result<Self, NativeError> {
        connection.check_open()?;
        let plan = Plan::compile(language, text)?;
        Ok(Self {
            connection,
            plan,
            parameters: Mutex::new(Dict::new()),
            listeners: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        })
    }

    pub fn execute(&self) -> Result<Vec<Dict>, NativeError> {
        let store = self.connection.check_open()?;
        let params = self.parameters.lock().clone();
        self.plan.run(store.live_documents(), &params)
    }

    pub fn explain(&self) -> String {
        self.plan.explain()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    pub fn parameters(&self) -> Dict {
        self.parameters.lock().clone()
    }

    pub fn set_parameters(&self, parameters: Dict) {
        *self.parameters.lock() = parameters;
    }

    pub fn add_listener(self: &Arc<Self>, token: u64, callback: QueryListener) {
        self.listeners.lock().push((token, callback));
        self.connection.store.watch_query(self);
    }

    pub fn remove_listener(&self, token: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    /// Deliver the current results to one newly added listener.
    pub fn send_initial(&self, token: u64) {
        let results = match self.execute() {
            Ok(results) => results,
            Err(e) => {
                tracing::debug!(error = %e, "query listener skipped initial results");
                return;
            }
        };
        *self.last.lock() = Some(results.clone());
        let callback = self
            .listeners
            .lock()
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, cb)| cb.clone());
        if let Some(callback) = callback {
            callback(&results);
        }
    }

    /// Re-run the query and notify listeners if the results changed.
    pub fn refresh(&self) {
        let callbacks: Vec<QueryListener> =
            self.listeners.lock().iter().map(|(_, cb)| cb.clone()).collect();
        if callbacks.is_empty() {
            return;
        }
        let results = match self.execute() {
            Ok(results) => results,
            Err(_) => return,
        };
        {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&results) {
                return;
            }
            *last = Some(results.clone());
        }
        for callback in callbacks {
            callback(&results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, NativeValue)]) -> Dict {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn people() -> Vec<(String, Dict)> {
        vec![
            (
                "a".into(),
                doc(&[("name", NativeValue::String("ann".into())), ("age", NativeValue::Int(31))]),
            ),
            (
                "b".into(),
                doc(&[("name", NativeValue::String("bob".into())), ("age", NativeValue::Int(25))]),
            ),
            (
                "c".into(),
                doc(&[("name", NativeValue::String("cy".into())), ("age", NativeValue::Double(40.5))]),
            ),
        ]
    }

    fn names(rows: &[Dict]) -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.get("name").and_then(NativeValue::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn select_star_wraps_rows_in_the_source_name() {
        let plan = Plan::compile(QueryLanguage::N1ql, "SELECT * FROM people").unwrap();
        let rows = plan.run(people(), &Dict::new()).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].get("people").and_then(NativeValue::as_dict).is_some());
    }

    #[test]
    fn where_order_and_limit() {
        let plan = Plan::compile(
            QueryLanguage::N1ql,
            "SELECT name FROM db WHERE age > 20 AND name != 'cy' ORDER BY age DESC LIMIT 5",
        )
        .unwrap();
        let rows = plan.run(people(), &Dict::new()).unwrap();
        assert_eq!(names(&rows), vec!["ann", "bob"]);

        let first = Plan::compile(QueryLanguage::N1ql, "SELECT name FROM db ORDER BY name LIMIT 1").unwrap();
        assert_eq!(names(&first.run(people(), &Dict::new()).unwrap()), vec!["ann"]);
    }

    #[test]
    fn parameters_bind_at_execution() {
        let plan = Plan::compile(QueryLanguage::N1ql, "SELECT name FROM db WHERE age < $max").unwrap();
        let params = doc(&[("max", NativeValue::Int(30))]);
        assert_eq!(names(&plan.run(people(), &params).unwrap()), vec!["bob"]);
        // unbound parameters are null and match nothing
        assert!(plan.run(people(), &Dict::new()).unwrap().is_empty());
    }

    #[test]
    fn json_form_matches_n1ql() {
        let json = r#"{"WHAT": [[".name"]], "WHERE": ["AND", [">", [".age"], 26], ["!=", [".name"], "cy"]], "ORDER_BY": [["DESC", [".name"]]]}"#;
        let plan = Plan::compile(QueryLanguage::Json, json).unwrap();
        assert_eq!(names(&plan.run(people(), &Dict::new()).unwrap()), vec!["ann"]);
    }

    #[test]
    fn syntax_errors_are_invalid_query() {
        for text in [
            "SELECT",
            "SELECT * FROM",
            "SELECT * FROM db WHERE age >",
            "DROP db",
            "SELECT * FROM db WHERE name = 'open",
            "SELECT * FROM db LIMIT 1 extra",
        ] {
            let err = Plan::compile(QueryLanguage::N1ql, text).unwrap_err();
            assert_eq!(err.code, codes::INVALID_QUERY, "{}", text);
        }
        assert!(Plan::compile(QueryLanguage::Json, "[1]").is_err());
        assert!(Plan::compile(QueryLanguage::Json, r#"{"WHERE": ["OR", 1, 2]}"#).is_err());
    }

    #[test]
    fn explain_describes_the_plan() {
        let plan = Plan::compile(QueryLanguage::N1ql, "SELECT name FROM db WHERE age >= 30 LIMIT 1").unwrap();
        let text = plan.explain();
        assert!(text.starts_with("SCAN db"));
        assert!(text.contains("FILTER .age >= 30"));
        assert!(text.contains("LIMIT 1"));
    }
}
