//! Parser for the read-only Cypher subset the in-memory store executes,
//! built from `nom` combinators.
//!
//! ```text
//! MATCH (a:Label {k: 'v'})-[r:T|U]->(b)<-[]-(c)
//! WHERE a.x = 1 AND (toLower(b.id) CONTAINS 'x' OR NOT c.y IS NULL)
//! RETURN DISTINCT a.id AS name, type(r), count(*) ORDER BY name DESC SKIP 1 LIMIT 10
//! ```

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, tag_no_case, take_while};
use nom::character::complete::{char as pchar, digit0, digit1, multispace1, not_line_ending, satisfy};
use nom::combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Parse and evaluation failures, worded like the messages Neo4j returns
/// so the planner's caller sees the same kind of text from both backends.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CypherError {
    #[error("Invalid input '{0}'")]
    Syntax(String),
    #[error("Invalid input: unexpected end of query")]
    UnexpectedEnd,
    #[error("Unsupported clause '{0}'")]
    UnsupportedClause(String),
    #[error("Expected parameter(s): {0}")]
    MissingParameter(String),
    #[error("Variable `{0}` not defined")]
    UndefinedVariable(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub pattern: Pattern,
    pub filter: Option<Expr>,
    pub distinct: bool,
    pub items: Vec<ReturnItem>,
    pub order_by: Vec<OrderItem>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub start: NodePattern,
    pub hops: Vec<(RelPattern, NodePattern)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodePattern {
    pub var: Option<String>,
    pub labels: Vec<String>,
    pub properties: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Either,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelPattern {
    pub var: Option<String>,
    pub types: Vec<String>,
    pub properties: Vec<(String, Value)>,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnItem {
    pub expr: Expr,
    /// Alias, or the canonical text of the expression
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Collect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Variable(String),
    Property(String, String),
    Call { name: String, args: Vec<Expr> },
    /// `arg` is `None` for `count(*)`
    Aggregate {
        func: AggregateFn,
        distinct: bool,
        arg: Option<Box<Expr>>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
}

impl Expr {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
    }

    fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Literal(_) | Expr::Variable(_) | Expr::Property(..) => false,
            Expr::List(items) | Expr::Call { args: items, .. } => items.iter().any(Expr::contains_aggregate),
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.contains_aggregate(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                a.contains_aggregate() || b.contains_aggregate()
            }
        }
    }

    fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Variable(v) | Expr::Property(v, _) => out.push(v),
            Expr::Literal(_) => {}
            Expr::List(items) | Expr::Call { args: items, .. } => items.iter().for_each(|e| e.variables(out)),
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.variables(out);
                }
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.variables(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                a.variables(out);
                b.variables(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::String(s)) => write!(f, "'{s}'"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Expr::Variable(v) => f.write_str(v),
            Expr::Property(v, k) => write!(f, "{v}.{k}"),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                write_joined(f, args)?;
                f.write_str(")")
            }
            Expr::Aggregate { func, distinct, arg } => {
                let name = match func {
                    AggregateFn::Count => "count",
                    AggregateFn::Collect => "collect",
                };
                let distinct = if *distinct { "DISTINCT " } else { "" };
                match arg {
                    Some(arg) => write!(f, "{name}({distinct}{arg})"),
                    None => write!(f, "{name}(*)"),
                }
            }
            Expr::Not(e) => write!(f, "NOT {e}"),
            Expr::And(a, b) => write!(f, "{a} AND {b}"),
            Expr::Or(a, b) => write!(f, "{a} OR {b}"),
            Expr::Compare(a, op, b) => {
                let op = match op {
                    CompareOp::Eq => "=",
                    CompareOp::Neq => "<>",
                    CompareOp::Lt => "<",
                    CompareOp::Gt => ">",
                    CompareOp::Le => "<=",
                    CompareOp::Ge => ">=",
                    CompareOp::Contains => "CONTAINS",
                    CompareOp::StartsWith => "STARTS WITH",
                    CompareOp::EndsWith => "ENDS WITH",
                    CompareOp::In => "IN",
                };
                write!(f, "{a} {op} {b}")
            }
            Expr::IsNull { expr, negated: false } => write!(f, "{expr} IS NULL"),
            Expr::IsNull { expr, negated: true } => write!(f, "{expr} IS NOT NULL"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}


// =============================================================================
// Parsing
// =============================================================================

type Res<'a, T> = IResult<&'a str, T>;

/// Clauses outside the supported subset, reported by name.
const UNSUPPORTED_CLAUSES: &[&str] = &[
    "OPTIONAL", "WITH", "UNWIND", "CALL", "UNION", "CREATE", "MERGE", "DELETE", "DETACH", "SET",
    "REMOVE", "FOREACH", "LOAD", "DROP", "MATCH",
];

pub fn parse(input: &str) -> Result<Query, CypherError> {
    let (_, query) = all_consuming(query)(input).map_err(describe_failure)?;
    validate(&query)?;
    Ok(query)
}

/// Turn the input left over at the point of failure into a message.
fn describe_failure(err: nom::Err<nom::error::Error<&str>>) -> CypherError {
    let rest = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e.input.trim_start(),
        nom::Err::Incomplete(_) => "",
    };
    if rest.is_empty() {
        return CypherError::UnexpectedEnd;
    }

    let word: String = rest
        .trim_start_matches('$')
        .chars()
        .take_while(|&c| is_ident_continue(c))
        .collect();
    if rest.starts_with('$') {
        return CypherError::MissingParameter(word);
    }
    let upper = word.to_ascii_uppercase();
    if UNSUPPORTED_CLAUSES.contains(&upper.as_str()) {
        return CypherError::UnsupportedClause(upper);
    }
    CypherError::Syntax(rest.chars().take(24).collect())
}

fn query(input: &str) -> Res<'_, Query> {
    let (input, _) = keyword("MATCH")(input)?;
    let (input, pattern) = cut(pattern)(input)?;
    let (input, filter) = opt(preceded(keyword("WHERE"), cut(expr)))(input)?;

    let (input, _) = keyword("RETURN")(input)?;
    let (input, distinct) = map(opt(keyword("DISTINCT")), |d| d.is_some())(input)?;
    let (input, items) = cut(separated_list1(sym(','), return_item))(input)?;

    let (input, order_by) = opt(preceded(
        pair(keyword("ORDER"), cut(keyword("BY"))),
        cut(separated_list1(sym(','), order_item)),
    ))(input)?;
    let (input, skip) = opt(preceded(keyword("SKIP"), cut(ws(count))))(input)?;
    let (input, limit) = opt(preceded(keyword("LIMIT"), cut(ws(count))))(input)?;
    let (input, _) = opt(sym(';'))(input)?;

    Ok((
        input,
        Query {
            pattern,
            filter,
            distinct,
            items,
            order_by: order_by.unwrap_or_default(),
            skip,
            limit,
        },
    ))
}

fn pattern(input: &str) -> Res<'_, Pattern> {
    map(
        pair(node_pattern, many0(pair(rel_pattern, node_pattern))),
        |(start, hops)| Pattern { start, hops },
    )(input)
}

fn node_pattern(input: &str) -> Res<'_, NodePattern> {
    // (p:Patient {id: 'John'})
    map(
        delimited(
            sym('('),
            tuple((
                opt(ws(name)),
                many0(preceded(sym(':'), ws(name))),
                opt(property_map),
            )),
            sym(')'),
        ),
        |(var, labels, properties)| NodePattern {
            var,
            labels,
            properties: properties.unwrap_or_default(),
        },
    )(input)
}

fn rel_pattern(input: &str) -> Res<'_, RelPattern> {
    // -[r:T|U]->  <-[:T]-  --
    let (input, incoming) = map(opt(sym('<')), |o| o.is_some())(input)?;
    let (input, _) = sym('-')(input)?;
    let (input, detail) = opt(delimited(sym('['), rel_detail, sym(']')))(input)?;
    let (rest, _) = sym('-')(input)?;
    let (rest, outgoing) = map(opt(sym('>')), |o| o.is_some())(rest)?;

    let direction = match (incoming, outgoing) {
        (true, true) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }
        (true, false) => Direction::Incoming,
        (false, true) => Direction::Outgoing,
        (false, false) => Direction::Either,
    };

    let (var, types, properties) = detail.unwrap_or_default();
    Ok((
        rest,
        RelPattern {
            var,
            types,
            properties,
            direction,
        },
    ))
}

type RelDetail = (Option<String>, Vec<String>, Vec<(String, Value)>);

fn rel_detail(input: &str) -> Res<'_, RelDetail> {
    tuple((
        opt(ws(name)),
        map(
            opt(preceded(
                sym(':'),
                separated_list1(sym('|'), preceded(opt(sym(':')), ws(name))),
            )),
            Option::unwrap_or_default,
        ),
        map(opt(property_map), Option::unwrap_or_default),
    ))(input)
}

fn property_map(input: &str) -> Res<'_, Vec<(String, Value)>> {
    delimited(
        sym('{'),
        separated_list0(sym(','), separated_pair(ws(name), sym(':'), ws(literal))),
        sym('}'),
    )(input)
}

fn return_item(input: &str) -> Res<'_, ReturnItem> {
    map(
        pair(expr, opt(preceded(keyword("AS"), cut(ws(name))))),
        |(expr, alias)| {
            let column = alias.unwrap_or_else(|| expr.to_string());
            ReturnItem { expr, column }
        },
    )(input)
}

fn order_item(input: &str) -> Res<'_, OrderItem> {
    map(
        pair(
            expr,
            opt(alt((
                value(true, alt((keyword("DESCENDING"), keyword("DESC")))),
                value(false, alt((keyword("ASCENDING"), keyword("ASC")))),
            ))),
        ),
        |(expr, descending)| OrderItem {
            expr,
            descending: descending.unwrap_or(false),
        },
    )(input)
}

fn expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(keyword("OR"), cut(and_expr)))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |left, right| Expr::Or(Box::new(left), Box::new(right))),
    ))
}

fn and_expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(keyword("AND"), cut(not_expr)))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |left, right| Expr::And(Box::new(left), Box::new(right))),
    ))
}

fn not_expr(input: &str) -> Res<'_, Expr> {
    alt((
        map(preceded(keyword("NOT"), cut(not_expr)), |e| Expr::Not(Box::new(e))),
        comparison,
    ))(input)
}

enum Suffix {
    Compare(CompareOp, Expr),
    IsNull { negated: bool },
}

fn comparison(input: &str) -> Res<'_, Expr> {
    let (input, left) = primary(input)?;
    let (input, suffix) = opt(alt((
        map(pair(compare_op, cut(primary)), |(op, right)| Suffix::Compare(op, right)),
        map(
            preceded(keyword("IS"), cut(terminated(opt(keyword("NOT")), keyword("NULL")))),
            |negation| Suffix::IsNull { negated: negation.is_some() },
        ),
    )))(input)?;

    let expr = match suffix {
        None => left,
        Some(Suffix::Compare(op, right)) => Expr::Compare(Box::new(left), op, Box::new(right)),
        Some(Suffix::IsNull { negated }) => Expr::IsNull {
            expr: Box::new(left),
            negated,
        },
    };
    Ok((input, expr))
}

fn compare_op(input: &str) -> Res<'_, CompareOp> {
    alt((
        value(CompareOp::Neq, ws(alt((tag("<>"), tag("!="))))),
        value(CompareOp::Le, ws(tag("<="))),
        value(CompareOp::Ge, ws(tag(">="))),
        value(CompareOp::Eq, sym('=')),
        value(CompareOp::Lt, sym('<')),
        value(CompareOp::Gt, sym('>')),
        value(CompareOp::Contains, keyword("CONTAINS")),
        value(CompareOp::In, keyword("IN")),
        value(CompareOp::StartsWith, pair(keyword("STARTS"), keyword("WITH"))),
        value(CompareOp::EndsWith, pair(keyword("ENDS"), keyword("WITH"))),
    ))(input)
}

fn primary(input: &str) -> Res<'_, Expr> {
    ws(alt((
        map(string_lit, |s| Expr::Literal(Value::String(s))),
        map(number, Expr::Literal),
        map(
            delimited(sym('['), separated_list0(sym(','), expr), sym(']')),
            Expr::List,
        ),
        delimited(sym('('), expr, sym(')')),
        call,
        map(constant, Expr::Literal),
        property_or_variable,
    )))(input)
}

fn call(input: &str) -> Res<'_, Expr> {
    let (input, name) = terminated(identifier, sym('('))(input)?;

    let func = match name.to_ascii_lowercase().as_str() {
        "count" => AggregateFn::Count,
        "collect" => AggregateFn::Collect,
        _ => {
            return map(
                cut(terminated(separated_list0(sym(','), expr), sym(')'))),
                |args| Expr::Call {
                    name: name.clone(),
                    args,
                },
            )(input);
        }
    };

    let (rest, arg) = cut(terminated(
        alt((
            value(None, sym('*')),
            map(pair(opt(keyword("DISTINCT")), expr), |(d, e)| Some((d.is_some(), e))),
        )),
        sym(')'),
    ))(input)?;

    let expr = match arg {
        Some((distinct, arg)) => Expr::Aggregate {
            func,
            distinct,
            arg: Some(Box::new(arg)),
        },
        None if func == AggregateFn::Count => Expr::Aggregate {
            func,
            distinct: false,
            arg: None,
        },
        None => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }
    };
    Ok((rest, expr))
}

fn property_or_variable(input: &str) -> Res<'_, Expr> {
    map(
        pair(name, opt(preceded(pchar('.'), name))),
        |(var, key)| match key {
            Some(key) => Expr::Property(var, key),
            None => Expr::Variable(var),
        },
    )(input)
}

fn literal(input: &str) -> Res<'_, Value> {
    alt((map(string_lit, Value::String), number, constant))(input)
}

fn constant(input: &str) -> Res<'_, Value> {
    alt((
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

fn number(input: &str) -> Res<'_, Value> {
    alt((
        map_res(
            recognize(tuple((opt(pchar('-')), digit0, pchar('.'), digit1))),
            |s: &str| s.parse::<f64>().map(Value::from),
        ),
        map_res(recognize(pair(opt(pchar('-')), digit1)), |s: &str| {
            s.parse::<i64>().map(Value::from)
        }),
    ))(input)
}

fn count(input: &str) -> Res<'_, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

fn string_lit(input: &str) -> Res<'_, String> {
    alt((
        delimited(
            pchar('\''),
            map(opt(escaped_transform(is_not("\\'"), '\\', escape)), Option::unwrap_or_default),
            pchar('\''),
        ),
        delimited(
            pchar('"'),
            map(opt(escaped_transform(is_not("\\\""), '\\', escape)), Option::unwrap_or_default),
            pchar('"'),
        ),
    ))(input)
}

fn escape(input: &str) -> Res<'_, &str> {
    alt((
        value("\\", tag("\\")),
        value("'", tag("'")),
        value("\"", tag("\"")),
        value("\n", tag("n")),
        value("\t", tag("t")),
    ))(input)
}

/// A plain or backtick-quoted identifier.
fn name(input: &str) -> Res<'_, String> {
    alt((
        map(delimited(pchar('`'), take_while(|c| c != '`'), pchar('`')), str::to_string),
        identifier,
    ))(input)
}

fn identifier(input: &str) -> Res<'_, String> {
    map(
        recognize(pair(satisfy(is_ident_start), take_while(is_ident_continue))),
        str::to_string,
    )(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whitespace and `//` line comments.
fn sp(input: &str) -> Res<'_, ()> {
    value((), many0(alt((multispace1, preceded(tag("//"), not_line_ending)))))(input)
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(sp, inner, sp)
}

fn sym<'a>(c: char) -> impl FnMut(&'a str) -> Res<'a, char> {
    ws(pchar(c))
}

/// Case-insensitive keyword that does not run on into an identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    ws(terminated(tag_no_case(word), not(satisfy(is_ident_continue))))
}

/// Semantic checks the grammar cannot express: variables must be bound by
/// the pattern, aggregates only at the top of a projection, one kind of
/// binding per variable.
fn validate(query: &Query) -> Result<(), CypherError> {
    let mut node_vars = BTreeSet::new();
    let mut rel_vars = BTreeSet::new();

    let nodes = std::iter::once(&query.pattern.start).chain(query.pattern.hops.iter().map(|(_, n)| n));
    for node in nodes {
        if let Some(var) = &node.var {
            node_vars.insert(var.as_str());
        }
    }
    for (rel, _) in &query.pattern.hops {
        if let Some(var) = &rel.var {
            if !rel_vars.insert(var.as_str()) {
                return Err(CypherError::Invalid(format!(
                    "Cannot use the same relationship variable '{var}' for multiple relationships"
                )));
            }
        }
    }
    if let Some(var) = node_vars.intersection(&rel_vars).next() {
        return Err(CypherError::TypeMismatch(format!(
            "variable '{var}' is both a node and a relationship"
        )));
    }

    let check_bound = |expr: &Expr| -> Result<(), CypherError> {
        let mut vars = Vec::new();
        expr.variables(&mut vars);
        match vars.into_iter().find(|v| !node_vars.contains(v) && !rel_vars.contains(v)) {
            Some(v) => Err(CypherError::UndefinedVariable(v.to_string())),
            None => Ok(()),
        }
    };

    if let Some(filter) = &query.filter {
        if filter.contains_aggregate() {
            return Err(CypherError::Invalid("Invalid use of aggregating function in WHERE".into()));
        }
        check_bound(filter)?;
    }

    for item in &query.items {
        match &item.expr {
            Expr::Aggregate { arg: Some(arg), .. } if arg.contains_aggregate() => {
                return Err(CypherError::Invalid(
                    "Can't use aggregate functions inside of aggregate functions".into(),
                ));
            }
            other if other.contains_aggregate() && !other.is_aggregate() => {
                return Err(CypherError::Invalid(format!(
                    "Unsupported projection '{other}': aggregates must be top-level"
                )));
            }
            _ => {}
        }
        check_bound(&item.expr)?;
    }

    let mut aliases = BTreeSet::new();
    for item in &query.items {
        if !aliases.insert(item.column.as_str()) {
            return Err(CypherError::Invalid(format!(
                "Multiple result columns with the same name '{}' are not supported",
                item.column
            )));
        }
    }
    for order in &query.order_by {
        let refers_to_column = match &order.expr {
            Expr::Variable(v) => aliases.contains(v.as_str()),
            other => aliases.contains(other.to_string().as_str()),
        };
        if !refers_to_column {
            if order.expr.contains_aggregate() {
                return Err(CypherError::Invalid(
                    "Unsupported ORDER BY: aggregate not present in RETURN".into(),
                ));
            }
            check_bound(&order.expr)?;
        }
    }

    Ok(())
}
