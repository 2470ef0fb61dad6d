#![allow(clippy::upper_case_acronyms)] // EOI from pest.

//! Predicate expressions over message properties.
//!
//! The language is a small SQL92 subset, see `predicate.pest`:
//!
//! ```sql
//! region = 'eu' AND (priority >= 5 OR TAGS IN ('vip', 'urgent')) AND trace_id IS NOT NULL
//! ```
//!
//! Keywords are case-insensitive. A property which is not present on a message evaluates as
//! NULL, and every comparison against NULL is unknown, which never admits a message. Evaluation
//! uses three-valued logic so that `NOT (a = 'x')` does not admit messages lacking `a`.

use anyhow::{bail, ensure, Context};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use crate::error::{ConsumerError, Result};
use crate::message::PulledMessage;

/// The maximum depth of parenthesized sub-expressions.
pub const MAX_NESTING: usize = 64;

/// A parser for predicate expressions.
#[derive(Parser)]
#[grammar = "filter/predicate.pest"]
struct PredicateParser;

/// A compiled predicate expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A constant.
    Const(bool),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// A comparison of a property against a literal.
    Compare { property: String, op: CmpOp, value: Literal },
    /// A numeric range check, inclusive on both ends.
    Between { property: String, low: f64, high: f64, negated: bool },
    /// A string set membership check.
    In { property: String, values: Vec<String>, negated: bool },
    /// A property presence check.
    IsNull { property: String, negated: bool },
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The operator to use when the operands of a comparison are swapped.
    fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    fn is_ordering(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }
}

/// A literal value in an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// An error encountered while evaluating a predicate against a specific message.
#[derive(Debug, Error)]
pub enum FilterEvaluationError {
    /// A numeric comparison was made against a property which does not hold a number.
    #[error("property {property:?} has non-numeric value {value:?}")]
    NotNumeric { property: String, value: String },
    /// A boolean comparison was made against a property which does not hold a boolean.
    #[error("property {property:?} has non-boolean value {value:?}")]
    NotBoolean { property: String, value: String },
}

/// Compile the given predicate expression.
pub fn compile(expression: &str) -> Result<Expr> {
    let invalid = |err: anyhow::Error| ConsumerError::invalid_filter(expression, format!("{:#}", err));
    check_nesting(expression).map_err(invalid)?;
    let or_expr = PredicateParser::parse(Rule::predicate, expression)
        .map_err(|err| ConsumerError::invalid_filter(expression, err))?
        .next()
        .and_then(|predicate| predicate.into_inner().next())
        .ok_or_else(|| ConsumerError::invalid_filter(expression, "predicate expression is empty"))?;
    build_or(or_expr).map_err(invalid)
}

/// Reject expressions whose parentheses nest deeper than `MAX_NESTING`.
///
/// Parsing recurses once per level, so this bounds stack use for hostile input.
fn check_nesting(expression: &str) -> anyhow::Result<()> {
    let (mut depth, mut quoted) = (0usize, false);
    for c in expression.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => {
                depth += 1;
                ensure!(depth <= MAX_NESTING, "expression nests deeper than {} levels", MAX_NESTING);
            }
            ')' if !quoted => depth = depth.saturating_sub(1),
            _ => (),
        }
    }
    Ok(())
}

/// Evaluate the given expression against a message.
///
/// Returns `Ok(true)` only when the expression is definitely true for the message.
pub fn evaluate(expr: &Expr, msg: &PulledMessage) -> std::result::Result<bool, FilterEvaluationError> {
    Ok(eval(expr, msg)? == Some(true))
}

/// Three-valued evaluation, where `None` is SQL's UNKNOWN.
fn eval(expr: &Expr, msg: &PulledMessage) -> std::result::Result<Option<bool>, FilterEvaluationError> {
    Ok(match expr {
        Expr::Const(val) => Some(*val),
        Expr::And(lhs, rhs) => match eval(lhs, msg)? {
            Some(false) => Some(false),
            lhs_val => match (lhs_val, eval(rhs, msg)?) {
                (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
        },
        Expr::Or(lhs, rhs) => match eval(lhs, msg)? {
            Some(true) => Some(true),
            lhs_val => match (lhs_val, eval(rhs, msg)?) {
                (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        },
        Expr::Not(inner) => eval(inner, msg)?.map(|val| !val),
        Expr::IsNull { property, negated } => Some(msg.property(property).is_none() != *negated),
        Expr::Compare { property, op, value } => match msg.property(property) {
            None => None,
            Some(raw) => Some(compare(property, raw, *op, value)?),
        },
        Expr::Between { property, low, high, negated } => match msg.property(property) {
            None => None,
            Some(raw) => {
                let val = parse_num(property, raw)?;
                Some((val >= *low && val <= *high) != *negated)
            }
        },
        Expr::In { property, values, negated } => match msg.property(property) {
            None => None,
            Some(raw) => Some(values.iter().any(|val| val == raw) != *negated),
        },
    })
}

fn compare(property: &str, raw: &str, op: CmpOp, value: &Literal) -> std::result::Result<bool, FilterEvaluationError> {
    let ordering = match value {
        Literal::Str(val) => raw.cmp(val.as_str()),
        Literal::Num(val) => {
            let lhs = parse_num(property, raw)?;
            match lhs.partial_cmp(val) {
                Some(ordering) => ordering,
                None => return Ok(false),
            }
        }
        Literal::Bool(val) => {
            let lhs = parse_bool(property, raw)?;
            lhs.cmp(val)
        }
    };
    Ok(match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => ordering.is_ne(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    })
}

fn parse_num(property: &str, raw: &str) -> std::result::Result<f64, FilterEvaluationError> {
    raw.trim().parse::<f64>().map_err(|_| FilterEvaluationError::NotNumeric {
        property: property.into(),
        value: raw.into(),
    })
}

fn parse_bool(property: &str, raw: &str) -> std::result::Result<bool, FilterEvaluationError> {
    match raw.trim() {
        val if val.eq_ignore_ascii_case("true") => Ok(true),
        val if val.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(FilterEvaluationError::NotBoolean {
            property: property.into(),
            value: raw.into(),
        }),
    }
}

//////////////////////////////////////////////////////////////////////////////
// Expression building /////////////////////////////////////////////////////////

fn build_or(pair: Pair<Rule>) -> anyhow::Result<Expr> {
    let terms = pair
        .into_inner()
        .filter(|term| term.as_rule() == Rule::and_expr)
        .map(build_and)
        .collect::<anyhow::Result<Vec<_>>>()?;
    balanced(terms, Expr::Or)
}

fn build_and(pair: Pair<Rule>) -> anyhow::Result<Expr> {
    let terms = pair
        .into_inner()
        .filter(|term| term.as_rule() == Rule::unary)
        .map(build_unary)
        .collect::<anyhow::Result<Vec<_>>>()?;
    balanced(terms, Expr::And)
}

/// Join a chain of operands into a balanced tree, so long chains stay shallow.
fn balanced(mut terms: Vec<Expr>, join: fn(Box<Expr>, Box<Expr>) -> Expr) -> anyhow::Result<Expr> {
    match terms.len() {
        0 => bail!("missing operand"),
        1 => terms.pop().context("missing operand"),
        len => {
            let rhs = terms.split_off(len / 2);
            Ok(join(Box::new(balanced(terms, join)?), Box::new(balanced(rhs, join)?)))
        }
    }
}

fn build_unary(pair: Pair<Rule>) -> anyhow::Result<Expr> {
    let (mut negations, mut operand) = (0usize, None);
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::kw_not => negations += 1,
            _ => operand = Some(build_primary(inner)?),
        }
    }
    let operand = operand.context("missing operand after NOT")?;
    // NOT is an involution under three-valued logic.
    Ok(match negations % 2 {
        0 => operand,
        _ => Expr::Not(Box::new(operand)),
    })
}

fn build_primary(pair: Pair<Rule>) -> anyhow::Result<Expr> {
    let rule = pair.as_rule();
    if rule == Rule::or_expr {
        return build_or(pair);
    }
    let inner: Vec<_> = pair.into_inner().collect();
    let negated = inner.iter().any(|part| part.as_rule() == Rule::kw_not);
    match rule {
        Rule::is_null => Ok(Expr::IsNull {
            property: property_of(&inner)?,
            negated,
        }),
        Rule::between => {
            let bounds = inner
                .iter()
                .filter(|part| part.as_rule() == Rule::number)
                .map(number)
                .collect::<anyhow::Result<Vec<_>>>()?;
            let (low, high) = match bounds.as_slice() {
                [low, high] => (*low, *high),
                _ => bail!("BETWEEN requires a lower and an upper bound"),
            };
            ensure!(low <= high, "empty BETWEEN range {} AND {}", low, high);
            Ok(Expr::Between {
                property: property_of(&inner)?,
                low,
                high,
                negated,
            })
        }
        Rule::in_list => Ok(Expr::In {
            property: property_of(&inner)?,
            values: inner.iter().filter(|part| part.as_rule() == Rule::string).map(unquote).collect(),
            negated,
        }),
        Rule::comparison | Rule::reversed_comparison => {
            let property = property_of(&inner)?;
            let op = inner
                .iter()
                .find(|part| part.as_rule() == Rule::cmp_op)
                .context("comparison operator not found")
                .and_then(cmp_op)?;
            let value = inner
                .iter()
                .find(|part| matches!(part.as_rule(), Rule::string | Rule::number | Rule::kw_true | Rule::kw_false))
                .context("comparison literal not found")
                .and_then(literal)?;
            // A literal on the left hand side, as in `5 < priority`.
            let op = if rule == Rule::reversed_comparison { op.flipped() } else { op };
            build_compare(property, op, value)
        }
        Rule::boolean => Ok(Expr::Const(inner.iter().any(|part| part.as_rule() == Rule::kw_true))),
        rule => bail!("unexpected rule type found while building predicate '{:?}'", rule),
    }
}

fn property_of(parts: &[Pair<Rule>]) -> anyhow::Result<String> {
    parts
        .iter()
        .find(|part| part.as_rule() == Rule::ident)
        .map(|part| part.as_str().to_owned())
        .context("property name not found in predicate")
}

fn cmp_op(pair: &Pair<Rule>) -> anyhow::Result<CmpOp> {
    Ok(match pair.as_str() {
        "=" => CmpOp::Eq,
        "<>" | "!=" => CmpOp::Ne,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        bad => bail!("unrecognized comparison operator '{}'", bad),
    })
}

fn literal(pair: &Pair<Rule>) -> anyhow::Result<Literal> {
    Ok(match pair.as_rule() {
        Rule::string => Literal::Str(unquote(pair)),
        Rule::number => Literal::Num(number(pair)?),
        Rule::kw_true => Literal::Bool(true),
        Rule::kw_false => Literal::Bool(false),
        rule => bail!("expected literal, found '{:?}'", rule),
    })
}

fn number(pair: &Pair<Rule>) -> anyhow::Result<f64> {
    pair.as_str()
        .parse::<f64>()
        .with_context(|| format!("invalid numeric literal '{}'", pair.as_str()))
}

/// The contents of a string literal, with doubled quotes unescaped.
fn unquote(pair: &Pair<Rule>) -> String {
    pair.clone()
        .into_inner()
        .next()
        .map(|inner| inner.as_str().replace("''", "'"))
        .unwrap_or_default()
}

fn build_compare(property: String, op: CmpOp, value: Literal) -> anyhow::Result<Expr> {
    ensure!(
        !op.is_ordering() || matches!(value, Literal::Num(_)),
        "ordering comparison on {:?} requires a numeric literal",
        property
    );
    Ok(Expr::Compare { property, op, value })
}
