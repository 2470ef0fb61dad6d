//! Message filtering.
//!
//! Subscriptions carry an expression of one of two kinds: a tag disjunction or a predicate over
//! message properties. Expressions are compiled once at subscribe time into a `CompiledFilter`,
//! which is then evaluated by the pull loops for every pulled message. Evaluation never fails:
//! a predicate which cannot be evaluated against a malformed message rejects that message.

pub mod predicate;
pub mod tag;

use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;
use crate::message::PulledMessage;

pub use tag::SUB_ALL;

/// The kind of a subscription expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExpressionKind {
    /// A disjunction of literal tags.
    Tag,
    /// A declarative predicate over message properties.
    Predicate,
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag => f.write_str("TAG"),
            Self::Predicate => f.write_str("PREDICATE"),
        }
    }
}

/// A subscription expression along with its kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSelector {
    /// The kind of this selector's expression.
    pub kind: ExpressionKind,
    /// The expression text; `None` admits all messages for tag selectors.
    pub expression: Option<String>,
}

impl MessageSelector {
    /// Select messages by tag, e.g. `"tag1 || tag2"`. `None` or `"*"` selects everything.
    pub fn by_tag<T: Into<String>>(expression: Option<T>) -> Self {
        Self {
            kind: ExpressionKind::Tag,
            expression: expression.map(Into::into),
        }
    }

    /// Select messages by a predicate over their properties.
    pub fn by_predicate(expression: impl Into<String>) -> Self {
        Self {
            kind: ExpressionKind::Predicate,
            expression: Some(expression.into()),
        }
    }

    /// Select every message.
    pub fn all() -> Self {
        Self::by_tag(Some(SUB_ALL))
    }

    /// The normalized expression text of this selector.
    pub fn expression_text(&self) -> &str {
        match (self.kind, self.expression.as_deref().map(str::trim)) {
            (ExpressionKind::Tag, None) => SUB_ALL,
            (ExpressionKind::Tag, Some("")) => SUB_ALL,
            (_, Some(expr)) => expr,
            (ExpressionKind::Predicate, None) => "",
        }
    }

    /// Compile this selector into its evaluable form.
    pub fn compile(&self) -> Result<CompiledFilter> {
        match self.kind {
            ExpressionKind::Tag => Ok(match tag::compile(self.expression.as_deref())? {
                None => CompiledFilter::All,
                Some(tags) => CompiledFilter::Tags(tags),
            }),
            ExpressionKind::Predicate => Ok(CompiledFilter::Predicate(predicate::compile(self.expression_text())?)),
        }
    }
}

/// The compiled form of a subscription expression.
#[derive(Clone, Debug, PartialEq)]
pub enum CompiledFilter {
    /// Every message is admitted.
    All,
    /// Messages whose tag is a member of the set are admitted.
    Tags(BTreeSet<String>),
    /// Messages for which the predicate is definitely true are admitted.
    Predicate(predicate::Expr),
}

impl CompiledFilter {
    /// Check if the given message is admitted by this filter.
    ///
    /// Predicate evaluation errors fail closed: the message is rejected and the error is logged.
    pub fn admits(&self, msg: &PulledMessage) -> bool {
        match self {
            Self::All => true,
            Self::Tags(tags) => tag::admits(tags, msg.tags.as_deref()),
            Self::Predicate(expr) => match predicate::evaluate(expr, msg) {
                Ok(admitted) => admitted,
                Err(err) => {
                    tracing::warn!(error = %err, queue = %msg.queue, offset = msg.offset, "filter evaluation failed, rejecting message");
                    false
                }
            },
        }
    }
}
