//! Tag expression compilation.
//!
//! A tag expression is a disjunction of literal tags, `"tag1 || tag2 || tag3"`. A missing or
//! empty expression, or the wildcard `*`, admits every message.

use std::collections::BTreeSet;

use crate::error::{ConsumerError, Result};

/// The wildcard expression admitting all messages.
pub const SUB_ALL: &str = "*";
/// The separator between tags of a disjunction.
const TAG_SEPARATOR: &str = "||";

/// Compile the given tag expression.
///
/// Returns `None` if the expression admits every message, else the set of admitted tags.
pub fn compile(expression: Option<&str>) -> Result<Option<BTreeSet<String>>> {
    let expression = match expression.map(str::trim) {
        None => return Ok(None),
        Some(expr) if expr.is_empty() || expr == SUB_ALL => return Ok(None),
        Some(expr) => expr,
    };

    let mut tags = BTreeSet::new();
    for segment in expression.split(TAG_SEPARATOR) {
        let tag = segment.trim();
        if tag.is_empty() {
            return Err(ConsumerError::invalid_filter(expression, "empty tag in disjunction"));
        }
        if tag == SUB_ALL {
            return Err(ConsumerError::invalid_filter(expression, "wildcard may not be combined with other tags"));
        }
        if tag.contains('|') {
            return Err(ConsumerError::invalid_filter(expression, format!("malformed separator in tag {:?}", tag)));
        }
        tags.insert(tag.to_string());
    }
    Ok(Some(tags))
}

/// Check the given message tag against the compiled tag set.
pub fn admits(tags: &BTreeSet<String>, msg_tag: Option<&str>) -> bool {
    match msg_tag {
        Some(tag) => tags.contains(tag),
        None => false,
    }
}
