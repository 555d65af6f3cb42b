//! The `pings` command surface: add, remove, list, test.
//!
//! Every function returns the plain-language text shown to the user; policy
//! rejections come back as [`PingsError`] whose `Display` is that text.

use super::expression::{Expression, ExpressionKind};
use super::fold::{fold, scalar_len};
use super::matcher::FoldedMessage;
use super::store::{BatchOutcome, PingsStore};
use serde::Deserialize;

/// Acceptance policy for new expressions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingLimits {
    /// Minimum inner-text length, in Unicode scalars after folding.
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Subscription cap for ordinary members.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Subscription cap for members holding a trusted role.
    #[serde(default = "default_trusted_limit")]
    pub trusted_limit: usize,

    /// Roles that raise the cap to `trusted_limit`.
    #[serde(default)]
    pub trusted_role_ids: Vec<u64>,
}

fn default_min_length() -> usize {
    3
}

fn default_limit() -> usize {
    100
}

fn default_trusted_limit() -> usize {
    200
}

impl Default for PingLimits {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            default_limit: default_limit(),
            trusted_limit: default_trusted_limit(),
            trusted_role_ids: Vec::new(),
        }
    }
}

impl PingLimits {
    pub fn limit_for(&self, role_ids: &[u64]) -> usize {
        if role_ids.iter().any(|r| self.trusted_role_ids.contains(r)) {
            self.trusted_limit
        } else {
            self.default_limit
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PingsError {
    #[error("No expressions were given. Separate multiple expressions with commas or new lines.")]
    Empty,

    #[error(
        "These expressions are shorter than {min} letters, which is not acceptable: {}",
        quote_list(.texts)
    )]
    TooShort { min: usize, texts: Vec<String> },

    #[error(
        "You currently have {current} pings and tried to add {adding} more, \
         but your limit is {limit}. Nothing was added."
    )]
    LimitExceeded {
        current: usize,
        adding: usize,
        limit: usize,
    },

    #[error("Something went wrong, please try again later.")]
    Store(color_eyre::Report),
}

impl From<color_eyre::Report> for PingsError {
    fn from(e: color_eyre::Report) -> Self {
        Self::Store(e)
    }
}

/// Split free text into expressions on commas and new lines.
pub fn parse_expression_list(text: &str) -> Vec<String> {
    text.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Fold each text into an expression of `kind`, dropping duplicates.
pub fn fold_all(texts: &[String], kind: ExpressionKind) -> Vec<Expression> {
    let mut expressions: Vec<Expression> = Vec::with_capacity(texts.len());
    for text in texts {
        let expression = Expression::new(kind, text.as_str()).folded();
        if !expressions.contains(&expression) {
            expressions.push(expression);
        }
    }
    expressions
}

/// Add the comma/newline separated `text` to `user_id`'s pings.
///
/// All-or-nothing: a batch that would exceed the cap adds nothing.
pub async fn add(
    store: &PingsStore,
    limits: &PingLimits,
    user_id: &str,
    role_ids: &[u64],
    text: &str,
    kind: ExpressionKind,
) -> Result<String, PingsError> {
    let texts = parse_expression_list(text);
    if texts.is_empty() {
        return Err(PingsError::Empty);
    }

    let too_short: Vec<String> = texts
        .iter()
        .filter(|t| scalar_len(fold(t).trim()) < limits.min_length)
        .cloned()
        .collect();
    if !too_short.is_empty() {
        return Err(PingsError::TooShort {
            min: limits.min_length,
            texts: too_short,
        });
    }

    let expressions = fold_all(&texts, kind);
    let outcome = store
        .insert(&expressions, user_id, limits.limit_for(role_ids))
        .await?
        .map_err(|cap| PingsError::LimitExceeded {
            current: cap.current,
            adding: cap.adding,
            limit: cap.limit,
        })?;

    tracing::debug!(
        user_id,
        added = outcome.changed.len(),
        already = outcome.unchanged.len(),
        "pings added"
    );
    Ok(render_batch(
        &outcome,
        "Successfully added",
        "to your pings list.",
        "Already in your pings list:",
    ))
}

/// Remove the comma/newline separated `text` from `user_id`'s pings.
pub async fn remove(
    store: &PingsStore,
    user_id: &str,
    text: &str,
    kind: ExpressionKind,
) -> Result<String, PingsError> {
    let texts = parse_expression_list(text);
    if texts.is_empty() {
        return Err(PingsError::Empty);
    }
    let expressions = fold_all(&texts, kind);
    let outcome = store.remove(&expressions, user_id).await?;
    Ok(render_batch(
        &outcome,
        "Successfully removed",
        "from your pings list.",
        "Not in your pings list:",
    ))
}

/// Render `user_id`'s current expressions.
pub async fn list(store: &PingsStore, user_id: &str) -> Result<String, PingsError> {
    let expressions = store.get(user_id).await?;
    if expressions.is_empty() {
        return Ok("You have no pings yet.".into());
    }
    let mut lines = vec![format!("Your pings ({}):", expressions.len())];
    lines.extend(
        expressions
            .iter()
            .map(|e| format!("- `{}` ({})", e.inner(), e.kind().description())),
    );
    Ok(lines.join("\n"))
}

/// Report which expressions would trigger on `message`.
///
/// Tests `explicit` when given, otherwise the user's own list.
pub async fn test(
    store: &PingsStore,
    user_id: &str,
    message: &str,
    explicit: Option<(&str, ExpressionKind)>,
) -> Result<String, PingsError> {
    let expressions = match explicit {
        Some((text, kind)) => {
            let texts = parse_expression_list(text);
            if texts.is_empty() {
                return Err(PingsError::Empty);
            }
            fold_all(&texts, kind)
        }
        None => store.get(user_id).await?,
    };
    Ok(render_test(message, &expressions))
}

/// Pure half of [`test`].
pub fn render_test(message: &str, expressions: &[Expression]) -> String {
    if expressions.is_empty() {
        return "There are no expressions to test against.".into();
    }
    let folded = FoldedMessage::new(message);
    let mut triggered: Vec<&Expression> =
        expressions.iter().filter(|e| folded.triggers(e)).collect();
    triggered.sort();
    if triggered.is_empty() {
        return format!(
            "The message does not trigger any of the {} tested expressions.",
            expressions.len()
        );
    }
    let names: Vec<String> = triggered.iter().map(|e| e.inner().to_owned()).collect();
    format!("The message triggers: {}", quote_list(&names))
}

fn render_batch(outcome: &BatchOutcome, done: &str, done_suffix: &str, skipped: &str) -> String {
    let mut lines = Vec::new();
    if !outcome.changed.is_empty() {
        lines.push(format!("{done} {} {done_suffix}", quote_expressions(&outcome.changed)));
    }
    if !outcome.unchanged.is_empty() {
        lines.push(format!("{skipped} {}", quote_expressions(&outcome.unchanged)));
    }
    lines.join("\n")
}

fn quote_expressions(expressions: &[Expression]) -> String {
    let mut names: Vec<String> = expressions.iter().map(|e| e.inner().to_owned()).collect();
    names.sort();
    quote_list(&names)
}

fn quote_list(texts: &[String]) -> String {
    texts
        .iter()
        .map(|t| format!("`{t}`"))
        .collect::<Vec<_>>()
        .join(", ")
}
