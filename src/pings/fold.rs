//! Text folding shared by stored expressions and incoming messages.
//!
//! Folding lowercases, strips diacritics (canonical decomposition, then drop
//! combining marks) and removes Unicode punctuation outright. Whitespace is
//! left untouched so exact-match tokenization still sees word boundaries.

use unicode_normalization::UnicodeNormalization;
use unicode_properties::{GeneralCategoryGroup, UnicodeGeneralCategory};

/// Fold `text` for ping comparisons.
///
/// `fold(&fold(s)) == fold(s)` for every input.
pub fn fold(text: &str) -> String {
    // Lowercase first: lowercasing can itself emit combining marks (`İ`).
    let lowered = text.to_lowercase();
    lowered
        .nfd()
        .filter(|c| !is_dropped(*c))
        .nfc()
        .collect()
}

/// Split folded text into whitespace-delimited tokens.
pub fn tokens(folded: &str) -> Vec<&str> {
    folded.split_whitespace().collect()
}

/// Length in Unicode scalars, the unit the minimum-length rule counts in.
pub fn scalar_len(text: &str) -> usize {
    text.chars().count()
}

fn is_dropped(c: char) -> bool {
    matches!(
        c.general_category_group(),
        GeneralCategoryGroup::Mark | GeneralCategoryGroup::Punctuation
    )
}
