// Meme taxonomy: compatibility tags for programs, sequence bindings and
// instruments.
//
// A meme is an uppercase alphanumeric tag ("RED", "SPRING"). The taxonomy
// groups some memes into categories whose values are mutually exclusive: a
// segment may be RED or BLUE but never both. Memes outside every category are
// free and always compatible.
//
// Two views are built on top of a taxonomy:
// - `MemeStack`: the set of memes already committed to a segment. Answers
//   "may I add these memes?" by checking the union against every category.
// - `MemeIsometry`: a reference set of memes used to bias selection. Its
//   score counts overlap and never filters; filtering is the stack's job.
//
// The scoring function is pluggable through `MemeScore`; `OverlapScore` is the
// default used by every selection in the craft stages.
//
// See also: `bag.rs` where scores become selection quantities,
// `fabricator.rs` for `put_choice`/`put_meme` which consult the stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Normalize a tag: uppercase, alphanumerics only.
pub fn to_meme(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn to_memes<S: AsRef<str>>(raw: impl IntoIterator<Item = S>) -> BTreeSet<String> {
    raw.into_iter()
        .map(|s| to_meme(s.as_ref()))
        .filter(|m| !m.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemeCategory {
    pub name: String,
    pub memes: Vec<String>,
}

impl MemeCategory {
    pub fn new<S: AsRef<str>>(name: &str, memes: impl IntoIterator<Item = S>) -> Self {
        MemeCategory {
            name: to_meme(name),
            memes: memes.into_iter().map(|m| to_meme(m.as_ref())).collect(),
        }
    }

    pub fn contains(&self, meme: &str) -> bool {
        self.memes.iter().any(|m| m == meme)
    }

    /// True when `memes` holds at most one value of this category.
    pub fn is_allowed(&self, memes: &BTreeSet<String>) -> bool {
        memes.iter().filter(|m| self.contains(m)).count() <= 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemeTaxonomy {
    categories: Vec<MemeCategory>,
}

impl Default for MemeTaxonomy {
    fn default() -> Self {
        MemeTaxonomy {
            categories: vec![
                MemeCategory::new("COLOR", ["BLUE", "GREEN", "RED"]),
                MemeCategory::new("SEASON", ["FALL", "SPRING", "SUMMER", "WINTER"]),
            ],
        }
    }
}

impl MemeTaxonomy {
    pub fn new(categories: Vec<MemeCategory>) -> Self {
        MemeTaxonomy { categories }
    }

    pub fn empty() -> Self {
        MemeTaxonomy { categories: Vec::new() }
    }

    pub fn categories(&self) -> &[MemeCategory] {
        &self.categories
    }

    pub fn is_allowed(&self, memes: &BTreeSet<String>) -> bool {
        self.categories.iter().all(|c| c.is_allowed(memes))
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Memes committed to one segment.
#[derive(Clone, Debug)]
pub struct MemeStack {
    taxonomy: MemeTaxonomy,
    memes: BTreeSet<String>,
}

impl MemeStack {
    pub fn new<S: AsRef<str>>(taxonomy: MemeTaxonomy, memes: impl IntoIterator<Item = S>) -> Self {
        MemeStack {
            taxonomy,
            memes: to_memes(memes),
        }
    }

    pub fn memes(&self) -> &BTreeSet<String> {
        &self.memes
    }

    /// Whether adding `memes` keeps every category down to one value.
    pub fn is_allowed(&self, memes: &BTreeSet<String>) -> bool {
        let mut union = self.memes.clone();
        union.extend(memes.iter().map(|m| to_meme(m)));
        self.taxonomy.is_allowed(&union)
    }

    /// True when the committed set itself is consistent.
    pub fn is_valid(&self) -> bool {
        self.taxonomy.is_allowed(&self.memes)
    }

    /// Stable identity of the set, e.g. "RED_SPRING".
    pub fn constellation(&self) -> String {
        self.memes.iter().cloned().collect::<Vec<_>>().join("_")
    }
}

// ---------------------------------------------------------------------------
// Isometry
// ---------------------------------------------------------------------------

/// Scores a candidate's memes against a reference set. Higher means more
/// alike; a score only ever biases selection.
pub trait MemeScore {
    fn score(&self, sources: &BTreeSet<String>, targets: &BTreeSet<String>) -> u32;
}

/// Number of candidate memes already present in the reference set.
#[derive(Clone, Copy, Debug, Default)]
pub struct OverlapScore;

impl MemeScore for OverlapScore {
    fn score(&self, sources: &BTreeSet<String>, targets: &BTreeSet<String>) -> u32 {
        targets.iter().filter(|t| sources.contains(*t)).count() as u32
    }
}

#[derive(Clone, Debug)]
pub struct MemeIsometry {
    taxonomy: MemeTaxonomy,
    sources: BTreeSet<String>,
}

impl MemeIsometry {
    pub fn of<S: AsRef<str>>(taxonomy: MemeTaxonomy, sources: impl IntoIterator<Item = S>) -> Self {
        MemeIsometry {
            taxonomy,
            sources: to_memes(sources),
        }
    }

    pub fn none(taxonomy: MemeTaxonomy) -> Self {
        MemeIsometry {
            taxonomy,
            sources: BTreeSet::new(),
        }
    }

    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    pub fn add(&mut self, meme: &str) {
        let meme = to_meme(meme);
        if !meme.is_empty() {
            self.sources.insert(meme);
        }
    }

    pub fn score(&self, targets: &BTreeSet<String>) -> u32 {
        self.score_with(&OverlapScore, targets)
    }

    pub fn score_with(&self, scorer: &impl MemeScore, targets: &BTreeSet<String>) -> u32 {
        scorer.score(&self.sources, &to_memes(targets))
    }

    pub fn is_allowed(&self, targets: &BTreeSet<String>) -> bool {
        MemeStack::new(self.taxonomy.clone(), self.sources.iter()).is_allowed(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        to_memes(items.iter())
    }

    #[test]
    fn normalizes_tags() {
        assert_eq!(to_meme("  spring-time! "), "SPRINGTIME");
        assert!(to_memes(["", "--"]).is_empty());
    }

    #[test]
    fn two_values_of_one_category_are_refused() {
        let stack = MemeStack::new(MemeTaxonomy::default(), ["RED"]);
        assert!(!stack.is_allowed(&set(&["BLUE"])));
        assert!(stack.is_allowed(&set(&["RED", "SPRING"])));
        assert!(!MemeStack::new(MemeTaxonomy::default(), ["SPRING", "FALL"]).is_valid());
    }

    #[test]
    fn free_memes_are_always_allowed() {
        let stack = MemeStack::new(MemeTaxonomy::default(), ["RED", "WINTER"]);
        assert!(stack.is_allowed(&set(&["FUNKY", "DARK"])));
        assert!(stack.is_allowed(&BTreeSet::new()));
    }

    #[test]
    fn lowercase_candidates_are_normalized() {
        let stack = MemeStack::new(MemeTaxonomy::default(), ["red"]);
        assert!(!stack.is_allowed(&set(&["green"])));
        assert_eq!(stack.constellation(), "RED");
    }

    #[test]
    fn isometry_counts_shared_memes() {
        let iso = MemeIsometry::of(MemeTaxonomy::default(), ["RED", "SPRING", "DARK"]);
        assert_eq!(iso.score(&set(&["RED", "DARK", "FALL"])), 2);
        assert_eq!(iso.score(&set(&["BLUE"])), 0);
        assert!(!iso.is_allowed(&set(&["BLUE"])));
        assert!(iso.is_allowed(&set(&["LIGHT"])));
    }

    #[test]
    fn custom_scorer_plugs_in() {
        struct Flat;
        impl MemeScore for Flat {
            fn score(&self, _: &BTreeSet<String>, _: &BTreeSet<String>) -> u32 {
                7
            }
        }
        let iso = MemeIsometry::none(MemeTaxonomy::empty());
        assert_eq!(iso.score_with(&Flat, &set(&["ANY"])), 7);
    }

    #[test]
    fn taxonomy_serializes_as_category_list() {
        let json = serde_json::to_string(&MemeTaxonomy::default()).unwrap();
        assert!(json.starts_with('['));
        let back: MemeTaxonomy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MemeTaxonomy::default());
    }
}
