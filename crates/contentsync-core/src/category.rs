//! Content categories that can be excluded from syncing.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// A named group of content recognized by glob patterns.
///
/// Patterns are matched case-insensitively against both the root-relative
/// path and the bare name of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Unique category name.
    pub name: String,
    /// Glob patterns (`*.mp4`, `videos/**`).
    pub patterns: Vec<String>,
    /// Whether items of this category are synced.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Category {
    /// Create an enabled category.
    pub fn new<I, S>(name: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            enabled: true,
        }
    }

    /// Video files.
    pub fn video() -> Self {
        Self::new("video", ["*.mp4", "*.m4v", "*.mov", "*.avi", "*.mkv", "*.webm"])
    }

    /// Slide decks.
    pub fn presentation() -> Self {
        Self::new(
            "presentation",
            ["*.ppt", "*.pptx", "*.pps", "*.ppsx", "*.key", "*.odp"],
        )
    }

    /// Categories known out of the box.
    pub fn builtin() -> Vec<Category> {
        vec![Self::video(), Self::presentation()]
    }

    /// Return a disabled copy.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check every pattern compiles.
    pub fn validate(&self) -> Result<(), globset::Error> {
        for pattern in &self.patterns {
            build_glob(pattern)?;
        }
        Ok(())
    }
}

/// Compiled matcher over a set of categories.
#[derive(Debug, Clone)]
pub struct CategoryMatcher {
    set: GlobSet,
    owners: Vec<usize>,
    names: Vec<String>,
}

impl CategoryMatcher {
    /// Compile the patterns of `categories`.
    ///
    /// Patterns that fail to compile are skipped with a warning; configs are
    /// validated before they reach the planner.
    pub fn new(categories: &[Category]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut owners = Vec::new();

        for (index, category) in categories.iter().enumerate() {
            for pattern in &category.patterns {
                match build_glob(pattern) {
                    Ok(glob) => {
                        builder.add(glob);
                        owners.push(index);
                    }
                    Err(err) => {
                        tracing::warn!(category = %category.name, %pattern, %err, "skipping invalid category pattern");
                    }
                }
            }
        }

        let set = builder.build().unwrap_or_else(|err| {
            tracing::warn!(%err, "category patterns rejected, matching nothing");
            GlobSet::empty()
        });

        Self {
            set,
            owners,
            names: categories.iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// A matcher that matches nothing.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Whether a node with this path and name belongs to any category.
    pub fn matches(&self, path: &str, name: &str) -> bool {
        !self.set.is_empty() && (self.set.is_match(path) || self.set.is_match(name))
    }

    /// Name of the first category matching this node.
    pub fn category_of(&self, path: &str, name: &str) -> Option<&str> {
        let mut hits = self.set.matches(path);
        if hits.is_empty() {
            hits = self.set.matches(name);
        }
        hits.into_iter()
            .filter_map(|glob| self.owners.get(glob))
            .min()
            .and_then(|owner| self.names.get(*owner))
            .map(String::as_str)
    }
}

fn build_glob(pattern: &str) -> Result<globset::Glob, globset::Error> {
    GlobBuilder::new(pattern).case_insensitive(true).build()
}
