use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::{NoExpand, Regex};
use serde::Deserialize;

/// How a pattern locates text in a page body.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// One catalog rule. Without a replacement the rule only detects.
#[derive(Debug, Clone)]
pub struct Pattern {
    matcher: Matcher,
    replacement: Option<String>,
}

impl Pattern {
    pub fn literal(needle: impl Into<String>, replacement: Option<String>) -> Self {
        Self {
            matcher: Matcher::Literal(needle.into()),
            replacement,
        }
    }

    pub fn replace(needle: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self::literal(needle, Some(replacement.into()))
    }

    pub fn detect(needle: impl Into<String>) -> Self {
        Self::literal(needle, None)
    }

    pub fn regex(expression: &str, replacement: Option<String>) -> Result<Self> {
        let compiled = Regex::new(expression)
            .with_context(|| format!("invalid pattern regex: {expression}"))?;
        Ok(Self {
            matcher: Matcher::Regex(compiled),
            replacement,
        })
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn replacement(&self) -> Option<&str> {
        self.replacement.as_deref()
    }

    pub fn is_match(&self, body: &str) -> bool {
        match &self.matcher {
            Matcher::Literal(needle) => !needle.is_empty() && body.contains(needle.as_str()),
            Matcher::Regex(regex) => regex.is_match(body),
        }
    }

    /// Replaces every occurrence. Returns `None` for detection-only rules.
    /// The replacement text is inserted verbatim, also for regex rules.
    pub fn rewrite(&self, body: &str) -> Option<String> {
        let replacement = self.replacement.as_deref()?;
        Some(match &self.matcher {
            Matcher::Literal(needle) => body.replace(needle.as_str(), replacement),
            Matcher::Regex(regex) => regex.replace_all(body, NoExpand(replacement)).into_owned(),
        })
    }

    pub fn describe(&self) -> String {
        let target = match &self.matcher {
            Matcher::Literal(needle) => format!("literal {}", abbreviate(needle)),
            Matcher::Regex(regex) => format!("regex {}", abbreviate(regex.as_str())),
        };
        match &self.replacement {
            Some(replacement) => format!("{target} -> {}", abbreviate(replacement)),
            None => target,
        }
    }
}

/// Ordered list of patterns supplied per job.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    patterns: Vec<Pattern>,
}

impl PatternCatalog {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self { patterns }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn has_replacements(&self) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.replacement.is_some())
    }

    /// Index of the first pattern matching `body`.
    pub fn first_match(&self, body: &str) -> Option<usize> {
        self.patterns
            .iter()
            .position(|pattern| pattern.is_match(body))
    }
}

impl FromIterator<Pattern> for PatternCatalog {
    fn from_iter<I: IntoIterator<Item = Pattern>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PatternCatalog {
    type Item = &'a Pattern;
    type IntoIter = std::slice::Iter<'a, Pattern>;

    fn into_iter(self) -> Self::IntoIter {
        self.patterns.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    #[default]
    Literal,
    Regex,
}

/// Catalog entry as written in a pattern file. `old_pattern`/`new_pattern`
/// are accepted as aliases of `match`/`replace`.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternSpec {
    #[serde(rename = "match", alias = "old_pattern")]
    pub needle: String,
    #[serde(default, rename = "replace", alias = "new_pattern")]
    pub replacement: Option<String>,
    #[serde(default)]
    pub kind: PatternKind,
    #[serde(default)]
    pub escape_umlauts: bool,
}

impl PatternSpec {
    pub fn compile(&self) -> Result<Pattern> {
        if self.needle.is_empty() {
            bail!("pattern `match` cannot be empty");
        }
        let (needle, replacement) = if self.escape_umlauts {
            (
                escape_umlauts(&self.needle),
                self.replacement.as_deref().map(escape_umlauts),
            )
        } else {
            (self.needle.clone(), self.replacement.clone())
        };
        match self.kind {
            PatternKind::Literal => Ok(Pattern::literal(needle, replacement)),
            PatternKind::Regex => Pattern::regex(&needle, replacement),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<PatternSpec>),
    Table { patterns: Vec<PatternSpec> },
}

impl CatalogDocument {
    fn into_specs(self) -> Vec<PatternSpec> {
        match self {
            Self::List(specs) | Self::Table { patterns: specs } => specs,
        }
    }
}

/// Loads a catalog from JSON (`[...]` or `{"patterns": [...]}`) or TOML
/// (`[[patterns]]`), chosen by file extension.
pub fn load_catalog(path: &Path) -> Result<PatternCatalog> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let document: CatalogDocument = if has_toml_extension(path) {
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?
    };

    let mut patterns = Vec::new();
    for (index, spec) in document.into_specs().iter().enumerate() {
        let pattern = spec
            .compile()
            .with_context(|| format!("pattern #{} in {}", index + 1, path.display()))?;
        patterns.push(pattern);
    }
    Ok(PatternCatalog::new(patterns))
}

fn has_toml_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

const UMLAUT_ENTITIES: [(char, &str); 7] = [
    ('ä', "&auml;"),
    ('ö', "&ouml;"),
    ('ü', "&uuml;"),
    ('Ä', "&Auml;"),
    ('Ö', "&Ouml;"),
    ('Ü', "&Uuml;"),
    ('ß', "&szlig;"),
];

/// Storage format keeps German umlauts as named entities; patterns written
/// with plain umlauts never match without this.
pub fn escape_umlauts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match UMLAUT_ENTITIES.iter().find(|(umlaut, _)| *umlaut == ch) {
            Some((_, entity)) => out.push_str(entity),
            None => out.push(ch),
        }
    }
    out
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Rewrites smart links to `title` so they name `space_key` explicitly.
pub fn smart_link_space_pattern(space_key: &str, title: &str) -> Pattern {
    let escaped = escape_umlauts(&escape_html(title));
    Pattern::replace(
        format!("<ri:page ri:content-title=\"{escaped}\""),
        format!("<ri:page ri:space-key=\"{space_key}\" ri:content-title=\"{escaped}\""),
    )
}

fn abbreviate(text: &str) -> String {
    const LIMIT: usize = 60;
    if text.chars().count() <= LIMIT {
        return format!("{text:?}");
    }
    let head = text.chars().take(LIMIT).collect::<String>();
    format!("{head:?}...")
}
