//! C1 — Path primitive: hierarchical label sequences and descent-match patterns.

use std::fmt;

use crate::error::KbError;

const SEPARATOR: char = '.';
const ONE_WILDCARD: &str = "*";
const MANY_WILDCARD: &str = ">";

fn is_label_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Validate a single label against `[A-Za-z_][A-Za-z0-9_]*`.
fn valid_label(label: &str) -> bool {
    let mut chars = label.chars();
    match chars.next() {
        Some(c) if is_label_start(c) => {}
        _ => return false,
    }
    chars.all(is_label_char)
}

/// A hierarchical label sequence, e.g. `kb1.jobs.worker`.
///
/// Immutable once constructed; two paths are equal iff their label sequences are
/// equal (case-sensitive).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Path(Vec<String>);

impl Path {
    /// Parse a dot-separated rendering into a [`Path`], validating every label.
    pub fn parse(s: &str) -> Result<Self, KbError> {
        if s.is_empty() {
            return Err(KbError::invalid("path must not be empty"));
        }
        let labels: Vec<&str> = s.split(SEPARATOR).collect();
        Self::compose(labels.into_iter())
    }

    /// Compose a path from an already-split label sequence, validating each one.
    pub fn compose<I, S>(labels: I) -> Result<Self, KbError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let labels: Vec<String> = labels.into_iter().map(|s| s.as_ref().to_string()).collect();
        if labels.is_empty() {
            return Err(KbError::invalid("path must have at least one label"));
        }
        for label in &labels {
            if !valid_label(label) {
                return Err(KbError::invalid(format!("invalid path label: {label:?}")));
            }
        }
        Ok(Self(labels))
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Render back to the dot-joined textual form. `parse(p.render()) == p` for
    /// every valid `p`.
    pub fn render(&self) -> String {
        self.0.join(&SEPARATOR.to_string())
    }

    /// Append one label, returning a new child path.
    pub fn child(&self, label: &str) -> Result<Self, KbError> {
        if !valid_label(label) {
            return Err(KbError::invalid(format!("invalid path label: {label:?}")));
        }
        let mut labels = self.0.clone();
        labels.push(label.to_string());
        Ok(Self(labels))
    }

    /// The ancestor `n` levels up (`n=0` returns `self`). Fails if `n` exceeds the
    /// path's depth.
    pub fn ancestor(&self, n: usize) -> Result<Self, KbError> {
        if n >= self.0.len() {
            return Err(KbError::invalid(format!(
                "path {self} has depth {} and no ancestor at distance {n}",
                self.0.len()
            )));
        }
        Ok(Self(self.0[..self.0.len() - n].to_vec()))
    }

    /// A pattern matching exactly this path.
    pub fn exact(&self) -> PathPattern {
        PathPattern(self.0.iter().cloned().map(PatternSegment::Label).collect())
    }

    /// A pattern matching this path followed by one-or-more additional labels
    /// (i.e. any strict descendant).
    pub fn descendants(&self) -> PathPattern {
        let mut segments: Vec<PatternSegment> =
            self.0.iter().cloned().map(PatternSegment::Label).collect();
        segments.push(PatternSegment::Many);
        PathPattern(segments)
    }

    /// `true` iff `other` is this path or a descendant of it.
    pub fn matches(&self, pattern: &PathPattern) -> bool {
        pattern.matches(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// One segment of a descent-match pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatternSegment {
    /// A literal label that must match exactly.
    Label(String),
    /// `*` — matches exactly one label.
    One,
    /// `>` — matches one-or-more labels, greedily to the end of the pattern.
    Many,
}

/// A compiled descent-match pattern: a sequence of [`PatternSegment`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathPattern(Vec<PatternSegment>);

impl PathPattern {
    /// Parse a dot-separated pattern string, recognizing `*` and `>` tokens.
    pub fn parse(s: &str) -> Result<Self, KbError> {
        if s.is_empty() {
            return Err(KbError::invalid("pattern must not be empty"));
        }
        let mut segments = Vec::new();
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                ONE_WILDCARD => PatternSegment::One,
                MANY_WILDCARD => {
                    if i != parts.len() - 1 {
                        return Err(KbError::invalid(
                            "the many-label wildcard must be the final pattern segment",
                        ));
                    }
                    PatternSegment::Many
                }
                label if valid_label(label) => PatternSegment::Label(label.to_string()),
                other => {
                    return Err(KbError::invalid(format!("invalid pattern segment: {other:?}")))
                }
            };
            segments.push(segment);
        }
        Ok(Self(segments))
    }

    /// Descent-match semantics: `*` matches exactly one label, `>` matches
    /// one-or-more labels greedily to the end, literals match exactly.
    pub fn matches(&self, path: &Path) -> bool {
        let labels = path.labels();
        let mut li = 0usize;
        for (si, segment) in self.0.iter().enumerate() {
            match segment {
                PatternSegment::Many => {
                    // Many must be the final segment (enforced at parse time) and
                    // requires at least one remaining label.
                    debug_assert_eq!(si, self.0.len() - 1);
                    return li < labels.len();
                }
                PatternSegment::One => {
                    if li >= labels.len() {
                        return false;
                    }
                    li += 1;
                }
                PatternSegment::Label(expected) => {
                    if labels.get(li) != Some(expected) {
                        return false;
                    }
                    li += 1;
                }
            }
        }
        li == labels.len()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|s| match s {
                PatternSegment::Label(l) => l.clone(),
                PatternSegment::One => ONE_WILDCARD.to_string(),
                PatternSegment::Many => MANY_WILDCARD.to_string(),
            })
            .collect();
        write!(f, "{}", rendered.join(&SEPARATOR.to_string()))
    }
}

/// `true` iff `s` is a syntactically valid path rendering.
pub fn valid(s: &str) -> bool {
    Path::parse(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for s in ["a", "a.b.c", "_x.y1.Z_9"] {
            let p = Path::parse(s).unwrap();
            assert_eq!(p.render(), s);
            assert_eq!(Path::parse(&p.render()).unwrap(), p);
        }
    }

    #[test]
    fn rejects_invalid_labels() {
        assert!(Path::parse("").is_err());
        assert!(Path::parse("1abc").is_err());
        assert!(Path::parse("a..b").is_err());
        assert!(Path::parse("a.b-c").is_err());
        assert!(!valid("9leadingdigit"));
    }

    #[test]
    fn exact_match_soundness() {
        let p = Path::parse("kb1.jobs.worker").unwrap();
        assert!(p.matches(&p.exact()));

        let child = p.child("item").unwrap();
        assert!(child.matches(&p.descendants()));
        assert!(!p.matches(&p.descendants()));

        // descendants(child) must not match p itself (only strict descendants of child)
        assert!(!p.matches(&child.descendants()));
    }

    #[test]
    fn one_wildcard_matches_single_label() {
        let pattern = PathPattern::parse("kb1.*.worker").unwrap();
        assert!(pattern.matches(&Path::parse("kb1.jobs.worker").unwrap()));
        assert!(!pattern.matches(&Path::parse("kb1.jobs.sub.worker").unwrap()));
    }

    #[test]
    fn many_wildcard_matches_one_or_more_trailing_labels() {
        let pattern = PathPattern::parse("kb1.jobs.>").unwrap();
        assert!(pattern.matches(&Path::parse("kb1.jobs.worker").unwrap()));
        assert!(pattern.matches(&Path::parse("kb1.jobs.worker.sub").unwrap()));
        assert!(!pattern.matches(&Path::parse("kb1.jobs").unwrap()));
    }

    #[test]
    fn many_wildcard_must_be_final_segment() {
        assert!(PathPattern::parse("kb1.>.worker").is_err());
    }

    #[test]
    fn ancestor_walks_up() {
        let p = Path::parse("a.b.c.d").unwrap();
        assert_eq!(p.ancestor(0).unwrap(), p);
        assert_eq!(p.ancestor(2).unwrap(), Path::parse("a.b").unwrap());
        assert!(p.ancestor(4).is_err());
    }

    #[test]
    fn case_sensitive_comparison() {
        assert_ne!(Path::parse("Kb1.A").unwrap(), Path::parse("kb1.a").unwrap());
    }
}
