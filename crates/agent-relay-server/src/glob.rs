//! Manifest path globs.
//!
//! A requested glob is split into a literal directory prefix, which narrows
//! the tree walk, and a residual pattern matched against every entry under
//! that prefix. Matching follows doublestar rules: `*` and `?` never cross a
//! `/`, `**` spans directories, `{a,b}` lists alternatives and `\` escapes
//! the next character.

use agent_relay_core::FetchError;
use glob::{MatchOptions, Pattern};

/// Characters with a special meaning in a glob.
const META_CHARS: &[char] = &['\\', '*', '?', '[', ']', '{', '}'];

/// Upper bound on the alternatives a single glob expands to.
const MAX_ALTERNATIVES: usize = 1024;

/// Repository root, as understood by tree fetchers.
pub const REPOSITORY_ROOT: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobDecomposition {
    /// Directory to walk, `.` for the repository root
    pub prefix: String,
    /// Whether the walk must descend into subdirectories of `prefix`
    pub recursive: bool,
    /// Pattern entries under `prefix` are matched against
    pub residual: String,
}

/// Split `glob` into a literal directory prefix and the pattern that remains.
///
/// `recursive` errs on the side of walking too much: any `/` or `[` left in
/// the residual forces a recursive walk, since a character class may match
/// a separator.
pub fn decompose(glob: &str) -> GlobDecomposition {
    let split = glob
        .strip_prefix('/')
        .and_then(split_literal_prefix)
        .or_else(|| split_literal_prefix(glob));

    let (prefix, residual) = match split {
        Some((prefix, residual)) => (prefix.to_string(), residual.to_string()),
        None => (
            REPOSITORY_ROOT.to_string(),
            glob.strip_prefix('/').unwrap_or(glob).to_string(),
        ),
    };

    let recursive = residual.contains(['[', '/']) || residual.contains("**");

    GlobDecomposition {
        prefix,
        recursive,
        residual,
    }
}

/// Longest run free of glob metacharacters that ends right before a `/`.
fn split_literal_prefix(s: &str) -> Option<(&str, &str)> {
    let literal_len = s.find(META_CHARS).unwrap_or(s.len());
    match s[..literal_len].rfind('/') {
        Some(slash) if slash > 0 => Some((&s[..slash], &s[slash + 1..])),
        _ => None,
    }
}

/// Compiled residual pattern.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    alternatives: Vec<Pattern>,
}

impl GlobMatcher {
    pub fn new(glob: &str) -> Result<Self, FetchError> {
        let fail = |reason: String| FetchError::GlobMatchFailed {
            glob: glob.to_string(),
            reason,
        };

        let alternatives = expand_braces(glob)
            .map_err(fail)?
            .iter()
            .map(|alt| Pattern::new(&translate(alt)).map_err(|e| fail(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { alternatives })
    }

    pub fn matches(&self, path: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.alternatives
            .iter()
            .any(|p| p.matches_with(path, options))
    }
}

/// Expand `{a,b}` alternatives, including nested ones, into plain patterns.
fn expand_braces(glob: &str) -> Result<Vec<String>, String> {
    let mut done = Vec::new();
    let mut pending = vec![glob.to_string()];

    while let Some(pattern) = pending.pop() {
        let Some((open, close)) = find_brace_group(&pattern)? else {
            done.push(pattern);
            continue;
        };

        let head = &pattern[..open];
        let tail = &pattern[close + 1..];
        for alt in split_alternatives(&pattern[open + 1..close]) {
            pending.push(format!("{}{}{}", head, alt, tail));
        }
        if done.len() + pending.len() > MAX_ALTERNATIVES {
            return Err(format!(
                "pattern expands to more than {} alternatives",
                MAX_ALTERNATIVES
            ));
        }
    }

    // Popping reverses the order; keep alternatives in the order written
    done.reverse();
    Ok(done)
}

/// Byte offsets of the first top-level `{` and its matching `}`.
fn find_brace_group(pattern: &str) -> Result<Option<(usize, usize)>, String> {
    let mut open = None;
    let mut depth = 0usize;
    let mut in_class = false;
    let mut chars = pattern.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '{' if !in_class => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' if !in_class && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = open {
                        return Ok(Some((start, i)));
                    }
                }
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err("unclosed '{'".to_string());
    }
    Ok(None)
}

/// Split the inside of a brace group on its top-level commas.
fn split_alternatives(group: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_class = false;
    let mut start = 0;
    let mut chars = group.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '{' if !in_class => depth += 1,
            '}' if !in_class => depth = depth.saturating_sub(1),
            ',' if !in_class && depth == 0 => {
                parts.push(&group[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&group[start..]);
    parts
}

/// Rewrite doublestar syntax the `glob` crate spells differently: `\x`
/// escapes become single-character classes and `[^...]` becomes `[!...]`.
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) => {
                    out.push('[');
                    out.push(escaped);
                    out.push(']');
                }
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            _ => out.push(c),
        }
    }
    out
}
