//! Exclusion matching shared by validation and packaging.
//!
//! Patterns follow `.provignore` semantics:
//!
//! - `*` matches any run of characters except `/`, `?` a single one
//! - `**` matches any number of path segments; a trailing `**` matches everything
//! - `[a-z]` / `[!a-z]` character classes, `\` escapes the next character
//! - a pattern also matches when it matches a leading run of the path's
//!   parent directories, so `build` excludes `build/out/app.o`
//! - `!pattern` re-includes what earlier patterns excluded; the last
//!   matching pattern wins

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("illegal exclusion pattern: \"!\"")]
    LoneExclamation,

    #[error("error in pattern ({pattern}): {reason}")]
    Invalid { pattern: String, reason: String },
}

#[derive(Debug, Clone)]
struct Pattern {
    text: String,
    negated: bool,
    regex: Regex,
    segments: usize,
}

/// Compiled, ordered exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    has_exceptions: bool,
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut has_exceptions = false;

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let (negated, body) = match raw.strip_prefix('!') {
                Some("") => return Err(PatternError::LoneExclamation),
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            has_exceptions |= negated;

            let cleaned = clean_path(body);
            let text = match cleaned.strip_prefix('/') {
                Some(rest) => rest.to_owned(),
                None => cleaned,
            };
            let regex = Regex::new(&glob_to_regex(&text)?).map_err(|e| PatternError::Invalid {
                pattern: raw.to_owned(),
                reason: e.to_string(),
            })?;

            compiled.push(Pattern {
                segments: text.split('/').count(),
                text,
                negated,
                regex,
            });
        }

        Ok(Self {
            patterns: compiled,
            has_exceptions,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` (relative to the context root, `/`-separated) is excluded.
    pub fn matches(&self, path: &str) -> bool {
        let file = clean_path(path);
        if file == "." {
            return false;
        }

        let parent = match file.rfind('/') {
            Some(idx) => &file[..idx],
            None => ".",
        };
        let parent_dirs: Vec<&str> = parent.split('/').collect();

        let mut matched = false;
        for pattern in &self.patterns {
            let mut hit = pattern.regex.is_match(&file);
            if !hit && parent != "." && pattern.segments <= parent_dirs.len() {
                let prefix = parent_dirs[..pattern.segments].join("/");
                hit = pattern.regex.is_match(&prefix);
            }
            if hit {
                matched = !pattern.negated;
            }
        }
        matched
    }

    /// Whether an excluded directory can be pruned without visiting it.
    ///
    /// False when some exception pattern could re-include a path beneath
    /// `dir`; the walk then descends without emitting `dir` itself.
    pub fn can_skip_dir(&self, dir: &str) -> bool {
        if !self.has_exceptions {
            return true;
        }
        let dir_slash = format!("{}/", clean_path(dir));
        !self
            .patterns
            .iter()
            .filter(|p| p.negated)
            .any(|p| could_match_under(&p.text, &dir_slash))
    }
}

fn could_match_under(pattern: &str, dir_slash: &str) -> bool {
    match pattern.find(['*', '?', '[', '\\']) {
        Some(idx) => {
            let literal = &pattern[..idx];
            literal.starts_with(dir_slash) || dir_slash.starts_with(literal)
        }
        None => format!("{pattern}/").starts_with(dir_slash),
    }
}

fn glob_to_regex(pattern: &str) -> Result<String, PatternError> {
    let invalid = |reason: &str| PatternError::Invalid {
        pattern: pattern.to_owned(),
        reason: reason.to_owned(),
    };

    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                    }
                    if chars.peek().is_none() {
                        re.push_str(".*");
                    } else {
                        re.push_str("(.*/)?");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                while let Some(c) = chars.next() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                            re.push_str(&regex::escape(&escaped.to_string()));
                        }
                        '[' | '&' | '~' => {
                            re.push('\\');
                            re.push(c);
                        }
                        _ => re.push(c),
                    }
                    empty = false;
                }
                if !closed {
                    return Err(invalid("unterminated character class"));
                }
                re.push(']');
            }
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                None => re.push_str(r"\\"),
            },
            _ => re.push_str(&regex::escape(&ch.to_string())),
        }
    }

    re.push('$');
    Ok(re)
}

/// Lexically clean a `/`-separated path: collapse repeated separators,
/// drop `.` segments and resolve `..` against preceding segments.
/// An empty result becomes `.`.
pub fn clean_path(path: &str) -> String {
    let normalized;
    let path = if cfg!(windows) {
        normalized = path.replace('\\', "/");
        normalized.as_str()
    } else {
        path
    };

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}
