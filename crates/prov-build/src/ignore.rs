use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use prov_core::IGNORE_FILE_NAME;

use crate::pattern::clean_path;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Reads a `.provignore` stream into its ordered list of patterns.
///
/// A UTF-8 BOM is stripped from the first line only. Lines starting with
/// `#` are comments; remaining lines are trimmed, blank ones dropped, and
/// each pattern is cleaned to its shortest `/`-separated form.
/// A missing reader yields no patterns.
pub fn read_all<R: Read>(reader: Option<R>) -> Result<Vec<String>, IgnoreError> {
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };

    let mut excludes = Vec::new();
    for (index, line) in BufReader::new(reader).split(b'\n').enumerate() {
        let mut bytes = line.map_err(|e| IgnoreError::Read { source: e })?;
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let mut line: &[u8] = &bytes;
        if index == 0
            && let Some(rest) = line.strip_prefix(UTF8_BOM)
        {
            line = rest;
        }

        let text = String::from_utf8_lossy(line);
        if text.starts_with('#') {
            continue;
        }
        let pattern = text.trim();
        if pattern.is_empty() {
            continue;
        }
        let pattern = clean_path(pattern);
        if pattern.starts_with('#') {
            continue;
        }
        excludes.push(pattern);
    }

    Ok(excludes)
}

/// Loads `.provignore` from the root of `context_dir`, if present.
pub fn load(context_dir: &Path) -> Result<Vec<String>, IgnoreError> {
    let path = context_dir.join(IGNORE_FILE_NAME);
    let file = match std::fs::File::open(&path) {
        Ok(file) => Some(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(IgnoreError::Open { path, source: e }),
    };

    let excludes = read_all(file)?;
    tracing::debug!(path = %path.display(), patterns = excludes.len(), "ignore file loaded");
    Ok(excludes)
}

#[derive(Debug, thiserror::Error)]
pub enum IgnoreError {
    #[error("failed to open {path}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error reading .provignore")]
    Read { source: std::io::Error },
    #[error(transparent)]
    Pattern(#[from] crate::pattern::PatternError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Vec<String> {
        read_all(Some(input.as_bytes())).unwrap()
    }

    #[test]
    fn comments_and_blank_lines_are_dropped() {
        assert_eq!(parse("\n#comment\nbuild/\n"), vec!["build"]);
    }

    #[test]
    fn patterns_are_trimmed_and_cleaned() {
        assert_eq!(
            parse("  ./src//gen/  \r\nnode_modules\n  \n*.log\n"),
            vec!["src/gen", "node_modules", "*.log"]
        );
    }

    #[test]
    fn order_is_preserved() {
        assert_eq!(parse("b\na\n!a/keep\n"), vec!["b", "a", "!a/keep"]);
    }

    #[test]
    fn leading_bom_is_stripped() {
        assert_eq!(parse("\u{feff}target\n"), vec!["target"]);
        assert_eq!(parse("\u{feff}# comment\nx\n"), vec!["x"]);
    }

    #[test]
    fn bom_after_first_line_is_kept() {
        assert_eq!(parse("a\n\u{feff}b\n"), vec!["a", "\u{feff}b"]);
    }

    #[test]
    fn indented_comment_is_dropped() {
        assert_eq!(parse("   # not a pattern\nkeep\n"), vec!["keep"]);
    }

    #[test]
    fn missing_reader_yields_nothing() {
        assert!(read_all::<&[u8]>(None).unwrap().is_empty());
    }

    #[test]
    fn read_failure_surfaces_as_ignore_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk on fire"))
            }
        }
        let err = read_all(Some(Broken)).unwrap_err();
        assert!(matches!(err, IgnoreError::Read { .. }));
    }

    #[test]
    fn load_without_file_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load(tmp.path()).unwrap().is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn no_pattern_starts_with_hash(input in "(\u{feff})?([ #a-z/.\r]{0,12}\n){0,8}") {
                for pattern in parse(&input) {
                    prop_assert!(!pattern.starts_with('#'), "got {pattern:?}");
                    prop_assert!(!pattern.is_empty());
                }
            }

            #[test]
            fn only_first_line_loses_bom(first in "[a-z]{1,6}", second in "[a-z]{1,6}") {
                let input = format!("\u{feff}{first}\n\u{feff}{second}\n");
                prop_assert_eq!(parse(&input), vec![first, format!("\u{feff}{second}")]);
            }
        }
    }
}
