/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shell-glob file matching for source lists: a whitespace-separated
//! pattern where a leading `-` marks an exclusion token.

use std::path::Path;

use anyhow::Context as _;
use anyhow::Result;
use globset::GlobBuilder;
use globset::GlobMatcher;
use walkdir::WalkDir;

struct Token {
    negate: bool,
    bare: bool,
    matcher: GlobMatcher,
}

fn compile(pattern: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    for raw in pattern.split_whitespace() {
        let (negate, text) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let matcher = GlobBuilder::new(text)
            .literal_separator(true)
            .build()
            .with_context(|| format!("bad match pattern {:?}", text))?
            .compile_matcher();
        tokens.push(Token {
            negate,
            // tokens without a separator also match the bare file name,
            // wherever the file sits
            bare: !text.contains('/'),
            matcher,
        });
    }
    Ok(tokens)
}

fn token_matches(token: &Token, rel: &str, file_name: &str) -> bool {
    token.matcher.is_match(rel) || (token.bare && token.matcher.is_match(file_name))
}

/// Files under `base` accepted by `pattern`: at least one positive token
/// matches and no exclusion token does. Results are relative paths,
/// sorted lexicographically.
pub fn match_files(pattern: &str, base: &Path, recurse: bool) -> Result<Vec<String>> {
    let tokens = compile(pattern)?;
    let max_depth = if recurse { usize::MAX } else { 1 };
    let mut result = Vec::new();
    for entry in WalkDir::new(base)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
    {
        let rel = match entry.path().strip_prefix(base) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let accepted = tokens
            .iter()
            .any(|token| !token.negate && token_matches(token, &rel, &file_name))
            && !tokens
                .iter()
                .any(|token| token.negate && token_matches(token, &rel, &file_name));
        if accepted {
            result.push(rel);
        }
    }
    result.sort();
    Ok(result)
}

/// True if a source-list entry is a glob rather than a literal file name.
pub fn is_pattern(token: &str) -> bool {
    token.contains(['*', '?', '[']) || token.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["main.cpp", "util.cpp", "test_util.cpp", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/extra.cpp"), "").unwrap();
        dir
    }

    #[test]
    fn positive_and_negative_tokens() {
        let dir = fixture();
        let matched = match_files("*.cpp -test*", dir.path(), false).unwrap();
        assert_eq!(matched, vec!["main.cpp", "util.cpp"]);
    }

    #[test]
    fn recursion_is_opt_in() {
        let dir = fixture();
        let flat = match_files("*.cpp", dir.path(), false).unwrap();
        assert!(!flat.iter().any(|f| f.contains('/')));
        let deep = match_files("*.cpp", dir.path(), true).unwrap();
        assert!(deep.contains(&"sub/extra.cpp".to_string()));
    }

    #[test]
    fn results_are_sorted() {
        let dir = fixture();
        let matched = match_files("*.cpp *.txt", dir.path(), false).unwrap();
        let mut sorted = matched.clone();
        sorted.sort();
        assert_eq!(matched, sorted);
    }

    #[test]
    fn pattern_detection() {
        assert!(is_pattern("*.cpp"));
        assert!(is_pattern("-test*"));
        assert!(!is_pattern("main.cpp"));
    }
}
