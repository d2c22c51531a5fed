use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::access::AccessFlags;
use crate::error::BuildError;
use crate::paths::{normalize_path, SourceSearch};

/// One contiguous chunk of script source and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSegment {
    pub file: String,
    pub start_line: usize,
    pub code: String,
    pub(crate) from_disk: bool,
}

impl SourceSegment {
    pub fn new(file: impl Into<String>, start_line: usize, code: impl Into<String>) -> Self {
        Self { file: file.into(), start_line: start_line.max(1), code: code.into(), from_disk: false }
    }

    pub(crate) fn from_file(path: &Path) -> Result<Self, BuildError> {
        let code = fs::read_to_string(path).map_err(|source| BuildError::Read { path: path.to_path_buf(), source })?;
        Ok(Self { file: path.display().to_string(), start_line: 1, code, from_disk: true })
    }

    pub fn is_from_disk(&self) -> bool {
        self.from_disk
    }

    /// True when adding `file` at `start_line` would duplicate this segment.
    pub fn overlaps(&self, file: &str, start_line: usize) -> bool {
        self.file == file && self.start_line.abs_diff(start_line) <= 2
    }

    fn line_count(&self) -> usize {
        self.code.lines().count().max(1)
    }
}

#[derive(Debug, Clone)]
struct LineSpan {
    combined_start: usize,
    lines: usize,
    segment: usize,
}

/// Maps lines of the concatenated compile input back to their segments.
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    spans: Vec<LineSpan>,
    segments: Vec<SourceSegment>,
}

impl LineMap {
    /// Returns the segment file and the line inside it for a 1-based combined line.
    pub fn locate(&self, combined_line: usize) -> Option<(&str, usize)> {
        let span = self
            .spans
            .iter()
            .find(|span| combined_line >= span.combined_start && combined_line < span.combined_start + span.lines)?;
        let segment = &self.segments[span.segment];
        Some((segment.file.as_str(), segment.start_line + (combined_line - span.combined_start)))
    }

    pub fn source_line(&self, combined_line: usize) -> Option<&str> {
        let span = self
            .spans
            .iter()
            .find(|span| combined_line >= span.combined_start && combined_line < span.combined_start + span.lines)?;
        self.segments[span.segment].code.lines().nth(combined_line - span.combined_start)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|segment| segment.file.as_str())
    }
}

/// Compile input after include resolution.
#[derive(Debug)]
pub(crate) struct PreparedSource {
    pub combined: String,
    pub lines: LineMap,
    pub included: Vec<PathBuf>,
}

fn parse_include(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("#include")?;
    let rest = rest.trim();
    let inner = rest.strip_prefix('"')?.strip_suffix('"')?;
    (!inner.is_empty()).then_some(inner)
}

/// Blanks `#include "file"` lines and appends each included file once as its own segment.
pub(crate) fn prepare(segments: &[SourceSegment], search: &SourceSearch) -> Result<PreparedSource, BuildError> {
    if segments.is_empty() {
        return Err(BuildError::Empty);
    }
    let mut seen: HashSet<PathBuf> = segments
        .iter()
        .filter(|segment| segment.from_disk)
        .map(|segment| normalize_path(Path::new(&segment.file)))
        .collect();
    let mut queue: VecDeque<SourceSegment> = segments.iter().cloned().collect();
    let mut processed = Vec::new();
    let mut included = Vec::new();

    while let Some(mut segment) = queue.pop_front() {
        let mut code = String::with_capacity(segment.code.len());
        for (offset, line) in segment.code.lines().enumerate() {
            match parse_include(line) {
                Some(target) => {
                    let including = Path::new(&segment.file);
                    let resolved = search.resolve_include(target, including).ok_or_else(|| BuildError::Include {
                        file: segment.file.clone(),
                        line: segment.start_line + offset,
                        target: target.to_string(),
                    })?;
                    let normalized = normalize_path(&resolved);
                    if seen.insert(normalized.clone()) {
                        queue.push_back(SourceSegment::from_file(&resolved)?);
                        included.push(normalized);
                    }
                }
                None => code.push_str(line),
            }
            code.push('\n');
        }
        segment.code = code;
        processed.push(segment);
    }

    let mut combined = String::new();
    let mut spans = Vec::with_capacity(processed.len());
    let mut next_line = 1;
    for (index, segment) in processed.iter().enumerate() {
        let lines = segment.line_count();
        spans.push(LineSpan { combined_start: next_line, lines, segment: index });
        combined.push_str(&segment.code);
        if !segment.code.ends_with('\n') {
            combined.push('\n');
        }
        next_line += lines;
    }
    Ok(PreparedSource { combined, lines: LineMap { spans, segments: processed }, included })
}

/// Names of every function called in `code`, with the 1-based line of the first call.
pub(crate) fn called_functions(code: &str) -> HashMap<String, usize> {
    let mut calls = HashMap::new();
    let chars: Vec<char> = code.chars().collect();
    let mut line = 1;
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        match ch {
            '\n' => {
                line += 1;
                index += 1;
            }
            '/' if chars.get(index + 1) == Some(&'/') => {
                while index < chars.len() && chars[index] != '\n' {
                    index += 1;
                }
            }
            '/' if chars.get(index + 1) == Some(&'*') => {
                index += 2;
                while index < chars.len() && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/')) {
                    if chars[index] == '\n' {
                        line += 1;
                    }
                    index += 1;
                }
                index += 2;
            }
            '"' | '`' | '\'' => {
                let quote = ch;
                index += 1;
                while index < chars.len() && chars[index] != quote {
                    if chars[index] == '\\' {
                        index += 1;
                    } else if chars[index] == '\n' {
                        line += 1;
                    }
                    index += 1;
                }
                index += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = index;
                while index < chars.len() && (chars[index].is_alphanumeric() || chars[index] == '_') {
                    index += 1;
                }
                let mut lookahead = index;
                while lookahead < chars.len() && (chars[lookahead] == ' ' || chars[lookahead] == '\t') {
                    lookahead += 1;
                }
                if chars.get(lookahead) == Some(&'(') {
                    let name: String = chars[start..index].iter().collect();
                    calls.entry(name).or_insert(line);
                }
            }
            _ => index += 1,
        }
    }
    calls
}

/// First direct call to a function that needs access the module was not granted. Calls
/// reached any other way are refused at run time by [`AccessGrants`](crate::access::AccessGrants).
pub(crate) fn check_access(
    prepared: &PreparedSource,
    granted: AccessFlags,
    restricted: &HashMap<String, AccessFlags>,
) -> Result<(), BuildError> {
    let mut violations: Vec<(usize, &String, AccessFlags)> = called_functions(&prepared.combined)
        .into_iter()
        .filter_map(|(name, line)| {
            let (key, required) = restricted.get_key_value(&name)?;
            (!granted.contains(*required)).then_some((line, key, *required))
        })
        .collect();
    violations.sort_by_key(|(line, _, _)| *line);
    match violations.first() {
        Some((line, function, required)) => {
            let (file, file_line) = prepared.lines.locate(*line).unwrap_or(("<unknown>", *line));
            Err(BuildError::Access {
                file: file.to_string(),
                line: file_line,
                function: function.to_string(),
                required: (*required - granted).to_string(),
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overlap_is_two_lines_either_side() {
        let segment = SourceSegment::new("a.rhai", 10, "");
        assert!(segment.overlaps("a.rhai", 11));
        assert!(segment.overlaps("a.rhai", 8));
        assert!(!segment.overlaps("a.rhai", 13));
        assert!(!segment.overlaps("b.rhai", 10));
    }

    #[test]
    fn line_map_points_back_into_segments() {
        let segments = vec![
            SourceSegment::new("first.rhai", 1, "fn a() {}\nfn b() {}"),
            SourceSegment::new("second.rhai", 20, "fn c() {\n  x\n}"),
        ];
        let prepared = prepare(&segments, &SourceSearch::new(Vec::new(), "rhai")).unwrap();
        assert_eq!(prepared.lines.locate(2), Some(("first.rhai", 2)));
        assert_eq!(prepared.lines.locate(3), Some(("second.rhai", 20)));
        assert_eq!(prepared.lines.locate(4), Some(("second.rhai", 21)));
        assert_eq!(prepared.lines.source_line(4), Some("  x"));
        assert_eq!(prepared.lines.locate(99), None);
    }

    #[test]
    fn includes_are_appended_once_and_blanked() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shared.rhai"), "fn shared() { 1 }").unwrap();
        let main = dir.path().join("main.rhai");
        fs::write(&main, "#include \"shared.rhai\"\n#include \"shared.rhai\"\nfn main() { shared() }").unwrap();
        let segment = SourceSegment::from_file(&main).unwrap();
        let prepared = prepare(&[segment], &SourceSearch::new(Vec::new(), "rhai")).unwrap();
        assert_eq!(prepared.included.len(), 1);
        assert!(prepared.combined.starts_with("\n\nfn main()"));
        assert!(prepared.combined.contains("fn shared()"));
        let (file, line) = prepared.lines.locate(4).unwrap();
        assert!(file.ends_with("shared.rhai"));
        assert_eq!(line, 1);
    }

    #[test]
    fn missing_include_fails() {
        let segments = vec![SourceSegment::new("inline", 5, "\n#include \"nowhere.rhai\"")];
        let err = prepare(&segments, &SourceSearch::new(Vec::new(), "rhai")).unwrap_err();
        assert!(matches!(err, BuildError::Include { line: 6, .. }));
    }

    #[test]
    fn call_scan_skips_comments_and_strings() {
        let calls = called_functions("// read_text_file(\"x\")\nlet s = \"log(\";\nfoo (1);\n/* bar() */ obj.baz(2)");
        assert!(calls.contains_key("foo"));
        assert!(calls.contains_key("baz"));
        assert!(!calls.contains_key("read_text_file"));
        assert!(!calls.contains_key("log"));
        assert!(!calls.contains_key("bar"));
        assert_eq!(calls["baz"], 4);
    }

    #[test]
    fn restricted_calls_fail_the_access_check() {
        let segments = vec![SourceSegment::new("io.rhai", 1, "fn main() {\n  read_text_file(\"a\")\n}")];
        let prepared = prepare(&segments, &SourceSearch::new(Vec::new(), "rhai")).unwrap();
        let restricted = HashMap::from([("read_text_file".to_string(), AccessFlags::FULL_FILE_SYSTEM)]);
        let err = check_access(&prepared, AccessFlags::default_module(), &restricted).unwrap_err();
        assert!(matches!(err, BuildError::Access { line: 2, .. }));
        assert!(check_access(&prepared, AccessFlags::all(), &restricted).is_ok());
    }
}
