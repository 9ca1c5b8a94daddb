//! Pattern-match providers.
//!
//! A pattern is template text in which variables have been rewritten to
//! holes: `:[name]` binds the text it covers to `name` and `:[_]` matches
//! anything without binding it. Holes only cover text with balanced
//! parentheses and whole quoted strings.

use crate::error::{WeaverError, WeaverResult};
use serde_derive::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// One match of a pattern in some input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Match {
    /// The matched input text.
    pub matched: String,
    /// The variables bound by the match, in pattern order.
    #[serde(default)]
    pub environment: Vec<Binding>,
}

/// A variable bound by a [`Match`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Binding {
    pub variable: String,
    pub value: String,
}

/// Something that can find the matches of a pattern in a text.
pub trait PatternMatcher {
    /// Find all non-overlapping matches of `pattern` in `input`, left to
    /// right.
    fn find(&self, pattern: &str, input: &str) -> WeaverResult<Vec<Match>>;
}

/// Run `matcher`, except for integer patterns which only match an equal
/// input.
pub(crate) fn execute(matcher: &dyn PatternMatcher, pattern: &str, input: &str) -> WeaverResult<Vec<Match>> {
    if pattern.parse::<i64>().is_ok() {
        if pattern == input {
            return Ok(vec![Match {
                matched: input.to_string(),
                environment: Vec::new(),
            }]);
        }
        return Ok(Vec::new());
    }
    matcher.find(pattern, input)
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Space,
    Hole(Option<String>),
}

fn compile(pattern: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            if segments.last() != Some(&Segment::Space) {
                segments.push(Segment::Space);
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if let Some(hole) = rest.strip_prefix(":[") {
            if let Some(end) = hole.find(']') {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let name = &hole[..end];
                segments.push(Segment::Hole((name != "_").then(|| name.to_string())));
                rest = &hole[end + 1..];
                continue;
            }
        }
        literal.push(c);
        rest = &rest[c.len_utf8()..];
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn is_word(c: u8) -> bool {
    !c.is_ascii_whitespace() && c != b'(' && c != b')'
}

/// The in-process matcher.
///
/// Whitespace in the pattern matches any run of whitespace, or none next to
/// a parenthesis. Holes are lazy, except a trailing hole which extends to the
/// end of the enclosing parenthesis level. A variable used twice must bind
/// the same text both times. Matches start and end on token boundaries.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralMatcher;

impl PatternMatcher for StructuralMatcher {
    fn find(&self, pattern: &str, input: &str) -> WeaverResult<Vec<Match>> {
        let segments = compile(pattern);
        if segments.is_empty() {
            return Ok(Vec::new());
        }
        let src = input.as_bytes();
        let mut matches = Vec::new();
        let mut start = 0;
        while start < src.len() {
            let on_boundary = start == 0 || !is_word(src[start - 1]) || !is_word(src[start]);
            let mut state = MatchState {
                src,
                bindings: Vec::new(),
            };
            let end = if on_boundary && input.is_char_boundary(start) {
                state.match_at(&segments, start)
            } else {
                None
            };
            match end {
                Some(end) if end > start => {
                    log::trace!("pattern `{pattern}` matched at {start}..{end}");
                    matches.push(Match {
                        matched: input[start..end].to_string(),
                        environment: state
                            .bindings
                            .into_iter()
                            .map(|(variable, value)| Binding { variable, value })
                            .collect(),
                    });
                    start = end;
                }
                _ => start += 1,
            }
        }
        Ok(matches)
    }
}

struct MatchState<'a> {
    src: &'a [u8],
    bindings: Vec<(String, String)>,
}

impl MatchState<'_> {
    fn text(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.src[start..end]).into_owned()
    }

    fn bound(&self, name: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn at_end(&self, end: usize) -> bool {
        end == 0 || end == self.src.len() || !is_word(self.src[end - 1]) || !is_word(self.src[end])
    }

    fn match_at(&mut self, segments: &[Segment], pos: usize) -> Option<usize> {
        let Some((segment, rest)) = segments.split_first() else {
            return self.at_end(pos).then_some(pos);
        };
        match segment {
            Segment::Literal(lit) => {
                if self.src[pos..].starts_with(lit.as_bytes()) {
                    self.match_at(rest, pos + lit.len())
                } else {
                    None
                }
            }
            Segment::Space => {
                let n = self.src[pos..]
                    .iter()
                    .take_while(|c| c.is_ascii_whitespace())
                    .count();
                let tight = pos == 0
                    || pos == self.src.len()
                    || self.src[pos - 1] == b'('
                    || self.src[pos] == b')';
                if n == 0 && !tight {
                    return None;
                }
                self.match_at(rest, pos + n)
            }
            Segment::Hole(Some(name)) if self.bound(name).is_some() => {
                let value = self.bound(name).unwrap_or_default().to_string();
                if self.src[pos..].starts_with(value.as_bytes()) {
                    self.match_at(rest, pos + value.len())
                } else {
                    None
                }
            }
            Segment::Hole(name) => {
                if rest.is_empty() {
                    let end = self.level_end(pos);
                    if let Some(name) = name {
                        let value = self.text(pos, end);
                        self.bindings.push((name.clone(), value));
                    }
                    return Some(end);
                }
                let mut end = pos;
                loop {
                    let mark = self.bindings.len();
                    if let Some(name) = name {
                        let value = self.text(pos, end);
                        self.bindings.push((name.clone(), value));
                    }
                    if let Some(found) = self.match_at(rest, end) {
                        return Some(found);
                    }
                    self.bindings.truncate(mark);
                    end = self.next_unit(end)?;
                }
            }
        }
    }

    /// Position just after the balanced unit starting at `pos`, or `None` at
    /// the end of the current level.
    fn next_unit(&self, pos: usize) -> Option<usize> {
        let c = *self.src.get(pos)?;
        match c {
            b')' => None,
            b'(' => {
                let mut depth = 0usize;
                let mut i = pos;
                while i < self.src.len() {
                    match self.src[i] {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some(i + 1);
                            }
                        }
                        q @ (b'"' | b'\'' | b'`') => i = self.quote_end(i, q)? - 1,
                        _ => {}
                    }
                    i += 1;
                }
                None
            }
            b'"' | b'\'' | b'`' => self.quote_end(pos, c),
            _ => {
                let mut i = pos + 1;
                while self.src.get(i).is_some_and(|b| b & 0xc0 == 0x80) {
                    i += 1;
                }
                Some(i)
            }
        }
    }

    fn quote_end(&self, pos: usize, quote: u8) -> Option<usize> {
        let mut i = pos + 1;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => i += 1,
                c if c == quote => return Some(i + 1),
                _ => {}
            }
            i += 1;
        }
        None
    }

    fn level_end(&self, pos: usize) -> usize {
        let mut end = pos;
        while let Some(next) = self.next_unit(end) {
            end = next;
        }
        end
    }
}

/// A matcher backed by a comby-compatible executable.
///
/// The input is written to a file in a fresh temporary directory and the
/// executable is asked for JSON lines describing the matches.
#[derive(Clone, Debug)]
pub struct ExternalMatcher {
    program: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    matches: Vec<Match>,
}

impl ExternalMatcher {
    /// Use the `comby` executable found on the `PATH`.
    pub fn new(timeout: Duration) -> Self {
        ExternalMatcher {
            program: PathBuf::from("comby"),
            timeout,
        }
    }

    /// Use another executable with the same command line interface.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl PatternMatcher for ExternalMatcher {
    fn find(&self, pattern: &str, input: &str) -> WeaverResult<Vec<Match>> {
        let dir = tempfile::tempdir()?;
        let mut file = tempfile::Builder::new().tempfile_in(dir.path())?;
        file.write_all(input.as_bytes())?;
        file.flush()?;

        let timeout = self.timeout.as_secs().max(1).to_string();
        log::debug!("running {} for pattern `{pattern}`", self.program.display());
        let output = Command::new(&self.program)
            .args([pattern, "", "-match-only", "-timeout", &timeout])
            .args(["-matcher", ".s", "-json-lines", "-d"])
            .arg(dir.path())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()?;
        if !output.status.success() {
            return Err(WeaverError::Matcher(format!(
                "`{}` exited with {}",
                self.program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut matches = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let response: Response = serde_json::from_str(line)?;
            matches.extend(response.matches);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn find(pattern: &str, input: &str) -> Vec<(String, Vec<(String, String)>)> {
        StructuralMatcher
            .find(pattern, input)
            .unwrap()
            .into_iter()
            .map(|m| {
                let env = m
                    .environment
                    .into_iter()
                    .map(|b| (b.variable, b.value))
                    .collect();
                (m.matched, env)
            })
            .collect()
    }

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn holes_bind_balanced_text() {
        let found = find("(i32.add :[a] :[b])", "(i32.add (i32.const 1) (local.get $x))");
        assert_eq!(
            found,
            vec![(
                "(i32.add (i32.const 1) (local.get $x))".to_string(),
                env(&[("a", "(i32.const 1)"), ("b", "(local.get $x)")])
            )]
        );
    }

    #[test]
    fn repeated_variables_unify() {
        assert_eq!(find("(i32.add :[a] :[a])", "(i32.add (i32.const 5) (i32.const 5))").len(), 1);
        assert!(find("(i32.add :[a] :[a])", "(i32.add (i32.const 5) (i32.const 7))").is_empty());
    }

    #[test]
    fn finds_every_occurrence() {
        let input = "(call $f (i32.const 1)) (drop) (call $g)";
        let found = find("(call :[f])", input);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, env(&[("f", "$f (i32.const 1)")]));
        assert_eq!(found[1].1, env(&[("f", "$g")]));
        let found = find("(call :[f] :[_])", input);
        assert_eq!(found[0].1, env(&[("f", "$f")]));
    }

    #[test]
    fn token_boundaries() {
        assert!(find("$f", "(call $ff)").is_empty());
        assert_eq!(find("$f", "(call $f)").len(), 1);
        assert_eq!(find("(return :[x])", "(return)").len(), 1);
    }

    #[test]
    fn trailing_hole_takes_the_rest() {
        let found = find(":[all]", "(a) (b)");
        assert_eq!(found, vec![("(a) (b)".to_string(), env(&[("all", "(a) (b)")]))]);
    }

    #[test]
    fn integer_patterns() {
        assert_eq!(execute(&StructuralMatcher, "5", "5").unwrap().len(), 1);
        assert!(execute(&StructuralMatcher, "5", "(i32.const 5)").unwrap().is_empty());
    }

    #[test]
    fn quoted_text_is_opaque() {
        let found = find("(data :[d])", r#"(data "a)b")"#);
        assert_eq!(found[0].1, env(&[("d", r#""a)b""#)]));
    }
}
