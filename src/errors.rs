// File: src/errors.rs
//
// Error reporting for the Lumen language. Two tiers, matching spec.md §7:
// `CompileError` (one per bad token, collected across a whole compile) and
// `RuntimeError` (one per failed run, carrying a frame-by-frame trace).
// Wire wording follows the original this was distilled from bit-for-bit
// (`[line N] Error at '...': msg`, `[line N] in name()`); presentation
// (color, bold headers) follows the teacher's `RuffError`.

use colored::Colorize;
use std::fmt;

use crate::scanner::{Token, TokenKind};

/// A single diagnostic produced while compiling. The compiler keeps going
/// after one of these (panic-mode recovery, spec.md §4.F) so a run can
/// surface more than one.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    /// Mirrors `errorAt`: the location suffix depends on whether the
    /// offending token is EOF, an in-band scanner ERROR token (message
    /// already is the whole story), or an ordinary token.
    pub fn at(token: &Token, message: impl Into<String>) -> Self {
        let message = message.into();
        let where_clause = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        CompileError { line: token.line, message: format!("{where_clause}: {message}") }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [line {}] Error{}",
            "error:".red().bold(),
            self.line,
            self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// One entry of a runtime stack trace: `[line N] in fnName()` (or
/// `script` for the top-level frame).
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub function_name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            None => write!(f, "[line {}] in script", self.line),
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
        }
    }
}

/// A failure raised by the VM while running already-compiled bytecode
/// (spec.md §7, §4.H "Runtime errors").
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), trace: Vec::new() }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message.bold())?;
        for frame in self.trace.iter().rev() {
            writeln!(f, "{}", frame.to_string().bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Computes the Levenshtein distance between two strings, used to suggest
/// a likely-intended global name on an undefined-variable error.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Closest candidate within edit distance 3, or `None`. Used to spell out a
/// "did you mean 'x'?" hint in the REPL, never in the wire-format error
/// message itself.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (c.as_str(), levenshtein_distance(target, c)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by_key(|(_, dist)| *dist)
        .map(|(c, _)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_token_reports_at_end() {
        let token = Token { kind: TokenKind::Eof, lexeme: "", line: 3 };
        let err = CompileError::at(&token, "Expect expression.");
        assert_eq!(err.message, " at end: Expect expression.");
    }

    #[test]
    fn ordinary_token_quotes_its_lexeme() {
        let token = Token { kind: TokenKind::Identifier, lexeme: "foo", line: 1 };
        let err = CompileError::at(&token, "Undefined variable 'foo'.");
        assert_eq!(err.message, " at 'foo': Undefined variable 'foo'.");
    }

    #[test]
    fn closest_match_ignores_distant_candidates() {
        let candidates = vec!["clock".to_string(), "zzzzzzzzzz".to_string()];
        assert_eq!(find_closest_match("clocc", &candidates), Some("clock"));
        assert_eq!(find_closest_match("totally_unrelated_name", &candidates), None);
    }
}
