//! Python tokenizer used by the policy evaluator.
//!
//! Produces a flat token stream with `NEWLINE`, `INDENT` and `DEDENT`
//! markers, the same shape CPython's tokenizer emits. Only as much of the
//! grammar is understood as the policy needs; everything else is carried as
//! opaque operator, number, or string tokens. Replacement fields inside
//! f-strings are tokenized recursively so that code hidden in `f"{...}"` is
//! still visible to the policy.
//!
//! Identifiers are NFKC-normalized as they are read, the same way the
//! interpreter normalizes them, so `ｅxec` is seen as `exec`.
//!
//! Structural errors (unterminated strings, unbalanced brackets,
//! inconsistent indentation) are reported as [`ParseError`]s.

use std::fmt;

use unicode_normalization::UnicodeNormalization;

/// A syntax error found while tokenizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Op(&'static str),
    Number,
    /// A string literal. For f-strings, holds the tokens of each
    /// replacement-field expression in order.
    Str { fields: Vec<Vec<Token>> },
    Newline,
    Indent,
    Dedent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        matches!(self.kind, TokenKind::Op(o) if o == op)
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }
}

/// Operators, longest first so that prefix matching picks the longest.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "@=", "**", "//", "<<", ">>", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "=", ".", ",", ":", ";", "(", ")", "[", "]", "{", "}",
];

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

const TAB_SIZE: usize = 8;

/// Tokenize a complete module.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source, 1, false).run()
}

/// Tokenize an expression fragment (an f-string replacement field). Newlines
/// are insignificant and no indentation tokens are produced.
fn tokenize_fragment(source: &str, first_line: usize) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source, first_line, true).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    fragment: bool,
    tokens: Vec<Token>,
    brackets: Vec<(char, usize)>,
    indents: Vec<usize>,
    /// The previous logical line ended with `:` and opened a block.
    expect_block: Option<usize>,
}

impl Lexer {
    fn new(source: &str, first_line: usize, fragment: bool) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: first_line,
            fragment,
            tokens: Vec::new(),
            brackets: Vec::new(),
            indents: vec![0],
            expect_block: None,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, line: usize) {
        self.tokens.push(Token { kind, line });
    }

    fn in_logical_line(&self) -> bool {
        !matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut at_line_start = !self.fragment;

        while self.pos < self.chars.len() {
            if at_line_start {
                at_line_start = false;
                if !self.handle_indentation()? {
                    continue;
                }
            }

            let Some(c) = self.peek(0) else { break };
            match c {
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '#' => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '\\' => {
                    // Explicit line continuation.
                    match (self.peek(1), self.peek(2)) {
                        (Some('\n'), _) => self.pos += 2,
                        (Some('\r'), Some('\n')) => self.pos += 3,
                        (Some('\r'), _) => self.pos += 2,
                        (None, _) => {
                            return Err(ParseError::new(
                                self.line,
                                "unexpected EOF after line continuation",
                            ));
                        }
                        _ => {
                            return Err(ParseError::new(
                                self.line,
                                "unexpected character after line continuation character",
                            ));
                        }
                    }
                    self.line += 1;
                }
                '\n' | '\r' => {
                    self.consume_newline();
                    if self.fragment || !self.brackets.is_empty() {
                        continue;
                    }
                    if self.in_logical_line() {
                        self.end_logical_line();
                    }
                    at_line_start = true;
                }
                '\'' | '"' => self.string("")?,
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.number(),
                c if is_name_char(c) => self.name_or_prefixed_string()?,
                _ => self.operator()?,
            }
        }

        if let Some(&(open, line)) = self.brackets.last() {
            return Err(ParseError::new(line, format!("'{open}' was never closed")));
        }
        if !self.fragment {
            if self.in_logical_line() {
                self.end_logical_line();
            }
            if let Some(line) = self.expect_block {
                return Err(ParseError::new(line, "expected an indented block"));
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.push(TokenKind::Dedent, self.line);
            }
        }
        Ok(self.tokens)
    }

    fn consume_newline(&mut self) {
        if self.peek(0) == Some('\r') && self.peek(1) == Some('\n') {
            self.pos += 2;
        } else {
            self.pos += 1;
        }
        self.line += 1;
    }

    fn end_logical_line(&mut self) {
        let opens_block = self.tokens.last().is_some_and(|t| t.is_op(":"));
        let line = self.tokens.last().map_or(self.line, |t| t.line);
        self.push(TokenKind::Newline, line);
        if opens_block {
            self.expect_block = Some(line);
        }
    }

    /// Measure the indentation of a new physical line and emit INDENT/DEDENT
    /// tokens. Blank and comment-only lines are skipped entirely. Returns
    /// `false` when the end of input is reached first.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let width = loop {
            let mut width = 0;
            while let Some(c) = self.peek(0) {
                match c {
                    ' ' => width += 1,
                    '\t' => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                    '\x0c' => width = 0,
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek(0) {
                None => return Ok(false),
                Some('#' | '\n' | '\r') => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                    if self.peek(0).is_some() {
                        self.consume_newline();
                    }
                }
                _ => break width,
            }
        };

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            if self.expect_block.take().is_none() {
                return Err(ParseError::new(self.line, "unexpected indent"));
            }
            self.indents.push(width);
            self.push(TokenKind::Indent, self.line);
        } else {
            if let Some(line) = self.expect_block {
                return Err(ParseError::new(line, "expected an indented block"));
            }
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(TokenKind::Dedent, self.line);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(ParseError::new(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(true)
    }

    fn number(&mut self) {
        let line = self.line;
        let mut prev = '\0';
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-') && matches!(prev, 'e' | 'E');
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                prev = c;
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, line);
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if is_name_char(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(0), Some('\'' | '"')) {
            let lower = raw.to_ascii_lowercase();
            if STRING_PREFIXES.contains(&lower.as_str()) {
                return self.string(&lower);
            }
        }

        let line = self.line;
        let word: String = raw.nfkc().collect();
        if !is_identifier(&word) {
            return Err(ParseError::new(
                line,
                format!("invalid character in identifier '{raw}'"),
            ));
        }
        self.push(TokenKind::Name(word), line);
        Ok(())
    }

    fn string(&mut self, prefix: &str) -> Result<(), ParseError> {
        let start_line = self.line;
        let Some(quote) = self.peek(0) else {
            return Ok(());
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let body_start = self.pos;
        let body_end;
        loop {
            let Some(c) = self.peek(0) else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(ParseError::new(start_line, message));
            };
            match c {
                '\\' => {
                    // Escapes (and, in raw strings, the backslash-quote pair)
                    // never terminate the literal.
                    if matches!(self.peek(1), Some('\n')) {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                '\n' | '\r' if !triple => {
                    return Err(ParseError::new(start_line, "unterminated string literal"));
                }
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        body_end = self.pos;
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        body_end = self.pos;
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }

        let fields = if prefix.contains('f') {
            let body: Vec<char> = self.chars[body_start..body_end.min(self.chars.len())].to_vec();
            fstring_fields(&body, start_line, prefix.contains('r'))?
        } else {
            Vec::new()
        };
        self.push(TokenKind::Str { fields }, start_line);
        Ok(())
    }

    fn operator(&mut self) -> Result<(), ParseError> {
        let line = self.line;
        let op = OPERATORS.iter().copied().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, oc)| self.peek(i) == Some(oc))
        });
        let Some(op) = op else {
            let c = self.peek(0).unwrap_or('?');
            return Err(ParseError::new(line, format!("invalid character '{c}'")));
        };
        self.pos += op.chars().count();

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, line));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                let expected = match close {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    None => return Err(ParseError::new(line, format!("unmatched '{close}'"))),
                    Some((open, _)) if open != expected => {
                        return Err(ParseError::new(
                            line,
                            format!(
                                "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                            ),
                        ));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }

        self.push(TokenKind::Op(op), line);
        Ok(())
    }
}

/// Characters read as part of a name. Anything outside ASCII is taken and
/// judged after normalization.
fn is_name_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric() || !c.is_ascii()
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next().is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

// ── f-strings ──────────────────────────────────────────────────────

/// Extract and tokenize the replacement-field expressions of an f-string body.
fn fstring_fields(body: &[char], first_line: usize, raw: bool) -> Result<Vec<Vec<Token>>, ParseError> {
    let mut fields = Vec::new();
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            '{' if body.get(i + 1) == Some(&'{') => i += 2,
            '{' => i = replacement_field(body, i + 1, first_line, &mut fields)?,
            '}' if body.get(i + 1) == Some(&'}') => i += 2,
            '}' => {
                return Err(ParseError::new(
                    line_at(body, i, first_line),
                    "f-string: single '}' is not allowed",
                ));
            }
            '\\' if !raw && body.get(i + 1) == Some(&'N') && body.get(i + 2) == Some(&'{') => {
                // Named unicode escape: \N{...}
                i += 3;
                while i < body.len() && body[i] != '}' {
                    i += 1;
                }
                i += 1;
            }
            '\\' if !raw => i += 2,
            _ => i += 1,
        }
    }
    Ok(fields)
}

/// Parse one replacement field starting just after its `{`. Returns the
/// index just past the closing `}`.
fn replacement_field(
    body: &[char],
    start: usize,
    first_line: usize,
    fields: &mut Vec<Vec<Token>>,
) -> Result<usize, ParseError> {
    let mut depth = 0usize;
    let mut expr_end = None;
    let mut j = start;

    while j < body.len() {
        let c = body[j];
        match c {
            '\'' | '"' => {
                j += 1;
                while j < body.len() && body[j] != c {
                    if body[j] == '\\' {
                        j += 1;
                    }
                    j += 1;
                }
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '}' => {
                let end = expr_end.unwrap_or(j);
                push_field(body, start, end, first_line, fields)?;
                return Ok(j + 1);
            }
            '!' if depth == 0 && body.get(j + 1) != Some(&'=') && expr_end.is_none() => {
                expr_end = Some(j);
            }
            ':' if depth == 0 => {
                let end = expr_end.unwrap_or(j);
                push_field(body, start, end, first_line, fields)?;
                // Format spec; may itself contain nested replacement fields.
                let mut k = j + 1;
                while k < body.len() {
                    match body[k] {
                        '{' => k = replacement_field(body, k + 1, first_line, fields)?,
                        '}' => return Ok(k + 1),
                        _ => k += 1,
                    }
                }
                break;
            }
            _ => {}
        }
        j += 1;
    }

    Err(ParseError::new(
        line_at(body, start, first_line),
        "f-string: expecting '}'",
    ))
}

fn push_field(
    body: &[char],
    start: usize,
    end: usize,
    first_line: usize,
    fields: &mut Vec<Vec<Token>>,
) -> Result<(), ParseError> {
    let text: String = body[start..end].iter().collect();
    let line = line_at(body, start, first_line);
    let trimmed = text.trim_end();
    // Self-documenting `{expr=}` keeps the trailing `=` out of the expression.
    let trimmed = trimmed
        .strip_suffix('=')
        .filter(|rest| !rest.ends_with(['=', '!', '<', '>']))
        .unwrap_or(trimmed);
    if trimmed.trim().is_empty() {
        return Err(ParseError::new(line, "f-string: empty expression not allowed"));
    }
    fields.push(tokenize_fragment(trimmed, line)?);
    Ok(())
}

fn line_at(body: &[char], index: usize, first_line: usize) -> usize {
    first_line + body[..index.min(body.len())].iter().filter(|&&c| c == '\n').count()
}
