//! Generic program representation for policy checks.
//!
//! A [`Program`] is the ordered list of [`Node`]s the policy cares about:
//! imports, calls of plain names, bare name references, and attribute
//! accesses. Nodes appear in source order, so the first violating node is
//! also the first violating construct in the submission.

use super::grammar;
use super::lexer::{self, ParseError, Token, TokenKind};

/// One construct relevant to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// `import a.b` or `from a.b import c`. Relative imports keep their
    /// leading dots.
    Import { module: String, line: usize },
    /// A call whose callee is a plain name: `name(...)`.
    Call { callee: String, line: usize },
    /// A plain name used as a value, not called.
    Reference { name: String, line: usize },
    /// `expr.name`
    Attribute { name: String, line: usize },
}

impl Node {
    pub fn line(&self) -> usize {
        match self {
            Node::Import { line, .. }
            | Node::Call { line, .. }
            | Node::Reference { line, .. }
            | Node::Attribute { line, .. } => *line,
        }
    }
}

/// A parsed submission.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub nodes: Vec<Node>,
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Keywords that introduce a compound statement header ending in `:`.
const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "try", "except", "finally", "with", "def", "class",
    "async",
];

pub(super) fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

impl Program {
    /// Tokenize and parse a submission.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = lexer::tokenize(source)?;
        let mut program = Program::default();

        let mut line: Vec<Token> = Vec::new();
        for token in tokens {
            match token.kind {
                TokenKind::Newline => {
                    program.logical_line(&line)?;
                    line.clear();
                }
                TokenKind::Indent | TokenKind::Dedent => {}
                _ => line.push(token),
            }
        }
        if !line.is_empty() {
            program.logical_line(&line)?;
        }
        Ok(program)
    }

    fn logical_line(&mut self, tokens: &[Token]) -> Result<(), ParseError> {
        for statement in split_top_level(tokens, ";") {
            self.statement(statement)?;
        }
        Ok(())
    }

    /// A simple statement, or a compound header possibly followed by an
    /// inline body (`if x: import os`).
    fn statement(&mut self, tokens: &[Token]) -> Result<(), ParseError> {
        let Some(first) = tokens.first() else {
            return Ok(());
        };

        if first.name().is_some_and(|n| COMPOUND_KEYWORDS.contains(&n))
            && let Some(colon) = find_top_level(tokens, ":")
        {
            grammar::compound_header(&tokens[..=colon])?;
            self.expressions(&tokens[..colon])?;
            return self.statement(&tokens[colon + 1..]);
        }

        match first.name() {
            Some("import") => self.import(tokens),
            Some("from") => self.import_from(tokens),
            _ => match grammar::simple_statement(tokens) {
                Ok(()) => self.expressions(tokens),
                Err(e) => self.soft_keyword_statement(tokens).unwrap_or(Err(e)),
            },
        }
    }

    /// `match subject:` and `case pattern:` headers, with any inline body.
    /// `None` when `tokens` is not one.
    fn soft_keyword_statement(&mut self, tokens: &[Token]) -> Option<Result<(), ParseError>> {
        if !matches!(tokens.first().and_then(Token::name), Some("match" | "case")) {
            return None;
        }
        let colon = find_top_level(tokens, ":")?;
        grammar::soft_keyword_header(&tokens[..=colon]).ok()?;
        Some(
            self.expressions(&tokens[..colon])
                .and_then(|()| self.statement(&tokens[colon + 1..])),
        )
    }

    /// `import a.b [as c], d`
    fn import(&mut self, tokens: &[Token]) -> Result<(), ParseError> {
        let line = tokens[0].line;
        let rest = &tokens[1..];
        if rest.is_empty() {
            return Err(invalid_import(line));
        }
        for alias in split_top_level(rest, ",") {
            let (module, after) = dotted_name(alias).ok_or_else(|| invalid_import(line))?;
            check_alias(after, line)?;
            self.nodes.push(Node::Import { module, line });
        }
        Ok(())
    }

    /// `from .a.b import c [as d], e` / `from a import (b, c)` / `from a import *`
    fn import_from(&mut self, tokens: &[Token]) -> Result<(), ParseError> {
        let line = tokens[0].line;
        let mut i = 1;
        let mut module = String::new();
        while let Some(t) = tokens.get(i) {
            if t.is_op(".") {
                module.push('.');
            } else if t.is_op("...") {
                module.push_str("...");
            } else {
                break;
            }
            i += 1;
        }
        if tokens.get(i).and_then(Token::name) != Some("import") {
            let (name, after) = dotted_name(&tokens[i..]).ok_or_else(|| invalid_import(line))?;
            module.push_str(&name);
            i = tokens.len() - after.len();
        }
        if module.is_empty() || tokens.get(i).and_then(Token::name) != Some("import") {
            return Err(invalid_import(line));
        }

        let mut names = &tokens[i + 1..];
        if names.first().is_some_and(|t| t.is_op("("))
            && names.last().is_some_and(|t| t.is_op(")"))
        {
            names = &names[1..names.len() - 1];
        }
        let star = names.len() == 1 && names[0].is_op("*");
        if !star {
            let aliases: Vec<_> = split_top_level(names, ",")
                .into_iter()
                .filter(|a| !a.is_empty())
                .collect();
            if aliases.is_empty() {
                return Err(invalid_import(line));
            }
            for alias in aliases {
                let name = alias
                    .first()
                    .and_then(Token::name)
                    .ok_or_else(|| invalid_import(line))?;
                if is_keyword(name) {
                    return Err(invalid_import(line));
                }
                check_alias(&alias[1..], line)?;
            }
        }

        self.nodes.push(Node::Import { module, line });
        Ok(())
    }

    /// Walk expression tokens, recording calls, references, and attributes.
    fn expressions(&mut self, tokens: &[Token]) -> Result<(), ParseError> {
        let mut depth = 0usize;
        for (i, token) in tokens.iter().enumerate() {
            match &token.kind {
                TokenKind::Op("(" | "[" | "{") => depth += 1,
                TokenKind::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                TokenKind::Str { fields } => {
                    for field in fields {
                        self.expressions(field)?;
                    }
                }
                TokenKind::Name(name) => {
                    if name == "import" {
                        return Err(ParseError::new(token.line, "invalid syntax"));
                    }
                    if is_keyword(name) {
                        continue;
                    }
                    let line = token.line;
                    let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
                    let next = tokens.get(i + 1);

                    if prev.is_some_and(|p| p.is_op(".")) {
                        self.nodes.push(Node::Attribute {
                            name: name.clone(),
                            line,
                        });
                    } else if next.is_some_and(|n| n.is_op("(")) {
                        self.nodes.push(Node::Call {
                            callee: name.clone(),
                            line,
                        });
                    } else if depth > 0
                        && next.is_some_and(|n| n.is_op("="))
                        && prev.is_some_and(|p| p.is_op("(") || p.is_op(","))
                    {
                        // Keyword argument name, not a value.
                    } else {
                        self.nodes.push(Node::Reference {
                            name: name.clone(),
                            line,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn invalid_import(line: usize) -> ParseError {
    ParseError::new(line, "invalid syntax in import statement")
}

/// Parse `a.b.c` from the front of `tokens`. Returns the dotted name and the
/// remaining tokens.
fn dotted_name(tokens: &[Token]) -> Option<(String, &[Token])> {
    let first = tokens.first()?.name().filter(|n| !is_keyword(n))?;
    let mut name = first.to_string();
    let mut i = 1;
    while tokens.get(i).is_some_and(|t| t.is_op(".")) {
        let part = tokens.get(i + 1)?.name().filter(|n| !is_keyword(n))?;
        name.push('.');
        name.push_str(part);
        i += 2;
    }
    Some((name, &tokens[i..]))
}

/// Validate an optional `as name` suffix.
fn check_alias(tokens: &[Token], line: usize) -> Result<(), ParseError> {
    match tokens {
        [] => Ok(()),
        [as_kw, alias]
            if as_kw.name() == Some("as") && alias.name().is_some_and(|n| !is_keyword(n)) =>
        {
            Ok(())
        }
        _ => Err(invalid_import(line)),
    }
}

/// Index of the first `op` token outside any brackets.
fn find_top_level(tokens: &[Token], op: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::Op("(" | "[" | "{") => depth += 1,
            TokenKind::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
            TokenKind::Op(o) if depth == 0 && o == op => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split `tokens` on every top-level `sep`.
fn split_top_level<'a>(tokens: &'a [Token], sep: &str) -> Vec<&'a [Token]> {
    let mut parts = Vec::new();
    let mut rest = tokens;
    while let Some(i) = find_top_level(rest, sep) {
        parts.push(&rest[..i]);
        rest = &rest[i + 1..];
    }
    parts.push(rest);
    parts
}
