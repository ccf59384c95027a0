//! Statement and expression grammar checks.
//!
//! [`Program`](super::Program) only pulls out the nodes the policy looks
//! at. This module confirms each statement is well-formed Python, so text
//! the interpreter would refuse to compile is rejected before a process is
//! spawned for it. It is a recognizer over the token stream: no tree is
//! built, only a coarse [`Shape`] per expression so that assignment targets
//! can be told apart from values.
//!
//! `import` statements are checked by [`Program`](super::Program) itself.
//! `match`/`case` patterns are not checked beyond what the tokenizer does.

use super::lexer::{ParseError, Token, TokenKind};
use super::program::is_keyword;

type Parse<T> = Result<T, ParseError>;

/// What an expression looks like from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Name,
    Attribute,
    Subscript,
    Starred { target: bool },
    /// Tuple or list display.
    Sequence { target: bool },
    Value,
}

impl Shape {
    fn is_target(self) -> bool {
        match self {
            Shape::Name | Shape::Attribute | Shape::Subscript => true,
            Shape::Starred { target } | Shape::Sequence { target } => target,
            Shape::Value => false,
        }
    }

    /// Targets of augmented and annotated assignment.
    fn is_single_target(self) -> bool {
        matches!(self, Shape::Name | Shape::Attribute | Shape::Subscript)
    }
}

const AUGMENTED: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "@=", "&=", "|=", "^=", ">>=", "<<=", "**=",
];

const COMPARISONS: &[&str] = &["==", "!=", "<", "<=", ">", ">="];

// ── Entry points ───────────────────────────────────────────────────

/// Check a simple statement: expression, assignment, `return`, `del`, a
/// decorator line, and so on.
pub fn simple_statement(tokens: &[Token]) -> Parse<()> {
    let mut parser = Parser::new(tokens);
    let result = parser.simple_statement().and_then(|()| parser.expect_end());
    match result {
        Err(_) if is_type_alias(tokens) => type_alias(&tokens[1..]),
        other => other,
    }
}

/// Check a compound statement header. `tokens` ends with its `:`.
pub fn compound_header(tokens: &[Token]) -> Parse<()> {
    let mut parser = Parser::new(tokens);
    parser.compound_header()?;
    parser.expect_op(":")?;
    parser.expect_end()
}

/// Check a `match subject:` or `case pattern:` header. `tokens` ends with
/// its `:`.
pub fn soft_keyword_header(tokens: &[Token]) -> Parse<()> {
    let mut parser = Parser::new(tokens);
    match parser.peek().and_then(Token::name) {
        Some("match") => {
            parser.pos += 1;
            parser.star_expressions()?;
            parser.expect_op(":")?;
            parser.expect_end()
        }
        Some("case") => Ok(()),
        _ => Err(parser.error()),
    }
}

/// `type Alias[T] = expression`
fn is_type_alias(tokens: &[Token]) -> bool {
    tokens.first().and_then(Token::name) == Some("type")
        && tokens.get(1).and_then(Token::name).is_some_and(|n| !is_keyword(n))
}

fn type_alias(tokens: &[Token]) -> Parse<()> {
    let mut parser = Parser::new(tokens);
    parser.name()?;
    parser.type_parameters()?;
    parser.expect_op("=")?;
    parser.expression()?;
    parser.expect_end()
}

/// An f-string replacement field holds an expression list.
fn replacement_field(tokens: &[Token]) -> Parse<()> {
    let mut parser = Parser::new(tokens);
    if parser.at_keyword("yield") {
        parser.yield_expression()?;
    } else {
        parser.star_expressions()?;
    }
    parser.expect_end()
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + offset)
    }

    fn at_op(&self, op: &str) -> bool {
        self.peek().is_some_and(|t| t.is_op(op))
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().and_then(Token::name) == Some(keyword)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let found = self.at_op(op);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn line(&self) -> usize {
        self.peek().or(self.tokens.last()).map_or(1, |t| t.line)
    }

    fn error(&self) -> ParseError {
        ParseError::new(self.line(), "invalid syntax")
    }

    fn expect_op(&mut self, op: &str) -> Parse<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Parse<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn expect_end(&self) -> Parse<()> {
        if self.pos >= self.tokens.len() {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn name(&mut self) -> Parse<()> {
        match self.peek().and_then(Token::name) {
            Some(n) if !is_keyword(n) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error()),
        }
    }

    /// Whether the next token can begin an expression.
    fn at_expression_start(&self) -> bool {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Name(n)) => {
                !is_keyword(n)
                    || matches!(
                        n.as_str(),
                        "None" | "True" | "False" | "not" | "lambda" | "await"
                    )
            }
            Some(TokenKind::Number | TokenKind::Str { .. }) => true,
            Some(TokenKind::Op(op)) => {
                matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "..." | "*")
            }
            _ => false,
        }
    }

    fn at_comprehension(&self) -> bool {
        self.at_keyword("for")
            || (self.at_keyword("async") && self.peek_at(1).and_then(Token::name) == Some("for"))
    }

    // ── Statements ─────────────────────────────────────────────────

    fn simple_statement(&mut self) -> Parse<()> {
        if self.eat_op("@") {
            self.named_expression()?;
            return Ok(());
        }
        let keyword = self.peek().and_then(Token::name).filter(|n| is_keyword(n));
        match keyword {
            Some("pass" | "break" | "continue") => {
                self.pos += 1;
                Ok(())
            }
            Some("return") => {
                self.pos += 1;
                if self.at_expression_start() {
                    self.star_expressions()?;
                }
                Ok(())
            }
            Some("raise") => {
                self.pos += 1;
                if self.at_expression_start() {
                    self.expression()?;
                    if self.eat_keyword("from") {
                        self.expression()?;
                    }
                }
                Ok(())
            }
            Some("global" | "nonlocal") => {
                self.pos += 1;
                loop {
                    self.name()?;
                    if !self.eat_op(",") {
                        return Ok(());
                    }
                }
            }
            Some("del") => {
                self.pos += 1;
                self.targets()
            }
            Some("assert") => {
                self.pos += 1;
                self.expression()?;
                if self.eat_op(",") {
                    self.expression()?;
                }
                Ok(())
            }
            Some("yield") => self.yield_expression(),
            Some("None" | "True" | "False" | "not" | "lambda" | "await") | None => {
                self.assignment()
            }
            Some(_) => Err(self.error()),
        }
    }

    /// Expression statement, chained assignment, augmented assignment, or
    /// annotated assignment.
    fn assignment(&mut self) -> Parse<()> {
        let line = self.line();
        let first = self.star_expressions()?;

        if self.eat_op(":") {
            if !first.is_single_target() {
                return Err(ParseError::new(line, "illegal target for annotation"));
            }
            self.expression()?;
            if self.eat_op("=") {
                self.assigned_value()?;
            }
            return Ok(());
        }

        if AUGMENTED.iter().any(|op| self.at_op(op)) {
            if !first.is_single_target() {
                return Err(ParseError::new(
                    line,
                    "illegal expression for augmented assignment",
                ));
            }
            self.pos += 1;
            self.assigned_value()?;
            return Ok(());
        }

        let mut target = first;
        while self.eat_op("=") {
            if !target.is_target() {
                return Err(ParseError::new(line, "cannot assign to expression"));
            }
            target = self.assigned_value()?;
        }
        Ok(())
    }

    fn assigned_value(&mut self) -> Parse<Shape> {
        if self.at_keyword("yield") {
            self.yield_expression()?;
            return Ok(Shape::Value);
        }
        self.star_expressions()
    }

    fn compound_header(&mut self) -> Parse<()> {
        let Some(keyword) = self.peek().and_then(Token::name) else {
            return Err(self.error());
        };
        self.pos += 1;
        match keyword {
            "if" | "elif" | "while" => {
                self.named_expression()?;
            }
            "else" | "try" | "finally" => {}
            "for" => {
                self.targets()?;
                self.expect_keyword("in")?;
                self.star_expressions()?;
            }
            "except" => {
                self.eat_op("*");
                if !self.at_op(":") {
                    self.expression()?;
                    if self.eat_keyword("as") {
                        self.name()?;
                    }
                }
            }
            "with" => self.with_items()?,
            "def" => {
                self.name()?;
                self.type_parameters()?;
                self.expect_op("(")?;
                if !self.at_op(")") {
                    self.parameters(true, ")")?;
                }
                self.expect_op(")")?;
                if self.eat_op("->") {
                    self.expression()?;
                }
            }
            "class" => {
                self.name()?;
                self.type_parameters()?;
                if self.eat_op("(") {
                    self.arguments()?;
                }
            }
            "async" if matches!(self.peek().and_then(Token::name), Some("def" | "for" | "with")) => {
                self.compound_header()?;
            }
            _ => return Err(self.error()),
        }
        Ok(())
    }

    /// `with a as b, c:` or the parenthesized `with (a as b, c,):`.
    fn with_items(&mut self) -> Parse<()> {
        if self.at_op("(") {
            let start = self.pos;
            self.pos += 1;
            if self.with_item_list(")").is_ok() && self.eat_op(")") && self.at_op(":") {
                return Ok(());
            }
            // The parentheses belong to the first item's expression.
            self.pos = start;
        }
        self.with_item_list(":")
    }

    fn with_item_list(&mut self, close: &str) -> Parse<()> {
        loop {
            self.expression()?;
            if self.eat_keyword("as") {
                self.target()?;
            }
            if !self.eat_op(",") || self.at_op(close) {
                return Ok(());
            }
        }
    }

    /// Skip an optional `[T, *Ts, **P]` list.
    fn type_parameters(&mut self) -> Parse<()> {
        if !self.eat_op("[") {
            return Ok(());
        }
        let mut depth = 1usize;
        while depth > 0 {
            let Some(token) = self.peek() else {
                return Err(self.error());
            };
            if token.is_op("[") {
                depth += 1;
            } else if token.is_op("]") {
                depth -= 1;
            }
            self.pos += 1;
        }
        Ok(())
    }

    /// Parameters up to `close`. Annotations only appear in `def` headers;
    /// in a lambda the `:` ends the list.
    fn parameters(&mut self, annotated: bool, close: &str) -> Parse<()> {
        loop {
            if self.eat_op("**") {
                self.parameter(annotated)?;
            } else if self.eat_op("*") {
                if !self.at_op(",") && !self.at_op(close) {
                    self.parameter(annotated)?;
                }
            } else if !self.eat_op("/") {
                self.parameter(annotated)?;
                if self.eat_op("=") {
                    self.expression()?;
                }
            }
            if !self.eat_op(",") || self.at_op(close) {
                return Ok(());
            }
        }
    }

    fn parameter(&mut self, annotated: bool) -> Parse<()> {
        self.name()?;
        if annotated && self.eat_op(":") {
            self.expression()?;
        }
        Ok(())
    }

    /// Targets of `for`, `del`, and comprehensions: `a, (b, c), *d`.
    fn targets(&mut self) -> Parse<()> {
        loop {
            self.eat_op("*");
            self.target()?;
            if !self.eat_op(",") || !self.at_expression_start() {
                return Ok(());
            }
        }
    }

    fn target(&mut self) -> Parse<()> {
        let line = self.line();
        if self.bitwise_or()?.is_target() {
            Ok(())
        } else {
            Err(ParseError::new(line, "cannot assign to expression"))
        }
    }

    // ── Expressions ────────────────────────────────────────────────

    /// `star_expression (',' star_expression)* [',']`
    fn star_expressions(&mut self) -> Parse<Shape> {
        let first = self.star_expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut target = first.is_target();
        while self.eat_op(",") {
            if !self.at_expression_start() {
                break;
            }
            target &= self.star_expression()?.is_target();
        }
        Ok(Shape::Sequence { target })
    }

    fn star_expression(&mut self) -> Parse<Shape> {
        if self.eat_op("*") {
            let inner = self.bitwise_or()?;
            return Ok(Shape::Starred {
                target: inner.is_target(),
            });
        }
        self.named_expression()
    }

    fn named_expression(&mut self) -> Parse<Shape> {
        let assigns = self.peek().and_then(Token::name).is_some_and(|n| !is_keyword(n))
            && self.peek_at(1).is_some_and(|t| t.is_op(":="));
        if assigns {
            self.pos += 2;
            self.expression()?;
            return Ok(Shape::Value);
        }
        self.expression()
    }

    fn expression(&mut self) -> Parse<Shape> {
        if self.at_keyword("lambda") {
            return self.lambda();
        }
        let shape = self.disjunction()?;
        if self.eat_keyword("if") {
            self.disjunction()?;
            self.expect_keyword("else")?;
            self.expression()?;
            return Ok(Shape::Value);
        }
        Ok(shape)
    }

    fn lambda(&mut self) -> Parse<Shape> {
        self.pos += 1;
        if !self.at_op(":") {
            self.parameters(false, ":")?;
        }
        self.expect_op(":")?;
        self.expression()?;
        Ok(Shape::Value)
    }

    fn yield_expression(&mut self) -> Parse<()> {
        self.pos += 1;
        if self.eat_keyword("from") {
            self.expression()?;
        } else if self.at_expression_start() {
            self.star_expressions()?;
        }
        Ok(())
    }

    fn disjunction(&mut self) -> Parse<Shape> {
        let shape = self.conjunction()?;
        if !self.at_keyword("or") {
            return Ok(shape);
        }
        while self.eat_keyword("or") {
            self.conjunction()?;
        }
        Ok(Shape::Value)
    }

    fn conjunction(&mut self) -> Parse<Shape> {
        let shape = self.inversion()?;
        if !self.at_keyword("and") {
            return Ok(shape);
        }
        while self.eat_keyword("and") {
            self.inversion()?;
        }
        Ok(Shape::Value)
    }

    fn inversion(&mut self) -> Parse<Shape> {
        if self.eat_keyword("not") {
            self.inversion()?;
            return Ok(Shape::Value);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Parse<Shape> {
        let shape = self.bitwise_or()?;
        let mut compared = false;
        while self.comparison_operator() {
            self.bitwise_or()?;
            compared = true;
        }
        Ok(if compared { Shape::Value } else { shape })
    }

    fn comparison_operator(&mut self) -> bool {
        if COMPARISONS.iter().any(|op| self.at_op(op)) || self.at_keyword("in") {
            self.pos += 1;
            return true;
        }
        if self.at_keyword("not") && self.peek_at(1).and_then(Token::name) == Some("in") {
            self.pos += 2;
            return true;
        }
        if self.eat_keyword("is") {
            self.eat_keyword("not");
            return true;
        }
        false
    }

    /// A left-associative chain of `operand (op operand)*`.
    fn binary(&mut self, ops: &[&str], operand: fn(&mut Self) -> Parse<Shape>) -> Parse<Shape> {
        let shape = operand(self)?;
        let mut combined = false;
        while ops.iter().any(|op| self.at_op(op)) {
            self.pos += 1;
            operand(self)?;
            combined = true;
        }
        Ok(if combined { Shape::Value } else { shape })
    }

    fn bitwise_or(&mut self) -> Parse<Shape> {
        self.binary(&["|"], Self::bitwise_xor)
    }

    fn bitwise_xor(&mut self) -> Parse<Shape> {
        self.binary(&["^"], Self::bitwise_and)
    }

    fn bitwise_and(&mut self) -> Parse<Shape> {
        self.binary(&["&"], Self::shift)
    }

    fn shift(&mut self) -> Parse<Shape> {
        self.binary(&["<<", ">>"], Self::sum)
    }

    fn sum(&mut self) -> Parse<Shape> {
        self.binary(&["+", "-"], Self::term)
    }

    fn term(&mut self) -> Parse<Shape> {
        self.binary(&["*", "/", "//", "%", "@"], Self::factor)
    }

    fn factor(&mut self) -> Parse<Shape> {
        if self.eat_op("-") || self.eat_op("+") || self.eat_op("~") {
            self.factor()?;
            return Ok(Shape::Value);
        }
        self.power()
    }

    fn power(&mut self) -> Parse<Shape> {
        let shape = if self.eat_keyword("await") {
            self.primary()?;
            Shape::Value
        } else {
            self.primary()?
        };
        if self.eat_op("**") {
            self.factor()?;
            return Ok(Shape::Value);
        }
        Ok(shape)
    }

    /// An atom followed by attribute, call, and subscript trailers.
    fn primary(&mut self) -> Parse<Shape> {
        let mut shape = self.atom()?;
        loop {
            if self.eat_op(".") {
                self.name()?;
                shape = Shape::Attribute;
            } else if self.eat_op("(") {
                self.arguments()?;
                shape = Shape::Value;
            } else if self.eat_op("[") {
                self.slices()?;
                shape = Shape::Subscript;
            } else {
                return Ok(shape);
            }
        }
    }

    fn atom(&mut self) -> Parse<Shape> {
        let Some(token) = self.peek() else {
            return Err(self.error());
        };
        match &token.kind {
            TokenKind::Name(n) if matches!(n.as_str(), "None" | "True" | "False") => {
                self.pos += 1;
                Ok(Shape::Value)
            }
            TokenKind::Name(n) if !is_keyword(n) => {
                self.pos += 1;
                Ok(Shape::Name)
            }
            TokenKind::Number | TokenKind::Op("...") => {
                self.pos += 1;
                Ok(Shape::Value)
            }
            TokenKind::Str { .. } => {
                // Adjacent literals concatenate.
                while let Some(Token {
                    kind: TokenKind::Str { fields },
                    ..
                }) = self.peek()
                {
                    for field in fields {
                        replacement_field(field)?;
                    }
                    self.pos += 1;
                }
                Ok(Shape::Value)
            }
            TokenKind::Op("(") => {
                self.pos += 1;
                self.parenthesized()
            }
            TokenKind::Op("[") => {
                self.pos += 1;
                self.list()
            }
            TokenKind::Op("{") => {
                self.pos += 1;
                self.braces()
            }
            _ => Err(self.error()),
        }
    }

    /// After `(`: empty tuple, group, tuple, generator, or yield.
    fn parenthesized(&mut self) -> Parse<Shape> {
        if self.eat_op(")") {
            return Ok(Shape::Sequence { target: true });
        }
        if self.at_keyword("yield") {
            self.yield_expression()?;
            self.expect_op(")")?;
            return Ok(Shape::Value);
        }
        let first = self.star_expression()?;
        if self.at_comprehension() {
            self.comprehension()?;
            self.expect_op(")")?;
            return Ok(Shape::Value);
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        self.sequence(first, ")")
    }

    /// After `[`: list display or comprehension.
    fn list(&mut self) -> Parse<Shape> {
        if self.eat_op("]") {
            return Ok(Shape::Sequence { target: true });
        }
        let first = self.star_expression()?;
        if self.at_comprehension() {
            self.comprehension()?;
            self.expect_op("]")?;
            return Ok(Shape::Value);
        }
        self.sequence(first, "]")
    }

    /// The rest of a comma-separated display whose first element is parsed.
    fn sequence(&mut self, first: Shape, close: &str) -> Parse<Shape> {
        let mut target = first.is_target();
        while self.eat_op(",") {
            if self.at_op(close) {
                break;
            }
            target &= self.star_expression()?.is_target();
        }
        self.expect_op(close)?;
        Ok(Shape::Sequence { target })
    }

    /// After `{`: dict or set display, or their comprehensions.
    fn braces(&mut self) -> Parse<Shape> {
        if self.eat_op("}") {
            return Ok(Shape::Value);
        }
        if self.eat_op("**") {
            self.bitwise_or()?;
            return self.dict_rest();
        }
        let first = self.star_expression()?;
        if self.eat_op(":") {
            self.expression()?;
            if self.at_comprehension() {
                self.comprehension()?;
                self.expect_op("}")?;
                return Ok(Shape::Value);
            }
            return self.dict_rest();
        }
        if self.at_comprehension() {
            self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Shape::Value);
        }
        self.sequence(first, "}")?;
        Ok(Shape::Value)
    }

    fn dict_rest(&mut self) -> Parse<Shape> {
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.eat_op("**") {
                self.bitwise_or()?;
            } else {
                self.expression()?;
                self.expect_op(":")?;
                self.expression()?;
            }
        }
        self.expect_op("}")?;
        Ok(Shape::Value)
    }

    /// One or more `[async] for targets in iterable [if condition]...`.
    fn comprehension(&mut self) -> Parse<()> {
        while self.at_comprehension() {
            self.eat_keyword("async");
            self.pos += 1;
            self.targets()?;
            self.expect_keyword("in")?;
            self.disjunction()?;
            while self.eat_keyword("if") {
                self.disjunction()?;
            }
        }
        Ok(())
    }

    /// After `(` in a call, through the closing `)`.
    fn arguments(&mut self) -> Parse<()> {
        while !self.at_op(")") {
            let keyword = self.peek().and_then(Token::name).is_some_and(|n| !is_keyword(n))
                && self.peek_at(1).is_some_and(|t| t.is_op("="));
            if self.eat_op("*") || self.eat_op("**") {
                self.expression()?;
            } else if keyword {
                self.pos += 2;
                self.expression()?;
            } else {
                self.named_expression()?;
                if self.at_comprehension() {
                    self.comprehension()?;
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")
    }

    /// After `[` in a subscript, through the closing `]`.
    fn slices(&mut self) -> Parse<()> {
        loop {
            self.slice()?;
            if !self.eat_op(",") || self.at_op("]") {
                break;
            }
        }
        self.expect_op("]")
    }

    /// `expression` or `[lower] : [upper] [: [step]]`.
    fn slice(&mut self) -> Parse<()> {
        if self.eat_op("*") {
            self.bitwise_or()?;
            return Ok(());
        }
        if !self.at_op(":") {
            self.named_expression()?;
            if !self.at_op(":") {
                return Ok(());
            }
        }
        self.pos += 1;
        if self.at_expression_start() {
            self.expression()?;
        }
        if self.eat_op(":") && self.at_expression_start() {
            self.expression()?;
        }
        Ok(())
    }
}
