//! IR surface syntax parser
//!
//! Recursive descent over the printer's output language. Also understands
//! the object container grammar (`object "name" { code { ... } ... }`)
//! used by the compilation unit.

use crate::backends::object::{Object, ObjectNode};
use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use crate::middle::ir::*;
use crate::util::span::{Position, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Number(String),
    Str(String),
    Hex(Vec<u8>),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Assign,
    Arrow,
    Let,
    Function,
    If,
    Switch,
    Case,
    Default,
    For,
    Break,
    Continue,
    True,
    False,
    Object,
    Code,
    Data,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: Span,
}

struct Lexer<'a> {
    source: &'a [u8],
    offset: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column, self.offset)
    }

    fn peek_char(&self) -> Option<u8> {
        self.source.get(self.offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek_char()?;
        self.offset += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.source.get(self.offset + 1) == Some(&b'/') => {
                    while let Some(c) = self.peek_char() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn is_ident_char(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.position();
            let Some(c) = self.peek_char() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span: Span::new(start, start),
                });
                return Ok(tokens);
            };
            let kind = match c {
                b'{' => {
                    self.bump();
                    TokenKind::LBrace
                }
                b'}' => {
                    self.bump();
                    TokenKind::RBrace
                }
                b'(' => {
                    self.bump();
                    TokenKind::LParen
                }
                b')' => {
                    self.bump();
                    TokenKind::RParen
                }
                b',' => {
                    self.bump();
                    TokenKind::Comma
                }
                b':' => {
                    self.bump();
                    if self.peek_char() == Some(b'=') {
                        self.bump();
                        TokenKind::Assign
                    } else {
                        return Err(CoreError::Parse {
                            msg: "expected `:=`".into(),
                            span: Span::new(start, self.position()),
                        });
                    }
                }
                b'-' => {
                    self.bump();
                    if self.peek_char() == Some(b'>') {
                        self.bump();
                        TokenKind::Arrow
                    } else {
                        return Err(CoreError::Parse {
                            msg: "expected `->`".into(),
                            span: Span::new(start, self.position()),
                        });
                    }
                }
                b'"' => TokenKind::Str(self.lex_string(start)?),
                c if c.is_ascii_digit() => self.lex_number(),
                c if Self::is_ident_char(c) => self.lex_word(start)?,
                c => {
                    return Err(CoreError::Parse {
                        msg: format!("unexpected character `{}`", c as char),
                        span: Span::new(start, self.position()),
                    });
                }
            };
            tokens.push(Token {
                kind,
                span: Span::new(start, self.position()),
            });
        }
    }

    fn lex_string(&mut self, start: Position) -> Result<String> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(CoreError::Parse {
                        msg: "unterminated string literal".into(),
                        span: Span::new(start, self.position()),
                    });
                }
                Some(b'"') => return Ok(value),
                Some(b'\\') => {
                    let escaped = self.bump().ok_or_else(|| CoreError::Parse {
                        msg: "unterminated escape sequence".into(),
                        span: Span::new(start, self.position()),
                    })?;
                    match escaped {
                        b'\\' => value.push('\\'),
                        b'"' => value.push('"'),
                        b'n' => value.push('\n'),
                        b'r' => value.push('\r'),
                        b't' => value.push('\t'),
                        b'x' => {
                            let hi = self.bump();
                            let lo = self.bump();
                            let (Some(hi), Some(lo)) = (hi, lo) else {
                                return Err(CoreError::Parse {
                                    msg: "truncated \\x escape".into(),
                                    span: Span::new(start, self.position()),
                                });
                            };
                            let byte = (hex_digit(hi), hex_digit(lo));
                            match byte {
                                (Some(h), Some(l)) => value.push((h * 16 + l) as char),
                                _ => {
                                    return Err(CoreError::Parse {
                                        msg: "invalid \\x escape".into(),
                                        span: Span::new(start, self.position()),
                                    });
                                }
                            }
                        }
                        c => {
                            return Err(CoreError::Parse {
                                msg: format!("unknown escape `\\{}`", c as char),
                                span: Span::new(start, self.position()),
                            });
                        }
                    }
                }
                Some(c) => value.push(c as char),
            }
        }
    }

    fn lex_number(&mut self) -> TokenKind {
        let mut text = String::new();
        if self.peek_char() == Some(b'0') && self.source.get(self.offset + 1) == Some(&b'x') {
            text.push_str("0x");
            self.bump();
            self.bump();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_hexdigit() {
                    text.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
        } else {
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    text.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        TokenKind::Number(text)
    }

    fn lex_word(&mut self, start: Position) -> Result<TokenKind> {
        let mut word = String::new();
        while let Some(c) = self.peek_char() {
            if Self::is_ident_char(c) {
                word.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        // hex"..." data literal
        if word == "hex" && self.peek_char() == Some(b'"') {
            let text = self.lex_string(start)?;
            let mut bytes = Vec::new();
            let digits: Vec<u8> = text.bytes().collect();
            if digits.len() % 2 != 0 {
                return Err(CoreError::Parse {
                    msg: "odd number of digits in hex literal".into(),
                    span: Span::new(start, self.position()),
                });
            }
            for pair in digits.chunks(2) {
                match (hex_digit(pair[0]), hex_digit(pair[1])) {
                    (Some(h), Some(l)) => bytes.push(h * 16 + l),
                    _ => {
                        return Err(CoreError::Parse {
                            msg: "invalid digit in hex literal".into(),
                            span: Span::new(start, self.position()),
                        });
                    }
                }
            }
            return Ok(TokenKind::Hex(bytes));
        }
        Ok(match word.as_str() {
            "let" => TokenKind::Let,
            "function" => TokenKind::Function,
            "if" => TokenKind::If,
            "switch" => TokenKind::Switch,
            "case" => TokenKind::Case,
            "default" => TokenKind::Default,
            "for" => TokenKind::For,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "object" => TokenKind::Object,
            "code" => TokenKind::Code,
            "data" => TokenKind::Data,
            _ => TokenKind::Ident(word),
        })
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse a bare IR block
pub fn parse_block(source: &str) -> Result<Block> {
    let mut parser = Parser::new(source)?;
    let block = parser.block()?;
    parser.expect_eof()?;
    Ok(block)
}

/// Parse a compilation-unit source: either an object tree or a bare block
/// (wrapped into an unnamed object, as the object grammar allows both).
pub fn parse_object(source: &str) -> Result<Object> {
    let mut parser = Parser::new(source)?;
    let object = if parser.at(&TokenKind::Object) {
        parser.object()?
    } else {
        let code = parser.block()?;
        Object {
            name: "object".into(),
            code,
            subobjects: Vec::new(),
        }
    };
    parser.expect_eof()?;
    Ok(object)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self> {
        Ok(Self {
            tokens: Lexer::new(source).tokenize()?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.at(&kind) {
            Ok(self.next())
        } else {
            Err(self.error_here(format!("expected {}", what)))
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if self.at(&TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.error_here("expected end of input".into()))
        }
    }

    fn error_here(&self, msg: String) -> CoreError {
        CoreError::Parse {
            msg,
            span: self.peek().span,
        }
    }

    fn ident(&mut self) -> Result<Identifier> {
        let token = self.next();
        match token.kind {
            TokenKind::Ident(name) => Ok(Identifier {
                span: token.span,
                name,
            }),
            _ => Err(CoreError::Parse {
                msg: "expected identifier".into(),
                span: token.span,
            }),
        }
    }

    fn block(&mut self) -> Result<Block> {
        let open = self.expect(TokenKind::LBrace, "`{`")?;
        let mut statements = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error_here("unterminated block".into()));
            }
            statements.push(self.statement()?);
        }
        let close = self.next();
        Ok(Block {
            span: open.span.to(close.span),
            statements,
        })
    }

    fn statement(&mut self) -> Result<Statement> {
        let kind = self.peek().kind.clone();
        match kind {
            TokenKind::LBrace => Ok(Statement::Block(self.block()?)),
            TokenKind::Let => self.variable_declaration(),
            TokenKind::Function => self.function_definition(),
            TokenKind::If => {
                let start = self.next().span;
                let condition = self.expression()?;
                let body = self.block()?;
                Ok(Statement::If(If {
                    span: start.to(body.span),
                    condition,
                    body,
                }))
            }
            TokenKind::Switch => self.switch(),
            TokenKind::For => {
                let start = self.next().span;
                let pre = self.block()?;
                let condition = self.expression()?;
                let post = self.block()?;
                let body = self.block()?;
                Ok(Statement::ForLoop(ForLoop {
                    span: start.to(body.span),
                    pre,
                    condition,
                    post,
                    body,
                }))
            }
            TokenKind::Break => Ok(Statement::Break(self.next().span)),
            TokenKind::Continue => Ok(Statement::Continue(self.next().span)),
            TokenKind::Ident(_) => {
                let first = self.ident()?;
                match self.peek().kind.clone() {
                    TokenKind::LParen => {
                        let call = self.finish_call(first)?;
                        Ok(Statement::Expression(ExpressionStatement {
                            span: call.span(),
                            expression: call,
                        }))
                    }
                    TokenKind::Comma | TokenKind::Assign => {
                        let mut targets = vec![first];
                        while self.at(&TokenKind::Comma) {
                            self.next();
                            targets.push(self.ident()?);
                        }
                        self.expect(TokenKind::Assign, "`:=`")?;
                        let value = self.expression()?;
                        Ok(Statement::Assignment(Assignment {
                            span: targets[0].span.to(value.span()),
                            targets,
                            value,
                        }))
                    }
                    _ => Err(self.error_here(
                        "expected call arguments or `:=` after identifier".into(),
                    )),
                }
            }
            _ => Err(self.error_here("expected statement".into())),
        }
    }

    fn variable_declaration(&mut self) -> Result<Statement> {
        let start = self.next().span; // let
        let mut variables = Vec::new();
        loop {
            let identifier = self.ident()?;
            variables.push(Binding {
                span: identifier.span,
                name: identifier.name,
            });
            if self.at(&TokenKind::Comma) {
                self.next();
            } else {
                break;
            }
        }
        let mut end = variables.last().map(|v| v.span).unwrap_or(start);
        let value = if self.at(&TokenKind::Assign) {
            self.next();
            let value = self.expression()?;
            end = value.span();
            Some(value)
        } else {
            None
        };
        Ok(Statement::VariableDeclaration(VariableDeclaration {
            span: start.to(end),
            variables,
            value,
        }))
    }

    fn function_definition(&mut self) -> Result<Statement> {
        let start = self.next().span; // function
        let name = self.ident()?;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut parameters = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let identifier = self.ident()?;
            parameters.push(Binding {
                span: identifier.span,
                name: identifier.name,
            });
            if self.at(&TokenKind::Comma) {
                self.next();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        let mut returns = Vec::new();
        if self.at(&TokenKind::Arrow) {
            self.next();
            loop {
                let identifier = self.ident()?;
                returns.push(Binding {
                    span: identifier.span,
                    name: identifier.name,
                });
                if self.at(&TokenKind::Comma) {
                    self.next();
                } else {
                    break;
                }
            }
        }
        let body = self.block()?;
        Ok(Statement::FunctionDefinition(FunctionDefinition {
            span: start.to(body.span),
            name: name.name,
            parameters,
            returns,
            body,
        }))
    }

    fn switch(&mut self) -> Result<Statement> {
        let start = self.next().span; // switch
        let expression = self.expression()?;
        let mut cases = Vec::new();
        let mut end = expression.span();
        loop {
            if self.at(&TokenKind::Case) {
                let case_span = self.next().span;
                let value = self.literal()?;
                let body = self.block()?;
                end = body.span;
                cases.push(Case {
                    span: case_span.to(body.span),
                    value: Some(value),
                    body,
                });
            } else if self.at(&TokenKind::Default) {
                let case_span = self.next().span;
                let body = self.block()?;
                end = body.span;
                cases.push(Case {
                    span: case_span.to(body.span),
                    value: None,
                    body,
                });
                break;
            } else {
                break;
            }
        }
        if cases.is_empty() {
            return Err(self.error_here("switch statement without cases".into()));
        }
        Ok(Statement::Switch(Switch {
            span: start.to(end),
            expression,
            cases,
        }))
    }

    fn expression(&mut self) -> Result<Expression> {
        let kind = self.peek().kind.clone();
        match kind {
            TokenKind::Number(_) | TokenKind::True | TokenKind::False | TokenKind::Str(_) => {
                Ok(Expression::Literal(self.literal()?))
            }
            TokenKind::Ident(_) => {
                let identifier = self.ident()?;
                if self.at(&TokenKind::LParen) {
                    self.finish_call(identifier)
                } else {
                    Ok(Expression::Identifier(identifier))
                }
            }
            _ => Err(self.error_here("expected expression".into())),
        }
    }

    fn finish_call(&mut self, function: Identifier) -> Result<Expression> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut arguments = Vec::new();
        while !self.at(&TokenKind::RParen) {
            arguments.push(self.expression()?);
            if self.at(&TokenKind::Comma) {
                self.next();
            } else {
                break;
            }
        }
        let close = self.expect(TokenKind::RParen, "`)`")?;
        let span = function.span.to(close.span);
        match Opcode::from_name(&function.name) {
            Some(op) => Ok(Expression::BuiltinCall(BuiltinCall {
                span,
                op,
                arguments,
            })),
            None => Ok(Expression::FunctionCall(FunctionCall {
                span,
                function,
                arguments,
            })),
        }
    }

    fn literal(&mut self) -> Result<Literal> {
        let token = self.next();
        match token.kind {
            TokenKind::Number(value) => Ok(Literal {
                span: token.span,
                kind: LiteralKind::Number,
                value,
            }),
            TokenKind::True => Ok(Literal {
                span: token.span,
                kind: LiteralKind::Boolean,
                value: "true".into(),
            }),
            TokenKind::False => Ok(Literal {
                span: token.span,
                kind: LiteralKind::Boolean,
                value: "false".into(),
            }),
            TokenKind::Str(value) => Ok(Literal {
                span: token.span,
                kind: LiteralKind::String,
                value,
            }),
            _ => Err(CoreError::Parse {
                msg: "expected literal".into(),
                span: token.span,
            }),
        }
    }

    fn object(&mut self) -> Result<Object> {
        self.expect(TokenKind::Object, "`object`")?;
        let name = match self.next() {
            Token {
                kind: TokenKind::Str(name),
                ..
            } => name,
            token => {
                return Err(CoreError::Parse {
                    msg: "expected object name string".into(),
                    span: token.span,
                });
            }
        };
        self.expect(TokenKind::LBrace, "`{`")?;
        self.expect(TokenKind::Code, "`code`")?;
        let code = self.block()?;
        let mut subobjects = Vec::new();
        loop {
            if self.at(&TokenKind::Object) {
                subobjects.push(ObjectNode::Object(self.object()?));
            } else if self.at(&TokenKind::Data) {
                self.next();
                let name = match self.next() {
                    Token {
                        kind: TokenKind::Str(name),
                        ..
                    } => name,
                    token => {
                        return Err(CoreError::Parse {
                            msg: "expected data segment name string".into(),
                            span: token.span,
                        });
                    }
                };
                let payload = match self.next() {
                    Token {
                        kind: TokenKind::Hex(bytes),
                        ..
                    } => bytes,
                    Token {
                        kind: TokenKind::Str(text),
                        ..
                    } => text.into_bytes(),
                    token => {
                        return Err(CoreError::Parse {
                            msg: "expected data payload".into(),
                            span: token.span,
                        });
                    }
                };
                subobjects.push(ObjectNode::Data { name, data: payload });
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(Object {
            name,
            code,
            subobjects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::printer::print_block;

    #[test]
    fn test_parse_simple_block() {
        let block = parse_block("{ let a := 1 let b := add(a, 2) }").unwrap();
        assert_eq!(block.statements.len(), 2);
    }

    #[test]
    fn test_builtin_classification() {
        let block = parse_block("{ let a := add(1, 2) let b := helper(a) }").unwrap();
        let Statement::VariableDeclaration(first) = &block.statements[0] else {
            panic!("expected declaration");
        };
        assert!(matches!(first.value, Some(Expression::BuiltinCall(_))));
        let Statement::VariableDeclaration(second) = &block.statements[1] else {
            panic!("expected declaration");
        };
        assert!(matches!(second.value, Some(Expression::FunctionCall(_))));
    }

    #[test]
    fn test_round_trip() {
        let source = "{ let a := 1 function f(x) -> y { y := add(x, a) } \
                      for { let i := 0 } lt(i, 10) { i := add(i, 1) } { \
                      if eq(i, 5) { break } } let r := f(a) pop(r) }";
        let block = parse_block(source).unwrap();
        let printed = print_block(&block);
        let reparsed = parse_block(&printed).unwrap();
        assert!(syntactic_eq(&block, &reparsed));
    }

    #[test]
    fn test_switch_parsing() {
        let block =
            parse_block("{ switch input(0) case 1 { stop() } default { trap() } }").unwrap();
        let Statement::Switch(switch) = &block.statements[0] else {
            panic!("expected switch");
        };
        assert_eq!(switch.cases.len(), 2);
        assert!(switch.cases[1].value.is_none());
    }

    #[test]
    fn test_parse_object_tree() {
        let object = parse_object(
            "object \"a\" { code { stop() } object \"b\" { code { trap() } } \
             data \"tbl\" hex\"00ff\" }",
        )
        .unwrap();
        assert_eq!(object.name, "a");
        assert_eq!(object.subobjects.len(), 2);
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse_block("{ let := 1 }").unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }));
    }
}
