//! Lexer, AST and recursive-descent parser for the candidate language.
//!
//! ```text
//! fn summarizer(text, max_len)
//!   let t = collapse_ws(trim(text))
//!   if len(t) <= max_len
//!     return t
//!   end
//!   return take(t, max_len)
//! end
//! ```
//!
//! Statements end at a newline (or `;`). Newlines inside parentheses and
//! brackets are ignored so long calls may wrap. `else if` chains share the
//! final `end`.

use std::fmt;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    If { cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    For { var: String, iter: Expr, body: Vec<Stmt> },
    Return(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<Expr>),
    Var(String),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
    Index { target: Box<Expr>, index: Box<Expr> },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Kw(Kw),
    Sym(&'static str),
    Newline,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kw {
    Fn,
    End,
    Let,
    If,
    Else,
    While,
    For,
    In,
    Return,
    And,
    Or,
    Not,
    True,
    False,
}

impl Kw {
    fn from_word(w: &str) -> Option<Kw> {
        Some(match w {
            "fn" => Kw::Fn,
            "end" => Kw::End,
            "let" => Kw::Let,
            "if" => Kw::If,
            "else" => Kw::Else,
            "while" => Kw::While,
            "for" => Kw::For,
            "in" => Kw::In,
            "return" => Kw::Return,
            "and" => Kw::And,
            "or" => Kw::Or,
            "not" => Kw::Not,
            "true" => Kw::True,
            "false" => Kw::False,
            _ => return None,
        })
    }
}

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "(", ")", "[", "]", ",", "+", "-", "*", "/", "%", "=", "<", ">", ";",
];

fn lex(source: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::new();
    let mut line = 1;
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    out.push((Tok::Newline, line));
                }
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                let start_line = line;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::new(start_line, "unterminated string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some('"') => s.push('"'),
                                Some('\\') => s.push('\\'),
                                // Unknown escapes stay verbatim so regex
                                // patterns read naturally.
                                Some(other) => {
                                    s.push('\\');
                                    s.push(*other);
                                }
                                None => return Err(ParseError::new(start_line, "unterminated string")),
                            }
                            i += 2;
                        }
                        Some(ch) => {
                            if *ch == '\n' {
                                line += 1;
                            }
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                out.push((Tok::Str(s), start_line));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let is_float = chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit());
                if is_float {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let tok = if is_float {
                    text.parse::<f64>().map(Tok::Float).map_err(|_| ())
                } else {
                    text.parse::<i64>().map(Tok::Int).map_err(|_| ())
                }
                .map_err(|()| ParseError::new(line, format!("bad number literal '{text}'")))?;
                out.push((tok, line));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = match Kw::from_word(&word) {
                    Some(kw) => Tok::Kw(kw),
                    None => Tok::Ident(word),
                };
                out.push((tok, line));
            }
            _ => {
                let sym = SYMBOLS.iter().find(|s| {
                    s.chars().enumerate().all(|(k, sc)| chars.get(i + k) == Some(&sc))
                });
                let Some(sym) = sym else {
                    return Err(ParseError::new(line, format!("unexpected character '{c}'")));
                };
                match *sym {
                    "(" | "[" => depth += 1,
                    ")" | "]" => depth = depth.saturating_sub(1),
                    _ => {}
                }
                i += sym.len();
                if *sym == ";" {
                    out.push((Tok::Newline, line));
                } else {
                    out.push((Tok::Sym(sym), line));
                }
            }
        }
    }
    out.push((Tok::Newline, line));
    out.push((Tok::Eof, line));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a whole source file into a [`Program`].
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = lex(source)?;
    let mut p = Parser { tokens, pos: 0, depth: 0 };
    let mut functions = Vec::new();
    p.skip_newlines();
    while !p.at(&Tok::Eof) {
        let f = p.function()?;
        if functions.iter().any(|g: &Function| g.name == f.name) {
            return Err(ParseError::new(f.line, format!("duplicate function '{}'", f.name)));
        }
        functions.push(f);
        p.skip_newlines();
    }
    if functions.is_empty() {
        return Err(ParseError::new(1, "no functions defined"));
    }
    Ok(Program { functions })
}

/// Nesting limit for blocks and expressions; keeps the recursive parser and
/// interpreter off the native stack limit.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map(|(t, _)| t).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, l)| *l).unwrap_or(0)
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_kw(&self, kw: Kw) -> bool {
        self.at(&Tok::Kw(kw))
    }

    fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line(), message)
    }

    fn expect_kw(&mut self, kw: Kw) -> Result<(), ParseError> {
        if self.at_kw(kw) {
            self.bump();
            Ok(())
        } else {
            Err(self.err(format!("expected {kw:?}, found {:?}", self.peek())))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ParseError> {
        if self.at_sym(sym) {
            self.bump();
            Ok(())
        } else {
            Err(self.err(format!("expected '{sym}', found {:?}", self.peek())))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.bump() {
            Tok::Ident(name) => Ok(name),
            other => Err(self.err(format!("expected identifier, found {other:?}"))),
        }
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Tok::Newline => {
                self.skip_newlines();
                Ok(())
            }
            Tok::Eof => Ok(()),
            other => Err(self.err(format!("expected end of line, found {other:?}"))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.at(&Tok::Newline) {
            self.bump();
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.err("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn function(&mut self) -> Result<Function, ParseError> {
        let line = self.line();
        self.expect_kw(Kw::Fn)?;
        let name = self.ident()?;
        self.expect_sym("(")?;
        let mut params = Vec::new();
        if !self.at_sym(")") {
            loop {
                params.push(self.ident()?);
                if self.at_sym(",") {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect_sym(")")?;
        self.end_of_statement()?;
        let body = self.block()?;
        self.expect_kw(Kw::End)?;
        self.end_of_statement()?;
        Ok(Function { name, params, body, line })
    }

    /// Statements up to (not including) `end` or `else`.
    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.enter()?;
        let mut body = Vec::new();
        self.skip_newlines();
        while !self.at_kw(Kw::End) && !self.at_kw(Kw::Else) {
            if self.at(&Tok::Eof) {
                return Err(self.err("missing 'end'"));
            }
            body.push(self.statement()?);
        }
        self.leave();
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let stmt = match self.peek().clone() {
            Tok::Kw(Kw::Let) => {
                self.bump();
                let name = self.ident()?;
                self.expect_sym("=")?;
                Stmt::Let { name, value: self.expr()? }
            }
            Tok::Kw(Kw::If) => return self.if_chain(),
            Tok::Kw(Kw::While) => {
                self.bump();
                let cond = self.expr()?;
                self.end_of_statement()?;
                let body = self.block()?;
                self.expect_kw(Kw::End)?;
                Stmt::While { cond, body }
            }
            Tok::Kw(Kw::For) => {
                self.bump();
                let var = self.ident()?;
                self.expect_kw(Kw::In)?;
                let iter = self.expr()?;
                self.end_of_statement()?;
                let body = self.block()?;
                self.expect_kw(Kw::End)?;
                Stmt::For { var, iter, body }
            }
            Tok::Kw(Kw::Return) => {
                self.bump();
                Stmt::Return(self.expr()?)
            }
            Tok::Ident(name) if matches!(self.tokens.get(self.pos + 1), Some((Tok::Sym("="), _))) => {
                self.bump();
                self.bump();
                Stmt::Assign { name, value: self.expr()? }
            }
            _ => Stmt::Expr(self.expr()?),
        };
        self.end_of_statement()?;
        Ok(stmt)
    }

    /// `if c ... [else if c ... ] [else ...] end` with a single closing `end`.
    fn if_chain(&mut self) -> Result<Stmt, ParseError> {
        self.expect_kw(Kw::If)?;
        let cond = self.expr()?;
        self.end_of_statement()?;
        let then_body = self.block()?;
        let else_body = if self.at_kw(Kw::Else) {
            self.bump();
            if self.at_kw(Kw::If) {
                self.enter()?;
                let nested = self.if_chain()?;
                self.leave();
                return Ok(Stmt::If { cond, then_body, else_body: vec![nested] });
            }
            self.end_of_statement()?;
            let body = self.block()?;
            if self.at_kw(Kw::Else) {
                return Err(self.err("'else' after 'else'"));
            }
            body
        } else {
            Vec::new()
        };
        self.expect_kw(Kw::End)?;
        self.end_of_statement()?;
        Ok(Stmt::If { cond, then_body, else_body })
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let e = self.or_expr();
        self.leave();
        e
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.at_kw(Kw::Or) {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.not_expr()?;
        while self.at_kw(Kw::And) {
            self.bump();
            let rhs = self.not_expr()?;
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.at_kw(Kw::Not) {
            self.bump();
            self.enter()?;
            let inner = self.not_expr()?;
            self.leave();
            return Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(inner) });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Tok::Sym("==") => BinOp::Eq,
            Tok::Sym("!=") => BinOp::Ne,
            Tok::Sym("<") => BinOp::Lt,
            Tok::Sym("<=") => BinOp::Le,
            Tok::Sym(">") => BinOp::Gt,
            Tok::Sym(">=") => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.additive()?;
        Ok(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("+") => BinOp::Add,
                Tok::Sym("-") => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("*") => BinOp::Mul,
                Tok::Sym("/") => BinOp::Div,
                Tok::Sym("%") => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.at_sym("-") {
            self.bump();
            self.enter()?;
            let inner = self.unary()?;
            self.leave();
            return Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(inner) });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut e = self.primary()?;
        while self.at_sym("[") {
            self.bump();
            let index = self.expr()?;
            self.expect_sym("]")?;
            e = Expr::Index { target: Box::new(e), index: Box::new(index) };
        }
        Ok(e)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Float(x) => Ok(Expr::Float(x)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Kw(Kw::True) => Ok(Expr::Bool(true)),
            Tok::Kw(Kw::False) => Ok(Expr::Bool(false)),
            Tok::Ident(name) => {
                if self.at_sym("(") {
                    self.bump();
                    let args = self.comma_list(")")?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Tok::Sym("(") => {
                let e = self.expr()?;
                self.expect_sym(")")?;
                Ok(e)
            }
            Tok::Sym("[") => Ok(Expr::List(self.comma_list("]")?)),
            other => Err(self.err(format!("unexpected {other:?}"))),
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn comma_list(&mut self, close: &str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.at_sym(close) {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.at_sym(",") {
                self.bump();
                continue;
            }
            self.expect_sym(close)?;
            return Ok(items);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_function() {
        let p = parse("fn f(text, max_len)\n  return text\nend\n").unwrap();
        assert_eq!(p.functions.len(), 1);
        let f = p.function("f").unwrap();
        assert_eq!(f.params, vec!["text", "max_len"]);
        assert_eq!(f.body, vec![Stmt::Return(Expr::Var("text".into()))]);
    }

    #[test]
    fn test_operator_precedence() {
        let p = parse("fn f(a, b)\nreturn 1 + 2 * 3\nend").unwrap();
        let Stmt::Return(Expr::Binary { op, rhs, .. }) = &p.functions[0].body[0] else {
            panic!("expected binary return");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_else_if_chain_shares_end() {
        let src = "fn f(a, b)\nif a < 1\nreturn \"x\"\nelse if a < 2\nreturn \"y\"\nelse\nreturn \"z\"\nend\nend";
        let p = parse(src).unwrap();
        let Stmt::If { else_body, .. } = &p.functions[0].body[0] else {
            panic!("expected if");
        };
        assert!(matches!(else_body[0], Stmt::If { .. }));
    }

    #[test]
    fn test_newlines_inside_parens_are_ignored() {
        let src = "fn f(a, b)\nreturn max(\n  1,\n  2\n)\nend";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn test_string_escapes() {
        let p = parse("fn f(a, b)\nreturn \"q\\\"\\n\\b\"\nend").unwrap();
        assert_eq!(p.functions[0].body[0], Stmt::Return(Expr::Str("q\"\n\\b".into())));
    }

    #[test]
    fn test_comments_and_semicolons() {
        let p = parse("# header\nfn f(a, b) # trailing\nlet x = 1; let y = 2\nreturn x + y\nend").unwrap();
        assert_eq!(p.functions[0].body.len(), 3);
    }

    #[test]
    fn test_missing_end_reports_line() {
        let err = parse("fn f(a, b)\nreturn a\n").unwrap_err();
        assert!(err.message.contains("end"), "{err}");
    }

    #[test]
    fn test_unexpected_character() {
        let err = parse("fn f(a, b)\nreturn a $ b\nend").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_duplicate_function_rejected() {
        assert!(parse("fn f(a)\nreturn a\nend\nfn f(b)\nreturn b\nend").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let src = format!("fn f(a, b)\nreturn {}1{}\nend", "(".repeat(200), ")".repeat(200));
        assert!(parse(&src).is_err());
    }

    #[test]
    fn test_empty_source_rejected() {
        assert!(parse("   \n# nothing\n").is_err());
    }

    #[test]
    fn test_index_and_list_literal() {
        let p = parse("fn f(a, b)\nlet xs = [1, 2, 3]\nreturn xs[0]\nend").unwrap();
        assert!(matches!(p.functions[0].body[1], Stmt::Return(Expr::Index { .. })));
    }
}
