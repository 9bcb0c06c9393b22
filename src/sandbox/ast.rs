//! Expression-language AST and parser for the sandbox.
//!
//! The sandbox accepts a small Python-shaped expression/statement
//! language: literals, arithmetic, comparisons, boolean operators,
//! subscripts, collections, assignment (plain and augmented), deletion,
//! `for`/`if`/conditional expressions, `pass`, guarded attribute access,
//! list comprehensions, `lambda`, calls with keyword arguments, and
//! interpolated strings. Denied constructs (`def`, `class`, `import`,
//! `try`, `raise`, `with`, `global`, `nonlocal`, `yield`, `async`,
//! `match`, `while`, `return`) are rejected structurally at parse time,
//! before anything executes.

use crate::error::SandboxError;

type ParseResult<T> = std::result::Result<T, SandboxError>;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
}

/// Boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BoolOp {
    And,
    Or,
}

/// A fragment of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    /// Literal text.
    Literal(String),
    /// An interpolated expression.
    Expr(Expr),
}

/// Expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// Interpolated string.
    FString(Vec<FStringPart>),
    /// Variable reference.
    Name(String),
    /// List literal.
    List(Vec<Expr>),
    /// Tuple literal.
    Tuple(Vec<Expr>),
    /// Dict literal.
    Dict(Vec<(Expr, Expr)>),
    /// Unary minus.
    Neg(Box<Expr>),
    /// `not`
    Not(Box<Expr>),
    /// Binary arithmetic.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Chained comparison.
    Compare {
        /// First operand.
        left: Box<Expr>,
        /// Operator/operand pairs.
        rest: Vec<(CmpOp, Expr)>,
    },
    /// Short-circuit boolean expression.
    BoolChain {
        /// Operator.
        op: BoolOp,
        /// Operands, evaluated left to right.
        values: Vec<Expr>,
    },
    /// `value[index]`
    Subscript {
        /// Container expression.
        value: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// `value.attr` (post-filtered).
    Attribute {
        /// Receiver expression.
        value: Box<Expr>,
        /// Attribute name.
        attr: String,
    },
    /// Function or method call.
    Call {
        /// Callee.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments.
        kwargs: Vec<(String, Expr)>,
    },
    /// `lambda a, b: expr`
    Lambda {
        /// Parameter names.
        params: Vec<String>,
        /// Body expression.
        body: Box<Expr>,
    },
    /// `body if test else orelse`
    Conditional {
        /// Value when the test holds.
        body: Box<Expr>,
        /// Condition.
        test: Box<Expr>,
        /// Value otherwise.
        orelse: Box<Expr>,
    },
    /// `[elt for var in iter if cond]`
    ListComp {
        /// Element expression.
        elt: Box<Expr>,
        /// Loop variable.
        var: String,
        /// Iterable expression.
        iter: Box<Expr>,
        /// Optional filter.
        cond: Option<Box<Expr>>,
    },
}

/// Assignment / deletion targets.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Plain name.
    Name(String),
    /// `container[index]`
    Subscript {
        /// Container expression.
        value: Expr,
        /// Index expression.
        index: Expr,
    },
}

/// Statements.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Bare expression.
    Expr(Expr),
    /// `target = value`
    Assign {
        /// Assignment target.
        target: Target,
        /// Assigned value.
        value: Expr,
    },
    /// `target op= value`
    AugAssign {
        /// Assignment target.
        target: Target,
        /// Operator.
        op: BinOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `del target`
    Del(Target),
    /// `pass`
    Pass,
    /// `if`/`elif`/`else`
    If {
        /// Condition.
        test: Expr,
        /// Then-branch.
        body: Vec<Stmt>,
        /// Else-branch (possibly another `If`).
        orelse: Vec<Stmt>,
    },
    /// `for var in iter:`
    For {
        /// Loop variable.
        var: String,
        /// Iterable.
        iter: Expr,
        /// Body.
        body: Vec<Stmt>,
    },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

const KEYWORDS: &[&str] = &[
    "True", "False", "None", "and", "or", "not", "in", "if", "elif", "else", "for", "del", "pass",
    "lambda",
];

/// Statement keywords outside the allow-list, with the node kind reported
/// in the rejection.
const DENIED_KEYWORDS: &[(&str, &str)] = &[
    ("def", "function_def"),
    ("class", "class_def"),
    ("import", "import"),
    ("from", "import_from"),
    ("try", "try_statement"),
    ("raise", "raise_statement"),
    ("with", "with_statement"),
    ("global", "global_statement"),
    ("nonlocal", "nonlocal_statement"),
    ("yield", "yield_expression"),
    ("async", "async_def"),
    ("await", "await_expression"),
    ("match", "match_statement"),
    ("while", "while_statement"),
    ("return", "return_statement"),
    ("assert", "assert_statement"),
    ("break", "break_statement"),
    ("continue", "continue_statement"),
];

fn denied_kind(word: &str) -> Option<&'static str> {
    DENIED_KEYWORDS
        .iter()
        .find(|(kw, _)| *kw == word)
        .map(|(_, kind)| *kind)
}

struct Tokenizer<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn tokenize(mut self) -> ParseResult<Vec<Tok>> {
        let mut tokens = Vec::new();
        let mut indents = vec![0usize];
        let mut paren_depth = 0usize;
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && paren_depth == 0 {
                let indent = self.measure_indent();
                // Blank lines and comment-only lines produce no tokens.
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    continue;
                }
                if self.peek() == Some('#') {
                    self.skip_comment();
                    continue;
                }
                if self.pos >= self.chars.len() {
                    break;
                }
                let current = *indents.last().unwrap_or(&0);
                if indent > current {
                    indents.push(indent);
                    tokens.push(Tok::Indent);
                } else {
                    while indent < *indents.last().unwrap_or(&0) {
                        indents.pop();
                        tokens.push(Tok::Dedent);
                    }
                    if indent != *indents.last().unwrap_or(&0) {
                        return Err(SandboxError::Parse {
                            message: "inconsistent indentation".to_string(),
                        });
                    }
                }
                at_line_start = false;
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if paren_depth == 0 {
                        tokens.push(Tok::Newline);
                        at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '"' | '\'' => tokens.push(self.read_string(c, false)?),
                'f' if matches!(self.peek_at(1), Some('"' | '\'')) => {
                    self.pos += 1;
                    let quote = self.peek().unwrap_or('"');
                    tokens.push(self.read_string(quote, true)?);
                }
                c if c.is_ascii_digit() => tokens.push(self.read_number()?),
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.read_word();
                    if let Some(kind) = denied_kind(&word) {
                        return Err(SandboxError::ForbiddenNode {
                            kind: kind.to_string(),
                        });
                    }
                    if let Some(kw) = KEYWORDS.iter().copied().find(|k| *k == word) {
                        tokens.push(Tok::Keyword(kw));
                    } else {
                        tokens.push(Tok::Ident(word));
                    }
                }
                '(' | '[' | '{' => {
                    paren_depth += 1;
                    tokens.push(Tok::Op(match c {
                        '(' => "(",
                        '[' => "[",
                        _ => "{",
                    }));
                    self.pos += 1;
                }
                ')' | ']' | '}' => {
                    paren_depth = paren_depth.saturating_sub(1);
                    tokens.push(Tok::Op(match c {
                        ')' => ")",
                        ']' => "]",
                        _ => "}",
                    }));
                    self.pos += 1;
                }
                _ => tokens.push(self.read_operator()?),
            }
        }

        while indents.len() > 1 {
            indents.pop();
            tokens.push(Tok::Dedent);
        }
        tokens.push(Tok::Eof);
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn measure_indent(&mut self) -> usize {
        let mut indent = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => indent += 1,
                '\t' => indent += 8,
                _ => break,
            }
            self.pos += 1;
        }
        indent
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn read_number(&mut self) -> ParseResult<Tok> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())
            {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            text.parse::<f64>().map(Tok::Float).map_err(|_| SandboxError::Parse {
                message: format!("bad float literal: {text}"),
            })
        } else {
            text.parse::<i64>().map(Tok::Int).map_err(|_| SandboxError::Parse {
                message: format!("bad integer literal: {text}"),
            })
        }
    }

    fn read_string(&mut self, quote: char, interpolated: bool) -> ParseResult<Tok> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(SandboxError::Parse {
                        message: "unterminated string literal".to_string(),
                    });
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| SandboxError::Parse {
                        message: "dangling escape".to_string(),
                    })?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                    self.pos += 1;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(if interpolated {
            Tok::FStr(out)
        } else {
            Tok::Str(out)
        })
    }

    fn read_operator(&mut self) -> ParseResult<Tok> {
        const TWO_CHAR: &[&str] = &[
            "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
        ];
        let rest: String = self.chars[self.pos..self.chars.len().min(self.pos + 2)]
            .iter()
            .collect();
        for op in TWO_CHAR {
            if rest.starts_with(op) {
                self.pos += 2;
                return Ok(Tok::Op(op));
            }
        }
        const ONE_CHAR: &[&str] = &["+", "-", "*", "/", "%", "<", ">", "=", ",", ":", ".", ";"];
        let c = self.peek().unwrap_or('\0');
        for op in ONE_CHAR {
            if op.chars().next() == Some(c) {
                self.pos += 1;
                return Ok(Tok::Op(op));
            }
        }
        Err(SandboxError::Parse {
            message: format!(
                "unexpected character {c:?} at byte {} of {}",
                self.pos,
                self.source.len()
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

/// Parses sandbox code into a statement list.
///
/// # Errors
///
/// Returns [`SandboxError::ForbiddenNode`] for denied constructs and
/// [`SandboxError::Parse`] for malformed input.
pub fn parse(source: &str) -> ParseResult<Vec<Stmt>> {
    let tokens = Tokenizer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_block_until_eof()
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).unwrap_or(&Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Tok::Eof);
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Tok::Op(o) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(SandboxError::Parse {
                message: format!("expected {op:?}, found {:?}", self.peek()),
            })
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Tok::Keyword(k) if *k == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
        }
    }

    fn parse_block_until_eof(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), Tok::Eof) {
                return Ok(stmts);
            }
            stmts.push(self.parse_statement()?);
        }
    }

    /// Parses an indented block following a `:`.
    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        // Inline form: `if x: y = 1`
        if !matches!(self.peek(), Tok::Newline) {
            let stmt = self.parse_statement()?;
            return Ok(vec![stmt]);
        }
        self.skip_newlines();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(SandboxError::Parse {
                message: "expected an indented block".to_string(),
            });
        }
        self.pos += 1;
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    return Ok(stmts);
                }
                Tok::Eof => return Ok(stmts),
                _ => stmts.push(self.parse_statement()?),
            }
        }
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        if self.eat_keyword("pass") {
            self.end_statement()?;
            return Ok(Stmt::Pass);
        }
        if self.eat_keyword("del") {
            let target = self.parse_target()?;
            self.end_statement()?;
            return Ok(Stmt::Del(target));
        }
        if self.eat_keyword("if") {
            return self.parse_if();
        }
        if self.eat_keyword("for") {
            return self.parse_for();
        }

        let expr = self.parse_expr()?;

        if self.eat_op("=") {
            let target = expr_to_target(expr)?;
            let value = self.parse_expr()?;
            self.end_statement()?;
            return Ok(Stmt::Assign { target, value });
        }

        for (op_text, op) in [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("/=", BinOp::Div),
        ] {
            if self.eat_op(op_text) {
                let target = expr_to_target(expr)?;
                let value = self.parse_expr()?;
                self.end_statement()?;
                return Ok(Stmt::AugAssign { target, op, value });
            }
        }

        self.end_statement()?;
        Ok(Stmt::Expr(expr))
    }

    fn end_statement(&mut self) -> ParseResult<()> {
        // Statements end at a newline, semicolon, dedent or EOF.
        if self.eat_op(";") {
            return Ok(());
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Dedent | Tok::Eof => Ok(()),
            other => Err(SandboxError::Parse {
                message: format!("unexpected token after statement: {other:?}"),
            }),
        }
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let test = self.parse_expr()?;
        self.expect_op(":")?;
        let body = self.parse_block()?;
        self.skip_newlines();

        let orelse = if self.eat_keyword("elif") {
            vec![self.parse_if()?]
        } else if self.eat_keyword("else") {
            self.expect_op(":")?;
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If { test, body, orelse })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let Tok::Ident(var) = self.advance() else {
            return Err(SandboxError::Parse {
                message: "expected loop variable".to_string(),
            });
        };
        if !self.eat_keyword("in") {
            return Err(SandboxError::Parse {
                message: "expected 'in' in for statement".to_string(),
            });
        }
        let iter = self.parse_expr()?;
        self.expect_op(":")?;
        let body = self.parse_block()?;
        Ok(Stmt::For { var, iter, body })
    }

    fn parse_target(&mut self) -> ParseResult<Target> {
        let expr = self.parse_postfix()?;
        expr_to_target(expr)
    }

    // Expression grammar, lowest precedence first.

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("lambda") {
            let mut params = Vec::new();
            if !matches!(self.peek(), Tok::Op(":")) {
                loop {
                    let Tok::Ident(name) = self.advance() else {
                        return Err(SandboxError::Parse {
                            message: "expected lambda parameter name".to_string(),
                        });
                    };
                    params.push(name);
                    if !self.eat_op(",") {
                        break;
                    }
                }
            }
            self.expect_op(":")?;
            let body = self.parse_expr()?;
            return Ok(Expr::Lambda {
                params,
                body: Box::new(body),
            });
        }

        let body = self.parse_or()?;
        if self.eat_keyword("if") {
            let test = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(SandboxError::Parse {
                    message: "conditional expression missing 'else'".to_string(),
                });
            }
            let orelse = self.parse_expr()?;
            return Ok(Expr::Conditional {
                body: Box::new(body),
                test: Box::new(test),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let first = self.parse_and()?;
        if !matches!(self.peek(), Tok::Keyword("or")) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let first = self.parse_not()?;
        if !matches!(self.peek(), Tok::Keyword("and")) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::And,
            values,
        })
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => Some(CmpOp::Eq),
                Tok::Op("!=") => Some(CmpOp::NotEq),
                Tok::Op("<") => Some(CmpOp::Lt),
                Tok::Op("<=") => Some(CmpOp::LtE),
                Tok::Op(">") => Some(CmpOp::Gt),
                Tok::Op(">=") => Some(CmpOp::GtE),
                Tok::Keyword("in") => Some(CmpOp::In),
                Tok::Keyword("not") => {
                    // `not in`
                    if matches!(self.tokens.get(self.pos + 1), Some(Tok::Keyword("in"))) {
                        self.pos += 1;
                        Some(CmpOp::NotIn)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(op) = op else { break };
            self.pos += 1;
            let right = self.parse_additive()?;
            rest.push((op, right));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.eat_op("-") {
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        if self.eat_op("+") {
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat_op("**") {
            // Right associative.
            let exp = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.parse_call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.parse_expr()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let Tok::Ident(attr) = self.advance() else {
                    return Err(SandboxError::Parse {
                        message: "expected attribute name after '.'".to_string(),
                    });
                };
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat_op(")") {
            return Ok((args, kwargs));
        }
        loop {
            // Keyword argument: ident '=' expr (but not '==').
            if let (Tok::Ident(name), Some(Tok::Op("="))) =
                (self.peek().clone(), self.tokens.get(self.pos + 1))
            {
                self.pos += 2;
                let value = self.parse_expr()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(SandboxError::Parse {
                        message: "positional argument after keyword argument".to_string(),
                    });
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            Tok::Int(v) => Ok(Expr::Int(v)),
            Tok::Float(v) => Ok(Expr::Float(v)),
            Tok::Str(v) => Ok(Expr::Str(v)),
            Tok::FStr(raw) => parse_fstring(&raw),
            Tok::Keyword("True") => Ok(Expr::Bool(true)),
            Tok::Keyword("False") => Ok(Expr::Bool(false)),
            Tok::Keyword("None") => Ok(Expr::None),
            Tok::Keyword("lambda") => {
                self.pos -= 1;
                self.parse_conditional()
            }
            Tok::Ident(name) => Ok(Expr::Name(name)),
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.eat_op(",") {
                    let mut items = vec![first];
                    if !matches!(self.peek(), Tok::Op(")")) {
                        loop {
                            items.push(self.parse_expr()?);
                            if !self.eat_op(",") {
                                break;
                            }
                            if matches!(self.peek(), Tok::Op(")")) {
                                break;
                            }
                        }
                    }
                    self.expect_op(")")?;
                    Ok(Expr::Tuple(items))
                } else {
                    self.expect_op(")")?;
                    Ok(first)
                }
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expr()?;
                // List comprehension.
                if self.eat_keyword("for") {
                    let Tok::Ident(var) = self.advance() else {
                        return Err(SandboxError::Parse {
                            message: "expected comprehension variable".to_string(),
                        });
                    };
                    if !self.eat_keyword("in") {
                        return Err(SandboxError::Parse {
                            message: "expected 'in' in comprehension".to_string(),
                        });
                    }
                    let iter = self.parse_or()?;
                    let cond = if self.eat_keyword("if") {
                        Some(Box::new(self.parse_or()?))
                    } else {
                        None
                    };
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        var,
                        iter: Box::new(iter),
                        cond,
                    });
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if matches!(self.peek(), Tok::Op("]")) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                if self.eat_op("}") {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let mut pairs = Vec::new();
                loop {
                    let key = self.parse_expr()?;
                    self.expect_op(":")?;
                    let value = self.parse_expr()?;
                    pairs.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                    if matches!(self.peek(), Tok::Op("}")) {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(pairs))
            }
            other => Err(SandboxError::Parse {
                message: format!("unexpected token: {other:?}"),
            }),
        }
    }
}

/// Parses the body of an interpolated string into parts.
fn parse_fstring(raw: &str) -> ParseResult<Expr> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let mut inner = String::new();
                let mut depth = 1;
                for ic in chars.by_ref() {
                    match ic {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    inner.push(ic);
                }
                if depth != 0 {
                    return Err(SandboxError::Parse {
                        message: "unbalanced braces in interpolated string".to_string(),
                    });
                }
                let stmts = parse(&inner)?;
                match stmts.as_slice() {
                    [Stmt::Expr(expr)] => parts.push(FStringPart::Expr(expr.clone())),
                    _ => {
                        return Err(SandboxError::Parse {
                            message: "interpolation must be a single expression".to_string(),
                        });
                    }
                }
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(Expr::FString(parts))
}

fn expr_to_target(expr: Expr) -> ParseResult<Target> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Subscript { value, index } => Ok(Target::Subscript {
            value: *value,
            index: *index,
        }),
        other => Err(SandboxError::Parse {
            message: format!("invalid assignment target: {other:?}"),
        }),
    }
}

/// Walks every expression in a statement list, invoking `visit` on each.
pub fn visit_exprs(stmts: &[Stmt], visit: &mut dyn FnMut(&Expr)) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) => visit_expr(e, visit),
            Stmt::Assign { target, value } | Stmt::AugAssign { target, value, .. } => {
                visit_target(target, visit);
                visit_expr(value, visit);
            }
            Stmt::Del(target) => visit_target(target, visit),
            Stmt::Pass => {}
            Stmt::If { test, body, orelse } => {
                visit_expr(test, visit);
                visit_exprs(body, visit);
                visit_exprs(orelse, visit);
            }
            Stmt::For { iter, body, .. } => {
                visit_expr(iter, visit);
                visit_exprs(body, visit);
            }
        }
    }
}

fn visit_target(target: &Target, visit: &mut dyn FnMut(&Expr)) {
    if let Target::Subscript { value, index } = target {
        visit_expr(value, visit);
        visit_expr(index, visit);
    }
}

fn visit_expr(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::None
        | Expr::Bool(_)
        | Expr::Int(_)
        | Expr::Float(_)
        | Expr::Str(_)
        | Expr::Name(_) => {}
        Expr::FString(parts) => {
            for part in parts {
                if let FStringPart::Expr(e) = part {
                    visit_expr(e, visit);
                }
            }
        }
        Expr::List(items) | Expr::Tuple(items) => {
            for item in items {
                visit_expr(item, visit);
            }
        }
        Expr::Dict(pairs) => {
            for (k, v) in pairs {
                visit_expr(k, visit);
                visit_expr(v, visit);
            }
        }
        Expr::Neg(e) | Expr::Not(e) => visit_expr(e, visit),
        Expr::Binary { left, right, .. } => {
            visit_expr(left, visit);
            visit_expr(right, visit);
        }
        Expr::Compare { left, rest } => {
            visit_expr(left, visit);
            for (_, e) in rest {
                visit_expr(e, visit);
            }
        }
        Expr::BoolChain { values, .. } => {
            for value in values {
                visit_expr(value, visit);
            }
        }
        Expr::Subscript { value, index } => {
            visit_expr(value, visit);
            visit_expr(index, visit);
        }
        Expr::Attribute { value, .. } => visit_expr(value, visit),
        Expr::Call { func, args, kwargs } => {
            visit_expr(func, visit);
            for arg in args {
                visit_expr(arg, visit);
            }
            for (_, value) in kwargs {
                visit_expr(value, visit);
            }
        }
        Expr::Lambda { body, .. } => visit_expr(body, visit),
        Expr::Conditional { body, test, orelse } => {
            visit_expr(body, visit);
            visit_expr(test, visit);
            visit_expr(orelse, visit);
        }
        Expr::ListComp {
            elt, iter, cond, ..
        } => {
            visit_expr(elt, visit);
            visit_expr(iter, visit);
            if let Some(cond) = cond {
                visit_expr(cond, visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("42").unwrap(), vec![Stmt::Expr(Expr::Int(42))]);
        assert_eq!(
            parse("3.5").unwrap(),
            vec![Stmt::Expr(Expr::Float(3.5))]
        );
        assert_eq!(
            parse("'hi'").unwrap(),
            vec![Stmt::Expr(Expr::Str("hi".to_string()))]
        );
        assert_eq!(parse("True").unwrap(), vec![Stmt::Expr(Expr::Bool(true))]);
        assert_eq!(parse("None").unwrap(), vec![Stmt::Expr(Expr::None)]);
    }

    #[test]
    fn test_parse_assignment_and_augmented() {
        let stmts = parse("x = 1\nx += 2").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(&stmts[0], Stmt::Assign { .. }));
        assert!(matches!(
            &stmts[1],
            Stmt::AugAssign { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        let stmts = parse("1 + 2 * 3").unwrap();
        let Stmt::Expr(Expr::Binary { op, right, .. }) = &stmts[0] else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_parse_comparison_chain() {
        let stmts = parse("1 < x <= 10").unwrap();
        let Stmt::Expr(Expr::Compare { rest, .. }) = &stmts[0] else {
            panic!("expected comparison");
        };
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_parse_collections() {
        assert!(matches!(
            parse("[1, 2, 3]").unwrap()[0],
            Stmt::Expr(Expr::List(_))
        ));
        assert!(matches!(
            parse("(1, 2)").unwrap()[0],
            Stmt::Expr(Expr::Tuple(_))
        ));
        assert!(matches!(
            parse("{'a': 1}").unwrap()[0],
            Stmt::Expr(Expr::Dict(_))
        ));
    }

    #[test]
    fn test_parse_if_for_blocks() {
        let code = "if x > 1:\n    y = 2\nelse:\n    y = 3\nfor i in [1, 2]:\n    y += i";
        let stmts = parse(code).unwrap();
        assert!(matches!(&stmts[0], Stmt::If { orelse, .. } if !orelse.is_empty()));
        assert!(matches!(&stmts[1], Stmt::For { .. }));
    }

    #[test]
    fn test_parse_call_with_kwargs() {
        let stmts = parse("grep('fn main', max_matches=5)").unwrap();
        let Stmt::Expr(Expr::Call { args, kwargs, .. }) = &stmts[0] else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert_eq!(kwargs[0].0, "max_matches");
    }

    #[test]
    fn test_parse_lambda_and_conditional() {
        assert!(matches!(
            parse("lambda a, b: a + b").unwrap()[0],
            Stmt::Expr(Expr::Lambda { .. })
        ));
        assert!(matches!(
            parse("1 if x else 2").unwrap()[0],
            Stmt::Expr(Expr::Conditional { .. })
        ));
    }

    #[test]
    fn test_parse_list_comprehension() {
        let stmts = parse("[x * 2 for x in items if x > 0]").unwrap();
        assert!(matches!(
            &stmts[0],
            Stmt::Expr(Expr::ListComp { cond: Some(_), .. })
        ));
    }

    #[test]
    fn test_parse_fstring() {
        let stmts = parse("f\"count: {n + 1}\"").unwrap();
        let Stmt::Expr(Expr::FString(parts)) = &stmts[0] else {
            panic!("expected fstring");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], FStringPart::Literal(s) if s == "count: "));
        assert!(matches!(&parts[1], FStringPart::Expr(_)));
    }

    #[test]
    fn test_denied_keywords_rejected_with_kind() {
        for (code, kind) in [
            ("def f(): pass", "function_def"),
            ("class C: pass", "class_def"),
            ("import os", "import"),
            ("from os import path", "import_from"),
            ("try: pass", "try_statement"),
            ("raise ValueError", "raise_statement"),
            ("with open('x'): pass", "with_statement"),
            ("global x", "global_statement"),
            ("yield 1", "yield_expression"),
            ("while True: pass", "while_statement"),
            ("match x: pass", "match_statement"),
            ("return 1", "return_statement"),
        ] {
            let err = parse(code).unwrap_err();
            match err {
                SandboxError::ForbiddenNode { kind: k } => assert_eq!(k, kind, "{code}"),
                other => panic!("expected ForbiddenNode for {code}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unterminated_string_is_parse_error() {
        assert!(matches!(
            parse("'oops").unwrap_err(),
            SandboxError::Parse { .. }
        ));
    }

    #[test]
    fn test_multiline_collections_ignore_newlines() {
        let stmts = parse("[1,\n 2,\n 3]").unwrap();
        let Stmt::Expr(Expr::List(items)) = &stmts[0] else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_attribute_and_subscript_postfix() {
        let stmts = parse("data['key'].upper()").unwrap();
        assert!(matches!(
            &stmts[0],
            Stmt::Expr(Expr::Call { func, .. }) if matches!(**func, Expr::Attribute { .. })
        ));
    }

    #[test]
    fn test_visit_exprs_reaches_nested() {
        let stmts = parse("x = [a.b for a in items]").unwrap();
        let mut attrs = Vec::new();
        visit_exprs(&stmts, &mut |e| {
            if let Expr::Attribute { attr, .. } = e {
                attrs.push(attr.clone());
            }
        });
        assert_eq!(attrs, vec!["b".to_string()]);
    }
}
