use super::ast::*;
use super::error::{CompileError, ErrorCode};
use super::lexer::{Keyword, SpannedToken, Token};

/// Deepest combined nesting of blocks, parentheses and unary operators.
const MAX_NESTING: usize = 40;

/// Parse a token stream. Always returns a (possibly partial) tree together
/// with every syntax error found; a statement that fails to parse is
/// skipped up to the next statement boundary.
pub fn parse(tokens: Vec<SpannedToken>) -> (Program, Vec<CompileError>) {
    let mut parser = Parser::new(tokens);
    let program = parser.parse_program();
    (program, parser.errors)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
    next_id: u32,
    seen_statement: bool,
    depth: usize,
}

/// The callee of the last call parsed in a postfix chain, kept so a call
/// statement written without parentheses (`foo (a), b`) can be re-split.
struct LastCall {
    lparen: usize,
    callee: Expr,
}

impl Parser {
    fn new(mut tokens: Vec<SpannedToken>) -> Self {
        if !matches!(tokens.last().map(|t| &t.token), Some(Token::Eof)) {
            let end = tokens.last().map(|t| t.span.end).unwrap_or_default();
            tokens.push(SpannedToken {
                token: Token::Eof,
                span: Span::at(end),
            });
        }
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            next_id: 0,
            seen_statement: false,
            depth: 0,
        }
    }

    fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        let body = self.parse_body(|_| false);
        program.option_explicit = body.iter().any(|s| matches!(s.kind, StmtKind::OptionExplicit));
        program.body = body;
        program.stmt_count = self.next_id;
        program
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        self.tokens.get(self.pos + n).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or_else(Span::default, |t| t.span)
    }

    fn start(&self) -> Location {
        self.span().start
    }

    /// End of the most recently consumed token.
    fn last_end(&self) -> Location {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or_else(|| self.start(), |t| t.span.end)
    }

    fn span_from(&self, start: Location) -> Span {
        Span::new(start, self.last_end())
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn at_kw(&self, k: Keyword) -> bool {
        matches!(self.peek(), Token::Keyword(kw) if *kw == k)
    }

    fn nth_is_kw(&self, n: usize, k: Keyword) -> bool {
        matches!(self.peek_nth(n), Token::Keyword(kw) if *kw == k)
    }

    fn at_end_of(&self, k: Keyword) -> bool {
        self.at_kw(Keyword::End) && self.nth_is_kw(1, k)
    }

    fn advance(&mut self) -> SpannedToken {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, k: Keyword) -> bool {
        if self.at_kw(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn describe(token: &Token) -> String {
        match token {
            Token::Ident(name) => format!("'{name}'"),
            Token::Keyword(k) => format!("'{}'", k.as_str()),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of file".to_string(),
            other => format!("{other:?}"),
        }
    }

    fn error_here(&self, code: ErrorCode, what: &str) -> CompileError {
        CompileError::parser(
            code,
            format!("Expected {what}, found {}", Self::describe(self.peek())),
            self.span(),
        )
    }

    /// Run `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, CompileError>) -> Result<T, CompileError> {
        if self.depth >= MAX_NESTING {
            return Err(CompileError::parser(
                ErrorCode::TooManyItems,
                format!("Nesting is deeper than {MAX_NESTING} levels"),
                self.span(),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expect(&mut self, expected: &Token, code: ErrorCode, what: &str) -> Result<Span, CompileError> {
        if self.peek() == expected {
            Ok(self.advance().span)
        } else {
            Err(self.error_here(code, what))
        }
    }

    fn expect_kw(&mut self, k: Keyword, code: ErrorCode) -> Result<Span, CompileError> {
        if self.at_kw(k) {
            Ok(self.advance().span)
        } else {
            Err(self.error_here(code, &format!("'{}'", k.as_str())))
        }
    }

    fn expect_ident(&mut self) -> Result<Ident, CompileError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                let span = self.advance().span;
                Ok(Ident::new(name, span))
            }
            Token::Keyword(k) if k.is_contextual() => {
                let span = self.advance().span;
                let text = self.source_word(k);
                Ok(Ident::new(text, span))
            }
            _ => Err(self.error_here(ErrorCode::ExpectedIdentifier, "identifier")),
        }
    }

    /// Spelling for a keyword used as a name. The lexer keeps only the
    /// keyword, so the canonical capitalization is used.
    fn source_word(&self, k: Keyword) -> String {
        let s = k.as_str();
        let mut chars = s.chars();
        chars
            .next()
            .map(|c| c.to_ascii_uppercase().to_string() + chars.as_str())
            .unwrap_or_default()
    }

    fn at_terminator(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Colon | Token::Eof)
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Colon) {
            self.advance();
        }
    }

    fn expect_terminator(&mut self) -> Result<(), CompileError> {
        match self.peek() {
            Token::Newline | Token::Colon => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            _ => Err(self.error_here(ErrorCode::ExpectedEndOfStatement, "end of statement")),
        }
    }

    /// Skip the rest of the current statement.
    fn recover_to_terminator(&mut self) {
        while !self.at_terminator() {
            self.advance();
        }
    }

    fn stmt(&mut self, kind: StmtKind, start: Location) -> Stmt {
        let id = StmtId(self.next_id);
        self.next_id += 1;
        Stmt {
            id,
            kind,
            span: self.span_from(start),
        }
    }

    // ── Statements ────────────────────────────────────────────────

    /// Statements up to (not including) the point where `is_end` holds or
    /// the input ends.
    fn parse_body(&mut self, is_end: impl Fn(&Self) -> bool) -> Vec<Stmt> {
        let mut body = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_eof() || is_end(self) {
                break;
            }
            match self.nested(Self::parse_statement) {
                Ok(stmt) => {
                    body.push(stmt);
                    if let Err(e) = self.expect_terminator() {
                        self.errors.push(e);
                        self.recover_to_terminator();
                    }
                }
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_terminator();
                }
            }
        }
        body
    }

    fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        let start = self.start();
        let first_statement = !self.seen_statement;
        self.seen_statement = true;
        let Token::Keyword(k) = self.peek().clone() else {
            return self.parse_simple_statement(start);
        };
        match k {
            Keyword::Option => {
                self.advance();
                self.expect_kw(Keyword::Explicit, ErrorCode::SyntaxError)?;
                if !first_statement {
                    return Err(CompileError::parser(
                        ErrorCode::SyntaxError,
                        "Option Explicit must be the first statement",
                        self.span_from(start),
                    ));
                }
                Ok(self.stmt(StmtKind::OptionExplicit, start))
            }
            Keyword::Dim => {
                self.advance();
                let vars = self.parse_var_decls()?;
                Ok(self.stmt(
                    StmtKind::Dim {
                        visibility: Visibility::Dim,
                        vars,
                    },
                    start,
                ))
            }
            Keyword::Public | Keyword::Private => self.parse_visibility_statement(start),
            Keyword::Const => {
                self.advance();
                self.parse_const(Visibility::Dim, start)
            }
            Keyword::ReDim => self.parse_redim(start),
            Keyword::Erase => {
                self.advance();
                let mut names = vec![self.expect_ident()?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_ident()?);
                }
                Ok(self.stmt(StmtKind::Erase(names), start))
            }
            Keyword::Set => {
                self.advance();
                let (target, _) = self.parse_postfix()?;
                self.expect(&Token::Eq, ErrorCode::ExpectedEquals, "'='")?;
                let value = self.parse_expr()?;
                Ok(self.stmt(
                    StmtKind::Assign {
                        target,
                        value,
                        set: true,
                    },
                    start,
                ))
            }
            Keyword::Call => {
                self.advance();
                let (target, _) = self.parse_postfix()?;
                let (target, args) = match target.kind {
                    ExprKind::Call { target, args } => (*target, args),
                    _ => (target, Vec::new()),
                };
                Ok(self.stmt(StmtKind::Call { target, args }, start))
            }
            Keyword::If => self.parse_if(start),
            Keyword::For => self.parse_for(start),
            Keyword::Do => self.parse_do(start),
            Keyword::While => {
                self.advance();
                let expr = self.parse_expr()?;
                let body = self.parse_body(|p| p.at_kw(Keyword::Wend));
                self.expect_kw(Keyword::Wend, ErrorCode::ExpectedWend)?;
                Ok(self.stmt(
                    StmtKind::Do {
                        pre: Some(LoopCondition {
                            kind: LoopKind::While,
                            expr,
                        }),
                        post: None,
                        body,
                    },
                    start,
                ))
            }
            Keyword::Select => self.parse_select(start),
            Keyword::With => {
                self.advance();
                let object = self.parse_expr()?;
                let body = self.parse_body(|p| p.at_end_of(Keyword::With));
                self.expect_end(Keyword::With, ErrorCode::ExpectedWith)?;
                Ok(self.stmt(StmtKind::With { object, body }, start))
            }
            Keyword::Exit => {
                self.advance();
                let kind = match self.peek() {
                    Token::Keyword(Keyword::Do) => ExitKind::Do,
                    Token::Keyword(Keyword::For) => ExitKind::For,
                    Token::Keyword(Keyword::Function) => ExitKind::Function,
                    Token::Keyword(Keyword::Sub) => ExitKind::Sub,
                    Token::Keyword(Keyword::Property) => ExitKind::Property,
                    _ => return Err(self.error_here(ErrorCode::SyntaxError, "'Do', 'For', 'Function', 'Sub' or 'Property'")),
                };
                self.advance();
                Ok(self.stmt(StmtKind::Exit(kind), start))
            }
            Keyword::On => {
                self.advance();
                self.expect_kw(Keyword::Error, ErrorCode::SyntaxError)?;
                if self.eat_kw(Keyword::Resume) {
                    match self.peek() {
                        Token::Keyword(Keyword::Next) => {
                            self.advance();
                            Ok(self.stmt(StmtKind::OnErrorResumeNext, start))
                        }
                        _ => Err(self.error_here(ErrorCode::SyntaxError, "'Next'")),
                    }
                } else {
                    self.expect_kw(Keyword::GoTo, ErrorCode::SyntaxError)?;
                    self.expect(&Token::Int(0), ErrorCode::SyntaxError, "'0'")?;
                    Ok(self.stmt(StmtKind::OnErrorGoto0, start))
                }
            }
            Keyword::Sub | Keyword::Function | Keyword::Property => {
                let decl = self.parse_procedure(Visibility::Public, false, start)?;
                Ok(self.stmt(StmtKind::Procedure(Box::new(decl)), start))
            }
            Keyword::Class => self.parse_class(start),
            k if k.is_contextual() || matches!(k, Keyword::Me) => self.parse_simple_statement(start),
            _ => Err(self.error_here(ErrorCode::ExpectedStatement, "statement")),
        }
    }

    fn expect_end(&mut self, k: Keyword, code: ErrorCode) -> Result<(), CompileError> {
        if self.at_end_of(k) {
            self.advance();
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(code, &format!("'End {}'", self.source_word(k))))
        }
    }

    /// Assignment or call statement.
    fn parse_simple_statement(&mut self, start: Location) -> Result<Stmt, CompileError> {
        let (target, last_call) = self.parse_postfix()?;
        if self.eat(&Token::Eq) {
            let value = self.parse_expr()?;
            return Ok(self.stmt(
                StmtKind::Assign {
                    target,
                    value,
                    set: false,
                },
                start,
            ));
        }
        if self.at_terminator() || self.at_kw(Keyword::Else) {
            let (target, mut args) = match target.kind {
                ExprKind::Call { target, args } => (*target, args),
                _ => (target, Vec::new()),
            };
            // Without `Call`, `foo (a)` passes the parenthesized expression
            // `(a)`, so `a` goes by value.
            if let [arg] = args.as_mut_slice() {
                if !matches!(arg.kind, ExprKind::Paren(_) | ExprKind::Literal(_)) {
                    let span = arg.span;
                    let inner = std::mem::replace(arg, Expr::new(ExprKind::Literal(Literal::Empty), span));
                    *arg = Expr::new(ExprKind::Paren(Box::new(inner)), span);
                }
            }
            return Ok(self.stmt(StmtKind::Call { target, args }, start));
        }
        // `foo a, b` or `foo (a), b`: the arguments follow without parentheses.
        let callee = match last_call {
            Some(LastCall { lparen, callee }) => {
                self.pos = lparen;
                callee
            }
            None => target,
        };
        let args = self.parse_bare_args()?;
        Ok(self.stmt(StmtKind::Call { target: callee, args }, start))
    }

    /// Comma-separated arguments up to the end of the statement. Empty
    /// positions pass Empty.
    fn parse_bare_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        loop {
            if matches!(self.peek(), Token::Comma) {
                args.push(Expr::new(ExprKind::Literal(Literal::Empty), Span::at(self.start())));
            } else {
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_visibility_statement(&mut self, start: Location) -> Result<Stmt, CompileError> {
        let visibility = if self.eat_kw(Keyword::Public) {
            Visibility::Public
        } else {
            self.advance();
            Visibility::Private
        };
        let is_default = self.eat_kw(Keyword::Default);
        match self.peek() {
            Token::Keyword(Keyword::Sub | Keyword::Function | Keyword::Property) => {
                let decl = self.parse_procedure(visibility, is_default, start)?;
                Ok(self.stmt(StmtKind::Procedure(Box::new(decl)), start))
            }
            Token::Keyword(Keyword::Const) if !is_default => {
                self.advance();
                self.parse_const(visibility, start)
            }
            _ if is_default => Err(self.error_here(ErrorCode::SyntaxError, "'Function', 'Sub' or 'Property'")),
            _ => {
                let vars = self.parse_var_decls()?;
                Ok(self.stmt(StmtKind::Dim { visibility, vars }, start))
            }
        }
    }

    fn parse_var_decls(&mut self) -> Result<Vec<VarDecl>, CompileError> {
        let mut vars = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let bounds = if self.eat(&Token::LParen) {
                let mut bounds = Vec::new();
                if !matches!(self.peek(), Token::RParen) {
                    bounds.push(self.parse_expr()?);
                    while self.eat(&Token::Comma) {
                        bounds.push(self.parse_expr()?);
                    }
                }
                self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
                Some(bounds)
            } else {
                None
            };
            vars.push(VarDecl { name, bounds });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(vars)
    }

    fn parse_const(&mut self, visibility: Visibility, start: Location) -> Result<Stmt, CompileError> {
        let mut items = Vec::new();
        loop {
            let name = self.expect_ident()?;
            self.expect(&Token::Eq, ErrorCode::ExpectedEquals, "'='")?;
            let value = self.parse_expr()?;
            if !is_constant_literal(&value) {
                return Err(CompileError::parser(
                    ErrorCode::ExpectedLiteral,
                    "Expected literal constant",
                    value.span,
                ));
            }
            items.push(ConstDecl { name, value });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(self.stmt(StmtKind::Const { visibility, items }, start))
    }

    fn parse_redim(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        let preserve = self.eat_kw(Keyword::Preserve);
        let mut items = Vec::new();
        loop {
            let item_start = self.start();
            let target = self.expect_ident()?;
            self.expect(&Token::LParen, ErrorCode::ExpectedLParen, "'('")?;
            let mut bounds = vec![self.parse_expr()?];
            while self.eat(&Token::Comma) {
                bounds.push(self.parse_expr()?);
            }
            self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
            items.push(ReDimItem {
                target,
                bounds,
                span: self.span_from(item_start),
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(self.stmt(StmtKind::ReDim { preserve, items }, start))
    }

    fn parse_if(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        let condition = self.parse_expr()?;
        self.expect_kw(Keyword::Then, ErrorCode::ExpectedThen)?;
        if !matches!(self.peek(), Token::Newline | Token::Colon | Token::Eof) {
            return self.parse_single_line_if(condition, start);
        }
        let mut branches = Vec::new();
        let mut else_body = None;
        let is_branch_end =
            |p: &Self| p.at_kw(Keyword::ElseIf) || p.at_kw(Keyword::Else) || p.at_end_of(Keyword::If);
        let body = self.parse_body(is_branch_end);
        branches.push(IfBranch { condition, body });
        loop {
            if self.eat_kw(Keyword::ElseIf) {
                let condition = self.parse_expr()?;
                self.expect_kw(Keyword::Then, ErrorCode::ExpectedThen)?;
                let body = self.parse_body(is_branch_end);
                branches.push(IfBranch { condition, body });
            } else if self.eat_kw(Keyword::Else) {
                else_body = Some(self.parse_body(|p| p.at_end_of(Keyword::If)));
                break;
            } else {
                break;
            }
        }
        self.expect_end(Keyword::If, ErrorCode::ExpectedEnd)?;
        Ok(self.stmt(StmtKind::If { branches, else_body }, start))
    }

    /// `If c Then a : b Else c : d` on one line.
    fn parse_single_line_if(&mut self, condition: Expr, start: Location) -> Result<Stmt, CompileError> {
        let then_body = self.parse_inline_statements()?;
        let else_body = if self.eat_kw(Keyword::Else) {
            Some(self.parse_inline_statements()?)
        } else {
            None
        };
        if self.at_end_of(Keyword::If) {
            self.advance();
            self.advance();
        }
        Ok(self.stmt(
            StmtKind::If {
                branches: vec![IfBranch {
                    condition,
                    body: then_body,
                }],
                else_body,
            },
            start,
        ))
    }

    fn parse_inline_statements(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut body = Vec::new();
        loop {
            while self.eat(&Token::Colon) {}
            if matches!(self.peek(), Token::Newline | Token::Eof) || self.at_kw(Keyword::Else) || self.at_end_of(Keyword::If) {
                break;
            }
            let start = self.start();
            body.push(self.parse_statement_inline(start)?);
            if !matches!(self.peek(), Token::Colon) {
                break;
            }
        }
        Ok(body)
    }

    fn parse_statement_inline(&mut self, start: Location) -> Result<Stmt, CompileError> {
        if self.at_kw(Keyword::If) {
            // A nested If on the same line must be single-line too.
            self.advance();
            let condition = self.parse_expr()?;
            self.expect_kw(Keyword::Then, ErrorCode::ExpectedThen)?;
            return self.nested(|p| p.parse_single_line_if(condition, start));
        }
        self.nested(Self::parse_statement)
    }

    fn parse_for(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        if self.eat_kw(Keyword::Each) {
            let var = self.expect_ident()?;
            self.expect_kw(Keyword::In, ErrorCode::ExpectedIn)?;
            let collection = self.parse_expr()?;
            let body = self.parse_body(|p| p.at_kw(Keyword::Next));
            self.parse_next(&var)?;
            return Ok(self.stmt(StmtKind::ForEach { var, collection, body }, start));
        }
        let var = self.expect_ident()?;
        self.expect(&Token::Eq, ErrorCode::ExpectedEquals, "'='")?;
        let from = self.parse_expr()?;
        self.expect_kw(Keyword::To, ErrorCode::ExpectedTo)?;
        let to = self.parse_expr()?;
        let step = if self.eat_kw(Keyword::Step) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let body = self.parse_body(|p| p.at_kw(Keyword::Next));
        self.parse_next(&var)?;
        Ok(self.stmt(
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            },
            start,
        ))
    }

    fn parse_next(&mut self, var: &Ident) -> Result<(), CompileError> {
        self.expect_kw(Keyword::Next, ErrorCode::ExpectedNext)?;
        if let Token::Ident(_) = self.peek() {
            let named = self.expect_ident()?;
            if named != *var {
                return Err(CompileError::parser(
                    ErrorCode::InvalidForVariable,
                    format!("Invalid 'for' loop control variable '{}'", named.name),
                    named.span,
                ));
            }
        }
        Ok(())
    }

    fn parse_loop_condition(&mut self) -> Result<Option<LoopCondition>, CompileError> {
        let kind = if self.eat_kw(Keyword::While) {
            LoopKind::While
        } else if self.eat_kw(Keyword::Until) {
            LoopKind::Until
        } else {
            return Ok(None);
        };
        Ok(Some(LoopCondition {
            kind,
            expr: self.parse_expr()?,
        }))
    }

    fn parse_do(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        let pre = self.parse_loop_condition()?;
        let body = self.parse_body(|p| p.at_kw(Keyword::Loop));
        self.expect_kw(Keyword::Loop, ErrorCode::ExpectedLoop)?;
        let post_span = self.span();
        let post = self.parse_loop_condition()?;
        if pre.is_some() && post.is_some() {
            return Err(CompileError::parser(
                ErrorCode::SyntaxError,
                "A loop cannot have both a leading and a trailing condition",
                post_span,
            ));
        }
        Ok(self.stmt(StmtKind::Do { pre, post, body }, start))
    }

    fn parse_select(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        self.expect_kw(Keyword::Case, ErrorCode::ExpectedCase)?;
        let selector = self.parse_expr()?;
        self.skip_terminators();
        let mut cases = Vec::new();
        let mut else_body = None;
        let is_case_end = |p: &Self| p.at_kw(Keyword::Case) || p.at_end_of(Keyword::Select);
        while self.at_kw(Keyword::Case) {
            let case_start = self.start();
            self.advance();
            if self.eat_kw(Keyword::Else) {
                else_body = Some(self.parse_body(|p| p.at_end_of(Keyword::Select)));
                break;
            }
            let mut values = vec![self.parse_expr()?];
            while self.eat(&Token::Comma) {
                values.push(self.parse_expr()?);
            }
            let span = self.span_from(case_start);
            let body = self.parse_body(is_case_end);
            cases.push(CaseClause { values, body, span });
        }
        self.expect_end(Keyword::Select, ErrorCode::ExpectedSelect)?;
        Ok(self.stmt(
            StmtKind::Select {
                selector,
                cases,
                else_body,
            },
            start,
        ))
    }

    // ── Procedures and classes ────────────────────────────────────

    fn parse_procedure(&mut self, visibility: Visibility, is_default: bool, start: Location) -> Result<ProcDecl, CompileError> {
        let (kind, end_kw) = match self.advance().token {
            Token::Keyword(Keyword::Sub) => (ProcKind::Sub, Keyword::Sub),
            Token::Keyword(Keyword::Function) => (ProcKind::Function, Keyword::Function),
            _ => {
                let kind = match self.peek() {
                    Token::Keyword(Keyword::Get) => ProcKind::PropertyGet,
                    Token::Keyword(Keyword::Let) => ProcKind::PropertyLet,
                    Token::Keyword(Keyword::Set) => ProcKind::PropertySet,
                    _ => return Err(self.error_here(ErrorCode::ExpectedProperty, "'Get', 'Let' or 'Set'")),
                };
                self.advance();
                (kind, Keyword::Property)
            }
        };
        let name = self.expect_ident()?;
        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            if !matches!(self.peek(), Token::RParen) {
                loop {
                    let by_ref = if self.eat_kw(Keyword::ByVal) {
                        false
                    } else {
                        self.eat_kw(Keyword::ByRef);
                        true
                    };
                    let param_name = self.expect_ident()?;
                    // `a()` marks an array parameter; it has no effect here.
                    if self.eat(&Token::LParen) {
                        self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
                    }
                    params.push(Param { name: param_name, by_ref });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
        }
        let body = self.parse_body(|p| p.at_end_of(end_kw));
        let code = match end_kw {
            Keyword::Sub => ErrorCode::ExpectedSub,
            Keyword::Function => ErrorCode::ExpectedFunction,
            _ => ErrorCode::ExpectedProperty,
        };
        self.expect_end(end_kw, code)?;
        Ok(ProcDecl {
            kind,
            name,
            params,
            body,
            visibility,
            is_default,
            span: self.span_from(start),
        })
    }

    fn parse_class(&mut self, start: Location) -> Result<Stmt, CompileError> {
        self.advance();
        let name = self.expect_ident()?;
        let mut members = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_eof() || self.at_end_of(Keyword::Class) {
                break;
            }
            match self.parse_class_member() {
                Ok(member) => {
                    members.push(member);
                    if let Err(e) = self.expect_terminator() {
                        self.errors.push(e);
                        self.recover_to_terminator();
                    }
                }
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_terminator();
                }
            }
        }
        self.expect_end(Keyword::Class, ErrorCode::ExpectedClass)?;
        Ok(self.stmt(
            StmtKind::Class(Box::new(ClassDecl {
                name,
                members,
                span: self.span_from(start),
            })),
            start,
        ))
    }

    fn parse_class_member(&mut self) -> Result<ClassMember, CompileError> {
        let start = self.start();
        let visibility = if self.eat_kw(Keyword::Public) {
            Some(Visibility::Public)
        } else if self.eat_kw(Keyword::Private) {
            Some(Visibility::Private)
        } else if self.eat_kw(Keyword::Dim) {
            Some(Visibility::Dim)
        } else {
            None
        };
        let is_default = visibility == Some(Visibility::Public) && self.eat_kw(Keyword::Default);
        match self.peek() {
            Token::Keyword(Keyword::Sub | Keyword::Function | Keyword::Property) if visibility != Some(Visibility::Dim) => {
                let decl = self.parse_procedure(visibility.unwrap_or(Visibility::Public), is_default, start)?;
                Ok(ClassMember::Procedure(decl))
            }
            _ if is_default => Err(self.error_here(ErrorCode::SyntaxError, "'Function', 'Sub' or 'Property'")),
            _ => match visibility {
                Some(visibility) => {
                    let vars = self.parse_var_decls()?;
                    Ok(ClassMember::Field {
                        visibility,
                        vars,
                        span: self.span_from(start),
                    })
                }
                None => Err(self.error_here(ErrorCode::ExpectedStatement, "class member")),
            },
        }
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.nested(Self::parse_imp)
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    fn parse_imp(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_eqv()?;
        while self.eat_kw(Keyword::Imp) {
            let right = self.parse_eqv()?;
            left = Self::binary(BinaryOp::Imp, left, right);
        }
        Ok(left)
    }

    fn parse_eqv(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_xor()?;
        while self.eat_kw(Keyword::Eqv) {
            let right = self.parse_xor()?;
            left = Self::binary(BinaryOp::Eqv, left, right);
        }
        Ok(left)
    }

    fn parse_xor(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_or()?;
        while self.eat_kw(Keyword::Xor) {
            let right = self.parse_or()?;
            left = Self::binary(BinaryOp::Xor, left, right);
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.eat_kw(Keyword::Or) {
            let right = self.parse_and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        while self.eat_kw(Keyword::And) {
            let right = self.parse_not()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.at_kw(Keyword::Not) {
            let start = self.start();
            self.advance();
            let operand = self.nested(Self::parse_not)?;
            let span = Span::new(start, operand.span.end);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Equal,
                Token::Ne => BinaryOp::NotEqual,
                Token::Lt => BinaryOp::LessThan,
                Token::Le => BinaryOp::LessThanOrEqual,
                Token::Gt => BinaryOp::GreaterThan,
                Token::Ge => BinaryOp::GreaterThanOrEqual,
                Token::Keyword(Keyword::Is) => BinaryOp::Is,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_additive()?;
        while self.eat(&Token::Ampersand) {
            let right = self.parse_additive()?;
            left = Self::binary(BinaryOp::Concatenate, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mod()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_mod()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mod(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_int_div()?;
        while self.eat_kw(Keyword::Mod) {
            let right = self.parse_int_div()?;
            left = Self::binary(BinaryOp::Modulo, left, right);
        }
        Ok(left)
    }

    fn parse_int_div(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mul()?;
        while self.eat(&Token::Backslash) {
            let right = self.parse_mul()?;
            left = Self::binary(BinaryOp::IntDivide, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_negate()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                _ => break,
            };
            self.advance();
            let right = self.parse_negate()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    /// Unary minus binds looser than `^`: `-2 ^ 2` is -4.
    fn parse_negate(&mut self) -> Result<Expr, CompileError> {
        let start = self.start();
        if self.eat(&Token::Minus) {
            let operand = self.nested(Self::parse_negate)?;
            let span = Span::new(start, operand.span.end);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        if self.eat(&Token::Plus) {
            return self.nested(Self::parse_negate);
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let (mut left, _) = self.parse_postfix()?;
        while self.eat(&Token::Caret) {
            let right = if matches!(self.peek(), Token::Minus | Token::Plus) {
                self.parse_negate_operand()?
            } else {
                self.parse_postfix()?.0
            };
            left = Self::binary(BinaryOp::Power, left, right);
        }
        Ok(left)
    }

    /// The right side of `^` may carry a sign but not another `^` chain.
    fn parse_negate_operand(&mut self) -> Result<Expr, CompileError> {
        let start = self.start();
        let negative = matches!(self.advance().token, Token::Minus);
        let operand = if matches!(self.peek(), Token::Minus | Token::Plus) {
            self.nested(Self::parse_negate_operand)?
        } else {
            self.parse_postfix()?.0
        };
        if !negative {
            return Ok(operand);
        }
        let span = Span::new(start, operand.span.end);
        Ok(Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Negate,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<(Expr, Option<LastCall>), CompileError> {
        let mut expr = self.parse_primary()?;
        let mut last_call = None;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_member_name()?;
                    let span = Span::new(expr.span.start, name.span.end);
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            name,
                        },
                        span,
                    );
                    last_call = None;
                }
                Token::LParen => {
                    let lparen = self.pos;
                    self.advance();
                    let args = self.parse_call_args()?;
                    self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
                    let span = Span::new(expr.span.start, self.last_end());
                    last_call = Some(LastCall {
                        lparen,
                        callee: expr.clone(),
                    });
                    expr = Expr::new(
                        ExprKind::Call {
                            target: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok((expr, last_call))
    }

    fn expect_member_name(&mut self) -> Result<Ident, CompileError> {
        match self.peek().clone() {
            Token::Keyword(k) => {
                let span = self.advance().span;
                Ok(Ident::new(self.source_word(k), span))
            }
            _ => self.expect_ident(),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Token::RParen) {
            return Ok(args);
        }
        loop {
            if matches!(self.peek(), Token::Comma | Token::RParen) {
                args.push(Expr::new(ExprKind::Literal(Literal::Empty), Span::at(self.start())));
            } else {
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        let literal = |lit: Literal| Expr::new(ExprKind::Literal(lit), span);
        match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                Ok(literal(int_literal(v)))
            }
            Token::Float(v) => {
                self.advance();
                Ok(literal(Literal::Double(v)))
            }
            Token::String(s) => {
                self.advance();
                Ok(literal(Literal::String(s)))
            }
            Token::Date(d) => {
                self.advance();
                Ok(literal(Literal::Date(d)))
            }
            Token::Keyword(Keyword::True) => {
                self.advance();
                Ok(literal(Literal::Bool(true)))
            }
            Token::Keyword(Keyword::False) => {
                self.advance();
                Ok(literal(Literal::Bool(false)))
            }
            Token::Keyword(Keyword::Empty) => {
                self.advance();
                Ok(literal(Literal::Empty))
            }
            Token::Keyword(Keyword::Null) => {
                self.advance();
                Ok(literal(Literal::Null))
            }
            Token::Keyword(Keyword::Nothing) => {
                self.advance();
                Ok(literal(Literal::Nothing))
            }
            Token::Keyword(Keyword::Me) => {
                self.advance();
                Ok(Expr::new(ExprKind::Me, span))
            }
            Token::Keyword(Keyword::New) => {
                self.advance();
                let class = self.expect_ident()?;
                let span = Span::new(span.start, class.span.end);
                Ok(Expr::new(ExprKind::New(class), span))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, ErrorCode::ExpectedRParen, "')'")?;
                Ok(Expr::new(ExprKind::Paren(Box::new(inner)), self.span_from(span.start)))
            }
            // `.Name` inside a With block; the postfix loop takes the member.
            Token::Dot => Ok(Expr::new(ExprKind::WithTarget, Span::at(span.start))),
            Token::Ident(_) => Ok(Expr::new(ExprKind::Ident(self.expect_ident()?), span)),
            Token::Keyword(k) if k.is_contextual() => Ok(Expr::new(ExprKind::Ident(self.expect_ident()?), span)),
            _ => Err(self.error_here(ErrorCode::ExpectedExpression, "expression")),
        }
    }
}

fn int_literal(v: i64) -> Literal {
    if let Ok(i) = i16::try_from(v) {
        Literal::Integer(i)
    } else if let Ok(l) = i32::try_from(v) {
        Literal::Long(l)
    } else {
        Literal::Double(v as f64)
    }
}

fn is_constant_literal(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Literal(_) => true,
        ExprKind::Paren(inner) => is_constant_literal(inner),
        ExprKind::Unary {
            op: UnaryOp::Negate,
            operand,
        } => is_constant_literal(operand),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::lexer::lex;

    fn parse_str(s: &str) -> Program {
        let (tokens, lex_errors) = lex(s);
        assert!(lex_errors.is_empty(), "{lex_errors:?}");
        let (program, errors) = parse(tokens);
        assert!(errors.is_empty(), "{:?}", errors.iter().map(CompileError::format_with_source).collect::<Vec<_>>());
        program
    }

    fn parse_errors(s: &str) -> Vec<CompileError> {
        let (tokens, _) = lex(s);
        parse(tokens).1
    }

    fn first(s: &str) -> StmtKind {
        parse_str(s).body.into_iter().next().unwrap().kind
    }

    #[test]
    fn parse_assignment_and_ids() {
        let program = parse_str("a = 1\r\nb = \"2\"\r\nc = a + b");
        assert_eq!(program.body.len(), 3);
        assert_eq!(program.stmt_count, 3);
        assert_eq!(program.body[2].id, StmtId(2));
        let StmtKind::Assign { value, set, .. } = &program.body[2].kind else {
            panic!("expected assignment");
        };
        assert!(!set);
        assert!(matches!(value.kind, ExprKind::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn precedence() {
        let StmtKind::Assign { value, .. } = first("x = 1 + 2 * 3 ^ 2 & \"a\" = \"b\" And Not y") else {
            panic!()
        };
        let ExprKind::Binary { op: BinaryOp::And, left, right } = value.kind else {
            panic!("And should be the root")
        };
        assert!(matches!(right.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
        let ExprKind::Binary { op: BinaryOp::Equal, left: concat, .. } = left.kind else {
            panic!("comparison under And")
        };
        assert!(matches!(concat.kind, ExprKind::Binary { op: BinaryOp::Concatenate, .. }));
    }

    #[test]
    fn negation_is_looser_than_power() {
        let StmtKind::Assign { value, .. } = first("x = -2 ^ 2") else { panic!() };
        let ExprKind::Unary { op: UnaryOp::Negate, operand } = value.kind else {
            panic!("negation should be the root")
        };
        assert!(matches!(operand.kind, ExprKind::Binary { op: BinaryOp::Power, .. }));
    }

    #[test]
    fn call_statements() {
        let StmtKind::Call { target, args } = first("Response.Write \"hi\", 2") else { panic!() };
        assert!(matches!(target.kind, ExprKind::Member { .. }));
        assert_eq!(args.len(), 2);

        let StmtKind::Call { args, .. } = first("foo (a), b") else { panic!() };
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0].kind, ExprKind::Paren(_)));

        let StmtKind::Call { args, .. } = first("foo (a)") else { panic!() };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0].kind, ExprKind::Paren(_)));

        let StmtKind::Call { args, .. } = first("Call foo(a)") else { panic!() };
        assert!(matches!(args[0].kind, ExprKind::Ident(_)));

        let StmtKind::Call { args, .. } = first("Call foo(1, 2)") else { panic!() };
        assert_eq!(args.len(), 2);

        let StmtKind::Call { args, .. } = first("DoIt") else { panic!() };
        assert!(args.is_empty());
    }

    #[test]
    fn block_and_single_line_if() {
        let StmtKind::If { branches, else_body } = first("If a Then\n x = 1\nElseIf b Then\n x = 2\nElse\n x = 3\nEnd If") else {
            panic!()
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(else_body.unwrap().len(), 1);

        let StmtKind::If { branches, else_body } = first("If a Then x = 1 : y = 2 Else z = 3") else { panic!() };
        assert_eq!(branches[0].body.len(), 2);
        assert_eq!(else_body.unwrap().len(), 1);
    }

    #[test]
    fn loops() {
        assert!(matches!(first("For i = 1 To 10 Step 2\nNext"), StmtKind::For { step: Some(_), .. }));
        assert!(matches!(first("For Each x In xs\nNext x"), StmtKind::ForEach { .. }));
        assert!(matches!(first("Do While x < 3\nx = x + 1\nLoop"), StmtKind::Do { pre: Some(_), post: None, .. }));
        assert!(matches!(first("Do\nLoop Until x"), StmtKind::Do { pre: None, post: Some(_), .. }));
        assert!(matches!(first("While x\nWend"), StmtKind::Do { pre: Some(_), .. }));
    }

    #[test]
    fn select_case() {
        let StmtKind::Select { cases, else_body, .. } =
            first("Select Case x\nCase 1, 2\n y = 1\nCase \"a\"\nCase Else\n y = 0\nEnd Select")
        else {
            panic!()
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].values.len(), 2);
        assert!(else_body.is_some());
    }

    #[test]
    fn procedures_and_classes() {
        let program = parse_str(
            "Function Add(ByVal a, b)\n Add = a + b\nEnd Function\n\
             Class Point\n Public X, Y\n Private secret\n Public Default Property Get Size()\n Size = 1\n End Property\n\
             Property Let Size(v)\n End Property\nEnd Class",
        );
        let StmtKind::Procedure(f) = &program.body[0].kind else { panic!() };
        assert_eq!(f.kind, ProcKind::Function);
        assert!(!f.params[0].by_ref && f.params[1].by_ref);
        let StmtKind::Class(c) = &program.body[1].kind else { panic!() };
        assert_eq!(c.members.len(), 4);
        let ClassMember::Procedure(size) = &c.members[2] else { panic!() };
        assert!(size.is_default);
        assert_eq!(size.kind, ProcKind::PropertyGet);
    }

    #[test]
    fn declarations() {
        let StmtKind::Dim { vars, .. } = first("Dim a, b(3), c()") else { panic!() };
        assert!(vars[0].bounds.is_none());
        assert_eq!(vars[1].bounds.as_ref().unwrap().len(), 1);
        assert!(vars[2].bounds.as_ref().unwrap().is_empty());
        assert!(matches!(first("ReDim Preserve a(1, 2)"), StmtKind::ReDim { preserve: true, .. }));
        assert!(matches!(first("Const X = -1, Y = \"s\""), StmtKind::Const { .. }));
        assert!(parse_str("Option Explicit\nDim a").option_explicit);
    }

    #[test]
    fn with_block_member_access() {
        let StmtKind::With { body, .. } = first("With obj\n .Name = 1\n .Run 2\nEnd With") else { panic!() };
        let StmtKind::Assign { target, .. } = &body[0].kind else { panic!() };
        let ExprKind::Member { object, .. } = &target.kind else { panic!() };
        assert!(matches!(object.kind, ExprKind::WithTarget));
    }

    #[test]
    fn error_handling_statements() {
        assert!(matches!(first("On Error Resume Next"), StmtKind::OnErrorResumeNext));
        assert!(matches!(first("On Error GoTo 0"), StmtKind::OnErrorGoto0));
    }

    #[test]
    fn recovers_and_reports_every_error() {
        let errors = parse_errors("x = \ny = 1\nIf a b\nz = (1\nw = 2");
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].code, ErrorCode::ExpectedExpression);
        assert_eq!(errors[0].span.start.line, 1);
        assert_eq!(errors[1].code, ErrorCode::ExpectedThen);
        assert_eq!(errors[2].code, ErrorCode::ExpectedRParen);
        assert_eq!(errors[2].span.start.line, 4);
    }

    #[test]
    fn missing_block_end() {
        let errors = parse_errors("If a Then\nx = 1\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::ExpectedEnd);
        let errors = parse_errors("Sub Foo\n");
        assert_eq!(errors[0].code, ErrorCode::ExpectedSub);
    }

    #[test]
    fn const_requires_literal() {
        let errors = parse_errors("Const X = y");
        assert_eq!(errors[0].code, ErrorCode::ExpectedLiteral);
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |depth: usize| format!("x = {}1{}\ny = 2", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse_str(&nested(30)).body.len(), 2);

        let errors = parse_errors(&nested(5000));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::TooManyItems);
        assert_eq!(errors[0].span.start.line, 1);

        let errors = parse_errors(&format!("x = {}True", "Not ".repeat(5000)));
        assert_eq!(errors[0].code, ErrorCode::TooManyItems);
    }

    #[test]
    fn option_explicit_must_come_first() {
        let errors = parse_errors("x = 1\nOption Explicit");
        assert_eq!(errors.len(), 1);
    }
}
