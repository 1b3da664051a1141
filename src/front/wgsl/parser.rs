//! WGSL recursive-descent parser: one function per grammar production
//! (spec.md §4.4), producing a small AST that `lower.rs` drives the
//! builder from. Scope matches the front-end coverage contract: global
//! declarations, function bodies with the named expression/statement
//! forms, entry-point attributes. WGSL `switch` and other exotic corners
//! are out of scope (see DESIGN.md).
use crate::error::{Diag, DiagCode};
use crate::front::Pos;
use crate::front::wgsl::lexer::{FloatSuffix, IntSuffix, Lexer, Spanned, Token};

#[derive(Clone, Debug)]
pub struct AttrArg {
    pub ident: Option<String>,
    pub int: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct Attribute {
    pub name: String,
    pub args: Vec<AttrArg>,
}
impl Attribute {
    pub fn int_arg(&self) -> Option<i64> {
        self.args.first().and_then(|a| a.int)
    }
    pub fn ident_arg(&self) -> Option<&str> {
        self.args.first().and_then(|a| a.ident.as_deref())
    }
}

#[derive(Clone, Debug)]
pub enum TypeExpr {
    Named(String),
    Generic(String, Vec<TypeExpr>),
    Array(Box<TypeExpr>, Option<u32>),
}

#[derive(Clone, Debug)]
pub struct StructField {
    pub attrs: Vec<Attribute>,
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Clone, Debug)]
pub struct GlobalVarDecl {
    pub attrs: Vec<Attribute>,
    /// The `<...>` template list on `var<storage, read_write>`.
    pub template: Vec<String>,
    pub name: String,
    pub ty: TypeExpr,
    pub init: Option<Expr>,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub attrs: Vec<Attribute>,
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug)]
pub struct FnDecl {
    pub attrs: Vec<Attribute>,
    pub name: String,
    pub params: Vec<Param>,
    pub ret_attrs: Vec<Attribute>,
    pub ret_ty: Option<TypeExpr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub enum Decl {
    Struct(StructDecl),
    GlobalVar(GlobalVarDecl),
    Fn(FnDecl),
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Let(String, Option<TypeExpr>, Expr),
    Var(String, Option<TypeExpr>, Option<Expr>),
    Assign(Expr, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Loop(Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    For(Box<Stmt>, Expr, Box<Stmt>, Vec<Stmt>),
    Return(Option<Expr>),
    Break,
    Continue,
    Discard,
    Expr(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Debug)]
pub enum Expr {
    IntLit(i64, IntSuffix),
    FloatLit(f64, FloatSuffix),
    BoolLit(bool),
    Ident(String),
    Call(String, Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Spanned<Token>,
}
impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Result<Self, Diag> {
        let mut lexer = Lexer::new(src);
        let cur = lexer.next_token()?;
        Ok(Parser { lexer, cur })
    }

    fn pos(&self) -> Pos {
        self.cur.pos
    }
    fn err(&self, msg: impl Into<String>) -> Diag {
        Diag::new(DiagCode::Parse, msg).with_span(self.pos().span())
    }
    fn bump(&mut self) -> Result<Token, Diag> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.cur, next).value)
    }
    fn eat(&mut self, tok: &Token) -> Result<(), Diag> {
        if &self.cur.value == tok {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("expected {:?}, found {:?}", tok, self.cur.value)))
        }
    }
    fn eat_ident(&mut self) -> Result<String, Diag> {
        match self.bump()? {
            Token::Ident(s) => Ok(s),
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }
    fn is(&self, tok: &Token) -> bool {
        &self.cur.value == tok
    }
    fn is_kw(&self, kw: &str) -> bool {
        matches!(&self.cur.value, Token::Ident(s) if s == kw)
    }

    pub fn parse_module(&mut self) -> Result<Vec<Decl>, Diag> {
        let mut decls = Vec::new();
        while !self.is(&Token::Eof) {
            decls.push(self.parse_decl()?);
        }
        Ok(decls)
    }

    fn parse_attrs(&mut self) -> Result<Vec<Attribute>, Diag> {
        let mut attrs = Vec::new();
        while self.is(&Token::At) {
            self.bump()?;
            let name = self.eat_ident()?;
            let mut args = Vec::new();
            if self.is(&Token::LParen) {
                self.bump()?;
                while !self.is(&Token::RParen) {
                    let arg = match self.cur.value.clone() {
                        Token::Ident(s) => {
                            self.bump()?;
                            AttrArg {
                                ident: Some(s),
                                int: None,
                            }
                        }
                        Token::IntLit(v, _) => {
                            self.bump()?;
                            AttrArg { ident: None, int: Some(v) }
                        }
                        other => return Err(self.err(format!("unexpected attribute argument {:?}", other))),
                    };
                    args.push(arg);
                    if self.is(&Token::Comma) {
                        self.bump()?;
                    }
                }
                self.bump()?;
            }
            attrs.push(Attribute { name, args });
        }
        Ok(attrs)
    }

    fn parse_type(&mut self) -> Result<TypeExpr, Diag> {
        let name = self.eat_ident()?;
        if self.is(&Token::Lt) {
            self.bump()?;
            let mut args = Vec::new();
            loop {
                args.push(self.parse_type()?);
                if self.is(&Token::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
            self.eat(&Token::Gt)?;
            if name == "array" {
                let len = if let TypeExpr::Named(n) = &args.last().cloned().unwrap() {
                    n.parse::<u32>().ok()
                } else {
                    None
                };
                let elem = args.into_iter().next().unwrap();
                return Ok(TypeExpr::Array(Box::new(elem), len));
            }
            return Ok(TypeExpr::Generic(name, args));
        }
        Ok(TypeExpr::Named(name))
    }

    fn parse_decl(&mut self) -> Result<Decl, Diag> {
        let attrs = self.parse_attrs()?;
        if self.is_kw("struct") {
            self.bump()?;
            let name = self.eat_ident()?;
            self.eat(&Token::LBrace)?;
            let mut fields = Vec::new();
            while !self.is(&Token::RBrace) {
                let fattrs = self.parse_attrs()?;
                let fname = self.eat_ident()?;
                self.eat(&Token::Colon)?;
                let fty = self.parse_type()?;
                fields.push(StructField {
                    attrs: fattrs,
                    name: fname,
                    ty: fty,
                });
                if self.is(&Token::Comma) {
                    self.bump()?;
                }
            }
            self.bump()?;
            return Ok(Decl::Struct(StructDecl { name, fields }));
        }
        if self.is_kw("var") {
            self.bump()?;
            let mut template = Vec::new();
            if self.is(&Token::Lt) {
                self.bump()?;
                loop {
                    template.push(self.eat_ident()?);
                    if self.is(&Token::Comma) {
                        self.bump()?;
                        continue;
                    }
                    break;
                }
                self.eat(&Token::Gt)?;
            }
            let name = self.eat_ident()?;
            self.eat(&Token::Colon)?;
            let ty = self.parse_type()?;
            let init = if self.is(&Token::Eq) {
                self.bump()?;
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.eat(&Token::Semicolon)?;
            return Ok(Decl::GlobalVar(GlobalVarDecl {
                attrs,
                template,
                name,
                ty,
                init,
            }));
        }
        if self.is_kw("fn") {
            self.bump()?;
            let name = self.eat_ident()?;
            self.eat(&Token::LParen)?;
            let mut params = Vec::new();
            while !self.is(&Token::RParen) {
                let pattrs = self.parse_attrs()?;
                let pname = self.eat_ident()?;
                self.eat(&Token::Colon)?;
                let pty = self.parse_type()?;
                params.push(Param {
                    attrs: pattrs,
                    name: pname,
                    ty: pty,
                });
                if self.is(&Token::Comma) {
                    self.bump()?;
                }
            }
            self.bump()?;
            let (ret_attrs, ret_ty) = if self.is(&Token::Arrow) {
                self.bump()?;
                let ra = self.parse_attrs()?;
                (ra, Some(self.parse_type()?))
            } else {
                (Vec::new(), None)
            };
            let body = self.parse_block()?;
            return Ok(Decl::Fn(FnDecl {
                attrs,
                name,
                params,
                ret_attrs,
                ret_ty,
                body,
            }));
        }
        Err(self.err(format!("expected struct/var/fn declaration, found {:?}", self.cur.value)))
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, Diag> {
        self.eat(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.is(&Token::RBrace) {
            stmts.push(self.parse_stmt()?);
        }
        self.bump()?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, Diag> {
        if self.is_kw("if") {
            self.bump()?;
            self.eat(&Token::LParen)?;
            let cond = self.parse_expr()?;
            self.eat(&Token::RParen)?;
            let then_body = self.parse_block()?;
            let else_body = if self.is_kw("else") {
                self.bump()?;
                if self.is_kw("if") {
                    vec![self.parse_stmt()?]
                } else {
                    self.parse_block()?
                }
            } else {
                Vec::new()
            };
            return Ok(Stmt::If(cond, then_body, else_body));
        }
        if self.is_kw("loop") {
            self.bump()?;
            return Ok(Stmt::Loop(self.parse_block()?));
        }
        if self.is_kw("while") {
            self.bump()?;
            self.eat(&Token::LParen)?;
            let cond = self.parse_expr()?;
            self.eat(&Token::RParen)?;
            return Ok(Stmt::While(cond, self.parse_block()?));
        }
        if self.is_kw("for") {
            self.bump()?;
            self.eat(&Token::LParen)?;
            let init = Box::new(self.parse_simple_stmt()?);
            self.eat(&Token::Semicolon)?;
            let cond = self.parse_expr()?;
            self.eat(&Token::Semicolon)?;
            let incr = Box::new(self.parse_simple_stmt()?);
            self.eat(&Token::RParen)?;
            let body = self.parse_block()?;
            return Ok(Stmt::For(init, cond, incr, body));
        }
        if self.is_kw("return") {
            self.bump()?;
            let value = if self.is(&Token::Semicolon) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.eat(&Token::Semicolon)?;
            return Ok(Stmt::Return(value));
        }
        if self.is_kw("break") {
            self.bump()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Stmt::Break);
        }
        if self.is_kw("continue") {
            self.bump()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Stmt::Continue);
        }
        if self.is_kw("discard") {
            self.bump()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Stmt::Discard);
        }
        let stmt = self.parse_simple_stmt()?;
        self.eat(&Token::Semicolon)?;
        Ok(stmt)
    }

    /// A statement with no trailing semicolon consumed, used both for
    /// ordinary statements and for the init/increment clauses of `for`.
    fn parse_simple_stmt(&mut self) -> Result<Stmt, Diag> {
        if self.is_kw("let") {
            self.bump()?;
            let name = self.eat_ident()?;
            let ty = if self.is(&Token::Colon) {
                self.bump()?;
                Some(self.parse_type()?)
            } else {
                None
            };
            self.eat(&Token::Eq)?;
            let expr = self.parse_expr()?;
            return Ok(Stmt::Let(name, ty, expr));
        }
        if self.is_kw("var") {
            self.bump()?;
            let name = self.eat_ident()?;
            let ty = if self.is(&Token::Colon) {
                self.bump()?;
                Some(self.parse_type()?)
            } else {
                None
            };
            let init = if self.is(&Token::Eq) {
                self.bump()?;
                Some(self.parse_expr()?)
            } else {
                None
            };
            return Ok(Stmt::Var(name, ty, init));
        }
        let lhs = self.parse_expr()?;
        if self.is(&Token::Eq) {
            self.bump()?;
            let rhs = self.parse_expr()?;
            return Ok(Stmt::Assign(lhs, rhs));
        }
        Ok(Stmt::Expr(lhs))
    }

    // --- Expressions, precedence-climbing from lowest to highest. --------------

    fn parse_expr(&mut self) -> Result<Expr, Diag> {
        self.parse_or()
    }
    fn parse_or(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_and()?;
        while self.is(&Token::PipePipe) {
            self.bump()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_and(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_bit_or()?;
        while self.is(&Token::AmpAmp) {
            self.bump()?;
            let rhs = self.parse_bit_or()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_bit_or(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_bit_xor()?;
        while self.is(&Token::Pipe) {
            self.bump()?;
            let rhs = self.parse_bit_xor()?;
            lhs = Expr::Binary(BinOp::BitOr, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_bit_xor(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_bit_and()?;
        while self.is(&Token::Caret) {
            self.bump()?;
            let rhs = self.parse_bit_and()?;
            lhs = Expr::Binary(BinOp::BitXor, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_bit_and(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_equality()?;
        while self.is(&Token::Amp) {
            self.bump()?;
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::BitAnd, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_equality(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.cur.value {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_relational(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.cur.value {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_shift(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.cur.value {
                Token::Shl => BinOp::Shl,
                Token::Shr => BinOp::Shr,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_additive(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.cur.value {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_multiplicative(&mut self) -> Result<Expr, Diag> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.cur.value {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
    fn parse_unary(&mut self) -> Result<Expr, Diag> {
        let op = match self.cur.value {
            Token::Minus => Some(UnOp::Neg),
            Token::Bang => Some(UnOp::Not),
            Token::Tilde => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump()?;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.parse_postfix()
    }
    fn parse_postfix(&mut self) -> Result<Expr, Diag> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.is(&Token::Dot) {
                self.bump()?;
                let field = self.eat_ident()?;
                expr = Expr::Member(Box::new(expr), field);
            } else if self.is(&Token::LBracket) {
                self.bump()?;
                let index = self.parse_expr()?;
                self.eat(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }
    fn parse_primary(&mut self) -> Result<Expr, Diag> {
        match self.cur.value.clone() {
            Token::IntLit(v, s) => {
                self.bump()?;
                Ok(Expr::IntLit(v, s))
            }
            Token::FloatLit(v, s) => {
                self.bump()?;
                Ok(Expr::FloatLit(v, s))
            }
            Token::LParen => {
                self.bump()?;
                let inner = self.parse_expr()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                self.bump()?;
                if name == "true" {
                    return Ok(Expr::BoolLit(true));
                }
                if name == "false" {
                    return Ok(Expr::BoolLit(false));
                }
                // Generic constructor forms, e.g. `vec4<f32>(...)`: only
                // attempted for the closed set of names that take a
                // template list, so a bare `x < y` comparison is never
                // misread as the start of one (no backtracking needed).
                let is_generic_ctor = matches!(
                    name.as_str(),
                    "vec2" | "vec3" | "vec4" | "array" | "mat2x2" | "mat2x3" | "mat2x4"
                        | "mat3x2" | "mat3x3" | "mat3x4" | "mat4x2" | "mat4x3" | "mat4x4"
                );
                let mut callee = name;
                if is_generic_ctor && self.is(&Token::Lt) {
                    self.bump()?;
                    loop {
                        callee.push('_');
                        match self.parse_type()? {
                            TypeExpr::Named(n) => callee.push_str(&n),
                            TypeExpr::Generic(n, _) => callee.push_str(&n),
                            TypeExpr::Array(..) => callee.push_str("array"),
                        }
                        if self.is(&Token::Comma) {
                            self.bump()?;
                            continue;
                        }
                        break;
                    }
                    self.eat(&Token::Gt)?;
                }
                if self.is(&Token::LParen) {
                    self.bump()?;
                    let mut args = Vec::new();
                    while !self.is(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        if self.is(&Token::Comma) {
                            self.bump()?;
                        }
                    }
                    self.bump()?;
                    return Ok(Expr::Call(callee, args));
                }
                Ok(Expr::Ident(callee))
            }
            other => Err(self.err(format!("unexpected token in expression: {:?}", other))),
        }
    }
}
