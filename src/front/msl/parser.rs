//! MSL recursive-descent parser, structured like `front::wgsl::parser`'s
//! one-function-per-production shape over MSL's C++-flavored grammar:
//! `device`/`constant`/`thread`/`threadgroup` address-space qualifiers
//! ahead of a type, `*`/`&` pointer-or-reference declarators, and
//! `[[attr(args)]]`-style attributes trailing a declaration rather than
//! leading it. Scope matches the front-end coverage contract (spec.md
//! §4.4): argument buffers, nested structs-of-structs beyond one level,
//! and `constexpr` function specialization are out of scope.
use crate::error::{Diag, DiagCode};
use crate::front::msl::lexer::{FloatSuffix, IntSuffix, Lexer, Spanned, Token};
use crate::front::Pos;

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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKw {
    Device,
    Constant,
    Thread,
    Threadgroup,
}

#[derive(Clone, Debug)]
pub enum TypeExpr {
    Named(String),
    Template(String, Vec<TypeExpr>),
    Array(Box<TypeExpr>, Option<u32>),
}

/// A declarator's full type: base type, address-space qualifier (present
/// only on pointer/reference declarations), and whether it's written
/// with `*` (pointer) or `&` (reference) -- both map to the same IR
/// pointer type, the distinction is source-level only.
#[derive(Clone, Debug)]
pub struct QualifiedType {
    pub space: Option<AddressSpaceKw>,
    pub base: TypeExpr,
    pub is_ptr_or_ref: bool,
}

#[derive(Clone, Debug)]
pub struct StructField {
    pub ty: QualifiedType,
    pub name: String,
    pub attrs: Vec<Attribute>,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub ty: QualifiedType,
    pub name: String,
    pub attrs: Vec<Attribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnKind {
    Vertex,
    Fragment,
    Kernel,
    Plain,
}

#[derive(Clone, Debug)]
pub struct FnDecl {
    pub kind: FnKind,
    pub ret_ty: QualifiedType,
    pub ret_attrs: Vec<Attribute>,
    pub name: String,
    pub params: Vec<Param>,
    pub attrs: Vec<Attribute>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub enum Decl {
    Struct(StructDecl),
    Fn(FnDecl),
    /// A top-level `constant T name [[attr]];` resource declaration (no
    /// initializer accepted by this front-end, matching GLSL's globals).
    GlobalVar(StructField),
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Let(String, Option<QualifiedType>, Expr),
    Assign(Expr, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    For(Box<Stmt>, Expr, Box<Stmt>, Vec<Stmt>),
    Return(Option<Expr>),
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

const TYPE_KEYWORDS: &[&str] = &[
    "void", "bool", "int", "uint", "float", "half",
    "float2", "float3", "float4", "int2", "int3", "int4", "uint2", "uint3", "uint4", "bool2", "bool3", "bool4",
    "float2x2", "float2x3", "float2x4", "float3x2", "float3x3", "float3x4", "float4x2", "float4x3", "float4x4",
    "texture2d", "texture3d", "texturecube", "texture2d_array", "depth2d", "sampler",
];

fn is_type_keyword(name: &str) -> bool {
    TYPE_KEYWORDS.contains(&name)
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
            if self.is_kw("using") {
                // `using namespace metal;` -- skip to the terminating `;`.
                while !self.is(&Token::Semicolon) && !self.is(&Token::Eof) {
                    self.bump()?;
                }
                self.bump()?;
                continue;
            }
            decls.push(self.parse_decl()?);
        }
        Ok(decls)
    }

    fn parse_attrs(&mut self) -> Result<Vec<Attribute>, Diag> {
        let mut attrs = Vec::new();
        while self.is(&Token::AttrOpen) {
            self.bump()?;
            loop {
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
                if self.is(&Token::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
            self.eat(&Token::AttrClose)?;
        }
        Ok(attrs)
    }

    fn parse_address_space(&mut self) -> Option<AddressSpaceKw> {
        let kw = match &self.cur.value {
            Token::Ident(s) if s == "device" => AddressSpaceKw::Device,
            Token::Ident(s) if s == "constant" => AddressSpaceKw::Constant,
            Token::Ident(s) if s == "thread" => AddressSpaceKw::Thread,
            Token::Ident(s) if s == "threadgroup" => AddressSpaceKw::Threadgroup,
            _ => return None,
        };
        let _ = self.bump();
        Some(kw)
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
            return Ok(TypeExpr::Template(name, args));
        }
        Ok(TypeExpr::Named(name))
    }

    fn parse_qualified_type(&mut self) -> Result<QualifiedType, Diag> {
        let space = self.parse_address_space();
        let base = self.parse_type()?;
        let is_ptr_or_ref = if self.is(&Token::Star) {
            self.bump()?;
            true
        } else if self.is(&Token::Amp) {
            self.bump()?;
            true
        } else {
            false
        };
        Ok(QualifiedType { space, base, is_ptr_or_ref })
    }

    fn looks_like_type_start(&self) -> bool {
        match &self.cur.value {
            Token::Ident(s) => {
                is_type_keyword(s)
                    || matches!(s.as_str(), "device" | "constant" | "thread" | "threadgroup")
            }
            _ => false,
        }
    }

    fn parse_decl(&mut self) -> Result<Decl, Diag> {
        if self.is_kw("struct") {
            self.bump()?;
            let name = self.eat_ident()?;
            self.eat(&Token::LBrace)?;
            let mut fields = Vec::new();
            while !self.is(&Token::RBrace) {
                let ty = self.parse_qualified_type()?;
                let fname = self.eat_ident()?;
                let array_len = if self.is(&Token::LBracket) {
                    self.bump()?;
                    let n = match self.bump()? {
                        Token::IntLit(v, _) => Some(v as u32),
                        _ => None,
                    };
                    self.eat(&Token::RBracket)?;
                    n
                } else {
                    None
                };
                let fattrs = self.parse_attrs()?;
                self.eat(&Token::Semicolon)?;
                let ty = if array_len.is_some() || fname.is_empty() {
                    QualifiedType {
                        base: TypeExpr::Array(Box::new(ty.base), array_len),
                        ..ty
                    }
                } else {
                    ty
                };
                fields.push(StructField {
                    ty,
                    name: fname,
                    attrs: fattrs,
                });
            }
            self.bump()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Decl::Struct(StructDecl { name, fields }));
        }

        let kind = if self.is_kw("vertex") {
            self.bump()?;
            FnKind::Vertex
        } else if self.is_kw("fragment") {
            self.bump()?;
            FnKind::Fragment
        } else if self.is_kw("kernel") {
            self.bump()?;
            FnKind::Kernel
        } else {
            FnKind::Plain
        };

        let ret_ty = self.parse_qualified_type()?;
        let name = self.eat_ident()?;

        if self.is(&Token::Semicolon) || self.is(&Token::AttrOpen) {
            // `constant float4x4 mvp [[buffer(n)]];` at module scope.
            let attrs = self.parse_attrs()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Decl::GlobalVar(StructField {
                ty: ret_ty,
                name,
                attrs,
            }));
        }

        self.eat(&Token::LParen)?;
        let mut params = Vec::new();
        while !self.is(&Token::RParen) {
            let pty = self.parse_qualified_type()?;
            let pname = self.eat_ident()?;
            let pattrs = self.parse_attrs()?;
            params.push(Param {
                ty: pty,
                name: pname,
                attrs: pattrs,
            });
            if self.is(&Token::Comma) {
                self.bump()?;
            }
        }
        self.bump()?;
        let ret_attrs = self.parse_attrs()?;
        let body = self.parse_block()?;
        Ok(Decl::Fn(FnDecl {
            kind,
            ret_ty,
            ret_attrs,
            name,
            params,
            attrs: Vec::new(),
            body,
        }))
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
        if self.is_kw("discard_fragment") {
            self.bump()?;
            self.eat(&Token::LParen)?;
            self.eat(&Token::RParen)?;
            self.eat(&Token::Semicolon)?;
            return Ok(Stmt::Discard);
        }
        let stmt = self.parse_simple_stmt()?;
        self.eat(&Token::Semicolon)?;
        Ok(stmt)
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt, Diag> {
        if self.looks_like_type_start() {
            let ty = self.parse_qualified_type()?;
            let name = self.eat_ident()?;
            self.eat(&Token::Eq)?;
            let expr = self.parse_expr()?;
            return Ok(Stmt::Let(name, Some(ty), expr));
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
            Token::Star => {
                // `*ptr` dereference, folded into member access by the
                // lowering stage the same way `ptr->field` already is.
                self.bump()?;
                self.parse_unary()
            }
            Token::Ident(name) => {
                self.bump()?;
                if name == "true" {
                    return Ok(Expr::BoolLit(true));
                }
                if name == "false" {
                    return Ok(Expr::BoolLit(false));
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
                    return Ok(Expr::Call(name, args));
                }
                Ok(Expr::Ident(name))
            }
            other => Err(self.err(format!("unexpected token in expression: {:?}", other))),
        }
    }

}
