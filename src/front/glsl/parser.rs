//! GLSL (Vulkan dialect) recursive-descent parser, structured like
//! `front::wgsl::parser`'s one-function-per-production shape but over
//! GLSL's C-style declaration grammar: `layout(...)` qualifiers ahead of
//! a storage qualifier and a type, interface blocks, and `returnType
//! name(params) { }` functions rather than `fn`. Scope matches the
//! front-end coverage contract (spec.md §4.4); GLSL's `for` loop is
//! accepted as sugar over the same structured-loop shape `while` uses,
//! and other exotic corners (preprocessor macros beyond line-skipping,
//! `switch`, geometry/tessellation-only qualifiers) are out of scope.
use crate::error::{Diag, DiagCode};
use crate::front::glsl::lexer::{FloatSuffix, IntSuffix, Lexer, Spanned, Token};
use crate::front::Pos;

#[derive(Clone, Copy, Debug, Default)]
pub struct LayoutQualifier {
    pub set: Option<u32>,
    pub binding: Option<u32>,
    pub location: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageQualifier {
    In,
    Out,
    Uniform,
    Buffer,
    Shared,
    Const,
    None,
}

#[derive(Clone, Debug)]
pub enum TypeExpr {
    Named(String),
    Array(Box<TypeExpr>, Option<u32>),
}

#[derive(Clone, Debug)]
pub struct StructField {
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Clone, Debug)]
pub struct InterfaceBlockDecl {
    pub layout: LayoutQualifier,
    pub storage: StorageQualifier,
    pub block_name: String,
    pub fields: Vec<StructField>,
    pub instance_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GlobalVarDecl {
    pub layout: LayoutQualifier,
    pub storage: StorageQualifier,
    pub flat: bool,
    pub invariant: bool,
    pub ty: TypeExpr,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub ty: TypeExpr,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct FnDecl {
    pub ret_ty: TypeExpr,
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub enum Decl {
    Struct(StructDecl),
    InterfaceBlock(InterfaceBlockDecl),
    GlobalVar(GlobalVarDecl),
    Fn(FnDecl),
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Let(String, TypeExpr, Expr),
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
    "void", "bool", "int", "uint", "float", "double",
    "vec2", "vec3", "vec4", "ivec2", "ivec3", "ivec4", "uvec2", "uvec3", "uvec4", "bvec2", "bvec3", "bvec4",
    "mat2", "mat3", "mat4", "mat2x2", "mat2x3", "mat2x4", "mat3x2", "mat3x3", "mat3x4", "mat4x2", "mat4x3", "mat4x4",
    "sampler2D", "sampler3D", "samplerCube", "sampler2DArray", "sampler2DShadow",
];

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
    fn is_type_start(&self) -> bool {
        match &self.cur.value {
            Token::Ident(s) => TYPE_KEYWORDS.contains(&s.as_str()) || !is_known_keyword(s),
            _ => false,
        }
    }

    pub fn parse_module(&mut self) -> Result<Vec<Decl>, Diag> {
        let mut decls = Vec::new();
        while !self.is(&Token::Eof) {
            decls.push(self.parse_decl()?);
        }
        Ok(decls)
    }

    fn parse_layout(&mut self) -> Result<LayoutQualifier, Diag> {
        let mut layout = LayoutQualifier::default();
        if self.is_kw("layout") {
            self.bump()?;
            self.eat(&Token::LParen)?;
            while !self.is(&Token::RParen) {
                let key = self.eat_ident()?;
                let mut value = None;
                if self.is(&Token::Eq) {
                    self.bump()?;
                    if let Token::IntLit(v, _) = self.bump()? {
                        value = Some(v as u32);
                    } else {
                        return Err(self.err("expected integer literal after '=' in layout qualifier"));
                    }
                }
                match key.as_str() {
                    "set" => layout.set = value,
                    "binding" => layout.binding = value,
                    "location" => layout.location = value,
                    _ => {}
                }
                if self.is(&Token::Comma) {
                    self.bump()?;
                }
            }
            self.bump()?;
        }
        Ok(layout)
    }

    fn parse_type(&mut self) -> Result<TypeExpr, Diag> {
        let name = self.eat_ident()?;
        let mut ty = TypeExpr::Named(name);
        while self.is(&Token::LBracket) {
            self.bump()?;
            let len = if let Token::IntLit(v, _) = self.cur.value.clone() {
                self.bump()?;
                Some(v as u32)
            } else {
                None
            };
            self.eat(&Token::RBracket)?;
            ty = TypeExpr::Array(Box::new(ty), len);
        }
        Ok(ty)
    }

    fn parse_decl(&mut self) -> Result<Decl, Diag> {
        let layout = self.parse_layout()?;
        let mut storage = StorageQualifier::None;
        let mut flat = false;
        let mut invariant = false;
        loop {
            if self.is_kw("in") {
                storage = StorageQualifier::In;
                self.bump()?;
            } else if self.is_kw("out") {
                storage = StorageQualifier::Out;
                self.bump()?;
            } else if self.is_kw("uniform") {
                storage = StorageQualifier::Uniform;
                self.bump()?;
            } else if self.is_kw("buffer") {
                storage = StorageQualifier::Buffer;
                self.bump()?;
            } else if self.is_kw("shared") {
                storage = StorageQualifier::Shared;
                self.bump()?;
            } else if self.is_kw("const") {
                storage = StorageQualifier::Const;
                self.bump()?;
            } else if self.is_kw("flat") {
                flat = true;
                self.bump()?;
            } else if self.is_kw("invariant") {
                invariant = true;
                self.bump()?;
            } else if self.is_kw("readonly") || self.is_kw("writeonly") || self.is_kw("highp") || self.is_kw("mediump") || self.is_kw("lowp") {
                self.bump()?;
            } else {
                break;
            }
        }

        if self.is_kw("struct") {
            self.bump()?;
            let name = self.eat_ident()?;
            let fields = self.parse_field_list()?;
            self.eat(&Token::Semicolon)?;
            return Ok(Decl::Struct(StructDecl { name, fields }));
        }

        // Interface block: `qualifier BlockName { ... } [instance_name];`
        if matches!(storage, StorageQualifier::Uniform | StorageQualifier::Buffer) && self.peek_is_interface_block()? {
            let block_name = self.eat_ident()?;
            let fields = self.parse_field_list()?;
            let instance_name = if let Token::Ident(_) = &self.cur.value {
                Some(self.eat_ident()?)
            } else {
                None
            };
            self.eat(&Token::Semicolon)?;
            return Ok(Decl::InterfaceBlock(InterfaceBlockDecl {
                layout,
                storage,
                block_name,
                fields,
                instance_name,
            }));
        }

        let ty = self.parse_type()?;
        let name = self.eat_ident()?;

        if self.is(&Token::LParen) {
            self.bump()?;
            let mut params = Vec::new();
            while !self.is(&Token::RParen) {
                while self.is_kw("in") || self.is_kw("out") || self.is_kw("inout") || self.is_kw("const") {
                    self.bump()?;
                }
                let pty = self.parse_type()?;
                let pname = self.eat_ident()?;
                params.push(Param { ty: pty, name: pname });
                if self.is(&Token::Comma) {
                    self.bump()?;
                }
            }
            self.bump()?;
            let body = self.parse_block()?;
            return Ok(Decl::Fn(FnDecl {
                ret_ty: ty,
                name,
                params,
                body,
            }));
        }

        let mut ty = ty;
        while self.is(&Token::LBracket) {
            self.bump()?;
            let len = if let Token::IntLit(v, _) = self.cur.value.clone() {
                self.bump()?;
                Some(v as u32)
            } else {
                None
            };
            self.eat(&Token::RBracket)?;
            ty = TypeExpr::Array(Box::new(ty), len);
        }
        self.eat(&Token::Semicolon)?;
        Ok(Decl::GlobalVar(GlobalVarDecl {
            layout,
            storage,
            flat,
            invariant,
            ty,
            name,
        }))
    }

    /// Disambiguates `uniform Block { ... }` from `uniform sampler2D tex;`
    /// by checking whether the identifier after the storage qualifier is
    /// immediately followed by `{`.
    fn peek_is_interface_block(&mut self) -> Result<bool, Diag> {
        if !matches!(self.cur.value, Token::Ident(_)) {
            return Ok(false);
        }
        // `Lexer` wraps a `Peekable<Chars>`, which is `Clone`; snapshot and
        // restore it plus the current token to look one token ahead.
        let lexer_clone = self.lexer.clone();
        let cur_clone = self.cur.clone();
        self.bump()?;
        let is_block = self.is(&Token::LBrace);
        self.lexer = lexer_clone;
        self.cur = cur_clone;
        Ok(is_block)
    }

    fn parse_field_list(&mut self) -> Result<Vec<StructField>, Diag> {
        self.eat(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.is(&Token::RBrace) {
            let ty = self.parse_type()?;
            let name = self.eat_ident()?;
            let mut ty = ty;
            while self.is(&Token::LBracket) {
                self.bump()?;
                let len = if let Token::IntLit(v, _) = self.cur.value.clone() {
                    self.bump()?;
                    Some(v as u32)
                } else {
                    None
                };
                self.eat(&Token::RBracket)?;
                ty = TypeExpr::Array(Box::new(ty), len);
            }
            fields.push(StructField { name, ty });
            self.eat(&Token::Semicolon)?;
        }
        self.bump()?;
        Ok(fields)
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

    fn looks_like_decl(&self) -> bool {
        self.is_type_start()
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
            let init = Box::new(self.parse_stmt()?);
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
        if self.looks_like_decl() {
            let ty = self.parse_type()?;
            let name = self.eat_ident()?;
            self.eat(&Token::Eq)?;
            let expr = self.parse_expr()?;
            return Ok(Stmt::Let(name, ty, expr));
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

fn is_known_keyword(s: &str) -> bool {
    matches!(
        s,
        "in" | "out"
            | "uniform"
            | "buffer"
            | "shared"
            | "const"
            | "flat"
            | "invariant"
            | "readonly"
            | "writeonly"
            | "highp"
            | "mediump"
            | "lowp"
            | "struct"
            | "layout"
            | "if"
            | "else"
            | "while"
            | "for"
            | "return"
            | "discard"
            | "true"
            | "false"
            | "inout"
    )
}
