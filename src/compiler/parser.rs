//! Recursive-descent parser. Builds the [`ast`] and validates break/continue
//! targets against a stack of enclosing loop contexts as it goes.

use super::ast::*;
use super::token::{SpannedToken, Token};
use crate::error::RenderError;
use crate::value::{ValueStorage, ValueType};

pub struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    /// Number of loop constructs (for/while) lexically enclosing the
    /// current statement. `illuminance` does not count as a loop for
    /// break/continue purposes.
    loop_depth: u32,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>) -> Self {
        Parser {
            tokens,
            pos: 0,
            loop_depth: 0,
        }
    }

    pub fn parse_shader(tokens: Vec<SpannedToken>) -> Result<ShaderDecl, RenderError> {
        let mut parser = Parser::new(tokens);
        let shader = parser.shader_decl()?;
        parser.expect(&Token::Eof)?;
        Ok(shader)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> SpannedToken {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<SpannedToken, RenderError> {
        if self.check(token) {
            Ok(self.advance())
        } else {
            Err(RenderError::syntax(
                self.line(),
                format!("expected {token:?}, found {:?}", self.peek()),
            ))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, RenderError> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(RenderError::syntax(
                self.line(),
                format!("expected identifier, found {other:?}"),
            )),
        }
    }

    fn shader_kind(&mut self) -> Result<ShaderKind, RenderError> {
        let kind = match self.peek() {
            Token::Surface => ShaderKind::Surface,
            Token::Displacement => ShaderKind::Displacement,
            Token::Light => ShaderKind::Light,
            Token::Volume => ShaderKind::Volume,
            Token::Imager => ShaderKind::Imager,
            other => {
                return Err(RenderError::syntax(
                    self.line(),
                    format!("expected a shader kind (surface/displacement/light/volume/imager), found {other:?}"),
                ))
            }
        };
        self.advance();
        Ok(kind)
    }

    fn value_type(&mut self) -> Result<ValueType, RenderError> {
        let ty = match self.peek() {
            Token::Float => ValueType::Float,
            Token::Integer => ValueType::Integer,
            Token::Color => ValueType::Color,
            Token::Point => ValueType::Point,
            Token::Vector => ValueType::Vector,
            Token::Normal => ValueType::Normal,
            Token::Matrix => ValueType::Matrix,
            Token::StringType => ValueType::String,
            other => {
                return Err(RenderError::syntax(
                    self.line(),
                    format!("expected a type, found {other:?}"),
                ))
            }
        };
        self.advance();
        Ok(ty)
    }

    fn peek_is_type(&self) -> bool {
        matches!(
            self.peek(),
            Token::Float
                | Token::Integer
                | Token::Color
                | Token::Point
                | Token::Vector
                | Token::Normal
                | Token::Matrix
                | Token::StringType
        )
    }

    fn optional_storage(&mut self) -> Option<ValueStorage> {
        let storage = match self.peek() {
            Token::Constant => ValueStorage::Constant,
            Token::Uniform => ValueStorage::Uniform,
            Token::Varying => ValueStorage::Varying,
            Token::Vertex => ValueStorage::Vertex,
            _ => return None,
        };
        self.advance();
        Some(storage)
    }

    fn shader_decl(&mut self) -> Result<ShaderDecl, RenderError> {
        let kind = self.shader_kind()?;
        let name = self.expect_identifier()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.param_decl()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let body = self.block()?;
        Ok(ShaderDecl {
            kind,
            name,
            params,
            body,
        })
    }

    fn param_decl(&mut self) -> Result<ParamDecl, RenderError> {
        let line = self.line();
        let storage = self.optional_storage();
        let ty = self.value_type()?;
        let name = self.expect_identifier()?;
        let default = if self.eat(&Token::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        // Scalars default to uniform, geometric attributes default to
        // varying.
        let storage = storage.unwrap_or(match ty {
            ValueType::Point | ValueType::Vector | ValueType::Normal | ValueType::Color => {
                ValueStorage::Varying
            }
            _ => ValueStorage::Uniform,
        });
        Ok(ParamDecl {
            name,
            ty,
            storage,
            default,
            line,
        })
    }

    fn block(&mut self) -> Result<Block, RenderError> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) {
            stmts.push(self.statement()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, RenderError> {
        match self.peek().clone() {
            Token::LBrace => Ok(Stmt::Block(self.block()?)),
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::For => self.for_stmt(),
            Token::Illuminance => self.illuminance_stmt(),
            Token::Solar => self.solar_stmt(),
            Token::Return => self.return_stmt(),
            Token::Break => self.break_stmt(),
            Token::Continue => self.continue_stmt(),
            Token::Constant | Token::Uniform | Token::Varying | Token::Vertex => {
                self.declaration_stmt()
            }
            _ if self.peek_is_type() => self.declaration_stmt(),
            Token::Identifier(_) => self.assignment_or_expr_stmt(),
            _ => {
                let line = self.line();
                let expr = self.expression()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::ExprStmt(expr, line))
            }
        }
    }

    /// Parses one `storage? type name (= expr)? (, name (= expr)?)*;` and
    /// desugars a multi-name declaration such as `uniform float i, j;` into
    /// several `Stmt::Declaration`s wrapped in a block.
    fn declaration_stmt(&mut self) -> Result<Stmt, RenderError> {
        let storage = self.optional_storage();
        let ty = self.value_type()?;
        let mut decls = Vec::new();
        loop {
            let name_line = self.line();
            let name = self.expect_identifier()?;
            let init = if self.eat(&Token::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            decls.push(Stmt::Declaration {
                name,
                ty,
                storage,
                init,
                line: name_line,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Semicolon)?;
        if decls.len() == 1 {
            Ok(decls.into_iter().next().unwrap())
        } else {
            Ok(Stmt::Block(decls))
        }
    }

    fn assignment_or_expr_stmt(&mut self) -> Result<Stmt, RenderError> {
        // Lookahead: IDENT followed by an assignment operator is an
        // assignment; otherwise fall through to a general expression
        // statement (a bare call, e.g. `Ci = ...;` is handled as Assign,
        // but `some_builtin();` is an ExprStmt).
        let checkpoint = self.pos;
        let line = self.line();
        if let Token::Identifier(name) = self.peek().clone() {
            self.advance();
            let op = match self.peek() {
                Token::Assign => Some(AssignOp::Assign),
                Token::PlusAssign => Some(AssignOp::AddAssign),
                Token::MinusAssign => Some(AssignOp::SubAssign),
                Token::StarAssign => Some(AssignOp::MulAssign),
                Token::SlashAssign => Some(AssignOp::DivAssign),
                _ => None,
            };
            if let Some(op) = op {
                self.advance();
                let value = self.expression()?;
                self.expect(&Token::Semicolon)?;
                return Ok(Stmt::Assign {
                    target: name,
                    op,
                    value,
                    line,
                });
            }
        }
        self.pos = checkpoint;
        let expr = self.expression()?;
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::ExprStmt(expr, line))
    }

    fn if_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        self.expect(&Token::LParen)?;
        let cond = self.expression()?;
        self.expect(&Token::RParen)?;
        let then_branch = self.block()?;
        let else_branch = if self.eat(&Token::Else) {
            Some(self.block()?)
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            line,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        self.expect(&Token::LParen)?;
        let cond = self.expression()?;
        self.expect(&Token::RParen)?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        Ok(Stmt::While {
            cond,
            body: body?,
            line,
        })
    }

    fn for_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        self.expect(&Token::LParen)?;
        let init = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.bare_assignment()?)
        };
        self.expect(&Token::Semicolon)?;
        let cond = self.expression()?;
        self.expect(&Token::Semicolon)?;
        let step = if self.check(&Token::RParen) {
            None
        } else {
            Some(self.bare_assignment()?)
        };
        self.expect(&Token::RParen)?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        Ok(Stmt::For {
            init: Box::new(init),
            cond,
            step: Box::new(step),
            body: body?,
            line,
        })
    }

    /// An assignment with no trailing semicolon, for `for(...)` clauses.
    fn bare_assignment(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        let name = self.expect_identifier()?;
        let op = match self.peek() {
            Token::Assign => AssignOp::Assign,
            Token::PlusAssign => AssignOp::AddAssign,
            Token::MinusAssign => AssignOp::SubAssign,
            Token::StarAssign => AssignOp::MulAssign,
            Token::SlashAssign => AssignOp::DivAssign,
            other => {
                return Err(RenderError::syntax(
                    line,
                    format!("expected an assignment operator, found {other:?}"),
                ))
            }
        };
        self.advance();
        let value = self.expression()?;
        Ok(Stmt::Assign {
            target: name,
            op,
            value,
            line,
        })
    }

    fn illuminance_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        self.expect(&Token::LParen)?;
        let position = self.expression()?;
        self.expect(&Token::RParen)?;
        let body = self.block()?;
        Ok(Stmt::Illuminance {
            position,
            body,
            line,
        })
    }

    fn solar_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        let axis = if self.eat(&Token::LParen) {
            let axis = self.expression()?;
            self.expect(&Token::RParen)?;
            Some(axis)
        } else {
            None
        };
        let body = self.block()?;
        Ok(Stmt::Solar { axis, body, line })
    }

    fn return_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        let value = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&Token::Semicolon)?;
        Ok(Stmt::Return { value, line })
    }

    fn break_continue_level(&mut self) -> Result<u32, RenderError> {
        if let Token::IntLiteral(n) = self.peek().clone() {
            self.advance();
            if n < 1 {
                return Err(RenderError::syntax(
                    self.line(),
                    "break/continue level must be a positive integer",
                ));
            }
            Ok(n as u32)
        } else {
            Ok(1)
        }
    }

    fn break_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        let level = self.break_continue_level()?;
        self.expect(&Token::Semicolon)?;
        if self.loop_depth == 0 {
            return Err(RenderError::break_outside_of_loop(line));
        }
        if level > self.loop_depth {
            return Err(RenderError::break_to_level_outside_of_loop(line));
        }
        Ok(Stmt::Break { level, line })
    }

    fn continue_stmt(&mut self) -> Result<Stmt, RenderError> {
        let line = self.line();
        self.advance();
        let level = self.break_continue_level()?;
        self.expect(&Token::Semicolon)?;
        if self.loop_depth == 0 {
            return Err(RenderError::codegen(line, "Continue outside of a loop"));
        }
        if level > self.loop_depth {
            return Err(RenderError::codegen(
                line,
                "Continue to a level outside of a loop",
            ));
        }
        Ok(Stmt::Continue { level, line })
    }

    // --- expressions, precedence climbing ---

    fn expression(&mut self) -> Result<Expr, RenderError> {
        self.logical_or()
    }

    fn logical_or(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.logical_and()?;
        while self.check(&Token::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.logical_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.equality()?;
        while self.check(&Token::And) {
            let line = self.line();
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, RenderError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, RenderError> {
        let line = self.line();
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnOp::Neg,
                    expr: Box::new(self.unary()?),
                    line,
                })
            }
            Token::Not => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnOp::Not,
                    expr: Box::new(self.unary()?),
                    line,
                })
            }
            Token::LParen if self.is_cast_ahead() => {
                self.advance();
                let ty = self.value_type()?;
                self.expect(&Token::RParen)?;
                let expr = self.unary()?;
                Ok(Expr::Cast {
                    ty,
                    expr: Box::new(expr),
                    line,
                })
            }
            _ => self.primary(),
        }
    }

    /// `(type)` followed directly by a type-keyword-then-`)` is a cast;
    /// anything else starting with `(` is a parenthesized expression.
    fn is_cast_ahead(&self) -> bool {
        let is_type = matches!(
            self.tokens.get(self.pos + 1).map(|t| &t.token),
            Some(
                Token::Float
                    | Token::Integer
                    | Token::Color
                    | Token::Point
                    | Token::Vector
                    | Token::Normal
                    | Token::Matrix
                    | Token::StringType
            )
        );
        is_type && matches!(self.tokens.get(self.pos + 2).map(|t| &t.token), Some(Token::RParen))
    }

    fn primary(&mut self) -> Result<Expr, RenderError> {
        let line = self.line();
        match self.peek().clone() {
            Token::IntLiteral(n) => {
                self.advance();
                Ok(Expr::IntLiteral(n, line))
            }
            Token::FloatLiteral(n) => {
                self.advance();
                Ok(Expr::FloatLiteral(n, line))
            }
            Token::StringLiteral(s) => {
                self.advance();
                Ok(Expr::StringLiteral(s, line))
            }
            Token::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Identifier(name) => {
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::Call { name, args, line })
                } else {
                    Ok(Expr::Identifier(name, line))
                }
            }
            _ if self.peek_is_type() => {
                let ty = self.value_type()?;
                self.expect(&Token::LParen)?;
                let args = self.call_args()?;
                Ok(Expr::Constructor { ty, args, line })
            }
            other => Err(RenderError::syntax(line, format!("unexpected token {other:?}"))),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, RenderError> {
        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;
    use crate::error::{BREAK_OUTSIDE_OF_LOOP, BREAK_TO_LEVEL_OUTSIDE_OF_LOOP};

    fn parse(src: &str) -> Result<ShaderDecl, RenderError> {
        let tokens = Lexer::tokenize(src).unwrap();
        Parser::parse_shader(tokens)
    }

    #[test]
    fn break_outside_of_loop_reports_exact_message_and_line() {
        let src = "surface s() { \n   break; \n}";
        let err = parse(src).unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.to_string().contains(BREAK_OUTSIDE_OF_LOOP), true);
    }

    #[test]
    fn break_to_level_outside_of_loop_reports_exact_message_and_line() {
        let src = "surface s() { \n   uniform float i; \n   for ( i = 0; i < 4; i += 1 ) { \n       break 2; \n   } \n}";
        let err = parse(src).unwrap_err();
        assert_eq!(err.line(), Some(4));
        assert!(err.to_string().contains(BREAK_TO_LEVEL_OUTSIDE_OF_LOOP));
    }

    #[test]
    fn nested_loops_allow_break_up_to_their_depth() {
        let src = "surface s() { \n   uniform float i, j; \n   for (j=0;j<4;j+=1) { \n     for (i=0;i<4;i+=1) { \n       break 2; \n     } \n   } \n}";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn multi_name_declarations_desugar_to_a_block() {
        let shader = parse("surface s() { uniform float i, j; }").unwrap();
        assert_eq!(shader.body.len(), 1);
        assert!(matches!(shader.body[0], Stmt::Block(ref b) if b.len() == 2));
    }
}
