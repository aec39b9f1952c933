//! Recursive-descent parser producing the compiled expression tree.
//!
//! Grammar (highest line binds loosest):
//!
//! ```text
//! expr        := or ("if" or "else" expr)?        (conditional expression)
//! or          := and ("or" and)*
//! and         := unary-not ("and" unary-not)*
//! unary-not   := "not" unary-not | comparison
//! comparison  := arith ((== != < <= > >= in "not in") arith)*   (chained)
//! arith       := term (("+" | "-") term)*
//! term        := power (("*" | "/" | "%" | "//") power)*
//! power       := unary ("**" power)?
//! unary       := ("-" | "+") unary | postfix
//! postfix     := primary ("." IDENT | "[" expr "]")*
//! primary     := literal | IDENT | IDENT "(" args ")" | "(" expr ")"
//!              | "[" items "]" | "{" pairs "}"
//! ```
//!
//! Calls are only legal on bare identifiers; the whitelist check happens at
//! evaluation, where unknown callees surface as `UndefinedName`.

use super::lexer::Token;
use super::ExprError;
use serde_json::Value;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

/// Comparison operators (chainable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

/// A compiled expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

/// Parse a token stream into an expression tree.
pub fn parse(tokens: &[Token]) -> Result<Expr, ExprError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(ExprError::Syntax(format!(
            "unexpected trailing token {:?}",
            tokens[parser.pos]
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let value = self.or_expr()?;

        // Python-style conditional: `a if cond else b`.
        if self.eat(&Token::If) {
            let condition = self.or_expr()?;
            self.expect(&Token::Else)?;
            let otherwise = self.expr()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }

        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.and_expr()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.and_expr()?);
        }
        Ok(Expr::Or(operands))
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.not_expr()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.not_expr()?);
        }
        Ok(Expr::And(operands))
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let first = self.arith()?;
        let mut rest = Vec::new();

        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtEq) => CmpOp::LtEq,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtEq) => CmpOp::GtEq,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) => {
                    // `not in` is the only postfix use of `not`.
                    if self.tokens.get(self.pos + 1) == Some(&Token::In) {
                        self.pos += 1;
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.power()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.power()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.unary()?;
        if self.eat(&Token::DoubleStar) {
            // Right-associative.
            let exponent = self.power()?;
            return Ok(Expr::Binary(
                BinOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Attr(Box::new(expr), name.clone());
                    }
                    other => {
                        return Err(ExprError::Syntax(format!(
                            "expected attribute name after '.', found {:?}",
                            other
                        )));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let token = self
            .next()
            .ok_or_else(|| ExprError::Syntax("unexpected end of expression".into()))?
            .clone();

        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::from(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::None => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                        if self.peek() == Some(&Token::RBracket) {
                            break;
                        }
                    }
                    self.expect(&Token::RBracket)?;
                }
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut pairs = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.expr()?;
                        self.expect(&Token::Colon)?;
                        let value = self.expr()?;
                        pairs.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                        if self.peek() == Some(&Token::RBrace) {
                            break;
                        }
                    }
                    self.expect(&Token::RBrace)?;
                }
                Ok(Expr::Dict(pairs))
            }
            other => Err(ExprError::Syntax(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_str(input: &str) -> Expr {
        parse(&tokenize(input).unwrap()).unwrap()
    }

    #[test]
    fn test_precedence() {
        // x + y * 2 parses as x + (y * 2)
        let expr = parse_str("x + y * 2");
        match expr {
            Expr::Binary(BinOp::Add, _, right) => {
                assert!(matches!(*right, Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_conditional_expression() {
        let expr = parse_str("1 if flag else 2");
        assert!(matches!(expr, Expr::Conditional { .. }));
    }

    #[test]
    fn test_chained_comparison() {
        let expr = parse_str("0 <= x < 10");
        match expr {
            Expr::Compare(_, rest) => assert_eq!(rest.len(), 2),
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_attribute_and_index() {
        let expr = parse_str("users.data[0]");
        assert!(matches!(expr, Expr::Index(_, _)));
    }

    #[test]
    fn test_call_with_args() {
        let expr = parse_str("min(a, b, 3)");
        match expr {
            Expr::Call(name, args) => {
                assert_eq!(name, "min");
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_collections() {
        assert!(matches!(parse_str("[1, 2, 3]"), Expr::List(items) if items.len() == 3));
        assert!(matches!(parse_str("{'a': 1}"), Expr::Dict(pairs) if pairs.len() == 1));
    }

    #[test]
    fn test_not_in() {
        let expr = parse_str("x not in items");
        match expr {
            Expr::Compare(_, rest) => assert_eq!(rest[0].0, CmpOp::NotIn),
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let tokens = tokenize("1 2").unwrap();
        assert!(parse(&tokens).is_err());
    }
}
