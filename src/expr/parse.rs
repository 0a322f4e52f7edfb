//! Recursive-descent parser producing the expression AST.

use super::token::{tokenize, Spanned, Token};
use super::{ExprError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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

/// A compiled expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Tuple(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Compile `src` into an AST.
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, index: 0 };
        let expr = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError::Parse {
                pos: extra.pos,
                msg: format!("unexpected trailing {:?}", extra.token),
            });
        }
        Ok(expr)
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.index).cloned();
        if spanned.is_some() {
            self.index += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|spanned| &spanned.token) == Some(token) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {token:?}")))
        }
    }

    fn unexpected(&self, msg: &str) -> ExprError {
        match self.peek() {
            Some(spanned) => ExprError::Parse {
                pos: spanned.pos,
                msg: format!("{msg}, found {:?}", spanned.token),
            },
            None => ExprError::Parse {
                pos: usize::MAX,
                msg: format!("{msg}, found end of input"),
            },
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.cmp_expr()?;
        while self.eat(&Token::And) {
            let right = self.cmp_expr()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ExprError> {
        let left = self.sum_expr()?;
        let op = match self.peek().map(|spanned| &spanned.token) {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::LtEq) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::GtEq) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.index += 1;
        let right = self.sum_expr()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn sum_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term_expr()?;
        loop {
            let op = match self.peek().map(|spanned| &spanned.token) {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.index += 1;
            let right = self.term_expr()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek().map(|spanned| &spanned.token) {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.index += 1;
            let right = self.unary_expr()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Minus) {
            let inner = self.unary_expr()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        if self.eat(&Token::Not) {
            let inner = self.unary_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(spanned) = self.next() else {
            return Err(ExprError::Parse {
                pos: usize::MAX,
                msg: "expected expression, found end of input".into(),
            });
        };
        match spanned.token {
            Token::Int(int) => Ok(Expr::Literal(Value::Int(int))),
            Token::Float(float) => Ok(Expr::Literal(Value::Float(float))),
            Token::Str(text) => Ok(Expr::Literal(Value::Str(text))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Field(name))
                }
            }
            Token::LParen => self.paren_or_tuple(),
            other => {
                self.index -= 1;
                let _ = other;
                Err(self.unexpected("expected expression"))
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(args);
        }
    }

    /// `(a)` is grouping; `(a,)`, `(a, b)` and `()` are tuples.
    fn paren_or_tuple(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::RParen) {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.expr()?;
        if self.eat(&Token::RParen) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.eat(&Token::RParen) {
                return Ok(Expr::Tuple(items));
            }
            items.push(self.expr()?);
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Tuple(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tuple_key() {
        let expr = Expr::parse("(sat, scene, time)").unwrap();
        assert!(matches!(expr, Expr::Tuple(items) if items.len() == 3));
    }

    #[test]
    fn test_grouping_is_not_a_tuple() {
        let expr = Expr::parse("(defects)").unwrap();
        assert!(matches!(expr, Expr::Field(name) if name == "defects"));
    }

    #[test]
    fn test_precedence() {
        // a + b * c parses as a + (b * c)
        let expr = Expr::parse("a + b * c").unwrap();
        let Expr::Binary(BinaryOp::Add, _, right) = expr else {
            panic!("expected top-level add");
        };
        assert!(matches!(*right, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn test_call() {
        let expr = Expr::parse("re_sub('a+', 'b', path)").unwrap();
        assert!(matches!(expr, Expr::Call(name, args) if name == "re_sub" && args.len() == 3));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(Expr::parse("a b").is_err());
    }
}
