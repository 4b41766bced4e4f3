//! Recursive descent parser for expression source text.
//!
//! Precedence, from lowest to highest:
//!
//! | operator                           | associativity |
//! |------------------------------------|---------------|
//! | `? :`                              | right         |
//! | `\|\|`                             | left          |
//! | `&&`                               | left          |
//! | `< <= > >= == != in`               | left          |
//! | `+ -`                              | left          |
//! | `* / %`                            | left          |
//! | unary `! -`                        | right         |
//! | `.name` `.name(...)` `[index]`     | left          |
use super::{
    ast::{ArithmeticOp, Atom, Expr, Member, RelationOp, UnaryOp, MAX_DEPTH},
    error::ExpressionError,
    lexer::{Lexer, Token},
};

/// Parse expression source text into a tree.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|(error, span)| ExpressionError::Lexical {
            error,
            position: span.start,
        })?;

    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    if let Some((start, token, _)) = parser.tokens.get(parser.position) {
        return Err(ExpressionError::Syntax {
            position: *start,
            message: format!("unexpected {token} after expression"),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token, usize)>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token, _)| token)
    }

    fn next(&mut self) -> Result<(usize, Token), ExpressionError> {
        let (start, token, _) = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.position += 1;
        Ok((start, token))
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let (start, token) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ExpressionError::Syntax {
                position: start,
                message: format!("expected {expected}, found {token}"),
            })
        }
    }

    /// Count one level of tree depth. Binary operator chains and member chains grow the tree one
    /// level per link, so their loops descend on every iteration and restore the depth on exit.
    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep);
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.descend()?;
        let condition = self.or()?;
        let expr = if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expression()?;
            Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }
        } else {
            condition
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let right = self.and()?;
            left = Expr::Or {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = depth;
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.relation()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let right = self.relation()?;
            left = Expr::And {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = depth;
        Ok(left)
    }

    fn relation(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.addition()?;
        loop {
            let op = match self.peek() {
                Some(Token::LessThan) => RelationOp::LessThan,
                Some(Token::LessThanEqual) => RelationOp::LessThanOrEqual,
                Some(Token::GreaterThan) => RelationOp::GreaterThan,
                Some(Token::GreaterThanEqual) => RelationOp::GreaterThanOrEqual,
                Some(Token::Equal) => RelationOp::Equals,
                Some(Token::NotEqual) => RelationOp::NotEquals,
                Some(Token::In) => RelationOp::In,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.position += 1;
            self.descend()?;
            let right = self.addition()?;
            left = Expr::relation(op, left, right);
        }
    }

    fn addition(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.multiplication()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithmeticOp::Add,
                Some(Token::Minus) => ArithmeticOp::Subtract,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.position += 1;
            self.descend()?;
            let right = self.multiplication()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn multiplication(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithmeticOp::Multiply,
                Some(Token::Slash) => ArithmeticOp::Divide,
                Some(Token::Percent) => ArithmeticOp::Modulo,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.position += 1;
            self.descend()?;
            let right = self.unary()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Some(Token::Not) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Negate,
            _ => return self.member(),
        };
        self.position += 1;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;

        Ok(match (op, operand) {
            // Fold negative literals so that `-1` is an atom, like the server-built trees.
            (UnaryOp::Negate, Expr::Atom { value: Atom::Int(i) }) if i != i64::MIN => {
                Expr::atom(Atom::Int(-i))
            }
            (UnaryOp::Negate, Expr::Atom { value: Atom::Float(f) }) => Expr::atom(Atom::Float(-f)),
            (op, operand) => Expr::Unary {
                op,
                expr: Box::new(operand),
            },
        })
    }

    fn member(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                self.descend()?;
                let name = self.identifier()?;
                expr = if self.eat(&Token::LeftParenthesis) {
                    let args = self.list_until(Token::RightParenthesis)?;
                    Expr::call(name, Some(expr), args)
                } else {
                    Expr::attribute(expr, name)
                };
            } else if self.eat(&Token::LeftSquareBracket) {
                self.descend()?;
                let index = self.expression()?;
                self.expect(Token::RightSquareBracket)?;
                expr = Expr::Member {
                    expr: Box::new(expr),
                    member: Member::Index(Box::new(index)),
                };
            } else {
                self.depth = depth;
                return Ok(expr);
            }
        }
    }

    fn identifier(&mut self) -> Result<String, ExpressionError> {
        match self.next()? {
            (_, Token::Identifier(name)) => Ok(name),
            (start, token) => Err(ExpressionError::Syntax {
                position: start,
                message: format!("expected identifier, found {token}"),
            }),
        }
    }

    /// Parse comma-separated expressions up to (and including) the closing token. A trailing comma
    /// is allowed.
    fn list_until(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        while !self.eat(&close) {
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let (start, token) = self.next()?;
        let expr = match token {
            Token::Null => Expr::atom(Atom::Null),
            Token::BooleanLiteral(b) => Expr::atom(Atom::Bool(b)),
            Token::IntegerLiteral(i) => Expr::atom(Atom::Int(i)),
            Token::FloatLiteral(f) => Expr::atom(Atom::Float(f)),
            Token::StringLiteral(s) => Expr::atom(Atom::String(s)),
            Token::Identifier(name) => {
                if self.eat(&Token::LeftParenthesis) {
                    let args = self.list_until(Token::RightParenthesis)?;
                    Expr::call(name, None, args)
                } else {
                    Expr::ident(name)
                }
            }
            Token::LeftParenthesis => {
                let expr = self.expression()?;
                self.expect(Token::RightParenthesis)?;
                expr
            }
            Token::LeftSquareBracket => Expr::List {
                elements: self.list_until(Token::RightSquareBracket)?,
            },
            Token::LeftBrace => {
                let mut entries = Vec::new();
                while !self.eat(&Token::RightBrace) {
                    let key = self.expression()?;
                    self.expect(Token::Colon)?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RightBrace)?;
                        break;
                    }
                }
                Expr::Map { entries }
            }
            token => {
                return Err(ExpressionError::Syntax {
                    position: start,
                    message: format!("unexpected {token}"),
                })
            }
        };
        Ok(expr)
    }
}
