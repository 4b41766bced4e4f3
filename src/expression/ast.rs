//! Expression tree.
//!
//! The tree can be delivered by the server directly (`expressionAst`) or produced by
//! [`parse`](super::parse) from source text. Both end up here, so the evaluator only ever looks at
//! `Expr`.
use serde::{Deserialize, Serialize};

use crate::Value;

/// Deepest expression tree that is evaluated. Deeper trees are rejected with
/// [`ExpressionError::TooDeep`](super::ExpressionError::TooDeep).
pub const MAX_DEPTH: usize = 100;

/// Literal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
#[allow(missing_docs)]
pub enum Atom {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<Atom> for Value {
    fn from(value: Atom) -> Value {
        match value {
            Atom::Null => Value::Null,
            Atom::Bool(b) => Value::Bool(b),
            Atom::Int(i) => Value::Int(i),
            Atom::Float(f) => Value::Float(f),
            Atom::String(s) => Value::String(s),
        }
    }
}

/// Member access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Member {
    /// `expr.name`
    Attribute(String),
    /// `expr[index]`
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RelationOp {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equals,
    NotEquals,
    In,
}

/// Expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum Expr {
    Atom {
        value: Atom,
    },
    Ident {
        name: String,
    },
    List {
        elements: Vec<Expr>,
    },
    /// Map literal. Entries are kept in source order.
    Map {
        entries: Vec<(Expr, Expr)>,
    },
    Member {
        expr: Box<Expr>,
        member: Member,
    },
    /// Function call, either global (`size(x)`) or with a receiver (`x.startsWith("a")`).
    FunctionCall {
        function: String,
        #[serde(default)]
        receiver: Option<Box<Expr>>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Relation {
        op: RelationOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    #[allow(missing_docs)]
    pub fn atom(value: Atom) -> Expr {
        Expr::Atom { value }
    }

    #[allow(missing_docs)]
    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Ident { name: name.into() }
    }

    /// `expr.name`
    pub fn attribute(expr: Expr, name: impl Into<String>) -> Expr {
        Expr::Member {
            expr: Box::new(expr),
            member: Member::Attribute(name.into()),
        }
    }

    #[allow(missing_docs)]
    pub fn relation(op: RelationOp, left: Expr, right: Expr) -> Expr {
        Expr::Relation {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[allow(missing_docs)]
    pub fn call(function: impl Into<String>, receiver: Option<Expr>, args: Vec<Expr>) -> Expr {
        Expr::FunctionCall {
            function: function.into(),
            receiver: receiver.map(Box::new),
            args,
        }
    }

    /// Convert a resolved value back into a literal expression.
    pub fn from_value(value: Value) -> Expr {
        match value {
            Value::Null => Expr::atom(Atom::Null),
            Value::Bool(b) => Expr::atom(Atom::Bool(b)),
            Value::Int(i) => Expr::atom(Atom::Int(i)),
            Value::Float(f) => Expr::atom(Atom::Float(f)),
            Value::String(s) => Expr::atom(Atom::String(s)),
            Value::List(values) => Expr::List {
                elements: values.into_iter().map(Expr::from_value).collect(),
            },
            Value::Map(map) => Expr::Map {
                entries: map
                    .into_iter()
                    .map(|(k, v)| (Expr::atom(Atom::String(k)), Expr::from_value(v)))
                    .collect(),
            },
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Atom { .. } | Expr::Ident { .. } => Vec::new(),
            Expr::List { elements } => elements.iter().collect(),
            Expr::Map { entries } => entries.iter().flat_map(|(k, v)| [k, v]).collect(),
            Expr::Member { expr, member } => match member {
                Member::Attribute(_) => vec![&**expr],
                Member::Index(index) => vec![&**expr, &**index],
            },
            Expr::FunctionCall { receiver, args, .. } => {
                receiver.as_deref().into_iter().chain(args).collect()
            }
            Expr::Unary { expr, .. } => vec![&**expr],
            Expr::Arithmetic { left, right, .. }
            | Expr::Relation { left, right, .. }
            | Expr::And { left, right }
            | Expr::Or { left, right } => vec![&**left, &**right],
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => vec![&**condition, &**then, &**otherwise],
        }
    }

    /// Number of nodes on the longest root-to-leaf path. Computed without recursion, so it is safe
    /// to call on trees of any depth.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 1)];
        while let Some((expr, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            pending.extend(expr.children().into_iter().map(|child| (child, depth + 1)));
        }
        deepest
    }

    /// Visit every node in post-order (children before their parent).
    ///
    /// Recursive: only call on trees within [`MAX_DEPTH`].
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        for child in self.children() {
            child.walk(f);
        }
        f(self);
    }

    /// Rebuild the tree bottom-up: children are transformed first, then `f` is applied to the
    /// rebuilt parent.
    pub fn map_all<E>(self, f: &mut impl FnMut(Expr) -> Result<Expr, E>) -> Result<Expr, E> {
        let rebuilt = match self {
            Expr::Atom { .. } | Expr::Ident { .. } => self,
            Expr::List { elements } => Expr::List {
                elements: elements
                    .into_iter()
                    .map(|e| e.map_all(f))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Map { entries } => Expr::Map {
                entries: entries
                    .into_iter()
                    .map(|(k, v)| Ok::<_, E>((k.map_all(f)?, v.map_all(f)?)))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Member { expr, member } => Expr::Member {
                expr: Box::new(expr.map_all(f)?),
                member: match member {
                    Member::Attribute(name) => Member::Attribute(name),
                    Member::Index(index) => Member::Index(Box::new(index.map_all(f)?)),
                },
            },
            Expr::FunctionCall {
                function,
                receiver,
                args,
            } => Expr::FunctionCall {
                function,
                receiver: match receiver {
                    Some(receiver) => Some(Box::new(receiver.map_all(f)?)),
                    None => None,
                },
                args: args
                    .into_iter()
                    .map(|e| e.map_all(f))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op,
                expr: Box::new(expr.map_all(f)?),
            },
            Expr::Arithmetic { op, left, right } => Expr::Arithmetic {
                op,
                left: Box::new(left.map_all(f)?),
                right: Box::new(right.map_all(f)?),
            },
            Expr::Relation { op, left, right } => Expr::Relation {
                op,
                left: Box::new(left.map_all(f)?),
                right: Box::new(right.map_all(f)?),
            },
            Expr::And { left, right } => Expr::And {
                left: Box::new(left.map_all(f)?),
                right: Box::new(right.map_all(f)?),
            },
            Expr::Or { left, right } => Expr::Or {
                left: Box::new(left.map_all(f)?),
                right: Box::new(right.map_all(f)?),
            },
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => Expr::Ternary {
                condition: Box::new(condition.map_all(f)?),
                then: Box::new(then.map_all(f)?),
                otherwise: Box::new(otherwise.map_all(f)?),
            },
        };
        f(rebuilt)
    }
}
