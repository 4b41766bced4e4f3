//! Pure evaluation of an expression tree against an [`EvaluationContext`].
//!
//! By the time a tree gets here, host function calls have been replaced with literals (see
//! [`host`](super::host)), so evaluation has no side effects and never awaits.
use std::{borrow::Cow, cmp::Ordering, collections::BTreeMap};

use regex::Regex;
use semver::Version;

use super::{
    ast::{ArithmeticOp, Expr, Member, RelationOp, UnaryOp},
    context::EvaluationContext,
    error::ExpressionError,
};
use crate::Value;

/// Evaluate expression to a boolean. Any non-boolean result is an error.
pub fn evaluate_bool(expr: &Expr, ctx: &EvaluationContext) -> Result<bool, ExpressionError> {
    match eval(expr, ctx)?.as_ref() {
        Value::Bool(b) => Ok(*b),
        other => Err(ExpressionError::NotBoolean(other.type_name())),
    }
}

/// Evaluate expression to a value.
pub fn evaluate(expr: &Expr, ctx: &EvaluationContext) -> Result<Value, ExpressionError> {
    eval(expr, ctx).map(Cow::into_owned)
}

fn eval<'a>(expr: &Expr, ctx: &'a EvaluationContext) -> Result<Cow<'a, Value>, ExpressionError> {
    match expr {
        Expr::Atom { value } => Ok(Cow::Owned(value.clone().into())),

        Expr::Ident { name } => ctx
            .namespace(name)
            .map(Cow::Borrowed)
            .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone())),

        Expr::List { elements } => {
            let values = elements
                .iter()
                .map(|e| evaluate(e, ctx))
                .collect::<Result<_, _>>()?;
            Ok(Cow::Owned(Value::List(values)))
        }

        Expr::Map { entries } => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = match evaluate(key, ctx)? {
                    Value::String(s) => s,
                    other => return Err(ExpressionError::no_overload("{:}", &[other.type_name()])),
                };
                map.insert(key, evaluate(value, ctx)?);
            }
            Ok(Cow::Owned(Value::Map(map)))
        }

        Expr::Member { expr, member } => {
            let target = eval(expr, ctx)?;
            match member {
                Member::Attribute(name) => get_key(target, name),
                Member::Index(index) => {
                    let index = eval(index, ctx)?;
                    get_index(target, &index)
                }
            }
        }

        Expr::FunctionCall {
            function,
            receiver,
            args,
        } => call(function, receiver.as_deref(), args, ctx).map(Cow::Owned),

        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx)?;
            let result = match (op, value.as_ref()) {
                (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                (UnaryOp::Negate, Value::Int(i)) => Value::Int(
                    i.checked_neg()
                        .ok_or(ExpressionError::Arithmetic("integer overflow"))?,
                ),
                (UnaryOp::Negate, Value::Float(f)) => Value::Float(-f),
                (UnaryOp::Not, other) => {
                    return Err(ExpressionError::no_overload("!_", &[other.type_name()]))
                }
                (UnaryOp::Negate, other) => {
                    return Err(ExpressionError::no_overload("-_", &[other.type_name()]))
                }
            };
            Ok(Cow::Owned(result))
        }

        Expr::Arithmetic { op, left, right } => {
            let left = evaluate(left, ctx)?;
            let right = evaluate(right, ctx)?;
            arithmetic(*op, left, right).map(Cow::Owned)
        }

        Expr::Relation { op, left, right } => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            relation(*op, &left, &right).map(|b| Cow::Owned(Value::Bool(b)))
        }

        // Logical operators are commutative with respect to errors: `false && error` and `error &&
        // false` are both `false`.
        Expr::And { left, right } => match evaluate_bool(left, ctx) {
            Ok(false) => Ok(Cow::Owned(Value::Bool(false))),
            Ok(true) => evaluate_bool(right, ctx).map(|b| Cow::Owned(Value::Bool(b))),
            Err(err) => match evaluate_bool(right, ctx) {
                Ok(false) => Ok(Cow::Owned(Value::Bool(false))),
                _ => Err(err),
            },
        },

        Expr::Or { left, right } => match evaluate_bool(left, ctx) {
            Ok(true) => Ok(Cow::Owned(Value::Bool(true))),
            Ok(false) => evaluate_bool(right, ctx).map(|b| Cow::Owned(Value::Bool(b))),
            Err(err) => match evaluate_bool(right, ctx) {
                Ok(true) => Ok(Cow::Owned(Value::Bool(true))),
                _ => Err(err),
            },
        },

        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => match eval(condition, ctx)?.as_ref() {
            Value::Bool(true) => eval(then, ctx),
            Value::Bool(false) => eval(otherwise, ctx),
            other => Err(ExpressionError::no_overload("_?_:_", &[other.type_name()])),
        },
    }
}

fn get_key<'a>(target: Cow<'a, Value>, key: &str) -> Result<Cow<'a, Value>, ExpressionError> {
    let value = match target {
        Cow::Borrowed(Value::Map(map)) => map.get(key).map(Cow::Borrowed),
        Cow::Owned(Value::Map(mut map)) => map.remove(key).map(Cow::Owned),
        other => return Err(ExpressionError::no_overload("_._", &[other.type_name()])),
    };
    value.ok_or_else(|| ExpressionError::NoSuchKey(key.to_owned()))
}

fn get_index<'a>(target: Cow<'a, Value>, index: &Value) -> Result<Cow<'a, Value>, ExpressionError> {
    match (target, index) {
        (target, Value::String(key)) if matches!(target.as_ref(), Value::Map(_)) => {
            get_key(target, key)
        }
        (Cow::Borrowed(Value::List(list)), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| list.get(i))
            .map(Cow::Borrowed)
            .ok_or_else(|| ExpressionError::NoSuchKey(i.to_string())),
        (Cow::Owned(Value::List(mut list)), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .filter(|i| *i < list.len())
            .map(|i| Cow::Owned(list.swap_remove(i)))
            .ok_or_else(|| ExpressionError::NoSuchKey(i.to_string())),
        (target, index) => Err(ExpressionError::no_overload(
            "_[_]",
            &[target.type_name(), index.type_name()],
        )),
    }
}

fn call(
    function: &str,
    receiver: Option<&Expr>,
    args: &[Expr],
    ctx: &EvaluationContext,
) -> Result<Value, ExpressionError> {
    // `has()` inspects its argument instead of evaluating it.
    if function == "has" && receiver.is_none() {
        return match args {
            [Expr::Member {
                expr,
                member: Member::Attribute(name),
            }] => match eval(expr, ctx)?.as_ref() {
                Value::Map(map) => Ok(Value::Bool(map.contains_key(name))),
                other => Err(ExpressionError::no_overload("has", &[other.type_name()])),
            },
            _ => Err(ExpressionError::no_overload("has", &["expr"])),
        };
    }

    let mut values = Vec::with_capacity(args.len() + 1);
    if let Some(receiver) = receiver {
        values.push(evaluate(receiver, ctx)?);
    }
    for arg in args {
        values.push(evaluate(arg, ctx)?);
    }

    let result = match (function, values.as_slice()) {
        ("size", [Value::String(s)]) => Value::Int(s.chars().count() as i64),
        ("size", [Value::List(list)]) => Value::Int(list.len() as i64),
        ("size", [Value::Map(map)]) => Value::Int(map.len() as i64),

        ("contains", [Value::String(s), Value::String(sub)]) => Value::Bool(s.contains(sub.as_str())),
        ("startsWith", [Value::String(s), Value::String(prefix)]) => {
            Value::Bool(s.starts_with(prefix.as_str()))
        }
        ("endsWith", [Value::String(s), Value::String(suffix)]) => {
            Value::Bool(s.ends_with(suffix.as_str()))
        }
        ("matches", [Value::String(s), Value::String(pattern)]) => {
            let regex = Regex::new(pattern)
                .map_err(|err| ExpressionError::InvalidRegex(err.to_string()))?;
            Value::Bool(regex.is_match(s))
        }

        ("int", [Value::Int(i)]) => Value::Int(*i),
        ("int", [Value::Float(f)]) if f.is_finite() => Value::Int(f.trunc() as i64),
        ("int", [Value::String(s)]) => Value::Int(
            s.parse()
                .map_err(|_| ExpressionError::no_overload("int", &["string"]))?,
        ),
        ("double", [Value::Int(i)]) => Value::Float(*i as f64),
        ("double", [Value::Float(f)]) => Value::Float(*f),
        ("double", [Value::String(s)]) => Value::Float(
            s.parse()
                .map_err(|_| ExpressionError::no_overload("double", &["string"]))?,
        ),
        ("string", [Value::String(s)]) => Value::String(s.clone()),
        ("string", [Value::Int(i)]) => Value::String(i.to_string()),
        ("string", [Value::Float(f)]) => Value::String(f.to_string()),
        ("string", [Value::Bool(b)]) => Value::String(b.to_string()),

        (
            "size" | "contains" | "startsWith" | "endsWith" | "matches" | "int" | "double"
            | "string",
            values,
        ) => {
            let operation = builtin_name(function);
            let types = values.iter().map(Value::type_name).collect::<Vec<_>>();
            return Err(ExpressionError::no_overload(operation, &types));
        }

        _ => return Err(ExpressionError::UnknownFunction(function.to_owned())),
    };
    Ok(result)
}

fn builtin_name(function: &str) -> &'static str {
    match function {
        "size" => "size",
        "contains" => "contains",
        "startsWith" => "startsWith",
        "endsWith" => "endsWith",
        "matches" => "matches",
        "int" => "int",
        "double" => "double",
        _ => "string",
    }
}

fn arithmetic(op: ArithmeticOp, left: Value, right: Value) -> Result<Value, ExpressionError> {
    const OVERFLOW: ExpressionError = ExpressionError::Arithmetic("integer overflow");

    let result = match (op, left, right) {
        (ArithmeticOp::Add, Value::Int(a), Value::Int(b)) => a.checked_add(b).ok_or(OVERFLOW)?,
        (ArithmeticOp::Subtract, Value::Int(a), Value::Int(b)) => {
            a.checked_sub(b).ok_or(OVERFLOW)?
        }
        (ArithmeticOp::Multiply, Value::Int(a), Value::Int(b)) => {
            a.checked_mul(b).ok_or(OVERFLOW)?
        }
        (ArithmeticOp::Divide, Value::Int(_), Value::Int(0)) => {
            return Err(ExpressionError::Arithmetic("division by zero"))
        }
        (ArithmeticOp::Divide, Value::Int(a), Value::Int(b)) => a.checked_div(b).ok_or(OVERFLOW)?,
        (ArithmeticOp::Modulo, Value::Int(_), Value::Int(0)) => {
            return Err(ExpressionError::Arithmetic("modulus by zero"))
        }
        (ArithmeticOp::Modulo, Value::Int(a), Value::Int(b)) => a.checked_rem(b).ok_or(OVERFLOW)?,

        (ArithmeticOp::Add, Value::String(a), Value::String(b)) => {
            return Ok(Value::String(a + &b))
        }
        (ArithmeticOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            return Ok(Value::List(a));
        }

        (op, left, right) => {
            return match (op, left.as_f64(), right.as_f64()) {
                (ArithmeticOp::Add, Some(a), Some(b)) => Ok(Value::Float(a + b)),
                (ArithmeticOp::Subtract, Some(a), Some(b)) => Ok(Value::Float(a - b)),
                (ArithmeticOp::Multiply, Some(a), Some(b)) => Ok(Value::Float(a * b)),
                (ArithmeticOp::Divide, Some(a), Some(b)) => Ok(Value::Float(a / b)),
                _ => Err(ExpressionError::no_overload(
                    arithmetic_name(op),
                    &[left.type_name(), right.type_name()],
                )),
            };
        }
    };
    Ok(Value::Int(result))
}

fn arithmetic_name(op: ArithmeticOp) -> &'static str {
    match op {
        ArithmeticOp::Add => "_+_",
        ArithmeticOp::Subtract => "_-_",
        ArithmeticOp::Multiply => "_*_",
        ArithmeticOp::Divide => "_/_",
        ArithmeticOp::Modulo => "_%_",
    }
}

fn relation(op: RelationOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    let ordering = |name| compare(name, left, right);
    Ok(match op {
        RelationOp::Equals => values_equal(left, right),
        RelationOp::NotEquals => !values_equal(left, right),
        RelationOp::LessThan => ordering("_<_")?.is_lt(),
        RelationOp::LessThanOrEqual => ordering("_<=_")?.is_le(),
        RelationOp::GreaterThan => ordering("_>_")?.is_gt(),
        RelationOp::GreaterThanOrEqual => ordering("_>=_")?.is_ge(),
        RelationOp::In => match right {
            Value::List(list) => list.iter().any(|item| values_equal(left, item)),
            Value::Map(map) => match left {
                Value::String(key) => map.contains_key(key),
                _ => false,
            },
            _ => {
                return Err(ExpressionError::no_overload(
                    "@in",
                    &[left.type_name(), right.type_name()],
                ))
            }
        },
    })
}

/// Equality across numeric types compares by value. Values of unrelated types are never equal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (a, b) => a == b,
    }
}

fn compare(
    operation: &'static str,
    left: &Value,
    right: &Value,
) -> Result<Ordering, ExpressionError> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => {
            // Version strings ("1.10.0" vs "1.9.0") compare by semver precedence when both sides
            // parse.
            match (Version::parse(a), Version::parse(b)) {
                (Ok(a), Ok(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    ordering
        .ok_or_else(|| ExpressionError::no_overload(operation, &[left.type_name(), right.type_name()]))
}
