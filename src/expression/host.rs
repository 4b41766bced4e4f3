//! Host function calls.
//!
//! Calls like `platform.daysSince("signup")` need the event history and are resolved outside of
//! the pure evaluator, in two phases:
//!
//! 1. [`collect_host_calls`] finds every host call in the tree and evaluates its arguments. Calls
//!    with equal name and arguments are collected once.
//! 2. After the calls are resolved, [`substitute_host_calls`] replaces each call with a literal of
//!    its resolved value, leaving a tree that [`eval`](super::eval) can handle.
use async_trait::async_trait;

use super::{
    ast::{Expr, Member},
    context::EvaluationContext,
    error::ExpressionError,
    eval,
};
use crate::Value;

/// Receivers under which function calls are treated as host calls.
const CALL_NAMESPACES: [&str; 3] = ["platform", "computed", "device"];
/// Receivers under which member access (without call) is treated as a zero-argument host call.
/// `device.x` is a plain attribute lookup.
const MEMBER_NAMESPACES: [&str; 2] = ["platform", "computed"];

/// Resolves host function calls. Implemented by
/// [`ComputedPropertyResolver`](crate::ComputedPropertyResolver).
#[async_trait]
pub trait HostFunctions: Send + Sync {
    /// Resolve a call. Unknown functions and invalid arguments must resolve to `Value::Bool(false)`
    /// rather than fail.
    async fn call(&self, name: &str, args: &[Value]) -> Value;
}

/// A host function call with evaluated arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub args: Vec<Value>,
}

impl HostCall {
    fn evaluate(
        name: &str,
        args: &[Expr],
        ctx: &EvaluationContext,
    ) -> Result<HostCall, ExpressionError> {
        let args = args
            .iter()
            .map(|arg| {
                if contains_host_call(arg) {
                    Err(ExpressionError::NestedHostCall(name.to_owned()))
                } else {
                    eval::evaluate(arg, ctx)
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(HostCall {
            name: name.to_owned(),
            args,
        })
    }
}

fn is_ident_in(expr: &Expr, namespaces: &[&str]) -> bool {
    matches!(expr, Expr::Ident { name } if namespaces.contains(&name.as_str()))
}

fn as_host_call(expr: &Expr) -> Option<(&str, &[Expr])> {
    match expr {
        Expr::FunctionCall {
            function,
            receiver: Some(receiver),
            args,
        } if is_ident_in(receiver, &CALL_NAMESPACES) => Some((function.as_str(), args.as_slice())),
        Expr::Member {
            expr,
            member: Member::Attribute(name),
        } if is_ident_in(expr, &MEMBER_NAMESPACES) => Some((name.as_str(), &[][..])),
        _ => None,
    }
}

fn contains_host_call(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |node| found |= as_host_call(node).is_some());
    found
}

/// Find all distinct host calls in the expression.
pub fn collect_host_calls(
    expr: &Expr,
    ctx: &EvaluationContext,
) -> Result<Vec<HostCall>, ExpressionError> {
    let mut found = Vec::new();
    expr.walk(&mut |node| found.extend(as_host_call(node)));

    let mut calls: Vec<HostCall> = Vec::with_capacity(found.len());
    for (name, args) in found {
        let call = HostCall::evaluate(name, args, ctx)?;
        if !calls.contains(&call) {
            calls.push(call);
        }
    }
    Ok(calls)
}

/// Replace host calls with literals of their resolved values. Calls missing from `resolved` are
/// replaced with `false`.
pub fn substitute_host_calls(
    expr: Expr,
    resolved: &[(HostCall, Value)],
    ctx: &EvaluationContext,
) -> Result<Expr, ExpressionError> {
    expr.map_all(&mut |node| {
        let call = match as_host_call(&node) {
            Some((name, args)) => HostCall::evaluate(name, args, ctx)?,
            None => return Ok(node),
        };
        let value = resolved
            .iter()
            .find(|(resolved_call, _)| resolved_call == &call)
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Bool(false));
        Ok(Expr::from_value(value))
    })
}
