//! Sandboxed rule expression language.
//!
//! Expressions are a small CEL-like language over three namespaces: `user`, `device` and `params`.
//! Calls under `platform.` (and `computed.`, `device.`) are host functions backed by the event
//! history, e.g. `platform.daysSince("signup") > 3`.
//!
//! Evaluation never touches mutable state. Host functions only read from the event history.
mod ast;
mod context;
mod error;
mod eval;
mod host;
mod lexer;
mod parser;

pub use ast::{ArithmeticOp, Atom, Expr, Member, RelationOp, UnaryOp, MAX_DEPTH};
pub use context::EvaluationContext;
pub use error::ExpressionError;
pub use host::{collect_host_calls, substitute_host_calls, HostCall, HostFunctions};
pub use lexer::LexicalError;
pub use parser::parse;

use std::borrow::Cow;

use crate::TriggerRule;

/// Evaluate expression, resolving host function calls through `host`.
///
/// Each distinct host call (same name and arguments) is resolved exactly once.
pub async fn evaluate(
    expr: &Expr,
    ctx: &EvaluationContext,
    host: &dyn HostFunctions,
) -> Result<bool, ExpressionError> {
    let calls = collect_host_calls(expr, ctx)?;
    if calls.is_empty() {
        return eval::evaluate_bool(expr, ctx);
    }

    let mut resolved = Vec::with_capacity(calls.len());
    for call in calls {
        let value = host.call(&call.name, &call.args).await;
        log::trace!(target: "paywall_trigger", function = call.name.as_str(); "resolved host call to {value:?}");
        resolved.push((call, value));
    }

    let expr = substitute_host_calls(expr.clone(), &resolved, ctx)?;
    eval::evaluate_bool(&expr, ctx)
}

impl TriggerRule {
    /// Get the expression tree of the rule, parsing source text if needed.
    ///
    /// Returns `None` if the rule has no expression (and therefore always matches). Trees deeper
    /// than [`MAX_DEPTH`] are rejected.
    pub fn expression_tree(&self) -> Result<Option<Cow<'_, Expr>>, ExpressionError> {
        match (&self.expression, &self.expression_ast) {
            (None, None) => Ok(None),
            (Some(_), Some(_)) => Err(ExpressionError::AmbiguousExpression),
            (Some(source), None) => parse(source).map(|expr| Some(Cow::Owned(expr))),
            (None, Some(expr)) if expr.depth() > MAX_DEPTH => Err(ExpressionError::TooDeep),
            (None, Some(expr)) => Ok(Some(Cow::Borrowed(expr))),
        }
    }

    /// Evaluate the rule's expression. A rule without expression always matches.
    pub async fn evaluate_expression(
        &self,
        ctx: &EvaluationContext,
        host: &dyn HostFunctions,
    ) -> Result<bool, ExpressionError> {
        match self.expression_tree()? {
            None => Ok(true),
            Some(expr) => evaluate(&expr, ctx, host).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::{Atom, EvaluationContext, Expr, ExpressionError, HostFunctions, UnaryOp, MAX_DEPTH};
    use crate::{TriggerRule, Value, VariantOption};

    struct NoHost;

    #[async_trait]
    impl HostFunctions for NoHost {
        async fn call(&self, _name: &str, _args: &[Value]) -> Value {
            Value::Bool(false)
        }
    }

    fn rule() -> TriggerRule {
        TriggerRule::new("exp", "group", vec![VariantOption::holdout("v", 100)])
    }

    #[tokio::test]
    async fn rule_without_expression_matches() {
        assert_eq!(
            rule()
                .evaluate_expression(&EvaluationContext::default(), &NoHost)
                .await,
            Ok(true)
        );
    }

    #[tokio::test]
    async fn text_and_tree_are_mutually_exclusive() {
        let mut rule = rule().with_expression("true");
        rule.expression_ast = Some(super::parse("true").unwrap());
        assert_eq!(
            rule.evaluate_expression(&EvaluationContext::default(), &NoHost)
                .await,
            Err(ExpressionError::AmbiguousExpression)
        );
    }

    #[tokio::test]
    async fn rejects_deep_server_trees() {
        let mut rule = rule();
        rule.expression_ast = Some((0..MAX_DEPTH).fold(Expr::atom(Atom::Bool(true)), |expr, _| {
            Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            }
        }));
        assert_eq!(
            rule.evaluate_expression(&EvaluationContext::default(), &NoHost)
                .await,
            Err(ExpressionError::TooDeep)
        );
    }

    #[tokio::test]
    async fn long_flat_chain_is_an_error() {
        let rule = rule().with_expression(vec!["true"; 10_000].join(" && "));
        assert_eq!(
            rule.evaluate_expression(&EvaluationContext::default(), &NoHost)
                .await,
            Err(ExpressionError::TooDeep)
        );
    }

    #[tokio::test]
    async fn evaluates_expression_text() {
        let rule = rule().with_expression("params.count > 2");
        let ctx = EvaluationContext::new(
            Default::default(),
            Default::default(),
            [("count".to_owned(), Value::Int(3))].into_iter().collect(),
        );
        assert_eq!(rule.evaluate_expression(&ctx, &NoHost).await, Ok(true));
    }
}
