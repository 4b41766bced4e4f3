use super::lexer::LexicalError;

/// Enum representing errors that can occur while parsing or evaluating an expression.
///
/// None of these reach the host application: the orchestrator reports a failed expression as a
/// non-matching rule and logs the error.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExpressionError {
    /// Source text contains something that is not a token.
    #[error("{error} at {position}")]
    Lexical {
        #[allow(missing_docs)]
        error: LexicalError,
        /// Byte offset into the source text.
        position: usize,
    },

    /// Tokens do not form a valid expression.
    #[error("syntax error at {position}: {message}")]
    Syntax {
        /// Byte offset into the source text.
        position: usize,
        #[allow(missing_docs)]
        message: String,
    },

    /// Source text ended in the middle of an expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Expression tree is nested deeper than [`MAX_DEPTH`](super::MAX_DEPTH).
    #[error("expression is nested too deeply")]
    TooDeep,

    /// Both `expression` and `expressionAst` are present on a rule.
    #[error("rule has both expression text and expression tree")]
    AmbiguousExpression,

    /// Identifier that is not one of the known namespaces.
    #[error("undeclared reference to '{0}'")]
    UnknownIdentifier(String),

    /// Map does not contain the requested key (or list index out of bounds).
    #[error("no such key: {0}")]
    NoSuchKey(String),

    /// Function that is neither a built-in nor a host function.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Operator or function is not defined for the argument types.
    #[error("no such overload: {operation}({types})")]
    NoSuchOverload {
        #[allow(missing_docs)]
        operation: &'static str,
        /// Comma-separated list of argument type names.
        types: String,
    },

    /// Integer overflow or division by zero.
    #[error("arithmetic error: {0}")]
    Arithmetic(&'static str),

    /// Argument of `matches()` is not a valid regular expression.
    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    /// Arguments of host functions must not contain other host function calls.
    #[error("nested host function call in arguments of {0}")]
    NestedHostCall(String),

    /// Expression evaluated to a non-boolean value.
    #[error("expression evaluated to {0}, expected bool")]
    NotBoolean(&'static str),
}

impl ExpressionError {
    pub(crate) fn no_overload(operation: &'static str, types: &[&'static str]) -> ExpressionError {
        ExpressionError::NoSuchOverload {
            operation,
            types: types.join(", "),
        }
    }
}
