use crate::{Attributes, Value};

/// Variables visible to an expression.
///
/// Expressions reach them through the `user`, `device` and `params` namespaces, e.g.
/// `user.plan == "free" && params.source == "onboarding"`.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    user: Value,
    device: Value,
    params: Value,
}

impl EvaluationContext {
    #[allow(missing_docs)]
    pub fn new(user: Attributes, device: Attributes, params: Attributes) -> EvaluationContext {
        EvaluationContext {
            user: user.into(),
            device: device.into(),
            params: params.into(),
        }
    }

    /// Look up a top-level identifier.
    pub(crate) fn namespace(&self, name: &str) -> Option<&Value> {
        match name {
            "user" => Some(&self.user),
            "device" => Some(&self.device),
            "params" => Some(&self.params),
            _ => None,
        }
    }
}
