//! `condition` nodes route execution onto `condtrue` / `condfalse` ports.
//!
//! The decision comes from the node's `expression` config evaluated against
//! variables and inputs, or, absent an expression, from a boolean inbound
//! body (`true`/`false` or `{"result": bool}`).
//!
//! Expression grammar is deliberately small: `true`/`false` literals,
//! `!expr` negation, `a == b` equality (each side a variable name or
//! quoted/bare literal), and bare variable truthiness.

use super::{extra_str, template_vars};
use crate::handler::{HandlerContext, NodeHandler};
use async_trait::async_trait;
use dipeo_core::diagram::{Node, NodeType};
use dipeo_core::envelope::{Envelope, PortMap, PORT_CONDFALSE, PORT_CONDTRUE};
use dipeo_core::error::ExecutionError;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn execute(
        &self,
        node: &Node,
        inputs: PortMap,
        ctx: &HandlerContext,
    ) -> Result<PortMap, ExecutionError> {
        let vars = template_vars(&ctx.variables_snapshot(), &inputs);

        let flag = match extra_str(&node.config.extra, "expression") {
            Some(expression) => eval_expression(expression, &vars),
            None => boolean_input(&inputs).ok_or_else(|| {
                ExecutionError::handler(
                    node.id.clone(),
                    "condition has neither an expression nor a boolean input",
                )
            })?,
        };

        let port = if flag { PORT_CONDTRUE } else { PORT_CONDFALSE };
        let envelope = Envelope::json(node.id.clone(), json!({ "result": flag }));
        Ok([(port.to_string(), envelope)].into_iter().collect())
    }
}

fn boolean_input(inputs: &PortMap) -> Option<bool> {
    for envelope in inputs.values() {
        match envelope.body.as_json() {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::Object(map)) => {
                if let Some(Value::Bool(b)) = map.get("result") {
                    return Some(*b);
                }
            }
            _ => {}
        }
    }
    None
}

fn eval_expression(expression: &str, vars: &HashMap<String, Value>) -> bool {
    let expression = expression.trim();

    if let Some(rest) = expression.strip_prefix('!') {
        return !eval_expression(rest, vars);
    }

    if let Some((left, right)) = expression.split_once("==") {
        return resolve_term(left.trim(), vars) == resolve_term(right.trim(), vars);
    }

    match expression {
        "true" => true,
        "false" => false,
        name => vars.get(name).map_or(false, is_truthy),
    }
}

/// A term is a variable reference if it names one, otherwise a literal
/// (quotes stripped).
fn resolve_term(term: &str, vars: &HashMap<String, Value>) -> Value {
    if let Some(value) = vars.get(term) {
        return value.clone();
    }
    let unquoted = term.trim_matches(|c| c == '"' || c == '\'');
    if let Ok(value) = serde_json::from_str::<Value>(unquoted) {
        if !value.is_string() {
            return value;
        }
    }
    Value::String(unquoted.to_string())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_literals_and_negation() {
        let empty = HashMap::new();
        assert!(eval_expression("true", &empty));
        assert!(!eval_expression("false", &empty));
        assert!(eval_expression("!false", &empty));
        assert!(!eval_expression("!!false", &empty));
    }

    #[test]
    fn test_variable_truthiness() {
        let vars = vars(&[
            ("yes", json!("ok")),
            ("no", json!("")),
            ("zero", json!(0)),
            ("some", json!([1])),
        ]);
        assert!(eval_expression("yes", &vars));
        assert!(!eval_expression("no", &vars));
        assert!(!eval_expression("zero", &vars));
        assert!(eval_expression("some", &vars));
        assert!(!eval_expression("unknown", &vars));
    }

    #[test]
    fn test_equality() {
        let vars = vars(&[("mode", json!("fast")), ("count", json!(3))]);
        assert!(eval_expression("mode == \"fast\"", &vars));
        assert!(eval_expression("mode == fast", &vars));
        assert!(!eval_expression("mode == slow", &vars));
        assert!(eval_expression("count == 3", &vars));
        assert!(eval_expression("!mode == slow", &vars));
    }

    #[test]
    fn test_boolean_input_extraction() {
        use dipeo_core::ids::NodeId;
        let inputs: PortMap = [(
            "default".to_string(),
            Envelope::json(NodeId::new("u"), json!({"result": false})),
        )]
        .into_iter()
        .collect();
        assert_eq!(boolean_input(&inputs), Some(false));

        let bare: PortMap = [(
            "default".to_string(),
            Envelope::json(NodeId::new("u"), json!(true)),
        )]
        .into_iter()
        .collect();
        assert_eq!(boolean_input(&bare), Some(true));

        let opaque: PortMap = [(
            "default".to_string(),
            Envelope::text(NodeId::new("u"), "not a bool"),
        )]
        .into_iter()
        .collect();
        assert_eq!(boolean_input(&opaque), None);
    }
}
