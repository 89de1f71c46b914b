//! Token-tree nodes produced by the parser.
//!
//! Nodes are immutable once produced. `Display` re-serializes a node
//! list back into grammar text; for any valid line the round trip is
//! whitespace-insensitively identical.

use serde_json::Value;

use crate::tokenizer::Operator;

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// Bare word resolved against scope at evaluation time.
    Symbol(String),
    /// Typed literal; `none` parses to a null literal.
    Literal(Value),
    /// Comma-separated value list.
    Set(Vec<String>),
    /// `key <op> value`
    BinaryExpr {
        left: String,
        op: Operator,
        right: Box<Ast>,
    },
    /// `left | right`; the left side may itself contain pipes.
    PipeExpr { left: Vec<Ast>, right: Vec<Ast> },
    /// `{ ... }` substituted with the scalar result of the inner line.
    CommandExpansion(Vec<Ast>),
}

impl Ast {
    pub fn symbol(name: &str) -> Self {
        Ast::Symbol(name.to_string())
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::String(s) => format!("\"{}\"", escape(s)),
        other => other.to_string(),
    }
}

/// Joins re-serialized nodes with single spaces.
pub fn render(nodes: &[Ast]) -> String {
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl std::fmt::Display for Ast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ast::Symbol(name) => write!(f, "{}", name),
            Ast::Literal(value) => write!(f, "{}", render_literal(value)),
            Ast::Set(values) => write!(f, "{}", values.join(",")),
            Ast::BinaryExpr { left, op, right } => write!(f, "{}{}{}", left, op, right),
            Ast::PipeExpr { left, right } => write!(f, "{} | {}", render(left), render(right)),
            Ast::CommandExpansion(inner) => write!(f, "{{ {} }}", render(inner)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_binary() {
        let node = Ast::BinaryExpr {
            left: "uid".to_string(),
            op: Operator::Gt,
            right: Box::new(Ast::Literal(json!(1000))),
        };
        assert_eq!(node.to_string(), "uid>1000");
    }

    #[test]
    fn test_render_pipe_and_expansion() {
        let node = Ast::PipeExpr {
            left: vec![Ast::symbol("show")],
            right: vec![
                Ast::symbol("limit"),
                Ast::CommandExpansion(vec![Ast::symbol("echo"), Ast::Literal(json!(5))]),
            ],
        };
        assert_eq!(node.to_string(), "show | limit { echo 5 }");
    }

    #[test]
    fn test_render_string_escapes() {
        let node = Ast::Literal(json!("say \"hi\""));
        assert_eq!(node.to_string(), "\"say \\\"hi\\\"\"");
    }
}
