//! Plan/audit rendering of the intent tree and a small structural linter.
//!
//! Both functions take `&IntentTree` and are pure: rendering twice yields the
//! same bytes and linting twice yields the same warnings.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tree::{kinds, IntentNode, IntentTree, NodeId, TreeChild};

const INDENT: &str = "  ";

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Render every child of the synthetic root as XML-like markup.
pub fn serialize_plan(tree: &IntentTree) -> String {
    tree.children_of(tree.root())
        .into_iter()
        .map(|id| {
            let mut out = String::new();
            write_node(tree, id, 0, &mut out);
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a single node and its subtree.
pub fn serialize_node(tree: &IntentTree, id: NodeId) -> String {
    let mut out = String::new();
    write_node(tree, id, 0, &mut out);
    out
}

fn write_node(tree: &IntentTree, id: NodeId, depth: usize, out: &mut String) {
    let Some(node) = tree.get(id) else {
        return;
    };
    let pad = INDENT.repeat(depth);

    out.push_str(&pad);
    write_open_tag(node, out);

    if node.children.is_empty() {
        out.push_str(" />");
        return;
    }
    out.push('>');

    let has_text = node
        .children
        .iter()
        .any(|c| matches!(c, TreeChild::Text(_)));

    if has_text {
        // Mixed content stays on one line so the text is not padded.
        for child in &node.children {
            match child {
                TreeChild::Text(text) => out.push_str(&escape_text(text.as_str())),
                TreeChild::Node(child_id) => write_node(tree, *child_id, 0, out),
            }
        }
    } else {
        for child_id in node.child_nodes() {
            out.push('\n');
            write_node(tree, child_id, depth + 1, out);
        }
        out.push('\n');
        out.push_str(&pad);
    }

    let _ = write!(out, "</{}>", node.kind);
}

fn write_open_tag(node: &IntentNode, out: &mut String) {
    out.push('<');
    out.push_str(&node.kind);

    if let Some(key) = &node.key {
        let _ = write!(out, " key=\"{}\"", escape_attr(key));
    }
    for (name, value) in &node.attrs {
        if name == "key" {
            continue;
        }
        let rendered = match value {
            Value::Null => continue,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => value.to_string(),
        };
        let _ = write!(out, " {}=\"{}\"", name, escape_attr(&rendered));
    }
}

fn escape_base(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(raw: &str) -> String {
    escape_base(raw).replace('"', "&quot;")
}

fn escape_text(raw: &str) -> String {
    escape_base(raw).replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Lint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintSeverity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LintWarning {
    pub rule: String,
    pub path: String,
    pub message: String,
    pub severity: LintSeverity,
}

impl LintWarning {
    fn new(rule: &str, node: &IntentNode, message: String, severity: LintSeverity) -> Self {
        Self {
            rule: rule.to_string(),
            path: node.path.clone(),
            message,
            severity,
        }
    }
}

/// Structural warnings for the current tree, sorted and deduplicated.
pub fn lint(tree: &IntentTree) -> Vec<LintWarning> {
    let mut found = BTreeSet::new();

    for id in tree.walk() {
        let Some(node) = tree.get(id) else {
            continue;
        };

        if kinds::is_runnable(&node.kind) && node.key.is_none() {
            found.insert(LintWarning::new(
                "runnable-needs-key",
                node,
                format!(
                    "`{}` at {} has no key; its record is matched by position only",
                    node.kind, node.path
                ),
                LintSeverity::Warning,
            ));
        }

        if kinds::is_agent(&node.kind) && node.attr_u64("max_turns").is_none() {
            found.insert(LintWarning::new(
                "agent-needs-max-turns",
                node,
                format!("`{}` at {} has no max_turns limit", node.kind, node.path),
                LintSeverity::Info,
            ));
        }

        if node.kind == kinds::APPROVAL && node.key.is_none() {
            found.insert(LintWarning::new(
                "approval-needs-key",
                node,
                format!("approval at {} needs a key to be answered", node.path),
                LintSeverity::Warning,
            ));
        }
    }

    found.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::elements::*;
    use crate::reconcile::Reconciler;

    fn tree_of(elements: Vec<crate::element::Element>) -> IntentTree {
        let mut rec = Reconciler::new();
        rec.apply(elements).expect("valid elements");
        rec.tree().clone()
    }

    #[test]
    fn childless_nodes_self_close() {
        let tree = tree_of(vec![stop(None)]);
        assert_eq!(serialize_plan(&tree), "<stop />");
    }

    #[test]
    fn nested_nodes_are_indented() {
        let tree = tree_of(vec![phase("build")
            .key("p")
            .child(claude("go").key("a").attr("max_turns", 3))]);
        assert_eq!(
            serialize_plan(&tree),
            "<phase key=\"p\" name=\"build\">\n  <claude key=\"a\" max_turns=\"3\" prompt=\"go\" />\n</phase>"
        );
    }

    #[test]
    fn attribute_rendering_rules() {
        let tree = tree_of(vec![command("sh", ["-c", "a<b"])
            .key("c")
            .attr("flag", true)
            .attr("gone", Value::Null)
            .attr("quote", "say \"hi\" & go")]);
        assert_eq!(
            serialize_plan(&tree),
            "<command key=\"c\" args=\"[&quot;-c&quot;,&quot;a&lt;b&quot;]\" flag=\"true\" program=\"sh\" quote=\"say &quot;hi&quot; &amp; go\" />"
        );
    }

    #[test]
    fn text_children_render_inline_and_escaped() {
        let tree = tree_of(vec![step("s").text("it's <done> & \"ok\"")]);
        assert_eq!(
            serialize_plan(&tree),
            "<step name=\"s\">it&apos;s &lt;done&gt; &amp; \"ok\"</step>"
        );
    }

    #[test]
    fn root_children_are_joined_by_newlines() {
        let tree = tree_of(vec![step("a"), step("b")]);
        assert_eq!(
            serialize_plan(&tree),
            "<step name=\"a\" />\n<step name=\"b\" />"
        );
    }

    #[test]
    fn lint_flags_missing_keys_once() {
        let tree = tree_of(vec![claude("x"), approval("ok?"), claude("y").key("y")]);
        let first = lint(&tree);
        let second = lint(&tree);
        assert_eq!(first, second);

        let rules: Vec<&str> = first.iter().map(|w| w.rule.as_str()).collect();
        assert_eq!(rules.iter().filter(|r| **r == "runnable-needs-key").count(), 1);
        assert_eq!(rules.iter().filter(|r| **r == "approval-needs-key").count(), 1);
        assert_eq!(rules.iter().filter(|r| **r == "agent-needs-max-turns").count(), 2);
    }
}
