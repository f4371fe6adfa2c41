//! Declarative description of an intent tree, produced by the
//! workflow on every pass and fed to the [`Reconciler`](crate::reconcile::Reconciler).

use serde_json::Value;

use crate::tree::AttrMap;

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// One node as described by the workflow function.
///
/// Elements are cheap throwaway values: the reconciler consumes them and
/// either reuses an existing [`IntentNode`](crate::tree::IntentNode) or
/// creates a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: String,
    pub key: Option<String>,
    pub attrs: AttrMap,
    pub children: Vec<ElementChild>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementChild {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: None,
            attrs: AttrMap::new(),
            children: Vec::new(),
        }
    }

    /// Set the stable key used to match this element across passes.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set an attribute. `Value::Null` is kept here and dropped on serialization.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Set an attribute only when `value` is `Some`.
    pub fn attr_opt<V: Into<Value>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.attr(name, v),
            None => self,
        }
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(ElementChild::Element(child));
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children
            .extend(children.into_iter().map(ElementChild::Element));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(ElementChild::Text(text.into()));
        self
    }

    /// Mark the element (and its subtree) as skipped.
    pub fn skip(self, skipped: bool) -> Self {
        self.attr("skip", skipped)
    }
}

// ---------------------------------------------------------------------------
// Constructors for the built-in node kinds
// ---------------------------------------------------------------------------

/// Shorthand constructors for the node kinds the engine understands.
pub mod elements {
    use super::Element;
    use crate::tree::kinds;

    /// An agent invocation.
    pub fn claude(prompt: impl Into<String>) -> Element {
        Element::new(kinds::CLAUDE).attr("prompt", prompt.into())
    }

    /// A plain external command, `args` rendered as a JSON array.
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Element
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<serde_json::Value> = args
            .into_iter()
            .map(|a| serde_json::Value::String(a.into()))
            .collect();
        Element::new(kinds::COMMAND)
            .attr("program", program.into())
            .attr("args", serde_json::Value::Array(args))
    }

    /// A human approval gate.
    pub fn approval(prompt: impl Into<String>) -> Element {
        Element::new(kinds::APPROVAL).attr("prompt", prompt.into())
    }

    pub fn phase(name: impl Into<String>) -> Element {
        Element::new(kinds::PHASE).attr("name", name.into())
    }

    pub fn step(name: impl Into<String>) -> Element {
        Element::new(kinds::STEP).attr("name", name.into())
    }

    /// A parallel boundary: its child subtrees are dispatched together.
    pub fn parallel() -> Element {
        Element::new(kinds::PARALLEL)
    }

    pub fn when(condition: bool) -> Element {
        Element::new(kinds::IF).attr("condition", condition)
    }

    /// A loop: its children run again each time they all settle, while
    /// `condition` holds and fewer than `max_iterations` have run.
    pub fn while_loop(condition: bool, max_iterations: u64) -> Element {
        Element::new(kinds::WHILE)
            .attr("condition", condition)
            .attr("max_iterations", max_iterations)
    }

    pub fn fragment() -> Element {
        Element::new(kinds::FRAGMENT)
    }

    /// The termination marker.
    pub fn stop(reason: Option<&str>) -> Element {
        Element::new(kinds::STOP).attr_opt("reason", reason.map(str::to_string))
    }
}
