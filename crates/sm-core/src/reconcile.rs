//! Incremental reconciliation of the intent tree across passes.
//!
//! Each pass the workflow function returns a fresh list of
//! [`Element`]s. The reconciler diffs them against the tree from the previous
//! pass, sibling list by sibling list: stable keys are matched first, then
//! unkeyed elements are matched by kind and position among unkeyed siblings
//! of that kind. Matched nodes keep their [`NodeId`] (and with it the linked
//! ExecutionRecord); everything else is created or removed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::element::{Element, ElementChild};
use crate::loops::{loop_key, LoopState};
use crate::record::{ExecutionRecord, ExecutionStatus};
use crate::tree::{kinds, IntentTree, NodeId, SpecificationError, TextLeaf, TreeChild};

// ---------------------------------------------------------------------------
// RenderContext
// ---------------------------------------------------------------------------

/// Frozen, read-only view handed to the workflow function.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub run_id: String,
    pub pass: u64,
    state: BTreeMap<String, Value>,
    /// Latest record per node path.
    records: HashMap<String, ExecutionRecord>,
}

impl RenderContext {
    pub fn new(
        run_id: impl Into<String>,
        pass: u64,
        state: BTreeMap<String, Value>,
        records: impl IntoIterator<Item = ExecutionRecord>,
    ) -> Self {
        let mut latest: HashMap<String, ExecutionRecord> = HashMap::new();
        for record in records {
            match latest.get(&record.node_path) {
                Some(existing) if existing.created_at > record.created_at => {}
                _ => {
                    latest.insert(record.node_path.clone(), record);
                }
            }
        }
        Self {
            run_id: run_id.into(),
            pass,
            state,
            records: latest,
        }
    }

    /// Store value at `key`, from the snapshot taken before this pass.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Latest record for a node, looked up by node key, then by path.
    pub fn record(&self, key_or_path: &str) -> Option<&ExecutionRecord> {
        self.records
            .values()
            .filter(|r| r.node_key.as_deref() == Some(key_or_path))
            .max_by_key(|r| r.created_at)
            .or_else(|| self.records.get(key_or_path))
    }

    /// Latest record at an exact node path.
    pub fn record_at(&self, path: &str) -> Option<&ExecutionRecord> {
        self.records.get(path)
    }

    pub fn status(&self, key_or_path: &str) -> Option<ExecutionStatus> {
        self.record(key_or_path).map(|r| r.status)
    }

    pub fn is_completed(&self, key_or_path: &str) -> bool {
        self.status(key_or_path) == Some(ExecutionStatus::Completed)
    }

    pub fn is_failed(&self, key_or_path: &str) -> bool {
        self.status(key_or_path) == Some(ExecutionStatus::Failed)
    }

    pub fn output(&self, key_or_path: &str) -> Option<&str> {
        self.record(key_or_path).and_then(|r| r.result.as_deref())
    }

    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.values()
    }

    pub fn state(&self) -> &BTreeMap<String, Value> {
        &self.state
    }

    /// Persisted state of the `while` node keyed `key`.
    pub fn loop_state(&self, key: &str) -> Option<LoopState> {
        self.state
            .get(&loop_key(&self.run_id, key))
            .and_then(LoopState::from_value)
    }

    /// Current iteration of a loop, zero before its first advance.
    pub fn iteration(&self, key: &str) -> u64 {
        self.loop_state(key).map_or(0, |s| s.iteration)
    }
}

// ---------------------------------------------------------------------------
// WorkflowSpec
// ---------------------------------------------------------------------------

/// A workflow specification: a pure function from context to elements.
pub trait WorkflowSpec: Send + Sync {
    fn render(&self, ctx: &RenderContext) -> Result<Vec<Element>, SpecificationError>;
}

impl<F> WorkflowSpec for F
where
    F: Fn(&RenderContext) -> Result<Vec<Element>, SpecificationError> + Send + Sync,
{
    fn render(&self, ctx: &RenderContext) -> Result<Vec<Element>, SpecificationError> {
        self(ctx)
    }
}

// ---------------------------------------------------------------------------
// ReconcileReport
// ---------------------------------------------------------------------------

/// A node removed during a pass, with the record link it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct Unmounted {
    pub id: NodeId,
    pub kind: String,
    pub path: String,
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub generation: u64,
    /// Newly created nodes.
    pub mounted: Vec<NodeId>,
    /// Reused nodes whose attributes changed.
    pub updated: Vec<NodeId>,
    /// Reused nodes with identical attributes.
    pub retained: Vec<NodeId>,
    pub unmounted: Vec<Unmounted>,
}

impl ReconcileReport {
    pub fn is_unchanged(&self) -> bool {
        self.mounted.is_empty() && self.updated.is_empty() && self.unmounted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Owns the intent tree for one mount and updates it pass after pass.
#[derive(Debug, Default)]
pub struct Reconciler {
    tree: IntentTree,
    generation: u64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &IntentTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut IntentTree {
        &mut self.tree
    }

    /// Number of successful passes so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run the workflow and fold its output into the tree.
    pub fn evaluate(
        &mut self,
        spec: &dyn WorkflowSpec,
        ctx: &RenderContext,
    ) -> Result<ReconcileReport, SpecificationError> {
        let mut elements = spec.render(ctx)?;
        stamp_iterations(&mut elements, ctx);
        self.apply(elements)
    }

    /// Fold an element list into the tree. The tree is left untouched when
    /// the elements are malformed.
    pub fn apply(&mut self, elements: Vec<Element>) -> Result<ReconcileReport, SpecificationError> {
        let children: Vec<ElementChild> = elements.into_iter().map(ElementChild::Element).collect();
        validate_children(kinds::ROOT, &children)?;

        self.generation += 1;
        let mut report = ReconcileReport {
            generation: self.generation,
            ..Default::default()
        };
        let root = self.tree.root();
        self.reconcile_children(root, children, &mut report);

        tracing::debug!(
            generation = self.generation,
            mounted = report.mounted.len(),
            updated = report.updated.len(),
            unmounted = report.unmounted.len(),
            "reconciled intent tree"
        );
        Ok(report)
    }

    fn reconcile_children(
        &mut self,
        parent: NodeId,
        new_children: Vec<ElementChild>,
        report: &mut ReconcileReport,
    ) {
        let Some(parent_node) = self.tree.get(parent) else {
            return;
        };
        // A loop body is scoped by iteration so each round gets new paths.
        let parent_path = if parent_node.kind == kinds::WHILE {
            format!(
                "{}@{}",
                parent_node.path,
                parent_node.attr_u64("iteration").unwrap_or(0)
            )
        } else {
            parent_node.path.clone()
        };
        let old_children: Vec<NodeId> = parent_node.child_nodes().collect();

        let mut keyed: HashMap<String, NodeId> = HashMap::new();
        let mut unkeyed: HashMap<String, VecDeque<NodeId>> = HashMap::new();
        for id in &old_children {
            if let Some(node) = self.tree.get(*id) {
                match &node.key {
                    Some(key) => {
                        keyed.insert(key.clone(), *id);
                    }
                    None => unkeyed.entry(node.kind.clone()).or_default().push_back(*id),
                }
            }
        }

        let mut claimed: HashSet<NodeId> = HashSet::new();
        let mut ordinals: HashMap<String, usize> = HashMap::new();
        let mut next_children = Vec::with_capacity(new_children.len());

        for child in new_children {
            let element = match child {
                ElementChild::Text(text) => {
                    next_children.push(TreeChild::Text(TextLeaf::new(text)));
                    continue;
                }
                ElementChild::Element(element) => element,
            };

            let path = format!(
                "{parent_path}/{}",
                path_segment(&element, &mut ordinals)
            );

            // A reused key with a different kind does not match: the old node
            // is removed below and a fresh one is created.
            let matched = match &element.key {
                Some(key) => keyed.get(key).copied().filter(|id| {
                    self.tree
                        .get(*id)
                        .map(|n| n.kind == element.kind)
                        .unwrap_or(false)
                }),
                None => unkeyed
                    .get_mut(&element.kind)
                    .and_then(VecDeque::pop_front),
            };

            let Element {
                kind,
                key,
                attrs,
                children,
            } = element;

            let id = match matched.and_then(|id| self.tree.get_mut(id)) {
                Some(node) => {
                    let id = node.id;
                    claimed.insert(id);
                    node.path = path;
                    if node.attrs != attrs {
                        node.attrs = attrs;
                        report.updated.push(id);
                    } else {
                        report.retained.push(id);
                    }
                    id
                }
                None => {
                    let id = self
                        .tree
                        .alloc(kind, key, attrs, parent, path, self.generation);
                    report.mounted.push(id);
                    id
                }
            };

            self.reconcile_children(id, children, report);
            next_children.push(TreeChild::Node(id));
        }

        for id in old_children {
            if claimed.contains(&id) {
                continue;
            }
            for node in self.tree.remove_subtree(id) {
                report.unmounted.push(Unmounted {
                    id: node.id,
                    kind: node.kind,
                    path: node.path,
                    record_id: node.record_id,
                });
            }
        }

        if let Some(parent_node) = self.tree.get_mut(parent) {
            parent_node.children = next_children;
        }
    }
}

/// Copy each loop's persisted progress onto its `while` element.
fn stamp_iterations(elements: &mut [Element], ctx: &RenderContext) {
    for element in elements {
        if element.kind == kinds::WHILE {
            if let Some(state) = element.key.as_deref().and_then(|k| ctx.loop_state(k)) {
                element
                    .attrs
                    .insert("iteration".to_string(), Value::from(state.iteration));
                if state.status.is_finished() {
                    element.attrs.insert("finished".to_string(), Value::Bool(true));
                }
            }
        }
        for child in &mut element.children {
            if let ElementChild::Element(child) = child {
                stamp_iterations(std::slice::from_mut(child), ctx);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn path_segment(element: &Element, ordinals: &mut HashMap<String, usize>) -> String {
    match &element.key {
        Some(key) => format!("{key}:{}", element.kind),
        None => {
            let ordinal = ordinals.entry(element.kind.clone()).or_insert(0);
            let segment = format!("{ordinal}:{}", element.kind);
            *ordinal += 1;
            segment
        }
    }
}

/// Check a sibling list (recursively) before anything is mutated.
fn validate_children(parent_path: &str, children: &[ElementChild]) -> Result<(), SpecificationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordinals: HashMap<String, usize> = HashMap::new();

    for child in children {
        let ElementChild::Element(element) = child else {
            continue;
        };

        if let Some(key) = &element.key {
            if key.trim().is_empty() {
                return Err(SpecificationError::EmptyKey {
                    kind: element.kind.clone(),
                    parent: parent_path.to_string(),
                });
            }
            if !seen.insert(key.as_str()) {
                return Err(SpecificationError::DuplicateKey {
                    parent: parent_path.to_string(),
                    key: key.clone(),
                });
            }
        }

        let path = format!("{parent_path}/{}", path_segment(element, &mut ordinals));
        if element.kind == kinds::WHILE && element.key.is_none() {
            return Err(SpecificationError::UnkeyedLoop { path });
        }
        validate_attrs(element, &path)?;
        validate_children(&path, &element.children)?;
    }
    Ok(())
}

fn validate_attrs(element: &Element, path: &str) -> Result<(), SpecificationError> {
    for attr in kinds::required_attrs(&element.kind) {
        match element.attrs.get(*attr) {
            None | Some(Value::Null) => {
                return Err(SpecificationError::MissingAttribute {
                    kind: element.kind.clone(),
                    path: path.to_string(),
                    attr: (*attr).to_string(),
                });
            }
            Some(_) => {}
        }
    }

    let invalid = |attr: &str, reason: &str| SpecificationError::InvalidAttribute {
        path: path.to_string(),
        attr: attr.to_string(),
        reason: reason.to_string(),
    };

    for flag in ["condition", "skip", "active"] {
        match element.attrs.get(flag) {
            None | Some(Value::Null) | Some(Value::Bool(_)) => {}
            Some(Value::String(s)) if s == "true" || s == "false" => {}
            Some(_) => return Err(invalid(flag, "expected a boolean")),
        }
    }

    for number in [
        "max_turns",
        "timeout_ms",
        "estimate_input_tokens",
        "estimate_output_tokens",
        "max_iterations",
        "iteration",
    ] {
        match element.attrs.get(number) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) if n.as_u64().is_some() => {}
            Some(_) => return Err(invalid(number, "expected a non-negative integer")),
        }
    }

    for list in ["args", "stop_conditions"] {
        match element.attrs.get(list) {
            None | Some(Value::Null) | Some(Value::Array(_)) => {}
            Some(_) => return Err(invalid(list, "expected an array")),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::elements::*;

    #[test]
    fn first_pass_mounts_everything() {
        let mut rec = Reconciler::new();
        let report = rec
            .apply(vec![phase("p").child(claude("a").key("a")).child(claude("b").key("b"))])
            .unwrap();
        assert_eq!(report.mounted.len(), 3);
        assert_eq!(report.generation, 1);
        assert_eq!(rec.tree().len(), 3);
    }

    #[test]
    fn identical_pass_preserves_identity() {
        let build = || vec![phase("p").child(claude("a").key("a")).child(step("s"))];
        let mut rec = Reconciler::new();
        rec.apply(build()).unwrap();
        let before = rec.tree().walk();
        let report = rec.apply(build()).unwrap();
        assert!(report.is_unchanged());
        assert_eq!(rec.tree().walk(), before);
    }

    #[test]
    fn keyed_match_survives_reordering() {
        let mut rec = Reconciler::new();
        rec.apply(vec![claude("a").key("a"), claude("b").key("b")]).unwrap();
        let a = rec.tree().find_by_key("a").unwrap();
        let b = rec.tree().find_by_key("b").unwrap();

        rec.apply(vec![claude("b").key("b"), claude("a").key("a")]).unwrap();
        assert_eq!(rec.tree().find_by_key("a"), Some(a));
        assert_eq!(rec.tree().find_by_key("b"), Some(b));
        assert_eq!(rec.tree().walk(), vec![b, a]);
    }

    #[test]
    fn unkeyed_match_by_kind_and_position() {
        let mut rec = Reconciler::new();
        rec.apply(vec![step("one"), phase("x"), step("two")]).unwrap();
        let steps: Vec<NodeId> = rec
            .tree()
            .walk()
            .into_iter()
            .filter(|id| rec.tree().get(*id).unwrap().kind == "step")
            .collect();

        // A phase inserted first does not disturb the step ordinals.
        let report = rec
            .apply(vec![phase("new"), step("one"), phase("x"), step("two!")])
            .unwrap();
        let steps_after: Vec<NodeId> = rec
            .tree()
            .walk()
            .into_iter()
            .filter(|id| rec.tree().get(*id).unwrap().kind == "step")
            .collect();
        assert_eq!(steps, steps_after);
        assert_eq!(report.updated.len(), 2); // phase "x" -> "new" and step "two" -> "two!"
        assert_eq!(report.mounted.len(), 1);
    }

    #[test]
    fn type_change_with_same_key_is_remove_and_insert() {
        let mut rec = Reconciler::new();
        rec.apply(vec![claude("a").key("k")]).unwrap();
        let old = rec.tree().find_by_key("k").unwrap();
        rec.tree_mut().attach_record(old, "rec-1");

        let report = rec.apply(vec![approval("ok?").key("k")]).unwrap();
        let new = rec.tree().find_by_key("k").unwrap();
        assert_ne!(old, new);
        assert_eq!(report.mounted, vec![new]);
        assert_eq!(report.unmounted.len(), 1);
        assert_eq!(report.unmounted[0].record_id.as_deref(), Some("rec-1"));
        assert!(rec.tree().get(new).unwrap().record_id.is_none());
    }

    #[test]
    fn duplicate_keys_fail_without_touching_tree() {
        let mut rec = Reconciler::new();
        rec.apply(vec![claude("a").key("a")]).unwrap();
        let before = rec.tree().walk();

        let err = rec
            .apply(vec![claude("a").key("dup"), claude("b").key("dup")])
            .unwrap_err();
        assert!(matches!(err, SpecificationError::DuplicateKey { ref key, .. } if key == "dup"));
        assert_eq!(rec.tree().walk(), before);
        assert_eq!(rec.generation(), 1);
    }

    #[test]
    fn same_key_under_different_parents_is_fine() {
        let mut rec = Reconciler::new();
        let result = rec.apply(vec![
            phase("a").key("pa").child(claude("x").key("k")),
            phase("b").key("pb").child(claude("y").key("k")),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn missing_required_attribute_fails() {
        let mut rec = Reconciler::new();
        let err = rec.apply(vec![Element::new("claude").key("a")]).unwrap_err();
        assert!(matches!(err, SpecificationError::MissingAttribute { ref attr, .. } if attr == "prompt"));
    }

    #[test]
    fn invalid_flag_attribute_fails() {
        let mut rec = Reconciler::new();
        let err = rec
            .apply(vec![phase("p").attr("active", "maybe")])
            .unwrap_err();
        assert!(matches!(err, SpecificationError::InvalidAttribute { ref attr, .. } if attr == "active"));
    }

    #[test]
    fn removed_subtree_is_reported() {
        let mut rec = Reconciler::new();
        rec.apply(vec![phase("p").key("p").child(claude("a").key("a"))])
            .unwrap();
        let report = rec.apply(vec![]).unwrap();
        assert_eq!(report.unmounted.len(), 2);
        assert!(rec.tree().is_empty());
    }

    #[test]
    fn paths_use_keys_and_ordinals() {
        let mut rec = Reconciler::new();
        rec.apply(vec![phase("p").key("main").child(step("s")).child(step("t"))])
            .unwrap();
        let tree = rec.tree();
        let paths: Vec<String> = tree
            .walk()
            .into_iter()
            .map(|id| tree.get(id).unwrap().path.clone())
            .collect();
        assert_eq!(
            paths,
            vec![
                "root/main:phase",
                "root/main:phase/0:step",
                "root/main:phase/1:step"
            ]
        );
    }

    #[test]
    fn evaluate_uses_render_context() {
        let spec = |ctx: &RenderContext| -> Result<Vec<Element>, SpecificationError> {
            let mut out = vec![claude("first").key("first")];
            if ctx.is_completed("first") {
                out.push(claude("second").key("second"));
            }
            Ok(out)
        };

        let mut rec = Reconciler::new();
        let ctx = RenderContext::new("run", 1, BTreeMap::new(), vec![]);
        rec.evaluate(&spec, &ctx).unwrap();
        assert_eq!(rec.tree().len(), 1);

        let mut done = ExecutionRecord::new("run", "root/first:claude", Some("first".into()), "claude");
        done.transition(ExecutionStatus::Running).unwrap();
        done.transition(ExecutionStatus::Completed).unwrap();
        let ctx = RenderContext::new("run", 2, BTreeMap::new(), vec![done]);
        rec.evaluate(&spec, &ctx).unwrap();
        assert_eq!(rec.tree().len(), 2);
    }

    #[test]
    fn loop_body_paths_follow_the_persisted_iteration() {
        let spec = |_: &RenderContext| -> Result<Vec<Element>, SpecificationError> {
            Ok(vec![while_loop(true, 5).key("retry").child(claude("fix").key("fix"))])
        };
        let body_path = |rec: &Reconciler| {
            let tree = rec.tree();
            tree.walk()
                .into_iter()
                .filter_map(|id| tree.get(id))
                .find(|n| n.kind == kinds::CLAUDE)
                .map(|n| n.path.clone())
                .unwrap()
        };

        let mut rec = Reconciler::new();
        let ctx = RenderContext::new("run", 0, BTreeMap::new(), vec![]);
        rec.evaluate(&spec, &ctx).unwrap();
        assert_eq!(body_path(&rec), "root/retry:while@0/fix:claude");

        let mut state = BTreeMap::new();
        state.insert(
            loop_key("run", "retry"),
            LoopState::new(2, 5, crate::loops::LoopStatus::Running).to_value(),
        );
        let ctx = RenderContext::new("run", 1, state, vec![]);
        assert_eq!(ctx.iteration("retry"), 2);
        let report = rec.evaluate(&spec, &ctx).unwrap();
        assert_eq!(report.updated.len(), 1);
        assert_eq!(body_path(&rec), "root/retry:while@2/fix:claude");
    }

    #[test]
    fn finished_loop_is_skipped() {
        let spec = |_: &RenderContext| -> Result<Vec<Element>, SpecificationError> {
            Ok(vec![while_loop(true, 3).key("retry").child(claude("fix"))])
        };
        let mut state = BTreeMap::new();
        state.insert(
            loop_key("run", "retry"),
            LoopState::new(2, 3, crate::loops::LoopStatus::MaxReached).to_value(),
        );
        let mut rec = Reconciler::new();
        rec.evaluate(&spec, &RenderContext::new("run", 0, state, vec![]))
            .unwrap();
        let tree = rec.tree();
        let node = tree.children_of(tree.root())[0];
        assert!(tree.get(node).unwrap().is_skipped());
    }

    #[test]
    fn loop_without_key_fails() {
        let err = Reconciler::new()
            .apply(vec![phase("p").child(while_loop(true, 3).child(claude("fix")))])
            .unwrap_err();
        assert!(matches!(
            err,
            SpecificationError::UnkeyedLoop { ref path } if path == "root/0:phase/0:while"
        ));
    }
}
