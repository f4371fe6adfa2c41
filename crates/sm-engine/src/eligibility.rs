//! Which nodes a pass dispatches, whether the tree asks to stop, and the
//! fan-in status of parallel boundaries.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sm_core::reconcile::RenderContext;
use sm_core::record::ExecutionStatus;
use sm_core::tree::{kinds, IntentTree, NodeId};

/// Pre-order walk that does not descend into skipped or inactive subtrees,
/// nor into dispatchable nodes.
fn visible_nodes(tree: &IntentTree, from: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = tree.children_of(from).into_iter().rev().collect();
    while let Some(id) = stack.pop() {
        let Some(node) = tree.get(id) else { continue };
        if node.is_skipped() || !node.is_active() {
            continue;
        }
        out.push(id);
        if !node.is_dispatchable() {
            stack.extend(tree.children_of(id).into_iter().rev());
        }
    }
    out
}

/// Dispatchable nodes whose record is absent or non-terminal and that are not
/// already in flight, in tree order.
pub fn find_eligible(
    tree: &IntentTree,
    ctx: &RenderContext,
    in_flight: &HashSet<NodeId>,
) -> Vec<NodeId> {
    visible_nodes(tree, tree.root())
        .into_iter()
        .filter(|id| !in_flight.contains(id))
        .filter(|id| {
            tree.get(*id).is_some_and(|node| {
                node.is_dispatchable()
                    && ctx
                        .record_at(&node.path)
                        .is_none_or(|record| !record.is_terminal())
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMarker {
    pub node: NodeId,
    pub path: String,
    pub reason: Option<String>,
}

/// First `stop` node outside any skipped subtree.
pub fn find_stop_marker(tree: &IntentTree) -> Option<StopMarker> {
    visible_nodes(tree, tree.root()).into_iter().find_map(|id| {
        let node = tree.get(id)?;
        (node.kind == kinds::STOP).then(|| StopMarker {
            node: id,
            path: node.path.clone(),
            reason: node.attr_str("reason").map(str::to_string),
        })
    })
}

// ---------------------------------------------------------------------------
// Parallel boundaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryStatus {
    /// Nothing below has been dispatched yet.
    Pending,
    Running,
    Completed,
    /// Every child settled and at least one failed.
    Failed,
}

impl BoundaryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BoundaryStatus::Completed | BoundaryStatus::Failed)
    }
}

/// Fan-in status of the subtree under `id`: terminal only once every
/// dispatchable descendant has a terminal record.
pub fn boundary_status(tree: &IntentTree, id: NodeId, ctx: &RenderContext) -> BoundaryStatus {
    let mut started = false;
    let mut settled = true;
    let mut failed = false;

    for child in visible_nodes(tree, id) {
        let Some(node) = tree.get(child) else { continue };
        if !node.is_dispatchable() {
            continue;
        }
        match ctx.record_at(&node.path).map(|r| r.status) {
            None => settled = false,
            Some(ExecutionStatus::Pending | ExecutionStatus::Running) => {
                started = true;
                settled = false;
            }
            Some(ExecutionStatus::Completed) => started = true,
            Some(ExecutionStatus::Failed) => {
                started = true;
                failed = true;
            }
        }
    }

    match (settled, started, failed) {
        (true, _, true) => BoundaryStatus::Failed,
        (true, _, false) => BoundaryStatus::Completed,
        (false, true, _) => BoundaryStatus::Running,
        (false, false, _) => BoundaryStatus::Pending,
    }
}

/// `while` nodes outside any skipped or inactive ancestor, whatever their
/// own condition, in tree order.
pub fn loop_nodes(tree: &IntentTree) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = tree.children_of(tree.root()).into_iter().rev().collect();
    while let Some(id) = stack.pop() {
        let Some(node) = tree.get(id) else { continue };
        if node.attr_bool("skip") == Some(true) || !node.is_active() {
            continue;
        }
        if node.kind == kinds::WHILE {
            out.push(id);
        }
        if node.is_skipped() || node.is_dispatchable() {
            continue;
        }
        stack.extend(tree.children_of(id).into_iter().rev());
    }
    out
}

/// Whether anything under `id` can be dispatched.
pub fn has_dispatchable(tree: &IntentTree, id: NodeId) -> bool {
    visible_nodes(tree, id)
        .into_iter()
        .any(|child| tree.get(child).is_some_and(|n| n.is_dispatchable()))
}

/// Every visible parallel boundary, in tree order.
pub fn parallel_boundaries(tree: &IntentTree) -> Vec<NodeId> {
    visible_nodes(tree, tree.root())
        .into_iter()
        .filter(|id| tree.get(*id).is_some_and(|n| n.kind == kinds::PARALLEL))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_core::element::elements;
    use sm_core::reconcile::Reconciler;
    use sm_core::record::ExecutionRecord;
    use std::collections::BTreeMap;

    fn record(path: &str, status: ExecutionStatus) -> ExecutionRecord {
        let mut r = ExecutionRecord::new("run", path, None, "claude");
        r.status = status;
        r
    }

    fn ctx(records: Vec<ExecutionRecord>) -> RenderContext {
        RenderContext::new("run", 1, BTreeMap::new(), records)
    }

    fn paths(tree: &IntentTree, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|id| tree.get(*id).unwrap().path.clone()).collect()
    }

    #[test]
    fn skipped_and_inactive_subtrees_are_not_eligible() {
        let mut r = Reconciler::new();
        r.apply(vec![
            elements::claude("a").key("a"),
            elements::when(false).child(elements::claude("b").key("b")),
            elements::phase("later")
                .attr("active", false)
                .child(elements::claude("c").key("c")),
            elements::claude("d").key("d").skip(true),
            elements::step("now").child(elements::command("ls", ["-l"]).key("e")),
        ])
        .unwrap();
        let eligible = find_eligible(r.tree(), &ctx(vec![]), &HashSet::new());
        assert_eq!(
            paths(r.tree(), &eligible),
            vec!["root/a:claude", "root/0:step/e:command"]
        );
    }

    #[test]
    fn terminal_records_and_in_flight_nodes_are_excluded() {
        let mut r = Reconciler::new();
        r.apply(vec![
            elements::claude("a").key("a"),
            elements::claude("b").key("b"),
            elements::claude("c").key("c"),
        ])
        .unwrap();
        let tree = r.tree();
        let b = tree.find_by_key("b").unwrap();
        let context = ctx(vec![
            record("root/a:claude", ExecutionStatus::Completed),
            record("root/c:claude", ExecutionStatus::Running),
        ]);
        let in_flight = HashSet::from([b]);
        let eligible = find_eligible(tree, &context, &in_flight);
        // `c` has a non-terminal record but nothing in flight: dispatch again.
        assert_eq!(paths(tree, &eligible), vec!["root/c:claude"]);
    }

    #[test]
    fn stop_marker_found_unless_skipped() {
        let mut r = Reconciler::new();
        r.apply(vec![
            elements::when(false).child(elements::stop(Some("hidden"))),
            elements::phase("p").child(elements::stop(Some("done"))),
        ])
        .unwrap();
        let marker = find_stop_marker(r.tree()).unwrap();
        assert_eq!(marker.reason.as_deref(), Some("done"));

        r.apply(vec![elements::claude("x").key("x")]).unwrap();
        assert_eq!(find_stop_marker(r.tree()), None);
    }

    #[test]
    fn boundary_settles_only_when_every_child_is_terminal() {
        let mut r = Reconciler::new();
        r.apply(vec![elements::parallel().key("fan").children([
            elements::claude("a").key("a"),
            elements::claude("b").key("b"),
        ])])
        .unwrap();
        let tree = r.tree();
        let fan = tree.find_by_key("fan").unwrap();
        let a = "root/fan:parallel/a:claude";
        let b = "root/fan:parallel/b:claude";

        assert_eq!(boundary_status(tree, fan, &ctx(vec![])), BoundaryStatus::Pending);
        assert_eq!(
            boundary_status(tree, fan, &ctx(vec![record(a, ExecutionStatus::Running)])),
            BoundaryStatus::Running
        );
        assert_eq!(
            boundary_status(
                tree,
                fan,
                &ctx(vec![
                    record(a, ExecutionStatus::Completed),
                    record(b, ExecutionStatus::Running)
                ])
            ),
            BoundaryStatus::Running
        );
        assert_eq!(
            boundary_status(
                tree,
                fan,
                &ctx(vec![
                    record(a, ExecutionStatus::Completed),
                    record(b, ExecutionStatus::Failed)
                ])
            ),
            BoundaryStatus::Failed
        );
        assert_eq!(parallel_boundaries(tree), vec![fan]);
    }

    #[test]
    fn loops_are_found_even_when_their_condition_is_false() {
        let mut r = Reconciler::new();
        r.apply(vec![
            elements::while_loop(false, 3).key("done").child(elements::claude("a")),
            elements::when(false).child(elements::while_loop(true, 3).key("hidden")),
            elements::phase("p").child(
                elements::while_loop(true, 3)
                    .key("outer")
                    .child(elements::while_loop(true, 2).key("inner").child(elements::claude("b"))),
            ),
            elements::while_loop(true, 3).key("empty"),
        ])
        .unwrap();
        let tree = r.tree();
        let keys: Vec<&str> = loop_nodes(tree)
            .into_iter()
            .filter_map(|id| tree.get(id)?.key.as_deref())
            .collect();
        assert_eq!(keys, vec!["done", "outer", "inner", "empty"]);

        let outer = tree.find_by_key("outer").unwrap();
        let empty = tree.find_by_key("empty").unwrap();
        assert!(has_dispatchable(tree, outer));
        assert!(!has_dispatchable(tree, empty));
    }
}
