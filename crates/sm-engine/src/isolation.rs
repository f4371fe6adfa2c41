use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use sm_core::tree::IntentNode;

use crate::context::RunContext;

/// Where and with what environment one dispatch runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Isolation {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Decides the execution environment of each dispatched node, so concurrent
/// subtrees do not trample each other's working files.
pub trait IsolationProvider: Send + Sync {
    fn isolate(&self, ctx: &RunContext, node: &IntentNode) -> io::Result<Isolation>;
}

/// Every node runs in the run's working directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedWorkspace;

impl IsolationProvider for SharedWorkspace {
    fn isolate(&self, ctx: &RunContext, _node: &IntentNode) -> io::Result<Isolation> {
        Ok(Isolation {
            cwd: ctx.cwd.clone(),
            env: ctx.env.clone(),
        })
    }
}

/// Each node gets its own directory under `base/<run_id>/`, named after its
/// path. The directory is created on first dispatch and reused afterwards.
#[derive(Debug, Clone)]
pub struct DirectoryPerNode {
    base: PathBuf,
}

impl DirectoryPerNode {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn dir_for(&self, run_id: &str, node_path: &str) -> PathBuf {
        let name: String = node_path
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base.join(run_id).join(name)
    }
}

impl IsolationProvider for DirectoryPerNode {
    fn isolate(&self, ctx: &RunContext, node: &IntentNode) -> io::Result<Isolation> {
        let dir = self.dir_for(&ctx.run_id, &node.path);
        std::fs::create_dir_all(&dir)?;
        let mut env = ctx.env.clone();
        env.insert("SMITHY_RUN_ID".into(), ctx.run_id.clone());
        env.insert("SMITHY_NODE_PATH".into(), node.path.clone());
        Ok(Isolation {
            cwd: Some(dir),
            env,
        })
    }
}
