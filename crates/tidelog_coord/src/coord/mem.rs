//! In-process coordination ensemble.
//!
//! A hierarchical versioned store under a single lock, with the same
//! observable semantics the epoch store relies on from a real ensemble:
//! parent-checked creates, versioned conditional sets, and all-or-nothing
//! multis. Fault hooks (injected return codes, session-state overrides, and
//! pause gates) let tests interleave concurrent writers deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use super::types::{
    CoordClient, CoordClientFactory, MultiResponse, Op, OpResponse, Rc, SessionState, Stat,
    ANY_VERSION,
};

#[derive(Clone, Debug)]
struct MemNode {
    value: Vec<u8>,
    version: i32,
}

struct Tree {
    nodes: BTreeMap<String, MemNode>,
    session: SessionState,
    closing: bool,
    /// Per-operation script: `Some(rc)` fails the operation, `None` lets it
    /// through. Popped front-first by every operation.
    fail_plan: VecDeque<Option<Rc>>,
}

/// Pause gate: while raised, operations wait before touching the tree.
struct Gate {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    fn set(&self, paused: bool) {
        let _ = self.tx.send(paused);
    }

    async fn wait_open(&self) {
        let mut rx = self.rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// In-process ensemble shared by any number of clients.
pub struct MemEnsemble {
    tree: Mutex<Tree>,
    get_gate: Gate,
    set_gate: Gate,
}

impl MemEnsemble {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(Tree {
                nodes: BTreeMap::new(),
                session: SessionState::Connected,
                closing: false,
                fail_plan: VecDeque::new(),
            }),
            get_gate: Gate::new(),
            set_gate: Gate::new(),
        })
    }

    /// Build a client handle bound to this ensemble under the given quorum
    /// string.
    pub fn client(self: &Arc<Self>, quorum: &str) -> Arc<dyn CoordClient> {
        Arc::new(MemClient {
            ensemble: Arc::clone(self),
            quorum: quorum.to_string(),
        })
    }

    /// Queue a return code to be delivered by the next unscripted operation
    /// instead of executing it.
    pub fn fail_next(&self, rc: Rc) {
        self.tree.lock().unwrap().fail_plan.push_back(Some(rc));
    }

    /// Let the next `n` operations through unchanged. Combined with
    /// `fail_next` this scripts a failure onto a specific upcoming
    /// operation.
    pub fn pass_next(&self, n: usize) {
        let mut tree = self.tree.lock().unwrap();
        for _ in 0..n {
            tree.fail_plan.push_back(None);
        }
    }

    pub fn set_session_state(&self, state: SessionState) {
        self.tree.lock().unwrap().session = state;
    }

    /// After this, every operation reports `Rc::Closing`.
    pub fn close(&self) {
        self.tree.lock().unwrap().closing = true;
    }

    /// While paused, `get_data` calls block before reading the tree.
    pub fn pause_gets(&self, paused: bool) {
        self.get_gate.set(paused);
    }

    /// While paused, `set_data` calls block before touching the tree.
    pub fn pause_sets(&self, paused: bool) {
        self.set_gate.set(paused);
    }

    /// Current value and version of a znode, if present.
    pub fn node(&self, path: &str) -> Option<(Vec<u8>, i32)> {
        self.tree
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|n| (n.value.clone(), n.version))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().unwrap().nodes.contains_key(path)
    }

    /// Every stored path with the given prefix, in order.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.tree
            .lock()
            .unwrap()
            .nodes
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Create a znode and any missing ancestors. Test seeding only; does not
    /// go through the operation checks.
    pub fn seed(&self, path: &str, value: &[u8]) {
        let mut tree = self.tree.lock().unwrap();
        for ancestor in ancestors_of(path) {
            tree.nodes.entry(ancestor).or_insert_with(|| MemNode {
                value: Vec::new(),
                version: 0,
            });
        }
        tree.nodes.insert(
            path.to_string(),
            MemNode {
                value: value.to_vec(),
                version: 0,
            },
        );
    }

    fn entry_check(tree: &mut Tree) -> Result<(), Rc> {
        if tree.closing {
            return Err(Rc::Closing);
        }
        if let Some(Some(rc)) = tree.fail_plan.pop_front() {
            return Err(rc);
        }
        if tree.session != SessionState::Connected {
            return Err(Rc::InvalidState);
        }
        Ok(())
    }
}

/// Every strict ancestor of `path` below the root, shallowest first.
fn ancestors_of(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, ch) in path.char_indices().skip(1) {
        if ch == '/' {
            out.push(path[..idx].to_string());
        }
    }
    out
}

fn valid_path(path: &str) -> bool {
    path.len() > 1 && path.starts_with('/') && !path.ends_with('/') && !path.contains("//")
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn check_create(nodes: &BTreeMap<String, MemNode>, path: &str) -> Rc {
    if !valid_path(path) {
        return Rc::BadArguments;
    }
    if nodes.contains_key(path) {
        return Rc::NodeExists;
    }
    if let Some(parent) = parent_of(path) {
        if !nodes.contains_key(parent) {
            return Rc::NoNode;
        }
    }
    Rc::Ok
}

fn check_version(nodes: &BTreeMap<String, MemNode>, path: &str, version: i32) -> Rc {
    if !valid_path(path) {
        return Rc::BadArguments;
    }
    match nodes.get(path) {
        None => Rc::NoNode,
        Some(node) if version != ANY_VERSION && version != node.version => Rc::BadVersion,
        Some(_) => Rc::Ok,
    }
}

struct MemClient {
    ensemble: Arc<MemEnsemble>,
    quorum: String,
}

#[async_trait]
impl CoordClient for MemClient {
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), Rc> {
        self.ensemble.get_gate.wait_open().await;
        let mut tree = self.ensemble.tree.lock().unwrap();
        MemEnsemble::entry_check(&mut tree)?;
        if !valid_path(path) {
            return Err(Rc::BadArguments);
        }
        match tree.nodes.get(path) {
            None => Err(Rc::NoNode),
            Some(node) => Ok((
                node.value.clone(),
                Stat {
                    version: node.version,
                },
            )),
        }
    }

    async fn set_data(
        &self,
        path: &str,
        value: Vec<u8>,
        expected_version: i32,
    ) -> Result<Stat, Rc> {
        self.ensemble.set_gate.wait_open().await;
        let mut tree = self.ensemble.tree.lock().unwrap();
        MemEnsemble::entry_check(&mut tree)?;
        match check_version(&tree.nodes, path, expected_version) {
            Rc::Ok => {}
            rc => return Err(rc),
        }
        let node = tree.nodes.get_mut(path).unwrap();
        node.value = value;
        node.version += 1;
        Ok(Stat {
            version: node.version,
        })
    }

    async fn multi(&self, ops: Vec<Op>) -> MultiResponse {
        let mut tree = self.ensemble.tree.lock().unwrap();
        if let Err(rc) = MemEnsemble::entry_check(&mut tree) {
            return MultiResponse {
                rc,
                results: Vec::new(),
            };
        }

        // Stage against a copy so a mid-batch failure leaves nothing
        // observable.
        let mut staged = tree.nodes.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut overall = Rc::Ok;
        for op in &ops {
            let rc = match op {
                Op::Create { path, value } => {
                    let rc = check_create(&staged, path);
                    if rc == Rc::Ok {
                        staged.insert(
                            path.clone(),
                            MemNode {
                                value: value.clone(),
                                version: 0,
                            },
                        );
                    }
                    rc
                }
                Op::SetData {
                    path,
                    value,
                    version,
                } => {
                    let rc = check_version(&staged, path, *version);
                    if rc == Rc::Ok {
                        let node = staged.get_mut(path).unwrap();
                        node.value = value.clone();
                        node.version += 1;
                    }
                    rc
                }
                Op::Check { path, version } => check_version(&staged, path, *version),
            };
            if overall == Rc::Ok && rc != Rc::Ok {
                overall = rc;
            }
            results.push(OpResponse { rc });
        }

        if overall == Rc::Ok {
            tree.nodes = staged;
        }
        MultiResponse {
            rc: overall,
            results,
        }
    }

    fn session_state(&self) -> SessionState {
        self.ensemble.tree.lock().unwrap().session
    }

    fn quorum(&self) -> String {
        self.quorum.clone()
    }
}

/// Factory over a shared ensemble. Clients built for different quorum
/// strings observe the same tree, which models a reconfigured ensemble
/// reachable under a new connection string.
pub struct MemEnsembleFactory {
    ensemble: Arc<MemEnsemble>,
}

impl MemEnsembleFactory {
    pub fn new(ensemble: Arc<MemEnsemble>) -> Self {
        Self { ensemble }
    }
}

impl CoordClientFactory for MemEnsembleFactory {
    fn connect(&self, quorum: &str) -> anyhow::Result<Arc<dyn CoordClient>> {
        if quorum.is_empty() {
            anyhow::bail!("empty quorum string");
        }
        Ok(self.ensemble.client(quorum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_conditional_set() {
        let ensemble = MemEnsemble::new();
        let client = ensemble.client("mem:1");

        let resp = client
            .multi(vec![Op::Create {
                path: "/a".into(),
                value: b"v0".to_vec(),
            }])
            .await;
        assert_eq!(resp.rc, Rc::Ok);

        let (value, stat) = client.get_data("/a").await.unwrap();
        assert_eq!(value, b"v0");
        assert_eq!(stat.version, 0);

        let stat = client.set_data("/a", b"v1".to_vec(), 0).await.unwrap();
        assert_eq!(stat.version, 1);

        // Same expected version a second time loses.
        let err = client.set_data("/a", b"v2".to_vec(), 0).await.unwrap_err();
        assert_eq!(err, Rc::BadVersion);
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let ensemble = MemEnsemble::new();
        let client = ensemble.client("mem:1");

        let resp = client
            .multi(vec![Op::Create {
                path: "/a/b".into(),
                value: Vec::new(),
            }])
            .await;
        assert_eq!(resp.rc, Rc::NoNode);
        assert!(!ensemble.exists("/a/b"));
    }

    #[tokio::test]
    async fn multi_is_all_or_nothing() {
        let ensemble = MemEnsemble::new();
        let client = ensemble.client("mem:1");
        ensemble.seed("/a", b"");

        // Second create collides, so the first must not be applied either.
        let resp = client
            .multi(vec![
                Op::Create {
                    path: "/a/b".into(),
                    value: Vec::new(),
                },
                Op::Create {
                    path: "/a".into(),
                    value: Vec::new(),
                },
            ])
            .await;
        assert_eq!(resp.rc, Rc::NodeExists);
        assert_eq!(resp.results[0].rc, Rc::Ok);
        assert_eq!(resp.results[1].rc, Rc::NodeExists);
        assert!(!ensemble.exists("/a/b"));
    }

    #[tokio::test]
    async fn multi_creates_chain_within_batch() {
        let ensemble = MemEnsemble::new();
        let client = ensemble.client("mem:1");
        ensemble.seed("/logs", b"");

        let resp = client
            .multi(vec![
                Op::Create {
                    path: "/logs/7".into(),
                    value: Vec::new(),
                },
                Op::Create {
                    path: "/logs/7/sequencer".into(),
                    value: b"meta".to_vec(),
                },
            ])
            .await;
        assert_eq!(resp.rc, Rc::Ok);
        assert!(ensemble.exists("/logs/7/sequencer"));
    }

    #[tokio::test]
    async fn injected_failures_and_session_state() {
        let ensemble = MemEnsemble::new();
        let client = ensemble.client("mem:1");
        ensemble.seed("/a", b"x");

        ensemble.fail_next(Rc::ConnectionLoss);
        assert_eq!(client.get_data("/a").await.unwrap_err(), Rc::ConnectionLoss);
        assert!(client.get_data("/a").await.is_ok());

        ensemble.set_session_state(SessionState::Expired);
        assert_eq!(client.get_data("/a").await.unwrap_err(), Rc::InvalidState);
        assert_eq!(client.session_state(), SessionState::Expired);
    }
}
