//! Call-stack recorder.
//!
//! A reference interceptor that assembles a tree of intercepted calls per
//! task: Pre pushes a frame under the current top, Post closes it with a
//! relative end time and any error text. When the outermost frame closes,
//! the finished tree is exported and the task's state is dropped.
//!
//! Export destination comes from `WAYLAY_TRACE_OUTPUT`: `"off"` disables
//! recording entirely, `"stdout"` prints `{task}: {payload}` lines, any
//! other value is a directory to write files beneath, and unset picks a
//! generated `trace_<timestamp>` directory. [`set_trace_output`] overrides
//! the environment for the current process.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::interceptor::{self, Call, Data, InterceptError, Interceptor};
use crate::links;
use crate::object::TrapError;
use crate::trap;

/// One call in an exported trace. `begin_ns`/`end_ns` are relative to the
/// start of the outermost call of the tree.
#[derive(Debug, Clone)]
pub struct TraceNode {
    pub name: String,
    pub pkg: String,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub error: Option<String>,
    pub children: Vec<TraceNode>,
}

pub type TraceEncoder = dyn Fn(&TraceNode) -> Result<Vec<u8>, TrapError> + Send + Sync;

struct NodeRec {
    name: String,
    pkg: String,
    begin_ns: u64,
    end_ns: u64,
    error: Option<String>,
    children: Vec<usize>,
}

/// Per-task recording state. Nodes live in an arena; `open` is the path
/// of indices from the outermost frame to the current top.
struct RootState {
    begin: Instant,
    nodes: Vec<NodeRec>,
    open: Vec<usize>,
}

fn roots() -> &'static Mutex<HashMap<u64, RootState>> {
    static ROOTS: OnceLock<Mutex<HashMap<u64, RootState>>> = OnceLock::new();
    ROOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn encoder_slot() -> &'static Mutex<Option<Arc<TraceEncoder>>> {
    static ENCODER: OnceLock<Mutex<Option<Arc<TraceEncoder>>>> = OnceLock::new();
    ENCODER.get_or_init(|| Mutex::new(None))
}

fn output_override() -> &'static Mutex<Option<PathBuf>> {
    static OVERRIDE: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();
    OVERRIDE.get_or_init(|| Mutex::new(None))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Replace the default JSON serializer for exported trees.
pub fn set_trace_encoder(
    encode: impl Fn(&TraceNode) -> Result<Vec<u8>, TrapError> + Send + Sync + 'static,
) {
    *lock(encoder_slot()) = Some(Arc::new(encode));
}

/// Direct trace files to `dir`, overriding `WAYLAY_TRACE_OUTPUT`.
pub fn set_trace_output(dir: impl Into<PathBuf>) {
    *lock(output_override()) = Some(dir.into());
}

/// Register the recorder interceptor. Safe to call more than once; only
/// the first call takes effect. Respects `WAYLAY_TRACE_OUTPUT=off`.
pub fn enable_trace() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if std::env::var("WAYLAY_TRACE_OUTPUT").as_deref() == Ok("off") {
            return;
        }
        interceptor::register(Arc::new(Recorder));
    });
}

struct Recorder;

thread_local! {
    static CLEANUP_REGISTERED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

impl Interceptor for Recorder {
    fn pre(&self, call: &mut Call<'_>) -> Result<Option<Data>, InterceptError> {
        trap::skip();
        let id = links::task_id();
        if !CLEANUP_REGISTERED.with(|c| c.replace(true)) {
            // Drop a root left open by a thread that died mid-call.
            links::on_task_exit(|exited| {
                lock(roots()).remove(&exited);
            });
        }

        let mut roots = lock(roots());
        let root = roots.entry(id).or_insert_with(|| RootState {
            begin: Instant::now(),
            nodes: Vec::new(),
            open: Vec::new(),
        });
        let depth = root.open.len();
        let idx = root.nodes.len();
        let begin_ns = root.begin.elapsed().as_nanos() as u64;
        root.nodes.push(NodeRec {
            name: call.info.identity_name.clone(),
            pkg: call.info.pkg_path.clone(),
            begin_ns,
            end_ns: 0,
            error: None,
            children: Vec::new(),
        });
        if let Some(&parent) = root.open.last() {
            root.nodes[parent].children.push(idx);
        }
        root.open.push(idx);

        if depth == 0 {
            Ok(None)
        } else {
            Ok(Some(Box::new(depth)))
        }
    }

    fn post(&self, call: &mut Call<'_>, data: Option<Data>) -> Result<(), InterceptError> {
        trap::skip();
        let id = links::task_id();
        let finished = {
            let mut roots = lock(roots());
            let root = match roots.get_mut(&id) {
                Some(root) => root,
                None => panic!("trace: unbalanced stack, no open root for task {id}"),
            };
            let cur = match root.open.last().copied() {
                Some(cur) => cur,
                None => panic!("trace: unbalanced stack, close with empty stack"),
            };
            root.nodes[cur].end_ns = root.begin.elapsed().as_nanos() as u64;
            root.nodes[cur].error = call.results.err_text();

            match data {
                Some(d) => {
                    let depth = match d.downcast::<usize>() {
                        Ok(depth) => *depth,
                        Err(_) => panic!("trace: unbalanced stack, foreign frame data"),
                    };
                    root.open.truncate(depth);
                    None
                }
                // Outermost frame closed: take the tree out for export.
                None => roots.remove(&id),
            }
        };
        if let Some(state) = finished {
            export(id, build_tree(&state.nodes, 0));
        }
        Ok(())
    }
}

fn build_tree(nodes: &[NodeRec], idx: usize) -> TraceNode {
    let rec = &nodes[idx];
    TraceNode {
        name: rec.name.clone(),
        pkg: rec.pkg.clone(),
        begin_ns: rec.begin_ns,
        end_ns: rec.end_ns,
        error: rec.error.clone(),
        children: rec.children.iter().map(|&c| build_tree(nodes, c)).collect(),
    }
}

enum Dest {
    Off,
    Stdout,
    Dir(PathBuf),
}

fn destination() -> Dest {
    if let Some(dir) = lock(output_override()).clone() {
        return Dest::Dir(dir);
    }
    match std::env::var("WAYLAY_TRACE_OUTPUT") {
        Ok(v) if v == "off" => Dest::Off,
        Ok(v) if v == "stdout" => Dest::Stdout,
        Ok(v) if !v.is_empty() => Dest::Dir(PathBuf::from(v)),
        _ => Dest::Dir(default_dir().clone()),
    }
}

fn default_dir() -> &'static PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        PathBuf::from(format!("trace_{stamp}"))
    })
}

/// Relative path for one exported tree. Test harnesses name their worker
/// threads after the test, so a named non-main thread maps to a flat
/// per-test file; anything else gets a per-task directory with a process
/// sequence number.
fn sub_path(task: u64) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    match std::thread::current().name() {
        Some(name) if !name.is_empty() && name != "main" => {
            PathBuf::from(format!("{}.json", name.replace("::", "_")))
        }
        _ => {
            let seq = SEQ.fetch_add(1, Ordering::Relaxed);
            PathBuf::from(format!("g_{task}")).join(format!("t_{seq}.json"))
        }
    }
}

fn encode(tree: &TraceNode) -> Vec<u8> {
    let custom = lock(encoder_slot()).clone();
    let encoded = match custom {
        Some(encoder) => encoder(tree),
        None => Ok(encode_json(tree).into_bytes()),
    };
    match encoded {
        Ok(payload) => payload,
        Err(err) => format!("error:{err}").into_bytes(),
    }
}

fn export(task: u64, tree: TraceNode) {
    let payload = encode(&tree);
    match destination() {
        Dest::Off => {}
        Dest::Stdout => {
            println!("{task}: {}", String::from_utf8_lossy(&payload));
        }
        Dest::Dir(dir) => write_file(&dir.join(sub_path(task)), &payload),
    }
}

fn write_file(path: &Path, payload: &[u8]) {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("waylay: failed to create trace dir {}: {err}", parent.display());
            return;
        }
    }
    if let Err(err) = std::fs::write(path, payload) {
        eprintln!("waylay: failed to write trace file {}: {err}", path.display());
    }
}

fn encode_json(node: &TraceNode) -> String {
    let mut out = String::new();
    write_node(&mut out, node);
    out
}

fn write_node(out: &mut String, node: &TraceNode) {
    let _ = write!(
        out,
        "{{\"name\":\"{}\",\"pkg\":\"{}\",\"begin_ns\":{},\"end_ns\":{}",
        escape_json(&node.name),
        escape_json(&node.pkg),
        node.begin_ns,
        node.end_ns,
    );
    if let Some(error) = &node.error {
        let _ = write!(out, ",\"error\":\"{}\"", escape_json(error));
    }
    out.push_str(",\"children\":[");
    for (i, child) in node.children.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_node(out, child);
    }
    out.push_str("]}");
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, begin: u64, end: u64) -> TraceNode {
        TraceNode {
            name: name.into(),
            pkg: "app".into(),
            begin_ns: begin,
            end_ns: end,
            error: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn json_nests_children_in_call_order() {
        let mut root = leaf("outer", 0, 900);
        root.children.push(leaf("first", 10, 400));
        root.children.push(leaf("second", 450, 880));
        let json = encode_json(&root);
        assert_eq!(
            json,
            "{\"name\":\"outer\",\"pkg\":\"app\",\"begin_ns\":0,\"end_ns\":900,\"children\":[\
             {\"name\":\"first\",\"pkg\":\"app\",\"begin_ns\":10,\"end_ns\":400,\"children\":[]},\
             {\"name\":\"second\",\"pkg\":\"app\",\"begin_ns\":450,\"end_ns\":880,\"children\":[]}]}"
        );
    }

    #[test]
    fn json_escapes_error_text() {
        let mut node = leaf("f", 0, 1);
        node.error = Some("bad \"input\"\nline".into());
        let json = encode_json(&node);
        assert!(json.contains("\"error\":\"bad \\\"input\\\"\\nline\""));
    }

    #[test]
    fn tree_rebuild_preserves_arena_shape() {
        let nodes = vec![
            NodeRec {
                name: "root".into(),
                pkg: "app".into(),
                begin_ns: 0,
                end_ns: 100,
                error: None,
                children: vec![1, 2],
            },
            NodeRec {
                name: "a".into(),
                pkg: "app".into(),
                begin_ns: 5,
                end_ns: 40,
                error: None,
                children: vec![],
            },
            NodeRec {
                name: "b".into(),
                pkg: "app".into(),
                begin_ns: 50,
                end_ns: 90,
                error: Some("boom".into()),
                children: vec![],
            },
        ];
        let tree = build_tree(&nodes, 0);
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].name, "a");
        assert_eq!(tree.children[1].error.as_deref(), Some("boom"));
    }
}
