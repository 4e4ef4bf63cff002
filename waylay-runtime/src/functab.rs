//! Function metadata table.
//!
//! The rewriter injects one `register_func` call per instrumented function
//! into `fn main`, so by the time any trap fires the table holds every
//! function's declared names and shape. Entries are immutable once built;
//! the dispatcher only ever looks them up.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Identity and shape of one instrumented function.
#[derive(Debug, Clone, Default)]
pub struct FuncInfo {
    /// Crate-relative module path, e.g. `"demo::walker"`.
    pub pkg_path: String,
    /// Qualified declaration name, e.g. `"walk"` or `"Walker::walk"`.
    pub identity_name: String,
    pub generic: bool,
    /// Code address for non-generic functions when the rewriter could name
    /// one; generic declarations have no single address.
    pub addr: Option<usize>,
    pub has_recv: bool,
    pub recv_name: Option<String>,
    /// Declared parameter names, receiver excluded. `_` stays as `"_"`.
    pub arg_names: Vec<String>,
    pub res_names: Vec<String>,
    /// First parameter is a context-like value; the dispatcher elides it
    /// from the argument view.
    pub first_arg_ctx: bool,
    /// Last result is error-typed; the dispatcher builds the error-aware
    /// result view.
    pub last_result_err: bool,
}

struct Table {
    by_name: HashMap<(String, String), &'static FuncInfo>,
    by_addr: HashMap<usize, &'static FuncInfo>,
}

fn table() -> &'static Mutex<Table> {
    static TABLE: OnceLock<Mutex<Table>> = OnceLock::new();
    TABLE.get_or_init(|| {
        Mutex::new(Table {
            by_name: HashMap::new(),
            by_addr: HashMap::new(),
        })
    })
}

/// Register one function's metadata. Returns the leaked, process-lifetime
/// entry. Re-registering the same (pkg, name) pair replaces the lookup
/// target but never mutates an already-handed-out entry.
pub fn register_func(info: FuncInfo) -> &'static FuncInfo {
    let entry: &'static FuncInfo = Box::leak(Box::new(info));
    let mut t = table().lock().unwrap_or_else(|e| e.into_inner());
    t.by_name.insert(
        (entry.pkg_path.clone(), entry.identity_name.clone()),
        entry,
    );
    if let Some(addr) = entry.addr {
        t.by_addr.insert(addr, entry);
    }
    entry
}

pub fn info_by_name(pkg_path: &str, identity_name: &str) -> Option<&'static FuncInfo> {
    let t = table().lock().unwrap_or_else(|e| e.into_inner());
    t.by_name
        .get(&(pkg_path.to_owned(), identity_name.to_owned()))
        .copied()
}

pub fn info_by_addr(addr: usize) -> Option<&'static FuncInfo> {
    let t = table().lock().unwrap_or_else(|e| e.into_inner());
    t.by_addr.get(&addr).copied()
}

/// Visit every registered function. The visiting order is unspecified.
pub fn for_each_func(mut f: impl FnMut(&'static FuncInfo)) {
    let entries: Vec<&'static FuncInfo> = {
        let t = table().lock().unwrap_or_else(|e| e.into_inner());
        t.by_name.values().copied().collect()
    };
    for entry in entries {
        f(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_by_name() {
        register_func(FuncInfo {
            pkg_path: "functab_test".into(),
            identity_name: "alpha".into(),
            arg_names: vec!["x".into()],
            ..Default::default()
        });

        let info = info_by_name("functab_test", "alpha").expect("registered");
        assert_eq!(info.arg_names, vec!["x".to_string()]);
        assert!(info_by_name("functab_test", "missing").is_none());
    }

    #[test]
    fn lookup_by_addr() {
        register_func(FuncInfo {
            pkg_path: "functab_test".into(),
            identity_name: "beta".into(),
            addr: Some(0xbee5),
            ..Default::default()
        });

        let info = info_by_addr(0xbee5).expect("registered by addr");
        assert_eq!(info.identity_name, "beta");
        assert!(info_by_addr(0xdead_0001).is_none());
    }

    #[test]
    fn for_each_visits_registered_entries() {
        register_func(FuncInfo {
            pkg_path: "functab_test".into(),
            identity_name: "gamma".into(),
            ..Default::default()
        });

        let mut seen = false;
        for_each_func(|info| {
            if info.pkg_path == "functab_test" && info.identity_name == "gamma" {
                seen = true;
            }
        });
        assert!(seen);
    }
}
