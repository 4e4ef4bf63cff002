//! Per-function eligibility classification.
//!
//! Every function declaration gets exactly one action: `Trap` (rewrite the
//! body to dispatch through the runtime), `Link` (rewire a well-known stub
//! to its runtime implementation), or `Skip`. Rules are ordered; the first
//! that fires wins.

use std::collections::HashSet;

/// Well-known stub names in the runtime crate and the `links` function each
/// one forwards to. The set is closed; matching is exact.
pub const LINK_MAP: &[(&str, &str)] = &[
    ("__waylay_link_getcur_task", "task_id"),
    ("__waylay_link_for_each_func", "for_each_func"),
    ("__waylay_link_on_task_exit", "on_task_exit"),
];

/// Functions with this name prefix belong to the interception machinery.
pub const RESERVED_PREFIX: &str = "__waylay";
/// Functions with this name suffix opt out individually.
pub const RESERVED_SKIP_SUFFIX: &str = "_waylay_skip";
/// A file containing this const opts every function out.
pub const FILE_SKIP_CONST: &str = "__WAYLAY_SKIP_TRAP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Rewrite the body to dispatch through the trap runtime.
    Trap,
    /// Replace the body with a forwarding call to `links::<name>`.
    Link(&'static str),
    /// Leave untouched; the str names the rule that fired.
    Skip(&'static str),
}

/// What classification needs to know about one function declaration.
pub struct FnFacts<'a> {
    pub sig: &'a syn::Signature,
    pub attrs: &'a [syn::Attribute],
    /// `None` for trait methods without a default body.
    pub block: Option<&'a syn::Block>,
    pub identity_name: &'a str,
}

/// What classification needs to know about the enclosing file.
pub struct FileFacts {
    /// Module path of the file, e.g. "demo::walker".
    pub pkg_path: String,
    /// The file declares the per-file skip const.
    pub skip_all: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// Building the standard library itself; nothing is instrumented.
    pub std_mode: bool,
    /// Only wire link stubs: no function is trapped.
    pub link_only: bool,
    /// Trapping disabled process-wide; link stubs are still wired.
    pub trap_disabled: bool,
    /// Compatibility gate: leave generic declarations untouched.
    pub generic_workaround: bool,
}

pub fn classify(facts: &FnFacts<'_>, file: &FileFacts, flags: &Flags) -> Action {
    let Some(block) = facts.block else {
        return Action::Skip("no body");
    };

    // Initializer machinery runs before the runtime is ready.
    if has_attr(facts.attrs, "ctor") || has_attr(facts.attrs, "dtor") {
        return Action::Skip("initializer");
    }

    let bare = facts
        .identity_name
        .rsplit("::")
        .next()
        .unwrap_or(facts.identity_name);

    if is_runtime_pkg(&file.pkg_path) {
        for (stub, target) in LINK_MAP {
            if bare == *stub {
                return Action::Link(target);
            }
        }
    }

    // Link wiring above stays active in both modes; trapping does not.
    if flags.link_only {
        return Action::Skip("link-only mode");
    }
    if flags.trap_disabled {
        return Action::Skip("trap disabled");
    }

    if bare.starts_with(RESERVED_PREFIX) || bare.ends_with(RESERVED_SKIP_SUFFIX) {
        return Action::Skip("reserved name");
    }

    if file.skip_all {
        return Action::Skip("file opts out");
    }

    if flags.std_mode {
        return Action::Skip("std build");
    }

    // The interception machinery never traps itself, except its test
    // helper modules.
    if is_own_pkg(&file.pkg_path) && !file.pkg_path.contains("::test") {
        return Action::Skip("own package");
    }

    if first_stmt_is_skip_marker(block) {
        return Action::Skip("explicit skip marker");
    }

    // ABI and stack-shape contracts the wrapper would violate.
    if has_attr(facts.attrs, "naked") {
        return Action::Skip("naked");
    }
    if facts.sig.constness.is_some() {
        return Action::Skip("const fn");
    }
    if facts.sig.abi.is_some() {
        return Action::Skip("extern abi");
    }

    // The stop path must be able to produce the return value through a
    // type-erased slot.
    if !return_is_viewable(&facts.sig.output, &facts.sig.generics) {
        return Action::Skip("unviewable return");
    }

    let generic = facts
        .sig
        .generics
        .params
        .iter()
        .any(|p| !matches!(p, syn::GenericParam::Lifetime(_)));
    if generic && flags.generic_workaround {
        return Action::Skip("generic workaround");
    }

    Action::Trap
}

fn is_runtime_pkg(pkg_path: &str) -> bool {
    pkg_path == "waylay_runtime" || pkg_path.starts_with("waylay_runtime::")
}

fn is_own_pkg(pkg_path: &str) -> bool {
    let root = pkg_path.split("::").next().unwrap_or(pkg_path);
    root == "waylay" || root == "waylay_runtime"
}

/// Matches `#[name]`, `#[name::...]`, and `#[unsafe(name)]`.
fn has_attr(attrs: &[syn::Attribute], name: &str) -> bool {
    attrs.iter().any(|attr| {
        let path = attr.path();
        if path.segments.first().is_some_and(|s| s.ident == name) {
            return true;
        }
        if path.is_ident("unsafe") {
            if let Ok(inner) = attr.parse_args::<syn::Path>() {
                return inner.is_ident(name);
            }
        }
        false
    })
}

/// First statement is a bare `waylay_runtime::skip();` call.
fn first_stmt_is_skip_marker(block: &syn::Block) -> bool {
    let Some(stmt) = block.stmts.first() else {
        return false;
    };
    let expr = match stmt {
        syn::Stmt::Expr(expr, _) => expr,
        _ => return false,
    };
    let syn::Expr::Call(call) = expr else {
        return false;
    };
    let syn::Expr::Path(path) = &*call.func else {
        return false;
    };
    let segs: Vec<String> = path
        .path
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect();
    matches!(segs.last().map(String::as_str), Some("skip"))
        && segs
            .first()
            .is_some_and(|s| s == "waylay_runtime" || s == "crate")
}

fn return_is_viewable(output: &syn::ReturnType, generics: &syn::Generics) -> bool {
    match output {
        syn::ReturnType::Default => true,
        syn::ReturnType::Type(_, ty) => {
            if crate::resolve::is_unit_type(ty) {
                return true;
            }
            if let Some((value, _err)) = crate::resolve::result_value_and_err(ty) {
                // The error travels as a boxed trait object; only the value
                // needs a concrete slot.
                return crate::resolve::is_unit_type(value) || type_is_erasable(value, generics);
            }
            type_is_erasable(ty, generics)
        }
    }
}

/// Whether a value of this type can live in a `'static` type-erased slot:
/// no references, no raw pointers, no trait objects, no impl types, and no
/// type parameters of the enclosing function.
pub(crate) fn type_is_erasable(ty: &syn::Type, generics: &syn::Generics) -> bool {
    let params: HashSet<String> = generics
        .params
        .iter()
        .filter_map(|p| match p {
            syn::GenericParam::Type(t) => Some(t.ident.to_string()),
            _ => None,
        })
        .collect();
    erasable_inner(ty, &params)
}

fn erasable_inner(ty: &syn::Type, params: &HashSet<String>) -> bool {
    match ty {
        syn::Type::Path(tp) => {
            if tp.qself.is_some() {
                return false;
            }
            if tp.path.segments.len() == 1 {
                let ident = tp.path.segments[0].ident.to_string();
                if params.contains(&ident) {
                    return false;
                }
            }
            tp.path.segments.iter().all(|seg| match &seg.arguments {
                syn::PathArguments::None => true,
                syn::PathArguments::AngleBracketed(args) => {
                    args.args.iter().all(|arg| match arg {
                        syn::GenericArgument::Type(t) => erasable_inner(t, params),
                        syn::GenericArgument::Lifetime(lt) => lt.ident == "static",
                        syn::GenericArgument::Const(_) => true,
                        _ => false,
                    })
                }
                syn::PathArguments::Parenthesized(_) => false,
            })
        }
        syn::Type::Tuple(t) => t.elems.iter().all(|e| erasable_inner(e, params)),
        syn::Type::Array(a) => erasable_inner(&a.elem, params),
        syn::Type::Paren(p) => erasable_inner(&p.elem, params),
        syn::Type::Group(g) => erasable_inner(&g.elem, params),
        _ => false,
    }
}
