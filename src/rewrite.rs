//! Body rewriting.
//!
//! For every function the classifier marks `Trap`, the body is replaced
//! with the dispatch wrapper: rebind viewable parameters, declare result
//! locals, call `trap_entry`, run the original body inside an
//! immediately-invoked closure (an awaited async block for async fns),
//! and deliver `trap_exit`. Signatures are never altered, so call sites
//! and trait impls are unaffected.
//!
//! `Link`-classified stubs get their bodies replaced with a forwarding
//! call into `waylay_runtime::links`. Files where nothing changes are
//! passed through byte-for-byte.

use std::collections::HashSet;

use proc_macro2::Span;
use syn::parse_quote;
use syn::visit_mut::VisitMut;

use crate::classify::{classify, type_is_erasable, Action, FileFacts, Flags, FnFacts, FILE_SKIP_CONST};
use crate::resolve::{
    fn_meta_from_sig, is_unit_type, result_value_and_err, type_name_from_type, FnMeta,
};

/// Result of instrumenting a source file.
pub struct InstrumentResult {
    pub source: String,
    /// Functions whose bodies now dispatch through the runtime.
    pub rewritten: Vec<FnMeta>,
    /// Stubs rewired to their runtime implementation.
    pub linked: Vec<(String, &'static str)>,
    /// Functions matched by the targets but left alone, with the rule
    /// that fired.
    pub skipped: Vec<(String, &'static str)>,
}

/// Rewrite `source` so that every Trap-classified function whose name (or
/// qualified name) is in `targets` dispatches through the runtime. An
/// empty target set means every function.
///
/// Top-level functions match by bare name (e.g. "walk"), impl methods by
/// "Type::method", trait default methods by "Trait::method".
pub fn instrument_source(
    source: &str,
    targets: &HashSet<String>,
    pkg_path: &str,
    flags: &Flags,
) -> Result<InstrumentResult, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    let mut instrumenter = Instrumenter {
        targets: targets.clone(),
        file_facts: FileFacts {
            pkg_path: pkg_path.to_string(),
            skip_all: has_file_skip_const(&file),
        },
        flags: *flags,
        apply: true,
        current_impl: None,
        current_trait: None,
        rewritten: Vec::new(),
        linked: Vec::new(),
        skipped: Vec::new(),
        actions: Vec::new(),
    };
    instrumenter.visit_file_mut(&mut file);

    // Untouched files keep their exact original text.
    let source = if instrumenter.rewritten.is_empty() && instrumenter.linked.is_empty() {
        source.to_string()
    } else {
        prettyplease::unparse(&file)
    };
    Ok(InstrumentResult {
        source,
        rewritten: instrumenter.rewritten,
        linked: instrumenter.linked,
        skipped: instrumenter.skipped,
    })
}

/// Classify every function in `source` without rewriting anything.
/// Used by `waylay list`.
pub fn classify_source(
    source: &str,
    pkg_path: &str,
    flags: &Flags,
) -> Result<Vec<(String, Action)>, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    let mut instrumenter = Instrumenter {
        targets: HashSet::new(),
        file_facts: FileFacts {
            pkg_path: pkg_path.to_string(),
            skip_all: has_file_skip_const(&file),
        },
        flags: *flags,
        apply: false,
        current_impl: None,
        current_trait: None,
        rewritten: Vec::new(),
        linked: Vec::new(),
        skipped: Vec::new(),
        actions: Vec::new(),
    };
    instrumenter.visit_file_mut(&mut file);
    Ok(instrumenter.actions)
}

/// The per-file opt-out: a top-level `const __WAYLAY_SKIP_TRAP: bool = true;`.
fn has_file_skip_const(file: &syn::File) -> bool {
    file.items.iter().any(|item| {
        matches!(item, syn::Item::Const(c) if c.ident == FILE_SKIP_CONST)
    })
}

struct Instrumenter {
    targets: HashSet<String>,
    file_facts: FileFacts,
    flags: Flags,
    /// False for classification-only walks.
    apply: bool,
    current_impl: Option<String>,
    current_trait: Option<String>,
    rewritten: Vec<FnMeta>,
    linked: Vec<(String, &'static str)>,
    skipped: Vec<(String, &'static str)>,
    actions: Vec<(String, Action)>,
}

impl Instrumenter {
    fn targeted(&self, identity: &str) -> bool {
        self.targets.is_empty() || self.targets.contains(identity)
    }

    fn process(
        &mut self,
        sig: &syn::Signature,
        attrs: &[syn::Attribute],
        block: Option<&mut syn::Block>,
        identity: String,
    ) {
        let facts = FnFacts {
            sig,
            attrs,
            block: block.as_deref(),
            identity_name: &identity,
        };
        let action = classify(&facts, &self.file_facts, &self.flags);
        if !self.apply {
            self.actions.push((identity, action));
            return;
        }
        if !self.targeted(&identity) {
            return;
        }
        match action {
            Action::Trap => {
                let block = match block {
                    Some(block) => block,
                    None => return,
                };
                let meta = fn_meta_from_sig(sig, identity);
                rewrite_body(sig, block, &self.file_facts.pkg_path, &meta);
                self.rewritten.push(meta);
            }
            Action::Link(target) => {
                if let Some(block) = block {
                    replace_with_link(sig, block, target);
                    self.linked.push((identity, target));
                }
            }
            Action::Skip(reason) => self.skipped.push((identity, reason)),
        }
    }
}

impl VisitMut for Instrumenter {
    fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
        let identity = node.sig.ident.to_string();
        // Split borrows: clone the signature so the block can be rewritten.
        let sig = node.sig.clone();
        self.process(&sig, &node.attrs, Some(&mut node.block), identity);
        syn::visit_mut::visit_item_fn_mut(self, node);
    }

    fn visit_item_impl_mut(&mut self, node: &mut syn::ItemImpl) {
        let type_name = type_name_from_type(&node.self_ty);
        let prev = self.current_impl.replace(type_name);
        syn::visit_mut::visit_item_impl_mut(self, node);
        self.current_impl = prev;
    }

    fn visit_impl_item_fn_mut(&mut self, node: &mut syn::ImplItemFn) {
        let method = node.sig.ident.to_string();
        let identity = match &self.current_impl {
            Some(impl_name) => format!("{impl_name}::{method}"),
            None => method,
        };
        let sig = node.sig.clone();
        self.process(&sig, &node.attrs, Some(&mut node.block), identity);
        syn::visit_mut::visit_impl_item_fn_mut(self, node);
    }

    fn visit_item_trait_mut(&mut self, node: &mut syn::ItemTrait) {
        let trait_name = node.ident.to_string();
        let prev = self.current_trait.replace(trait_name);
        syn::visit_mut::visit_item_trait_mut(self, node);
        self.current_trait = prev;
    }

    fn visit_trait_item_fn_mut(&mut self, node: &mut syn::TraitItemFn) {
        let method = node.sig.ident.to_string();
        let identity = match &self.current_trait {
            Some(trait_name) => format!("{trait_name}::{method}"),
            None => method,
        };
        let sig = node.sig.clone();
        self.process(&sig, &node.attrs, node.default.as_mut(), identity);
        syn::visit_mut::visit_trait_item_fn_mut(self, node);
    }
}

/// How the wrapper stores and returns the function's output.
enum RetKind {
    Unit,
    Plain(Box<syn::Type>),
    /// `Result<T, E>`: the value half gets a slot, the error half travels
    /// as a boxed trait object.
    Fallible(Box<syn::Type>),
}

fn ret_kind(sig: &syn::Signature) -> RetKind {
    match &sig.output {
        syn::ReturnType::Default => RetKind::Unit,
        syn::ReturnType::Type(_, ty) => {
            if is_unit_type(ty) {
                RetKind::Unit
            } else if let Some((value, _err)) = result_value_and_err(ty) {
                RetKind::Fallible(Box::new(value.clone()))
            } else {
                RetKind::Plain(Box::new(ty.as_ref().clone()))
            }
        }
    }
}

/// One parameter's slot plan: its display name, and the binding ident when
/// the value can actually be viewed.
struct SlotPlan {
    name: String,
    viewable: Option<syn::Ident>,
}

fn arg_slot_plans(sig: &syn::Signature) -> Vec<SlotPlan> {
    sig.inputs
        .iter()
        .filter_map(|arg| match arg {
            syn::FnArg::Receiver(_) => None,
            syn::FnArg::Typed(pat_ty) => {
                let viewable = match &*pat_ty.pat {
                    syn::Pat::Ident(p)
                        if p.by_ref.is_none()
                            && p.subpat.is_none()
                            && type_is_erasable(&pat_ty.ty, &sig.generics) =>
                    {
                        Some(p.ident.clone())
                    }
                    _ => None,
                };
                let name = match &*pat_ty.pat {
                    syn::Pat::Ident(p) => p.ident.to_string(),
                    _ => "_".to_string(),
                };
                Some(SlotPlan { name, viewable })
            }
        })
        .collect()
}

/// The receiver slot: only `&mut self` can be handed out as a mutable
/// view; everything else becomes an absent named field.
fn recv_slot(sig: &syn::Signature) -> syn::Expr {
    match sig.receiver() {
        None => parse_quote! { waylay_runtime::Slot::absent() },
        Some(recv) if recv.reference.is_some() && recv.mutability.is_some() => {
            parse_quote! { waylay_runtime::Slot::named("self", self) }
        }
        Some(_) => parse_quote! { waylay_runtime::Slot::absent_named("self") },
    }
}

fn entry_arg_slots(plans: &[SlotPlan]) -> Vec<syn::Expr> {
    plans
        .iter()
        .map(|plan| {
            let name = &plan.name;
            match &plan.viewable {
                Some(ident) => parse_quote! { waylay_runtime::Slot::named(#name, &mut #ident) },
                None => parse_quote! { waylay_runtime::Slot::absent_named(#name) },
            }
        })
        .collect()
}

/// At exit the arguments may have moved into the body, so the views are
/// name-only.
fn exit_arg_slots(plans: &[SlotPlan]) -> Vec<syn::Expr> {
    plans
        .iter()
        .map(|plan| {
            let name = &plan.name;
            parse_quote! { waylay_runtime::Slot::absent_named(#name) }
        })
        .collect()
}

fn result_slots(kind: &RetKind) -> Vec<syn::Expr> {
    match kind {
        RetKind::Unit => vec![],
        RetKind::Plain(_) => {
            vec![parse_quote! { waylay_runtime::Slot::named("value", &mut __waylay_ret) }]
        }
        RetKind::Fallible(_) => vec![
            parse_quote! { waylay_runtime::Slot::named("value", &mut __waylay_ret) },
            parse_quote! { waylay_runtime::Slot::named("err", &mut __waylay_err) },
        ],
    }
}

fn slot_array_stmt(ident: &str, slots: Vec<syn::Expr>) -> syn::Stmt {
    let ident = syn::Ident::new(ident, Span::call_site());
    let len = slots.len();
    parse_quote! {
        let mut #ident: [waylay_runtime::Slot; #len] = [#(#slots),*];
    }
}

/// The `if stop { return ... }` arm of the wrapper.
fn stop_stmts(kind: &RetKind, identity: &str) -> Vec<syn::Stmt> {
    match kind {
        RetKind::Unit => vec![parse_quote! { return; }],
        RetKind::Plain(_) => vec![parse_quote! {
            return match __waylay_ret {
                Some(__waylay_v) => __waylay_v,
                None => panic!("interceptor stopped {} without providing a result", #identity),
            };
        }],
        RetKind::Fallible(_) => vec![
            parse_quote! {
                if let Some(__waylay_e) = __waylay_err {
                    return Err(__waylay_e.into());
                }
            },
            parse_quote! {
                return match __waylay_ret {
                    Some(__waylay_v) => Ok(__waylay_v),
                    None => panic!("interceptor stopped {} without providing a result", #identity),
                };
            },
        ],
    }
}

/// Replace the body with the full dispatch wrapper.
fn rewrite_body(sig: &syn::Signature, block: &mut syn::Block, pkg_path: &str, meta: &FnMeta) {
    let kind = ret_kind(sig);
    let plans = arg_slot_plans(sig);
    let identity = meta.identity_name.as_str();
    let generic = meta.generic;
    let is_async = sig.asyncness.is_some();

    let orig_block = syn::Block {
        brace_token: block.brace_token,
        stmts: std::mem::take(&mut block.stmts),
    };

    let mut stmts: Vec<syn::Stmt> = Vec::new();

    // Rebind viewable parameters so slots can borrow them mutably.
    for plan in &plans {
        if let Some(ident) = &plan.viewable {
            stmts.push(parse_quote! { let mut #ident = #ident; });
        }
    }

    match &kind {
        RetKind::Unit => {}
        RetKind::Plain(ty) => {
            stmts.push(parse_quote! { let mut __waylay_ret: Option<#ty> = None; });
        }
        RetKind::Fallible(value_ty) => {
            stmts.push(parse_quote! { let mut __waylay_ret: Option<#value_ty> = None; });
            stmts.push(
                parse_quote! { let mut __waylay_err: Option<waylay_runtime::TrapError> = None; },
            );
        }
    }

    // Entry: slots live only for the span of the call, releasing the
    // parameter borrows before the body runs.
    let recv = recv_slot(sig);
    let entry_args = slot_array_stmt("__waylay_args", entry_arg_slots(&plans));
    let entry_results = slot_array_stmt("__waylay_results", result_slots(&kind));
    let stop = stop_stmts(&kind, identity);
    // The guard delivers the Post chain even when the body panics or an
    // async body is dropped mid-flight.
    stmts.push(parse_quote! {
        let mut __waylay_after = waylay_runtime::AfterGuard::new({
            #entry_args
            #entry_results
            let (__waylay_after, __waylay_stop) = waylay_runtime::trap_entry(
                #pkg_path,
                #identity,
                #generic,
                None,
                #recv,
                &mut __waylay_args,
                &mut __waylay_results,
            );
            if __waylay_stop {
                #(#stop)*
            }
            __waylay_after
        });
    });

    // Original body. The closure (or awaited async block) keeps early
    // `return` statements scoped to the body.
    match &kind {
        RetKind::Unit => {
            if is_async {
                stmts.push(parse_quote! { (async #orig_block).await; });
            } else {
                stmts.push(parse_quote! { (|| #orig_block)(); });
            }
        }
        RetKind::Plain(_) => {
            if is_async {
                stmts.push(parse_quote! { __waylay_ret = Some((async #orig_block).await); });
            } else {
                stmts.push(parse_quote! { __waylay_ret = Some((|| #orig_block)()); });
            }
        }
        RetKind::Fallible(_) => {
            let outcome: syn::Expr = if is_async {
                parse_quote! { (async #orig_block).await }
            } else {
                parse_quote! { (|| #orig_block)() }
            };
            stmts.push(parse_quote! {
                match #outcome {
                    Ok(__waylay_v) => __waylay_ret = Some(__waylay_v),
                    Err(__waylay_e) => __waylay_err = Some(__waylay_e.into()),
                }
            });
        }
    }

    // Exit: rebuilt result slots; argument and receiver views are
    // name-only because ownership may have moved into the body.
    let exit_args = slot_array_stmt("__waylay_args", exit_arg_slots(&plans));
    let exit_results = slot_array_stmt("__waylay_results", result_slots(&kind));
    let exit_recv: syn::Expr = if sig.receiver().is_some() {
        parse_quote! { waylay_runtime::Slot::absent_named("self") }
    } else {
        parse_quote! { waylay_runtime::Slot::absent() }
    };
    stmts.push(parse_quote! {
        if let Some(__waylay_hook) = __waylay_after.take() {
            #exit_args
            #exit_results
            waylay_runtime::trap_exit(
                __waylay_hook,
                #exit_recv,
                &mut __waylay_args,
                &mut __waylay_results,
            );
        }
    });

    match &kind {
        RetKind::Unit => {}
        RetKind::Plain(_) => {
            stmts.push(syn::Stmt::Expr(
                parse_quote! {
                    match __waylay_ret {
                        Some(__waylay_v) => __waylay_v,
                        None => panic!("interceptor stopped {} without providing a result", #identity),
                    }
                },
                None,
            ));
        }
        RetKind::Fallible(_) => {
            stmts.push(parse_quote! {
                if let Some(__waylay_e) = __waylay_err {
                    return Err(__waylay_e.into());
                }
            });
            stmts.push(syn::Stmt::Expr(
                parse_quote! {
                    match __waylay_ret {
                        Some(__waylay_v) => Ok(__waylay_v),
                        None => panic!("interceptor stopped {} without providing a result", #identity),
                    }
                },
                None,
            ));
        }
    }

    block.stmts = stmts;
}

/// Replace a link stub's body with a positional forwarding call into the
/// runtime's `links` module.
fn replace_with_link(sig: &syn::Signature, block: &mut syn::Block, target: &str) {
    let target = syn::Ident::new(target, Span::call_site());
    let args: Vec<syn::Expr> = sig
        .inputs
        .iter()
        .filter_map(|arg| match arg {
            syn::FnArg::Typed(pat_ty) => match &*pat_ty.pat {
                syn::Pat::Ident(p) => {
                    let ident = &p.ident;
                    Some(parse_quote! { #ident })
                }
                _ => None,
            },
            syn::FnArg::Receiver(_) => None,
        })
        .collect();
    let forward: syn::Block = parse_quote! {
        { waylay_runtime::links::#target(#(#args),*) }
    };
    *block = forward;
}

/// Inject `waylay_runtime::register_func(..)` calls at the top of `fn main`
/// for every rewritten function, so interceptors can resolve calls even in
/// code paths that never ran.
pub fn inject_registrations(
    source: &str,
    entries: &[(String, FnMeta)],
) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    let mut injector = RegistrationInjector { entries };
    injector.visit_file_mut(&mut file);
    Ok(prettyplease::unparse(&file))
}

struct RegistrationInjector<'a> {
    /// (pkg_path, meta) per rewritten function.
    entries: &'a [(String, FnMeta)],
}

fn registration_stmt(pkg_path: &str, meta: &FnMeta) -> syn::Stmt {
    let identity = &meta.identity_name;
    let generic = meta.generic;
    let has_recv = meta.has_recv;
    let first_arg_ctx = meta.first_arg_ctx;
    let last_result_err = meta.last_result_err;
    let recv_name: syn::Expr = match &meta.recv_name {
        Some(name) => parse_quote! { Some(#name.to_string()) },
        None => parse_quote! { None },
    };
    let arg_names = meta.arg_names.iter();
    let res_names = meta.res_names.iter();
    parse_quote! {
        waylay_runtime::register_func(waylay_runtime::FuncInfo {
            pkg_path: #pkg_path.to_string(),
            identity_name: #identity.to_string(),
            generic: #generic,
            addr: None,
            has_recv: #has_recv,
            recv_name: #recv_name,
            arg_names: vec![#(#arg_names.to_string()),*],
            res_names: vec![#(#res_names.to_string()),*],
            first_arg_ctx: #first_arg_ctx,
            last_result_err: #last_result_err,
        });
    }
}

impl VisitMut for RegistrationInjector<'_> {
    fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
        if node.sig.ident == "main" {
            for (pkg_path, meta) in self.entries.iter().rev() {
                node.block.stmts.insert(0, registration_stmt(pkg_path, meta));
            }
        }
        syn::visit_mut::visit_item_fn_mut(self, node);
    }
}

/// Inject `waylay_runtime::enable_trace();` as the first statement of
/// `fn main`, ahead of the registrations.
pub fn inject_trace_enable(source: &str) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    struct TraceInjector;
    impl VisitMut for TraceInjector {
        fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
            if node.sig.ident == "main" {
                let stmt: syn::Stmt = parse_quote! {
                    waylay_runtime::enable_trace();
                };
                node.block.stmts.insert(0, stmt);
            }
            syn::visit_mut::visit_item_fn_mut(self, node);
        }
    }
    TraceInjector.visit_file_mut(&mut file);
    Ok(prettyplease::unparse(&file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument_all(source: &str) -> InstrumentResult {
        instrument_source(source, &HashSet::new(), "demo", &Flags::default()).unwrap()
    }

    #[test]
    fn traps_targeted_function_only() {
        let source = r#"
fn walk(n: u32) -> u32 {
    n + 1
}

fn other(n: u32) -> u32 {
    n + 2
}
"#;
        let targets: HashSet<String> = ["walk".to_string()].into();
        let result = instrument_source(source, &targets, "demo", &Flags::default()).unwrap();

        assert!(
            result.source.contains("waylay_runtime::trap_entry")
                && result.source.contains(r#""walk""#),
            "walk should dispatch. Got:\n{}",
            result.source
        );
        assert!(
            !result.source.contains(r#""other""#),
            "other should be untouched. Got:\n{}",
            result.source
        );
        assert_eq!(result.rewritten.len(), 1);
        assert_eq!(result.rewritten[0].identity_name, "walk");
    }

    #[test]
    fn preserves_signature_and_body() {
        let source = "fn compute(x: i32, y: i32) -> i32 { x + y }";
        let result = instrument_all(source);
        assert!(result.source.contains("fn compute(x: i32, y: i32) -> i32"));
        assert!(result.source.contains("x + y"), "body survives inside the wrapper");
        assert!(result.source.contains("__waylay_ret"));
    }

    #[test]
    fn viewable_args_get_named_slots() {
        let source = "fn scale(factor: i64, label: &str, _: u8) -> i64 { factor }";
        let result = instrument_all(source);
        assert!(
            result.source.contains(r#"Slot::named("factor", &mut factor)"#),
            "erasable by-value arg gets a live slot. Got:\n{}",
            result.source
        );
        assert!(
            result.source.contains(r#"Slot::absent_named("label")"#),
            "reference arg is name-only. Got:\n{}",
            result.source
        );
        assert!(
            result.source.contains(r#"Slot::absent_named("_")"#),
            "unnamed arg is name-only. Got:\n{}",
            result.source
        );
    }

    #[test]
    fn fallible_return_splits_value_and_error() {
        let source = "fn load(path: String) -> Result<Vec<u8>, std::io::Error> { Ok(Vec::new()) }";
        let result = instrument_all(source);
        let out = &result.source;
        assert!(out.contains("__waylay_err"), "error local declared. Got:\n{out}");
        assert!(out.contains("Err(__waylay_e.into())"), "error converts at the boundary");
        assert!(out.contains(r#"Slot::named("err", &mut __waylay_err)"#));
        assert!(result.rewritten[0].last_result_err);
    }

    #[test]
    fn async_body_runs_in_awaited_block() {
        let source = "async fn fetch(id: u64) -> u64 { id * 2 }";
        let result = instrument_all(source);
        assert!(
            result.source.contains(".await"),
            "async body must stay async. Got:\n{}",
            result.source
        );
        assert!(!result.source.contains("(|| "), "no sync closure around an async body");
    }

    #[test]
    fn methods_use_qualified_identity() {
        let source = r#"
struct Walker;
impl Walker {
    fn walk(&mut self, step: u32) -> u32 { step }
}
"#;
        let result = instrument_all(source);
        assert!(
            result.source.contains(r#""Walker::walk""#),
            "Got:\n{}",
            result.source
        );
        assert!(
            result.source.contains(r#"Slot::named("self", self)"#),
            "&mut self receiver gets a live view. Got:\n{}",
            result.source
        );
        assert!(
            result.source.contains(r#"Slot::absent_named("self")"#),
            "exit keeps the receiver's declared shape. Got:\n{}",
            result.source
        );
    }

    #[test]
    fn exit_delivery_is_guarded_against_unwind() {
        let source = "fn walk(n: u32) -> u32 { n + 1 }";
        let result = instrument_all(source);
        assert!(
            result.source.contains("AfterGuard::new"),
            "the after-hook must ride in a drop guard. Got:\n{}",
            result.source
        );
        assert!(
            result.source.contains("__waylay_after.take()"),
            "the normal path disarms the guard. Got:\n{}",
            result.source
        );
    }

    #[test]
    fn shared_receiver_is_name_only() {
        let source = r#"
struct Walker;
impl Walker {
    fn peek(&self) -> u32 { 0 }
}
"#;
        let result = instrument_all(source);
        assert!(
            result.source.contains(r#"Slot::absent_named("self")"#),
            "&self cannot be viewed mutably. Got:\n{}",
            result.source
        );
    }

    #[test]
    fn fully_skipped_file_is_byte_identical() {
        let source = "const fn table_size() -> usize {      16 }\n// odd spacing preserved\n";
        let result = instrument_all(source);
        assert_eq!(result.source, source);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0], ("table_size".to_string(), "const fn"));
    }

    #[test]
    fn file_opt_out_const_skips_everything() {
        let source = "\
const __WAYLAY_SKIP_TRAP: bool = true;
fn walk() {}
fn run() {}
";
        let result = instrument_all(source);
        assert_eq!(result.source, source);
        assert!(result.rewritten.is_empty());
        assert_eq!(result.skipped.len(), 2);
    }

    #[test]
    fn link_stub_body_is_replaced() {
        let source = "fn __waylay_link_getcur_task() -> u64 { unimplemented!() }";
        let result =
            instrument_source(source, &HashSet::new(), "waylay_runtime::links", &Flags::default())
                .unwrap();
        assert!(
            result.source.contains("waylay_runtime::links::task_id()"),
            "Got:\n{}",
            result.source
        );
        assert!(!result.source.contains("unimplemented"));
        assert_eq!(result.linked, vec![("__waylay_link_getcur_task".to_string(), "task_id")]);
    }

    #[test]
    fn link_stub_forwards_arguments() {
        let source =
            "fn __waylay_link_on_task_exit(hook: Box<dyn FnOnce(u64)>) { let _ = hook; }";
        let result =
            instrument_source(source, &HashSet::new(), "waylay_runtime::links", &Flags::default())
                .unwrap();
        assert!(
            result.source.contains("waylay_runtime::links::on_task_exit(hook)"),
            "Got:\n{}",
            result.source
        );
    }

    #[test]
    fn explicit_skip_marker_body_is_untouched() {
        let source = "fn hot_loop() { waylay_runtime::skip(); spin(); }\n";
        let result = instrument_all(source);
        assert_eq!(result.source, source);
        assert_eq!(result.skipped[0].1, "explicit skip marker");
    }

    #[test]
    fn classify_source_reports_without_rewriting() {
        let source = "\
fn walk() {}
const fn size() -> usize { 1 }
";
        let actions = classify_source(source, "demo", &Flags::default()).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], ("walk".to_string(), Action::Trap));
        assert_eq!(actions[1], ("size".to_string(), Action::Skip("const fn")));
    }

    #[test]
    fn injects_registrations_in_main() {
        let source = "fn main() { run(); }";
        let meta = FnMeta {
            identity_name: "Walker::walk".into(),
            generic: false,
            has_recv: true,
            recv_name: Some("self".into()),
            arg_names: vec!["step".into()],
            res_names: vec!["value".into()],
            first_arg_ctx: false,
            last_result_err: false,
        };
        let entries = vec![("demo::walker".to_string(), meta)];
        let result = inject_registrations(source, &entries).unwrap();
        assert!(result.contains("waylay_runtime::register_func"), "Got:\n{result}");
        assert!(result.contains(r#""Walker::walk""#));
        assert!(result.contains(r#""demo::walker""#));
        assert!(result.contains("has_recv: true"));
    }

    #[test]
    fn trace_enable_lands_first_in_main() {
        let source = "fn main() { run(); }";
        let meta = FnMeta {
            identity_name: "walk".into(),
            generic: false,
            has_recv: false,
            recv_name: None,
            arg_names: vec![],
            res_names: vec![],
            first_arg_ctx: false,
            last_result_err: false,
        };
        let entries = vec![("demo".to_string(), meta)];
        let with_regs = inject_registrations(source, &entries).unwrap();
        let result = inject_trace_enable(&with_regs).unwrap();
        let enable_at = result.find("enable_trace").unwrap();
        let register_at = result.find("register_func").unwrap();
        assert!(enable_at < register_at, "Got:\n{result}");
    }
}
