use std::path::{Path, PathBuf};

use syn::visit::Visit;

use crate::error::Error;

/// What the user asked to intercept.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    /// Substring match against function names (--fn).
    Fn(String),
    /// All functions in a specific file (--file).
    File(PathBuf),
    /// All functions in a module directory (--mod).
    Mod(String),
}

/// Metadata for one interceptable function, extracted from its signature.
/// This is what gets registered with the runtime's function table.
#[derive(Debug, Clone, PartialEq)]
pub struct FnMeta {
    /// "walk" for free functions, "Walker::walk" for methods.
    pub identity_name: String,
    pub generic: bool,
    pub has_recv: bool,
    pub recv_name: Option<String>,
    /// One entry per non-receiver parameter; `_` for unnamed patterns.
    pub arg_names: Vec<String>,
    pub res_names: Vec<String>,
    pub first_arg_ctx: bool,
    pub last_result_err: bool,
}

/// A file and the functions within it that matched.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub file: PathBuf,
    pub functions: Vec<FnMeta>,
}

/// Resolve user-provided target specs against the source tree rooted at `src_dir`.
///
/// Returns one `ResolvedTarget` per file that contains at least one matching
/// function. An empty spec list matches every function in every file.
/// Errors if explicit specs match nothing.
pub fn resolve_targets(src_dir: &Path, specs: &[TargetSpec]) -> Result<Vec<ResolvedTarget>, Error> {
    let rs_files = walk_rs_files(src_dir)?;

    let mut results: Vec<ResolvedTarget> = Vec::new();

    if specs.is_empty() {
        for file in &rs_files {
            let all_fns = extract_functions_from(file)?;
            if !all_fns.is_empty() {
                merge_into(&mut results, file, all_fns);
            }
        }
    }

    for spec in specs {
        match spec {
            TargetSpec::Fn(pattern) => {
                for file in &rs_files {
                    let matched: Vec<FnMeta> = extract_functions_from(file)?
                        .into_iter()
                        .filter(|meta| {
                            // Match against the bare name (after any Type:: prefix).
                            let name = &meta.identity_name;
                            let bare = name.rsplit("::").next().unwrap_or(name);
                            bare.contains(pattern.as_str())
                        })
                        .collect();
                    if !matched.is_empty() {
                        merge_into(&mut results, file, matched);
                    }
                }
            }
            TargetSpec::File(file_path) => {
                for file in rs_files.iter().filter(|f| f.ends_with(file_path)) {
                    let all_fns = extract_functions_from(file)?;
                    if !all_fns.is_empty() {
                        merge_into(&mut results, file, all_fns);
                    }
                }
            }
            TargetSpec::Mod(module_name) => {
                // Files under a directory named `module_name` (walker/mod.rs,
                // walker/sub.rs) or a file named `module_name.rs`.
                for file in &rs_files {
                    let is_mod_file = file
                        .parent()
                        .and_then(|p| p.file_name())
                        .is_some_and(|dir| dir == module_name.as_str());
                    let is_named_file = file
                        .file_stem()
                        .is_some_and(|stem| stem == module_name.as_str());

                    if !is_mod_file && !is_named_file {
                        continue;
                    }

                    let all_fns = extract_functions_from(file)?;
                    if !all_fns.is_empty() {
                        merge_into(&mut results, file, all_fns);
                    }
                }
            }
        }
    }

    if results.is_empty() && !specs.is_empty() {
        let desc = specs
            .iter()
            .map(|s| match s {
                TargetSpec::Fn(p) => format!("--fn {p}"),
                TargetSpec::File(p) => format!("--file {}", p.display()),
                TargetSpec::Mod(m) => format!("--mod {m}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::NoTargetsFound(desc));
    }

    // Sort by file path for deterministic output.
    results.sort_by(|a, b| a.file.cmp(&b.file));
    for r in &mut results {
        r.functions.sort_by(|a, b| a.identity_name.cmp(&b.identity_name));
        r.functions.dedup_by(|a, b| a.identity_name == b.identity_name);
    }

    Ok(results)
}

/// Map a source file to its module path within the crate, e.g.
/// `src/walker/mod.rs` in crate `demo` becomes `demo::walker`.
pub fn module_path_for_file(crate_name: &str, src_dir: &Path, file: &Path) -> String {
    let crate_name = crate_name.replace('-', "_");
    let relative = match file.strip_prefix(src_dir) {
        Ok(rel) => rel,
        Err(_) => return crate_name,
    };
    let mut segments: Vec<String> = Vec::new();
    for component in relative.components() {
        segments.push(component.as_os_str().to_string_lossy().into_owned());
    }
    let Some(last) = segments.pop() else {
        return crate_name;
    };
    let stem = last.trim_end_matches(".rs");
    if stem != "main" && stem != "lib" && stem != "mod" {
        segments.push(stem.to_string());
    }
    let mut path = crate_name;
    for seg in segments {
        path.push_str("::");
        path.push_str(&seg);
    }
    path
}

/// Merge matched functions into the results vec, coalescing by file path.
fn merge_into(results: &mut Vec<ResolvedTarget>, file: &Path, functions: Vec<FnMeta>) {
    if let Some(existing) = results.iter_mut().find(|r| r.file == file) {
        existing.functions.extend(functions);
    } else {
        results.push(ResolvedTarget {
            file: file.to_path_buf(),
            functions,
        });
    }
}

/// Recursively find all `.rs` files under `dir`.
fn walk_rs_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    walk_rs_files_inner(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk_rs_files_inner(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_rs_files_inner(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
    Ok(())
}

fn extract_functions_from(file: &Path) -> Result<Vec<FnMeta>, Error> {
    let source = std::fs::read_to_string(file).map_err(|source| Error::SourceReadError {
        path: file.to_path_buf(),
        source,
    })?;
    extract_functions(&source, file)
}

/// Parse a Rust source file and extract metadata for every function.
///
/// Top-level functions get bare names, impl methods "Type::method", and
/// default trait methods "Trait::method". Trait methods without a body
/// are not collected -- there is nothing to rewrite.
pub fn extract_functions(source: &str, path: &Path) -> Result<Vec<FnMeta>, Error> {
    let syntax = syn::parse_file(source).map_err(|source| Error::ParseError {
        path: path.to_path_buf(),
        source,
    })?;

    let mut collector = FnCollector::default();
    collector.visit_file(&syntax);
    Ok(collector.functions)
}

/// Build a [`FnMeta`] from a parsed signature and its qualified name.
pub(crate) fn fn_meta_from_sig(sig: &syn::Signature, qualified: String) -> FnMeta {
    let has_recv = sig.receiver().is_some();
    let arg_names: Vec<String> = sig
        .inputs
        .iter()
        .filter_map(|arg| match arg {
            syn::FnArg::Receiver(_) => None,
            syn::FnArg::Typed(pat_ty) => Some(pattern_name(&pat_ty.pat)),
        })
        .collect();
    let first_arg_ctx = sig.inputs.iter().find_map(first_typed_arg).is_some_and(type_is_context);
    let last_result_err = match &sig.output {
        syn::ReturnType::Default => false,
        syn::ReturnType::Type(_, ty) => result_value_and_err(ty).is_some(),
    };
    let res_names = match &sig.output {
        syn::ReturnType::Default => Vec::new(),
        syn::ReturnType::Type(_, ty) if is_unit_type(ty) => Vec::new(),
        syn::ReturnType::Type(..) if last_result_err => vec!["value".into(), "err".into()],
        syn::ReturnType::Type(..) => vec!["value".into()],
    };
    let generic = sig
        .generics
        .params
        .iter()
        .any(|p| !matches!(p, syn::GenericParam::Lifetime(_)));

    FnMeta {
        identity_name: qualified,
        generic,
        has_recv,
        recv_name: has_recv.then(|| "self".to_string()),
        arg_names,
        res_names,
        first_arg_ctx,
        last_result_err,
    }
}

fn first_typed_arg(arg: &syn::FnArg) -> Option<&syn::Type> {
    match arg {
        syn::FnArg::Typed(pat_ty) => Some(&pat_ty.ty),
        syn::FnArg::Receiver(_) => None,
    }
}

fn pattern_name(pat: &syn::Pat) -> String {
    match pat {
        syn::Pat::Ident(ident) => ident.ident.to_string(),
        _ => "_".to_string(),
    }
}

/// A context-typed parameter: the type's last path segment ends in
/// "Context" (possibly behind a reference).
fn type_is_context(ty: &syn::Type) -> bool {
    match ty {
        syn::Type::Reference(r) => type_is_context(&r.elem),
        syn::Type::Path(tp) => tp
            .path
            .segments
            .last()
            .is_some_and(|seg| seg.ident.to_string().ends_with("Context")),
        _ => false,
    }
}

pub(crate) fn is_unit_type(ty: &syn::Type) -> bool {
    matches!(ty, syn::Type::Tuple(t) if t.elems.is_empty())
}

/// If `ty` is `Result<T, E>` (by name, two type arguments), return `(T, E)`.
pub(crate) fn result_value_and_err(ty: &syn::Type) -> Option<(&syn::Type, &syn::Type)> {
    let syn::Type::Path(tp) = ty else {
        return None;
    };
    let seg = tp.path.segments.last()?;
    if seg.ident != "Result" {
        return None;
    }
    let syn::PathArguments::AngleBracketed(args) = &seg.arguments else {
        return None;
    };
    let mut types = args.args.iter().filter_map(|a| match a {
        syn::GenericArgument::Type(t) => Some(t),
        _ => None,
    });
    let value = types.next()?;
    let err = types.next()?;
    if types.next().is_some() {
        return None;
    }
    Some((value, err))
}

/// AST visitor that collects function metadata from a parsed file.
#[derive(Default)]
struct FnCollector {
    functions: Vec<FnMeta>,
    /// When inside an `impl` block, holds the type name (e.g. "Resolver").
    current_impl: Option<String>,
    /// When inside a `trait` block, holds the trait name.
    current_trait: Option<String>,
}

impl<'ast> Visit<'ast> for FnCollector {
    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        let name = node.sig.ident.to_string();
        self.functions.push(fn_meta_from_sig(&node.sig, name));
        syn::visit::visit_item_fn(self, node);
    }

    fn visit_item_impl(&mut self, node: &'ast syn::ItemImpl) {
        let type_name = type_name_from_type(&node.self_ty);
        let prev = self.current_impl.replace(type_name);
        syn::visit::visit_item_impl(self, node);
        self.current_impl = prev;
    }

    fn visit_impl_item_fn(&mut self, node: &'ast syn::ImplItemFn) {
        let method_name = node.sig.ident.to_string();
        let qualified = match &self.current_impl {
            Some(impl_name) => format!("{impl_name}::{method_name}"),
            None => method_name,
        };
        self.functions.push(fn_meta_from_sig(&node.sig, qualified));
        syn::visit::visit_impl_item_fn(self, node);
    }

    fn visit_item_trait(&mut self, node: &'ast syn::ItemTrait) {
        let trait_name = node.ident.to_string();
        let prev = self.current_trait.replace(trait_name);
        syn::visit::visit_item_trait(self, node);
        self.current_trait = prev;
    }

    fn visit_trait_item_fn(&mut self, node: &'ast syn::TraitItemFn) {
        // Only collect if the method has a default body.
        if node.default.is_some() {
            let method_name = node.sig.ident.to_string();
            let qualified = match &self.current_trait {
                Some(trait_name) => format!("{trait_name}::{method_name}"),
                None => method_name,
            };
            self.functions.push(fn_meta_from_sig(&node.sig, qualified));
        }
        syn::visit::visit_trait_item_fn(self, node);
    }
}

/// Extract a human-readable type name from a `syn::Type` (best-effort).
pub(crate) fn type_name_from_type(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(tp) => tp
            .path
            .segments
            .last()
            .map(|seg| seg.ident.to_string())
            .unwrap_or_else(|| "_".to_string()),
        _ => "_".to_string(),
    }
}
