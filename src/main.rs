use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use waylay::build::{
    build_instrumented, find_bin_entry_point, find_workspace_root, inject_runtime_dependency,
    inject_runtime_path_dependency, prepare_staging,
};
use waylay::classify::{Action, Flags};
use waylay::error::Error;
use waylay::resolve::{module_path_for_file, resolve_targets, FnMeta, TargetSpec};
use waylay::rewrite::{
    classify_source, inject_registrations, inject_trace_enable, instrument_source,
};

#[derive(Parser)]
#[command(
    name = "waylay",
    about = "Compile-time function interception for Rust",
    version,
    after_help = "Workflow: waylay build [OPTIONS], then waylay run -- [ARGS]"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument and build the project. Intercepts every eligible
    /// function by default; use --fn, --file, or --mod to narrow scope.
    Build {
        /// Intercept functions whose name contains PATTERN (repeatable).
        /// e.g. --fn parse matches parse, parse_line, MyStruct::try_parse.
        #[arg(long = "fn", value_name = "PATTERN")]
        fn_patterns: Vec<String>,

        /// Intercept all functions in a file (repeatable).
        #[arg(long = "file", value_name = "PATH")]
        file_patterns: Vec<PathBuf>,

        /// Intercept all functions in a module (repeatable).
        #[arg(long = "mod", value_name = "NAME")]
        mod_patterns: Vec<String>,

        /// Project root (defaults to current directory).
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Path to waylay-runtime source (for development before publishing).
        #[arg(long)]
        runtime_path: Option<PathBuf>,

        #[command(flatten)]
        modes: ModeArgs,
    },
    /// Execute the last-built instrumented binary.
    /// Pass arguments to the binary after --.
    Run {
        /// Arguments to pass to the instrumented binary (after --).
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Show how each function would be classified, without building.
    List {
        /// Project root (defaults to current directory).
        #[arg(long, default_value = ".")]
        project: PathBuf,

        #[command(flatten)]
        modes: ModeArgs,
    },
}

/// Process-wide classifier modes, shared by `build` and `list`.
#[derive(clap::Args, Clone, Copy)]
struct ModeArgs {
    /// Classify for a standard-library build (every function skips).
    #[arg(long)]
    std_mode: bool,

    /// Only wire runtime link stubs; trap nothing.
    #[arg(long)]
    link_only: bool,

    /// Disable trapping process-wide; link stubs are still wired.
    #[arg(long)]
    disable_trap: bool,

    /// Leave generic functions untouched (compatibility escape hatch).
    #[arg(long)]
    generic_workaround: bool,
}

impl ModeArgs {
    fn flags(&self) -> Flags {
        Flags {
            std_mode: self.std_mode,
            link_only: self.link_only,
            trap_disabled: self.disable_trap,
            generic_workaround: self.generic_workaround,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Build {
            fn_patterns,
            file_patterns,
            mod_patterns,
            project,
            runtime_path,
            modes,
        } => cmd_build(
            fn_patterns,
            file_patterns,
            mod_patterns,
            project,
            runtime_path,
            modes.flags(),
        ),
        Commands::Run { args } => cmd_run(args),
        Commands::List { project, modes } => cmd_list(project, modes.flags()),
    }
}

/// Read `package.name` from a project's Cargo.toml.
fn package_name(project: &std::path::Path) -> Result<String, Error> {
    let content = std::fs::read_to_string(project.join("Cargo.toml"))?;
    let doc: toml_edit::DocumentMut = content
        .parse()
        .map_err(|e| Error::BuildFailed(format!("failed to parse Cargo.toml: {e}")))?;
    doc.get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(String::from)
        .ok_or_else(|| Error::BuildFailed("Cargo.toml missing package.name".into()))
}

/// Instrument the project in a staging copy and build it. Returns the
/// path to the compiled binary.
fn build_project(
    fn_patterns: Vec<String>,
    file_patterns: Vec<PathBuf>,
    mod_patterns: Vec<String>,
    project: PathBuf,
    runtime_path: Option<PathBuf>,
    flags: Flags,
) -> Result<PathBuf, Error> {
    if !project.join("Cargo.toml").exists() {
        return Err(Error::NoProjectFound(project));
    }
    let project = std::fs::canonicalize(&project)?;
    let crate_name = package_name(&project)?;

    // Build target specs from CLI args.
    let mut specs: Vec<TargetSpec> = Vec::new();
    for p in fn_patterns {
        specs.push(TargetSpec::Fn(p));
    }
    for p in file_patterns {
        specs.push(TargetSpec::File(p));
    }
    for m in mod_patterns {
        specs.push(TargetSpec::Mod(m));
    }

    // Resolve targets against the project source.
    let src_dir = project.join("src");
    if !src_dir.is_dir() {
        return Err(Error::BuildFailed(format!(
            "no src/ directory found in {} -- is this a Rust project?",
            project.display()
        )));
    }
    let targets = resolve_targets(&src_dir, &specs)?;

    let total_fns: usize = targets.iter().map(|t| t.functions.len()).sum();
    eprintln!(
        "found {} function(s) across {} file(s)",
        total_fns,
        targets.len()
    );
    for target in &targets {
        let relative = target.file.strip_prefix(&src_dir).unwrap_or(&target.file);
        eprintln!("  {}:", relative.display());
        for f in &target.functions {
            eprintln!("    {}", f.identity_name);
        }
    }

    // Detect workspace membership. If the project is a workspace member,
    // stage from the workspace root so inherited fields and cross-member
    // path dependencies resolve correctly.
    let workspace_root = find_workspace_root(&project);
    let (staging_root, member_subdir, member_pkg) = match &workspace_root {
        Some(ws_root) => {
            let relative = project
                .strip_prefix(ws_root)
                .map_err(|e| std::io::Error::other(e.to_string()))?
                .to_path_buf();
            (ws_root.clone(), Some(relative), Some(crate_name.clone()))
        }
        None => (project.clone(), None, None),
    };

    // Prepare staging directory.
    let staging = tempfile::tempdir()?;
    prepare_staging(&staging_root, staging.path())?;

    // Determine the member directory within staging (workspace root for standalone).
    let member_staging = match &member_subdir {
        Some(sub) => staging.path().join(sub),
        None => staging.path().to_path_buf(),
    };

    // Inject the waylay-runtime dependency.
    match runtime_path {
        Some(ref path) => {
            let abs_path = std::fs::canonicalize(path)?;
            inject_runtime_path_dependency(&member_staging, &abs_path)?;
        }
        None => {
            inject_runtime_dependency(&member_staging, env!("WAYLAY_RUNTIME_VERSION"))?;
        }
    }

    // Rewrite each target file in staging, collecting registration
    // metadata for everything that now dispatches through the runtime.
    let mut registrations: Vec<(String, FnMeta)> = Vec::new();
    let mut skipped_total = 0usize;
    for target in &targets {
        let target_set: HashSet<String> = target
            .functions
            .iter()
            .map(|f| f.identity_name.clone())
            .collect();
        let relative = target.file.strip_prefix(&src_dir).unwrap_or(&target.file);
        let staged_file = member_staging.join("src").join(relative);
        let display_path = PathBuf::from("src").join(relative);
        let pkg_path = module_path_for_file(&crate_name, &src_dir, &target.file);

        let source =
            std::fs::read_to_string(&staged_file).map_err(|source| Error::SourceReadError {
                path: display_path.clone(),
                source,
            })?;

        let result = instrument_source(&source, &target_set, &pkg_path, &flags).map_err(
            |source| Error::ParseError {
                path: display_path,
                source,
            },
        )?;

        skipped_total += result.skipped.len();
        for meta in result.rewritten {
            registrations.push((pkg_path.clone(), meta));
        }
        std::fs::write(&staged_file, result.source)?;
    }

    eprintln!(
        "intercepting {} function(s), {} skipped",
        registrations.len(),
        skipped_total
    );

    // Inject metadata registrations and trace startup into the binary
    // entry point. Trace enablement goes in last so it runs first.
    let bin_entry = find_bin_entry_point(&member_staging)?;
    let main_file = member_staging.join(&bin_entry);
    {
        let main_source =
            std::fs::read_to_string(&main_file).map_err(|source| Error::SourceReadError {
                path: bin_entry.clone(),
                source,
            })?;
        let rewritten =
            inject_registrations(&main_source, &registrations).map_err(|source| {
                Error::ParseError {
                    path: bin_entry.clone(),
                    source,
                }
            })?;
        let rewritten = inject_trace_enable(&rewritten).map_err(|source| Error::ParseError {
            path: bin_entry.clone(),
            source,
        })?;
        std::fs::write(&main_file, rewritten)?;
    }

    // Build the instrumented binary.
    let target_dir = project.join("target").join("waylay");
    std::fs::create_dir_all(&target_dir)?;
    build_instrumented(staging.path(), &target_dir, member_pkg.as_deref())
}

fn cmd_build(
    fn_patterns: Vec<String>,
    file_patterns: Vec<PathBuf>,
    mod_patterns: Vec<String>,
    project: PathBuf,
    runtime_path: Option<PathBuf>,
    flags: Flags,
) -> Result<(), Error> {
    let binary = build_project(
        fn_patterns,
        file_patterns,
        mod_patterns,
        project,
        runtime_path,
        flags,
    )?;
    let display_name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());
    eprintln!("built: {display_name}");
    if !std::io::stdout().is_terminal() {
        println!("{}", binary.display());
    }

    Ok(())
}

fn find_latest_binary() -> Result<PathBuf, Error> {
    let dir = PathBuf::from("target/waylay/debug");
    if !dir.is_dir() {
        return Err(Error::NoBinary);
    }
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        // Skip files with extensions (e.g. .d, .fingerprint) -- binaries have no extension on unix
        if path.extension().is_some() {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if entry.metadata()?.permissions().mode() & 0o111 == 0 {
                continue; // not executable
            }
        }
        let mtime = entry.metadata()?.modified()?;
        if best.as_ref().map_or(true, |(_, t)| mtime > *t) {
            best = Some((path, mtime));
        }
    }
    best.map(|(p, _)| p).ok_or(Error::NoBinary)
}

/// Run the latest instrumented binary. WAYLAY_TRACE_OUTPUT (and every
/// other variable) passes through to the child untouched.
fn cmd_run(args: Vec<String>) -> Result<(), Error> {
    let binary = find_latest_binary()?;
    eprintln!("running: {}", binary.display());

    let status = std::process::Command::new(&binary)
        .args(&args)
        .status()
        .map_err(|e| Error::RunFailed(format!("failed to run {}: {e}", binary.display())))?;

    std::process::exit(status.code().unwrap_or(1));
}

fn cmd_list(project: PathBuf, flags: Flags) -> Result<(), Error> {
    if !project.join("Cargo.toml").exists() {
        return Err(Error::NoProjectFound(project));
    }
    let project = std::fs::canonicalize(&project)?;
    let crate_name = package_name(&project)?;
    let src_dir = project.join("src");
    if !src_dir.is_dir() {
        return Err(Error::BuildFailed(format!(
            "no src/ directory found in {} -- is this a Rust project?",
            project.display()
        )));
    }
    let targets = resolve_targets(&src_dir, &[])?;
    for target in &targets {
        let relative = target.file.strip_prefix(&src_dir).unwrap_or(&target.file);
        let pkg_path = module_path_for_file(&crate_name, &src_dir, &target.file);
        let source =
            std::fs::read_to_string(&target.file).map_err(|source| Error::SourceReadError {
                path: target.file.clone(),
                source,
            })?;
        let actions = classify_source(&source, &pkg_path, &flags).map_err(|source| {
            Error::ParseError {
                path: target.file.clone(),
                source,
            }
        })?;

        println!("src/{}:", relative.display());
        for (name, action) in actions {
            match action {
                Action::Trap => println!("  {name}  trap"),
                Action::Link(link) => println!("  {name}  link -> {link}"),
                Action::Skip(reason) => println!("  {name}  skip ({reason})"),
            }
        }
    }
    Ok(())
}
