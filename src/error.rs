use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no Cargo.toml found at {}", .0.display())]
    NoProjectFound(PathBuf),

    #[error("no functions matched {0}")]
    NoTargetsFound(String),

    #[error("failed to parse {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: syn::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    SourceReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("no instrumented binary found -- run `waylay build` first")]
    NoBinary,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
