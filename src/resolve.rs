pub mod exclude;
pub mod extension_mapper;
pub mod isomorphic;
pub mod path_alias;
pub mod plugin;

use std::fmt;
use std::path::PathBuf;

/// Import-resolution failures. Fatal for the build pass they occur in.
#[derive(Debug)]
pub enum ResolutionError {
    /// `replace_alias_pattern` was called with a specifier no alias covers.
    NoAliasFor(String),
    /// A relative import points into a directory with no recognized index
    /// file while bundling.
    NoIndexFile(PathBuf),
    /// An extensionless relative import matched none of the probe extensions.
    Unresolvable { specifier: String, importer: PathBuf },
    /// A bare package specifier could not be located for inlining.
    PackageNotFound(String),
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolutionError::NoAliasFor(specifier) => {
                write!(f, "no alias found for path: {specifier}")
            }
            ResolutionError::NoIndexFile(dir) => write!(
                f,
                "import points into a directory without an index file: {}",
                dir.display()
            ),
            ResolutionError::Unresolvable { specifier, importer } => write!(
                f,
                "could not resolve \"{specifier}\" imported from {}",
                importer.display()
            ),
            ResolutionError::PackageNotFound(name) => {
                write!(f, "could not locate package \"{name}\" for bundling")
            }
        }
    }
}

impl std::error::Error for ResolutionError {}
