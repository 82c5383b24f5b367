//  ERRORS.rs
//    by Lut99
//
//  Created:
//    12 Nov 2024, 10:26:30
//  Last edited:
//    03 Mar 2025, 14:11:48
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the errors that may occur in the `auton-cfg` crate.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::path::PathBuf;

use crate::info::YamlError;


/***** LIBRARY *****/
/// Defines errors that relate to resolving an endpoint's configuration sections.
#[derive(Debug)]
pub enum ResolveError {
    /// Failed to load one of the `import_*` files.
    ImportLoad { what: &'static str, path: PathBuf, err: YamlError },
    /// One of the `import_*` files did not contain a YAML mapping.
    ImportNotAMap { what: &'static str, path: PathBuf },
    /// Failed to load the referenced credentials file.
    CredentialsLoad { path: PathBuf, err: YamlError },
}
impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use ResolveError::*;
        match self {
            ImportLoad { what, path, .. }   => write!(f, "Failed to load import_{} file '{}'", what, path.display()),
            ImportNotAMap { what, path }    => write!(f, "Import_{} file '{}' does not contain a YAML mapping", what, path.display()),
            CredentialsLoad { path, .. }    => write!(f, "Failed to load credentials file '{}'", path.display()),
        }
    }
}
impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use ResolveError::*;
        match self {
            ImportLoad { err, .. } => Some(err),
            ImportNotAMap { .. } => None,
            CredentialsLoad { err, .. } => Some(err),
        }
    }
}
