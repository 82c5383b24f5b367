//  CREDENTIALS.rs
//    by Lut99
//
//  Created:
//    12 Nov 2024, 10:31:19
//  Last edited:
//    03 Mar 2025, 14:14:36
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the credentials that a target may present to its backend,
//!   either given inline in the daemon config or stored in a separate
//!   YAML file.
//

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::info::YamlError as Error;
use crate::info::{Info as _, YamlInfo};


/***** LIBRARY *****/
/// Defines a username/password pair that a target presents as HTTP Basic auth.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    /// The username to authenticate as.
    pub username: String,
    /// The password that goes with it.
    pub password: String,
}
impl<'de> YamlInfo<'de> for Credentials {}



/// Defines how credentials may be written down in the daemon config.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialsSpec {
    /// They are written inline.
    Inline(Credentials),
    /// They live in a separate file at the given path.
    Path(PathBuf),
}
impl CredentialsSpec {
    /// Resolves this spec into actual [`Credentials`].
    ///
    /// # Arguments
    /// - `config_dir`: The directory against which relative paths are resolved.
    ///
    /// # Errors
    /// This function errors if the reference points to a file which we could not read or parse.
    pub fn resolve(&self, config_dir: Option<&std::path::Path>) -> Result<Credentials, Error> {
        match self {
            Self::Inline(creds) => Ok(creds.clone()),
            Self::Path(path) => {
                let path: PathBuf = match config_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                Credentials::from_path(path)
            },
        }
    }
}
