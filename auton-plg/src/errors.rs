//  ERRORS.rs
//    by Lut99
//
//  Created:
//    13 Nov 2024, 09:06:48
//  Last edited:
//    04 Mar 2025, 11:41:03
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the errors that may occur in the `auton-plg` crate.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};

use auton_cfg::errors::ResolveError;


/***** LIBRARY *****/
/// Defines errors that relate to parsing and applying the parameter-composition DSL.
#[derive(Debug)]
pub enum ComposeError {
    /// An entry of a modifier list had an unexpected shape (not a single-entry mapping, or a value that does not fit its modifier).
    IllegalEntry { raw: String },
    /// The pattern of a `~`-entry did not compile.
    IllegalPattern { pattern: String, err: regex::Error },
    /// A regex flag was not recognised.
    IllegalFlag { raw: String },
    /// The `func` of a `~`-entry was not one of the supported operations.
    IllegalFunc { raw: String },
    /// The `return` of a `~`-entry was not a supported method, or given for a non-match operation.
    IllegalReturn { raw: String },
    /// The `return_args` of a `~`-entry must be a single group index.
    IllegalReturnArgs { raw: String },
    /// The requested capture group does not occur in the pattern.
    MissingGroup { index: usize, pattern: String },

    /// A format template had unbalanced braces.
    IllegalTemplate { template: String },
    /// A format placeholder referenced an unknown variable.
    UnknownPlaceholder { name: String, template: String },
    /// A format placeholder indexed a variable with an unknown key (or indexed a plain string).
    UnknownPlaceholderKey { name: String, key: String, template: String },
    /// A format placeholder named a mapping variable without indexing it.
    UnindexedMap { name: String, template: String },
    /// A `%`-entry referenced a key that is not present in the composed mapping.
    MissingFormatKey { key: String },
}
impl Display for ComposeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use ComposeError::*;
        match self {
            IllegalEntry { raw }            => write!(f, "Illegal modifier entry '{raw}'"),
            IllegalPattern { pattern, err } => write!(f, "Failed to compile pattern '{pattern}': {err}"),
            IllegalFlag { raw }             => write!(f, "Unknown regex flag '{raw}'"),
            IllegalFunc { raw }             => write!(f, "Unknown regex operation '{raw}'"),
            IllegalReturn { raw }           => write!(f, "Unknown or inapplicable regex return '{raw}'"),
            IllegalReturnArgs { raw }       => write!(f, "Illegal regex return_args '{raw}' (expected a single group index)"),
            MissingGroup { index, pattern } => write!(f, "Pattern '{pattern}' has no capture group {index}"),

            IllegalTemplate { template }                  => write!(f, "Unbalanced braces in template '{template}'"),
            UnknownPlaceholder { name, template }         => write!(f, "Unknown variable '{name}' in template '{template}'"),
            UnknownPlaceholderKey { name, key, template } => write!(f, "Variable '{name}' has no entry '{key}' in template '{template}'"),
            UnindexedMap { name, template }               => write!(f, "Variable '{name}' is a mapping and needs an index in template '{template}'"),
            MissingFormatKey { key }                      => write!(f, "Cannot format key '{key}' that is not in the composed mapping"),
        }
    }
}
impl Error for ComposeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use ComposeError::*;
        match self {
            IllegalPattern { err, .. } => Some(err),
            _ => None,
        }
    }
}



/// Defines errors that may occur when building an endpoint from its configuration.
///
/// These are the per-endpoint fatal startup problems: the endpoint is skipped, the daemon lives on.
#[derive(Debug)]
pub enum EndpointError {
    /// Failed to resolve the endpoint's `import_*`/credentials references.
    Resolve { endpoint: String, err: ResolveError },
    /// The endpoint names a plugin we don't know.
    UnknownPlugin { endpoint: String, raw: String },
    /// The target configuration did not deserialize into the plugin's config.
    ConfigDeserialize { endpoint: String, err: serde_yaml::Error },
    /// A static argfile entry carried a lone `@` as its argument.
    IllegalArgfileArg { endpoint: String, raw: String },
    /// A modifier list in the target configuration did not parse.
    Compose { endpoint: String, err: ComposeError },
    /// The target's base URL did not parse.
    IllegalUrl { endpoint: String, raw: String, err: url::ParseError },
    /// The configured HTTP method override is not allowed.
    IllegalMethod { endpoint: String, raw: String },
    /// Failed to build the outbound HTTP client.
    ClientBuild { endpoint: String, err: reqwest::Error },
}
impl Display for EndpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use EndpointError::*;
        match self {
            Resolve { endpoint, .. }               => write!(f, "Failed to resolve configuration imports for endpoint '{endpoint}'"),
            UnknownPlugin { endpoint, raw }        => write!(f, "Invalid plugin '{raw}' in endpoint '{endpoint}'"),
            ConfigDeserialize { endpoint, .. }     => write!(f, "Invalid target configuration for endpoint '{endpoint}'"),
            IllegalArgfileArg { endpoint, raw }    => write!(f, "Invalid argfile arg '{raw}' in configuration of endpoint '{endpoint}'"),
            Compose { endpoint, .. }               => write!(f, "Invalid modifier list in configuration of endpoint '{endpoint}'"),
            IllegalUrl { endpoint, raw, .. }       => write!(f, "Failed to parse '{raw}' as a base URL for endpoint '{endpoint}'"),
            IllegalMethod { endpoint, raw }        => write!(f, "Invalid http method '{raw}' for endpoint '{endpoint}'"),
            ClientBuild { endpoint, .. }           => write!(f, "Failed to build HTTP client for endpoint '{endpoint}'"),
        }
    }
}
impl Error for EndpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use EndpointError::*;
        match self {
            Resolve { err, .. } => Some(err),
            UnknownPlugin { .. } => None,
            ConfigDeserialize { err, .. } => Some(err),
            IllegalArgfileArg { .. } => None,
            Compose { err, .. } => Some(err),
            IllegalUrl { err, .. } => Some(err),
            IllegalMethod { .. } => None,
            ClientBuild { err, .. } => Some(err),
        }
    }
}



/// Defines failures of a single Job against its target.
///
/// Every variant knows its optional numeric code, which becomes the Job's `return_code`.
#[derive(Debug)]
pub enum TargetError {
    /// The target failed, with an optional code (subprocess exit status, HTTP status).
    Failed { target: String, msg: String, code: Option<i32> },
    /// The Job exceeded the target's timeout.
    Timeout { target: String },
    /// The caller is not in the endpoint's allowlist.
    Unauthorized { user: Option<String> },
    /// The Job asked for a method the plugin does not provide.
    UnknownMethod { endpoint: String, method: String },
}
impl TargetError {
    /// Returns the numeric code this error carries for the Job's `return_code`.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        use TargetError::*;
        match self {
            Failed { code, .. } => *code,
            Timeout { .. } => None,
            Unauthorized { .. } => Some(401),
            UnknownMethod { .. } => None,
        }
    }
}
impl Display for TargetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use TargetError::*;
        match self {
            Failed { target, msg, .. }      => write!(f, "error on target '{target}': {msg}"),
            Timeout { target }              => write!(f, "timeout on target '{target}'"),
            Unauthorized { user }           => write!(f, "unauthorized user: {user:?}"),
            UnknownMethod { endpoint, method } => write!(f, "unknown method '{method}' for endpoint '{endpoint}'"),
        }
    }
}
impl Error for TargetError {}



/// Defines errors for producers of an endpoint queue.
#[derive(Debug)]
pub enum QueueError {
    /// The consuming worker is gone.
    Closed { endpoint: String },
}
impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use QueueError::*;
        match self {
            Closed { endpoint } => write!(f, "Queue for endpoint '{endpoint}' is closed"),
        }
    }
}
impl Error for QueueError {}
