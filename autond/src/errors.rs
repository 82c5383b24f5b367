//  ERRORS.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 14:01:37
//  Last edited:
//    05 Mar 2025, 15:52:26
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the errors that may occur in the `autond` service, and how
//!   they surface as control-API responses.
//

use std::convert::Infallible;
use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};

use log::error;
use serde::Serialize;
use warp::http::StatusCode;
use warp::{Rejection, Reply};


/***** LIBRARY *****/
/// Defines errors of the job registry.
#[derive(Debug)]
pub enum RegistryError {
    /// Could not acquire the registry lock within the configured bound.
    LockTimeout { mode: &'static str, timeout: u64 },
    /// Asked to insert a uid that is already present.
    UidExists { uid: String },
}
impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RegistryError::*;
        match self {
            LockTimeout { mode, timeout } => write!(f, "unable to take LOCK for {mode} after {timeout} seconds"),
            UidExists { uid }             => write!(f, "uid already exists: '{uid}'"),
        }
    }
}
impl Error for RegistryError {}



/// Defines the ways a control request may be refused, each with its HTTP status.
#[derive(Debug)]
pub enum RequestError {
    /// The query or payload was not even the right JSON shape.
    InvalidArgumentsType,
    /// The query or payload violated the request schema.
    InvalidArguments,
    /// The named endpoint is not registered.
    UnknownEndpoint { endpoint: String },
    /// No Job under that uid.
    UnknownUid { uid: String },
    /// A Job under that uid already exists.
    UidExists { uid: String },
    /// Could not acquire the registry lock within the configured bound.
    LockTimeout { mode: &'static str, timeout: u64 },
    /// The endpoint's worker is gone.
    QueueClosed { endpoint: String },
}
impl RequestError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        use RequestError::*;
        match self {
            InvalidArgumentsType => StatusCode::BAD_REQUEST,
            InvalidArguments => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UnknownEndpoint { .. } => StatusCode::NOT_FOUND,
            UnknownUid { .. } => StatusCode::NOT_FOUND,
            UidExists { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            QueueClosed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RequestError::*;
        match self {
            InvalidArgumentsType          => write!(f, "invalid arguments type"),
            InvalidArguments              => write!(f, "invalid arguments for command"),
            UnknownEndpoint { endpoint }  => write!(f, "unable to find endpoint: '{endpoint}'"),
            UnknownUid { uid }            => write!(f, "unable to find object with uid: '{uid}'"),
            UidExists { uid }             => write!(f, "uid already exists: '{uid}'"),
            LockTimeout { mode, timeout } => write!(f, "unable to take LOCK for {mode} after {timeout} seconds"),
            QueueClosed { endpoint }      => write!(f, "endpoint is not accepting jobs: '{endpoint}'"),
        }
    }
}
impl Error for RequestError {}
impl warp::reject::Reject for RequestError {}
impl From<RegistryError> for RequestError {
    #[inline]
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::LockTimeout { mode, timeout } => Self::LockTimeout { mode, timeout },
            RegistryError::UidExists { uid } => Self::UidExists { uid },
        }
    }
}



/// The JSON body every refused control request carries.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code:    u16,
    message: String,
}

/// Maps rejections to the control API's JSON error responses.
///
/// # Errors
/// This function never errors; every rejection becomes a reply.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message): (StatusCode, String) = if let Some(err) = err.find::<RequestError>() {
        (err.status(), err.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".into())
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "invalid arguments type".into())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".into())
    } else {
        error!("unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
    };

    let body = warp::reply::json(&ErrorBody { code: status.as_u16(), message });
    Ok(warp::reply::with_status(body, status))
}
