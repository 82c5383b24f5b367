//  HEALTH.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 15:02:33
//  Last edited:
//    05 Mar 2025, 16:42:28
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the handler for the `/health` path.
//

use std::convert::Infallible;

use log::debug;
use warp::Reply;


/***** LIBRARY *****/
/// Handles `GET /health`: the liveness probe.
///
/// # Errors
/// This function never errors.
pub async fn handle() -> Result<impl Reply, Infallible> {
    debug!("Received health request");
    Ok("OK\n")
}
