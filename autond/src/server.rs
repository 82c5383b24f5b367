//  SERVER.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 15:06:50
//  Last edited:
//    05 Mar 2025, 16:47:03
//  Auto updated?
//    Yes
//
//  Description:
//!   Assembles the warp filter tree of the control API.
//

use std::collections::HashMap;
use std::sync::Arc;

use warp::filters::BoxedFilter;
use warp::{Filter, Reply};

use crate::errors::handle_rejection;
use crate::spec::Context;
use crate::{health, jobs};


/***** LIBRARY *****/
/// Builds the complete filter tree of the control API.
///
/// # Arguments
/// - `context`: The daemon context shared by all handlers.
pub fn routes(context: Arc<Context>) -> BoxedFilter<(impl Reply,)> {
    let context = warp::any().map(move || context.clone());

    // POST /job/run?endpoint=<>&id=<>
    let run = warp::post()
        .and(warp::path("job"))
        .and(warp::path("run"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(warp::body::bytes())
        .and(context.clone())
        .and_then(jobs::run);

    // GET /job/status?endpoint=<>&id=<>
    let status = warp::get()
        .and(warp::path("job"))
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(context.clone())
        .and_then(jobs::status);

    // GET /health
    let health = warp::get().and(warp::path("health")).and(warp::path::end()).and_then(health::handle);

    run.or(status).or(health).recover(handle_rejection).boxed()
}
