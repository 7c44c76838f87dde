use super::success_response;
use crate::settings::AppSettings;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;

/// Effective timing constants, so clients can pace their heartbeats.
pub async fn get_settings(settings: Arc<AppSettings>) -> Response {
    success_response(StatusCode::OK, settings.as_ref())
}
