pub mod health;
pub mod items;
pub mod users;

use axum::http::HeaderValue;
use axum::response::Response;

use crate::cache::CacheTier;

/// Stamp the tier a read was answered from; handlers opt in per route.
pub(crate) fn with_cache_tier(mut response: Response, tier: CacheTier) -> Response {
    if let Ok(value) = HeaderValue::from_str(tier.as_str()) {
        response.headers_mut().insert("X-Cache-Type", value);
    }
    response
}
