//! REST API route tree.

pub mod esims;
pub mod euicc;
pub mod modems;
pub mod notifications;
pub mod response;

use axum::Router;

use crate::state::AppState;

pub use response::{respond, ApiError, DataResponse};

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/modems",
        modems::router()
            .merge(esims::router())
            .merge(notifications::router())
            .merge(euicc::router()),
    )
}
