use axum::{
    extract::{Extension, State},
    Json,
};

use crate::{
    api::{middleware::auth::CurrentPrincipal, state::AppState},
    error::Result,
    service::membership_service::MembershipOverview,
};

pub async fn mine(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
) -> Result<Json<MembershipOverview>> {
    let overview = state
        .service_context
        .membership_service
        .overview(principal.id)
        .await?;
    Ok(Json(overview))
}
