use crate::{
    auth::AuthUser, entities::booking, errors::ServiceError, handlers::AppState, ApiResponse,
};
use axum::{
    extract::{Json, Path, State},
    routing::get,
    Router,
};

async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    user: AuthUser,
) -> Result<Json<ApiResponse<booking::Model>>, ServiceError> {
    let booking = state.services.bookings.get(&booking_id).await?;
    user.ensure_can_access(&booking.user_id)?;
    Ok(Json(ApiResponse::success(booking)))
}

pub fn booking_routes() -> Router<AppState> {
    Router::new().route("/:booking_id", get(get_booking))
}
