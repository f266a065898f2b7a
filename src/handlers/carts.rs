use crate::{
    auth::AuthUser,
    entities::cart,
    errors::ServiceError,
    handlers::AppState,
    services::NewCart,
    ApiResponse,
};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};

/// Creates the caller's new ACTIVE cart; earlier active carts become INACTIVE
async fn create_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<NewCart>,
) -> Result<(StatusCode, Json<ApiResponse<cart::Model>>), ServiceError> {
    let cart = state.services.carts.create(&user.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(cart))))
}

async fn get_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<String>,
    user: AuthUser,
) -> Result<Json<ApiResponse<cart::Model>>, ServiceError> {
    let cart = state.services.carts.get(&cart_id).await?;
    user.ensure_can_access(&cart.user_id)?;
    Ok(Json(ApiResponse::success(cart)))
}

pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_cart))
        .route("/:cart_id", get(get_cart))
}
