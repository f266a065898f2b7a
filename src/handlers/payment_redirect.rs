use crate::{
    auth::AuthUser,
    services::{RedirectRequest, Resolution, ResolvedPayment},
    AppState,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    response::Redirect,
};
use serde_json::Value;
use tracing::{error, info, warn};
use url::Url;

const REDIRECT_SOURCE: &str = "gateway";

/// Where the browser lands when the payment could not be correlated in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectFallback {
    /// No strategy matched
    Unresolved,
    /// Resolution failed or exceeded its deadline
    Unknown,
}

impl RedirectFallback {
    fn as_str(self) -> &'static str {
        match self {
            RedirectFallback::Unresolved => "unresolved",
            RedirectFallback::Unknown => "unknown",
        }
    }
}

// GET|POST /api/v1/payments/redirect
//
// Always answers with a redirect to the frontend; the browser never sees an error page.
pub async fn payment_redirect(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Redirect {
    let mut params = query;
    params.extend(body_params(&body));

    let request = RedirectRequest {
        params,
        user_id: user.map(|u| u.user_id),
    };

    let base = state.config.frontend_redirect_base();
    let deadline = state.config.redirect_timeout();

    // Resolution runs on its own task: when the deadline passes the browser moves
    // on, while any transition or booking already under way runs to completion.
    let resolver = state.services.resolver.clone();
    let resolution = tokio::spawn(async move { resolver.resolve(&request).await });

    let target = match tokio::time::timeout(deadline, resolution).await {
        Ok(Ok(Ok(Resolution::Resolved(resolved)))) => confirmation_url(&base, &resolved),
        Ok(Ok(Ok(Resolution::Unresolved))) => fallback_url(&base, RedirectFallback::Unresolved),
        Ok(Ok(Err(e))) => {
            error!(error = %e, "Redirect resolution failed");
            fallback_url(&base, RedirectFallback::Unknown)
        }
        Ok(Err(join_err)) => {
            error!(error = %join_err, "Redirect resolution task aborted");
            fallback_url(&base, RedirectFallback::Unknown)
        }
        Err(_) => {
            warn!(
                timeout_ms = deadline.as_millis() as u64,
                "Redirect resolution still running at deadline; answering without it"
            );
            fallback_url(&base, RedirectFallback::Unknown)
        }
    };

    info!(target_url = %target, "Redirecting browser to frontend");
    Redirect::to(&target)
}

/// Form-encoded or JSON object bodies; anything else contributes nothing
fn body_params(body: &[u8]) -> Vec<(String, String)> {
    if body.is_empty() {
        return Vec::new();
    }

    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        return map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();
    }

    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (k, v) in pairs {
                    query.append_pair(k, v);
                }
            }
            url.to_string()
        }
        Err(_) => {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter())
                .finish();
            format!("{}?{}", base, query)
        }
    }
}

pub fn confirmation_url(base: &str, resolved: &ResolvedPayment) -> String {
    let status = serde_json::to_value(resolved.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(5);
    if let Some(cart_id) = resolved.cart_id.as_deref() {
        pairs.push(("cart_id", cart_id));
    }
    pairs.push(("order_id", &resolved.merchant_order_id));
    pairs.push(("payment_status", &status));
    if let Some(booking_id) = resolved.booking_id.as_deref() {
        pairs.push(("booking_id", booking_id));
    }
    pairs.push(("redirect_source", REDIRECT_SOURCE));
    with_query(base, &pairs)
}

pub fn fallback_url(base: &str, fallback: RedirectFallback) -> String {
    with_query(
        base,
        &[("status", fallback.as_str()), ("redirect_source", REDIRECT_SOURCE)],
    )
}
