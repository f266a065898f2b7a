use crate::{
    entities::{
        booking,
        payment_order::{self, PaymentOrderStatus},
    },
    errors::ServiceError,
    gateway::{self, GatewayClient, GatewayError, GatewayState, GatewayStatus},
    services::{
        booking_factory::BookingFactory,
        payment_orders::{PaymentOrderStore, TransitionOutcome},
    },
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// A statement about a payment's state, from a webhook or a status check
#[derive(Debug, Clone)]
pub enum PaymentSignal {
    Success {
        gateway_transaction_id: Option<String>,
        amount: Option<i64>,
        raw: Value,
    },
    Failed {
        reason: String,
        raw: Value,
    },
    Cancelled {
        raw: Value,
    },
    Pending {
        raw: Value,
    },
}

impl PaymentSignal {
    pub fn from_gateway(status: GatewayStatus) -> Self {
        let raw = status.raw_response;
        match status.state {
            GatewayState::Success => PaymentSignal::Success {
                gateway_transaction_id: status.gateway_transaction_id,
                amount: status.amount,
                raw,
            },
            GatewayState::Failed => PaymentSignal::Failed {
                reason: status
                    .error_code
                    .unwrap_or_else(|| "gateway reported FAILED".to_string()),
                raw,
            },
            GatewayState::Cancelled => PaymentSignal::Cancelled { raw },
            GatewayState::Pending => PaymentSignal::Pending { raw },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PaymentSignal::Success { .. } => "success",
            PaymentSignal::Failed { .. } => "failed",
            PaymentSignal::Cancelled { .. } => "cancelled",
            PaymentSignal::Pending { .. } => "pending",
        }
    }
}

/// End state after a signal was applied
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub merchant_order_id: String,
    pub status: PaymentOrderStatus,
    /// True if this call changed the order's status
    pub transitioned: bool,
    pub booking_id: Option<String>,
    pub booking_created: bool,
}

/// Result of asking the gateway about an open order
#[derive(Debug)]
pub enum GatewayCheck {
    /// The order was already terminal; the gateway was not called
    AlreadyTerminal(payment_order::Model),
    /// Gateway answered with a terminal state, now applied
    Resolved(ReconcileOutcome),
    /// Gateway answered "still pending"
    StillPending(ReconcileOutcome),
    /// Timeout or gateway failure; order left untouched
    Unavailable(GatewayError),
}

/// The single place where gateway signals become store transitions and bookings.
///
/// Webhooks, the redirect resolver and the poller all go through here, so a
/// given merchant order converges to the same end state whichever path
/// reaches it first, and however often.
pub struct PaymentReconciler {
    orders: PaymentOrderStore,
    bookings: Arc<BookingFactory>,
    gateway: Arc<dyn GatewayClient>,
    gateway_timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        orders: PaymentOrderStore,
        bookings: Arc<BookingFactory>,
        gateway: Arc<dyn GatewayClient>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            bookings,
            gateway,
            gateway_timeout,
        }
    }

    pub fn orders(&self) -> &PaymentOrderStore {
        &self.orders
    }

    #[instrument(skip(self, signal), fields(signal = signal.kind()))]
    pub async fn apply_signal(
        &self,
        merchant_order_id: &str,
        signal: PaymentSignal,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let transition = match signal {
            PaymentSignal::Success {
                gateway_transaction_id,
                amount,
                raw,
            } => {
                let current = self.orders.get(merchant_order_id).await?;
                if let Some(reported) = amount {
                    if reported != current.amount {
                        self.orders
                            .flag_for_review(
                                merchant_order_id,
                                &format!(
                                    "amount mismatch: gateway reported {}, order has {}",
                                    reported, current.amount
                                ),
                            )
                            .await?;
                    }
                }

                let outcome = self
                    .orders
                    .mark_success(merchant_order_id, gateway_transaction_id, Some(raw))
                    .await?;

                if !outcome.applied
                    && matches!(
                        outcome.order.status,
                        PaymentOrderStatus::Failed | PaymentOrderStatus::Cancelled
                    )
                {
                    warn!(
                        merchant_order_id,
                        status = ?outcome.order.status,
                        "Gateway reported success for a closed payment"
                    );
                    self.orders
                        .flag_for_review(
                            merchant_order_id,
                            &format!(
                                "gateway reported success after order was {:?}",
                                outcome.order.status
                            ),
                        )
                        .await?;
                }
                outcome
            }
            PaymentSignal::Failed { reason, raw } => {
                self.orders
                    .mark_failed(merchant_order_id, &reason, Some(raw))
                    .await?
            }
            PaymentSignal::Cancelled { raw } => {
                self.orders
                    .mark_cancelled(merchant_order_id, Some(raw))
                    .await?
            }
            PaymentSignal::Pending { raw } => {
                self.orders.mark_pending(merchant_order_id, Some(raw)).await?
            }
        };

        self.finish(transition).await
    }

    /// Booking creation runs for every SUCCESS order, not only on the
    /// transition itself, so a crash between the two steps heals on the next signal.
    async fn finish(&self, transition: TransitionOutcome) -> Result<ReconcileOutcome, ServiceError> {
        let TransitionOutcome { order, applied } = transition;
        let mut outcome = ReconcileOutcome {
            merchant_order_id: order.merchant_order_id.clone(),
            status: order.status,
            transitioned: applied,
            booking_id: None,
            booking_created: false,
        };

        if order.status == PaymentOrderStatus::Success {
            let created = self.bookings.create_from_cart(&order).await?;
            outcome.booking_id = Some(created.booking.id);
            outcome.booking_created = created.created;
        }
        Ok(outcome)
    }

    /// Existing or newly created booking for a SUCCESS order; None otherwise
    pub async fn ensure_booking(
        &self,
        order: &payment_order::Model,
    ) -> Result<Option<booking::Model>, ServiceError> {
        if order.status != PaymentOrderStatus::Success {
            return Ok(None);
        }
        Ok(Some(self.bookings.create_from_cart(order).await?.booking))
    }

    /// Time-bounded status check for an open order; a timeout never changes state
    pub async fn refresh_from_gateway(
        &self,
        order: &payment_order::Model,
    ) -> Result<GatewayCheck, ServiceError> {
        self.refresh_from_gateway_within(order, self.gateway_timeout)
            .await
    }

    /// Same as [`refresh_from_gateway`](Self::refresh_from_gateway) with a tighter bound;
    /// the configured gateway timeout still applies when it is shorter
    #[instrument(skip(self, order), fields(merchant_order_id = %order.merchant_order_id))]
    pub async fn refresh_from_gateway_within(
        &self,
        order: &payment_order::Model,
        limit: Duration,
    ) -> Result<GatewayCheck, ServiceError> {
        if order.is_terminal() {
            return Ok(GatewayCheck::AlreadyTerminal(order.clone()));
        }

        let status = match gateway::with_timeout(
            limit.min(self.gateway_timeout),
            self.gateway.check_status(&order.merchant_order_id),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Gateway status check failed");
                return Ok(GatewayCheck::Unavailable(e));
            }
        };

        let still_pending = !status.state.is_terminal();
        let outcome = self
            .apply_signal(&order.merchant_order_id, PaymentSignal::from_gateway(status))
            .await?;

        if still_pending {
            Ok(GatewayCheck::StillPending(outcome))
        } else {
            info!(status = ?outcome.status, "Gateway status applied");
            Ok(GatewayCheck::Resolved(outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gateway_failure_code_becomes_reason() {
        let signal = PaymentSignal::from_gateway(GatewayStatus {
            state: GatewayState::Failed,
            gateway_order_id: None,
            gateway_transaction_id: None,
            amount: Some(100),
            error_code: Some("INSUFFICIENT_FUNDS".into()),
            raw_response: json!({}),
        });
        match signal {
            PaymentSignal::Failed { reason, .. } => assert_eq!(reason, "INSUFFICIENT_FUNDS"),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn pending_status_stays_pending() {
        let signal = PaymentSignal::from_gateway(GatewayStatus {
            state: GatewayState::Pending,
            gateway_order_id: None,
            gateway_transaction_id: None,
            amount: None,
            error_code: None,
            raw_response: json!({"state": "PENDING"}),
        });
        assert_eq!(signal.kind(), "pending");
    }
}
