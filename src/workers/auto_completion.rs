use crate::{
    config::PollerConfig,
    errors::ServiceError,
    services::{
        payment_orders::PaymentOrderStore,
        reconciliation::{GatewayCheck, PaymentReconciler},
    },
};
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Config seconds as a chrono duration, capped at one year
fn whole_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(365 * 24 * 3600) as i64)
}

/// Counters for one poller pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    /// Another pass was already running; nothing was done
    pub skipped: bool,
    pub examined: usize,
    pub claimed: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub gateway_errors: usize,
    pub failed: usize,
    pub flagged_for_review: usize,
}

/// Periodically asks the gateway about payments whose webhook never came
pub struct AutoCompletionPoller {
    orders: PaymentOrderStore,
    reconciler: Arc<PaymentReconciler>,
    config: PollerConfig,
    run_lock: Mutex<()>,
}

impl AutoCompletionPoller {
    pub fn new(
        orders: PaymentOrderStore,
        reconciler: Arc<PaymentReconciler>,
        config: PollerConfig,
    ) -> Self {
        Self {
            orders,
            reconciler,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// One pass over the stale batch; returns immediately if a pass is in progress
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<PollReport, ServiceError> {
        let Ok(_running) = self.run_lock.try_lock() else {
            debug!("Previous poller pass still running; skipping");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        };

        let grace = whole_seconds(self.config.grace_secs);
        let lease = whole_seconds(self.config.lease_secs);

        let candidates = self
            .orders
            .stale_non_terminal(grace, self.config.batch_size)
            .await?;

        let mut report = PollReport {
            examined: candidates.len(),
            ..PollReport::default()
        };

        for order in candidates {
            let id = order.merchant_order_id.clone();
            if !self.orders.claim_for_poll(&id, lease).await? {
                debug!(merchant_order_id = %id, "Order claimed elsewhere");
                continue;
            }
            report.claimed += 1;

            let unresolved_error = match self.reconciler.refresh_from_gateway(&order).await {
                Ok(GatewayCheck::Resolved(outcome)) => {
                    info!(
                        merchant_order_id = %id,
                        status = ?outcome.status,
                        booking_id = ?outcome.booking_id,
                        "Poller resolved payment"
                    );
                    report.resolved += 1;
                    continue;
                }
                Ok(GatewayCheck::AlreadyTerminal(_)) => continue,
                Ok(GatewayCheck::StillPending(_)) => {
                    report.still_pending += 1;
                    None
                }
                Ok(GatewayCheck::Unavailable(e)) => {
                    report.gateway_errors += 1;
                    Some(e.to_string())
                }
                Err(ServiceError::CartMissing(cart)) => {
                    // Status is already SUCCESS; the order is flagged for review
                    warn!(merchant_order_id = %id, cart = %cart, "Poller could not book a paid order");
                    report.resolved += 1;
                    continue;
                }
                Err(e) => {
                    error!(merchant_order_id = %id, error = %e, "Poller failed to reconcile order");
                    report.failed += 1;
                    continue;
                }
            };

            let updated = self
                .orders
                .record_check_attempt(&id, unresolved_error, self.config.max_attempts)
                .await?;
            if updated.needs_review {
                report.flagged_for_review += 1;
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                resolved = report.resolved,
                still_pending = report.still_pending,
                gateway_errors = report.gateway_errors,
                flagged = report.flagged_for_review,
                "Poller pass finished"
            );
        }
        Ok(report)
    }

    /// Runs `run_once` every `interval_secs` until `shutdown` flips to true
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(self.config.interval_secs);
            info!(interval_secs = self.config.interval_secs, "Auto-completion poller started");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Poller pass aborted");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Auto-completion poller stopped");
        })
    }
}
