// services/recovery.rs
//
// Callbacks occasionally never arrive (gateway retries exhausted, network
// partitions, stale callback URLs). This sweep periodically picks up
// transactions stuck in pending past the configured window and pushes each
// through the same query-then-reconcile path a user-triggered check uses.
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::services::daraja::DarajaService;
use crate::services::reconciler::{GatewayOutcome, PaymentReconciler};
use crate::services::transactions::TransactionRepo;

const SWEEP_INTERVAL_SECS: u64 = 60;

pub async fn run_stuck_pending_sweep(
    daraja: Arc<DarajaService>,
    transactions: Arc<dyn TransactionRepo>,
    reconciler: Arc<PaymentReconciler>,
    stuck_pending_minutes: i64,
) {
    let mut interval = tokio::time::interval(StdDuration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if let Err(e) = sweep_once(&daraja, &transactions, &reconciler, stuck_pending_minutes).await {
            warn!("Stuck-pending sweep failed: {}", e);
        }
    }
}

async fn sweep_once(
    daraja: &DarajaService,
    transactions: &Arc<dyn TransactionRepo>,
    reconciler: &PaymentReconciler,
    stuck_pending_minutes: i64,
) -> crate::errors::Result<()> {
    let cutoff = Utc::now() - Duration::minutes(stuck_pending_minutes);
    let stuck = transactions.find_stuck_pending(cutoff).await?;
    if stuck.is_empty() {
        return Ok(());
    }

    info!("Recovery sweep: {} transaction(s) stuck in pending", stuck.len());
    for tx in stuck {
        match daraja.query_stk_status(&tx.checkout_request_id).await {
            Ok(Some(query)) => match GatewayOutcome::from_query(&query) {
                Ok(outcome) => {
                    if let Err(e) = reconciler.reconcile(outcome).await {
                        warn!("Recovery reconcile failed for {}: {}", tx.checkout_request_id, e);
                    }
                }
                Err(e) => warn!("Bad query response for {}: {}", tx.checkout_request_id, e),
            },
            // Still processing on the gateway side; try again next sweep.
            Ok(None) => {}
            Err(e) => warn!("Status query failed for {}: {}", tx.checkout_request_id, e),
        }
    }
    Ok(())
}
