use std::sync::Arc;

use mongodb::Database;

use crate::services::daraja::DarajaService;
use crate::services::initiation::PaymentInitiator;
use crate::services::ledger::MongoLedger;
use crate::services::notifier::Notifier;
use crate::services::reconciler::PaymentReconciler;
use crate::services::transactions::TransactionRepo;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub daraja: Arc<DarajaService>,
    pub transactions: Arc<dyn TransactionRepo>,
    pub ledger: Arc<MongoLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub initiator: Arc<PaymentInitiator>,
    pub reconciler: Arc<PaymentReconciler>,
}
