pub(crate) mod daraja;
pub(crate) mod initiation;
pub(crate) mod ledger;
pub(crate) mod notifier;
pub(crate) mod phone;
pub(crate) mod reconciler;
pub(crate) mod recovery;
pub(crate) mod transactions;
