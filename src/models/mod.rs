pub(crate) mod contribution;
pub(crate) mod loan;
pub(crate) mod notification;
pub(crate) mod penalty;
pub(crate) mod transaction;
