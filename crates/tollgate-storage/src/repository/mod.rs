//! Database repositories for each table.

pub mod cards;
pub mod ledger;
pub mod packages;
pub mod recharges;
pub mod requests;

pub use cards::CardsRepo;
pub use ledger::LedgerRepo;
pub use packages::PackagesRepo;
pub use recharges::RechargesRepo;
pub use requests::RequestLogRepo;
