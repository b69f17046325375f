pub mod ledger;
pub mod simulate;
pub mod validate_link;
