//! Services bundled with the sentinel binary.

pub mod pair_created;
pub mod transfer;

pub use pair_created::{PairCreatedConfig, PairCreatedListener};
pub use transfer::{BscScanClient, TokenHistory, TransferConfig, TransferListener};
