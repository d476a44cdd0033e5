//! The non-`serve` CLI verbs (spec §6.4), one module per subcommand.

pub mod archive;
pub mod fuse;
pub mod sync_market_data;
pub mod vectorize;
