//! mempool.space fee-rate responses.
//!
//! Only the fields the vault engine reads are modeled; everything else in the
//! payloads is ignored.

use serde::{Deserialize, Serialize};

pub(crate) const BLOCK_FEE_RATES_PATH: &str = "/api/v1/mining/blocks/fee-rates/24h";
pub(crate) const MEMPOOL_BLOCKS_PATH: &str = "/api/v1/fees/mempool-blocks";
pub(crate) const RECOMMENDED_FEES_PATH: &str = "/api/v1/fees/recommended";

/// Fee percentiles for a single mined block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockFeeRates {
    #[serde(rename = "avgHeight")]
    pub avg_height: u32,
    pub timestamp: u64,
    #[serde(rename = "avgFee_50")]
    pub avg_fee_50: f64,
}

/// A projected block from the current mempool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolBlock {
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub n_tx: u64,
    pub median_fee: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedFees {
    pub fastest_fee: f64,
    pub half_hour_fee: f64,
    pub hour_fee: f64,
    pub economy_fee: f64,
    pub minimum_fee: f64,
}
