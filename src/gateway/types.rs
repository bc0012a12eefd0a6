//! Wire and domain types for the yield oracle and swap gateway.

use alloy_primitives::{Address, Bytes, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Yield reading for one vault, recomputed every decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldOpportunity {
    pub vault: Address,
    pub asset: Address,
    /// Annual percentage yield in percentage points (4.2 = 4.2%)
    pub apy: Decimal,
    /// Annual percentage rate; equals `apy` when the oracle reports none
    pub apr: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Body posted to the yield oracle.
#[derive(Debug, Clone, Serialize)]
pub struct YieldRequest {
    pub chain: String,
    pub pool_address: Address,
    pub lp_token_address: Address,
    pub input_token: Address,
}

/// One sample of an oracle time series.
#[derive(Debug, Clone, Deserialize)]
pub struct YieldPoint {
    #[serde(default)]
    pub apy: Option<Decimal>,
    #[serde(default)]
    pub apr: Option<Decimal>,
}

/// Oracle response: either a time series or scalar current/average figures.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum YieldResponse {
    Series {
        data: Vec<YieldPoint>,
    },
    Scalar {
        #[serde(default)]
        apy: Option<Decimal>,
        #[serde(default)]
        apr: Option<Decimal>,
        #[serde(default, alias = "apyMean", alias = "apy_mean")]
        average_apy: Option<Decimal>,
    },
}

impl YieldResponse {
    /// Reduce the response to `(apy, apr)`; `None` when nothing usable was reported.
    ///
    /// Series are averaged over samples carrying an APY. Scalars prefer the
    /// average figure over the instantaneous one.
    pub fn summarize(&self) -> Option<(Decimal, Decimal)> {
        let (apy, apr) = match self {
            YieldResponse::Series { data } => {
                let apys: Vec<Decimal> = data.iter().filter_map(|p| p.apy).collect();
                if apys.is_empty() {
                    return None;
                }
                let count = Decimal::from(apys.len());
                let apy = apys.iter().copied().sum::<Decimal>() / count;

                let aprs: Vec<Decimal> = data.iter().filter_map(|p| p.apr).collect();
                let apr = if aprs.is_empty() {
                    apy
                } else {
                    aprs.iter().copied().sum::<Decimal>() / Decimal::from(aprs.len())
                };
                (apy, apr)
            }
            YieldResponse::Scalar {
                apy,
                apr,
                average_apy,
            } => {
                let apy = average_apy.or(*apy)?;
                (apy, apr.unwrap_or(apy))
            }
        };

        if apy <= Decimal::ZERO {
            return None;
        }
        Some((apy, apr))
    }
}

/// Parameters of a swap quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRequest {
    pub input_token: Address,
    pub output_token: Address,
    pub input_amount: U256,
    /// Account executing the swap
    pub user_address: Address,
    pub output_receiver: Address,
}

/// Body posted to the swap gateway. Amounts travel as decimal strings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequestBody {
    pub chain: String,
    pub input_token: Address,
    pub output_token: Address,
    pub input_amount: String,
    pub user_address: Address,
    pub output_receiver: Address,
}

impl SwapRequestBody {
    pub fn new(chain: &str, request: &SwapRequest) -> Self {
        Self {
            chain: chain.to_string(),
            input_token: request.input_token,
            output_token: request.output_token,
            input_amount: request.input_amount.to_string(),
            user_address: request.user_address,
            output_receiver: request.output_receiver,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResponse {
    pub router: Address,
    pub calldata: Bytes,
    #[serde(default)]
    pub amount_out: Option<String>,
}

/// An executable swap instruction and the router authorized to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapQuote {
    pub router: Address,
    pub calldata: Bytes,
    /// Expected output, when the gateway reports one
    pub amount_out: Option<U256>,
}
