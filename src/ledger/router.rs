//! Swap routers the ledger hands opaque swap instructions to.

use super::token::TokenBook;
use alloy_primitives::{Address, Bytes, U256};
use std::collections::HashMap;
use std::fmt;

/// An external contract that executes an opaque swap instruction on behalf of `caller`.
///
/// The router pulls `input_amount` of `input_token` from `caller` through an
/// allowance and delivers `output_token` back to `caller`.
pub trait SwapRouter: Send + Sync + fmt::Debug {
    fn address(&self) -> Address;

    fn execute(
        &self,
        tokens: &mut TokenBook,
        caller: Address,
        calldata: &Bytes,
        input_token: Address,
        output_token: Address,
        input_amount: U256,
    ) -> Result<U256, String>;

    fn clone_box(&self) -> Box<dyn SwapRouter>;
}

impl Clone for Box<dyn SwapRouter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Fixed-rate router with unlimited output liquidity.
///
/// Calldata is a 32-byte big-endian minimum output amount; the swap fails
/// when the converted amount falls short of it.
#[derive(Debug, Clone)]
pub struct SimulatedRouter {
    address: Address,
    /// Output per input in basis points, keyed by (input, output) token
    rates_bps: HashMap<(Address, Address), u32>,
}

impl SimulatedRouter {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            rates_bps: HashMap::new(),
        }
    }

    /// Quote `input`→`output` at `rate_bps` (10_000 = 1:1).
    pub fn with_rate(mut self, input: Address, output: Address, rate_bps: u32) -> Self {
        self.rates_bps.insert((input, output), rate_bps);
        self
    }

    pub fn quote(&self, input: Address, output: Address, amount: U256) -> Option<U256> {
        let rate = *self.rates_bps.get(&(input, output))?;
        amount
            .checked_mul(U256::from(rate))
            .map(|v| v / U256::from(10_000u32))
    }

    pub fn encode_calldata(min_amount_out: U256) -> Bytes {
        Bytes::from(min_amount_out.to_be_bytes::<32>().to_vec())
    }

    pub fn decode_calldata(calldata: &Bytes) -> Option<U256> {
        if calldata.len() != 32 {
            return None;
        }
        U256::try_from_be_slice(calldata)
    }
}

impl SwapRouter for SimulatedRouter {
    fn address(&self) -> Address {
        self.address
    }

    fn execute(
        &self,
        tokens: &mut TokenBook,
        caller: Address,
        calldata: &Bytes,
        input_token: Address,
        output_token: Address,
        input_amount: U256,
    ) -> Result<U256, String> {
        let min_out = Self::decode_calldata(calldata)
            .ok_or_else(|| format!("malformed calldata ({} bytes)", calldata.len()))?;
        let amount_out = self
            .quote(input_token, output_token, input_amount)
            .ok_or_else(|| format!("no route {input_token} -> {output_token}"))?;
        if amount_out < min_out {
            return Err(format!("insufficient output {amount_out} < {min_out}"));
        }

        tokens
            .transfer_from(input_token, self.address, caller, self.address, input_amount)
            .map_err(|e| e.to_string())?;
        tokens
            .mint(output_token, caller, amount_out)
            .map_err(|e| e.to_string())?;

        Ok(amount_out)
    }

    fn clone_box(&self) -> Box<dyn SwapRouter> {
        Box::new(self.clone())
    }
}
