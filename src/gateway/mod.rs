//! Off-chain collaborators: yield oracle and swap gateway.

mod mock;
mod oracle;
mod swap;
mod traits;
mod types;

pub use mock::{SimulatedSwapGateway, StaticYieldOracle};
pub use oracle::HttpYieldOracle;
pub use swap::HttpSwapGateway;
#[cfg(test)]
pub use traits::{MockSwapGateway, MockYieldOracle};
pub use traits::{SwapGateway, YieldOracle};
pub use types::*;
