//! Amount handling and address validation for SOL-denominated balances

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{EngineError, Result};

/// Decimal places of native SOL
pub const SOL_DECIMALS: u32 = 9;

/// Convert a SOL amount to lamports
///
/// # Safety
/// - Validates amount is non-negative
/// - Checks for overflow (amount must fit in u64)
/// - Rejects amounts that round to zero
pub fn to_lamports(sol: Decimal) -> Result<u64> {
    if sol < Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "Amount cannot be negative: {}",
            sol
        )));
    }

    let raw = (sol * Decimal::from(10u64.pow(SOL_DECIMALS))).trunc();

    let lamports = raw.to_u64().ok_or_else(|| {
        EngineError::Validation(format!("Amount {} SOL overflows u64 lamports", sol))
    })?;

    if lamports == 0 && sol > Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "Amount {} SOL too small (rounds to 0 lamports)",
            sol
        )));
    }

    Ok(lamports)
}

/// Convert lamports to a SOL amount
pub fn from_lamports(lamports: u64) -> Decimal {
    Decimal::from(lamports) / Decimal::from(10u64.pow(SOL_DECIMALS))
}

/// Truncate to lamport precision
pub fn round_sol(sol: Decimal) -> Decimal {
    sol.round_dp_with_strategy(SOL_DECIMALS, rust_decimal::RoundingStrategy::ToZero)
}

/// Validate a Solana address (mint or wallet)
///
/// Public keys are 32 bytes, Base58-encoded to 32-44 characters.
pub fn validate_address(address: &str) -> Result<()> {
    let decoded = bs58::decode(address).into_vec().map_err(|_| {
        EngineError::Validation(format!("Invalid address {}: not valid Base58", address))
    })?;

    if decoded.len() != 32 {
        return Err(EngineError::Validation(format!(
            "Invalid address {}: expected 32 bytes, got {}",
            address,
            decoded.len()
        )));
    }

    Ok(())
}
