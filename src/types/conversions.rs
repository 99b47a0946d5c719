use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Largest integer that still fits in a `Decimal` mantissa (2^96 - 1).
fn decimal_mantissa_max() -> U256 {
    (U256::one() << 96) - U256::one()
}

pub fn u256_to_decimal(value: U256) -> Result<Decimal, ConversionError> {
    if value > decimal_mantissa_max() {
        return Err(ConversionError::Overflow);
    }
    Decimal::from_str(&value.to_string())
        .map_err(|e| ConversionError::InvalidDecimal(e.to_string()))
}

/// `numerator / denominator` as a `Decimal`.
///
/// Base-unit amounts can exceed the `Decimal` range. A denominator that does
/// not fit is scaled down together with the numerator; a numerator that still
/// does not fit is split into its integer quotient and remainder. Quotients
/// beyond the `Decimal` range saturate at `Decimal::MAX`.
pub fn ratio(numerator: U256, denominator: U256) -> Result<Decimal, ConversionError> {
    if denominator.is_zero() {
        return Err(ConversionError::DivisionByZero);
    }
    let max = decimal_mantissa_max();
    let ten = U256::from(10u8);
    let (mut num, mut den) = (numerator, denominator);
    while den > max {
        num /= ten;
        den /= ten;
    }
    let den_dec = u256_to_decimal(den)?;
    if num <= max {
        return Ok(u256_to_decimal(num)?.checked_div(den_dec).unwrap_or(Decimal::MAX));
    }

    let quotient = num / den;
    if quotient > max {
        return Ok(Decimal::MAX);
    }
    let fraction = u256_to_decimal(num % den)?
        .checked_div(den_dec)
        .unwrap_or(Decimal::ZERO);
    Ok(u256_to_decimal(quotient)?
        .checked_add(fraction)
        .unwrap_or(Decimal::MAX))
}

pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_small_amounts_is_exact() {
        let r = ratio(U256::from(100u64), U256::from(1000u64)).unwrap();
        assert_eq!(r, Decimal::from_str("0.1").unwrap());
    }

    #[test]
    fn ratio_scales_amounts_beyond_decimal_range() {
        let big = U256::exp10(40);
        let r = ratio(big * U256::from(3u8), big).unwrap();
        assert_eq!(r, Decimal::from(3));
    }

    #[test]
    fn ratio_keeps_small_denominators() {
        let r = ratio(U256::exp10(29), U256::from(4u8)).unwrap();
        assert_eq!(r, Decimal::from_str("25000000000000000000000000000").unwrap());
    }

    #[test]
    fn ratio_saturates_past_decimal_range() {
        assert_eq!(ratio(U256::exp10(30), U256::from(3u8)).unwrap(), Decimal::MAX);
    }

    #[test]
    fn ratio_rejects_zero_denominator() {
        assert!(matches!(
            ratio(U256::one(), U256::zero()),
            Err(ConversionError::DivisionByZero)
        ));
    }

    #[test]
    fn addresses_are_lowercased() {
        let addr = string_to_address("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2").unwrap();
        assert_eq!(address_to_string(addr), "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    }
}
