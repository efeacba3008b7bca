//! Transaction fee computation

use crate::batch::Coin;
use crate::error::FaucetError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Price per unit of gas as a decimal amount of `denom`, e.g. `0.025uempe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasPrice {
    /// Amount scaled by `10^decimals`
    units: u128,
    decimals: u32,
    pub denom: String,
}

impl GasPrice {
    /// Cost of `gas` units, rounded up to a whole token unit
    pub fn cost(&self, gas: u64) -> Option<u128> {
        let scale = 10u128.checked_pow(self.decimals)?;
        let scaled = self.units.checked_mul(gas as u128)?;
        Some(scaled.div_ceil(scale))
    }
}

impl FromStr for GasPrice {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FaucetError::Config(format!("Invalid gas price: {:?}", s));

        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (amount, denom) = s.split_at(split);
        if amount.is_empty() || !denom.chars().all(|c| c.is_ascii_alphanumeric() || c == '/') {
            return Err(invalid());
        }

        let (whole, fraction) = amount.split_once('.').unwrap_or((amount, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let digits = format!("{}{}", whole, fraction);
        let units = digits.parse::<u128>().map_err(|_| invalid())?;

        Ok(Self {
            units,
            decimals: fraction.len() as u32,
            denom: denom.to_string(),
        })
    }
}

/// Fee attached to a batch transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub amount: Vec<Coin>,
    pub gas: u64,
}

impl Fee {
    /// `gas_limit × gas_price`, rounded up
    pub fn from_gas(gas_limit: u64, price: &GasPrice) -> Result<Self, FaucetError> {
        let amount = price
            .cost(gas_limit)
            .ok_or_else(|| FaucetError::Config("Fee overflows".to_string()))?;
        Ok(Self {
            amount: vec![Coin::new(price.denom.clone(), amount)],
            gas: gas_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gas_price() {
        let price: GasPrice = "0.025uempe".parse().unwrap();
        assert_eq!(price.denom, "uempe");
        assert_eq!(price.cost(200_000), Some(5_000));

        let whole: GasPrice = "2ustake".parse().unwrap();
        assert_eq!(whole.cost(10), Some(20));
    }

    #[test]
    fn test_cost_rounds_up() {
        let price: GasPrice = "0.025uempe".parse().unwrap();
        assert_eq!(price.cost(1), Some(1));
        assert_eq!(price.cost(41), Some(2));
        assert_eq!(price.cost(0), Some(0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("uempe".parse::<GasPrice>().is_err());
        assert!("0.025".parse::<GasPrice>().is_err());
        assert!(".uempe".parse::<GasPrice>().is_err());
        assert!("1.2.3uempe".parse::<GasPrice>().is_err());
        assert!("0.1 u empe".parse::<GasPrice>().is_err());
    }

    #[test]
    fn test_fee_from_gas() {
        let price: GasPrice = "0.025uempe".parse().unwrap();
        let fee = Fee::from_gas(200_000, &price).unwrap();
        assert_eq!(fee.gas, 200_000);
        assert_eq!(fee.amount, vec![Coin::new("uempe", 5_000)]);
    }
}
