use crate::error::{Error, Result};
use std::str::FromStr;
use web3::contract::Error as ContractError;
use web3::signing::{Key, SecretKey, SecretKeyRef};
use web3::types::{Address, U256};

/// Decimals of the staked token.
pub const DECIMALS: usize = 18;

#[inline(always)]
pub fn extract_keypair_from_str(sk_str: &str) -> Result<(SecretKey, Address)> {
    let sk_str = sk_str.trim().trim_start_matches("0x");
    let sk = SecretKey::from_str(sk_str).map_err(|e| Error::Config(format!("bad secret key: {}", e)))?;
    let addr = SecretKeyRef::new(&sk).address();
    Ok((sk, addr))
}

#[inline(always)]
pub fn handle_error(error: ContractError) -> String {
    match error {
        ContractError::InvalidOutputType(s) => format!("Invalid output type: {}", s),
        ContractError::Abi(e) => format!("Abi error: {}", e),
        ContractError::Api(e) => format!("Api error: {}", e),
        ContractError::Deployment(e) => format!("Deployment error: {}", e),
        ContractError::InterfaceUnsupported => "Contract does not support this interface.".to_string(),
    }
}

/// Parse a human decimal string ("1.5") into base units.
pub fn parse_units(amount: &str) -> Result<U256> {
    let amount = amount.trim();
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::InvalidAmount(amount.to_string()));
    }
    if frac_part.len() > DECIMALS {
        return Err(Error::InvalidAmount(format!("{} has more than {} decimals", amount, DECIMALS)));
    }
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let scale = U256::exp10(DECIMALS);
    let int_value = U256::from_dec_str(int_part).map_err(|_| Error::InvalidAmount(amount.to_string()))?;
    let frac_value = if frac_part.is_empty() {
        U256::zero()
    } else {
        let padded = format!("{:0<width$}", frac_part, width = DECIMALS);
        U256::from_dec_str(&padded).map_err(|_| Error::InvalidAmount(amount.to_string()))?
    };
    int_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| Error::InvalidAmount(format!("{} overflows", amount)))
}

/// Render base units as a decimal string without trailing zeros.
pub fn format_units(amount: U256) -> String {
    let scale = U256::exp10(DECIMALS);
    let int_part = amount / scale;
    let frac_part = amount % scale;
    if frac_part.is_zero() {
        return int_part.to_string();
    }
    let frac = format!("{:0>width$}", frac_part.to_string(), width = DECIMALS);
    format!("{}.{}", int_part, frac.trim_end_matches('0'))
}

/// Lossy conversion for display arithmetic.
pub fn to_display(amount: U256) -> f64 {
    format_units(amount).parse::<f64>().unwrap_or(0.0)
}

/// Whole tokens in base units.
pub fn units(tokens: u64) -> U256 {
    U256::from(tokens) * U256::exp10(DECIMALS)
}

pub fn short_address(addr: &Address) -> String {
    let full = format!("{:?}", addr);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

/// `None` for an empty or all-zero address.
pub fn parse_optional_address(raw: &str) -> Result<Option<Address>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let addr = Address::from_str(raw.trim_start_matches("0x"))
        .map_err(|e| Error::Config(format!("bad address {}: {}", raw, e)))?;
    if addr.is_zero() {
        Ok(None)
    } else {
        Ok(Some(addr))
    }
}

pub fn get_timestamp() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Aborts the background task when dropped, tying it to its owner's lifetime.
#[derive(Debug)]
pub struct TaskGuard(tokio::task::JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        TaskGuard(tokio::spawn(fut))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_units() {
        assert_eq!(parse_units("1.5").unwrap(), U256::from(15u64) * U256::exp10(17));
        assert_eq!(parse_units("200").unwrap(), units(200));
        assert_eq!(parse_units(".25").unwrap(), U256::from(25u64) * U256::exp10(16));
        assert_eq!(format_units(units(700)), "700");
        assert_eq!(format_units(parse_units("0.0001").unwrap()), "0.0001");
        assert!(parse_units("").is_err());
        assert!(parse_units("1.2.3").is_err());
        assert!(parse_units("-4").is_err());
        assert!(parse_units("0.0000000000000000001").is_err());
        assert_eq!(to_display(parse_units("12.75").unwrap()), 12.75);
    }

    #[test]
    fn optional_address() {
        assert_eq!(parse_optional_address("").unwrap(), None);
        assert_eq!(
            parse_optional_address("0x0000000000000000000000000000000000000000").unwrap(),
            None
        );
        let addr = parse_optional_address("0x81A1F0EaAe2a930B3CE1477e67500db7C6cA5719").unwrap();
        assert!(addr.is_some());
        assert_eq!(short_address(&addr.unwrap()), "0x81a1...5719");
        assert!(parse_optional_address("0xnothex").is_err());
    }

    #[test]
    fn keypair_from_secret() {
        let (_sk, addr) =
            extract_keypair_from_str("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318").unwrap();
        assert_eq!(
            format!("{:?}", addr),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
        assert!(extract_keypair_from_str("zz").is_err());
    }
}
