//! Address helpers shared by the roster and the matcher

use alloy_primitives::{address, Address};
use std::str::FromStr;

/// Mint source / burn sink.
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// Conventional burn sink (`0x...dEaD`).
pub const DEAD_ADDRESS: Address = address!("000000000000000000000000000000000000dead");

/// Addresses that are never whales and that terminate a burn.
pub fn is_burn_address(addr: &Address) -> bool {
    *addr == ZERO_ADDRESS || *addr == DEAD_ADDRESS
}

/// Parse an address in any letter case. The parsed value is byte-equal regardless of
/// the input case, so it is the canonical key for roster lookups.
pub fn parse_address(raw: &str) -> Option<Address> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") && !trimmed.starts_with("0X") {
        return None;
    }
    Address::from_str(&trimmed[2..]).ok()
}

/// EIP-55 checksum rendering.
pub fn checksum(addr: &Address) -> String {
    addr.to_checksum(None)
}

/// Shorten an address for display
pub fn shorten_address(addr: &Address, chars: usize) -> String {
    let full = checksum(addr);
    if full.len() <= chars * 2 + 2 {
        return full;
    }
    format!("{}...{}", &full[..chars + 2], &full[full.len() - chars..])
}
