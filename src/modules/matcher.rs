//! Match Engine - classifies a transfer against the active whale roster

use serde::Serialize;
use std::fmt;

use crate::modules::poller::TransferEvent;
use crate::modules::registry::{WhaleEntry, WhaleSnapshot};
use crate::utils::address::{is_burn_address, ZERO_ADDRESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Mint,
    Burn,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Mint => "MINT",
            Direction::Burn => "BURN",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Direction::Buy => "🟢",
            Direction::Sell => "🔴",
            Direction::Mint => "🪙",
            Direction::Burn => "🔥",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of matching one transfer. Mint and burn carry the whale on the non-null side when
/// there is one.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Buy(WhaleEntry),
    Sell(WhaleEntry),
    Mint(Option<WhaleEntry>),
    Burn(Option<WhaleEntry>),
    Ignore,
}

impl Classification {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Classification::Buy(_) => Some(Direction::Buy),
            Classification::Sell(_) => Some(Direction::Sell),
            Classification::Mint(_) => Some(Direction::Mint),
            Classification::Burn(_) => Some(Direction::Burn),
            Classification::Ignore => None,
        }
    }

    pub fn whale(&self) -> Option<&WhaleEntry> {
        match self {
            Classification::Buy(whale) | Classification::Sell(whale) => Some(whale),
            Classification::Mint(whale) | Classification::Burn(whale) => whale.as_ref(),
            Classification::Ignore => None,
        }
    }
}

/// Classify `event` against one roster snapshot. First match wins:
/// zero sender is a mint, zero or dead recipient is a burn, a whale sender is a sell,
/// a whale recipient is a buy. Whale-to-whale transfers therefore report as a sell.
pub fn classify(event: &TransferEvent, snapshot: &WhaleSnapshot) -> Classification {
    if event.from == ZERO_ADDRESS {
        return Classification::Mint(snapshot.get(&event.to).cloned());
    }
    if is_burn_address(&event.to) {
        return Classification::Burn(snapshot.get(&event.from).cloned());
    }
    if let Some(whale) = snapshot.get(&event.from) {
        return Classification::Sell(whale.clone());
    }
    if let Some(whale) = snapshot.get(&event.to) {
        return Classification::Buy(whale.clone());
    }
    Classification::Ignore
}
