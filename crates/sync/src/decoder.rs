//! Classification of raw transactions into typed messages.

use stakeidx_operations::config::DecoderConfig;

use crate::client::{RawEvent, RawTransaction};
use crate::error::DecodeError;

const STAKER_KEYS: &[&str] = &["staker", "staker_address", "delegator"];
const PROVIDER_KEYS: &[&str] = &["finality_providers", "finality_provider", "validator"];
const SENDER_KEYS: &[&str] = &["sender", "from"];
const RECEIVER_KEYS: &[&str] = &["recipient", "receiver", "to"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeMessage {
    pub staker: String,
    pub finality_providers: Vec<String>,
    pub amount: u64,
    pub denom: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Stake(StakeMessage),
    Unstake {
        staker: String,
        amount: u64,
        denom: String,
    },
    Transfer {
        sender: String,
        receiver: String,
        amount: u64,
        denom: String,
    },
    Reward {
        receiver: String,
        amount: u64,
        denom: String,
    },
    /// Nothing the indexer tracks; carries the first event type seen.
    Other(String),
}

/// A transaction classified by its first recognized event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub tx_id: String,
    pub height: u64,
    pub timestamp: u64,
    pub kind: MessageKind,
}

impl DecodedMessage {
    pub fn as_stake(&self) -> Option<&StakeMessage> {
        match &self.kind {
            MessageKind::Stake(stake) => Some(stake),
            _ => None,
        }
    }
}

/// Turns a node transaction into a [`DecodedMessage`].
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, raw: &RawTransaction) -> Result<DecodedMessage, DecodeError>;
}

/// Decoder driven by event type names.
///
/// Events are matched in order; the first one whose type appears in one of the
/// configured lists decides the message kind.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    config: DecoderConfig,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl EventDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    fn classify(&self, event: &RawEvent) -> Result<Option<MessageKind>, DecodeError> {
        if listed(&self.config.stake_events, &event.kind) {
            let staker = required(event, STAKER_KEYS, "staker")?;
            let providers = required(event, PROVIDER_KEYS, "finality_provider")?;
            let (amount, denom) = parse_amount(required(event, &["amount"], "amount")?)?;
            // A bare amount does not carry the configured denom either.
            if let Some(expected) = &self.config.stake_denom {
                if denom != *expected {
                    return Err(DecodeError::UnexpectedDenom {
                        found: denom,
                        expected: expected.clone(),
                    });
                }
            }
            let finality_providers: Vec<String> = providers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if finality_providers.is_empty() {
                return Err(DecodeError::MissingAttribute {
                    event: event.kind.clone(),
                    attribute: "finality_provider",
                });
            }
            return Ok(Some(MessageKind::Stake(StakeMessage {
                staker: staker.to_string(),
                finality_providers,
                amount,
                denom,
            })));
        }

        if listed(&self.config.unstake_events, &event.kind) {
            let staker = required(event, STAKER_KEYS, "staker")?;
            let (amount, denom) = parse_amount(required(event, &["amount"], "amount")?)?;
            return Ok(Some(MessageKind::Unstake {
                staker: staker.to_string(),
                amount,
                denom,
            }));
        }

        if listed(&self.config.transfer_events, &event.kind) {
            let sender = required(event, SENDER_KEYS, "sender")?;
            let receiver = required(event, RECEIVER_KEYS, "recipient")?;
            let (amount, denom) = parse_amount(required(event, &["amount"], "amount")?)?;
            return Ok(Some(MessageKind::Transfer {
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                amount,
                denom,
            }));
        }

        if listed(&self.config.reward_events, &event.kind) {
            let receiver = required(event, &["receiver", "delegator", "recipient"], "receiver")?;
            let (amount, denom) = parse_amount(required(event, &["amount"], "amount")?)?;
            return Ok(Some(MessageKind::Reward {
                receiver: receiver.to_string(),
                amount,
                denom,
            }));
        }

        Ok(None)
    }
}

impl MessageDecoder for EventDecoder {
    fn decode(&self, raw: &RawTransaction) -> Result<DecodedMessage, DecodeError> {
        let timestamp = raw
            .timestamp
            .ok_or_else(|| DecodeError::MissingTimestamp(raw.hash.clone()))?;

        let mut kind = None;
        for event in &raw.events {
            if let Some(found) = self.classify(event)? {
                kind = Some(found);
                break;
            }
        }
        let kind = kind.unwrap_or_else(|| {
            MessageKind::Other(
                raw.events
                    .first()
                    .map(|e| e.kind.clone())
                    .unwrap_or_default(),
            )
        });

        Ok(DecodedMessage {
            tx_id: raw.hash.clone(),
            height: raw.height,
            timestamp,
            kind,
        })
    }
}

fn listed(kinds: &[String], kind: &str) -> bool {
    kinds.iter().any(|k| k == kind)
}

fn required<'a>(
    event: &'a RawEvent,
    keys: &[&str],
    name: &'static str,
) -> Result<&'a str, DecodeError> {
    event
        .any_attribute(keys)
        .ok_or_else(|| DecodeError::MissingAttribute {
            event: event.kind.clone(),
            attribute: name,
        })
}

/// Parse a coin string such as `"1000ubbn"` or `"250"`.
///
/// Multi-coin strings keep only the first coin.
pub fn parse_amount(raw: &str) -> Result<(u64, String), DecodeError> {
    let coin = raw.split(',').next().unwrap_or_default().trim();
    let digits_end = coin
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(coin.len());
    if digits_end == 0 {
        return Err(DecodeError::InvalidAmount(raw.to_string()));
    }
    let amount = coin[..digits_end]
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidAmount(raw.to_string()))?;
    Ok((amount, coin[digits_end..].to_string()))
}
