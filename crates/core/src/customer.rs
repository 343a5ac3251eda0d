//! Local customer record.
//!
//! This is the local side of the synchronization: the handlers read a
//! [`Customer`], reconcile it against the remote profile and write the
//! synchronized fields back through the record store.

use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::phone::Phone;

/// Prefix of locally generated card numbers.
pub const CARD_NUMBER_PREFIX: &str = "8600";
/// Total number of digits in a generated card number.
pub const CARD_NUMBER_LENGTH: usize = 16;
/// Number of digits in a generated card track.
pub const CARD_TRACK_LENGTH: usize = 20;

/// Customer gender as understood by the loyalty backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other(String),
}

impl Gender {
    /// Map the remote representation (`1`/`2`/free text) to a gender.
    pub fn from_remote(value: &str) -> Option<Self> {
        let candidate = value.trim().to_lowercase();
        match candidate.as_str() {
            "" => None,
            "1" | "male" | "m" | "man" => Some(Self::Male),
            "2" | "female" | "f" | "woman" => Some(Self::Female),
            _ => Some(Self::Other(candidate)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other(value) => value,
        }
    }
}

/// A physical/virtual loyalty card bound to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerCard {
    pub card_number: String,
    pub card_track: String,
    pub remote_card_id: Option<String>,
}

/// Number + track pair for a card that is about to be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    pub card_number: String,
    pub card_track: String,
}

impl CardIdentity {
    /// Generate a fresh card number (`8600` + 12 digits) and a 20-digit track.
    ///
    /// Uniqueness is enforced by the record store; callers retry on conflict.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let suffix_len = CARD_NUMBER_LENGTH - CARD_NUMBER_PREFIX.len();
        let card_number = format!("{CARD_NUMBER_PREFIX}{}", random_digits(rng, suffix_len));
        let card_track = random_digits(rng, CARD_TRACK_LENGTH);
        Self {
            card_number,
            card_track,
        }
    }
}

fn random_digits<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Normalize a card number received from the remote side (digits only).
pub fn normalize_card_number(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Local customer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: UserId,
    pub phone: Phone,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub middle_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub email: Option<String>,
    pub is_deleted: bool,
    /// Customer id assigned by the loyalty backend.
    pub remote_customer_id: Option<String>,
    /// Wallet id assigned by the loyalty backend. Unique across customers.
    pub remote_wallet_id: Option<String>,
    /// Cashback balance in minor units; `None` until the first wallet sync.
    pub cashback_balance_minor: Option<i64>,
    /// Profile fields that still need to be pushed to the remote side.
    pub pending_profile_update: Option<Map<String, Value>>,
    pub cards: Vec<CustomerCard>,
}

impl Customer {
    pub fn new(id: UserId, phone: Phone) -> Self {
        Self {
            id,
            phone,
            name: None,
            surname: None,
            middle_name: None,
            date_of_birth: None,
            gender: None,
            email: None,
            is_deleted: false,
            remote_customer_id: None,
            remote_wallet_id: None,
            cashback_balance_minor: None,
            pending_profile_update: None,
            cards: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn has_pending_profile_update(&self) -> bool {
        self.pending_profile_update
            .as_ref()
            .is_some_and(|pending| !pending.is_empty())
    }

    /// Merge profile changes into the pending update, skipping `null` values.
    pub fn queue_profile_update(&mut self, updates: Map<String, Value>) {
        let pending = self.pending_profile_update.get_or_insert_with(Map::new);
        for (key, value) in updates {
            if value.is_null() {
                continue;
            }
            pending.insert(key, value);
        }
    }

    /// Add or refresh a card mirrored from the remote side.
    ///
    /// Returns `true` when a new card was added.
    pub fn upsert_card(&mut self, card: CustomerCard) -> bool {
        if let Some(existing) = self
            .cards
            .iter_mut()
            .find(|c| c.card_number == card.card_number)
        {
            existing.card_track = card.card_track;
            if card.remote_card_id.is_some() {
                existing.remote_card_id = card.remote_card_id;
            }
            return false;
        }
        self.cards.push(card);
        true
    }
}

/// Fill `slot` with a cleaned `value` if the slot is currently empty.
///
/// Returns `true` when the slot changed.
pub fn fill_if_missing(slot: &mut Option<String>, value: Option<&str>) -> bool {
    if slot.as_deref().is_some_and(|s| !s.trim().is_empty()) {
        return false;
    }
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(cleaned) => {
            *slot = Some(cleaned.to_string());
            true
        }
        None => false,
    }
}

/// Parse a decimal money amount (`"1250.5"`, `"-3"`, `"1e3"`) into minor
/// units, rounding half to even at two fractional digits.
pub fn parse_minor_units(raw: &str) -> DomainResult<i64> {
    let text = raw.trim();
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => {
            let exponent: i64 = unsigned[at + 1..]
                .parse()
                .map_err(|_| DomainError::invalid_amount(raw))?;
            (&unsigned[..at], exponent)
        }
        None => (unsigned, 0),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let valid = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !valid(whole) || !valid(fraction) {
        return Err(DomainError::invalid_amount(raw));
    }

    // value = digits * 10^(exponent - fraction.len()); minor units shift by two more.
    let digits = format!("{whole}{fraction}");
    let digits = digits.trim_start_matches('0');
    let scale = exponent.saturating_sub(fraction.len() as i64).saturating_add(2);
    let out_of_range = || DomainError::invalid_amount(format!("{raw} (out of range)"));

    let magnitude: i128 = if digits.is_empty() {
        0
    } else if scale >= 0 {
        let scale = u32::try_from(scale).map_err(|_| out_of_range())?;
        let base: i128 = digits.parse().map_err(|_| out_of_range())?;
        10i128
            .checked_pow(scale)
            .and_then(|factor| base.checked_mul(factor))
            .ok_or_else(out_of_range)?
    } else {
        let cut = usize::try_from(scale.unsigned_abs()).unwrap_or(usize::MAX);
        round_half_even(digits, cut).ok_or_else(out_of_range)?
    };

    let minor = i64::try_from(magnitude).map_err(|_| out_of_range())?;
    Ok(if negative { -minor } else { minor })
}

/// Drop the last `cut` digits of `digits`, rounding half to even.
fn round_half_even(digits: &str, cut: usize) -> Option<i128> {
    if cut > digits.len() {
        return Some(0);
    }
    let (kept, dropped) = digits.split_at(digits.len() - cut);
    let kept: i128 = if kept.is_empty() { 0 } else { kept.parse().ok()? };

    let mut dropped = dropped.bytes();
    let round_up = match dropped.next() {
        Some(d) if d > b'5' => true,
        Some(b'5') => dropped.any(|d| d != b'0') || kept % 2 == 1,
        _ => false,
    };
    if round_up { kept.checked_add(1) } else { Some(kept) }
}
