//! Response payloads of the loyalty API.
//!
//! The remote side is loose about field names and value types, so most
//! fields accept several spellings and the accessors normalise them.

use chrono::{NaiveDate, NaiveDateTime};
use loyaltysync_core::customer::{normalize_card_number, parse_minor_units};
use loyaltysync_core::{CustomerCard, DomainResult, Gender};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wallet type carrying the cashback balance.
pub const CASHBACK_WALLET_TYPE: i64 = 1;

const BIRTHDAY_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// A remote customer profile as returned by lookup and create/update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, alias = "customerId")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "middle_name")]
    pub middle_name: Option<String>,
    #[serde(default, alias = "lastName", alias = "familyName")]
    pub surname: Option<String>,
    #[serde(default, alias = "full_name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub birthday: Option<String>,
    #[serde(default)]
    pub sex: Value,
    #[serde(default)]
    pub gender: Value,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_deleted: Value,
    #[serde(default)]
    pub wallet_balances: Option<Vec<WalletBalance>>,
    #[serde(default)]
    pub cards: Option<Vec<RemoteCard>>,
}

impl Profile {
    pub fn customer_id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    pub fn wallets(&self) -> &[WalletBalance] {
        self.wallet_balances.as_deref().unwrap_or_default()
    }

    /// Id of the first wallet that carries one.
    pub fn wallet_id(&self) -> Option<&str> {
        self.wallets().iter().find_map(WalletBalance::wallet_id)
    }

    /// The cashback wallet, or the first wallet when none is typed as such.
    pub fn cashback_wallet(&self) -> Option<&WalletBalance> {
        let wallets = self.wallets();
        wallets
            .iter()
            .find(|w| w.wallet_type == Some(CASHBACK_WALLET_TYPE))
            .or_else(|| wallets.first())
    }

    pub fn remote_cards(&self) -> &[RemoteCard] {
        self.cards.as_deref().unwrap_or_default()
    }

    /// `name middleName surname`, falling back to `fullName`.
    pub fn composed_name(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.name, &self.middle_name, &self.surname]
            .into_iter()
            .filter_map(|part| non_empty(part.as_deref()))
            .collect();
        if parts.is_empty() {
            return non_empty(self.full_name.as_deref()).map(str::to_string);
        }
        Some(parts.join(" "))
    }

    pub fn middle_name(&self) -> Option<&str> {
        non_empty(self.middle_name.as_deref())
    }

    pub fn surname(&self) -> Option<&str> {
        non_empty(self.surname.as_deref())
    }

    pub fn email(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
    }

    pub fn is_deleted(&self) -> bool {
        match &self.is_deleted {
            Value::Bool(flag) => *flag,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y"),
            _ => false,
        }
    }

    pub fn gender(&self) -> Option<Gender> {
        let raw = if truthy(&self.sex) { &self.sex } else { &self.gender };
        match raw {
            Value::String(s) => Gender::from_remote(s),
            Value::Number(n) => Gender::from_remote(&n.to_string()),
            Value::Bool(b) => Gender::from_remote(&b.to_string()),
            _ => None,
        }
    }

    pub fn birthday(&self) -> Option<NaiveDate> {
        parse_birthday(self.birthday.as_deref()?)
    }
}

/// One entry of `walletBalances`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default, rename = "type")]
    pub wallet_type: Option<i64>,
    #[serde(default)]
    pub balance: Value,
    #[serde(default)]
    pub available_balance: Value,
    #[serde(default)]
    pub amount: Value,
}

impl WalletBalance {
    pub fn wallet_id(&self) -> Option<&str> {
        non_empty(self.id.as_deref()).or_else(|| non_empty(self.wallet_id.as_deref()))
    }

    /// Balance in minor units; `Ok(None)` when the wallet reports none.
    pub fn balance_minor(&self) -> DomainResult<Option<i64>> {
        let raw = [&self.balance, &self.available_balance, &self.amount]
            .into_iter()
            .find(|v| !v.is_null());
        match raw {
            None => Ok(None),
            Some(Value::String(s)) => parse_minor_units(s).map(Some),
            Some(other) => parse_minor_units(&other.to_string()).map(Some),
        }
    }
}

/// A card already bound to the remote profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCard {
    #[serde(default, alias = "cardId")]
    pub id: Option<String>,
    #[serde(default, alias = "cardNumber")]
    pub number: Option<String>,
    #[serde(default, alias = "cardTrack")]
    pub track: Option<String>,
}

impl RemoteCard {
    /// The local form of this card, when it has both a number and a track.
    pub fn to_local(&self) -> Option<CustomerCard> {
        let card_number = normalize_card_number(self.number.as_deref()?)?;
        let card_track = non_empty(self.track.as_deref())?.to_string();
        Some(CustomerCard {
            card_number,
            card_track,
            remote_card_id: non_empty(self.id.as_deref()).map(str::to_string),
        })
    }
}

/// Response of the card issue call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardRef {
    #[serde(default, alias = "cardId")]
    pub id: Option<String>,
}

/// Access token response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "expiresIn")]
    pub expires_in_camel: Value,
    #[serde(default)]
    pub expires: Value,
    #[serde(default)]
    pub expires_in: Value,
}

impl TokenResponse {
    /// Lifetime in seconds, from the first usable expiry field.
    pub fn lifetime_secs(&self) -> Option<u64> {
        [&self.expires_in_camel, &self.expires, &self.expires_in]
            .into_iter()
            .find_map(|value| match value {
                Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
                Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
                    s.parse().ok()
                }
                _ => None,
            })
    }
}

/// Format a local birthday the way the remote side stores it.
pub fn format_birthday(date: NaiveDate) -> String {
    format!("{}T00:00:00.000", date.format("%Y-%m-%d"))
}

fn parse_birthday(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(cleaned, "%Y-%m-%d") {
        return Some(date);
    }
    BIRTHDAY_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cleaned, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(cleaned)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn profile(value: Value) -> Profile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn reads_alternate_field_spellings() {
        let p = profile(json!({
            "customerId": "c-1",
            "name": "Aziz",
            "middle_name": "B",
            "lastName": "Karimov",
            "walletBalances": [
                {"walletId": "w-2", "type": 2, "balance": 5},
                {"id": "w-1", "type": 1, "availableBalance": "1250.50"}
            ],
            "cards": [{"cardNumber": "8600 0000 0000 0001", "cardTrack": "123", "cardId": "rc-1"}]
        }));

        assert_eq!(p.customer_id(), Some("c-1"));
        assert_eq!(p.composed_name().as_deref(), Some("Aziz B Karimov"));
        assert_eq!(p.wallet_id(), Some("w-2"));

        let cashback = p.cashback_wallet().unwrap();
        assert_eq!(cashback.wallet_id(), Some("w-1"));
        assert_eq!(cashback.balance_minor().unwrap(), Some(125_050));

        let card = p.remote_cards()[0].to_local().unwrap();
        assert_eq!(card.card_number, "8600000000000001");
        assert_eq!(card.remote_card_id.as_deref(), Some("rc-1"));
    }

    #[test]
    fn falls_back_to_full_name_and_first_wallet() {
        let p = profile(json!({
            "fullName": "  Dilnoza Y  ",
            "walletBalances": [{"id": "w-9", "balance": 12.5}]
        }));
        assert_eq!(p.composed_name().as_deref(), Some("Dilnoza Y"));
        assert_eq!(p.cashback_wallet().unwrap().balance_minor().unwrap(), Some(1_250));
        assert_eq!(profile(json!({})).composed_name(), None);
    }

    #[test]
    fn numeric_balances_tolerate_float_noise_and_extra_precision() {
        let balance = |value: Value| {
            profile(json!({"walletBalances": [{"id": "w-1", "type": 1, "balance": value}]}))
                .cashback_wallet()
                .unwrap()
                .balance_minor()
                .unwrap()
        };

        assert_eq!(balance(json!(1250.125)), Some(125_012));
        assert_eq!(balance(json!(0.30000000000000004)), Some(30));
        assert_eq!(balance(json!(1e3)), Some(100_000));
        assert_eq!(balance(json!("1e3")), Some(100_000));
    }

    #[test]
    fn deleted_flag_accepts_loose_values() {
        for (raw, expected) in [
            (json!(true), true),
            (json!(1), true),
            (json!(0), false),
            (json!("Yes"), true),
            (json!("no"), false),
            (json!(null), false),
        ] {
            assert_eq!(profile(json!({"isDeleted": raw})).is_deleted(), expected);
        }
    }

    #[test]
    fn parses_birthday_formats() {
        let expected = NaiveDate::from_ymd_opt(1990, 5, 17).unwrap();
        for raw in [
            "1990-05-17",
            "1990-05-17 00:00:00",
            "1990-05-17 00:00:00.000",
            "1990-05-17T00:00:00",
            "1990-05-17T00:00:00.000",
            "1990-05-17T00:00:00+05:00",
        ] {
            assert_eq!(parse_birthday(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_birthday("17.05.1990"), None);
        assert_eq!(format_birthday(expected), "1990-05-17T00:00:00.000");
    }

    #[test]
    fn gender_prefers_sex_field() {
        assert_eq!(profile(json!({"sex": 2, "gender": "male"})).gender(), Some(Gender::Female));
        assert_eq!(profile(json!({"gender": "m"})).gender(), Some(Gender::Male));
        assert_eq!(profile(json!({})).gender(), None);
    }

    #[test]
    fn token_lifetime_reads_numbers_and_digit_strings() {
        let parse = |v: Value| serde_json::from_value::<TokenResponse>(v).unwrap().lifetime_secs();
        assert_eq!(parse(json!({"token": "t", "expiresIn": 600})), Some(600));
        assert_eq!(parse(json!({"token": "t", "expires_in": "120"})), Some(120));
        assert_eq!(parse(json!({"token": "t", "expires": "soon"})), None);
    }
}
