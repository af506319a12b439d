use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Unix milliseconds.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Identifier normalization ─────────────────────────────────────

/// Trim an identifier. Empty means absent.
pub fn normalize_ident(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a JSON identifier so `482`, `482.0` and `"482"` compare equal.
pub fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => normalize_ident(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Some((f as i64).to_string())
                    }
                    _ => Some(n.to_string()),
                }
            }
        }
        _ => None,
    }
}

fn de_ident<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(normalize_value))
}

/// Identifier list of mixed strings and numbers; blanks are dropped.
pub(crate) fn de_ident_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(d)?.unwrap_or_default();
    Ok(values.iter().filter_map(normalize_value).collect())
}

/// One identifier of a sub-unit. Inventory ids and human numbers are separate
/// namespaces: inventory `"12"` never matches room number `"12"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HoldIdent {
    Inventory(String),
    Number(String),
}

/// Normalized identity of a hold. At least one field is always present.
///
/// Derived equality is structural; use [`HoldKey::matches`] for the
/// "either id scheme" comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    inventory_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<String>,
}

impl HoldKey {
    /// Returns `None` when neither identifier survives normalization.
    pub fn new(inventory_id: Option<&str>, number: Option<&str>) -> Option<Self> {
        let inventory_id = inventory_id.and_then(normalize_ident);
        let number = number.and_then(normalize_ident);
        if inventory_id.is_none() && number.is_none() {
            return None;
        }
        Some(Self { inventory_id, number })
    }

    pub fn from_inventory_id(id: &str) -> Option<Self> {
        Self::new(Some(id), None)
    }

    pub fn from_number(number: &str) -> Option<Self> {
        Self::new(None, Some(number))
    }

    pub fn inventory_id(&self) -> Option<&str> {
        self.inventory_id.as_deref()
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    /// True if the inventory ids or the numbers are equal.
    pub fn matches(&self, other: &HoldKey) -> bool {
        let same_id = matches!((&self.inventory_id, &other.inventory_id), (Some(a), Some(b)) if a == b);
        let same_number = matches!((&self.number, &other.number), (Some(a), Some(b)) if a == b);
        same_id || same_number
    }

    pub fn idents(&self) -> impl Iterator<Item = HoldIdent> + '_ {
        let id = self.inventory_id.iter().map(|s| HoldIdent::Inventory(s.clone()));
        let number = self.number.iter().map(|s| HoldIdent::Number(s.clone()));
        id.chain(number)
    }
}

impl fmt::Display for HoldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.inventory_id, &self.number) {
            (Some(id), Some(no)) => write!(f, "inv:{id}/no:{no}"),
            (Some(id), None) => write!(f, "inv:{id}"),
            (None, Some(no)) => write!(f, "no:{no}"),
            (None, None) => write!(f, "<none>"),
        }
    }
}

/// A reservable unit and the date range being viewed. Dates are compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StayQuery {
    pub unit_id: String,
    pub start_date: String,
    pub end_date: String,
}

impl StayQuery {
    pub fn new(unit_id: impl Into<String>, start_date: impl Into<String>, end_date: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            start_date: start_date.into(),
            end_date: end_date.into(),
        }
    }
}

impl fmt::Display for StayQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}..{}]", self.unit_id, self.start_date, self.end_date)
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubUnitStatus {
    Available,
    Occupied,
    Other,
}

impl SubUnitStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "available" => SubUnitStatus::Available,
            "occupied" => SubUnitStatus::Occupied,
            _ => SubUnitStatus::Other,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubUnitWire {
    #[serde(default, deserialize_with = "de_ident", alias = "inventory_id")]
    inventory_id: Option<String>,
    #[serde(default, deserialize_with = "de_ident", alias = "roomNumber")]
    number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_available: Option<bool>,
    #[serde(default)]
    check_in: Option<String>,
    #[serde(default)]
    check_out: Option<String>,
}

/// An individually bookable item within a unit, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SubUnitWire")]
pub struct SubUnit {
    pub inventory_id: Option<String>,
    pub number: Option<String>,
    pub status: SubUnitStatus,
    pub is_available: bool,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
}

impl From<SubUnitWire> for SubUnit {
    fn from(w: SubUnitWire) -> Self {
        let status = w
            .status
            .as_deref()
            .map(SubUnitStatus::parse)
            .unwrap_or(SubUnitStatus::Other);
        Self {
            inventory_id: w.inventory_id,
            number: w.number,
            status,
            is_available: w.is_available.unwrap_or(status == SubUnitStatus::Available),
            check_in: w.check_in,
            check_out: w.check_out,
        }
    }
}

impl SubUnit {
    /// `None` for a sub-unit with neither identifier; such a sub-unit can never be held.
    pub fn key(&self) -> Option<HoldKey> {
        HoldKey::new(self.inventory_id.as_deref(), self.number.as_deref())
    }
}

/// Server-reported availability for one unit and date range. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySnapshot {
    #[serde(default)]
    pub total_units: u32,
    #[serde(default)]
    pub available_units: u32,
    #[serde(default)]
    pub occupied_units: u32,
    #[serde(default, alias = "rooms")]
    pub sub_units: Vec<SubUnit>,
}

// ── Durable record ───────────────────────────────────────────────

/// A confirmed hold as written to profile storage. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHoldRecord {
    pub unit_id: String,
    #[serde(default, deserialize_with = "de_ident", skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
    #[serde(default, deserialize_with = "de_ident", skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub timestamp: Ms,
}

impl PersistedHoldRecord {
    pub fn new(query: &StayQuery, key: &HoldKey, timestamp: Ms) -> Self {
        Self {
            unit_id: query.unit_id.clone(),
            inventory_id: key.inventory_id().map(str::to_string),
            number: key.number().map(str::to_string),
            start_date: query.start_date.clone(),
            end_date: query.end_date.clone(),
            timestamp,
        }
    }

    pub fn key(&self) -> Option<HoldKey> {
        HoldKey::new(self.inventory_id.as_deref(), self.number.as_deref())
    }

    /// Exact unit + date-range match and younger than `ttl_ms`. A timestamp
    /// more than `ttl_ms` in the future, or too far out to subtract, is expired.
    pub fn is_valid_for(&self, query: &StayQuery, now: Ms, ttl_ms: Ms) -> bool {
        self.unit_id == query.unit_id
            && self.start_date == query.start_date
            && self.end_date == query.end_date
            && now
                .checked_sub(self.timestamp)
                .is_some_and(|age| age < ttl_ms && age > -ttl_ms)
    }
}
