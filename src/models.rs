//! Recovery records and the identity rules the cache merges them by.
//!
//! A record is identified by its server id once confirmed. Before that it
//! carries a `temp-<epoch millis>` id plus a client request id, and the
//! cache falls back to a content fingerprint to spot the server's copy.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Prefix of locally generated identifiers that the server has never seen.
pub const TEMP_ID_PREFIX: &str = "temp-";

// ---------------------------------------------------------------------------
// Temporary identifiers
// ---------------------------------------------------------------------------

/// Build a temporary id encoding `now` in epoch milliseconds.
pub fn new_temp_id(now: DateTime<Utc>) -> String {
    format!("{TEMP_ID_PREFIX}{}", now.timestamp_millis())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Creation time embedded in a temporary id. `None` for permanent ids and
/// for temporary ids whose numeric segment does not parse.
pub fn temp_id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let rest = id.strip_prefix(TEMP_ID_PREFIX)?;
    let millis: i64 = rest.split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse the timestamp shapes the API returns: RFC 3339, a naive
/// `YYYY-MM-DD HH:MM:SS`, or a bare date (taken as midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Cached record contract
// ---------------------------------------------------------------------------

/// A row the cache can hold in its optimistic queue and merge against the
/// server's list.
pub trait CachedRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn record_id(&self) -> &str;

    fn set_record_id(&mut self, id: String);

    /// Content key used to recognise a pending row once the server has
    /// assigned it a permanent id.
    fn fingerprint(&self) -> String;

    fn client_request_id(&self) -> Option<&str> {
        None
    }

    fn set_client_request_id(&mut self, _id: String) {}

    fn created_at(&self) -> Option<&str> {
        None
    }

    /// JSON body for create/update requests. Drops the local id.
    fn to_payload(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Value::Object(ref mut map) = body {
            map.remove("id");
        }
        body
    }

    /// When the row entered the optimistic queue. The temp id wins over
    /// `created_at`.
    fn pending_since(&self) -> Option<DateTime<Utc>> {
        temp_id_timestamp(self.record_id()).or_else(|| self.created_at().and_then(parse_timestamp))
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// A payment collected from a credit customer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recovery {
    #[serde(default, deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub credit_customer_id: Option<String>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub recovery_date: Option<String>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub received_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub discount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub pending_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub balance_amount: Option<f64>,
    #[serde(default)]
    pub payment_mode: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub shift: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub employee_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub client_request_id: Option<String>,
    /// Server columns this client does not model, kept so rows survive a
    /// save/load cycle untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CachedRecord for Recovery {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn set_record_id(&mut self, id: String) {
        self.id = id;
    }

    fn fingerprint(&self) -> String {
        recovery_fingerprint(
            self.customer_name.as_deref(),
            self.recovery_date.as_deref(),
            self.received_amount,
        )
    }

    fn client_request_id(&self) -> Option<&str> {
        self.client_request_id.as_deref().filter(|s| !s.is_empty())
    }

    fn set_client_request_id(&mut self, id: String) {
        self.client_request_id = Some(id);
    }

    fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }

    /// Temp id, then `created_at`, then the recovery date, so an entry whose
    /// id carries no time still ages out.
    fn pending_since(&self) -> Option<DateTime<Utc>> {
        temp_id_timestamp(&self.id)
            .or_else(|| self.created_at.as_deref().and_then(parse_timestamp))
            .or_else(|| self.recovery_date.as_deref().and_then(parse_timestamp))
    }

    /// Domain fields without the local id and the server-owned timestamp.
    fn to_payload(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Value::Object(ref mut map) = body {
            map.remove("id");
            map.remove("created_at");
            map.insert("created_by".into(), Value::Null);
        }
        body
    }
}

/// `counterparty|date|amount`, with the date cut to `YYYY-MM-DD` and the
/// amount rendered to two decimals so `50`, `50.0` and `"50.00"` agree.
pub fn recovery_fingerprint(
    customer_name: Option<&str>,
    recovery_date: Option<&str>,
    received_amount: Option<f64>,
) -> String {
    let name = customer_name.map(str::trim).unwrap_or_default();
    let date: String = recovery_date
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .take(10)
        .collect();
    format!("{name}|{date}|{:.2}", received_amount.unwrap_or(0.0))
}

// ---------------------------------------------------------------------------
// Form draft
// ---------------------------------------------------------------------------

/// Raw recovery form input, every field as typed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryDraft {
    #[serde(default)]
    pub credit_customer_id: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub recovery_date: String,
    #[serde(default)]
    pub pending_amount: String,
    #[serde(default)]
    pub received_amount: String,
    #[serde(default)]
    pub discount: String,
    /// Set only when the operator overrode the computed balance.
    #[serde(default)]
    pub balance_amount: Option<String>,
    #[serde(default)]
    pub payment_mode: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub shift: String,
    #[serde(default)]
    pub employee_id: String,
    #[serde(default)]
    pub employee_name: String,
}

impl RecoveryDraft {
    /// Normalise the form into a record body.
    ///
    /// `display_names` maps customer ids to organisation names and stands in
    /// when the customer list could not be loaded. `existing` is the row
    /// being edited, whose organisation name is preferred.
    pub fn into_recovery(
        self,
        display_names: &BTreeMap<String, String>,
        existing: Option<&Recovery>,
        today: NaiveDate,
    ) -> Recovery {
        let received = lenient_amount(&self.received_amount);
        let discount = lenient_amount(&self.discount);
        let pending = lenient_amount(&self.pending_amount);
        let auto_balance = round2(pending - received - discount);
        let balance = match self.balance_amount.as_deref().map(str::trim) {
            Some(raw) => raw.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(auto_balance),
            None => auto_balance,
        };

        let credit_customer_id = null_if_empty(&self.credit_customer_id);
        let mapped_name = credit_customer_id
            .as_deref()
            .and_then(|id| display_names.get(id))
            .cloned();
        let organization_name = existing
            .and_then(|r| r.organization_name.clone())
            .or_else(|| null_if_empty(&self.organization_name))
            .or_else(|| mapped_name.clone());
        let customer_name = null_if_empty(&self.customer_name)
            .or_else(|| null_if_empty(&self.organization_name))
            .or(mapped_name);

        let recovery_date =
            null_if_empty(&self.recovery_date).unwrap_or_else(|| today.format("%Y-%m-%d").to_string());
        let shift = match self.shift.trim() {
            "S-2" => "S-2",
            _ => "S-1",
        };
        let payment_mode = null_if_empty(&self.payment_mode).unwrap_or_else(|| "Cash".to_string());

        Recovery {
            credit_customer_id,
            organization_name,
            customer_name,
            recovery_date: Some(recovery_date),
            received_amount: Some(received),
            discount: Some(discount),
            pending_amount: Some(pending),
            balance_amount: Some(balance),
            payment_mode: Some(payment_mode),
            notes: null_if_empty(&self.notes),
            shift: Some(shift.to_string()),
            employee_id: null_if_empty(&self.employee_id),
            employee_name: null_if_empty(&self.employee_name),
            ..Recovery::default()
        }
    }
}

fn null_if_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Unparseable or non-finite input counts as zero.
fn lenient_amount(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Lenient deserializers
// ---------------------------------------------------------------------------

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_string(deserializer)?.unwrap_or_default())
}

/// Ids arrive as strings or numbers depending on the backing store.
fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Numeric columns arrive as JSON numbers or as decimal strings.
fn de_opt_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}
