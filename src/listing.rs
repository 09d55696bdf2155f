use crate::criteria::ListingType;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use serde_with::{DeserializeAs, serde_as};
use std::{collections::HashMap, fmt, str::FromStr};

/// One feed entry after its field names have been folded onto the canonical
/// spellings by `fold_aliases`.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawListing {
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub address: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub city: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub state: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub zip: Option<String>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub price: Option<f64>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub price_per_sqft: Option<f64>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub home_type: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub listing_type: Option<String>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub days_on_market: Option<u32>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub bedrooms: Option<f32>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub bathrooms: Option<f32>,
    #[serde_as(deserialize_as = "LenientNumber")]
    #[serde(default)]
    pub sqft: Option<f64>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub status: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub agent_phone: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub agent_email: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub brokerage: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde_as(deserialize_as = "LenientText")]
    #[serde(default)]
    pub description: Option<String>,
}

/// Field names vary between sources. The canonical name wins, then aliases
/// in the order listed.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("source_id", &["id", "zpid", "listing_id", "mls_id"]),
    ("address", &["street_address", "streetAddress", "address_line1"]),
    ("state", &["state_code"]),
    ("zip", &["zipcode", "zip_code", "zipCode", "postal_code"]),
    ("price", &["list_price", "listPrice"]),
    ("price_per_sqft", &["ppsf", "pricePerSqft", "price_per_square_foot"]),
    ("home_type", &["homeType", "property_type", "propertyType"]),
    ("listing_type", &["listingType", "listing_sub_type"]),
    ("days_on_market", &["daysOnMarket", "dom"]),
    ("bedrooms", &["beds"]),
    ("bathrooms", &["baths"]),
    ("sqft", &["living_area", "livingArea", "square_feet"]),
    ("status", &["home_status", "homeStatus"]),
    ("agent_name", &["agentName"]),
    ("agent_phone", &["agentPhone"]),
    ("agent_email", &["agentEmail"]),
    ("brokerage", &["broker_name", "brokerName"]),
    ("listing_url", &["url", "detail_url", "detailUrl"]),
];

/// Moves every aliased field onto its canonical name, keeping the first
/// non-null spelling present. Feeds routinely send several spellings of the
/// same field at once.
fn fold_aliases(mut item: Map<String, Value>) -> Map<String, Value> {
    for (canonical, aliases) in FIELD_ALIASES {
        let mut chosen: Option<Value> = None;
        for name in std::iter::once(canonical).chain(aliases.iter()) {
            if let Some(value) = item.remove(*name)
                && chosen.as_ref().is_none_or(Value::is_null)
            {
                chosen = Some(value);
            }
        }
        if let Some(value) = chosen {
            item.insert((*canonical).to_string(), value);
        }
    }
    item
}

/// Strings and numbers both become trimmed text; blanks become `None`.
struct LenientText;

impl<'de> DeserializeAs<'de, Option<String>> for LenientText {
    fn deserialize_as<D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(text) => Ok(Some(text.trim().to_string()).filter(|t| !t.is_empty())),
            Value::Number(number) => Ok(Some(number.to_string())),
            Value::Null => Ok(None),
            other => Err(serde::de::Error::custom(format!(
                "expected text, found {other}"
            ))),
        }
    }
}

/// Numbers, numeric strings and money strings such as `"$120,000"`.
/// Whole floats such as `400.0` fill integer fields. Unparseable values
/// become `None` rather than failing the entry.
struct LenientNumber;

impl<'de, T> DeserializeAs<'de, Option<T>> for LenientNumber
where
    T: FromStr,
{
    fn deserialize_as<D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parsed = match Value::deserialize(deserializer)? {
            Value::Number(number) => parse_number(&number.to_string()),
            Value::String(text) => {
                let cleaned: String = text
                    .chars()
                    .filter(|ch| !matches!(ch, '$' | ',' | '_') && !ch.is_whitespace())
                    .collect();
                parse_number(&cleaned)
            }
            _ => None,
        };
        Ok(parsed)
    }
}

fn parse_number<T: FromStr>(text: &str) -> Option<T> {
    if let Ok(value) = text.parse::<T>() {
        return Some(value);
    }
    let float = text.parse::<f64>().ok()?;
    if !float.is_finite() || float.fract() != 0.0 {
        return None;
    }
    format!("{float:.0}").parse::<T>().ok()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerAgent {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub brokerage: Option<String>,
}

/// Canonical listing produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub dedup_key: DedupKey,
    pub source_id: Option<String>,
    pub address: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: String,
    pub price: Option<f64>,
    pub price_per_sqft: Option<f64>,
    /// Passed through verbatim, even when the value is not a known type.
    pub home_type: Option<String>,
    pub listing_type: Option<ListingType>,
    pub days_on_market: Option<u32>,
    pub bedrooms: Option<f32>,
    pub bathrooms: Option<f32>,
    pub sqft: Option<f64>,
    pub status: Option<String>,
    pub agent: SellerAgent,
    pub listing_url: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    MissingAddress,
    MissingZip,
    /// Neither a usable address nor a source id to identify the property.
    Unidentifiable,
    Malformed(String),
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::MissingAddress => "missing_address",
            SkipReason::MissingZip => "missing_zip",
            SkipReason::Unidentifiable => "unidentifiable",
            SkipReason::Malformed(_) => "malformed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(detail) => write!(f, "malformed: {detail}"),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Listing(Box<Listing>),
    Skipped(SkipReason),
}

/// Decodes and normalizes one undecoded feed item.
pub fn normalize_value(value: Value) -> Normalized {
    let Value::Object(item) = value else {
        return Normalized::Skipped(SkipReason::Malformed("feed item is not an object".into()));
    };
    match serde_json::from_value::<RawListing>(Value::Object(fold_aliases(item))) {
        Ok(raw) => normalize(raw),
        Err(err) => Normalized::Skipped(SkipReason::Malformed(err.to_string())),
    }
}

pub fn normalize(raw: RawListing) -> Normalized {
    let Some(address) = raw.address else {
        return Normalized::Skipped(SkipReason::MissingAddress);
    };
    let Some(zip) = raw.zip.as_deref().and_then(normalize_zip) else {
        return Normalized::Skipped(SkipReason::MissingZip);
    };
    let Some(dedup_key) = DedupKey::for_parts(&address, &zip, raw.source_id.as_deref()) else {
        return Normalized::Skipped(SkipReason::Unidentifiable);
    };

    let price = raw.price.filter(|p| p.is_finite() && *p >= 0.0);
    let sqft = raw.sqft.filter(|s| s.is_finite() && *s > 0.0);
    let price_per_sqft = match raw.price_per_sqft.filter(|p| p.is_finite() && *p >= 0.0) {
        Some(ppsf) => Some(round_cents(ppsf)),
        None => match (price, sqft) {
            (Some(price), Some(sqft)) => Some(round_cents(price / sqft)),
            _ => None,
        },
    };

    Normalized::Listing(Box::new(Listing {
        dedup_key,
        source_id: raw.source_id,
        address,
        city: raw.city,
        state: raw.state,
        zip,
        price,
        price_per_sqft,
        home_type: raw.home_type,
        listing_type: raw.listing_type.as_deref().and_then(ListingType::parse),
        days_on_market: raw.days_on_market,
        bedrooms: raw.bedrooms.filter(|b| b.is_finite()),
        bathrooms: raw.bathrooms.filter(|b| b.is_finite()),
        sqft,
        status: raw.status,
        agent: SellerAgent {
            name: raw.agent_name,
            phone: raw.agent_phone,
            email: raw.agent_email,
            brokerage: raw.brokerage,
        },
        listing_url: raw.listing_url,
        description: raw.description,
    }))
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// US zips reduce to their 5-digit form (`44105-1234` -> `44105`); anything
/// else is kept trimmed and upper-cased.
pub fn normalize_zip(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() == 5 || digits.len() == 9 {
        return Some(digits[..5].to_string());
    }
    Some(trimmed.to_uppercase())
}

static STREET_ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("street", "st"),
        ("avenue", "ave"),
        ("av", "ave"),
        ("road", "rd"),
        ("drive", "dr"),
        ("boulevard", "blvd"),
        ("lane", "ln"),
        ("court", "ct"),
        ("place", "pl"),
        ("terrace", "ter"),
        ("parkway", "pkwy"),
        ("highway", "hwy"),
        ("circle", "cir"),
        ("square", "sq"),
        ("trail", "trl"),
        ("apartment", "apt"),
        ("suite", "ste"),
        ("unit", "unit"),
        ("north", "n"),
        ("south", "s"),
        ("east", "e"),
        ("west", "w"),
        ("northeast", "ne"),
        ("northwest", "nw"),
        ("southeast", "se"),
        ("southwest", "sw"),
    ])
});

const PLACEHOLDER_ADDRESSES: &[&str] = &[
    "n/a",
    "na",
    "none",
    "null",
    "unknown",
    "tbd",
    "undisclosed",
    "undisclosed address",
    "address not disclosed",
    "address not provided",
];

/// Canonical form of a street address, or `None` when the address cannot
/// identify a property.
pub fn normalize_address(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if PLACEHOLDER_ADDRESSES.contains(&lowered.as_str()) {
        return None;
    }
    let spaced: String = lowered
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
        .collect();
    let tokens: Vec<&str> = spaced
        .split_whitespace()
        .map(|token| STREET_ABBREVIATIONS.get(token).copied().unwrap_or(token))
        .collect();
    if !tokens
        .iter()
        .any(|token| token.chars().any(|ch| ch.is_ascii_digit() || ch.is_alphabetic()))
    {
        return None;
    }
    Some(tokens.join(" "))
}

/// Identity used to merge repeated sightings of one property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn for_parts(address: &str, zip: &str, source_id: Option<&str>) -> Option<Self> {
        if let Some(normalized) = normalize_address(address) {
            return Some(Self(format!("{normalized}|{zip}")));
        }
        source_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Self(format!("source:{id}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
