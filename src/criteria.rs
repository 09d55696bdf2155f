use crate::listing::normalize_zip;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};
use thiserror::Error;
use uuid::Uuid;

/// Which listing value the price bounds are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    #[default]
    Absolute,
    #[serde(alias = "ppsf", alias = "per_sqft")]
    PerSqFt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    Agent,
    Owner,
    Rent,
}

impl ListingType {
    pub const ALL: [ListingType; 3] = [ListingType::Agent, ListingType::Owner, ListingType::Rent];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::Agent => "agent",
            ListingType::Owner => "owner",
            ListingType::Rent => "rent",
        }
    }

    /// Lenient mapping of the many spellings scrapers use.
    pub fn parse(input: &str) -> Option<Self> {
        let key = input.trim().to_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "agent" | "fsba" | "for_sale_by_agent" | "by_agent" | "mls" => Some(ListingType::Agent),
            "owner" | "fsbo" | "for_sale_by_owner" | "by_owner" => Some(ListingType::Owner),
            "rent" | "rental" | "for_rent" | "frbo" => Some(ListingType::Rent),
            _ => None,
        }
    }
}

impl fmt::Display for ListingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unvalidated criteria as they arrive from a form or a stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaInput {
    #[serde(default)]
    pub zip_codes: Vec<String>,
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub neighborhoods: Vec<String>,
    #[serde(default)]
    pub price_min: Option<f64>,
    #[serde(default)]
    pub price_max: Option<f64>,
    #[serde(default)]
    pub price_mode: PriceMode,
    #[serde(default)]
    pub max_days_on_market: Option<u32>,
    #[serde(default = "all_listing_types")]
    pub listing_types_enabled: Vec<ListingType>,
    #[serde(default)]
    pub home_types: Vec<String>,
    #[serde(default)]
    pub filter_by_city_match: bool,
    #[serde(default)]
    pub filter_by_neighborhoods: bool,
}

impl Default for CriteriaInput {
    fn default() -> Self {
        Self {
            zip_codes: Vec::new(),
            cities: Vec::new(),
            neighborhoods: Vec::new(),
            price_min: None,
            price_max: None,
            price_mode: PriceMode::Absolute,
            max_days_on_market: None,
            listing_types_enabled: all_listing_types(),
            home_types: Vec::new(),
            filter_by_city_match: false,
            filter_by_neighborhoods: false,
        }
    }
}

fn all_listing_types() -> Vec<ListingType> {
    ListingType::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CriteriaViolation {
    #[error("at least one zip code is required")]
    MissingZipCodes,
    #[error("city matching is enabled but no cities are listed")]
    CityMatchWithoutCities,
    #[error("neighborhood filtering is enabled but no neighborhoods are listed")]
    NeighborhoodFilterWithoutNeighborhoods,
    #[error("price_min {min} is greater than price_max {max}")]
    InvertedPriceBounds { min: f64, max: f64 },
    #[error("{field} must be a non-negative number")]
    InvalidPriceBound { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CriteriaError {
    #[error("invalid criteria: {}", join_violations(.violations))]
    InvalidCriteria { violations: Vec<CriteriaViolation> },
}

impl CriteriaError {
    pub fn violations(&self) -> &[CriteriaViolation] {
        match self {
            CriteriaError::InvalidCriteria { violations } => violations,
        }
    }
}

fn join_violations(violations: &[CriteriaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validated acquisition rules of one Buy Box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuyBoxCriteria {
    company_id: Uuid,
    zip_codes: BTreeSet<String>,
    cities: BTreeSet<String>,
    neighborhoods: BTreeSet<String>,
    price_min: Option<f64>,
    price_max: Option<f64>,
    price_mode: PriceMode,
    max_days_on_market: Option<u32>,
    listing_types_enabled: BTreeSet<ListingType>,
    home_types: BTreeSet<String>,
    filter_by_city_match: bool,
    filter_by_neighborhoods: bool,
}

impl BuyBoxCriteria {
    /// Validates every rule and reports all violations together.
    pub fn new(company_id: Uuid, input: CriteriaInput) -> Result<Self, CriteriaError> {
        let zip_codes: BTreeSet<String> = input
            .zip_codes
            .iter()
            .filter_map(|zip| normalize_zip(zip))
            .collect();
        let cities = clean_set(&input.cities);
        let neighborhoods = clean_set(&input.neighborhoods);
        let home_types = clean_set(&input.home_types);

        let mut violations = Vec::new();
        if zip_codes.is_empty() {
            violations.push(CriteriaViolation::MissingZipCodes);
        }
        if input.filter_by_city_match && cities.is_empty() {
            violations.push(CriteriaViolation::CityMatchWithoutCities);
        }
        if input.filter_by_neighborhoods && neighborhoods.is_empty() {
            violations.push(CriteriaViolation::NeighborhoodFilterWithoutNeighborhoods);
        }
        for (field, bound) in [("price_min", input.price_min), ("price_max", input.price_max)] {
            if let Some(value) = bound
                && (!value.is_finite() || value < 0.0)
            {
                violations.push(CriteriaViolation::InvalidPriceBound { field });
            }
        }
        if let (Some(min), Some(max)) = (input.price_min, input.price_max)
            && min > max
        {
            violations.push(CriteriaViolation::InvertedPriceBounds { min, max });
        }

        if !violations.is_empty() {
            return Err(CriteriaError::InvalidCriteria { violations });
        }

        Ok(Self {
            company_id,
            zip_codes,
            cities,
            neighborhoods,
            price_min: input.price_min,
            price_max: input.price_max,
            price_mode: input.price_mode,
            max_days_on_market: input.max_days_on_market,
            listing_types_enabled: input.listing_types_enabled.into_iter().collect(),
            home_types,
            filter_by_city_match: input.filter_by_city_match,
            filter_by_neighborhoods: input.filter_by_neighborhoods,
        })
    }

    pub fn company_id(&self) -> Uuid {
        self.company_id
    }

    pub fn zip_codes(&self) -> &BTreeSet<String> {
        &self.zip_codes
    }

    pub fn cities(&self) -> &BTreeSet<String> {
        &self.cities
    }

    pub fn neighborhoods(&self) -> &BTreeSet<String> {
        &self.neighborhoods
    }

    pub fn price_bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.price_min, self.price_max)
    }

    pub fn price_mode(&self) -> PriceMode {
        self.price_mode
    }

    pub fn max_days_on_market(&self) -> Option<u32> {
        self.max_days_on_market
    }

    pub fn listing_types_enabled(&self) -> &BTreeSet<ListingType> {
        &self.listing_types_enabled
    }

    pub fn home_types(&self) -> &BTreeSet<String> {
        &self.home_types
    }

    pub fn filter_by_city_match(&self) -> bool {
        self.filter_by_city_match
    }

    pub fn filter_by_neighborhoods(&self) -> bool {
        self.filter_by_neighborhoods
    }
}

fn clean_set(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stored Buy Box row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyBoxRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub criteria: CriteriaInput,
}

#[derive(Debug, Clone)]
pub struct BuyBox {
    pub id: Uuid,
    pub name: Option<String>,
    pub criteria: BuyBoxCriteria,
}

impl TryFrom<BuyBoxRecord> for BuyBox {
    type Error = CriteriaError;

    fn try_from(record: BuyBoxRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: record.id,
            name: record.name,
            criteria: BuyBoxCriteria::new(record.company_id, record.criteria)?,
        })
    }
}
