use crate::classifier::{ClassificationRequest, NeighborhoodClassifier};
use crate::criteria::BuyBoxCriteria;
use crate::listing::Listing;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Zip,
    ListingType,
    HomeType,
    Price,
    Freshness,
    CityMatch,
    Neighborhood,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Zip => "zip",
            FilterStage::ListingType => "listing_type",
            FilterStage::HomeType => "home_type",
            FilterStage::Price => "price",
            FilterStage::Freshness => "freshness",
            FilterStage::CityMatch => "city_match",
            FilterStage::Neighborhood => "neighborhood",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ZipNotInBuyBox,
    ListingTypeDisabled,
    HomeTypeExcluded,
    HomeTypeUnknown,
    InsufficientPriceData,
    BelowPriceMin,
    AbovePriceMax,
    StaleListing,
    CityMismatch,
    NeighborhoodMismatch,
    /// The classifier failed or timed out; the listing is excluded unchecked.
    ClassificationUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ZipNotInBuyBox => "zip_not_in_buy_box",
            RejectReason::ListingTypeDisabled => "listing_type_disabled",
            RejectReason::HomeTypeExcluded => "home_type_excluded",
            RejectReason::HomeTypeUnknown => "home_type_unknown",
            RejectReason::InsufficientPriceData => "insufficient_price_data",
            RejectReason::BelowPriceMin => "below_price_min",
            RejectReason::AbovePriceMax => "above_price_max",
            RejectReason::StaleListing => "stale_listing",
            RejectReason::CityMismatch => "city_mismatch",
            RejectReason::NeighborhoodMismatch => "neighborhood_mismatch",
            RejectReason::ClassificationUnavailable => "classification_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub stage: FilterStage,
    pub reason: RejectReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Rejection {
    fn new(stage: FilterStage, reason: RejectReason) -> Self {
        Self {
            stage,
            reason,
            detail: None,
        }
    }

    fn with_detail(stage: FilterStage, reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            stage,
            reason,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Admitted,
    Rejected(Rejection),
}

impl Disposition {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Disposition::Admitted)
    }
}

/// Ordered filter stages. Each stage either passes or rejects; the first
/// rejection ends evaluation, so the classifier only sees listings that
/// cleared every local rule.
#[derive(Clone)]
pub struct MatchPipeline {
    classifier: Arc<dyn NeighborhoodClassifier>,
    classifier_timeout: Duration,
}

impl MatchPipeline {
    pub fn new(classifier: Arc<dyn NeighborhoodClassifier>, classifier_timeout: Duration) -> Self {
        Self {
            classifier,
            classifier_timeout,
        }
    }

    pub async fn evaluate(&self, criteria: &BuyBoxCriteria, listing: &Listing) -> Disposition {
        let outcome = match stages::local(criteria, listing) {
            Ok(()) if criteria.filter_by_neighborhoods() => {
                stages::neighborhood(
                    criteria,
                    listing,
                    self.classifier.as_ref(),
                    self.classifier_timeout,
                )
                .await
            }
            other => other,
        };

        match outcome {
            Ok(()) => Disposition::Admitted,
            Err(rejection) => {
                debug!(
                    target = "buybox.matching",
                    dedup_key = %listing.dedup_key,
                    stage = rejection.stage.as_str(),
                    reason = rejection.reason.as_str(),
                    "listing_rejected"
                );
                crate::metrics::filter_rejection(rejection.stage.as_str(), rejection.reason.as_str());
                Disposition::Rejected(rejection)
            }
        }
    }
}

pub mod stages {
    use super::*;

    pub type StageResult = Result<(), Rejection>;

    /// Stages 1-6: pure checks that need no external calls.
    pub fn local(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        zip(criteria, listing)?;
        listing_type(criteria, listing)?;
        home_type(criteria, listing)?;
        price(criteria, listing)?;
        freshness(criteria, listing)?;
        if criteria.filter_by_city_match() {
            city_match(criteria, listing)?;
        }
        Ok(())
    }

    pub fn zip(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        if criteria.zip_codes().contains(&listing.zip) {
            Ok(())
        } else {
            Err(Rejection::with_detail(
                FilterStage::Zip,
                RejectReason::ZipNotInBuyBox,
                format!("zip {} not in buy box", listing.zip),
            ))
        }
    }

    /// Only a recognized type can be disabled; missing or unparseable types
    /// fall through to the later stages.
    pub fn listing_type(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        match listing.listing_type {
            Some(kind) if !criteria.listing_types_enabled().contains(&kind) => {
                Err(Rejection::with_detail(
                    FilterStage::ListingType,
                    RejectReason::ListingTypeDisabled,
                    format!("listing type {kind} not enabled"),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn home_type(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        let allowed = criteria.home_types();
        if allowed.is_empty() {
            return Ok(());
        }
        let Some(home_type) = listing.home_type.as_deref() else {
            return Err(Rejection::new(
                FilterStage::HomeType,
                RejectReason::HomeTypeUnknown,
            ));
        };
        let wanted = home_type_key(home_type);
        if allowed.iter().any(|candidate| home_type_key(candidate) == wanted) {
            Ok(())
        } else {
            Err(Rejection::with_detail(
                FilterStage::HomeType,
                RejectReason::HomeTypeExcluded,
                format!("home type {home_type} not allowed"),
            ))
        }
    }

    /// A listing without the compared figure is excluded, unless the box sets
    /// no price bounds at all.
    pub fn price(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        let (min, max) = criteria.price_bounds();
        if min.is_none() && max.is_none() {
            return Ok(());
        }
        let (field, value) = match criteria.price_mode() {
            crate::criteria::PriceMode::Absolute => ("price", listing.price),
            crate::criteria::PriceMode::PerSqFt => ("price_per_sqft", listing.price_per_sqft),
        };
        let Some(value) = value else {
            return Err(Rejection::with_detail(
                FilterStage::Price,
                RejectReason::InsufficientPriceData,
                format!("listing has no {field}"),
            ));
        };
        if let Some(min) = min
            && value < min
        {
            return Err(Rejection::with_detail(
                FilterStage::Price,
                RejectReason::BelowPriceMin,
                format!("{field} {value} below {min}"),
            ));
        }
        if let Some(max) = max
            && value > max
        {
            return Err(Rejection::with_detail(
                FilterStage::Price,
                RejectReason::AbovePriceMax,
                format!("{field} {value} above {max}"),
            ));
        }
        Ok(())
    }

    /// Unknown age never disqualifies a listing.
    pub fn freshness(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        match (criteria.max_days_on_market(), listing.days_on_market) {
            (Some(max), Some(days)) if days > max => Err(Rejection::with_detail(
                FilterStage::Freshness,
                RejectReason::StaleListing,
                format!("{days} days on market exceeds {max}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn city_match(criteria: &BuyBoxCriteria, listing: &Listing) -> StageResult {
        let city = listing
            .city
            .as_deref()
            .map(|city| city.trim().to_lowercase())
            .unwrap_or_default();
        if !city.is_empty()
            && criteria
                .cities()
                .iter()
                .any(|candidate| candidate.to_lowercase() == city)
        {
            Ok(())
        } else {
            Err(Rejection::with_detail(
                FilterStage::CityMatch,
                RejectReason::CityMismatch,
                format!(
                    "city {} not in buy box",
                    listing.city.as_deref().unwrap_or("<missing>")
                ),
            ))
        }
    }

    /// Stage 7. Errors and timeouts fail closed with a distinct reason so
    /// "not a match" and "could not check" stay distinguishable.
    pub async fn neighborhood(
        criteria: &BuyBoxCriteria,
        listing: &Listing,
        classifier: &dyn NeighborhoodClassifier,
        timeout: Duration,
    ) -> StageResult {
        let request = ClassificationRequest {
            address: full_address(listing),
            description: listing.description.clone(),
            candidate_neighborhoods: criteria.neighborhoods().iter().cloned().collect(),
        };
        match tokio::time::timeout(timeout, classifier.classify(&request)).await {
            Ok(Ok(verdict)) if verdict.matches => Ok(()),
            Ok(Ok(verdict)) => Err(Rejection::with_detail(
                FilterStage::Neighborhood,
                RejectReason::NeighborhoodMismatch,
                verdict.explanation,
            )),
            Ok(Err(err)) => Err(Rejection::with_detail(
                FilterStage::Neighborhood,
                RejectReason::ClassificationUnavailable,
                err.to_string(),
            )),
            Err(_) => Err(Rejection::with_detail(
                FilterStage::Neighborhood,
                RejectReason::ClassificationUnavailable,
                format!("classifier timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    fn home_type_key(value: &str) -> String {
        value
            .trim()
            .to_lowercase()
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn full_address(listing: &Listing) -> String {
        [
            Some(listing.address.as_str()),
            listing.city.as_deref(),
            listing.state.as_deref(),
            Some(listing.zip.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
    }
}
