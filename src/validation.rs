//! Data-sufficiency gate for verification eligibility
use std::fmt;

use serde::Serialize;

use crate::config::ValidationParameters;
use crate::farm::Farm;
use crate::period::Period;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationIssue {
    MissingGroundTruth,
    MissingSatelliteImagery,
    /// Advisory only: no in-period image is clear, including when there is none.
    HighCloudCover { threshold: f64 },
}

impl ValidationIssue {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ValidationIssue::HighCloudCover { .. })
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingGroundTruth => {
                f.write_str("No ground truth data for the specified period")
            }
            ValidationIssue::MissingSatelliteImagery => {
                f.write_str("No satellite imagery for the specified period")
            }
            ValidationIssue::HighCloudCover { threshold } => write!(
                f,
                "All satellite imagery has high cloud cover (>{:.0}%)",
                threshold * 100.0
            ),
        }
    }
}

impl From<ValidationIssue> for String {
    fn from(value: ValidationIssue) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(serialize_with = "issues_as_messages")]
    pub issues: Vec<ValidationIssue>,
}

fn issues_as_messages<S: serde::Serializer>(issues: &[ValidationIssue], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(issues.iter().map(ToString::to_string))
}

impl ValidationReport {
    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }

    pub fn has(&self, issue: &ValidationIssue) -> bool {
        self.issues.contains(issue)
    }
}

/// Evaluates every rule, so several issues can be reported at once.
pub fn validate(farm: &Farm, period: &Period, params: &ValidationParameters) -> ValidationReport {
    let mut issues = vec![];

    if farm.ground_truth_in(period).next().is_none() {
        issues.push(ValidationIssue::MissingGroundTruth);
    }

    if farm.imagery_in(period).next().is_none() {
        issues.push(ValidationIssue::MissingSatelliteImagery);
    }
    if !farm
        .imagery_in(period)
        .any(|img| img.cloud_cover < params.max_cloud_cover)
    {
        issues.push(ValidationIssue::HighCloudCover {
            threshold: params.max_cloud_cover,
        });
    }

    ValidationReport {
        is_valid: !issues.iter().any(ValidationIssue::is_blocking),
        issues,
    }
}
