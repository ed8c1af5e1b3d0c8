// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Symbolic version selectors.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects which version(s) of a definition family an operation targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum VersionOptions {
    /// The version flagged `is_latest`
    Latest,
    /// The version flagged `is_published`
    Published,
    /// The published version if one exists, otherwise the latest
    #[default]
    LatestOrPublished,
    /// An exact version number
    SpecificVersion(i32),
    /// Every version of the family
    All,
}

impl VersionOptions {
    /// Whether `version`'s flags satisfy this selector on their own.
    ///
    /// `LatestOrPublished` matches either flag here; callers that need the
    /// published-first preference resolve it against the whole family.
    pub fn matches(&self, version: i32, is_latest: bool, is_published: bool) -> bool {
        match self {
            Self::Latest => is_latest,
            Self::Published => is_published,
            Self::LatestOrPublished => is_latest || is_published,
            Self::SpecificVersion(v) => *v == version,
            Self::All => true,
        }
    }
}

impl fmt::Display for VersionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Published => write!(f, "published"),
            Self::LatestOrPublished => write!(f, "latest-or-published"),
            Self::SpecificVersion(v) => write!(f, "{}", v),
            Self::All => write!(f, "all"),
        }
    }
}

/// Error returned when a version selector string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(pub String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid version selector '{}': expected latest, published, latest-or-published, all or a positive number",
            self.0
        )
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for VersionOptions {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "published" => Ok(Self::Published),
            "latest-or-published" | "latestorpublished" => Ok(Self::LatestOrPublished),
            "all" => Ok(Self::All),
            other => match other.parse::<i32>() {
                Ok(v) if v > 0 => Ok(Self::SpecificVersion(v)),
                _ => Err(ParseVersionError(s.to_string())),
            },
        }
    }
}
