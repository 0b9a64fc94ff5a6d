//! Precision code lookup table
//!
//! Immutable mapping from precision code to aggregation kind, passed to the
//! resolver at construction. The default table has the eight standard codes:
//!
//! | code | kind                |
//! |------|---------------------|
//! | 1    | point               |
//! | 2, 5 | buffer, radius 25000|
//! | 3, 4 | admin level 2       |
//! | 6-8  | admin level 0       |
//!
//! Buffer radii are in the boundary coordinate units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a precision code aggregates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationKind {
    Point,
    Buffer { radius: f64 },
    #[serde(rename = "adm")]
    AdminArea { level: usize },
}

/// Precision code → aggregation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecisionLookup {
    codes: BTreeMap<String, AggregationKind>,
}

impl PrecisionLookup {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, AggregationKind)>,
        S: Into<String>,
    {
        Self {
            codes: entries.into_iter().map(|(code, kind)| (code.into(), kind)).collect(),
        }
    }

    /// Kind for a code (surrounding whitespace ignored)
    pub fn kind(&self, code: &str) -> Option<AggregationKind> {
        self.codes.get(code.trim()).copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Highest admin level any code needs
    pub fn max_admin_level(&self) -> Option<usize> {
        self.codes
            .values()
            .filter_map(|kind| match kind {
                AggregationKind::AdminArea { level } => Some(*level),
                _ => None,
            })
            .max()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AggregationKind)> {
        self.codes.iter().map(|(code, kind)| (code.as_str(), kind))
    }
}

impl Default for PrecisionLookup {
    fn default() -> Self {
        Self::from_entries([
            ("1", AggregationKind::Point),
            ("2", AggregationKind::Buffer { radius: 25000.0 }),
            ("3", AggregationKind::AdminArea { level: 2 }),
            ("4", AggregationKind::AdminArea { level: 2 }),
            ("5", AggregationKind::Buffer { radius: 25000.0 }),
            ("6", AggregationKind::AdminArea { level: 0 }),
            ("7", AggregationKind::AdminArea { level: 0 }),
            ("8", AggregationKind::AdminArea { level: 0 }),
        ])
    }
}
