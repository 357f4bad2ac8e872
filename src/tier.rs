//! Metal tier labels and the harmonization of raw issuer-reported tier names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AllocError;

/// Actuarial metal tier of a plan, using the labels of the county control tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetalTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    #[serde(rename = "Minimum Coverage")]
    MinimumCoverage,
    #[serde(rename = "Bronze HDHP")]
    BronzeHdhp,
}

impl MetalTier {
    /// Every tier in canonical order.
    pub const ALL: [MetalTier; 6] = [
        MetalTier::Bronze,
        MetalTier::Silver,
        MetalTier::Gold,
        MetalTier::Platinum,
        MetalTier::MinimumCoverage,
        MetalTier::BronzeHdhp,
    ];

    /// Canonical label as it appears in the metal × county control table.
    pub fn label(self) -> &'static str {
        match self {
            MetalTier::Bronze => "Bronze",
            MetalTier::Silver => "Silver",
            MetalTier::Gold => "Gold",
            MetalTier::Platinum => "Platinum",
            MetalTier::MinimumCoverage => "Minimum Coverage",
            MetalTier::BronzeHdhp => "Bronze HDHP",
        }
    }

    /// Maps a plan-level tier label onto a canonical tier.
    ///
    /// Plan-level sources spell high-deductible bronze plans several ways
    /// (`HDHP Bronze`, `HSA Bronze`, `HDHP`); all of them collapse into
    /// [`MetalTier::BronzeHdhp`]. Labels outside the lookup yield `None` and the
    /// caller decides whether that is fatal.
    pub fn harmonize(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Bronze" => Some(MetalTier::Bronze),
            "Silver" => Some(MetalTier::Silver),
            "Gold" => Some(MetalTier::Gold),
            "Platinum" => Some(MetalTier::Platinum),
            "Minimum Coverage" => Some(MetalTier::MinimumCoverage),
            "Bronze HDHP" | "HDHP Bronze" | "HSA Bronze" | "HDHP" => Some(MetalTier::BronzeHdhp),
            _ => None,
        }
    }
}

impl fmt::Display for MetalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MetalTier {
    type Err = AllocError;

    /// Strict parse of a canonical label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        MetalTier::ALL
            .into_iter()
            .find(|tier| tier.label() == trimmed)
            .ok_or_else(|| AllocError::UnknownMetalTier {
                label: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harmonize_collapses_high_deductible_aliases() {
        for raw in ["HDHP Bronze", "HSA Bronze", "HDHP", " Bronze HDHP "] {
            assert_eq!(MetalTier::harmonize(raw), Some(MetalTier::BronzeHdhp));
        }
        assert_eq!(MetalTier::harmonize("Catastrophic"), None);
    }

    #[test]
    fn strict_parse_rejects_aliases() {
        assert_eq!(
            "Minimum Coverage".parse::<MetalTier>().unwrap(),
            MetalTier::MinimumCoverage
        );
        assert!(matches!(
            "HSA Bronze".parse::<MetalTier>(),
            Err(AllocError::UnknownMetalTier { .. })
        ));
    }

    #[test]
    fn labels_round_trip_through_display() {
        for tier in MetalTier::ALL {
            assert_eq!(tier.to_string().parse::<MetalTier>().unwrap(), tier);
        }
    }
}
