use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Catalogue identifier of one source.
pub type SourceId = u64;

/// Instrument channel producing one continuous spectrum per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    /// Blue arm.
    Bp,
    /// Red arm.
    Rp,
}

impl Band {
    /// Both bands in output column order.
    pub const ALL: [Band; 2] = [Band::Bp, Band::Rp];

    pub fn label(self) -> &'static str {
        match self {
            Band::Bp => "bp",
            Band::Rp => "rp",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bp" => Ok(Band::Bp),
            "rp" => Ok(Band::Rp),
            other => Err(format!(
                "unrecognised band '{other}'; only 'bp' and 'rp' are recognised"
            )),
        }
    }
}

/// Number of leading basis functions kept when sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationLevel {
    /// Keep every basis function.
    #[default]
    Full,
    /// Keep the first `k` basis functions.
    Leading(usize),
}

impl TruncationLevel {
    /// Number of retained bases for a family of `n_bases`, clamped to `[0, n_bases]`.
    pub fn resolve(self, n_bases: usize) -> usize {
        match self {
            TruncationLevel::Full => n_bases,
            TruncationLevel::Leading(k) => k.min(n_bases),
        }
    }
}

/// How the batch picks each band's truncation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationPolicy {
    /// Every basis contributes.
    #[default]
    None,
    /// Use the per-source recommended count when the input carries one.
    Recommended,
    /// Same leading count for every source and band.
    Fixed(usize),
}

impl TruncationPolicy {
    pub fn level(self, recommended: Option<usize>) -> TruncationLevel {
        match (self, recommended) {
            (TruncationPolicy::None, _) => TruncationLevel::Full,
            (TruncationPolicy::Recommended, Some(k)) => TruncationLevel::Leading(k),
            (TruncationPolicy::Recommended, None) => TruncationLevel::Full,
            (TruncationPolicy::Fixed(k), _) => TruncationLevel::Leading(k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_clamps_to_basis_count() {
        assert_eq!(TruncationLevel::Full.resolve(55), 55);
        assert_eq!(TruncationLevel::Leading(0).resolve(55), 0);
        assert_eq!(TruncationLevel::Leading(12).resolve(55), 12);
        assert_eq!(TruncationLevel::Leading(90).resolve(55), 55);
    }

    #[test]
    fn band_parses_case_insensitively() {
        assert_eq!("BP".parse::<Band>().unwrap(), Band::Bp);
        assert_eq!(" rp ".parse::<Band>().unwrap(), Band::Rp);
        assert!("g".parse::<Band>().is_err());
    }

    #[test]
    fn recommended_policy_falls_back_to_full() {
        assert_eq!(TruncationPolicy::Recommended.level(Some(20)), TruncationLevel::Leading(20));
        assert_eq!(TruncationPolicy::Recommended.level(None), TruncationLevel::Full);
        assert_eq!(TruncationPolicy::None.level(Some(20)), TruncationLevel::Full);
        assert_eq!(TruncationPolicy::Fixed(3).level(Some(20)), TruncationLevel::Leading(3));
    }
}
