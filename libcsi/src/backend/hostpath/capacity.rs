//! Capacity pools ("kinds") and admission of new volumes against them.
//!
//! Usage is never stored: callers pass a closure that sums the sizes of the
//! live volumes of a kind, so the figure cannot drift from the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;
pub const PIB: u64 = TIB * 1024;

/// A named capacity bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub quota_bytes: u64,
}

impl Pool {
    pub fn new(name: impl Into<String>, quota_bytes: u64) -> Self {
        Self {
            name: name.into(),
            quota_bytes,
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.quota_bytes)
    }
}

/// Parses `kind=quantity`, e.g. `fast=100Gi`.
impl FromStr for Pool {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, quantity) = s.split_once('=').ok_or_else(|| {
            CsiError::InvalidArgument(format!("capacity {s:?} is not of the form kind=quantity"))
        })?;
        if name.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "capacity {s:?} has an empty kind"
            )));
        }
        Ok(Self::new(name, parse_quantity(quantity)?))
    }
}

/// Parse a byte quantity such as `1048576`, `512Mi`, `10Gi` or `2T`.
pub fn parse_quantity(s: &str) -> Result<u64, CsiError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| CsiError::InvalidArgument(format!("invalid quantity {s:?}")))?;
    let multiplier = match suffix {
        "" => 1,
        "Ki" => KIB,
        "Mi" => MIB,
        "Gi" => GIB,
        "Ti" => TIB,
        "Pi" => PIB,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        other => {
            return Err(CsiError::InvalidArgument(format!(
                "unknown quantity suffix {other:?} in {s:?}"
            )));
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| CsiError::InvalidArgument(format!("quantity {s:?} overflows")))
}

/// The configured pools plus the global size ceiling.
#[derive(Debug, Clone)]
pub struct CapacityModel<'a> {
    pools: &'a [Pool],
    max_volume_size: u64,
}

impl<'a> CapacityModel<'a> {
    pub fn new(pools: &'a [Pool], max_volume_size: u64) -> Self {
        Self {
            pools,
            max_volume_size,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Quota of `kind`; unknown kinds have no room at all.
    pub fn quota(&self, kind: &str) -> u64 {
        self.pools
            .iter()
            .find(|p| p.name == kind)
            .map_or(0, |p| p.quota_bytes)
    }

    /// Whether `requested` more bytes fit into `kind` given `used`.
    pub fn has_room(&self, kind: &str, requested: u64, used: u64) -> bool {
        used.saturating_add(requested) <= self.quota(kind)
    }

    /// First pool, in configuration order, that can take `requested` bytes.
    pub fn select_kind(&self, requested: u64, usage: impl Fn(&str) -> u64) -> Option<&'a str> {
        self.pools
            .iter()
            .find(|p| self.has_room(&p.name, requested, usage(&p.name)))
            .map(|p| p.name.as_str())
    }

    /// Decide which kind a new volume of `requested` bytes is charged to.
    ///
    /// Returns an empty kind when capacity tracking is disabled.
    pub fn admit(
        &self,
        kind: Option<&str>,
        requested: u64,
        usage: impl Fn(&str) -> u64,
    ) -> Result<String, CsiError> {
        if requested > self.max_volume_size {
            return Err(CsiError::OutOfRange(format!(
                "requested capacity {requested} exceeds maximum allowed {}",
                self.max_volume_size
            )));
        }

        let kind = kind.filter(|k| !k.is_empty());
        if !self.enabled() {
            return match kind {
                Some(k) => Err(CsiError::InvalidArgument(format!(
                    "capacity tracking disabled, specifying kind {k:?} is invalid"
                ))),
                None => Ok(String::new()),
            };
        }

        match kind {
            Some(k) => {
                let used = usage(k);
                if self.has_room(k, requested, used) {
                    Ok(k.to_owned())
                } else {
                    Err(CsiError::ResourceExhausted(format!(
                        "requested capacity {requested} exceeds remaining capacity for {k:?}, \
                         {used} out of {} already used",
                        self.quota(k)
                    )))
                }
            }
            None => self
                .select_kind(requested, usage)
                .map(str::to_owned)
                .ok_or_else(|| {
                    CsiError::ResourceExhausted(format!(
                        "requested capacity {requested} of arbitrary storage exceeds all remaining capacity"
                    ))
                }),
        }
    }

    /// Bytes still free in `kind`, or across all pools when `kind` is `None`.
    pub fn available(&self, kind: Option<&str>, usage: impl Fn(&str) -> u64) -> u64 {
        match kind {
            Some(k) => self.quota(k).saturating_sub(usage(k)),
            None => self
                .pools
                .iter()
                .map(|p| p.quota_bytes.saturating_sub(usage(&p.name)))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn pools() -> Vec<Pool> {
        vec![Pool::new("a", 10 * GIB), Pool::new("b", 10 * GIB)]
    }

    fn usage(kind: &str) -> u64 {
        match kind {
            "a" => 8 * GIB,
            "b" => 2 * GIB,
            _ => 0,
        }
    }

    #[test]
    fn first_fit_skips_full_pool() {
        let pools = pools();
        let model = CapacityModel::new(&pools, TIB);
        assert_eq!(model.admit(None, 3 * GIB, usage).unwrap(), "b");
        // "a" still fits small requests and comes first.
        assert_eq!(model.admit(None, GIB, usage).unwrap(), "a");
    }

    #[test]
    fn no_pool_fits() {
        let pools = pools();
        let model = CapacityModel::new(&pools, TIB);
        let err = model.admit(None, 9 * GIB, usage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    }

    #[test]
    fn explicit_kind_must_have_room() {
        let pools = pools();
        let model = CapacityModel::new(&pools, TIB);
        assert_eq!(model.admit(Some("a"), 2 * GIB, usage).unwrap(), "a");
        let err = model.admit(Some("a"), 3 * GIB, usage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        let err = model.admit(Some("unknown"), 1, usage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    }

    #[test]
    fn ceiling_checked_before_pools() {
        let model = CapacityModel::new(&[], 5 * GIB);
        // Even an invalid kind reports the size problem first.
        let err = model.admit(Some("a"), 6 * GIB, usage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfRange);
    }

    #[test]
    fn disabled_tracking_rejects_kind() {
        let model = CapacityModel::new(&[], TIB);
        assert_eq!(model.admit(None, GIB, usage).unwrap(), "");
        assert_eq!(model.admit(Some(""), GIB, usage).unwrap(), "");
        let err = model.admit(Some("a"), GIB, usage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn available_per_kind_and_total() {
        let pools = pools();
        let model = CapacityModel::new(&pools, TIB);
        assert_eq!(model.available(Some("a"), usage), 2 * GIB);
        assert_eq!(model.available(None, usage), 10 * GIB);
        assert_eq!(model.available(Some("nope"), usage), 0);
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("1048576").unwrap(), MIB);
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GIB);
        assert_eq!(parse_quantity("2T").unwrap(), 2_000_000_000_000);
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("3Xi").is_err());
    }

    #[test]
    fn pool_from_str() {
        let pool: Pool = "fast=1Gi".parse().unwrap();
        assert_eq!(pool, Pool::new("fast", GIB));
        assert!("fast".parse::<Pool>().is_err());
        assert!("=1Gi".parse::<Pool>().is_err());
    }
}
