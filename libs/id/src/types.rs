//! Typed identifiers used across the orchestration core.

use crate::define_id;

// =============================================================================
// Instances and Storage
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(VolumeId, "vol");

// =============================================================================
// Admission
// =============================================================================

define_id!(ReservationId, "rsv");

// =============================================================================
// Ordinals
// =============================================================================

/// Stable identity of one member of a stateful workload.
///
/// Ordinals are dense and start at zero. They are not ULID-based: the
/// ordinal survives instance replacement while the `InstanceId` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ordinal(u32);

impl Ordinal {
    /// The first member of every stateful workload.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// The ordinal created after this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Member hostname for a workload, `{workload}-{ordinal}`.
    pub fn hostname(&self, workload: &str) -> String {
        format!("{}-{}", workload, self.0)
    }
}

impl std::fmt::Display for Ordinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Ordinal {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| crate::IdError::InvalidOrdinal(s.to_string()))
    }
}

impl From<u32> for Ordinal {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl serde::Serialize for Ordinal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Ordinal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(u32::deserialize(deserializer)?))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_prefix() {
        let id = InstanceId::new();
        assert!(id.to_string().starts_with("inst_"));
    }

    #[test]
    fn test_volume_id_rejects_instance_prefix() {
        let result: Result<VolumeId, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<ReservationId, _> = "rsv01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::MissingSeparator));
    }

    #[test]
    fn test_empty_and_bad_ulid() {
        assert!(matches!(
            "".parse::<InstanceId>().unwrap_err(),
            crate::IdError::Empty
        ));
        assert!(matches!(
            "inst_nope".parse::<InstanceId>().unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_instance_id_json_is_string() {
        let id = InstanceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_sortable() {
        let id1 = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = InstanceId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_ordinal_navigation() {
        assert_eq!(Ordinal::ZERO.next(), Ordinal::new(1));
        assert_eq!(Ordinal::new(1).hostname("mongodb"), "mongodb-1");
    }

    #[test]
    fn test_ordinal_parse_errors() {
        assert!(matches!(
            "-1".parse::<Ordinal>().unwrap_err(),
            crate::IdError::InvalidOrdinal(_)
        ));
        assert!(matches!("".parse::<Ordinal>().unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [InstanceId::PREFIX, VolumeId::PREFIX, ReservationId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_ordinal_display_parses_back(n in any::<u32>()) {
            let ordinal = Ordinal::new(n);
            prop_assert_eq!(ordinal.to_string().parse::<Ordinal>().unwrap(), ordinal);
        }
    }
}
