//! Ordered-triple version numbers used for both `schema_version` and `content_version`.
//!
//! Manifests are free to spell a version as either a `"major.minor.patch"` string or
//! an explicit `{major, minor, patch}` table; both deserialize to the same [`Version`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid version string `{0}`, expected `major.minor.patch`")]
pub struct ParseVersionError(String);

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseVersionError(s.to_string()));
        };
        let parse = |p: &str| p.parse::<u64>().map_err(|_| ParseVersionError(s.to_string()));
        Ok(Self::new(parse(major)?, parse(minor)?, parse(patch)?))
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            String(String),
            Table { major: u64, minor: u64, patch: u64 },
        }

        match Repr::deserialize(deserializer)? {
            Repr::String(s) => Version::from_str(&s).map_err(serde::de::Error::custom),
            Repr::Table {
                major,
                minor,
                patch,
            } => Ok(Version::new(major, minor, patch)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1.0.0", Version::new(1, 0, 0))]
    #[case("0.0.1", Version::new(0, 0, 1))]
    #[case("10.20.30", Version::new(10, 20, 30))]
    fn parses_valid(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(input.parse::<Version>().unwrap(), expected);
    }

    #[rstest]
    #[case("1.0")]
    #[case("1.0.0.0")]
    #[case("a.b.c")]
    #[case("")]
    fn rejects_invalid(#[case] input: &str) {
        assert!(input.parse::<Version>().is_err());
    }

    #[test]
    fn ordering_is_lexicographic_on_the_triple() {
        assert!(Version::new(1, 0, 0) < Version::new(1, 1, 0));
        assert!(Version::new(1, 9, 9) < Version::new(2, 0, 0));
        assert!(Version::new(1, 0, 0) == Version::new(1, 0, 0));
    }

    #[test]
    fn round_trips_through_json_string_form() {
        let v = Version::new(1, 2, 3);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.2.3\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn deserializes_table_form() {
        let json = r#"{"major":1,"minor":2,"patch":3}"#;
        let v: Version = serde_json::from_str(json).unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
    }

    #[test]
    fn display_matches_dotted_form() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "1.2.3");
    }
}
