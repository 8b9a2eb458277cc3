use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// An address or offset, serialized as a `0x` prefixed hex string.
///
/// When deserializing, plain JSON numbers and decimal strings are accepted as well.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HexValue(pub u64);

impl fmt::Display for HexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for HexValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl FromStr for HexValue {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<HexValue, ParseIntError> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(HexValue),
            None => s.parse().map(HexValue),
        }
    }
}

impl<'de> Deserialize<'de> for HexValue {
    fn deserialize<D>(deserializer: D) -> Result<HexValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexVisitor;

        impl de::Visitor<'_> for HexVisitor {
            type Value = HexValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a non-negative number or hex string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(HexValue)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(HexValue(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(HexVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_value() {
        let value: HexValue = serde_json::from_str("11723767").unwrap();
        assert_eq!(value, HexValue(0xb2e3f7));
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"0xb2e3f7\"");

        let value: HexValue = serde_json::from_str("\"0x4CA\"").unwrap();
        assert_eq!(value, HexValue(0x4ca));
        let value: HexValue = serde_json::from_str("\"1226\"").unwrap();
        assert_eq!(value, HexValue(0x4ca));

        assert!(serde_json::from_str::<HexValue>("-1").is_err());
        assert!(serde_json::from_str::<HexValue>("\"0xzz\"").is_err());
    }
}
