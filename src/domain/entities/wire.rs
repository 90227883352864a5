//! Decimal-string carriage of 64-bit integer fields
//!
//! Device offsets and sizes are unsigned 64-bit everywhere inside the
//! engine. Consumers on the other side of the event stream may not have a
//! native 64-bit integer, so every offset/size-class field crosses the
//! boundary as a decimal string.

pub mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>().map_err(serde::de::Error::custom)
    }
}

/// Same carriage for optional fields.
pub mod u64_string_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => s.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::u64_string")]
        offset: u64,
    }

    #[test]
    fn round_trips_past_2_pow_53() {
        let sample = Sample {
            offset: (1u64 << 53) + 7,
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"9007199254740999\""));
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.offset, sample.offset);
    }
}
