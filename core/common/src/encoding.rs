//! Serde helpers for binary fields in persisted JSON.

/// Serialize byte containers as standard base64 strings.
///
/// Works for `Vec<u8>` and fixed-size arrays; a decoded value of the wrong
/// length fails deserialization.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        let len = decoded.len();
        T::try_from(decoded)
            .map_err(|_| D::Error::custom(format!("unexpected byte length {}", len)))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Fixture {
        #[serde(with = "super::base64_bytes")]
        fixed: [u8; 4],
        #[serde(with = "super::base64_bytes")]
        dynamic: Vec<u8>,
    }

    #[test]
    fn test_base64_fields() {
        let value = Fixture {
            fixed: [1, 2, 3, 4],
            dynamic: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"fixed":"AQIDBA==","dynamic":"aGVsbG8="}"#);
        let back: Fixture = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let json = r#"{"fixed":"AQID","dynamic":""}"#;
        assert!(serde_json::from_str::<Fixture>(json).is_err());
    }
}
