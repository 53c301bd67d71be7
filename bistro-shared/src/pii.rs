use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A wrapper for customer contact data (emails, phone numbers) that masks its
/// value in `Debug`/`Display` output so it never lands in logs.
///
/// Serialization passes the real value through: API responses and the
/// notification gateway need it.
#[derive(Clone, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl From<String> for Masked<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Masked<String> {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_and_display_hide_value() {
        let email = Masked::from("ada@example.com");
        assert_eq!(format!("{:?}", email), "********");
        assert_eq!(format!("{}", email), "********");
        assert_eq!(email.expose(), "ada@example.com");
    }

    #[test]
    fn test_serde_passes_value_through() {
        let phone = Masked::from("+15550100");
        let json = serde_json::to_string(&phone).unwrap();
        assert_eq!(json, "\"+15550100\"");

        let back: Masked<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, phone);
    }
}
