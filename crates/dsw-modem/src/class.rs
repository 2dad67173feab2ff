//! Data class labels

use std::fmt;
use std::str::FromStr;

use crate::error::ModemError;

/// Labels the modem understands
const KNOWN_CLASSES: &[&str] = &[
    "default", "mms", "supl", "dun", "hipri", "fota", "ims", "cbs", "ia", "emergency",
];

/// A named category of packet-data usage
///
/// Constructed only through parsing, so holding a `DataClass` means the label
/// passed the capability check at the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct DataClass(String);

impl DataClass {
    /// The default internet class
    pub fn default_class() -> Self {
        Self("default".to_string())
    }

    /// Whether this is the default internet class
    pub fn is_default(&self) -> bool {
        self.0 == "default"
    }

    /// The label as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All labels accepted by [`DataClass::from_str`]
    pub fn known() -> impl Iterator<Item = DataClass> {
        KNOWN_CLASSES.iter().map(|s| DataClass(s.to_string()))
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DataClass {
    type Err = ModemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_lowercase();
        if KNOWN_CLASSES.contains(&label.as_str()) {
            Ok(Self(label))
        } else {
            Err(ModemError::InvalidClass(s.to_string()))
        }
    }
}

impl TryFrom<String> for DataClass {
    type Error = ModemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataClass> for String {
    fn from(value: DataClass) -> Self {
        value.0
    }
}
