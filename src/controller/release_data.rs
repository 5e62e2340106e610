//! Cross-tick update state kept in the `d8-release-data` ConfigMap

use crate::crd::release::parse_version;
use std::collections::BTreeMap;

pub const RELEASE_DATA_NAME: &str = "d8-release-data";

const KEY_IS_UPDATING: &str = "isUpdating";
const KEY_NOTIFIED: &str = "notified";
const KEY_VERSION: &str = "version";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseData {
    /// Set when the deployment image was patched, cleared once the new pod is ready
    pub is_updating: bool,
    /// A webhook notification was posted for the minor named by `version`
    pub notified: bool,
    pub version: String,
}

impl ReleaseData {
    pub fn from_map(data: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str| data.get(key).is_some_and(|v| v == "true");
        Self {
            is_updating: flag(KEY_IS_UPDATING),
            notified: flag(KEY_NOTIFIED),
            version: data.get(KEY_VERSION).cloned().unwrap_or_default(),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_IS_UPDATING.to_string(), self.is_updating.to_string()),
            (KEY_NOTIFIED.to_string(), self.notified.to_string()),
            (KEY_VERSION.to_string(), self.version.clone()),
        ])
    }

    /// True when a notification was already sent for this MAJOR.MINOR
    pub fn notified_for(&self, version: &semver::Version) -> bool {
        self.notified
            && parse_version(&self.version)
                .is_ok_and(|v| v.major == version.major && v.minor == version.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_data_map_uses_string_flags() {
        let data = ReleaseData {
            is_updating: true,
            notified: false,
            version: "v1.30.5".to_string(),
        };

        let map = data.to_map();

        assert_eq!(map.get("isUpdating").map(String::as_str), Some("true"));
        assert_eq!(map.get("notified").map(String::as_str), Some("false"));
        assert_eq!(map.get("version").map(String::as_str), Some("v1.30.5"));
        assert_eq!(ReleaseData::from_map(&map), data);
    }

    #[test]
    fn test_missing_keys_read_as_false() {
        assert_eq!(ReleaseData::from_map(&BTreeMap::new()), ReleaseData::default());
    }

    #[test]
    fn test_notified_for_compares_minor_only() {
        let data = ReleaseData {
            is_updating: false,
            notified: true,
            version: "v1.31.0".to_string(),
        };

        assert!(data.notified_for(&semver::Version::new(1, 31, 2)));
        assert!(!data.notified_for(&semver::Version::new(1, 32, 0)));
        assert!(!ReleaseData::default().notified_for(&semver::Version::new(1, 31, 0)));
    }
}
