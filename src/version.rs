//! Controller version parsing and minimum-version checks.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Lowest controller version the subscriber supports. Comparison walks
/// major, then minor, then build; the patch letter is ignored.
pub const MINIMUM_SUPPORTED_VERSION: &str = "2.2(1a)";

/// Parsed controller/switch firmware version, e.g. `4.1(2g)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub patch: String,
}

impl FirmwareVersion {
    /// Parse a version string of the form `major.minor(build[patch])`.
    pub fn parse(version: &str) -> Option<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^(?P<major>\d+)\.(?P<minor>\d+)\((?P<build>\d+)(?P<patch>[a-z0-9]*)\)")
                .expect("version regex")
        });
        let caps = re.captures(version.trim())?;
        Some(Self {
            major: caps["major"].parse().ok()?,
            minor: caps["minor"].parse().ok()?,
            build: caps["build"].parse().ok()?,
            patch: caps["patch"].to_string(),
        })
    }

    /// Minimum-version check on (major, minor, build), ignoring patch.
    pub fn at_least(&self, min: &FirmwareVersion) -> bool {
        (self.major, self.minor, self.build) >= (min.major, min.minor, min.build)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({}{})", self.major, self.minor, self.build, self.patch)
    }
}

/// Per-node firmware record returned by the version report.
#[derive(Debug, Clone)]
pub struct NodeVersion {
    pub node: u32,
    pub version: String,
}

/// Firmware versions for the fabric, split by node class.
#[derive(Debug, Clone, Default)]
pub struct VersionReport {
    pub controller: Vec<NodeVersion>,
    pub switch: Vec<NodeVersion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let v = FirmwareVersion::parse("4.1(2g)").unwrap();
        assert_eq!(v.major, 4);
        assert_eq!(v.minor, 1);
        assert_eq!(v.build, 2);
        assert_eq!(v.patch, "g");
        assert_eq!(v.to_string(), "4.1(2g)");
        assert!(FirmwareVersion::parse("garbage").is_none());
        assert!(FirmwareVersion::parse("4.1").is_none());
    }

    #[test]
    fn test_minimum_version_ignores_patch() {
        let min = FirmwareVersion::parse(MINIMUM_SUPPORTED_VERSION).unwrap();
        assert!(FirmwareVersion::parse("2.2(1a)").unwrap().at_least(&min));
        assert!(FirmwareVersion::parse("2.2(1zz)").unwrap().at_least(&min));
        assert!(FirmwareVersion::parse("5.0(1k)").unwrap().at_least(&min));
        assert!(!FirmwareVersion::parse("2.1(9x)").unwrap().at_least(&min));
        assert!(!FirmwareVersion::parse("1.9(9)").unwrap().at_least(&min));
    }
}
