use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A biometric channel the engine can authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Face,
    Fingerprint,
    Iris,
    Palm,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Face,
        Modality::Fingerprint,
        Modality::Iris,
        Modality::Palm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Face => "face",
            Modality::Fingerprint => "fingerprint",
            Modality::Iris => "iris",
            Modality::Palm => "palm",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security tier required by a door or requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl SecurityLevel {
    pub fn level(&self) -> u8 {
        match self {
            SecurityLevel::Low => 1,
            SecurityLevel::Medium => 2,
            SecurityLevel::High => 3,
            SecurityLevel::Critical => 4,
        }
    }

    /// Minimum number of distinct modalities a multimodal request must carry.
    pub fn min_modalities(&self) -> usize {
        match self {
            SecurityLevel::Low | SecurityLevel::Medium => 1,
            SecurityLevel::High => 2,
            SecurityLevel::Critical => 3,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Per-request risk classification, derived by the strategy manager and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Blacklisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Trusted,
    Unknown,
    Suspicious,
    Blacklisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Corporate,
    Private,
    PublicWifi,
    Cellular,
    Unknown,
}

impl NetworkType {
    pub fn is_public(&self) -> bool {
        matches!(self, NetworkType::PublicWifi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Entry,
    Exit,
    Temporary,
    Maintenance,
    Emergency,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessType::Entry => "entry",
            AccessType::Exit => "exit",
            AccessType::Temporary => "temporary",
            AccessType::Maintenance => "maintenance",
            AccessType::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// Generates ids of the form `PREFIX-<millis>-<n>`, unique within a process.
pub struct OperationIdGenerator {
    prefix: &'static str,
    counter: AtomicU64,
}

impl OperationIdGenerator {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}-{}-{}",
            self.prefix,
            chrono::Utc::now().timestamp_millis(),
            n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_levels_are_ordered() {
        assert!(SecurityLevel::Low < SecurityLevel::Critical);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn min_modalities_rise_with_security_level() {
        assert_eq!(SecurityLevel::Low.min_modalities(), 1);
        assert_eq!(SecurityLevel::High.min_modalities(), 2);
        assert_eq!(SecurityLevel::Critical.min_modalities(), 3);
    }

    #[test]
    fn operation_ids_are_unique() {
        let gen = OperationIdGenerator::new("OP");
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(a.starts_with("OP-"));
    }
}
