use std::fmt;

/// All known lookup domains.
///
/// Each domain gets its own subdirectory in the cache directory, so keys from
/// different domains can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    TechSpecs,
    RepairTimes,
    DefectManual,
    Analysis,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::TechSpecs => "tech_specs",
            Self::RepairTimes => "repair_times",
            Self::DefectManual => "defect_manual",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
