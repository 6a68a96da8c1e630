use std::fmt;

/// The kind of forensic artifact a source database was carved from.
///
/// The label drives anchor-priority ranking and timestamp-column detection
/// hints; unrecognized labels are preserved verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactType {
    Prefetch,
    ShimCache,
    AmCache,
    EventLogs,
    Mft,
    Lnk,
    JumpList,
    Srum,
    Registry,
    Other(String),
}

impl ArtifactType {
    /// Canonical display name as it appears in wing documents.
    pub fn name(&self) -> &str {
        match self {
            ArtifactType::Prefetch => "Prefetch",
            ArtifactType::ShimCache => "ShimCache",
            ArtifactType::AmCache => "AmCache",
            ArtifactType::EventLogs => "EventLogs",
            ArtifactType::Mft => "MFT",
            ArtifactType::Lnk => "LNK",
            ArtifactType::JumpList => "JumpList",
            ArtifactType::Srum => "SRUM",
            ArtifactType::Registry => "Registry",
            ArtifactType::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "prefetch" => ArtifactType::Prefetch,
            "shimcache" | "shim_cache" | "appcompatcache" => ArtifactType::ShimCache,
            "amcache" | "am_cache" => ArtifactType::AmCache,
            "eventlogs" | "event_logs" | "logs" | "evtx" => ArtifactType::EventLogs,
            "mft" => ArtifactType::Mft,
            "lnk" | "shortcut" | "shortcuts" => ArtifactType::Lnk,
            "jumplist" | "jump_list" | "jumplists" => ArtifactType::JumpList,
            "srum" => ArtifactType::Srum,
            "registry" => ArtifactType::Registry,
            _ => ArtifactType::Other(name.trim().to_string()),
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<String> for ArtifactType {
    fn from(value: String) -> Self {
        ArtifactType::parse(&value)
    }
}

impl From<ArtifactType> for String {
    fn from(value: ArtifactType) -> Self {
        value.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(ArtifactType::parse("prefetch"), ArtifactType::Prefetch);
        assert_eq!(ArtifactType::parse("PREFETCH"), ArtifactType::Prefetch);
        assert_eq!(ArtifactType::parse("shim_cache"), ArtifactType::ShimCache);
        assert_eq!(ArtifactType::parse("evtx"), ArtifactType::EventLogs);
    }

    #[test]
    fn unknown_labels_round_trip() {
        let custom = ArtifactType::parse("BrowserHistory");
        assert_eq!(custom, ArtifactType::Other("BrowserHistory".to_string()));
        assert_eq!(custom.name(), "BrowserHistory");
    }
}
