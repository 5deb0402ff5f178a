use serde::Serialize;

/// Namespace tuple plus track name, used as the registry key for a track.
#[derive(Debug, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct FullTrackName {
    track_namespace: Vec<String>,
    track_name: String,
}

impl FullTrackName {
    pub fn new(track_namespace: Vec<String>, track_name: String) -> Self {
        Self {
            track_namespace,
            track_name,
        }
    }

    pub fn track_namespace(&self) -> &Vec<String> {
        &self.track_namespace
    }

    pub fn track_name(&self) -> &str {
        &self.track_name
    }
}

impl std::fmt::Display for FullTrackName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.track_namespace.join("/"), self.track_name)
    }
}
