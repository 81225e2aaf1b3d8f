use crate::types::Cluster;
use eyre::{
    Context as _,
    Result,
};
use regex::Regex;

/// Pattern that lets every cluster through.
pub const MATCH_ALL: &str = ".*";

/// Decides which clusters are scraped, by matching their display name.
///
/// The pattern is searched anywhere in the name, anchor it with `^...$` for a full match.
#[derive(Debug, Clone)]
pub struct ClusterFilter {
    pattern: Regex,
}

impl ClusterFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).with_context(|| format!("Invalid cluster filtering regex: {pattern}"))?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, cluster: &Cluster) -> bool {
        self.pattern.is_match(&cluster.name)
    }

}

impl Default for ClusterFilter {
    fn default() -> Self {
        Self {
            pattern: Regex::new(MATCH_ALL).expect("match-all pattern compiles"),
        }
    }
}
