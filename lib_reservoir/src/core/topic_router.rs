//! # Topic Router
//!
//! Static, bidirectional mapping between logical sources (`"shasta"`) and
//! transport channels (`"SHASTA/WML"`). The session manager resolves the source
//! of every inbound message through this table instead of picking the channel
//! string apart, so a change in naming can never silently misfile data.

use std::collections::HashMap;

use crate::core::error::PubSubError;

/// Default channel suffix appended to the upper-cased source name.
pub const DEFAULT_CHANNEL_SUFFIX: &str = "WML";

/// # Topic Router
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    /// Registration order, used for subscribe-on-connect.
    entries: Vec<(String, String)>,
    by_source: HashMap<String, String>,
    by_channel: HashMap<String, String>,
}

impl TopicRouter {
    /// Builds a router from explicit `(source, channel)` pairs.
    ///
    /// # Errors
    /// `ConfigurationError` on an empty name, a source that is not lowercase,
    /// a channel whose first segment is not uppercase, or any duplicate.
    pub fn new<I, S, C>(pairs: I) -> Result<Self, PubSubError>
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<String>,
    {
        let mut router = TopicRouter::default();

        for (source, channel) in pairs {
            let source = source.into();
            let channel = channel.into();
            validate_pair(&source, &channel)?;

            if router.by_source.contains_key(&source) {
                return Err(PubSubError::configuration(format!(
                    "source '{}' registered twice",
                    source
                )));
            }
            if router.by_channel.contains_key(&channel) {
                return Err(PubSubError::configuration(format!(
                    "channel '{}' registered twice",
                    channel
                )));
            }

            router.by_source.insert(source.clone(), channel.clone());
            router.by_channel.insert(channel.clone(), source.clone());
            router.entries.push((source, channel));
        }

        Ok(router)
    }

    /// Derives `"<SOURCE>/<suffix>"` channels for every source.
    pub fn from_sources<I, S>(sources: I, suffix: &str) -> Result<Self, PubSubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pairs: Vec<(String, String)> = sources
            .into_iter()
            .map(|s| {
                let source = s.as_ref().trim().to_string();
                let channel = format!("{}/{}", source.to_uppercase(), suffix);
                (source, channel)
            })
            .collect();
        Self::new(pairs)
    }

    /// Channel bound to `source`.
    pub fn channel_for(&self, source: &str) -> Result<&str, PubSubError> {
        self.by_source
            .get(source)
            .map(String::as_str)
            .ok_or_else(|| PubSubError::configuration(format!("unregistered source '{}'", source)))
    }

    /// Source bound to `channel`.
    pub fn source_for(&self, channel: &str) -> Result<&str, PubSubError> {
        self.by_channel
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| {
                PubSubError::configuration(format!("unregistered channel '{}'", channel))
            })
    }

    /// Every channel, in registration order.
    pub fn channels(&self) -> Vec<String> {
        self.entries.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Every source, in registration order.
    pub fn sources(&self) -> Vec<String> {
        self.entries.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_pair(source: &str, channel: &str) -> Result<(), PubSubError> {
    if source.is_empty() || channel.is_empty() {
        return Err(PubSubError::configuration("source and channel names must not be empty"));
    }
    if source != source.to_lowercase() {
        return Err(PubSubError::configuration(format!(
            "source '{}' must be lowercase",
            source
        )));
    }
    let segment = channel.split('/').next().unwrap_or_default();
    if segment.is_empty() || segment != segment.to_uppercase() {
        return Err(PubSubError::configuration(format!(
            "channel '{}' must start with an uppercase segment",
            channel
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservoirs() -> TopicRouter {
        TopicRouter::from_sources(["shasta", "oroville", "sonoma"], DEFAULT_CHANNEL_SUFFIX).unwrap()
    }

    #[test]
    fn lookups_are_inverse() {
        let router = reservoirs();
        for source in router.sources() {
            let channel = router.channel_for(&source).unwrap();
            assert_eq!(router.source_for(channel).unwrap(), source);
        }
        assert_eq!(router.channel_for("shasta").unwrap(), "SHASTA/WML");
        assert_eq!(router.source_for("OROVILLE/WML").unwrap(), "oroville");
    }

    #[test]
    fn channels_keep_registration_order() {
        assert_eq!(
            reservoirs().channels(),
            vec!["SHASTA/WML", "OROVILLE/WML", "SONOMA/WML"]
        );
    }

    #[test]
    fn unregistered_names_are_configuration_errors() {
        let router = reservoirs();
        assert!(matches!(
            router.channel_for("folsom"),
            Err(PubSubError::ConfigurationError(_))
        ));
        // Reverse lookup is exact: no case folding.
        assert!(matches!(
            router.source_for("shasta/wml"),
            Err(PubSubError::ConfigurationError(_))
        ));
    }

    #[test]
    fn counts_registered_pairs() {
        assert_eq!(reservoirs().len(), 3);
        assert!(!reservoirs().is_empty());
        let empty =
            TopicRouter::from_sources(Vec::<String>::new(), DEFAULT_CHANNEL_SUFFIX).unwrap();
        assert!(empty.is_empty());
        assert!(empty.channels().is_empty());
    }

    #[test]
    fn duplicates_are_rejected() {
        assert!(TopicRouter::new([("shasta", "SHASTA/WML"), ("shasta", "OTHER/WML")]).is_err());
        assert!(TopicRouter::new([("shasta", "SHASTA/WML"), ("oroville", "SHASTA/WML")]).is_err());
    }

    #[test]
    fn casing_convention_is_enforced() {
        assert!(TopicRouter::new([("Shasta", "SHASTA/WML")]).is_err());
        assert!(TopicRouter::new([("shasta", "shasta/WML")]).is_err());
        assert!(TopicRouter::new([("", "SHASTA/WML")]).is_err());
    }
}
