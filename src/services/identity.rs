use uuid::Uuid;

use crate::services::remote::RemoteEvent;

/// Identity codec: embeds and extracts the correlation identifier that marks
/// an event as ours.
///
/// Three redundant channels, tried in priority order on extraction:
/// 1. the `calbridge_id` private extended property (primary; survives edits),
/// 2. an HTML comment appended to the description,
/// 3. zero-width-space markers bracketing the id at the end of the title
///    (skipped for busy blocks so their titles stay clean).
pub struct IdentityCodec;

pub const PRIVATE_PROPERTY_KEY: &str = "calbridge_id";

const DESCRIPTION_MARKER_PREFIX: &str = "<!-- [CB:";
const DESCRIPTION_MARKER_SUFFIX: &str = "] -->";
const TITLE_MARKER: char = '\u{200B}';

/// Textual markers used before identifier embedding existed. Detection of
/// these drives the classifier's legacy-upgrade rule only.
pub const LEGACY_TITLE_PREFIX: &str = "[CalBridge] ";
pub const LEGACY_DESCRIPTION_TAG: &str = "Synced by CalBridge";

/// Where an extracted identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    PrivateProperty,
    Description,
    Title,
}

/// Per-channel view of an event's embedded identifiers; used to detect
/// partial writes.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub private_property: Option<String>,
    pub description: Option<String>,
    pub title: Option<String>,
}

impl ChannelReport {
    /// Consistent means: no two present channels disagree, and the primary
    /// channel is present whenever any backup is. A missing primary with a
    /// present backup indicates a partial write and must not be trusted
    /// silently.
    pub fn is_consistent(&self) -> bool {
        let present: Vec<&String> = [&self.private_property, &self.description, &self.title]
            .into_iter()
            .flatten()
            .collect();
        if present.is_empty() {
            return true;
        }
        if self.private_property.is_none() {
            return false;
        }
        present.windows(2).all(|w| w[0] == w[1])
    }

    pub fn resolved(&self) -> Option<&str> {
        self.private_property
            .as_deref()
            .or(self.description.as_deref())
            .or(self.title.as_deref())
    }
}

impl IdentityCodec {
    /// Mint a fresh correlation identifier (random 128-bit, canonical form).
    pub fn new_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Embed `correlation_id` into all channels of `event`. Existing markers
    /// are stripped first so repeated embedding is idempotent. The title
    /// channel is skipped when `include_title_channel` is false (busy
    /// blocks).
    pub fn embed(event: &mut RemoteEvent, correlation_id: &str, include_title_channel: bool) {
        event
            .private_properties
            .insert(PRIVATE_PROPERTY_KEY.to_string(), correlation_id.to_string());

        let description = Self::clean_description(event.description_or_empty());
        let marker = format!(
            "{}{}{}",
            DESCRIPTION_MARKER_PREFIX, correlation_id, DESCRIPTION_MARKER_SUFFIX
        );
        event.description = Some(if description.is_empty() {
            marker
        } else {
            format!("{}\n{}", description, marker)
        });

        if include_title_channel {
            let title = Self::clean_title(event.title_or_empty());
            event.title = Some(format!(
                "{}{}{}{}",
                title, TITLE_MARKER, correlation_id, TITLE_MARKER
            ));
        }
    }

    /// Extract the correlation identifier, trying channels in priority
    /// order. Returns the first well-formed match; callers must accept any
    /// representation an earlier version of the service produced.
    pub fn extract(event: &RemoteEvent) -> Option<String> {
        Self::extract_with_channel(event).map(|(id, _)| id)
    }

    pub fn extract_with_channel(event: &RemoteEvent) -> Option<(String, Channel)> {
        if let Some(id) = Self::from_private_property(event) {
            return Some((id, Channel::PrivateProperty));
        }
        if let Some(id) = Self::from_description(event.description_or_empty()) {
            return Some((id, Channel::Description));
        }
        if let Some(id) = Self::from_title(event.title_or_empty()) {
            return Some((id, Channel::Title));
        }
        None
    }

    /// Read every channel independently. Disagreement or a missing primary
    /// with a present backup signals a partial write; log it, do not trust
    /// it silently.
    pub fn validate(event: &RemoteEvent) -> ChannelReport {
        let report = ChannelReport {
            private_property: Self::from_private_property(event),
            description: Self::from_description(event.description_or_empty()),
            title: Self::from_title(event.title_or_empty()),
        };
        if !report.is_consistent() {
            tracing::warn!(
                event_id = event.id.as_deref().unwrap_or("<unknown>"),
                "identifier channels disagree: {:?}",
                report
            );
        }
        report
    }

    fn from_private_property(event: &RemoteEvent) -> Option<String> {
        event
            .private_properties
            .get(PRIVATE_PROPERTY_KEY)
            .filter(|v| Self::is_well_formed(v))
            .cloned()
    }

    fn from_description(description: &str) -> Option<String> {
        let start = description.find(DESCRIPTION_MARKER_PREFIX)?;
        let rest = &description[start + DESCRIPTION_MARKER_PREFIX.len()..];
        let end = rest.find(DESCRIPTION_MARKER_SUFFIX)?;
        let candidate = &rest[..end];
        Self::is_well_formed(candidate).then(|| candidate.to_string())
    }

    fn from_title(title: &str) -> Option<String> {
        let mut parts = title.split(TITLE_MARKER);
        parts.next();
        parts.find(|candidate| Self::is_well_formed(candidate)).map(str::to_string)
    }

    fn is_well_formed(candidate: &str) -> bool {
        Uuid::parse_str(candidate).is_ok()
    }

    /// Remove title markers for display. Non-identifier text between stray
    /// zero-width spaces is preserved.
    pub fn clean_title(title: &str) -> String {
        let mut out = String::with_capacity(title.len());
        for part in title.split(TITLE_MARKER) {
            if !Self::is_well_formed(part) {
                out.push_str(part);
            }
        }
        out.trim_end().to_string()
    }

    /// Remove description markers for display.
    pub fn clean_description(description: &str) -> String {
        let mut out = String::with_capacity(description.len());
        let mut rest = description;
        while let Some(start) = rest.find(DESCRIPTION_MARKER_PREFIX) {
            out.push_str(&rest[..start]);
            let after = &rest[start + DESCRIPTION_MARKER_PREFIX.len()..];
            match after.find(DESCRIPTION_MARKER_SUFFIX) {
                Some(end) => rest = &after[end + DESCRIPTION_MARKER_SUFFIX.len()..],
                None => {
                    // Unterminated marker; keep it as-is.
                    out.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out.trim_end().to_string()
    }

    /// True when the event carries pre-identifier textual markers.
    pub fn has_legacy_markers(event: &RemoteEvent) -> bool {
        event.title_or_empty().starts_with(LEGACY_TITLE_PREFIX)
            || event.description_or_empty().contains(LEGACY_DESCRIPTION_TAG)
    }
}
