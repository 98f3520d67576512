/// Dimensions attached to relay counters and histograms.
///
/// Message ids are logged, never used as metric labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryLabels {
    pub owner_id: String,
    pub channel: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(2 + self.extra.len());
        tags.push(("owner_id".into(), self.owner_id.clone()));
        if let Some(channel) = &self.channel {
            tags.push(("channel".into(), channel.clone()));
        }
        tags.extend(self.extra.iter().cloned());
        tags
    }
}
