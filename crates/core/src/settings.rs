use serde::{Deserialize, Serialize};

pub const DEFAULT_MINIMUM_VOTES: u32 = 1;
pub const DEFAULT_TOP_N_COUNT: u32 = 5;
pub const DEFAULT_X_AXIS: (&str, &str) = ("Less Important", "More Important");
pub const DEFAULT_Y_AXIS: (&str, &str) = ("Less Familiar", "More Familiar");

fn default_true() -> bool {
    true
}

/// Facilitator-owned configuration of an activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub entry: EntrySettings,
    #[serde(default)]
    pub tag_creation: TagCreationSettings,
    #[serde(default)]
    pub mapping: MappingSettings,
    #[serde(default)]
    pub results: ResultsSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySettings {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagCreationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tags_per_participant: Option<u32>,
    #[serde(default)]
    pub voting: VotingSettings,
}

impl Default for TagCreationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tags_per_participant: None,
            voting: VotingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThresholdType {
    Off,
    Minimum,
    TopN,
}

/// Vote-threshold policy deciding which tags reach `approved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "VotingSettings::default_threshold_type")]
    pub threshold_type: ThresholdType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_votes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n_count: Option<u32>,
}

impl VotingSettings {
    fn default_threshold_type() -> ThresholdType {
        ThresholdType::Minimum
    }

    pub fn minimum(minimum_votes: u32) -> Self {
        Self {
            enabled: true,
            threshold_type: ThresholdType::Minimum,
            minimum_votes: Some(minimum_votes),
            top_n_count: None,
        }
    }

    pub fn top_n(count: u32) -> Self {
        Self {
            enabled: true,
            threshold_type: ThresholdType::TopN,
            minimum_votes: None,
            top_n_count: Some(count),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn effective_minimum(&self) -> u32 {
        self.minimum_votes.unwrap_or(DEFAULT_MINIMUM_VOTES)
    }

    pub fn effective_top_n(&self) -> u32 {
        self.top_n_count.unwrap_or(DEFAULT_TOP_N_COUNT)
    }
}

impl Default for VotingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_type: ThresholdType::Minimum,
            minimum_votes: Some(DEFAULT_MINIMUM_VOTES),
            top_n_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisLabels {
    #[serde(default)]
    pub min_label: String,
    #[serde(default)]
    pub max_label: String,
}

impl AxisLabels {
    pub fn new(min_label: &str, max_label: &str) -> Self {
        Self {
            min_label: min_label.to_string(),
            max_label: max_label.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSettings {
    #[serde(default = "MappingSettings::default_x_axis")]
    pub x_axis: AxisLabels,
    #[serde(default = "MappingSettings::default_y_axis")]
    pub y_axis: AxisLabels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
}

impl MappingSettings {
    fn default_x_axis() -> AxisLabels {
        AxisLabels::new(DEFAULT_X_AXIS.0, DEFAULT_X_AXIS.1)
    }

    fn default_y_axis() -> AxisLabels {
        AxisLabels::new(DEFAULT_Y_AXIS.0, DEFAULT_Y_AXIS.1)
    }
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            x_axis: Self::default_x_axis(),
            y_axis: Self::default_y_axis(),
            grid_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSettings {
    #[serde(default = "default_true")]
    pub show_participant_names: bool,
    #[serde(default = "default_true")]
    pub show_vote_counts: bool,
}

impl Default for ResultsSettings {
    fn default() -> Self {
        Self {
            show_participant_names: true,
            show_vote_counts: true,
        }
    }
}
