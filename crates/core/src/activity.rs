use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::*;
use crate::settings::ActivitySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Mapping,
    Ranking,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mapping => "mapping",
            Self::Ranking => "ranking",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Active,
    Completed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Gathering,
    Tagging,
    Mapping,
    MappingResults,
    Ranking,
    Results,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gathering => "gathering",
            Self::Tagging => "tagging",
            Self::Mapping => "mapping",
            Self::MappingResults => "mapping-results",
            Self::Ranking => "ranking",
            Self::Results => "results",
        }
    }

    /// Mapping activities never enter the ranking phase and vice versa.
    pub fn is_valid_for(&self, activity_type: ActivityType) -> bool {
        match self {
            Self::Gathering | Self::Tagging | Self::Results => true,
            Self::Mapping | Self::MappingResults => activity_type == ActivityType::Mapping,
            Self::Ranking => activity_type == ActivityType::Ranking,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_connected: bool,
}

impl Participant {
    pub fn new(id: UserId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            is_connected: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: TagId,
    pub text: String,
    pub creator_id: UserId,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub status: TagStatus,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(text: &str, creator_id: UserId, creator_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: TagId::generate(),
            text: text.trim().to_string(),
            creator_id,
            creator_name: creator_name.to_string(),
            votes: Vec::new(),
            comments: Vec::new(),
            status: TagStatus::Pending,
            created_at: now,
        }
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    pub fn has_vote_from(&self, user_id: &UserId) -> bool {
        self.votes.iter().any(|v| &v.user_id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub tag_id: TagId,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// One participant's placement of tags on the grid. Replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub is_complete: bool,
}

/// One participant's ordering of tags for ranking activities. Replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranking {
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub tag_ids: Vec<TagId>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: ActivityId,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub settings: ActivitySettings,
    pub status: ActivityStatus,
    pub phase: Phase,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub rankings: Vec<Ranking>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        id: ActivityId,
        activity_type: ActivityType,
        settings: ActivitySettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            activity_type,
            settings,
            status: ActivityStatus::Active,
            phase: Phase::Gathering,
            participants: Vec::new(),
            tags: Vec::new(),
            mappings: Vec::new(),
            rankings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == user_id)
    }

    pub fn tag(&self, tag_id: &TagId) -> Option<&Tag> {
        self.tags.iter().find(|t| &t.id == tag_id)
    }

    pub fn tag_mut(&mut self, tag_id: &TagId) -> Option<&mut Tag> {
        self.tags.iter_mut().find(|t| &t.id == tag_id)
    }

    pub fn tags_created_by(&self, user_id: &UserId) -> usize {
        self.tags.iter().filter(|t| &t.creator_id == user_id).count()
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    pub fn is_newer_than(&self, other: &Activity) -> bool {
        self.updated_at > other.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_camel_case_and_type_key() {
        let now = Utc::now();
        let activity = Activity::new(
            ActivityId::from("a-1"),
            ActivityType::Mapping,
            ActivitySettings::default(),
            now,
        );
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "mapping");
        assert_eq!(json["phase"], "gathering");
        assert_eq!(json["status"], "active");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn mapping_results_phase_name() {
        let json = serde_json::to_string(&Phase::MappingResults).unwrap();
        assert_eq!(json, "\"mapping-results\"");
        assert_eq!(Phase::MappingResults.as_str(), "mapping-results");
    }

    #[test]
    fn phase_validity_per_type() {
        assert!(Phase::Mapping.is_valid_for(ActivityType::Mapping));
        assert!(!Phase::Mapping.is_valid_for(ActivityType::Ranking));
        assert!(Phase::Ranking.is_valid_for(ActivityType::Ranking));
        assert!(!Phase::Ranking.is_valid_for(ActivityType::Mapping));
        assert!(Phase::Results.is_valid_for(ActivityType::Ranking));
    }

    #[test]
    fn missing_collections_deserialize_empty() {
        let json = r#"{
            "id": "a-2",
            "type": "ranking",
            "status": "active",
            "phase": "tagging",
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:00:00Z"
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert!(activity.tags.is_empty());
        assert!(activity.participants.is_empty());
        assert_eq!(activity.activity_type, ActivityType::Ranking);
    }

    #[test]
    fn tag_vote_helpers() {
        let now = Utc::now();
        let mut tag = Tag::new("  trust  ", UserId::from("u1"), "Ana", now);
        assert_eq!(tag.text, "trust");
        assert_eq!(tag.vote_count(), 0);
        tag.votes.push(Vote {
            user_id: UserId::from("u2"),
            user_name: "Ben".into(),
            timestamp: now,
        });
        assert!(tag.has_vote_from(&UserId::from("u2")));
        assert!(!tag.has_vote_from(&UserId::from("u1")));
    }
}
