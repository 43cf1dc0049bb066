use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::*;
use crate::settings::ActivitySettings;

/// Partial update limited to the fields the remote PATCH endpoint accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ActivitySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActivityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Vec<Mapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rankings: Option<Vec<Ranking>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActivityPatch {
    /// Every allow-listed field of `activity`.
    pub fn from_activity(activity: &Activity) -> Self {
        Self {
            settings: Some(activity.settings.clone()),
            status: Some(activity.status),
            phase: Some(activity.phase),
            tags: Some(activity.tags.clone()),
            mappings: Some(activity.mappings.clone()),
            rankings: Some(activity.rankings.clone()),
            participants: Some(activity.participants.clone()),
            updated_at: Some(activity.updated_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite the present fields. A completed activity never goes back to
    /// active.
    pub fn apply_to(&self, activity: &mut Activity) {
        if let Some(settings) = &self.settings {
            activity.settings = settings.clone();
        }
        if let Some(status) = self.status {
            if activity.status != ActivityStatus::Completed {
                activity.status = status;
            }
        }
        if let Some(phase) = self.phase {
            activity.phase = phase;
        }
        if let Some(tags) = &self.tags {
            activity.tags = tags.clone();
        }
        if let Some(mappings) = &self.mappings {
            activity.mappings = mappings.clone();
        }
        if let Some(rankings) = &self.rankings {
            activity.rankings = rankings.clone();
        }
        if let Some(participants) = &self.participants {
            activity.participants = participants.clone();
        }
        if let Some(updated_at) = self.updated_at {
            activity.updated_at = updated_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ActivityId, UserId};
    use chrono::Duration;

    fn activity() -> Activity {
        Activity::new(
            ActivityId::from("a-1"),
            ActivityType::Mapping,
            ActivitySettings::default(),
            Utc::now(),
        )
    }

    #[test]
    fn full_patch_reproduces_document() {
        let base = activity();
        let mut source = base.clone();
        source.phase = Phase::Mapping;
        source.participants.push(Participant::new(UserId::from("u1"), "Ana"));
        source.updated_at += Duration::seconds(3);

        let mut target = base;
        ActivityPatch::from_activity(&source).apply_to(&mut target);
        assert_eq!(target, source);
    }

    #[test]
    fn absent_fields_are_untouched() {
        let mut target = activity();
        target.phase = Phase::Tagging;
        let patch = ActivityPatch {
            status: Some(ActivityStatus::Completed),
            ..Default::default()
        };
        patch.apply_to(&mut target);
        assert_eq!(target.phase, Phase::Tagging);
        assert_eq!(target.status, ActivityStatus::Completed);
    }

    #[test]
    fn completed_status_does_not_reverse() {
        let mut target = activity();
        target.status = ActivityStatus::Completed;
        let patch = ActivityPatch {
            status: Some(ActivityStatus::Active),
            ..Default::default()
        };
        patch.apply_to(&mut target);
        assert_eq!(target.status, ActivityStatus::Completed);
    }

    #[test]
    fn serializes_only_present_fields() {
        let patch = ActivityPatch {
            phase: Some(Phase::MappingResults),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "phase": "mapping-results" }));
        assert!(ActivityPatch::default().is_empty());
        assert!(!patch.is_empty());
    }
}
