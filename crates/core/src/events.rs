//! Realtime channel events and UI notifications.
//!
//! Events are closed unions tagged by `event`, matching the wire names of the
//! realtime channel. Receivers treat them as refresh hints and must tolerate
//! duplicates and gaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::*;
use crate::ids::*;

/// Events this session publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    JoinActivity {
        activity_id: ActivityId,
        participant: Participant,
    },
    LeaveActivity {
        activity_id: ActivityId,
        user_id: UserId,
    },
    AddTag {
        activity_id: ActivityId,
        tag: Tag,
    },
    VoteTag {
        activity_id: ActivityId,
        tag_id: TagId,
        user_id: UserId,
        votes: Vec<Vote>,
    },
    DeleteTag {
        activity_id: ActivityId,
        tag_id: TagId,
    },
    UpdateMapping {
        activity_id: ActivityId,
        mapping: Mapping,
    },
    ChangePhase {
        activity_id: ActivityId,
        phase: Phase,
    },
    CreateActivity {
        activity: Activity,
    },
    UpdateActivity {
        activity: Activity,
    },
    DeleteActivity {
        activity_id: ActivityId,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinActivity { .. } => "join_activity",
            Self::LeaveActivity { .. } => "leave_activity",
            Self::AddTag { .. } => "add_tag",
            Self::VoteTag { .. } => "vote_tag",
            Self::DeleteTag { .. } => "delete_tag",
            Self::UpdateMapping { .. } => "update_mapping",
            Self::ChangePhase { .. } => "change_phase",
            Self::CreateActivity { .. } => "create_activity",
            Self::UpdateActivity { .. } => "update_activity",
            Self::DeleteActivity { .. } => "delete_activity",
        }
    }

    pub fn activity_id(&self) -> &ActivityId {
        match self {
            Self::JoinActivity { activity_id, .. }
            | Self::LeaveActivity { activity_id, .. }
            | Self::AddTag { activity_id, .. }
            | Self::VoteTag { activity_id, .. }
            | Self::DeleteTag { activity_id, .. }
            | Self::UpdateMapping { activity_id, .. }
            | Self::ChangePhase { activity_id, .. }
            | Self::DeleteActivity { activity_id } => activity_id,
            Self::CreateActivity { activity } | Self::UpdateActivity { activity } => &activity.id,
        }
    }
}

/// Events other sessions' mutations produce on this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundEvent {
    ActivityCreated {
        activity: Activity,
    },
    ActivityUpdated {
        activity_id: ActivityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<Activity>,
    },
    TagAdded {
        activity_id: ActivityId,
        tag: Tag,
    },
    TagVoted {
        activity_id: ActivityId,
        tag_id: TagId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        votes: Option<Vec<Vote>>,
    },
    TagDeleted {
        activity_id: ActivityId,
        tag_id: TagId,
    },
    MappingUpdated {
        activity_id: ActivityId,
        mapping: Mapping,
    },
    PhaseChanged {
        activity_id: ActivityId,
        phase: Phase,
    },
    ParticipantsUpdated {
        activity_id: ActivityId,
        participants: Vec<Participant>,
    },
    ActivityDeleted {
        activity_id: ActivityId,
    },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivityCreated { .. } => "activity_created",
            Self::ActivityUpdated { .. } => "activity_updated",
            Self::TagAdded { .. } => "tag_added",
            Self::TagVoted { .. } => "tag_voted",
            Self::TagDeleted { .. } => "tag_deleted",
            Self::MappingUpdated { .. } => "mapping_updated",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::ParticipantsUpdated { .. } => "participants_updated",
            Self::ActivityDeleted { .. } => "activity_deleted",
        }
    }

    pub fn activity_id(&self) -> &ActivityId {
        match self {
            Self::ActivityCreated { activity } => &activity.id,
            Self::ActivityUpdated { activity_id, .. }
            | Self::TagAdded { activity_id, .. }
            | Self::TagVoted { activity_id, .. }
            | Self::TagDeleted { activity_id, .. }
            | Self::MappingUpdated { activity_id, .. }
            | Self::PhaseChanged { activity_id, .. }
            | Self::ParticipantsUpdated { activity_id, .. }
            | Self::ActivityDeleted { activity_id } => activity_id,
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub drained: usize,
    pub pending: usize,
    pub full_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl SyncStatus {
    pub fn new(finished_at: DateTime<Utc>) -> Self {
        Self {
            created: 0,
            updated: 0,
            deleted: 0,
            drained: 0,
            pending: 0,
            full_sync: false,
            error: None,
            finished_at,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    ActivityUpdated { activity_id: ActivityId },
    TagAdded { activity_id: ActivityId, tag_id: TagId },
    TagVoted { activity_id: ActivityId, tag_id: TagId },
    TagDeleted { activity_id: ActivityId, tag_id: TagId },
    MappingUpdated { activity_id: ActivityId, user_id: UserId },
    PhaseChanged { activity_id: ActivityId, phase: Phase },
    ParticipantsUpdated { activity_id: ActivityId },
    ActivityDeleted { activity_id: ActivityId },
    SyncCompleted(SyncStatus),
    SyncError(SyncStatus),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivityUpdated { .. } => "activity_updated",
            Self::TagAdded { .. } => "tag_added",
            Self::TagVoted { .. } => "tag_voted",
            Self::TagDeleted { .. } => "tag_deleted",
            Self::MappingUpdated { .. } => "mapping_updated",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::ParticipantsUpdated { .. } => "participants_updated",
            Self::ActivityDeleted { .. } => "activity_deleted",
            Self::SyncCompleted(_) => "sync_completed",
            Self::SyncError(_) => "sync_error",
        }
    }
}
