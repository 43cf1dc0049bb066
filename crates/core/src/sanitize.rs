//! Normalization applied to every document before it leaves the client, so
//! the remote store never receives a structurally invalid activity.

use crate::activity::{Activity, Participant, Phase, Tag};
use crate::ids::UserId;
use crate::merge::dedup_tags;
use crate::patch::ActivityPatch;
use crate::settings::*;

pub const DEFAULT_TITLE: &str = "Untitled Activity";
pub const ANONYMOUS_NAME: &str = "Anonymous";

pub fn sanitize_activity(activity: &mut Activity) {
    sanitize_settings(&mut activity.settings);
    if !activity.phase.is_valid_for(activity.activity_type) {
        activity.phase = Phase::Gathering;
    }
    sanitize_participants(&mut activity.participants);
    sanitize_tags(&mut activity.tags);
    if activity.updated_at < activity.created_at {
        activity.updated_at = activity.created_at;
    }
}

pub fn sanitize_patch(patch: &mut ActivityPatch) {
    if let Some(settings) = patch.settings.as_mut() {
        sanitize_settings(settings);
    }
    if let Some(participants) = patch.participants.as_mut() {
        sanitize_participants(participants);
    }
    if let Some(tags) = patch.tags.as_mut() {
        sanitize_tags(tags);
    }
}

pub fn sanitize_settings(settings: &mut ActivitySettings) {
    if settings.title.as_ref().is_some_and(|t| t.trim().is_empty()) {
        settings.title = None;
    }
    if settings.entry.title.trim().is_empty() {
        settings.entry.title = settings
            .title
            .clone()
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    }

    fill_axis(&mut settings.mapping.x_axis, DEFAULT_X_AXIS);
    fill_axis(&mut settings.mapping.y_axis, DEFAULT_Y_AXIS);

    let voting = &mut settings.tag_creation.voting;
    if voting.minimum_votes.is_none_or(|m| m == 0) {
        voting.minimum_votes = Some(DEFAULT_MINIMUM_VOTES);
    }
    if voting.threshold_type == ThresholdType::TopN && voting.top_n_count.is_none_or(|n| n == 0) {
        voting.top_n_count = Some(DEFAULT_TOP_N_COUNT);
    }
}

fn fill_axis(axis: &mut AxisLabels, defaults: (&str, &str)) {
    if axis.min_label.trim().is_empty() {
        axis.min_label = defaults.0.to_string();
    }
    if axis.max_label.trim().is_empty() {
        axis.max_label = defaults.1.to_string();
    }
}

/// Display name for a participant that joined without one.
pub fn display_name_for(user_id: &UserId) -> String {
    let short: String = user_id.as_str().chars().take(6).collect();
    format!("Participant {short}")
}

pub fn sanitize_participants(participants: &mut Vec<Participant>) {
    let mut seen = std::collections::HashSet::new();
    participants.retain(|p| seen.insert(p.id.clone()));
    for participant in participants.iter_mut() {
        if participant.name.trim().is_empty() {
            participant.name = display_name_for(&participant.id);
        }
    }
}

pub fn sanitize_tags(tags: &mut Vec<Tag>) {
    dedup_tags(tags);
    for tag in tags.iter_mut() {
        if tag.creator_name.trim().is_empty() {
            tag.creator_name = ANONYMOUS_NAME.to_string();
        }
        for vote in tag.votes.iter_mut() {
            if vote.user_name.trim().is_empty() {
                vote.user_name = display_name_for(&vote.user_id);
            }
        }
    }
}
