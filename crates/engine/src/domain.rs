//! Facilitator and participant operations. Each one is a local mutation
//! followed by the matching realtime event.

use chrono::Utc;
use socialmap_core::sanitize::{display_name_for, sanitize_settings};
use socialmap_core::{
    Activity, ActivityId, ActivitySettings, ActivityStatus, Comment, CommentId, Mapping, OutboundEvent,
    Participant, Phase, Ranking, Tag, TagId, UserId, Vote,
};
use tracing::info;

use crate::error::EngineError;
use crate::service::HybridActivityService;

impl HybridActivityService {
    /// Join an activity. A returning participant keeps their stored name and
    /// is marked connected.
    pub fn add_participant(
        &self,
        id: &ActivityId,
        user_id: &UserId,
        name: &str,
    ) -> Result<Activity, EngineError> {
        let (activity, participant) = self.mutate(id, |activity| {
            let participant = match activity.participants.iter_mut().find(|p| &p.id == user_id) {
                Some(existing) => {
                    existing.is_connected = true;
                    existing.clone()
                }
                None => {
                    let name = if name.trim().is_empty() {
                        display_name_for(user_id)
                    } else {
                        name.trim().to_string()
                    };
                    let participant = Participant::new(user_id.clone(), &name);
                    activity.participants.push(participant.clone());
                    participant
                }
            };
            Ok(participant)
        })?;
        info!(id = %id, user = %user_id, "participant joined");
        self.publish(OutboundEvent::JoinActivity {
            activity_id: id.clone(),
            participant,
        });
        Ok(activity)
    }

    pub fn set_participant_connected(
        &self,
        id: &ActivityId,
        user_id: &UserId,
        connected: bool,
    ) -> Result<Activity, EngineError> {
        let (activity, participant) = self.mutate(id, |activity| {
            let participant = activity
                .participants
                .iter_mut()
                .find(|p| &p.id == user_id)
                .ok_or_else(|| EngineError::ParticipantNotFound(user_id.to_string()))?;
            participant.is_connected = connected;
            Ok(participant.clone())
        })?;
        let event = if connected {
            OutboundEvent::JoinActivity {
                activity_id: id.clone(),
                participant,
            }
        } else {
            OutboundEvent::LeaveActivity {
                activity_id: id.clone(),
                user_id: user_id.clone(),
            }
        };
        self.publish(event);
        Ok(activity)
    }

    pub fn add_tag(
        &self,
        id: &ActivityId,
        text: &str,
        creator_id: &UserId,
        creator_name: &str,
    ) -> Result<Tag, EngineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("tag text must not be empty".into()));
        }
        let (activity, tag_id) = self.mutate(id, |activity| {
            let creation = &activity.settings.tag_creation;
            if !creation.enabled {
                return Err(EngineError::InvalidInput("tag creation is disabled".into()));
            }
            if let Some(max) = creation.max_tags_per_participant {
                if activity.tags_created_by(creator_id) >= max as usize {
                    return Err(EngineError::TagLimitReached { max });
                }
            }
            let tag = Tag::new(text, creator_id.clone(), creator_name, Utc::now());
            activity.tags.push(tag.clone());
            Ok(tag.id)
        })?;
        let tag = find_tag(&activity, &tag_id)?;
        self.publish(OutboundEvent::AddTag {
            activity_id: id.clone(),
            tag: tag.clone(),
        });
        Ok(tag)
    }

    /// Toggle `user_id`'s vote on a tag.
    pub fn vote_tag(
        &self,
        id: &ActivityId,
        tag_id: &TagId,
        user_id: &UserId,
        user_name: &str,
    ) -> Result<Tag, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            let tag = activity
                .tag_mut(tag_id)
                .ok_or_else(|| EngineError::TagNotFound(tag_id.to_string()))?;
            if tag.has_vote_from(user_id) {
                tag.votes.retain(|v| &v.user_id != user_id);
            } else {
                tag.votes.push(Vote {
                    user_id: user_id.clone(),
                    user_name: user_name.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Ok(())
        })?;
        let tag = find_tag(&activity, tag_id)?;
        self.publish(OutboundEvent::VoteTag {
            activity_id: id.clone(),
            tag_id: tag_id.clone(),
            user_id: user_id.clone(),
            votes: tag.votes.clone(),
        });
        Ok(tag)
    }

    /// Remove a tag along with every placement and ranking that mentions it.
    pub fn delete_tag(&self, id: &ActivityId, tag_id: &TagId) -> Result<Activity, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            let before = activity.tags.len();
            activity.tags.retain(|t| &t.id != tag_id);
            if activity.tags.len() == before {
                return Err(EngineError::TagNotFound(tag_id.to_string()));
            }
            for mapping in activity.mappings.iter_mut() {
                mapping.positions.retain(|p| &p.tag_id != tag_id);
            }
            for ranking in activity.rankings.iter_mut() {
                ranking.tag_ids.retain(|t| t != tag_id);
            }
            Ok(())
        })?;
        self.publish(OutboundEvent::DeleteTag {
            activity_id: id.clone(),
            tag_id: tag_id.clone(),
        });
        Ok(activity)
    }

    pub fn add_comment(
        &self,
        id: &ActivityId,
        tag_id: &TagId,
        user_id: &UserId,
        user_name: &str,
        text: &str,
    ) -> Result<Comment, EngineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("comment text must not be empty".into()));
        }
        let (_, comment) = self.mutate(id, |activity| {
            let tag = activity
                .tag_mut(tag_id)
                .ok_or_else(|| EngineError::TagNotFound(tag_id.to_string()))?;
            let comment = Comment {
                id: CommentId::generate(),
                user_id: user_id.clone(),
                user_name: user_name.to_string(),
                text: text.to_string(),
                timestamp: Utc::now(),
            };
            tag.comments.push(comment.clone());
            Ok(comment)
        })?;
        Ok(comment)
    }

    /// Replace the participant's mapping wholesale.
    pub fn update_mapping(&self, id: &ActivityId, mapping: Mapping) -> Result<Activity, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            match activity.mappings.iter_mut().find(|m| m.user_id == mapping.user_id) {
                Some(slot) => *slot = mapping.clone(),
                None => activity.mappings.push(mapping.clone()),
            }
            Ok(())
        })?;
        self.publish(OutboundEvent::UpdateMapping {
            activity_id: id.clone(),
            mapping,
        });
        Ok(activity)
    }

    pub fn update_ranking(&self, id: &ActivityId, ranking: Ranking) -> Result<Activity, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            match activity.rankings.iter_mut().find(|r| r.user_id == ranking.user_id) {
                Some(slot) => *slot = ranking,
                None => activity.rankings.push(ranking),
            }
            Ok(())
        })?;
        Ok(activity)
    }

    pub fn set_phase(&self, id: &ActivityId, phase: Phase) -> Result<Activity, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            if !phase.is_valid_for(activity.activity_type) {
                return Err(EngineError::InvalidPhase {
                    phase: phase.as_str(),
                    activity_type: activity.activity_type.as_str(),
                });
            }
            activity.phase = phase;
            Ok(())
        })?;
        info!(id = %id, phase = phase.as_str(), "phase changed");
        self.publish(OutboundEvent::ChangePhase {
            activity_id: id.clone(),
            phase,
        });
        Ok(activity)
    }

    /// Completion is final; completing twice is a no-op.
    pub fn complete_activity(&self, id: &ActivityId) -> Result<Activity, EngineError> {
        let (activity, ()) = self.mutate(id, |activity| {
            activity.status = ActivityStatus::Completed;
            Ok(())
        })?;
        Ok(activity)
    }

    /// Replace the settings. Tag approval is recomputed against the new
    /// voting rules.
    pub fn update_settings(
        &self,
        id: &ActivityId,
        settings: ActivitySettings,
    ) -> Result<Activity, EngineError> {
        let mut settings = settings;
        sanitize_settings(&mut settings);
        let (activity, ()) = self.mutate(id, |activity| {
            activity.settings = settings;
            Ok(())
        })?;
        Ok(activity)
    }
}

fn find_tag(activity: &Activity, tag_id: &TagId) -> Result<Tag, EngineError> {
    activity
        .tag(tag_id)
        .cloned()
        .ok_or_else(|| EngineError::TagNotFound(tag_id.to_string()))
}
