use std::collections::HashSet;

use crate::activity::{Activity, Participant, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Last-writer-wins by `updated_at`. Ties keep the local copy.
pub fn last_writer_wins(local: &Activity, remote: &Activity) -> Winner {
    if remote.is_newer_than(local) {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Overlay `incoming` onto `existing` by participant id: matching entries are
/// replaced in place, unknown ones appended. Used when resubmitting a write
/// after a version conflict so concurrent joins are not clobbered.
pub fn merge_participants(existing: &[Participant], incoming: &[Participant]) -> Vec<Participant> {
    let mut merged: Vec<Participant> = existing.to_vec();
    for participant in incoming {
        match merged.iter_mut().find(|p| p.id == participant.id) {
            Some(slot) => *slot = participant.clone(),
            None => merged.push(participant.clone()),
        }
    }
    merged
}

/// Reconcile a presence snapshot from the realtime channel with the local
/// list. Known participants keep their stored name and take the incoming
/// connection flag; named newcomers are added; participants missing from the
/// snapshot are marked disconnected, never removed.
pub fn reconcile_presence(local: &[Participant], incoming: &[Participant]) -> Vec<Participant> {
    let mut reconciled = Vec::with_capacity(local.len().max(incoming.len()));
    for participant in local {
        let mut next = participant.clone();
        match incoming.iter().find(|p| p.id == participant.id) {
            Some(remote) => {
                next.is_connected = remote.is_connected;
                if next.name.trim().is_empty() {
                    next.name = remote.name.clone();
                }
            }
            None => next.is_connected = false,
        }
        reconciled.push(next);
    }
    for remote in incoming {
        let known = reconciled.iter().any(|p| p.id == remote.id);
        if !known && !remote.name.trim().is_empty() {
            reconciled.push(remote.clone());
        }
    }
    reconciled
}

/// Drop repeated tag ids, keeping the first occurrence. Returns how many
/// entries were removed.
pub fn dedup_tags(tags: &mut Vec<Tag>) -> usize {
    let before = tags.len();
    let mut seen = HashSet::with_capacity(before);
    tags.retain(|tag| seen.insert(tag.id.clone()));
    before - tags.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityType, TagStatus};
    use crate::ids::{ActivityId, TagId, UserId};
    use crate::settings::ActivitySettings;
    use chrono::{Duration, Utc};

    fn participant(id: &str, name: &str, connected: bool) -> Participant {
        Participant {
            id: UserId::from(id),
            name: name.to_string(),
            is_connected: connected,
        }
    }

    #[test]
    fn lww_prefers_strictly_newer_remote() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(5);
        let mut local = Activity::new(
            ActivityId::from("a"),
            ActivityType::Mapping,
            ActivitySettings::default(),
            t1,
        );
        let mut remote = local.clone();
        remote.updated_at = t2;
        assert_eq!(last_writer_wins(&local, &remote), Winner::Remote);

        local.updated_at = t2 + Duration::seconds(1);
        assert_eq!(last_writer_wins(&local, &remote), Winner::Local);

        local.updated_at = t2;
        assert_eq!(last_writer_wins(&local, &remote), Winner::Local);
    }

    #[test]
    fn merge_overlays_and_appends() {
        let existing = vec![participant("a", "Ana", true), participant("b", "Ben", true)];
        let incoming = vec![participant("b", "Benjamin", false), participant("c", "Cy", true)];
        let merged = merge_participants(&existing, &incoming);
        assert_eq!(
            merged,
            vec![
                participant("a", "Ana", true),
                participant("b", "Benjamin", false),
                participant("c", "Cy", true),
            ]
        );
    }

    #[test]
    fn presence_keeps_local_names_and_takes_flags() {
        let local = vec![participant("a", "Ana", false), participant("b", "Ben", true)];
        let incoming = vec![
            participant("a", "Anonymous", true),
            participant("c", "Cy", true),
            participant("d", "", true),
        ];
        let reconciled = reconcile_presence(&local, &incoming);
        assert_eq!(
            reconciled,
            vec![
                participant("a", "Ana", true),
                participant("b", "Ben", false),
                participant("c", "Cy", true),
            ]
        );
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let now = Utc::now();
        let mut first = Tag::new("first", UserId::from("u"), "U", now);
        first.id = TagId::from("t1");
        let mut dup = Tag::new("duplicate", UserId::from("u"), "U", now);
        dup.id = TagId::from("t1");
        dup.status = TagStatus::Approved;
        let other = Tag::new("other", UserId::from("u"), "U", now);

        let mut tags = vec![first.clone(), dup, other.clone()];
        assert_eq!(dedup_tags(&mut tags), 1);
        assert_eq!(tags, vec![first, other]);
        assert_eq!(dedup_tags(&mut tags), 0);
    }
}
