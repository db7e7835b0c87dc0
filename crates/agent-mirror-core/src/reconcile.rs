//! Per-event merge rules.
//!
//! Every handler folds one accepted event into the projection. Events are
//! applied in arrival order; nothing is batched or reordered.

use crate::event::ServerEvent;
use crate::model::{Message, Part, PermissionRequest, Session};
use crate::projection::{Projection, sort_messages};

impl Projection {
    /// Apply one accepted event.
    ///
    /// Returns `false` when the event kind carries nothing to fold
    /// (notices, `server.connected`, unknown kinds).
    pub fn apply(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::SessionCreated { info } | ServerEvent::SessionUpdated { info } => {
                self.upsert_session(info);
            }
            ServerEvent::SessionDeleted { info } => self.remove_session(&info.id),
            ServerEvent::MessageUpdated { info } => self.upsert_message(info),
            ServerEvent::MessagePartUpdated { part, delta } => {
                self.upsert_part(part, delta.as_deref());
            }
            ServerEvent::MessagePartRemoved {
                message_id,
                part_id,
                ..
            } => self.remove_part(&message_id, &part_id),
            ServerEvent::PermissionAsked(permission) => self.add_permission(permission),
            ServerEvent::PermissionReplied { request_id, .. } => {
                self.consume_permission(&request_id);
            }
            ServerEvent::SessionDiff { diff, .. } => {
                self.diffs = diff;
                self.diffs_loading = false;
                self.diffs_error = None;
            }
            ServerEvent::ServerConnected
            | ServerEvent::Notice { .. }
            | ServerEvent::Unknown { .. } => return false,
        }
        true
    }

    /// Move the session to the front, replacing any previous copy.
    ///
    /// The selected snapshot follows when nothing is selected or the
    /// selection is this session.
    pub fn upsert_session(&mut self, session: Session) {
        let select = self
            .current_session
            .as_ref()
            .is_none_or(|current| current.id == session.id);
        if select {
            self.current_session = Some(session.clone());
        }

        self.sessions.retain(|item| item.id != session.id);
        self.sessions.insert(0, session);
    }

    /// Remove a session. Clears the selection if it pointed there.
    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.retain(|item| item.id != session_id);
        if self
            .current_session
            .as_ref()
            .is_some_and(|current| current.id == session_id)
        {
            self.current_session = None;
        }
    }

    /// Insert or replace a message, keeping the list sorted newest first.
    ///
    /// A new message is placed ahead of existing ones before the stable
    /// sort, so among equal timestamps the latest arrival comes first; an
    /// updated message keeps its slot.
    pub fn upsert_message(&mut self, message: Message) {
        if message.is_assistant() {
            self.agent_working = false;
        }
        self.insert_message(message);
        sort_messages(&mut self.messages);
    }

    /// Replace by id, or insert ahead of everything. Leaves sorting to the caller.
    pub(crate) fn insert_message(&mut self, message: Message) {
        match self
            .messages
            .iter()
            .position(|item| item.id() == message.id())
        {
            Some(index) => self.messages[index] = message,
            None => self.messages.insert(0, message),
        }
    }

    /// Insert or update a part of its message.
    ///
    /// With a text delta the text grows by `delta` instead of being
    /// replaced, so a stream of fragments rebuilds one part. An empty delta
    /// counts as no delta.
    pub fn upsert_part(&mut self, incoming: Part, delta: Option<&str>) {
        let delta = delta.filter(|delta| !delta.is_empty());
        let parts = self
            .parts
            .entry(incoming.message_id().to_owned())
            .or_default();

        let Some(index) = parts.iter().position(|part| part.id() == incoming.id()) else {
            let part = match (incoming, delta) {
                (Part::Text(mut text), Some(delta)) => {
                    delta.clone_into(&mut text.text);
                    Part::Text(text)
                }
                (part, _) => part,
            };
            parts.push(part);
            return;
        };

        match (&mut parts[index], delta) {
            (Part::Text(existing), Some(delta)) => existing.text.push_str(delta),
            (slot, _) => *slot = incoming,
        }
    }

    pub fn remove_part(&mut self, message_id: &str, part_id: &str) {
        if let Some(parts) = self.parts.get_mut(message_id) {
            parts.retain(|part| part.id() != part_id);
        }
    }

    /// Add a pending permission unless one with the same id is already waiting.
    pub fn add_permission(&mut self, permission: PermissionRequest) {
        if self
            .pending_permissions
            .iter()
            .any(|item| item.id == permission.id)
        {
            return;
        }
        self.pending_permissions.push(permission);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::model::{FileDiff, MessageTime, TextPart, UserMessage};

    fn user_message(id: &str, created: i64) -> Message {
        Message::User(UserMessage {
            id: id.to_owned(),
            session_id: "s1".to_owned(),
            time: MessageTime {
                created,
                completed: None,
            },
            extra: Map::new(),
        })
    }

    fn assistant_message(id: &str, created: i64) -> Message {
        serde_json::from_value(json!({
            "id": id, "sessionID": "s1", "role": "assistant", "time": {"created": created}
        }))
        .unwrap()
    }

    fn text_part(id: &str, text: &str) -> Part {
        Part::Text(TextPart {
            id: id.to_owned(),
            session_id: "s1".to_owned(),
            message_id: "m1".to_owned(),
            text: text.to_owned(),
            time: None,
            extra: Map::new(),
        })
    }

    fn permission(id: &str) -> PermissionRequest {
        serde_json::from_value(json!({
            "id": id, "sessionID": "s1", "permission": "bash", "patterns": ["ls *"]
        }))
        .unwrap()
    }

    #[test]
    fn test_session_upsert_moves_to_front() {
        let mut projection = Projection::new();
        projection.apply(ServerEvent::SessionCreated {
            info: Session::new("s1", "/repo"),
        });
        projection.apply(ServerEvent::SessionCreated {
            info: Session::new("s2", "/repo"),
        });
        let mut renamed = Session::new("s1", "/repo");
        renamed.title = "renamed".to_owned();
        projection.apply(ServerEvent::SessionUpdated { info: renamed });

        let ids: Vec<_> = projection.sessions().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s1", "s2"]);
        assert_eq!(projection.sessions()[0].title, "renamed");
        // s1 was selected by the first event and follows its own updates.
        assert_eq!(projection.current_session().unwrap().title, "renamed");
    }

    #[test]
    fn test_session_update_for_other_session_keeps_selection() {
        let mut projection = Projection::new();
        projection.upsert_session(Session::new("s1", "/repo"));
        projection.upsert_session(Session::new("s2", "/repo"));
        assert_eq!(projection.current_session().unwrap().id, "s1");
    }

    #[test]
    fn test_session_delete_clears_selection() {
        let mut projection = Projection::new();
        projection.upsert_session(Session::new("s1", "/repo"));
        projection.upsert_session(Session::new("s2", "/repo"));
        projection.apply(ServerEvent::SessionDeleted {
            info: Session::new("s1", "/repo"),
        });

        assert!(projection.current_session().is_none());
        assert_eq!(projection.sessions().len(), 1);
        assert_eq!(projection.sessions()[0].id, "s2");
    }

    #[test]
    fn test_messages_stay_sorted_newest_first() {
        let mut projection = Projection::new();
        for (id, created) in [("a", 5), ("b", 9), ("c", 1), ("d", 7), ("b", 2)] {
            projection.upsert_message(user_message(id, created));
            let times: Vec<_> = projection.messages().iter().map(Message::created).collect();
            let mut sorted = times.clone();
            sorted.sort_by(|x, y| y.cmp(x));
            assert_eq!(times, sorted);
        }
        assert_eq!(projection.messages().len(), 4);
        assert_eq!(projection.message("b").unwrap().created(), 2);
    }

    #[test]
    fn test_equal_timestamps_prefer_latest_arrival() {
        let mut projection = Projection::new();
        projection.upsert_message(user_message("first", 10));
        projection.upsert_message(user_message("second", 10));
        let ids: Vec<_> = projection.messages().iter().map(Message::id).collect();
        assert_eq!(ids, ["second", "first"]);

        projection.upsert_message(user_message("first", 10));
        let ids: Vec<_> = projection.messages().iter().map(Message::id).collect();
        assert_eq!(ids, ["second", "first"]);
    }

    #[test]
    fn test_assistant_message_clears_working_flag() {
        let mut projection = Projection::new();
        projection.set_agent_working(true);
        projection.upsert_message(user_message("m1", 1));
        assert!(projection.agent_working());
        projection.upsert_message(assistant_message("m2", 2));
        assert!(!projection.agent_working());
    }

    #[test]
    fn test_text_deltas_rebuild_part() {
        let mut projection = Projection::new();
        for delta in ["Hel", "lo ", "world"] {
            projection.apply(ServerEvent::MessagePartUpdated {
                part: text_part("p1", "ignored"),
                delta: Some(delta.to_owned()),
            });
        }
        let parts = projection.parts("m1");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text(), Some("Hello world"));
    }

    #[test]
    fn test_part_without_delta_replaces_wholesale() {
        let mut projection = Projection::new();
        projection.upsert_part(text_part("p1", "draft"), Some("dr"));
        projection.upsert_part(text_part("p1", "final text"), None);
        assert_eq!(projection.parts("m1")[0].text(), Some("final text"));
    }

    #[test]
    fn test_new_part_without_delta_is_inserted_verbatim() {
        let mut projection = Projection::new();
        projection.upsert_part(text_part("p1", "whole"), None);
        projection.upsert_part(text_part("p2", "other"), Some(""));
        let parts = projection.parts("m1");
        assert_eq!(parts[0].text(), Some("whole"));
        assert_eq!(parts[1].text(), Some("other"));
    }

    #[test]
    fn test_delta_on_non_text_part_replaces() {
        let mut projection = Projection::new();
        let tool: Part = serde_json::from_value(json!({
            "id": "p1", "sessionID": "s1", "messageID": "m1", "type": "tool",
            "tool": "bash", "state": {"status": "pending"}
        }))
        .unwrap();
        let running: Part = serde_json::from_value(json!({
            "id": "p1", "sessionID": "s1", "messageID": "m1", "type": "tool",
            "tool": "bash", "state": {"status": "running", "title": "ls"}
        }))
        .unwrap();
        projection.upsert_part(tool, None);
        projection.upsert_part(running.clone(), Some("x"));
        assert_eq!(projection.parts("m1"), [running]);
    }

    #[test]
    fn test_part_removal() {
        let mut projection = Projection::new();
        projection.upsert_part(text_part("p1", "a"), None);
        projection.upsert_part(text_part("p2", "b"), None);
        projection.apply(ServerEvent::MessagePartRemoved {
            session_id: None,
            message_id: "m1".to_owned(),
            part_id: "p1".to_owned(),
        });
        let ids: Vec<_> = projection.parts("m1").iter().map(Part::id).collect();
        assert_eq!(ids, ["p2"]);
        // Unknown message is a no-op.
        projection.remove_part("m9", "p2");
    }

    #[test]
    fn test_permission_asked_is_idempotent() {
        let mut projection = Projection::new();
        projection.apply(ServerEvent::PermissionAsked(permission("perm1")));
        projection.apply(ServerEvent::PermissionAsked(permission("perm1")));
        assert_eq!(projection.pending_permissions().len(), 1);

        projection.apply(ServerEvent::PermissionReplied {
            session_id: "s1".to_owned(),
            request_id: "perm1".to_owned(),
            reply: Some("once".to_owned()),
        });
        assert!(projection.pending_permissions().is_empty());
    }

    #[test]
    fn test_session_diff_replaces_and_clears_flags() {
        let mut projection = Projection::new();
        projection.begin_diff_load();
        projection.finish_diff_load(Err("boom".to_owned()));
        projection.begin_diff_load();
        projection.apply(ServerEvent::SessionDiff {
            session_id: "s1".to_owned(),
            diff: vec![FileDiff {
                file: "a.ts".to_owned(),
                before: String::new(),
                after: "x".to_owned(),
                additions: 1,
                deletions: 0,
            }],
        });
        assert_eq!(projection.diffs().len(), 1);
        assert!(!projection.diffs_loading());
        assert!(projection.diffs_error().is_none());
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let mut projection = Projection::new();
        let handled = projection.apply(ServerEvent::Unknown {
            kind: "lsp.updated".to_owned(),
            properties: json!({}),
        });
        assert!(!handled);
        assert_eq!(projection, Projection::new());
    }
}
