//! Canonical in-memory mirror of server state.

use std::collections::HashMap;

use crate::model::{
    FileDiff, Message, MessageWithParts, ModelRef, Part, PermissionRequest, Project, Provider,
    Session,
};

/// Collections folded from one-shot fetches and server events.
///
/// Sessions are kept most-recently-updated first, messages by creation
/// time descending. Event-driven mutation lives in the reconciler; the
/// methods here merge one-shot fetch results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub(crate) current_session: Option<Session>,
    pub(crate) sessions: Vec<Session>,
    pub(crate) messages: Vec<Message>,
    pub(crate) parts: HashMap<String, Vec<Part>>,
    pub(crate) pending_permissions: Vec<PermissionRequest>,
    pub(crate) diffs: Vec<FileDiff>,
    pub(crate) diffs_loading: bool,
    pub(crate) diffs_error: Option<String>,
    pub(crate) agent_working: bool,
    pub(crate) projects: Vec<Project>,
    pub(crate) current_project: Option<Project>,
    pub(crate) providers: Vec<Provider>,
    pub(crate) selected_model: Option<ModelRef>,
    pub(crate) offline: bool,
    pub(crate) last_error: Option<String>,
}

impl Projection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently selected session snapshot.
    #[must_use]
    pub const fn current_session(&self) -> Option<&Session> {
        self.current_session.as_ref()
    }

    /// Sessions, most recently updated first.
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    /// All messages, newest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id() == id)
    }

    /// Messages of one session, newest first.
    pub fn session_messages<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = &'a Message> {
        self.messages
            .iter()
            .filter(move |message| message.session_id() == session_id)
    }

    /// Ordered parts of a message. Empty if none are known.
    #[must_use]
    pub fn parts(&self, message_id: &str) -> &[Part] {
        self.parts.get(message_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub const fn parts_by_message(&self) -> &HashMap<String, Vec<Part>> {
        &self.parts
    }

    #[must_use]
    pub fn pending_permissions(&self) -> &[PermissionRequest] {
        &self.pending_permissions
    }

    #[must_use]
    pub fn diffs(&self) -> &[FileDiff] {
        &self.diffs
    }

    #[must_use]
    pub const fn diffs_loading(&self) -> bool {
        self.diffs_loading
    }

    #[must_use]
    pub fn diffs_error(&self) -> Option<&str> {
        self.diffs_error.as_deref()
    }

    /// True between a prompt and the first assistant message update.
    #[must_use]
    pub const fn agent_working(&self) -> bool {
        self.agent_working
    }

    #[must_use]
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    #[must_use]
    pub const fn current_project(&self) -> Option<&Project> {
        self.current_project.as_ref()
    }

    #[must_use]
    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    #[must_use]
    pub const fn selected_model(&self) -> Option<&ModelRef> {
        self.selected_model.as_ref()
    }

    #[must_use]
    pub const fn offline(&self) -> bool {
        self.offline
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn select_session(&mut self, session: Option<Session>) {
        self.current_session = session;
    }

    pub fn select_project(&mut self, project: Option<Project>) {
        self.current_project = project;
    }

    pub fn select_model(&mut self, model: Option<ModelRef>) {
        self.selected_model = model;
    }

    pub const fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub const fn set_agent_working(&mut self, working: bool) {
        self.agent_working = working;
    }

    pub fn set_error(&mut self, error: Option<&str>) {
        self.last_error = error.map(ToOwned::to_owned);
    }

    pub fn replace_projects(&mut self, projects: Vec<Project>) {
        self.projects = projects;
    }

    /// Replace the provider list.
    ///
    /// A selected model that no provider offers any more is replaced by the
    /// first model of the first provider that has one.
    pub fn replace_providers(&mut self, providers: Vec<Provider>) {
        let still_valid = self.selected_model.as_ref().is_some_and(|model| {
            providers
                .iter()
                .any(|provider| provider.id == model.provider_id && provider.has_model(&model.model_id))
        });
        if !still_valid {
            self.selected_model = providers.iter().find_map(|provider| {
                provider.models.keys().next().map(|model_id| ModelRef {
                    provider_id: provider.id.clone(),
                    model_id: model_id.clone(),
                })
            });
        }
        self.providers = providers;
    }

    /// Merge a fetched session list, most recent first.
    ///
    /// Each fetched session replaces its local copy and the fetched order
    /// leads the list. Sessions known only from events stay behind them.
    /// The selection is refreshed but never changed.
    pub fn merge_sessions(&mut self, sessions: Vec<Session>) {
        for session in sessions.into_iter().rev() {
            if self
                .current_session
                .as_ref()
                .is_some_and(|current| current.id == session.id)
            {
                self.current_session = Some(session.clone());
            }
            self.sessions.retain(|item| item.id != session.id);
            self.sessions.insert(0, session);
        }
    }

    /// Merge a fetched message history.
    ///
    /// Messages are upserted by id and parts by id within their message, so
    /// anything the event stream delivered that the fetch did not see is
    /// kept.
    pub fn merge_messages(&mut self, snapshot: Vec<MessageWithParts>) {
        for MessageWithParts { info, parts } in snapshot {
            let message_id = info.id().to_owned();
            self.insert_message(info);
            self.merge_parts(&message_id, parts);
        }
        sort_messages(&mut self.messages);
    }

    /// Fetched parts lead in fetched order; parts known only locally follow.
    fn merge_parts(&mut self, message_id: &str, fetched: Vec<Part>) {
        let local = self.parts.remove(message_id).unwrap_or_default();
        let mut merged = fetched;
        let local_only: Vec<Part> = local
            .into_iter()
            .filter(|part| merged.iter().all(|item| item.id() != part.id()))
            .collect();
        merged.extend(local_only);
        self.parts.insert(message_id.to_owned(), merged);
    }

    /// Merge a fetched pending-permission list without dropping entries the
    /// event stream added.
    pub fn merge_permissions(&mut self, permissions: Vec<PermissionRequest>) {
        for permission in permissions {
            self.add_permission(permission);
        }
    }

    /// Drop a pending permission after it has been answered.
    pub fn consume_permission(&mut self, request_id: &str) -> bool {
        let before = self.pending_permissions.len();
        self.pending_permissions
            .retain(|permission| permission.id != request_id);
        before != self.pending_permissions.len()
    }

    pub fn begin_diff_load(&mut self) {
        self.diffs_loading = true;
        self.diffs_error = None;
    }

    /// Finish a diff fetch. On error the previous diffs are kept.
    pub fn finish_diff_load(&mut self, result: Result<Vec<FileDiff>, String>) {
        self.diffs_loading = false;
        match result {
            Ok(diffs) => {
                self.diffs = diffs;
                self.diffs_error = None;
            }
            Err(error) => self.diffs_error = Some(error),
        }
    }

    /// Drop everything that belongs to the previous server or directory.
    pub fn clear_server_data(&mut self) {
        self.current_project = None;
        self.current_session = None;
        self.sessions.clear();
        self.messages.clear();
        self.parts.clear();
        self.diffs.clear();
        self.diffs_loading = false;
        self.diffs_error = None;
        self.projects.clear();
    }
}

/// Sort newest first. Stable, so equal timestamps keep their relative order.
pub(crate) fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| b.created().cmp(&a.created()));
}
