//! One-shot calls merged into the store alongside the event stream.

use std::sync::Arc;

use agent_mirror_core::{
    ERR_INVALID_COMMAND, ERR_OFFLINE, ERR_SERVER_UNAVAILABLE, FileDiff, Message, MirrorStore,
    PermissionRequest, Project, Projection, Provider, Session,
};
use agent_mirror_transport::ServerConfig;
use thiserror::Error;

use crate::api::{ApiError, CreateSession, PermissionReply, PromptRequest, ServerApi};
use crate::subscriber::EventSubscriber;

/// Why a workspace action did not run or did not succeed.
///
/// The matching marker is also stored as the projection's last error.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Client is offline")]
    Offline,
    #[error("Server unavailable: {0}")]
    Unavailable(#[from] ApiError),
    #[error("Server declined {0}")]
    Declined(&'static str),
    #[error("Invalid command: {0}")]
    InvalidCommand(&'static str),
}

impl WorkspaceError {
    /// Error marker shown to the user.
    #[must_use]
    pub const fn marker(&self) -> &'static str {
        match self {
            Self::Offline => ERR_OFFLINE,
            Self::Unavailable(_) | Self::Declined(_) => ERR_SERVER_UNAVAILABLE,
            Self::InvalidCommand(_) => ERR_INVALID_COMMAND,
        }
    }
}

/// A server connection: one-shot calls plus the event stream, both
/// folding into the same store.
pub struct Workspace<A: ServerApi> {
    api: A,
    config: ServerConfig,
    store: Arc<MirrorStore>,
    subscriber: EventSubscriber,
}

impl<A: ServerApi> Workspace<A> {
    #[must_use]
    pub fn new(api: A, config: ServerConfig, store: Arc<MirrorStore>, client: reqwest::Client) -> Self {
        let subscriber = EventSubscriber::new(Arc::clone(&store), client);
        Self {
            api,
            config,
            store,
            subscriber,
        }
    }

    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    /// Point the workspace at another server.
    ///
    /// Closes the event stream and drops all data of the previous server.
    pub async fn switch_server(&mut self, api: A, config: ServerConfig) {
        self.subscriber.close().await;
        tracing::info!(server = %config.label, "Switching server");
        self.api = api;
        self.config = config;
        self.store.merge("server", |projection| {
            projection.clear_server_data();
            projection.set_error(None);
        });
    }

    pub fn set_offline(&self, offline: bool) {
        self.store
            .merge("offline", |projection| projection.set_offline(offline));
    }

    pub fn select_project(&self, project: Option<Project>) {
        self.store
            .merge("project", |projection| projection.select_project(project));
    }

    pub fn select_session(&self, session: Option<Session>) {
        self.store
            .merge("session", |projection| projection.select_session(session));
    }

    fn server_directory(&self) -> Option<&str> {
        Some(self.config.directory.as_str()).filter(|directory| !directory.is_empty())
    }

    fn project_worktree(&self) -> Option<String> {
        self.store.read_with(|projection| {
            projection
                .current_project()
                .map(|project| project.worktree.clone())
                .filter(|worktree| !worktree.is_empty())
        })
    }

    fn fail<T>(&self, error: WorkspaceError) -> Result<T, WorkspaceError> {
        tracing::warn!(error = %error, "Workspace action failed");
        let marker = error.marker();
        self.store
            .merge("error", |projection| projection.set_error(Some(marker)));
        Err(error)
    }

    fn ensure_online(&self) -> Result<(), WorkspaceError> {
        if self.store.read_with(Projection::offline) {
            return self.fail(WorkspaceError::Offline);
        }
        Ok(())
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn fetch_projects(&self) -> Result<Vec<Project>, WorkspaceError> {
        self.ensure_online()?;
        let projects = match self.api.list_projects(self.server_directory()).await {
            Ok(projects) => projects,
            Err(error) => return self.fail(error.into()),
        };
        self.store.merge("projects", |projection| {
            projection.replace_projects(projects.clone());
            projection.set_error(None);
        });
        Ok(projects)
    }

    /// Fetch providers and keep the selected model valid.
    ///
    /// # Errors
    /// Offline or server unavailable.
    pub async fn fetch_providers(&self) -> Result<Vec<Provider>, WorkspaceError> {
        self.ensure_online()?;
        let directory = self
            .project_worktree()
            .or_else(|| self.server_directory().map(ToOwned::to_owned));
        let providers = match self.api.list_providers(directory.as_deref()).await {
            Ok(providers) => providers,
            Err(error) => return self.fail(error.into()),
        };
        self.store.merge("providers", |projection| {
            projection.replace_providers(providers.clone());
            projection.set_error(None);
        });
        Ok(providers)
    }

    /// List sessions of the current project.
    ///
    /// # Errors
    /// Offline, no current project, or server unavailable.
    pub async fn fetch_sessions(&self) -> Result<Vec<Session>, WorkspaceError> {
        self.ensure_online()?;
        let Some(worktree) = self.project_worktree() else {
            return self.fail(WorkspaceError::InvalidCommand("no project selected"));
        };
        let sessions = match self.api.list_sessions(&worktree).await {
            Ok(sessions) => sessions,
            Err(error) => return self.fail(error.into()),
        };
        self.store.merge("sessions", |projection| {
            projection.merge_sessions(sessions.clone());
            projection.set_error(None);
        });
        Ok(sessions)
    }

    /// Create a session and make it the selected one.
    ///
    /// # Errors
    /// Offline, no directory to create in, or server unavailable.
    pub async fn create_session(&self, request: CreateSession) -> Result<Session, WorkspaceError> {
        self.ensure_online()?;
        let Some(directory) = request.directory.clone().or_else(|| self.project_worktree()) else {
            return self.fail(WorkspaceError::InvalidCommand("no directory for new session"));
        };
        let session = match self.api.create_session(&directory, &request).await {
            Ok(session) => session,
            Err(error) => return self.fail(error.into()),
        };
        self.store.merge("session.create", |projection| {
            projection.upsert_session(session.clone());
            projection.select_session(Some(session.clone()));
            projection.set_error(None);
        });
        Ok(session)
    }

    /// Send a text prompt, then refresh the session's messages.
    ///
    /// The agent is flagged as working until an assistant message is
    /// present.
    ///
    /// # Errors
    /// Offline or server unavailable.
    pub async fn send_prompt(&self, session_id: &str, text: &str) -> Result<(), WorkspaceError> {
        self.ensure_online()?;
        let model = self.store.merge("prompt", |projection| {
            projection.set_agent_working(true);
            projection.selected_model().cloned()
        });

        let request = PromptRequest {
            session_id: session_id.to_owned(),
            directory: self.server_directory().map(ToOwned::to_owned),
            model,
            text: text.to_owned(),
        };
        if let Err(error) = self.api.prompt(&request).await {
            self.store
                .merge("prompt", |projection| projection.set_agent_working(false));
            return self.fail(error.into());
        }

        match self.api.list_messages(session_id, self.server_directory()).await {
            Ok(snapshot) => {
                let has_assistant = snapshot.iter().any(|item| item.info.is_assistant());
                self.store.merge("messages", |projection| {
                    projection.merge_messages(snapshot);
                    projection.set_agent_working(!has_assistant);
                    projection.set_error(None);
                });
            }
            Err(error) => {
                tracing::warn!(session = session_id, error = %error, "Message refresh after prompt failed");
            }
        }
        Ok(())
    }

    /// Merge the session's current history into messages and parts.
    ///
    /// Returns the session's messages, newest first.
    ///
    /// # Errors
    /// Offline or server unavailable.
    pub async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, WorkspaceError> {
        self.ensure_online()?;
        let snapshot = match self.api.list_messages(session_id, self.server_directory()).await {
            Ok(snapshot) => snapshot,
            Err(error) => return self.fail(error.into()),
        };
        Ok(self.store.merge("messages", |projection| {
            projection.merge_messages(snapshot);
            projection.set_error(None);
            projection.session_messages(session_id).cloned().collect()
        }))
    }

    /// # Errors
    /// Offline, server unavailable, or the server declined.
    pub async fn abort_session(&self, session_id: &str) -> Result<(), WorkspaceError> {
        self.ensure_online()?;
        match self.api.abort(session_id, self.server_directory()).await {
            Ok(true) => {
                self.clear_error("abort");
                Ok(())
            }
            Ok(false) => self.fail(WorkspaceError::Declined("abort")),
            Err(error) => self.fail(error.into()),
        }
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn revert_session(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: Option<&str>,
    ) -> Result<Session, WorkspaceError> {
        self.ensure_online()?;
        match self
            .api
            .revert(session_id, message_id, part_id, self.server_directory())
            .await
        {
            Ok(session) => Ok(self.merge_session("revert", session)),
            Err(error) => self.fail(error.into()),
        }
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn unrevert_session(&self, session_id: &str) -> Result<Session, WorkspaceError> {
        self.ensure_online()?;
        match self.api.unrevert(session_id, self.server_directory()).await {
            Ok(session) => Ok(self.merge_session("unrevert", session)),
            Err(error) => self.fail(error.into()),
        }
    }

    /// Fetch the session's file diffs, toggling the loading flag.
    ///
    /// On failure the previous diffs are kept and the diff error is set.
    ///
    /// # Errors
    /// Offline or server unavailable.
    pub async fn fetch_diffs(&self, session_id: &str) -> Result<Vec<FileDiff>, WorkspaceError> {
        self.ensure_online()?;
        self.store.merge("diff", Projection::begin_diff_load);

        match self.api.diff(session_id, self.server_directory()).await {
            Ok(diffs) => {
                self.store.merge("diff", |projection| {
                    projection.finish_diff_load(Ok(diffs.clone()));
                    projection.set_error(None);
                });
                Ok(diffs)
            }
            Err(error) => {
                self.store.merge("diff", |projection| {
                    projection.finish_diff_load(Err(ERR_SERVER_UNAVAILABLE.to_owned()));
                });
                self.fail(error.into())
            }
        }
    }

    /// # Errors
    /// Offline, server unavailable, or the server declined.
    pub async fn summarize_session(&self, session_id: &str) -> Result<(), WorkspaceError> {
        self.ensure_online()?;
        match self.api.summarize(session_id, self.server_directory()).await {
            Ok(true) => {
                self.clear_error("summarize");
                Ok(())
            }
            Ok(false) => self.fail(WorkspaceError::Declined("summarize")),
            Err(error) => self.fail(error.into()),
        }
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn fetch_permissions(&self) -> Result<Vec<PermissionRequest>, WorkspaceError> {
        self.ensure_online()?;
        let permissions = match self.api.list_permissions(self.server_directory()).await {
            Ok(permissions) => permissions,
            Err(error) => return self.fail(error.into()),
        };
        self.store.merge("permissions", |projection| {
            projection.merge_permissions(permissions.clone());
            projection.set_error(None);
        });
        Ok(permissions)
    }

    /// Answer a permission prompt and drop it from the pending set.
    ///
    /// # Errors
    /// Offline, server unavailable, or the server declined.
    pub async fn respond_to_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
    ) -> Result<(), WorkspaceError> {
        self.ensure_online()?;
        match self
            .api
            .reply_permission(request_id, reply, self.server_directory())
            .await
        {
            Ok(true) => {
                self.store.merge("permission.reply", |projection| {
                    projection.consume_permission(request_id);
                    projection.set_error(None);
                });
                Ok(())
            }
            Ok(false) => self.fail(WorkspaceError::Declined("permission reply")),
            Err(error) => self.fail(error.into()),
        }
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn share_session(&self, session_id: &str) -> Result<Session, WorkspaceError> {
        self.ensure_online()?;
        match self.api.share(session_id, self.server_directory()).await {
            Ok(session) => Ok(self.select_merged_session("share", session)),
            Err(error) => self.fail(error.into()),
        }
    }

    /// # Errors
    /// Offline or server unavailable.
    pub async fn unshare_session(&self, session_id: &str) -> Result<Session, WorkspaceError> {
        self.ensure_online()?;
        match self.api.unshare(session_id, self.server_directory()).await {
            Ok(session) => Ok(self.select_merged_session("unshare", session)),
            Err(error) => self.fail(error.into()),
        }
    }

    /// Open the event stream for the server directory, optionally scoped
    /// to one session. Replaces any open stream.
    ///
    /// # Errors
    /// Offline or the server has no directory configured.
    pub async fn subscribe(&self, session_id: Option<&str>) -> Result<u64, WorkspaceError> {
        self.ensure_online()?;
        if self.server_directory().is_none() {
            return self.fail(WorkspaceError::InvalidCommand("no server directory"));
        }
        Ok(self.subscriber.subscribe(&self.config, session_id).await)
    }

    /// Close the event stream. Safe to call when none is open.
    pub async fn close_event_stream(&self) {
        self.subscriber.close().await;
    }

    fn clear_error(&self, label: &'static str) {
        self.store.merge(label, |projection| projection.set_error(None));
    }

    fn merge_session(&self, label: &'static str, session: Session) -> Session {
        self.store.merge(label, |projection| {
            projection.upsert_session(session.clone());
            projection.set_error(None);
        });
        session
    }

    fn select_merged_session(&self, label: &'static str, session: Session) -> Session {
        self.store.merge(label, |projection| {
            projection.upsert_session(session.clone());
            projection.select_session(Some(session.clone()));
            projection.set_error(None);
        });
        session
    }
}
