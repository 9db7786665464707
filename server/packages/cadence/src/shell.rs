use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_error::CadenceError;
use cadence_opencode_client::{
    AgentInfo, CreateSessionRequest, ListSessionsQuery, ModelRef, OpencodeClient,
    PermissionAction, PermissionReply, PermissionRule, PromptRequest, ProviderListing, Session,
    SummarizeRequest,
};
use cadence_opencode_server_manager::{
    resolve_opencode_root, OpenCodeServerManager, OpenCodeServerManagerConfig,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::conversation::ConversationStore;
use crate::export;
use crate::notice::ShellNotice;
use crate::permission_memory::PermissionMemory;
use crate::settings::{ConfigPaths, ServerMode, Settings, SettingsChange, SettingsPatch};
use crate::synchronizer::Synchronizer;

pub const DEFAULT_SESSION_TITLE: &str = "New session";
const SESSION_LIST_LIMIT: u32 = 200;
const SESSION_MESSAGE_LIMIT: u32 = 200;

#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    pub paths: Option<ConfigPaths>,
    /// Working directory for this process only; not persisted.
    pub directory: Option<String>,
    /// Attach to this server for this process only; not persisted.
    pub attach_url: Option<String>,
    /// Checkout used in auto mode instead of searching for one.
    pub opencode_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    pub base_url: String,
    pub directory: String,
    /// Whether the server was started by this process.
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub models: Vec<ModelSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    New,
    Clear,
    Compact,
    Export(Option<String>),
    Quit,
}

impl SlashCommand {
    pub const HELP: &'static str = "Commands:\n/help\n/new\n/clear\n/compact\n/export [path]\n/quit";

    /// Parses `/command args`. Anything unrecognized is left to be sent as a prompt.
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.trim().strip_prefix('/')?;
        let (command, args) = match rest.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (rest, ""),
        };
        match command {
            "help" => Some(Self::Help),
            "new" => Some(Self::New),
            "clear" => Some(Self::Clear),
            "compact" => Some(Self::Compact),
            "export" => Some(Self::Export((!args.is_empty()).then(|| args.to_string()))),
            "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// The shell's controller: settings, server endpoint, sessions and the
/// synchronizer behind them.
#[derive(Debug)]
pub struct CadenceShell {
    paths: ConfigPaths,
    settings: Mutex<SettingsState>,
    overrides: ShellOptions,
    sync: Synchronizer,
    server: Mutex<Option<OpenCodeServerManager>>,
}

impl CadenceShell {
    pub async fn open(options: ShellOptions) -> Result<Self, CadenceError> {
        let paths = match options.paths.clone() {
            Some(paths) => paths,
            None => ConfigPaths::resolve(None)?,
        };
        let persisted = Settings::load(&paths.settings_file()).await;
        let settings = effective_settings(&persisted, &options);

        let memory = Arc::new(
            PermissionMemory::load_or_import(paths.permission_memory_file(), &paths.legacy_documents())
                .await,
        );
        let client = Arc::new(OpencodeClient::new(
            &settings.attach_url(),
            settings.directory.clone(),
        ));
        let sync = Synchronizer::new(client, memory, Arc::new(ConversationStore::new()));

        Ok(Self {
            paths,
            settings: Mutex::new(SettingsState {
                persisted,
                effective: settings,
            }),
            overrides: options,
            sync,
            server: Mutex::new(None),
        })
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn client(&self) -> &Arc<OpencodeClient> {
        self.sync.client()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        self.sync.store()
    }

    pub fn notices(&self) -> broadcast::Receiver<ShellNotice> {
        self.sync.notices()
    }

    /// Settings in effect for this process, overrides included.
    pub async fn settings(&self) -> Settings {
        self.settings.lock().await.effective.clone()
    }

    pub fn active_session(&self) -> Option<String> {
        self.store().read(|state| state.active_session.clone())
    }

    /// Ensures the endpoint and (re)starts the event subscription.
    pub async fn ready(&self) -> ReadyInfo {
        let info = self.ensure_server_ready().await;
        self.sync.restart().await;
        info
    }

    /// Points the client at the configured server.
    ///
    /// In auto mode a failed start falls back to `serverUrl` and publishes an
    /// error notice.
    pub async fn ensure_server_ready(&self) -> ReadyInfo {
        let settings = self.settings().await;
        let (base_url, managed) = match settings.server_mode {
            ServerMode::Attach => (settings.attach_url(), false),
            ServerMode::Auto => match self.start_managed_server().await {
                Ok(base_url) => (base_url, true),
                Err(err) => {
                    let fallback = settings.attach_url();
                    warn!(error = %err, fallback = %fallback, "auto start failed; attaching instead");
                    let mut notice = err.to_notice();
                    notice.message = format!(
                        "could not start opencode, attaching to {fallback} instead: {err}"
                    );
                    self.notify(ShellNotice::Error(notice));
                    (fallback, false)
                }
            },
        };

        let client = self.client();
        client.set_base_url(&base_url);
        client.set_working_context(settings.directory.clone());
        ReadyInfo {
            base_url: client.base_url(),
            directory: settings.directory,
            managed,
        }
    }

    async fn start_managed_server(&self) -> Result<String, CadenceError> {
        let manager = {
            let mut server = self.server.lock().await;
            match server.as_ref() {
                Some(manager) => manager.clone(),
                None => {
                    let root = match self.overrides.opencode_root.clone() {
                        Some(root) => root,
                        None => resolve_opencode_root()?,
                    };
                    let manager = OpenCodeServerManager::new(OpenCodeServerManagerConfig::new(root));
                    *server = Some(manager.clone());
                    manager
                }
            }
        };
        Ok(manager.ensure_server().await?.base_url)
    }

    /// Persists `patch` and reconnects. Returns the stored settings.
    ///
    /// Process overrides are applied on top of the stored settings and never
    /// saved. A change of the effective server mode or URL drops the current
    /// subscription first and stops a managed server when switching to attach
    /// mode. Reconnect failures are reported as notices; only a failed save is
    /// returned.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<Settings, CadenceError> {
        let (persisted, effective, change) = {
            let mut current = self.settings.lock().await;
            let mut persisted = current.persisted.clone();
            patch.apply(&mut persisted);
            persisted.save(&self.paths.settings_file()).await?;

            let effective = effective_settings(&persisted, &self.overrides);
            let change = SettingsChange {
                previous_mode: current.effective.server_mode,
                mode_changed: current.effective.server_mode != effective.server_mode,
                url_changed: current.effective.attach_url() != effective.attach_url(),
            };
            current.persisted = persisted.clone();
            current.effective = effective.clone();
            (persisted, effective, change)
        };

        if change.server_changed() {
            self.sync.cancel().await;
            if change.previous_mode == ServerMode::Auto && effective.server_mode == ServerMode::Attach {
                if let Some(manager) = self.server.lock().await.take() {
                    manager.shutdown().await;
                }
            }
        }

        self.ready().await;
        Ok(persisted)
    }

    pub async fn list_sessions(&self, search: Option<&str>) -> Result<Vec<Session>, CadenceError> {
        let sessions = self
            .client()
            .list_sessions(&ListSessionsQuery {
                search: search.map(str::to_string),
                limit: Some(SESSION_LIST_LIMIT),
                roots: Some(false),
            })
            .await?;
        self.store().update(|state| state.sessions_stale = false);
        Ok(sessions)
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<Session, CadenceError> {
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(DEFAULT_SESSION_TITLE);
        self.client()
            .create_session(&CreateSessionRequest {
                title: title.to_string(),
                permission: default_permission_rules(),
            })
            .await
    }

    /// Makes `session_id` the active session with its latest messages.
    pub async fn open_session(&self, session_id: &str) -> Result<(), CadenceError> {
        let messages = self
            .client()
            .session_messages(session_id, Some(SESSION_MESSAGE_LIMIT))
            .await?;
        self.store()
            .update(|state| state.open_session(session_id, messages));
        Ok(())
    }

    /// Opens the most recent session, creating one when there are none.
    pub async fn open_latest_or_create(&self) -> Result<String, CadenceError> {
        let session_id = match self.list_sessions(None).await?.into_iter().next() {
            Some(session) => session.id,
            None => self.create_session(None).await?.id,
        };
        self.open_session(&session_id).await?;
        Ok(session_id)
    }

    /// Creates and opens a session.
    pub async fn start_new_session(&self, title: Option<&str>) -> Result<Session, CadenceError> {
        let session = self.create_session(title).await?;
        self.open_session(&session.id).await?;
        Ok(session)
    }

    pub fn clear_messages(&self) {
        self.store().update(|state| state.messages.clear());
    }

    /// Sends `text` to the active session, creating one if needed. Returns the
    /// session id the prompt went to.
    pub async fn send_prompt(&self, text: &str) -> Result<String, CadenceError> {
        let session_id = match self.active_session() {
            Some(session_id) => session_id,
            None => self.start_new_session(None).await?.id,
        };

        self.store()
            .update(|state| state.append_local_user_message(text));

        let settings = self.settings().await;
        let mut request = PromptRequest::text(text);
        request.model = settings.model;
        request.agent = settings.agent;
        self.client().prompt(&session_id, &request).await?;
        Ok(session_id)
    }

    pub async fn summarize(&self, session_id: &str) -> Result<bool, CadenceError> {
        let model = self.resolve_summary_model().await?;
        debug!(session_id, model = %model, "summarizing session");
        self.client()
            .summarize(session_id, &SummarizeRequest::for_model(&model))
            .await
    }

    /// Settings model, then the server config's `provider/model`, then the
    /// first provider default.
    pub async fn resolve_summary_model(&self) -> Result<ModelRef, CadenceError> {
        if let Some(model) = self.settings().await.model {
            return Ok(model);
        }

        match self.client().get_config().await {
            Ok(config) => {
                if let Some(model) = config.model.as_deref().and_then(ModelRef::parse) {
                    return Ok(model);
                }
            }
            Err(err) => debug!(error = %err, "config unavailable for model resolution"),
        }

        match self.client().list_providers().await {
            Ok(listing) => {
                if let Some(model) = listing.default_model() {
                    return Ok(model);
                }
            }
            Err(err) => debug!(error = %err, "providers unavailable for model resolution"),
        }

        Err(CadenceError::InvalidRequest {
            message: "no default model could be resolved for summarizing; choose a model in settings"
                .to_string(),
        })
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>, CadenceError> {
        self.client().list_agents().await
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderSummary>, CadenceError> {
        let listing = self.client().list_providers().await?;
        Ok(normalize_providers(&listing))
    }

    pub async fn respond_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
    ) -> Result<(), CadenceError> {
        self.sync.respond(request_id, reply).await
    }

    pub async fn export_session_markdown(&self, session_id: &str, path: &Path) -> Result<(), CadenceError> {
        let messages = self.client().session_messages(session_id, None).await?;
        let markdown = export::render_markdown(session_id, &chrono::Local::now(), &messages);
        export::write_markdown(path, &markdown).await
    }

    pub fn set_focused(&self, focused: bool) {
        self.sync.set_focused(focused);
    }

    pub async fn shutdown(&self) {
        self.sync.cancel().await;
        if let Some(manager) = self.server.lock().await.take() {
            manager.shutdown().await;
        }
    }

    fn notify(&self, notice: ShellNotice) {
        let _ = self.sync.notice_sender().send(notice);
    }

    /// Publishes `err` as a notice unless it is a silent policy violation.
    pub fn report(&self, err: &CadenceError) {
        if err.error_type().is_silent() {
            debug!(error = %err, "suppressed policy violation");
            return;
        }
        self.notify(ShellNotice::from(err));
    }
}

#[derive(Debug)]
struct SettingsState {
    persisted: Settings,
    effective: Settings,
}

fn effective_settings(persisted: &Settings, options: &ShellOptions) -> Settings {
    let mut settings = persisted.clone();
    if let Some(directory) = options.directory.as_ref() {
        settings.directory = directory.clone();
    }
    if let Some(url) = options.attach_url.as_ref() {
        settings.server_mode = ServerMode::Attach;
        settings.server_url = url.clone();
    }
    settings
}

pub fn default_permission_rules() -> Vec<PermissionRule> {
    let mut rules: Vec<PermissionRule> = ["bash", "edit", "webfetch", "websearch"]
        .into_iter()
        .map(|permission| PermissionRule::new(permission, "*", PermissionAction::Ask))
        .collect();
    rules.push(PermissionRule::new("question", "*", PermissionAction::Allow));
    rules
}

/// Flattens `/provider` into `[{id, models: [{id}]}]`. `models` may be an
/// object keyed by id or an array; entries without an id are dropped.
pub fn normalize_providers(listing: &ProviderListing) -> Vec<ProviderSummary> {
    listing
        .all
        .iter()
        .filter_map(|provider| {
            let id = first_string(provider, &["id", "providerID", "name"])?;
            let models = match provider.get("models") {
                Some(Value::Array(models)) => models.iter().collect::<Vec<_>>(),
                Some(Value::Object(models)) => models.values().collect(),
                _ => Vec::new(),
            };
            let models = models
                .into_iter()
                .filter_map(|model| first_string(model, &["id", "modelID", "name"]))
                .map(|id| ModelSummary { id })
                .collect();
            Some(ProviderSummary { id, models })
        })
        .collect()
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
