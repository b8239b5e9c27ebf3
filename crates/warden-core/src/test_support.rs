//! Hand-written fakes for the engine's ports.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{
        ChatId, CumulativeTraffic, DeactivationCommit, DeactivationInfo, MessageId, MessageRef,
        NewPanel, Panel, PanelId, PanelState, Quotas, Secret, SubAccount, SubAccountStatus, UserId,
    },
    errors::Error,
    events::EngineEvent,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    ports::{Notifier, PanelStore, RemotePanelClient, RemotePanelConnector},
    Result,
};

// ============== Store ==============

#[derive(Default)]
struct StoreState {
    panels: BTreeMap<i64, Panel>,
    traffic: HashMap<i64, CumulativeTraffic>,
    next_id: i64,
    fail_commits: bool,
    fail_preserve: bool,
    fail_delete: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub async fn seed_panel(&self, username: &str, password: &str) -> Panel {
        self.seed_panel_with(username, password, UserId(100), Quotas::default(), Utc::now())
            .await
    }

    pub async fn seed_panel_with(
        &self,
        username: &str,
        password: &str,
        operator: UserId,
        quotas: Quotas,
        created_at: DateTime<Utc>,
    ) -> Panel {
        self.insert_panel(NewPanel {
            operator,
            display_name: None,
            username: username.to_string(),
            password: Secret::new(password),
            quotas,
            created_at,
        })
        .await
        .expect("seed panel")
    }

    pub fn get(&self, id: PanelId) -> Option<Panel> {
        self.state.lock().unwrap().panels.get(&id.0).cloned()
    }

    pub fn set_traffic(&self, id: PanelId, bytes: u64) {
        let mut st = self.state.lock().unwrap();
        let row = st.traffic.entry(id.0).or_insert(CumulativeTraffic {
            panel_id: id,
            bytes: 0,
            last_updated: Utc::now(),
        });
        row.bytes = bytes;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().unwrap().fail_commits = fail;
    }

    pub fn fail_preserve(&self, fail: bool) {
        self.state.lock().unwrap().fail_preserve = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }
}

#[async_trait]
impl PanelStore for MemoryStore {
    async fn insert_panel(&self, panel: NewPanel) -> Result<Panel> {
        let mut st = self.state.lock().unwrap();
        if st.panels.values().any(|p| p.username == panel.username) {
            return Err(Error::InvalidInput(format!(
                "panel {} already exists",
                panel.username
            )));
        }
        st.next_id += 1;
        let id = PanelId(st.next_id);
        let row = Panel {
            id,
            operator: panel.operator,
            display_name: panel.display_name,
            username: panel.username,
            password: panel.password,
            original_password: None,
            pending_password: None,
            quotas: panel.quotas,
            state: PanelState::Active,
            deactivation: None,
            created_at: panel.created_at,
            updated_at: panel.created_at,
        };
        st.panels.insert(id.0, row.clone());
        st.traffic.insert(
            id.0,
            CumulativeTraffic {
                panel_id: id,
                bytes: 0,
                last_updated: panel.created_at,
            },
        );
        Ok(row)
    }

    async fn panel(&self, id: PanelId) -> Result<Option<Panel>> {
        Ok(self.get(id))
    }

    async fn panel_by_username(&self, username: &str) -> Result<Option<Panel>> {
        let st = self.state.lock().unwrap();
        Ok(st.panels.values().find(|p| p.username == username).cloned())
    }

    async fn list_panels(&self, state: Option<PanelState>) -> Result<Vec<Panel>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .panels
            .values()
            .filter(|p| state.map(|s| p.state == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn operator_panels(&self, operator: UserId) -> Result<Vec<Panel>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .panels
            .values()
            .filter(|p| p.operator == operator)
            .cloned()
            .collect())
    }

    async fn update_quotas(&self, id: PanelId, quotas: &Quotas) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let p = st
            .panels
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        p.quotas = *quotas;
        Ok(())
    }

    async fn stage_rotation(
        &self,
        id: PanelId,
        original: &Secret,
        pending: &Secret,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let p = st
            .panels
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        p.original_password = Some(original.clone());
        p.pending_password = Some(pending.clone());
        Ok(())
    }

    async fn clear_staged_rotation(&self, id: PanelId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(p) = st.panels.get_mut(&id.0) {
            if p.is_active() {
                p.original_password = None;
                p.pending_password = None;
            }
        }
        Ok(())
    }

    async fn commit_deactivation(&self, id: PanelId, commit: &DeactivationCommit) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_commits {
            return Err(Error::StoreUnavailable("injected commit failure".into()));
        }
        let p = st
            .panels
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        if !p.is_active() {
            return Err(Error::inconsistent(&p.username, "panel is not active"));
        }
        p.state = PanelState::Deactivated;
        p.password = commit.new_password.clone();
        p.original_password = Some(commit.original_password.clone());
        p.pending_password = None;
        p.deactivation = Some(DeactivationInfo {
            reason: commit.reason.clone(),
            at: commit.at,
        });
        Ok(())
    }

    async fn commit_reactivation(&self, id: PanelId, restored_password: &Secret) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_commits {
            return Err(Error::StoreUnavailable("injected commit failure".into()));
        }
        let p = st
            .panels
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
        if p.is_active() {
            return Err(Error::inconsistent(&p.username, "panel is not deactivated"));
        }
        p.state = PanelState::Active;
        p.password = restored_password.clone();
        p.original_password = None;
        p.pending_password = None;
        p.deactivation = None;
        Ok(())
    }

    async fn delete_panel(&self, id: PanelId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_delete {
            return Err(Error::StoreUnavailable("injected delete failure".into()));
        }
        st.panels.remove(&id.0);
        st.traffic.remove(&id.0);
        Ok(())
    }

    async fn cumulative_traffic(&self, id: PanelId) -> Result<Option<CumulativeTraffic>> {
        Ok(self.state.lock().unwrap().traffic.get(&id.0).copied())
    }

    async fn raise_cumulative_traffic(
        &self,
        id: PanelId,
        observed: u64,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        let row = st.traffic.entry(id.0).or_insert(CumulativeTraffic {
            panel_id: id,
            bytes: 0,
            last_updated: at,
        });
        if observed > row.bytes {
            row.bytes = observed;
            row.last_updated = at;
        }
        Ok(row.bytes)
    }

    async fn preserve_traffic(&self, id: PanelId, amount: u64, at: DateTime<Utc>) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        if st.fail_preserve {
            return Err(Error::StoreUnavailable("injected preserve failure".into()));
        }
        let row = st.traffic.entry(id.0).or_insert(CumulativeTraffic {
            panel_id: id,
            bytes: 0,
            last_updated: at,
        });
        row.bytes = row.bytes.saturating_add(amount);
        row.last_updated = at;
        Ok(row.bytes)
    }
}

// ============== Remote service ==============

#[derive(Clone, Debug)]
pub struct FakeUser {
    pub admin: String,
    pub status: SubAccountStatus,
    pub used_traffic: u64,
}

#[derive(Default)]
struct RemoteState {
    admins: HashMap<String, String>,
    users: BTreeMap<String, FakeUser>,
    logins: usize,
    unreachable: bool,
    /// op -> (successful calls still allowed, status once they are used up)
    failing_ops: HashMap<String, (u32, u16)>,
    failing_users: HashMap<String, u16>,
    /// ops whose next call takes effect but reports a timeout
    lost_responses: HashSet<String>,
    calls: Vec<String>,
}

/// Scripted stand-in for the remote panel service. Sessions stop working once
/// the password they authenticated with is changed.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn RemotePanelConnector> {
        Arc::new(FakeConnector {
            remote: self.clone(),
        })
    }

    pub fn add_admin(&self, username: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .admins
            .insert(username.to_string(), password.to_string());
    }

    pub fn add_user(&self, admin: &str, username: &str, status: &str, used_traffic: u64) {
        self.state.lock().unwrap().users.insert(
            username.to_string(),
            FakeUser {
                admin: admin.to_string(),
                status: SubAccountStatus::parse(status),
                used_traffic,
            },
        );
    }

    pub fn set_user_traffic(&self, username: &str, used_traffic: u64) {
        if let Some(u) = self.state.lock().unwrap().users.get_mut(username) {
            u.used_traffic = used_traffic;
        }
    }

    pub fn force_password(&self, username: &str, password: &str) {
        self.add_admin(username, password);
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().admins.get(username).cloned()
    }

    pub fn has_admin(&self, username: &str) -> bool {
        self.state.lock().unwrap().admins.contains_key(username)
    }

    pub fn user_status(&self, username: &str) -> Option<SubAccountStatus> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(username)
            .map(|u| u.status.clone())
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.state.lock().unwrap().users.contains_key(username)
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Make an operation (`set_password`, `delete_admin`, `fetch_users`, ...) fail.
    pub fn fail_op(&self, op: &str, status: u16) {
        self.fail_op_after(op, 0, status);
    }

    /// Let `op` succeed `successes` more times, then fail with `status`.
    pub fn fail_op_after(&self, op: &str, successes: u32, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_ops
            .insert(op.to_string(), (successes, status));
    }

    /// The next `op` call is applied remotely but the caller sees a timeout.
    pub fn lose_response(&self, op: &str) {
        self.state
            .lock()
            .unwrap()
            .lost_responses
            .insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        let mut st = self.state.lock().unwrap();
        st.failing_ops.clear();
        st.failing_users.clear();
    }

    /// Make every per-user call on `username` fail with `status`.
    pub fn fail_user(&self, username: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_users
            .insert(username.to_string(), status);
    }

    /// Mutating calls recorded so far, e.g. `set_password shop`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

struct FakeConnector {
    remote: FakeRemote,
}

#[async_trait]
impl RemotePanelConnector for FakeConnector {
    async fn connect(
        &self,
        username: &str,
        password: &Secret,
    ) -> Result<Arc<dyn RemotePanelClient>> {
        let mut st = self.remote.state.lock().unwrap();
        if st.unreachable {
            return Err(Error::RemoteUnreachable("connection refused".into()));
        }
        st.logins += 1;
        match st.admins.get(username) {
            Some(pw) if pw == password.expose() => Ok(Arc::new(FakeSession {
                remote: self.remote.clone(),
                username: username.to_string(),
                password: password.expose().to_string(),
            })),
            _ => Err(Error::rejected(
                "authenticate",
                401,
                "Incorrect username or password",
            )),
        }
    }
}

struct FakeSession {
    remote: FakeRemote,
    username: String,
    password: String,
}

impl FakeSession {
    fn begin(&self, op: &str, target: &str) -> Result<std::sync::MutexGuard<'_, RemoteState>> {
        let mut st = self.remote.state.lock().unwrap();
        if st.unreachable {
            return Err(Error::RemoteUnreachable("timed out".into()));
        }
        if st.admins.get(&self.username) != Some(&self.password) {
            return Err(Error::rejected(op, 401, "Could not validate credentials"));
        }
        if let Some((successes, status)) = st.failing_ops.get_mut(op) {
            if *successes == 0 {
                return Err(Error::rejected(op, *status, "injected failure"));
            }
            *successes -= 1;
        }
        if let Some(status) = st.failing_users.get(target) {
            return Err(Error::rejected(op, *status, "injected failure"));
        }
        Ok(st)
    }
}

#[async_trait]
impl RemotePanelClient for FakeSession {
    fn username(&self) -> &str {
        &self.username
    }

    async fn fetch_users(&self, panel_username: &str) -> Result<Vec<SubAccount>> {
        let st = self.begin("fetch_users", "")?;
        Ok(st
            .users
            .iter()
            .filter(|(_, u)| u.admin == panel_username)
            .map(|(name, u)| SubAccount {
                username: name.clone(),
                status: u.status.clone(),
                used_traffic: u.used_traffic,
                lifetime_used_traffic: 0,
                data_limit: None,
                expire: None,
                admin: Some(u.admin.clone()),
            })
            .collect())
    }

    async fn fetch_admin_exists(&self, username: &str) -> Result<bool> {
        let st = self.begin("fetch_admin_exists", "")?;
        Ok(st.admins.contains_key(username))
    }

    async fn set_password(&self, username: &str, password: &Secret, _is_sudo: bool) -> Result<()> {
        let mut st = self.begin("set_password", "")?;
        if !st.admins.contains_key(username) {
            return Err(Error::rejected("set_password", 404, "Admin not found"));
        }
        st.admins
            .insert(username.to_string(), password.expose().to_string());
        st.calls.push(format!("set_password {username}"));
        if st.lost_responses.remove("set_password") {
            return Err(Error::RemoteUnreachable("timed out".into()));
        }
        Ok(())
    }

    async fn set_user_enabled(&self, username: &str, enabled: bool) -> Result<()> {
        let mut st = self.begin("set_user_enabled", username)?;
        let Some(u) = st.users.get_mut(username) else {
            return Err(Error::rejected("set_user_enabled", 404, "User not found"));
        };
        u.status = if enabled {
            SubAccountStatus::Active
        } else {
            SubAccountStatus::Disabled
        };
        let verb = if enabled { "enable" } else { "disable" };
        st.calls.push(format!("{verb} {username}"));
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut st = self.begin("delete_user", username)?;
        if st.users.remove(username).is_none() {
            return Err(Error::rejected("delete_user", 404, "User not found"));
        }
        st.calls.push(format!("delete_user {username}"));
        Ok(())
    }

    async fn delete_admin(&self, username: &str) -> Result<()> {
        let mut st = self.begin("delete_admin", "")?;
        if st.admins.remove(username).is_none() {
            return Err(Error::rejected("delete_admin", 404, "Admin not found"));
        }
        st.calls.push(format!("delete_admin {username}"));
        Ok(())
    }

    async fn create_admin(
        &self,
        username: &str,
        password: &Secret,
        _telegram_id: i64,
        _is_sudo: bool,
    ) -> Result<()> {
        let mut st = self.begin("create_admin", "")?;
        if st.admins.contains_key(username) {
            return Err(Error::rejected("create_admin", 409, "Admin already exists"));
        }
        st.admins
            .insert(username.to_string(), password.expose().to_string());
        st.calls.push(format!("create_admin {username}"));
        Ok(())
    }
}

// ============== Notifier ==============

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(EngineEvent::kind)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &EngineEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============== Messenger ==============

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<(ChatId, String)>>,
    failing_chats: Mutex<Vec<i64>>,
}

impl FakeMessenger {
    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(*guard),
        }
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| c.0 == chat)
            .map(|(_, html)| html)
            .collect()
    }

    pub fn fail_chat(&self, chat: i64) {
        self.failing_chats.lock().unwrap().push(chat);
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_chat_actions: false,
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        if self.failing_chats.lock().unwrap().contains(&chat_id.0) {
            return Err(Error::External("Forbidden: bot was blocked by the user".into()));
        }
        self.sends
            .lock()
            .unwrap()
            .push((chat_id, html.to_string()));
        Ok(self.alloc(chat_id))
    }

    async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
        Ok(())
    }
}
