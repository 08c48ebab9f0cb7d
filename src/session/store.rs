//! Session records and the session manager.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::agent::{Agent, AgentError};
use crate::error::ProxyError;
use crate::llm::{LlmDriver, Message};
use crate::mcp::{ToolBackend, ToolConnector};

/// Fixed system-instruction preamble composed into every turn.
const SYSTEM_PREAMBLE: &str = "You are a helpful assistant. You have access to remote tools; \
     use them whenever they can answer the user's question, and reply with \
     a short, direct answer.";

/// Canned reply returned when a turn hits the agent's step ceiling.
pub const STEP_CEILING_REPLY: &str =
    "I couldn't finish that request within my step limit. Please try again, \
     or ask a simpler question.";

/// A single conversation session.
///
/// The record exclusively owns its remote tool-client handle; the agent
/// starts uninitialized and is populated by [`Session::ensure_agent`].
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    /// Unique session identifier.
    id: String,
    /// Remote tool connection, owned for the record's lifetime.
    tools: Arc<dyn ToolBackend>,
    /// Lazily constructed agent; empty until the first turn.
    agent: OnceCell<Arc<Agent>>,
    /// Conversation history, append-only (user/assistant pairs).
    history: RwLock<Vec<Message>>,
    /// Serializes whole turns for this session.
    turn_lock: tokio::sync::Mutex<()>,
    /// Whether history is replayed into each agent run.
    replay_history: bool,
    /// Session creation time.
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    /// Last activity time, drives idle expiry.
    last_activity: RwLock<DateTime<Utc>>,
}

impl Session {
    fn new(id: String, tools: Arc<dyn ToolBackend>, replay_history: bool) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                tools,
                agent: OnceCell::new(),
                history: RwLock::new(Vec::new()),
                turn_lock: tokio::sync::Mutex::new(()),
                replay_history,
                created_at: now,
                last_activity: RwLock::new(now),
            }),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Identifier of the underlying tool-server connection.
    #[must_use]
    pub fn mcp_session_id(&self) -> &str {
        self.inner.tools.connection_id()
    }

    /// Get-or-create the session's agent.
    ///
    /// The first call constructs an agent bound to this record's tool
    /// client with the given model and step ceiling; every later call
    /// returns that same instance, whatever model it asks for.
    pub async fn ensure_agent(
        &self,
        driver: Arc<dyn LlmDriver>,
        model: &str,
        max_steps: usize,
    ) -> Arc<Agent> {
        self.inner
            .agent
            .get_or_init(|| async {
                tracing::debug!(
                    session_id = %self.inner.id,
                    model = %model,
                    max_steps = max_steps,
                    "Constructing session agent"
                );
                Arc::new(Agent::new(
                    driver,
                    Arc::clone(&self.inner.tools),
                    model,
                    max_steps,
                ))
            })
            .await
            .clone()
    }

    /// Run one chat turn: compose the system preamble (and, when enabled,
    /// the replayed history) with `query`, delegate to the agent, append
    /// the exchange, and return the result text.
    ///
    /// A step-ceiling failure is recovered into [`STEP_CEILING_REPLY`];
    /// any other agent failure propagates once as [`ProxyError::Agent`].
    ///
    /// # Errors
    ///
    /// [`ProxyError::Agent`] for non-ceiling agent failures.
    pub async fn run_turn(&self, agent: &Agent, query: &str) -> Result<String, ProxyError> {
        let _turn = self.inner.turn_lock.lock().await;

        let mut messages = vec![Message::system(SYSTEM_PREAMBLE)];
        if self.inner.replay_history {
            messages.extend(self.history());
        }
        messages.push(Message::user(query));

        let response = match agent.run(messages).await {
            Ok(text) => text,
            Err(AgentError::StepCeiling { steps }) => {
                tracing::warn!(
                    session_id = %self.inner.id,
                    steps = steps,
                    "Turn hit the step ceiling; returning canned reply"
                );
                STEP_CEILING_REPLY.to_string()
            }
            Err(e) => return Err(ProxyError::Agent(e.into())),
        };

        {
            let mut guard = self.inner.history.write().unwrap();
            guard.push(Message::user(query));
            guard.push(Message::assistant(response.clone()));
        }
        self.touch();

        Ok(response)
    }

    /// Get the conversation history.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.inner.history.read().unwrap().clone()
    }

    /// Number of history entries.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.history.read().unwrap().len()
    }

    /// Whether an agent has been constructed for this session.
    #[must_use]
    pub fn has_agent(&self) -> bool {
        self.inner.agent.get().is_some()
    }

    /// Update the last activity timestamp.
    fn touch(&self) {
        let mut guard = self.inner.last_activity.write().unwrap();
        *guard = Utc::now();
    }

    /// Check whether the session has been inactive longer than `timeout`.
    #[must_use]
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let last = *self.inner.last_activity.read().unwrap();
        let now = Utc::now();
        match (now - last).to_std() {
            Ok(duration) => duration > timeout,
            // Negative duration means clock skew or "last" is in the future.
            Err(_) => false,
        }
    }
}

/// Options for the session manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Idle period after which a session may be swept.
    pub idle_timeout: Duration,
    /// Whether history is replayed into each agent run. With this off,
    /// each turn sees only the preamble and the new query, matching a
    /// proxy whose conversational memory lives (if anywhere) inside the
    /// agent instance.
    pub replay_history: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            replay_history: true,
        }
    }
}

/// Thread-safe store for sessions.
///
/// Owns the map and the tool-client construction path; handlers reach it
/// through `AppState` rather than ambient process state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Session>>,
    connector: Arc<dyn ToolConnector>,
    options: SessionOptions,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_count", &self.len())
            .finish()
    }
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(connector: Arc<dyn ToolConnector>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                connector,
                options,
            }),
        }
    }

    /// Return a valid session for `requested`, creating one if needed.
    ///
    /// A known id returns its existing record unchanged. An absent or
    /// unknown id creates a fresh record under a newly generated id: a new
    /// tool client is connected first, and nothing is inserted if that
    /// connection fails.
    ///
    /// # Errors
    ///
    /// [`ProxyError::ConnectionSetup`] when the tool client cannot be
    /// constructed.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<Session, ProxyError> {
        if let Some(id) = requested {
            let guard = self.inner.sessions.read().unwrap();
            if let Some(session) = guard.get(id) {
                return Ok(session.clone());
            }
        }

        let tools = self
            .inner
            .connector
            .connect()
            .await
            .map_err(ProxyError::ConnectionSetup)?;

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), tools, self.inner.options.replay_history);

        let mut guard = self.inner.sessions.write().unwrap();
        guard.insert(id, session.clone());

        tracing::info!(
            session_id = %session.id(),
            mcp_session_id = %session.mcp_session_id(),
            "Created session"
        );
        Ok(session)
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        let guard = self.inner.sessions.read().unwrap();
        guard.get(id).cloned()
    }

    /// Remove a session by ID.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let mut guard = self.inner.sessions.write().unwrap();
        guard.remove(id)
    }

    /// Get the number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List all session IDs.
    #[must_use]
    pub fn list_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    /// Remove sessions idle past the configured timeout.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep_idle(&self) -> usize {
        let timeout = self.inner.options.idle_timeout;
        let mut guard = self.inner.sessions.write().unwrap();
        let before = guard.len();
        guard.retain(|_, session| !session.is_idle(timeout));
        before - guard.len()
    }

    /// Spawn the background idle sweeper.
    pub fn spawn_idle_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = manager.sweep_idle();
                if removed > 0 {
                    tracing::info!(removed = removed, "Swept idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::Stream;

    use crate::llm::{LlmRequest, MessageRole, StreamEvent};

    #[derive(Debug)]
    struct StubBackend {
        connection_id: String,
    }

    #[async_trait]
    impl ToolBackend for StubBackend {
        fn connection_id(&self) -> &str {
            &self.connection_id
        }

        fn tools_json(&self) -> Vec<serde_json::Value> {
            Vec::new()
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    /// Connector double that counts constructions.
    struct CountingConnector {
        constructed: AtomicUsize,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                constructed: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.constructed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolConnector for CountingConnector {
        async fn connect(&self) -> anyhow::Result<Arc<dyn ToolBackend>> {
            let n = self.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubBackend {
                connection_id: format!("conn-{n}"),
            }))
        }
    }

    /// Connector whose constructions always fail.
    struct FailingConnector;

    #[async_trait]
    impl ToolConnector for FailingConnector {
        async fn connect(&self) -> anyhow::Result<Arc<dyn ToolBackend>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Driver scripted per call; an empty script means every call fails.
    struct ScriptedDriver {
        rounds: Mutex<Vec<Vec<StreamEvent>>>,
        failure: Option<String>,
    }

    impl ScriptedDriver {
        fn answering(texts: &[&str]) -> Self {
            Self {
                rounds: Mutex::new(
                    texts
                        .iter()
                        .map(|t| {
                            vec![
                                StreamEvent::MessageDelta {
                                    text: (*t).to_string(),
                                },
                                StreamEvent::Done,
                            ]
                        })
                        .collect(),
                ),
                failure: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                rounds: Mutex::new(Vec::new()),
                failure: Some(message.to_string()),
            }
        }

        fn looping_tool_calls() -> Self {
            // Never terminates: every round requests another tool call.
            Self {
                rounds: Mutex::new(Vec::new()),
                failure: None,
            }
        }
    }

    #[async_trait]
    impl crate::llm::LlmDriver for ScriptedDriver {
        async fn stream(
            &self,
            _req: LlmRequest,
        ) -> anyhow::Result<
            std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>,
        > {
            if let Some(msg) = &self.failure {
                anyhow::bail!("{msg}");
            }
            let mut rounds = self.rounds.lock().unwrap();
            let events = if rounds.is_empty() {
                vec![
                    StreamEvent::ToolCallDelta {
                        call_index: 0,
                        id: Some("call_1".to_string()),
                        name: Some("calculate_uptime".to_string()),
                        arguments_delta: Some("{}".to_string()),
                    },
                    StreamEvent::Done,
                ]
            } else {
                rounds.remove(0)
            };
            Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok).collect::<Vec<_>>(),
            )))
        }
    }

    fn manager_with(connector: Arc<dyn ToolConnector>) -> SessionManager {
        SessionManager::new(connector, SessionOptions::default())
    }

    #[tokio::test]
    async fn test_resolve_creates_fresh_record() {
        let connector = Arc::new(CountingConnector::new());
        let manager = manager_with(connector.clone());

        let session = manager.resolve(None).await.unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(session.history_len(), 0);
        assert!(!session.has_agent());
        assert_eq!(connector.count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_reuses_known_id() {
        let connector = Arc::new(CountingConnector::new());
        let manager = manager_with(connector.clone());

        let first = manager.resolve(None).await.unwrap();
        let id = first.id().to_string();

        let second = manager.resolve(Some(&id)).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.mcp_session_id(), first.mcp_session_id());
        // The client handle is never duplicated for a known session.
        assert_eq!(connector.count(), 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_creates_new() {
        let connector = Arc::new(CountingConnector::new());
        let manager = manager_with(connector.clone());

        let session = manager.resolve(Some("no-such-session")).await.unwrap();
        assert_ne!(session.id(), "no-such-session");
        assert_eq!(connector.count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_connect_failure_inserts_nothing() {
        let manager = manager_with(Arc::new(FailingConnector));

        let err = manager.resolve(None).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionSetup(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_agent_is_idempotent() {
        let manager = manager_with(Arc::new(CountingConnector::new()));
        let session = manager.resolve(None).await.unwrap();

        let driver = Arc::new(ScriptedDriver::answering(&[]));
        let first = session.ensure_agent(driver.clone(), "gpt-4o", 10).await;
        let second = session.ensure_agent(driver, "gpt-4o-mini", 5).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.model(), "gpt-4o");
    }

    #[tokio::test]
    async fn test_history_append_only_and_ordered() {
        let manager = manager_with(Arc::new(CountingConnector::new()));
        let session = manager.resolve(None).await.unwrap();

        let driver = Arc::new(ScriptedDriver::answering(&["one", "two", "three"]));
        let agent = session.ensure_agent(driver, "gpt-4o", 10).await;

        for query in ["q1", "q2", "q3"] {
            session.run_turn(&agent, query).await.unwrap();
        }

        let history = session.history();
        assert_eq!(history.len(), 6);
        for (i, msg) in history.iter().enumerate() {
            let expected = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            assert_eq!(msg.role, expected);
        }
        assert_eq!(history[0].content, "q1");
        assert_eq!(history[1].content, "one");
        assert_eq!(history[5].content, "three");
    }

    #[tokio::test]
    async fn test_step_ceiling_recovered_into_canned_reply() {
        let manager = manager_with(Arc::new(CountingConnector::new()));
        let session = manager.resolve(None).await.unwrap();

        let driver = Arc::new(ScriptedDriver::looping_tool_calls());
        let agent = session.ensure_agent(driver, "gpt-4o", 2).await;

        let reply = session.run_turn(&agent, "spin").await.unwrap();
        assert_eq!(reply, STEP_CEILING_REPLY);
    }

    #[tokio::test]
    async fn test_other_agent_failures_propagate() {
        let manager = manager_with(Arc::new(CountingConnector::new()));
        let session = manager.resolve(None).await.unwrap();

        let driver = Arc::new(ScriptedDriver::failing("rate limited"));
        let agent = session.ensure_agent(driver, "gpt-4o", 10).await;

        let err = session.run_turn(&agent, "hi").await.unwrap_err();
        match err {
            ProxyError::Agent(e) => assert!(format!("{e:#}").contains("rate limited")),
            other => panic!("expected agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_idle_removes_stale_sessions() {
        let connector: Arc<dyn ToolConnector> = Arc::new(CountingConnector::new());
        let manager = SessionManager::new(
            connector,
            SessionOptions {
                idle_timeout: Duration::from_secs(0),
                replay_history: true,
            },
        );

        let _ = manager.resolve(None).await.unwrap();
        assert_eq!(manager.len(), 1);

        // A zero timeout makes any session idle immediately.
        std::thread::sleep(Duration::from_millis(5));
        let removed = manager.sweep_idle();
        assert_eq!(removed, 1);
        assert!(manager.is_empty());
    }
}
