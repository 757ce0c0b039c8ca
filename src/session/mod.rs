//! Session manager: one authenticated websocket lifetime, bounded by connect
//! and disconnect. Three cooperative loops share the connection: heartbeat
//! enqueues PING on a timer, inbound is the sole reader and classifies
//! frames, outbound is the sole writer and drains the FIFO queue. Any
//! loop hitting a fatal error clears the shared `active` flag; the others
//! observe it at their next check point and exit. Nothing carries across
//! reconnects except the persisted credential.

use crate::api::{DynError, MessageSender, TokenProvider, UserLookup};
use crate::commands::{CommandContext, CommandTable};
use crate::model::{ChatMessage, PointsKind};
use crate::protocol::{self, ChatEntry, ChatEntryKind, ControlFrame, InboundMessage};
use crate::store::{Store, StoreError};
use crate::transport::{ChatSink, ChatStream, TransportError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Flat secondary-currency reward for a subscription event.
const SUBSCRIPTION_REWARD: i64 = 500;

#[cfg(not(test))]
const OUTBOUND_IDLE_POLL: Duration = Duration::from_millis(100);
#[cfg(test)]
const OUTBOUND_IDLE_POLL: Duration = Duration::from_millis(5);

#[cfg(not(test))]
const ACTIVE_CHECK_TICK: Duration = Duration::from_millis(500);
#[cfg(test)]
const ACTIVE_CHECK_TICK: Duration = Duration::from_millis(5);

/// Mutable state shared by the three loops.
pub struct SessionState {
    active: AtomicBool,
    started_at: u64,
    default_gap: Duration,
    last_pong_ms: Mutex<u64>,
    heartbeat_gap: Mutex<Duration>,
    queue: Mutex<VecDeque<ControlFrame>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionState {
    fn new(default_gap: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active: AtomicBool::new(false),
            started_at: now_unix_secs(),
            default_gap,
            last_pong_ms: Mutex::new(0),
            heartbeat_gap: Mutex::new(default_gap),
            queue: Mutex::new(VecDeque::new()),
            shutdown_tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) {
        self.active.store(false, Ordering::SeqCst);
        // send_replace stores the value even when nobody subscribes yet
        self.shutdown_tx.send_replace(true);
    }

    /// Resolves once `shut_down` has been called, including when that
    /// happened before this future was created.
    async fn shut_down_observed(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    fn heartbeat_gap(&self) -> Duration {
        *self.heartbeat_gap.lock().unwrap()
    }

    fn enqueue(&self, frame: ControlFrame) {
        self.queue.lock().unwrap().push_back(frame);
    }

    fn pop_frame(&self) -> Option<ControlFrame> {
        self.queue.lock().unwrap().pop_front()
    }

    fn record_pong(&self, gap_secs: Option<u64>) {
        *self.last_pong_ms.lock().unwrap() = now_unix_ms();
        let gap = match gap_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.default_gap,
        };
        *self.heartbeat_gap.lock().unwrap() = gap;
    }

    fn stamp_pong(&self, now_ms: u64) {
        *self.last_pong_ms.lock().unwrap() = now_ms;
    }

    /// True when no pong has arrived for longer than twice the heartbeat gap,
    /// meaning the chat-service auth has likely lapsed.
    fn auth_due(&self, now_ms: u64) -> bool {
        let gap_ms = self.heartbeat_gap().as_millis() as u64;
        let last = *self.last_pong_ms.lock().unwrap();
        last + 2 * gap_ms < now_ms
    }

    #[cfg(test)]
    fn set_heartbeat_gap(&self, gap: Duration) {
        *self.heartbeat_gap.lock().unwrap() = gap;
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<ControlFrame> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

pub struct Session {
    state: Arc<SessionState>,
    tokens: Arc<dyn TokenProvider>,
    sender: Arc<dyn MessageSender>,
    users: Arc<dyn UserLookup>,
    store: Arc<Mutex<Store>>,
    commands: Arc<CommandTable>,
    greeting: String,
    token_timeout: Duration,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        sender: Arc<dyn MessageSender>,
        users: Arc<dyn UserLookup>,
        store: Arc<Mutex<Store>>,
        commands: Arc<CommandTable>,
        greeting: String,
        heartbeat_gap: Duration,
        token_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(SessionState::new(heartbeat_gap)),
            tokens,
            sender,
            users,
            store,
            commands,
            greeting,
            token_timeout,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Drive the session to completion: authenticate, then run the three
    /// loops until a fatal error ends the attempt.
    pub async fn run<W, R>(&self, mut sink: W, mut stream: R) -> Result<(), SessionError>
    where
        W: ChatSink,
        R: ChatStream,
    {
        self.authenticate().await?;

        self.state.activate();
        tracing::info!(started_at = self.state.started_at, "chat session live");

        let (_, inbound, outbound) = tokio::join!(
            self.heartbeat_loop(),
            self.inbound_loop(&mut stream),
            self.outbound_loop(&mut sink),
        );
        self.state.shut_down();

        inbound.and(outbound)
    }

    /// Restore the persisted credential, validate or refresh it, and persist
    /// whatever came back. Fatal for this attempt when it fails; the outer
    /// reconnect loop retries, so everything here must be re-callable.
    async fn authenticate(&self) -> Result<(), SessionError> {
        // a refresh during the previous session may have rotated the pair in
        // memory; the disk copy is only authoritative on a cold start
        if self.tokens.credentials().is_empty() {
            let creds = {
                let store = self.store.lock().unwrap();
                store.load_credentials().map_err(SessionError::Store)?
            };
            self.tokens.restore(creds);
        }

        if let Err(err) = self.tokens.ensure_valid().await {
            tracing::error!(error = %err, "authentication failed");
            return Err(SessionError::Auth(err));
        }

        let refreshed = self.tokens.credentials();
        let store = self.store.lock().unwrap();
        store
            .save_credentials(&refreshed)
            .map_err(SessionError::Store)?;
        Ok(())
    }

    async fn heartbeat_loop(&self) {
        tracing::info!("heartbeat loop started");
        while self.state.is_active() {
            // re-read each cycle; a PONG may have adjusted the gap
            let deadline = tokio::time::Instant::now() + self.state.heartbeat_gap();
            while self.state.is_active() {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep((deadline - now).min(ACTIVE_CHECK_TICK)).await;
            }
            if self.state.is_active() {
                self.state.enqueue(ControlFrame::ping());
            }
        }
    }

    async fn inbound_loop<R: ChatStream>(&self, stream: &mut R) -> Result<(), SessionError> {
        tracing::info!("inbound loop started");
        while self.state.is_active() {
            // recv_text can wait forever on a quiet socket; racing it against
            // the shutdown signal lets a failure in another loop end this one
            let received = tokio::select! {
                _ = self.state.shut_down_observed() => break,
                res = stream.recv_text() => res,
            };
            let text = match received {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "inbound loop stopped");
                    self.state.shut_down();
                    return Err(SessionError::Transport(err));
                }
            };
            tracing::debug!(raw = %text, "gateway response");

            match protocol::decode(&text) {
                Ok(msg) => self.handle_message(msg).await,
                Err(err) => tracing::warn!(error = %err, "malformed gateway frame dropped"),
            }
        }
        Ok(())
    }

    async fn outbound_loop<W: ChatSink>(&self, sink: &mut W) -> Result<(), SessionError> {
        tracing::info!("outbound loop started");
        while self.state.is_active() {
            let now_ms = now_unix_ms();
            if self.state.auth_due(now_ms) {
                // the fetch calls out to the REST API on the hot path; the
                // timeout keeps a hung request from stalling the session
                let token = match tokio::time::timeout(self.token_timeout, self.tokens.chat_token())
                    .await
                {
                    Ok(Ok(token)) => token,
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "chat token fetch failed");
                        self.state.shut_down();
                        return Err(SessionError::Token(err));
                    }
                    Err(_) => {
                        tracing::error!(timeout = ?self.token_timeout, "chat token fetch timed out");
                        self.state.shut_down();
                        return Err(SessionError::TokenTimeout);
                    }
                };
                self.state.enqueue(ControlFrame::auth(token));
                self.state.stamp_pong(now_ms);
            }

            match self.state.pop_frame() {
                None => tokio::time::sleep(OUTBOUND_IDLE_POLL).await,
                Some(frame) => {
                    tracing::debug!(frame = frame.kind(), "gateway request");
                    if let Err(err) = sink.send_text(frame.encode()).await {
                        tracing::error!(error = %err, "outbound loop stopped");
                        self.state.shut_down();
                        return Err(SessionError::Transport(err));
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, msg: InboundMessage) {
        match msg {
            InboundMessage::Response { error, .. } => {
                if let Some(err) = error {
                    tracing::warn!(error = %err, "gateway auth response carried an error");
                }
                if let Err(err) = self.sender.send_message(&self.greeting).await {
                    tracing::warn!(error = %err, "greeting send failed");
                }
            }
            InboundMessage::Pong { gap_secs } => self.state.record_pong(gap_secs),
            InboundMessage::Chat { entries } => {
                for entry in entries {
                    self.process_entry(&entry).await;
                }
            }
            InboundMessage::Other { kind } => {
                tracing::debug!(kind = %kind, "unhandled gateway message");
            }
        }
    }

    async fn process_entry(&self, entry: &ChatEntry) {
        if entry.send_time < self.state.started_at as i64 {
            tracing::debug!(content = %entry.content, "stale chat entry ignored");
            return;
        }

        if let Err(err) = self.apply_credit(entry).await {
            tracing::warn!(sender = %entry.nick_name, error = %err, "credit failed");
        }

        let msg = self.normalize(entry);
        let ctx = CommandContext {
            store: self.store.clone(),
            sender: self.sender.clone(),
            users: self.users.clone(),
        };
        self.commands.dispatch(&msg, &ctx).await;
    }

    fn normalize(&self, entry: &ChatEntry) -> ChatMessage {
        let sender = {
            let mut store = self.store.lock().unwrap();
            store.find_user(&entry.nick_name, entry.sender_id)
        };
        ChatMessage {
            text: entry.content.clone(),
            sender,
            roles: entry.roles.clone(),
        }
    }

    /// The two automatic credit triggers: spells carry an amount and
    /// multiplier in their content payload, subscriptions pay a flat reward.
    async fn apply_credit(&self, entry: &ChatEntry) -> Result<(), DynError> {
        match entry.kind() {
            ChatEntryKind::Spells => {
                let spell = entry.spell_content()?;
                let amount = spell.gift_value.saturating_mul(spell.num);
                match spell.value_type.as_str() {
                    "Mana" => self.credit(entry, amount, PointsKind::Mana).await?,
                    "Elixir" => self.credit(entry, amount, PointsKind::Elixir).await?,
                    other => {
                        tracing::debug!(value_type = %other, "spell with unrecognized value type");
                    }
                }
            }
            ChatEntryKind::Subscription => {
                self.credit(entry, SUBSCRIPTION_REWARD, PointsKind::Elixir)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn credit(
        &self,
        entry: &ChatEntry,
        amount: i64,
        kind: PointsKind,
    ) -> Result<(), DynError> {
        let user = {
            let mut store = self.store.lock().unwrap();
            store.add_points(&entry.nick_name, entry.sender_id, amount, kind)?
        };
        self.sender
            .send_message(&format!("Add {} {} to {}", amount, kind.label(), user.name))
            .await
    }
}

#[derive(Debug)]
pub enum SessionError {
    Store(StoreError),
    Auth(DynError),
    Token(DynError),
    TokenTimeout,
    Transport(TransportError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Auth(err) => write!(f, "auth error: {err}"),
            Self::Token(err) => write!(f, "chat token error: {err}"),
            Self::TokenTimeout => write!(f, "chat token fetch timed out"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
