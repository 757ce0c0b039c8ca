//! Chat command dispatch. Handlers are registered into an explicit ordered
//! table at startup; at most one handler runs per message, and handler
//! failures are isolated from the session.

use crate::api::{DynError, MessageSender, UserLookup};
use crate::model::{ChatMessage, PointsKind, UserData};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub const COMMAND_PREFIX: char = '!';

/// Shared collaborators available to every handler.
pub struct CommandContext {
    pub store: Arc<Mutex<Store>>,
    pub sender: Arc<dyn MessageSender>,
    pub users: Arc<dyn UserLookup>,
}

/// Resolve a command target by name: the local roster first, then a platform
/// lookup so a user who has never chatted still gets a record with their real
/// id. A failed lookup falls back to a roster record with an unknown id.
async fn resolve_target(ctx: &CommandContext, name: &str) -> UserData {
    if let Some(user) = ctx.store.lock().unwrap().user_named(name).cloned() {
        return user;
    }

    let trovo_id = match ctx.users.lookup_user(name).await {
        Ok(Some(found)) => found.user_id.parse().unwrap_or(-1),
        Ok(None) => -1,
        Err(err) => {
            tracing::warn!(name, error = %err, "platform user lookup failed");
            -1
        }
    };
    ctx.store.lock().unwrap().find_user(name, trovo_id)
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, msg: &ChatMessage, ctx: &CommandContext) -> Result<(), DynError>;
}

pub struct CommandSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    owner_only: bool,
    handler: Box<dyn CommandHandler>,
}

impl CommandSpec {
    pub fn new(
        name: &'static str,
        aliases: &'static [&'static str],
        owner_only: bool,
        handler: Box<dyn CommandHandler>,
    ) -> Self {
        Self {
            name,
            aliases,
            owner_only,
            handler,
        }
    }

    fn matches(&self, word: &str) -> bool {
        word == self.name || self.aliases.contains(&word)
    }
}

pub struct CommandTable {
    commands: Vec<CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Table with the built-in handlers, help listing included.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register(CommandSpec::new(
            "points",
            &["p"],
            false,
            Box::new(PointsCommand),
        ));
        table.register(CommandSpec::new(
            "addmp",
            &[],
            true,
            Box::new(AddPointsCommand {
                kind: PointsKind::Mana,
            }),
        ));
        table.register(CommandSpec::new(
            "addep",
            &[],
            true,
            Box::new(AddPointsCommand {
                kind: PointsKind::Elixir,
            }),
        ));

        let mut entries = vec![HelpEntry {
            text: format!("{COMMAND_PREFIX}help"),
            owner_only: false,
        }];
        entries.extend(table.commands.iter().map(|spec| HelpEntry {
            text: format!("{}{}", COMMAND_PREFIX, spec.name),
            owner_only: spec.owner_only,
        }));
        table.register(CommandSpec::new(
            "help",
            &[],
            false,
            Box::new(HelpCommand { entries }),
        ));
        table
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.push(spec);
    }

    /// Run the first matching handler, if any. Errors are logged with sender
    /// context and never escape to the caller.
    pub async fn dispatch(&self, msg: &ChatMessage, ctx: &CommandContext) {
        let Some(first) = msg.text.split_whitespace().next() else {
            return;
        };
        let Some(word) = first.strip_prefix(COMMAND_PREFIX) else {
            return;
        };

        for spec in &self.commands {
            if !spec.matches(word) {
                continue;
            }
            if spec.owner_only && !msg.is_streamer() {
                tracing::debug!(
                    command = spec.name,
                    sender = %msg.sender.name,
                    "command rejected: no privileges"
                );
                return;
            }
            tracing::debug!(command = spec.name, sender = %msg.sender.name, "command triggered");
            if let Err(err) = spec.handler.run(msg, ctx).await {
                tracing::warn!(
                    command = spec.name,
                    sender = %msg.sender.name,
                    error = %err,
                    "command failed"
                );
            }
            return;
        }
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::builtin()
    }
}

struct PointsCommand;

#[async_trait]
impl CommandHandler for PointsCommand {
    async fn run(&self, msg: &ChatMessage, ctx: &CommandContext) -> Result<(), DynError> {
        // the streamer may query someone else's balance by name
        let target = if msg.is_streamer() {
            msg.text
                .split_whitespace()
                .nth(1)
                .map(|arg| arg.trim_start_matches('@').to_string())
        } else {
            None
        };

        let reply = match target {
            Some(name) => {
                let u = resolve_target(ctx, &name).await;
                format!("{}: {} mp, {} ep", u.name, u.mana, u.elixir)
            }
            None => {
                let u = &msg.sender;
                format!("{}: {} mp, {} ep", u.name, u.mana, u.elixir)
            }
        };
        ctx.sender.send_message(&reply).await
    }
}

struct AddPointsCommand {
    kind: PointsKind,
}

#[async_trait]
impl CommandHandler for AddPointsCommand {
    async fn run(&self, msg: &ChatMessage, ctx: &CommandContext) -> Result<(), DynError> {
        let mut args = msg.text.split_whitespace().skip(1);
        let (Some(name), Some(amount)) = (args.next(), args.next()) else {
            return Ok(());
        };
        let amount: i64 = amount.parse()?;
        let name = name.trim_start_matches('@');

        let target = resolve_target(ctx, name).await;
        let user = {
            let mut store = ctx.store.lock().unwrap();
            store.add_points(&target.name, target.trovo_id, amount, self.kind)?
        };
        ctx.sender
            .send_message(&format!("Add {} {} to {}", amount, self.kind.label(), user.name))
            .await
    }
}

struct HelpEntry {
    text: String,
    owner_only: bool,
}

struct HelpCommand {
    entries: Vec<HelpEntry>,
}

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn run(&self, msg: &ChatMessage, ctx: &CommandContext) -> Result<(), DynError> {
        let lines: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| !e.owner_only || msg.is_streamer())
            .map(|e| e.text.as_str())
            .collect();

        let reply = if lines.is_empty() {
            "No available commands".to_string()
        } else {
            // leading zero-width non-joiner keeps the bot from triggering itself
            format!("\u{200c}{}", lines.join(" "))
        };
        ctx.sender.send_message(&reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiUser;

    struct RecordingSender {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_message(&self, text: &str) -> Result<(), DynError> {
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct StaticLookup {
        users: Vec<ApiUser>,
    }

    impl StaticLookup {
        fn empty() -> Arc<Self> {
            Arc::new(Self { users: Vec::new() })
        }
    }

    #[async_trait]
    impl UserLookup for StaticLookup {
        async fn lookup_user(&self, name: &str) -> Result<Option<ApiUser>, DynError> {
            Ok(self
                .users
                .iter()
                .find(|u| u.username == name || u.nickname == name)
                .cloned())
        }
    }

    fn context(sender: Arc<RecordingSender>) -> (CommandContext, tempfile::TempDir) {
        context_with_lookup(sender, StaticLookup::empty())
    }

    fn context_with_lookup(
        sender: Arc<RecordingSender>,
        users: Arc<StaticLookup>,
    ) -> (CommandContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data")).unwrap();
        let ctx = CommandContext {
            store: Arc::new(Mutex::new(store)),
            sender,
            users,
        };
        (ctx, dir)
    }

    fn viewer_message(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.to_string(),
            sender: UserData::new("viewer", 42),
            roles: vec![],
        }
    }

    fn streamer_message(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.to_string(),
            sender: UserData::new("boss", 1),
            roles: vec!["streamer".to_string()],
        }
    }

    #[tokio::test]
    async fn help_hides_owner_only_commands_from_viewers() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&viewer_message("!help"), &ctx).await;

        let messages = sender.take();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with('\u{200c}'));
        assert!(messages[0].contains("!points"));
        assert!(messages[0].contains("!help"));
        assert!(!messages[0].contains("!addmp"));
    }

    #[tokio::test]
    async fn help_shows_everything_to_the_streamer() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&streamer_message("!help"), &ctx).await;

        let messages = sender.take();
        assert!(messages[0].contains("!addmp"));
        assert!(messages[0].contains("!addep"));
    }

    #[tokio::test]
    async fn points_reports_sender_balances() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        let mut msg = viewer_message("!points");
        msg.sender.mana = 12;
        msg.sender.elixir = 7;
        table.dispatch(&msg, &ctx).await;

        assert_eq!(sender.take(), vec!["viewer: 12 mp, 7 ep".to_string()]);
    }

    #[tokio::test]
    async fn points_alias_works() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&viewer_message("!p"), &ctx).await;
        assert_eq!(sender.take().len(), 1);
    }

    #[tokio::test]
    async fn streamer_can_query_unknown_user() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&streamer_message("!points @ghost"), &ctx).await;
        assert_eq!(sender.take(), vec!["ghost: 0 mp, 0 ep".to_string()]);
    }

    #[tokio::test]
    async fn addmp_credits_and_announces() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table
            .dispatch(&streamer_message("!addmp @viewer 25"), &ctx)
            .await;

        assert_eq!(sender.take(), vec!["Add 25 mp to viewer".to_string()]);
        let store = ctx.store.lock().unwrap();
        assert_eq!(store.user_named("viewer").unwrap().mana, 25);
    }

    #[tokio::test]
    async fn addmp_target_unknown_locally_resolves_through_platform_lookup() {
        let sender = RecordingSender::new();
        let lookup = Arc::new(StaticLookup {
            users: vec![ApiUser {
                user_id: "4242".to_string(),
                username: "newbie".to_string(),
                nickname: "Newbie".to_string(),
            }],
        });
        let (ctx, _dir) = context_with_lookup(sender.clone(), lookup);
        let table = CommandTable::builtin();

        table
            .dispatch(&streamer_message("!addmp @newbie 10"), &ctx)
            .await;

        assert_eq!(sender.take(), vec!["Add 10 mp to newbie".to_string()]);
        let store = ctx.store.lock().unwrap();
        let user = store.user_named("newbie").unwrap();
        assert_eq!(user.trovo_id, 4242);
        assert_eq!(user.mana, 10);
    }

    #[tokio::test]
    async fn addmp_is_rejected_for_viewers() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&viewer_message("!addmp @other 25"), &ctx).await;

        assert!(sender.take().is_empty());
        assert!(ctx.store.lock().unwrap().user_named("other").is_none());
    }

    #[tokio::test]
    async fn non_command_text_is_ignored() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let table = CommandTable::builtin();

        table.dispatch(&viewer_message("hello points!"), &ctx).await;
        table.dispatch(&viewer_message(""), &ctx).await;
        assert!(sender.take().is_empty());
    }

    struct FailingCommand;

    #[async_trait]
    impl CommandHandler for FailingCommand {
        async fn run(&self, _msg: &ChatMessage, _ctx: &CommandContext) -> Result<(), DynError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        let sender = RecordingSender::new();
        let (ctx, _dir) = context(sender.clone());
        let mut table = CommandTable::builtin();
        table.register(CommandSpec::new("boom", &[], false, Box::new(FailingCommand)));

        table.dispatch(&viewer_message("!boom"), &ctx).await;
        // table still usable afterwards
        table.dispatch(&viewer_message("!points"), &ctx).await;
        assert_eq!(sender.take().len(), 1);
    }
}
