//! Chat-command dispatch, spec.md §4.7 and Design Notes §9.
//!
//! Each command is a small type implementing [`Command`]; the registry
//! replaces what the Design Notes call a "mixin" approach (one big match
//! statement or trait-mixed handler) with a lookup table, which is how the
//! teacher's `control` module separates command *parsing* from command
//! *execution* (`control::command` vs `control::client`).

mod commands;

use crate::errors::CommandError;
use crate::router::Router;
use crate::storage::StorageHandle;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub use commands::all_commands;

/// Minimum gap between two commands from the same sender, spec.md §4.7.
const THROTTLE_WINDOW: Duration = Duration::from_secs(5);
/// Identical command text from the same sender within this window is
/// suppressed as a duplicate (radio retransmits, double key presses).
const DEDUP_WINDOW: Duration = Duration::from_secs(10);

pub struct CommandContext<'a> {
    pub sender_callsign: &'a str,
    pub args: &'a str,
    pub storage: &'a StorageHandle,
    pub router: &'a Router,
}

#[async_trait]
pub trait Command: Send + Sync {
    /// The trigger word including its leading `!`, e.g. `"!wx"`.
    fn name(&self) -> &'static str;
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }
    fn admin_only(&self) -> bool {
        false
    }
    fn help(&self) -> &'static str;
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError>;
}

struct SenderState {
    last_command_at: Instant,
    recent: HashSet<String>,
    recent_order: Vec<(String, Instant)>,
}

pub struct CommandRegistry {
    table: HashMap<&'static str, Arc<dyn Command>>,
    admin_callsigns: Vec<String>,
    throttle: Mutex<HashMap<String, SenderState>>,
}

impl CommandRegistry {
    pub fn new(admin_callsigns: Vec<String>) -> Self {
        let mut table: HashMap<&'static str, Arc<dyn Command>> = HashMap::new();
        for command in all_commands() {
            for trigger in std::iter::once(command.name()).chain(command.aliases().iter().copied()) {
                table.insert(trigger, command.clone());
            }
        }
        Self { table, admin_callsigns, throttle: Mutex::new(HashMap::new()) }
    }

    /// Split `"!mheard 10"` into `("!mheard", "10")`.
    pub fn parse(text: &str) -> Option<(&str, &str)> {
        let text = text.trim();
        if !text.starts_with('!') {
            return None;
        }
        match text.split_once(' ') {
            Some((cmd, args)) => Some((cmd, args.trim())),
            None => Some((text, "")),
        }
    }

    fn is_admin(&self, callsign: &str) -> bool {
        self.admin_callsigns.iter().any(|a| a.eq_ignore_ascii_case(callsign))
    }

    async fn check_rate_limits(&self, sender: &str, trigger: &str, args: &str) -> Result<(), CommandError> {
        let now = Instant::now();
        let mut throttle = self.throttle.lock().await;
        let state = throttle.entry(sender.to_string()).or_insert_with(|| SenderState {
            last_command_at: now - THROTTLE_WINDOW,
            recent: HashSet::new(),
            recent_order: Vec::new(),
        });

        if now.duration_since(state.last_command_at) < THROTTLE_WINDOW {
            return Err(CommandError::Throttled);
        }

        state.recent_order.retain(|(_, t)| now.duration_since(*t) < DEDUP_WINDOW);
        state.recent = state.recent_order.iter().map(|(k, _)| k.clone()).collect();

        let key = format!("{trigger} {args}");
        if state.recent.contains(&key) {
            return Err(CommandError::Duplicate);
        }

        state.last_command_at = now;
        state.recent.insert(key.clone());
        state.recent_order.push((key, now));
        Ok(())
    }

    pub async fn dispatch(&self, sender_callsign: &str, raw_text: &str, storage: &StorageHandle, router: &Router) -> Result<String, CommandError> {
        let (trigger, args) = Self::parse(raw_text).ok_or_else(|| CommandError::Unknown(raw_text.to_string()))?;
        let command = self.table.get(trigger).ok_or_else(|| CommandError::Unknown(trigger.to_string()))?.clone();

        self.check_rate_limits(sender_callsign, trigger, args).await?;

        if command.admin_only() && !self.is_admin(sender_callsign) {
            return Err(CommandError::Unauthorized);
        }

        let ctx = CommandContext { sender_callsign, args, storage, router };
        command.execute(&ctx).await
    }

    pub fn help_text(&self) -> String {
        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        for command in self.table.values() {
            if seen.insert(command.name()) {
                lines.push(format!("{} - {}", command.name(), command.help()));
            }
        }
        lines.sort();
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_trigger_and_args() {
        assert_eq!(CommandRegistry::parse("!mheard 10"), Some(("!mheard", "10")));
        assert_eq!(CommandRegistry::parse("!help"), Some(("!help", "")));
        assert_eq!(CommandRegistry::parse("just chatting"), None);
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let registry = CommandRegistry::new(vec![]);
        let storage = StorageHandle::spawn(Box::new(crate::storage::MemoryStorage::new()));
        let router = Router::new();
        let result = registry.dispatch("DL4GLE-10", "!notarealcommand", &storage, &router).await;
        assert!(matches!(result, Err(CommandError::Unknown(_))));
    }

    #[tokio::test]
    async fn second_command_within_throttle_window_is_rejected() {
        let registry = CommandRegistry::new(vec![]);
        let storage = StorageHandle::spawn(Box::new(crate::storage::MemoryStorage::new()));
        let router = Router::new();
        registry.dispatch("DL4GLE-10", "!time", &storage, &router).await.unwrap();
        let second = registry.dispatch("DL4GLE-10", "!dice", &storage, &router).await;
        assert!(matches!(second, Err(CommandError::Throttled)));
    }

    #[tokio::test]
    async fn admin_only_command_rejects_non_admin() {
        let registry = CommandRegistry::new(vec!["DK5EN-9".to_string()]);
        let storage = StorageHandle::spawn(Box::new(crate::storage::MemoryStorage::new()));
        let router = Router::new();
        let result = registry.dispatch("DL4GLE-10", "!topic list", &storage, &router).await;
        assert!(matches!(result, Err(CommandError::Unauthorized)));
    }
}
