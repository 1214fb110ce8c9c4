//! Concrete chat commands, spec.md §4.7.

use super::{Command, CommandContext};
use crate::errors::CommandError;
use crate::model::{Granularity, MessageFilter};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn all_commands() -> Vec<Arc<dyn Command>> {
    vec![
        Arc::new(WxCommand),
        Arc::new(MheardCommand),
        Arc::new(StatsCommand),
        Arc::new(SearchCommand),
        Arc::new(PosCommand),
        Arc::new(DiceCommand),
        Arc::new(TimeCommand),
        Arc::new(TopicCommand::default()),
        Arc::new(KbCommand::default()),
        Arc::new(HelpCommand),
    ]
}

struct WxCommand;

#[async_trait]
impl Command for WxCommand {
    fn name(&self) -> &'static str {
        "!wx"
    }
    fn aliases(&self) -> &'static [&'static str] {
        &["!weather"]
    }
    fn help(&self) -> &'static str {
        "!wx [place] - current conditions, defaulting to the station's cached location"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let location = if ctx.args.is_empty() {
            match ctx.router.gps().await {
                Some((lat, lon)) => format!("{lat:.4},{lon:.4}"),
                None => return Ok("no station location cached yet; usage: !wx <place>".to_string()),
            }
        } else {
            ctx.args.to_string()
        };
        let url = format!("https://wttr.in/{}?format=3", urlencode(&location));
        match reqwest::get(&url).await {
            Ok(resp) => match resp.text().await {
                Ok(body) => Ok(body.trim().to_string()),
                Err(e) => Ok(format!("weather lookup failed: {e}")),
            },
            Err(e) => Ok(format!("weather lookup failed: {e}")),
        }
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

struct MheardCommand;

#[async_trait]
impl Command for MheardCommand {
    fn name(&self) -> &'static str {
        "!mheard"
    }
    fn aliases(&self) -> &'static [&'static str] {
        &["!mh"]
    }
    fn help(&self) -> &'static str {
        "!mheard - stations heard recently with signal stats"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let payload = ctx
            .storage
            .initial_payload(crate::storage::InitialPayloadLimits { msg: 0, pos: 20, ack: 0 })
            .await
            .map_err(|e| CommandError::Unknown(e.to_string()))?;
        if payload.pos.is_empty() {
            return Ok("no stations heard yet".to_string());
        }
        let mut lines = vec!["recently heard:".to_string()];
        for row in payload.pos.iter().take(10) {
            let rssi = row.rssi.map(|v| format!("{v:.0}dBm")).unwrap_or_else(|| "?".to_string());
            lines.push(format!("{} ({})", row.src, rssi));
        }
        Ok(lines.join("\n"))
    }
}

struct StatsCommand;

#[async_trait]
impl Command for StatsCommand {
    fn name(&self) -> &'static str {
        "!stats"
    }
    fn help(&self) -> &'static str {
        "!stats - message-volume counters over recent history"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let payload = ctx
            .storage
            .initial_payload(crate::storage::InitialPayloadLimits { msg: 10_000, pos: 10_000, ack: 10_000 })
            .await
            .map_err(|e| CommandError::Unknown(e.to_string()))?;
        Ok(format!(
            "msg={} pos={} ack={}",
            payload.msg.len(),
            payload.pos.len(),
            payload.ack.len()
        ))
    }
}

struct SearchCommand;

#[async_trait]
impl Command for SearchCommand {
    fn name(&self) -> &'static str {
        "!search"
    }
    fn help(&self) -> &'static str {
        "!search <text> - find recent messages containing text"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        if ctx.args.is_empty() {
            return Ok("usage: !search <text>".to_string());
        }
        let filter = MessageFilter { msg_type: Some(crate::model::MessageType::Msg), dst: None, src: None };
        let rows = ctx
            .storage
            .query(filter, None, 200)
            .await
            .map_err(|e| CommandError::Unknown(e.to_string()))?;
        let needle = ctx.args.to_lowercase();
        let matches: Vec<_> = rows.into_iter().filter(|m| m.msg.to_lowercase().contains(&needle)).take(5).collect();
        if matches.is_empty() {
            return Ok(format!("no matches for '{}'", ctx.args));
        }
        Ok(matches.into_iter().map(|m| format!("{}: {}", m.src, m.msg)).collect::<Vec<_>>().join("\n"))
    }
}

struct PosCommand;

#[async_trait]
impl Command for PosCommand {
    fn name(&self) -> &'static str {
        "!pos"
    }
    fn help(&self) -> &'static str {
        "!pos <callsign> - last known position for a station"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let target = if ctx.args.is_empty() { ctx.sender_callsign } else { ctx.args };
        match ctx.storage.station_position(target.to_string()).await.map_err(|e| CommandError::Unknown(e.to_string()))? {
            Some(pos) => match (pos.lat, pos.lon) {
                (Some(lat), Some(lon)) => Ok(format!("{target}: {lat:.5}, {lon:.5}")),
                _ => Ok(format!("{target}: no position on file")),
            },
            None => Ok(format!("{target}: unknown station")),
        }
    }
}

struct DiceCommand;

#[async_trait]
impl Command for DiceCommand {
    fn name(&self) -> &'static str {
        "!dice"
    }
    fn help(&self) -> &'static str {
        "!dice [sides] - roll a die, default 6 sides"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let sides: u32 = ctx.args.trim().parse().unwrap_or(6).clamp(2, 1000);
        let roll = rand::thread_rng().gen_range(1..=sides);
        Ok(format!("rolled {roll} (d{sides})"))
    }
}

struct TimeCommand;

#[async_trait]
impl Command for TimeCommand {
    fn name(&self) -> &'static str {
        "!time"
    }
    fn help(&self) -> &'static str {
        "!time - current UTC time"
    }
    async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        Ok(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string())
    }
}

/// Group beacon management, spec.md §4.7 (admin only). Each group id keeps
/// one beacon text that an (external) periodic-beacon task would transmit;
/// this command only edits the table in memory.
#[derive(Default)]
struct TopicCommand {
    beacons: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Command for TopicCommand {
    fn name(&self) -> &'static str {
        "!topic"
    }
    fn admin_only(&self) -> bool {
        true
    }
    fn help(&self) -> &'static str {
        "!topic list|set <group> <text>|clear <group> - manage group beacon text (admin only)"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let mut parts = ctx.args.splitn(2, ' ');
        let sub = parts.next().unwrap_or("").to_lowercase();
        let rest = parts.next().unwrap_or("").trim();
        match sub.as_str() {
            "list" | "" => {
                let beacons = self.beacons.lock().await;
                if beacons.is_empty() {
                    return Ok("no group beacons configured".to_string());
                }
                let mut lines: Vec<_> = beacons.iter().map(|(group, text)| format!("{group}: {text}")).collect();
                lines.sort();
                Ok(lines.join("\n"))
            }
            "set" => match rest.split_once(' ') {
                Some((group, text)) => {
                    self.beacons.lock().await.insert(group.to_string(), text.to_string());
                    Ok(format!("beacon for {group} set"))
                }
                None => Ok("usage: !topic set <group> <text>".to_string()),
            },
            "clear" => {
                if rest.is_empty() {
                    return Ok("usage: !topic clear <group>".to_string());
                }
                self.beacons.lock().await.remove(rest);
                Ok(format!("beacon for {rest} cleared"))
            }
            _ => Ok("usage: !topic list|set <group> <text>|clear <group>".to_string()),
        }
    }
}

/// Kick-ban management, spec.md §4.7 (admin only). Bans are an in-memory
/// allow-list exclusion the router/validator could consult before routing a
/// sender's traffic; this command only edits the set.
#[derive(Default)]
struct KbCommand {
    banned: Mutex<HashSet<String>>,
}

#[async_trait]
impl Command for KbCommand {
    fn name(&self) -> &'static str {
        "!kb"
    }
    fn admin_only(&self) -> bool {
        true
    }
    fn help(&self) -> &'static str {
        "!kb list|ban <callsign>|unban <callsign> - manage the kick-ban list (admin only)"
    }
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        let mut parts = ctx.args.splitn(2, ' ');
        let sub = parts.next().unwrap_or("").to_lowercase();
        let target = parts.next().unwrap_or("").trim().to_uppercase();
        match sub.as_str() {
            "list" | "" => {
                let banned = self.banned.lock().await;
                if banned.is_empty() {
                    return Ok("kick-ban list is empty".to_string());
                }
                let mut names: Vec<_> = banned.iter().cloned().collect();
                names.sort();
                Ok(names.join(", "))
            }
            "ban" => {
                if target.is_empty() {
                    return Ok("usage: !kb ban <callsign>".to_string());
                }
                self.banned.lock().await.insert(target.clone());
                Ok(format!("{target} banned"))
            }
            "unban" => {
                if target.is_empty() {
                    return Ok("usage: !kb unban <callsign>".to_string());
                }
                self.banned.lock().await.remove(&target);
                Ok(format!("{target} unbanned"))
            }
            _ => Ok("usage: !kb list|ban <callsign>|unban <callsign>".to_string()),
        }
    }
}

struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn name(&self) -> &'static str {
        "!help"
    }
    fn help(&self) -> &'static str {
        "!help - list available commands"
    }
    async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<String, CommandError> {
        Ok("commands: !wx !mheard !stats !search !pos !dice !time !topic !kb !help".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use crate::storage::{MemoryStorage, StorageHandle};

    fn storage() -> StorageHandle {
        StorageHandle::spawn(Box::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn dice_rolls_within_bounds() {
        let storage = storage();
        let router = Router::new();
        let ctx = CommandContext { sender_callsign: "DL4GLE-10", args: "20", storage: &storage, router: &router };
        let result = DiceCommand.execute(&ctx).await.unwrap();
        assert!(result.starts_with("rolled"));
    }

    #[tokio::test]
    async fn topic_is_admin_only_and_round_trips_set_then_list() {
        let storage = storage();
        let router = Router::new();
        let topic = TopicCommand::default();
        assert!(topic.admin_only());
        let set_ctx = CommandContext { sender_callsign: "DL4GLE-10", args: "set 20 net tonight at 8pm", storage: &storage, router: &router };
        topic.execute(&set_ctx).await.unwrap();
        let list_ctx = CommandContext { sender_callsign: "DL4GLE-10", args: "list", storage: &storage, router: &router };
        let result = topic.execute(&list_ctx).await.unwrap();
        assert_eq!(result, "20: net tonight at 8pm");
    }

    #[tokio::test]
    async fn kb_is_admin_only_and_round_trips_ban_then_list() {
        let storage = storage();
        let router = Router::new();
        let kb = KbCommand::default();
        assert!(kb.admin_only());
        let ban_ctx = CommandContext { sender_callsign: "DL4GLE-10", args: "ban dl5xyz-3", storage: &storage, router: &router };
        let result = kb.execute(&ban_ctx).await.unwrap();
        assert_eq!(result, "DL5XYZ-3 banned");
        let list_ctx = CommandContext { sender_callsign: "DL4GLE-10", args: "list", storage: &storage, router: &router };
        assert_eq!(kb.execute(&list_ctx).await.unwrap(), "DL5XYZ-3");
    }

    #[tokio::test]
    async fn stats_is_public() {
        assert!(!StatsCommand.admin_only());
    }
}
