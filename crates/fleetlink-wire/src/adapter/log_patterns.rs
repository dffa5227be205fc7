//! Engine log scanning for the process adapter.
//!
//! The engine has no protocol of its own, so events are synthesized from its
//! console output. Lines look like
//! `[12:34:56] [Server thread/INFO]: Steve joined the game`; the bracketed
//! prefix is stripped before matching.

use fleetlink_types::message::ops;
use regex_lite::Regex;
use serde_json::{json, Value};

/// Causes that start a vanilla death message, after the player name.
const DEATH_CAUSES: &[&str] = &[
    "was slain by",
    "was shot by",
    "was killed",
    "was blown up by",
    "was burnt to a crisp",
    "was pricked to death",
    "was squashed",
    "was struck by lightning",
    "was fireballed by",
    "drowned",
    "died",
    "blew up",
    "burned to death",
    "fell from",
    "fell off",
    "fell out of the world",
    "hit the ground too hard",
    "tried to swim in lava",
    "starved to death",
    "suffocated in a wall",
    "froze to death",
    "withered away",
    "went up in flames",
    "walked into fire",
    "experienced kinetic energy",
];

/// An event recognised in a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub op: &'static str,
    pub data: Value,
}

/// Compiled log patterns.
pub struct LogPatterns {
    prefix: Regex,
    join: Regex,
    leave: Regex,
    chat: Regex,
    death: Regex,
    start: Regex,
    stop: Regex,
}

impl LogPatterns {
    pub fn new() -> Self {
        let causes = DEATH_CAUSES
            .iter()
            .map(|c| c.replace(' ', r"\s"))
            .collect::<Vec<_>>()
            .join("|");
        Self {
            prefix: Regex::new(
                r"^\[\d{2}:\d{2}:\d{2}(?:\.\d+)?\]\s\[[^\]]+\](?:\s\[[^\]]+\])?:\s",
            )
            .expect("prefix regex is valid"),
            join: Regex::new(r"^(\w{1,16}) joined the game$").expect("join regex is valid"),
            leave: Regex::new(r"^(\w{1,16}) left the game$").expect("leave regex is valid"),
            chat: Regex::new(r"^<(\w{1,16})> (.*)$").expect("chat regex is valid"),
            death: Regex::new(&format!(r"^(\w{{1,16}}) ((?:{causes}).*)$"))
                .expect("death regex is valid"),
            start: Regex::new(r"^Done \((\d+(?:\.\d+)?)s\)! For help")
                .expect("start regex is valid"),
            stop: Regex::new(r"^Stopping (?:the )?server$").expect("stop regex is valid"),
        }
    }

    /// Remove the timestamp/thread prefix, if present.
    pub fn strip_prefix<'a>(&self, line: &'a str) -> &'a str {
        match self.prefix.find(line) {
            Some(m) => &line[m.end()..],
            None => line,
        }
    }

    /// Match a prefix-stripped line against the known patterns.
    pub fn scan(&self, body: &str) -> Option<LogEvent> {
        let body = body.trim_end();
        if let Some(c) = self.chat.captures(body) {
            return Some(LogEvent {
                op: ops::PLAYER_CHAT,
                data: json!({ "name": &c[1], "message": &c[2] }),
            });
        }
        if let Some(c) = self.join.captures(body) {
            return Some(LogEvent {
                op: ops::PLAYER_JOIN,
                data: json!({ "name": &c[1] }),
            });
        }
        if let Some(c) = self.leave.captures(body) {
            return Some(LogEvent {
                op: ops::PLAYER_LEAVE,
                data: json!({ "name": &c[1] }),
            });
        }
        if let Some(c) = self.death.captures(body) {
            return Some(LogEvent {
                op: ops::PLAYER_DEATH,
                data: json!({ "name": &c[1], "message": body, "cause": &c[2] }),
            });
        }
        if let Some(c) = self.start.captures(body) {
            let secs: f64 = c[1].parse().unwrap_or(0.0);
            return Some(LogEvent {
                op: ops::SERVER_START,
                data: json!({ "startupSeconds": secs }),
            });
        }
        if self.stop.is_match(body) {
            return Some(LogEvent {
                op: ops::SERVER_STOP,
                data: json!({}),
            });
        }
        None
    }
}

impl Default for LogPatterns {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(line: &str) -> Option<LogEvent> {
        let p = LogPatterns::new();
        p.scan(p.strip_prefix(line))
    }

    #[test]
    fn test_strip_prefix() {
        let p = LogPatterns::new();
        assert_eq!(
            p.strip_prefix("[12:00:00] [Server thread/INFO]: There are 0 of a max of 20 players online"),
            "There are 0 of a max of 20 players online"
        );
        assert_eq!(
            p.strip_prefix("[12:00:00] [Server thread/INFO] [minecraft/DedicatedServer]: Done"),
            "Done"
        );
        assert_eq!(p.strip_prefix("no prefix here"), "no prefix here");
    }

    #[test]
    fn test_join_leave() {
        let ev = scan("[09:15:02] [Server thread/INFO]: Steve joined the game").unwrap();
        assert_eq!(ev.op, ops::PLAYER_JOIN);
        assert_eq!(ev.data["name"], "Steve");

        let ev = scan("[09:20:11] [Server thread/INFO]: Alex_99 left the game").unwrap();
        assert_eq!(ev.op, ops::PLAYER_LEAVE);
        assert_eq!(ev.data["name"], "Alex_99");
    }

    #[test]
    fn test_chat_not_confused_with_join() {
        let ev = scan("[09:16:00] [Server thread/INFO]: <Steve> Steve joined the game").unwrap();
        assert_eq!(ev.op, ops::PLAYER_CHAT);
        assert_eq!(ev.data["message"], "Steve joined the game");
    }

    #[test]
    fn test_death() {
        let ev = scan("[10:00:00] [Server thread/INFO]: Steve was slain by Zombie").unwrap();
        assert_eq!(ev.op, ops::PLAYER_DEATH);
        assert_eq!(ev.data["name"], "Steve");
        assert_eq!(ev.data["cause"], "was slain by Zombie");

        let ev = scan("[10:00:00] [Server thread/INFO]: Alex fell from a high place").unwrap();
        assert_eq!(ev.op, ops::PLAYER_DEATH);
    }

    #[test]
    fn test_server_lifecycle() {
        let ev = scan(r#"[08:00:05] [Server thread/INFO]: Done (4.512s)! For help, type "help""#)
            .unwrap();
        assert_eq!(ev.op, ops::SERVER_START);
        assert_eq!(ev.data["startupSeconds"], 4.512);

        assert_eq!(
            scan("[23:59:59] [Server thread/INFO]: Stopping the server").unwrap().op,
            ops::SERVER_STOP
        );
        assert_eq!(
            scan("[23:59:59] [Server thread/INFO]: Stopping server").unwrap().op,
            ops::SERVER_STOP
        );
    }

    #[test]
    fn test_plain_output_is_not_an_event() {
        assert!(scan("[12:00:00] [Server thread/INFO]: There are 0 of a max of 20 players online").is_none());
        assert!(scan("").is_none());
    }
}
