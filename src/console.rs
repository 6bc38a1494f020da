use anyhow::{Context, Result, bail};
use crossterm::style::Stylize;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tracing::warn;

use crate::{
    bot::{Command, InboundEvent, Notice, Sender},
    types::ParticipantKey,
};

/// One line of stdin, e.g.
/// `{"type":"message","sender":"U1","channel":"raids","text":"https://x.com/a/status/1"}`
/// or `{"type":"command","sender":"U1","admin":true,"name":"open"}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Message {
        #[serde(flatten)]
        who: WireSender,
        channel: String,
        text: String,
    },
    Command {
        #[serde(flatten)]
        who: WireSender,
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct WireSender {
    sender: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    admin: bool,
}

impl From<WireSender> for Sender {
    fn from(w: WireSender) -> Self {
        Self {
            key: ParticipantKey::new(w.sender),
            roles: w.roles,
            platform_admin: w.admin,
        }
    }
}

/// Forward input lines until EOF or a read failure. Bytes that are not UTF-8
/// are replaced rather than ending the stream, so one bad line is just a bad line.
pub async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "input read failed");
                return;
            }
        }
    }
}

/// `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let wire: WireEvent = serde_json::from_str(line).context("malformed event line")?;
    Ok(Some(match wire {
        WireEvent::Message { who, channel, text } => InboundEvent::Message {
            sender: who.into(),
            channel_id: channel,
            text,
        },
        WireEvent::Command { who, name, args } => InboundEvent::Command {
            sender: who.into(),
            command: parse_command(&name, &args)?,
        },
    }))
}

pub fn parse_command(name: &str, args: &[String]) -> Result<Command> {
    let arg = |i: usize| nth_arg(name, args, i);
    Ok(match name.trim().to_ascii_lowercase().as_str() {
        "open" | "forceraid" => Command::Open,
        "close" | "forceclose" => Command::Close,
        "report" => Command::ReportNow,
        "register" => match args {
            [handle] => Command::Register {
                target: None,
                handle: handle.clone(),
            },
            [target, handle] => Command::Register {
                target: Some(ParticipantKey::new(target.trim_start_matches("<@").trim_end_matches('>'))),
                handle: handle.clone(),
            },
            _ => bail!("usage: register [member] @handle"),
        },
        "confirm" => Command::Confirm,
        "cancel" => Command::Cancel,
        "set-channel" | "setchannel" => Command::SetChannel(arg(0)?.to_string()),
        "set-role" | "setrole" => Command::SetRole(arg(0)?.to_string()),
        "set-schedule" | "setschedule" => {
            let mut hours = [0u8; 3];
            for (i, slot) in hours.iter_mut().enumerate() {
                *slot = arg(i)?
                    .parse()
                    .with_context(|| format!("hour {} is not a number", i + 1))?;
            }
            Command::SetSchedule(hours)
        }
        "diagnose" => Command::Diagnose(arg(0)?.to_string()),
        "config" => Command::Config,
        "version" => Command::Version,
        other => bail!("unknown command `{other}`"),
    })
}

fn nth_arg<'a>(name: &str, args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .with_context(|| format!("`{name}` needs argument {}", i + 1))
}

/// Terminal rendering of a notice.
pub fn format_notice(notice: &Notice) -> Vec<String> {
    match notice {
        Notice::Channel(text) => text
            .lines()
            .map(|line| format!("# {line}").cyan().to_string())
            .collect(),
        Notice::Reply(text) => text.lines().map(|line| format!("> {line}")).collect(),
        Notice::Ephemeral { text, ttl } => vec![
            format!("! {text} ({}s)", ttl.as_secs())
                .dark_yellow()
                .to_string(),
        ],
        Notice::Ack(post_id) => vec![format!("✅ {post_id}").green().to_string()],
    }
}

pub fn format_expired(notice: &Notice) -> Option<String> {
    match notice {
        Notice::Ephemeral { text, .. } => Some(format!("~ deleted: {text}").grey().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_lines() {
        let event = parse_line(
            r#"{"type":"message","sender":"U1","roles":["mods"],"channel":"raids","text":"hi"}"#,
        )
        .expect("parse")
        .expect("event");
        assert_eq!(
            event,
            InboundEvent::Message {
                sender: Sender {
                    key: ParticipantKey::new("U1"),
                    roles: vec!["mods".to_string()],
                    platform_admin: false,
                },
                channel_id: "raids".to_string(),
                text: "hi".to_string(),
            }
        );
    }

    #[test]
    fn parses_command_lines() {
        let event = parse_line(
            r#"{"type":"command","sender":"U1","admin":true,"name":"set-schedule","args":["6","12","18"]}"#,
        )
        .expect("parse")
        .expect("event");
        let InboundEvent::Command { sender, command } = event else {
            panic!("expected a command");
        };
        assert!(sender.platform_admin);
        assert_eq!(command, Command::SetSchedule([6, 12, 18]));
    }

    #[test]
    fn blank_and_bad_lines() {
        assert!(parse_line("   ").expect("blank").is_none());
        assert!(parse_line("{not json").is_err());
        assert!(parse_line(r#"{"type":"command","sender":"U","name":"explode"}"#).is_err());
    }

    #[test]
    fn register_accepts_optional_target() {
        let own = parse_command("register", &["@foo".to_string()]).expect("own");
        assert_eq!(
            own,
            Command::Register {
                target: None,
                handle: "@foo".to_string()
            }
        );
        let other =
            parse_command("register", &["<@U9>".to_string(), "bar".to_string()]).expect("other");
        assert_eq!(
            other,
            Command::Register {
                target: Some(ParticipantKey::new("U9")),
                handle: "bar".to_string()
            }
        );
        assert!(parse_command("register", &[]).is_err());
    }

    #[test]
    fn schedule_needs_three_numeric_hours() {
        assert!(parse_command("set-schedule", &["1".to_string(), "2".to_string()]).is_err());
        assert!(
            parse_command(
                "set-schedule",
                &["1".to_string(), "x".to_string(), "3".to_string()]
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_end_input() {
        let input: &[u8] = b"\xff\xfe\n{\"type\":\"command\",\"sender\":\"U\",\"name\":\"version\"}\n";
        let (tx, mut rx) = mpsc::channel(4);
        pump_lines(input, tx).await;

        let garbled = rx.recv().await.expect("first line");
        assert!(parse_line(&garbled).is_err());
        let good = rx.recv().await.expect("second line");
        assert!(matches!(
            parse_line(&good).expect("parse"),
            Some(InboundEvent::Command { command: Command::Version, .. })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn only_ephemeral_notices_expire() {
        assert!(format_expired(&Notice::Reply("x".into())).is_none());
        let eph = Notice::Ephemeral {
            text: "gone".into(),
            ttl: std::time::Duration::from_secs(5),
        };
        assert!(format_expired(&eph).is_some_and(|l| l.contains("gone")));
        assert_eq!(format_notice(&Notice::Reply("a\nb".into())).len(), 2);
    }
}
