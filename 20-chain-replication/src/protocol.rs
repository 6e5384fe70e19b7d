//! Command parsing for the interactive chain shell.
//!
//! Row operations map one-to-one onto [`crate::table::ReplicatedTable`]
//! calls. `DELAY`, `DOWN` and `UP` inject faults into a replica by its
//! position in the chain, which is how the shell demonstrates delay
//! tolerance and repair.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::row::RowKey;

/// Commands accepted at the shell prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Create { key: RowKey, payload: Value },
    Replace {
        key: RowKey,
        expected_version: u64,
        payload: Value,
    },
    Merge {
        key: RowKey,
        expected_version: u64,
        patch: Value,
    },
    Upsert { key: RowKey, payload: Value },
    Delete { key: RowKey, expected_version: u64 },
    Read { key: RowKey },
    Repair { key: RowKey },
    /// Delay every request to the replica at `replica`; zero clears the fault.
    Delay { replica: usize, delay: Duration },
    Down { replica: usize },
    Up { replica: usize },
    Status,
    Help,
    Exit,
}

pub const HELP: &str = "\
commands:
  CREATE  <partition> <row> <json>            (alias: c)
  REPLACE <partition> <row> <version> <json>  (alias: r)
  MERGE   <partition> <row> <version> <json>  (alias: m)
  UPSERT  <partition> <row> <json>            (alias: u)
  DELETE  <partition> <row> <version>         (alias: d)
  READ    <partition> <row>                   (alias: g)
  REPAIR  <partition> <row>
  DELAY   <replica> <ms>      delay a replica by position, 0 clears
  DOWN    <replica> / UP <replica>
  STATUS (s), HELP (h), EXIT (e)";

impl ConsoleCommand {
    /// Parses one line of shell input. Command words are case-insensitive.
    ///
    /// Payloads are the rest of the line. Text that is not valid JSON is
    /// stored as a JSON string.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut words = trimmed.splitn(2, char::is_whitespace);
        let cmd = words
            .next()
            .filter(|word| !word.is_empty())
            .ok_or_else(|| anyhow!("empty command"))?
            .to_uppercase();
        let rest = words.next().unwrap_or("").trim_start();

        let normalized = match cmd.as_str() {
            "C" => "CREATE",
            "R" => "REPLACE",
            "M" => "MERGE",
            "U" => "UPSERT",
            "D" => "DELETE",
            "G" => "READ",
            "S" => "STATUS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match normalized {
            "STATUS" => Ok(ConsoleCommand::Status),
            "HELP" => Ok(ConsoleCommand::Help),
            "EXIT" => Ok(ConsoleCommand::Exit),
            "CREATE" => {
                let (key, payload) = key_and_rest(rest, "CREATE <partition> <row> <json>")?;
                Ok(ConsoleCommand::Create {
                    key,
                    payload: parse_payload(payload)?,
                })
            }
            "UPSERT" => {
                let (key, payload) = key_and_rest(rest, "UPSERT <partition> <row> <json>")?;
                Ok(ConsoleCommand::Upsert {
                    key,
                    payload: parse_payload(payload)?,
                })
            }
            "REPLACE" | "MERGE" => {
                let usage = if normalized == "REPLACE" {
                    "REPLACE <partition> <row> <version> <json>"
                } else {
                    "MERGE <partition> <row> <version> <json>"
                };
                let (key, rest) = key_and_rest(rest, usage)?;
                let (version, payload) = split_word(rest);
                let expected_version = parse_version(version, usage)?;
                let payload = parse_payload(payload)?;
                Ok(if normalized == "REPLACE" {
                    ConsoleCommand::Replace {
                        key,
                        expected_version,
                        payload,
                    }
                } else {
                    ConsoleCommand::Merge {
                        key,
                        expected_version,
                        patch: payload,
                    }
                })
            }
            "DELETE" => {
                let usage = "DELETE <partition> <row> <version>";
                let (key, rest) = key_and_rest(rest, usage)?;
                let (version, extra) = split_word(rest);
                if !extra.is_empty() {
                    bail!("usage: {usage}");
                }
                Ok(ConsoleCommand::Delete {
                    key,
                    expected_version: parse_version(version, usage)?,
                })
            }
            "READ" => Ok(ConsoleCommand::Read {
                key: exact_key(rest, "READ <partition> <row>")?,
            }),
            "REPAIR" => Ok(ConsoleCommand::Repair {
                key: exact_key(rest, "REPAIR <partition> <row>")?,
            }),
            "DELAY" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [replica, ms] = parts.as_slice() else {
                    bail!("usage: DELAY <replica> <ms>");
                };
                Ok(ConsoleCommand::Delay {
                    replica: replica.parse().context("replica must be a position")?,
                    delay: Duration::from_millis(ms.parse().context("delay must be milliseconds")?),
                })
            }
            "DOWN" | "UP" => {
                let replica: usize = rest
                    .trim()
                    .parse()
                    .with_context(|| format!("usage: {normalized} <replica>"))?;
                Ok(if normalized == "DOWN" {
                    ConsoleCommand::Down { replica }
                } else {
                    ConsoleCommand::Up { replica }
                })
            }
            _ => Err(anyhow!("invalid command. Try HELP/h for the command list")),
        }
    }
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (text, ""),
    }
}

fn key_and_rest<'a>(text: &'a str, usage: &str) -> Result<(RowKey, &'a str)> {
    let (partition, rest) = split_word(text);
    let (row, rest) = split_word(rest);
    if partition.is_empty() || row.is_empty() {
        bail!("usage: {usage}");
    }
    Ok((RowKey::new(partition, row), rest))
}

fn exact_key(text: &str, usage: &str) -> Result<RowKey> {
    let (key, rest) = key_and_rest(text, usage)?;
    if !rest.is_empty() {
        bail!("usage: {usage}");
    }
    Ok(key)
}

fn parse_version(word: &str, usage: &str) -> Result<u64> {
    word.parse()
        .with_context(|| format!("version must be a number; usage: {usage}"))
}

fn parse_payload(text: &str) -> Result<Value> {
    if text.is_empty() {
        bail!("missing payload");
    }
    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
