//! Dataset preparation.
//!
//! Converts a raw chat dataset into the normalized conversation JSONL that
//! training consumes, optionally keeping a seeded random subset.
//!
//! Accepted record shapes:
//!
//! ```text
//! ShareGPT:  {"id": .., "conversations": [{"from": "human", "value": ..}, ..]}
//! Messages:  {"id": .., "messages":      [{"role": "user",   "content": ..}, ..]}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::sample::Reservoir;
use super::{Conversation, Message, Role};
use crate::config::PrepareConfig;
use crate::error::{Error, Result};

const SHAREGPT_REPO: &str = "Aeala/ShareGPT_Vicuna_unfiltered";
const SHAREGPT_FILE: &str = "ShareGPT_V4.3_unfiltered_cleaned_split.json";

/// Where raw records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// ShareGPT dump on the HuggingFace Hub.
    ShareGpt,
    /// Local JSON array or JSONL file.
    Local(PathBuf),
}

impl DatasetSource {
    /// Resolves a dataset identifier.
    ///
    /// Existing paths win over built-in names so a local file called
    /// `sharegpt` is still read from disk.
    pub fn parse(identifier: &str) -> Result<Self> {
        let path = Path::new(identifier);
        if path.is_file() {
            return Ok(DatasetSource::Local(path.to_path_buf()));
        }
        match identifier {
            "sharegpt" => Ok(DatasetSource::ShareGpt),
            other => Err(Error::Config(format!(
                "unknown dataset '{other}': expected 'sharegpt' or an existing file"
            ))),
        }
    }

    /// Base name of the prepared output file.
    pub fn output_name(&self) -> String {
        match self {
            DatasetSource::ShareGpt => "sharegpt".to_string(),
            DatasetSource::Local(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dataset".to_string()),
        }
    }

    /// Returns a local path holding the raw records, downloading if needed.
    fn fetch(&self) -> Result<PathBuf> {
        match self {
            DatasetSource::Local(path) => Ok(path.clone()),
            DatasetSource::ShareGpt => {
                info!(repo = SHAREGPT_REPO, file = SHAREGPT_FILE, "downloading dataset");
                let api = Api::new().map_err(|e| Error::Hub(format!("failed to create HF API: {e}")))?;
                let repo = api.repo(Repo::new(SHAREGPT_REPO.to_string(), RepoType::Dataset));
                repo.get(SHAREGPT_FILE)
                    .map_err(|e| Error::Hub(format!("failed to download {SHAREGPT_FILE}: {e}")))
            }
        }
    }
}

/// Counters reported by [`prepare_dataset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareStats {
    /// Raw records read.
    pub total: usize,
    /// Records that normalized into a usable conversation.
    pub converted: usize,
    /// Conversations written.
    pub written: usize,
    /// Output file.
    pub output: PathBuf,
}

fn map_role(raw: &str) -> Option<Role> {
    match raw {
        "human" | "user" => Some(Role::User),
        "gpt" | "assistant" | "chatgpt" | "bing" | "bard" | "model" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// Normalizes one raw record. `None` means the record is skipped.
pub fn normalize_record(index: usize, record: &Value) -> Option<Conversation> {
    let (turns, role_key, content_key) = if let Some(turns) = record.get("conversations") {
        (turns.as_array()?, "from", "value")
    } else if let Some(turns) = record.get("messages") {
        (turns.as_array()?, "role", "content")
    } else {
        return None;
    };

    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        // Some dumps use the other key set inside either container.
        let role = turn
            .get(role_key)
            .or_else(|| turn.get("role"))
            .or_else(|| turn.get("from"))?
            .as_str()?;
        let content = turn
            .get(content_key)
            .or_else(|| turn.get("content"))
            .or_else(|| turn.get("value"))?
            .as_str()?;
        messages.push(Message::new(map_role(role)?, content));
    }

    // Keep one leading system turn, then start at the first user turn.
    let mut normalized = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    if let Some(first) = iter.peek()
        && first.role == Role::System
        && let Some(system) = iter.next()
    {
        normalized.push(system);
    }
    normalized.extend(iter.skip_while(|m| m.role != Role::User));

    if !normalized.iter().any(|m| m.role == Role::Assistant) {
        return None;
    }

    let id = match record.get("id").or_else(|| record.get("prompt_id")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => index.to_string(),
    };
    Some(Conversation {
        id,
        conversations: normalized,
    })
}

/// Streams raw records from a JSON array or JSONL file.
fn read_records(path: &Path, mut f: impl FnMut(usize, Value)) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);

    // Lines fully consumed while skipping leading whitespace.
    let mut skipped_lines = 0;
    let first = loop {
        let buf = reader.fill_buf()?;
        let end = buf.iter().position(|b| !b.is_ascii_whitespace());
        let consumed = end.unwrap_or(buf.len());
        skipped_lines += buf[..consumed].iter().filter(|&&b| b == b'\n').count();
        match end {
            Some(i) => {
                let b = buf[i];
                reader.consume(i);
                break Some(b);
            }
            None if buf.is_empty() => break None,
            None => reader.consume(consumed),
        }
    };

    match first {
        None => Ok(0),
        Some(b'[') => {
            let mut content = String::new();
            reader.read_to_string(&mut content)?;
            let records: Vec<Value> = serde_json::from_str(&content)?;
            let count = records.len();
            for (index, record) in records.into_iter().enumerate() {
                f(index, record);
            }
            Ok(count)
        }
        Some(_) => {
            let mut count = 0;
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Value =
                    serde_json::from_str(&line).map_err(|e| Error::Dataset {
                        line: skipped_lines + line_no + 1,
                        message: e.to_string(),
                    })?;
                f(count, record);
                count += 1;
            }
            Ok(count)
        }
    }
}

/// Prepares `<output_path>/<name>.jsonl` from the configured dataset.
pub fn prepare_dataset(config: &PrepareConfig) -> Result<PrepareStats> {
    let source = DatasetSource::parse(&config.dataset)?;
    let raw_path = source.fetch()?;
    info!(source = ?source, path = %raw_path.display(), "reading raw dataset");

    let mut converted = Vec::new();
    let mut reservoir = config
        .sample_size
        .map(|size| Reservoir::new(size, config.seed));
    let mut skipped = 0usize;

    let total = read_records(&raw_path, |index, record| {
        match normalize_record(index, &record) {
            Some(conv) => match reservoir.as_mut() {
                Some(r) => r.offer(index, conv),
                None => converted.push(conv),
            },
            None => {
                skipped += 1;
                debug!(index, "skipping record without a usable conversation");
            }
        }
    })?;

    let converted_count = total - skipped;
    let conversations = match reservoir {
        Some(r) => r.into_sorted(),
        None => converted,
    };
    if skipped > 0 {
        warn!(skipped, "records skipped during normalization");
    }

    std::fs::create_dir_all(&config.output_path)?;
    let output = config
        .output_path
        .join(format!("{}.jsonl", source.output_name()));
    let mut out = BufWriter::new(File::create(&output)?);
    for conv in &conversations {
        serde_json::to_writer(&mut out, conv)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    let stats = PrepareStats {
        total,
        converted: converted_count,
        written: conversations.len(),
        output,
    };
    info!(
        total = stats.total,
        converted = stats.converted,
        written = stats.written,
        output = %stats.output.display(),
        "dataset prepared"
    );
    Ok(stats)
}

/// Reads a prepared conversation JSONL file.
pub fn read_conversations(path: &Path) -> Result<Vec<Conversation>> {
    let reader = BufReader::new(File::open(path)?);
    let mut conversations = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let conv = serde_json::from_str(&line).map_err(|e| Error::Dataset {
            line: line_no + 1,
            message: e.to_string(),
        })?;
        conversations.push(conv);
    }
    Ok(conversations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_sharegpt() {
        let record = json!({
            "id": "abc",
            "conversations": [
                {"from": "human", "value": "hi"},
                {"from": "gpt", "value": "hello"}
            ]
        });
        let conv = normalize_record(0, &record).unwrap();
        assert_eq!(conv.id, "abc");
        assert_eq!(
            conv.conversations,
            vec![
                Message::new(Role::User, "hi"),
                Message::new(Role::Assistant, "hello")
            ]
        );
    }

    #[test]
    fn test_normalize_messages_with_numeric_id() {
        let record = json!({
            "prompt_id": 7,
            "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": "u"},
                {"role": "assistant", "content": "a"}
            ]
        });
        let conv = normalize_record(3, &record).unwrap();
        assert_eq!(conv.id, "7");
        assert_eq!(conv.conversations.len(), 3);
        assert_eq!(conv.conversations[0].role, Role::System);
    }

    #[test]
    fn test_leading_assistant_turns_dropped() {
        let record = json!({
            "conversations": [
                {"from": "gpt", "value": "orphan"},
                {"from": "human", "value": "q"},
                {"from": "gpt", "value": "a"}
            ]
        });
        let conv = normalize_record(5, &record).unwrap();
        assert_eq!(conv.id, "5");
        assert_eq!(conv.conversations[0], Message::new(Role::User, "q"));
        assert_eq!(conv.conversations.len(), 2);
    }

    #[test]
    fn test_records_without_assistant_are_skipped() {
        let record = json!({"conversations": [{"from": "human", "value": "q"}]});
        assert!(normalize_record(0, &record).is_none());
    }

    #[test]
    fn test_unknown_role_skips_record() {
        let record = json!({
            "conversations": [
                {"from": "human", "value": "q"},
                {"from": "narrator", "value": "?"},
                {"from": "gpt", "value": "a"}
            ]
        });
        assert!(normalize_record(0, &record).is_none());
    }

    fn read_all(content: &str) -> Result<Vec<Value>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.jsonl");
        std::fs::write(&path, content).unwrap();
        let mut records = Vec::new();
        read_records(&path, |_, r| records.push(r))?;
        Ok(records)
    }

    #[test]
    fn test_error_line_counts_leading_blank_lines() {
        let err = read_all("\n\n{broken\n").unwrap_err();
        assert!(matches!(err, Error::Dataset { line: 3, .. }), "got {err:?}");

        let err = read_all("  \n{\"a\": 1}\n\n{broken\n").unwrap_err();
        assert!(matches!(err, Error::Dataset { line: 4, .. }), "got {err:?}");
    }

    #[test]
    fn test_read_records_json_array_and_jsonl() {
        assert_eq!(read_all("\n [{\"a\": 1}, {\"a\": 2}]").unwrap().len(), 2);
        assert_eq!(read_all("{\"a\": 1}\n\n{\"a\": 2}\n").unwrap().len(), 2);
        assert!(read_all("  \n\n").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_dataset_identifier() {
        assert!(matches!(
            DatasetSource::parse("definitely-not-a-dataset"),
            Err(Error::Config(_))
        ));
        assert_eq!(DatasetSource::parse("sharegpt").unwrap(), DatasetSource::ShareGpt);
    }
}
