//! Markdown task list parser and serializer.
//!
//! ## Format
//!
//! ```text
//! # Tasks
//!
//! - [ ] `T-1` Buy milk #home #errand
//!   - priority: high
//!   - due: 2026-10-20
//!   - board: main
//!   - column: todo
//!   - created: 2026-10-19T10:00:00Z
//!   - updated: 2026-10-19T10:00:00Z
//!   - [x] Check fridge
//! ```
//!
//! One task per top-level checklist line. The checkbox character carries the
//! status (see [`TaskStatus::checkbox_char`]), the backticked token the id,
//! and trailing `#word` tokens the labels. A title word that starts with `#`
//! is written as `\#word` so it never reads back as a label. Indented
//! `- key: value` lines are metadata; indented checklist lines are subtasks.
//! Anything else at the top level (headings, prose, blank lines) is ignored
//! by the parser.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::error::{parse_err, CoreError};
use crate::types::{Priority, Subtask, Task, TaskId, TaskStatus};

/// Heading written at the top of every serialized file.
pub const FILE_HEADING: &str = "# Tasks";

/// Prefix of ids assigned to tasks typed into the file without one.
pub const GENERATED_ID_PREFIX: &str = "md-";

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a Markdown task list.
///
/// `now` stamps `created`/`updated` on tasks that carry no timestamps
/// (typically lines a human just typed).
///
/// # Errors
/// [`CoreError::Parse`] with a 1-based line number for malformed checkboxes,
/// unknown metadata keys, bad dates or priorities, and duplicate ids.
pub fn parse_tasks(content: &str, now: DateTime<Utc>) -> Result<Vec<Task>, CoreError> {
    let mut drafts: Vec<Draft> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let indent = count_indent(line);
        let body = &line[indent..];

        if indent == 0 {
            match parse_checkbox(body, line_no)? {
                Some((status, rest)) => drafts.push(Draft::from_task_line(status, rest, line_no)?),
                None => {
                    // Headings and prose are not ours. Closes the current task.
                    if let Some(last) = drafts.last_mut() {
                        last.closed = true;
                    }
                }
            }
            continue;
        }

        let Some(item) = body.strip_prefix("- ").or_else(|| body.strip_prefix("* ")) else {
            // Indented prose under a task is tolerated and dropped.
            continue;
        };
        let Some(current) = drafts.last_mut().filter(|d| !d.closed) else {
            return Err(parse_err(line_no, "indented item without a parent task"));
        };

        if let Some((status, rest)) = parse_checkbox(body, line_no)? {
            let title = rest.trim();
            if title.is_empty() {
                return Err(parse_err(line_no, "subtask has no title"));
            }
            current.task.subtasks.push(Subtask {
                title: title.to_string(),
                done: status == TaskStatus::Done,
            });
            continue;
        }

        let Some((key, value)) = item.split_once(':') else {
            return Err(parse_err(
                line_no,
                format!("expected `key: value` metadata, found '{}'", item.trim()),
            ));
        };
        current.apply_metadata(key.trim(), value.trim(), line_no)?;
    }

    finish(drafts, now)
}

/// A task under construction, before ids and timestamps are settled.
struct Draft {
    task: Task,
    explicit_id: bool,
    has_created: bool,
    has_updated: bool,
    line: usize,
    closed: bool,
}

impl Draft {
    fn from_task_line(status: TaskStatus, rest: &str, line: usize) -> Result<Self, CoreError> {
        let mut rest = rest.trim();
        let mut id = None;

        if let Some(after_tick) = rest.strip_prefix('`') {
            let Some(end) = after_tick.find('`') else {
                return Err(parse_err(line, "unterminated `id` token"));
            };
            let raw_id = after_tick[..end].trim();
            if raw_id.is_empty() {
                return Err(parse_err(line, "empty task id"));
            }
            id = Some(TaskId::from(raw_id));
            rest = after_tick[end + 1..].trim();
        }

        let (title, labels) = split_labels(rest);
        let title = unescape_title(&title);
        if title.is_empty() {
            return Err(parse_err(line, "task has no title"));
        }

        // Placeholder timestamps; replaced in `finish`.
        let mut task = Task::new(
            id.clone().unwrap_or_else(|| TaskId::from("")),
            title,
            DateTime::<Utc>::MIN_UTC,
        );
        task.status = status;
        task.labels = labels;

        Ok(Self {
            task,
            explicit_id: id.is_some(),
            has_created: false,
            has_updated: false,
            line,
            closed: false,
        })
    }

    fn apply_metadata(&mut self, key: &str, value: &str, line: usize) -> Result<(), CoreError> {
        match key.to_ascii_lowercase().as_str() {
            "priority" => {
                self.task.priority = value
                    .parse::<Priority>()
                    .map_err(|message| parse_err(line, message))?;
            }
            "due" => {
                let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
                    parse_err(line, format!("invalid due date '{value}' (expected YYYY-MM-DD): {e}"))
                })?;
                self.task.due_date = Some(date);
            }
            "board" => self.task.board_id = non_empty(value),
            "column" => self.task.column_id = non_empty(value),
            "created" => {
                self.task.created_at = parse_timestamp(value, line)?;
                self.has_created = true;
            }
            "updated" => {
                self.task.updated_at = parse_timestamp(value, line)?;
                self.has_updated = true;
            }
            other => {
                return Err(parse_err(line, format!("unknown metadata key '{other}'")));
            }
        }
        Ok(())
    }
}

fn finish(drafts: Vec<Draft>, now: DateTime<Utc>) -> Result<Vec<Task>, CoreError> {
    let mut seen: HashSet<TaskId> = HashSet::new();
    for draft in drafts.iter().filter(|d| d.explicit_id) {
        if !seen.insert(draft.task.id.clone()) {
            return Err(parse_err(
                draft.line,
                format!("duplicate task id '{}'", draft.task.id),
            ));
        }
    }

    let mut tasks = Vec::with_capacity(drafts.len());
    for mut draft in drafts {
        if !draft.explicit_id {
            draft.task.id = generated_id(&draft.task.title, &seen);
            seen.insert(draft.task.id.clone());
        }
        match (draft.has_created, draft.has_updated) {
            (true, true) => {}
            (true, false) => draft.task.updated_at = draft.task.created_at.max(now),
            (false, true) => draft.task.created_at = draft.task.updated_at,
            (false, false) => {
                draft.task.created_at = now;
                draft.task.updated_at = now;
            }
        }
        tasks.push(draft.task);
    }
    Ok(tasks)
}

/// Deterministic id for a task typed without one: `md-` + 8 hex chars of
/// the title digest, suffixed `-2`, `-3`, … on collision.
fn generated_id(title: &str, taken: &HashSet<TaskId>) -> TaskId {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    let digest = hex::encode(hasher.finalize());
    let base = format!("{GENERATED_ID_PREFIX}{}", &digest[..8]);

    let mut candidate = TaskId::from(base.clone());
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = TaskId::from(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

/// Recognise `- [c] rest`. Returns `Ok(None)` when the line is not a checklist item.
fn parse_checkbox(body: &str, line: usize) -> Result<Option<(TaskStatus, &str)>, CoreError> {
    let Some(after_bullet) = body.strip_prefix("- [").or_else(|| body.strip_prefix("* [")) else {
        return Ok(None);
    };
    let mut chars = after_bullet.char_indices();
    let Some((_, mark)) = chars.next() else {
        return Ok(None);
    };
    let Some((close_idx, ']')) = chars.next() else {
        return Ok(None);
    };
    let rest = &after_bullet[close_idx + 1..];
    if !(rest.is_empty() || rest.starts_with(' ')) {
        return Ok(None);
    }
    let status = TaskStatus::from_checkbox_char(mark)
        .ok_or_else(|| parse_err(line, format!("unknown checkbox state '[{mark}]'")))?;
    Ok(Some((status, rest)))
}

/// Split trailing `#label` tokens off a title.
fn split_labels(text: &str) -> (String, Vec<String>) {
    let mut title = text.trim_end();
    let mut labels = Vec::new();
    while let Some((head, last)) = title.rsplit_once(char::is_whitespace) {
        if !is_label_token(last) {
            break;
        }
        labels.push(last[1..].to_string());
        title = head.trim_end();
    }
    labels.reverse();
    (title.to_string(), labels)
}

fn is_label_token(token: &str) -> bool {
    token.len() > 1 && token.starts_with('#')
}

/// Words of the form `\*#...` gain one backslash on the way out and lose
/// one on the way in.
fn escape_title(title: &str) -> String {
    map_words(title, |word| {
        if word.trim_start_matches('\\').starts_with('#') {
            format!("\\{word}")
        } else {
            word.to_string()
        }
    })
}

fn unescape_title(title: &str) -> String {
    map_words(title, |word| match word.strip_prefix('\\') {
        Some(rest) if rest.trim_start_matches('\\').starts_with('#') => rest.to_string(),
        _ => word.to_string(),
    })
}

/// Rewrite each whitespace-separated word, keeping the whitespace as is.
fn map_words(text: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    let mut word_start = None;
    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                out.push_str(&f(&text[start..idx]));
            }
            out.push(c);
        } else if word_start.is_none() {
            word_start = Some(idx);
        }
    }
    if let Some(start) = word_start {
        out.push_str(&f(&text[start..]));
    }
    out
}

fn parse_timestamp(value: &str, line: usize) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| parse_err(line, format!("invalid timestamp '{value}': {e}")))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn count_indent(line: &str) -> usize {
    line.len() - line.trim_start_matches(|c: char| c == ' ' || c == '\t').len()
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

/// Check that `task` survives a trip through the file.
///
/// [`serialize_tasks`] writes whatever it is given; callers about to
/// overwrite a file use this first so they never produce text that
/// [`parse_tasks`] rejects.
pub fn check_serializable(task: &Task) -> Result<(), String> {
    let id = task.id.as_str();
    if id.trim().is_empty() {
        return Err("task has an empty id".to_string());
    }
    if id.contains('`') || id.trim() != id || has_line_break(id) {
        return Err(format!("task id '{id}' cannot be written to the file"));
    }
    if task.title.trim().is_empty() {
        return Err(format!("task {id} has no title"));
    }
    if has_line_break(&task.title) {
        return Err(format!("title of task {id} spans several lines"));
    }
    if let Some(label) = task
        .labels
        .iter()
        .find(|l| l.is_empty() || l.contains(char::is_whitespace))
    {
        return Err(format!("task {id} has unwritable label '{label}'"));
    }
    for subtask in &task.subtasks {
        if subtask.title.trim().is_empty() || has_line_break(&subtask.title) {
            return Err(format!("task {id} has a subtask without a one-line title"));
        }
    }
    for (key, value) in [("board", &task.board_id), ("column", &task.column_id)] {
        if let Some(value) = value {
            if value.trim() != value || has_line_break(value) {
                return Err(format!("task {id} has unwritable {key} '{value}'"));
            }
        }
    }
    Ok(())
}

fn has_line_break(text: &str) -> bool {
    text.contains(['\n', '\r'])
}

/// Serialize tasks in the given order. Output always ends with a newline.
pub fn serialize_tasks(tasks: &[Task]) -> String {
    let mut out = String::new();
    out.push_str(FILE_HEADING);
    out.push_str("\n\n");
    for task in tasks {
        serialize_task(task, &mut out);
    }
    out
}

fn serialize_task(task: &Task, out: &mut String) {
    out.push_str(&format!(
        "- [{}] `{}` {}",
        task.status.checkbox_char(),
        task.id,
        escape_title(task.title.trim())
    ));
    for label in &task.labels {
        out.push_str(" #");
        out.push_str(label);
    }
    out.push('\n');

    if task.priority != Priority::Medium {
        push_meta(out, "priority", &task.priority.to_string());
    }
    if let Some(due) = task.due_date {
        push_meta(out, "due", &due.format("%Y-%m-%d").to_string());
    }
    if let Some(board) = &task.board_id {
        push_meta(out, "board", board);
    }
    if let Some(column) = &task.column_id {
        push_meta(out, "column", column);
    }
    push_meta(out, "created", &format_timestamp(task.created_at));
    push_meta(out, "updated", &format_timestamp(task.updated_at));

    for subtask in &task.subtasks {
        let mark = if subtask.done { 'x' } else { ' ' };
        out.push_str(&format!("  - [{mark}] {}\n", subtask.title.trim()));
    }
}

fn push_meta(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("  - {key}: {value}\n"));
}

/// RFC 3339 with as many fractional digits as needed to round-trip exactly.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
