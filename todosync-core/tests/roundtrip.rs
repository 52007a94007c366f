//! Markdown roundtrip tests for `todosync-core`.
//!
//! `parse(serialize(tasks)) == tasks` for task sets within the format's
//! constraints. Each `#[case]` is isolated; no shared state.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rstest::rstest;
use todosync_core::markdown::{parse_tasks, serialize_tasks};
use todosync_core::types::{Priority, Subtask, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap()
}

fn empty_list() -> Vec<Task> {
    vec![]
}

fn single_plain() -> Vec<Task> {
    vec![Task::new("T-1", "Buy milk", base_time())]
}

fn fully_populated() -> Vec<Task> {
    let now = base_time();
    let mut task = Task::new("T-2", "Write report", now - Duration::days(2));
    task.status = TaskStatus::InProgress;
    task.priority = Priority::High;
    task.board_id = Some("work".into());
    task.column_id = Some("doing".into());
    task.due_date = NaiveDate::from_ymd_opt(2026, 11, 1);
    task.labels = vec!["q4".into(), "writing".into()];
    task.subtasks = vec![
        Subtask {
            title: "Collect numbers".into(),
            done: true,
        },
        Subtask {
            title: "Draft summary".into(),
            done: false,
        },
    ];
    task.updated_at = now + Duration::milliseconds(250);
    vec![task]
}

fn every_status() -> Vec<Task> {
    [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Archived,
    ]
    .into_iter()
    .enumerate()
    .map(|(i, status)| {
        let mut task = Task::new(format!("S-{i}"), format!("Status {status}"), base_time());
        task.status = status;
        task.priority = match i % 4 {
            0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            _ => Priority::Urgent,
        };
        task
    })
    .collect()
}

fn unicode_titles() -> Vec<Task> {
    let mut a = Task::new("u-1", "Купить молоко — 牛乳を買う", base_time());
    a.labels = vec!["日本".into()];
    let b = Task::new("u-2", "Title with `ticks` and # inside", base_time());
    vec![a, b]
}

fn many_tasks() -> Vec<Task> {
    (0..250)
        .map(|i| {
            let mut task = Task::new(
                format!("bulk-{i:04}"),
                format!("Bulk task number {i}"),
                base_time() + Duration::seconds(i),
            );
            if i % 3 == 0 {
                task.status = TaskStatus::Done;
            }
            task
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Roundtrip cases
// ---------------------------------------------------------------------------

#[rstest]
#[case::empty(empty_list())]
#[case::single_plain(single_plain())]
#[case::fully_populated(fully_populated())]
#[case::every_status(every_status())]
#[case::unicode(unicode_titles())]
#[case::many(many_tasks())]
fn serialize_then_parse_roundtrips(#[case] tasks: Vec<Task>) {
    let text = serialize_tasks(&tasks);
    let parsed = parse_tasks(&text, base_time() + Duration::days(365)).expect("parse");
    assert_eq!(parsed, tasks);
}

#[rstest]
#[case::single_plain(single_plain())]
#[case::fully_populated(fully_populated())]
fn serialization_is_stable(#[case] tasks: Vec<Task>) {
    let first = serialize_tasks(&tasks);
    let reparsed = parse_tasks(&first, base_time()).expect("parse");
    let second = serialize_tasks(&reparsed);
    assert_eq!(first, second);
}

#[test]
fn insignificant_whitespace_is_ignored() {
    let canonical = serialize_tasks(&single_plain());
    let noisy = canonical.replace("\n", "   \n").replace("# Tasks", "# Tasks\n\n\n");
    let parsed = parse_tasks(&noisy, base_time()).expect("parse");
    assert_eq!(parsed, single_plain());
}
