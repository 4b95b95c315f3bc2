//! Snapshot inspection commands.

use crate::cli::args::{SnapshotAction, SnapshotArgs};
use crate::storage::snapshot::{self, SnapshotReport};
use anyhow::Result;
use serde::Serialize;

pub fn run_snapshot(args: SnapshotArgs) -> Result<()> {
    match args.action {
        SnapshotAction::Inspect(inspect_args) => {
            let report = snapshot::inspect(&inspect_args.dir)?;
            if inspect_args.json {
                print_json(&report.to_json())?;
            } else {
                print_snapshot_report(&report);
            }
            Ok(())
        }
    }
}

fn print_snapshot_report(report: &SnapshotReport) {
    println!("Snapshot: {}", report.dir.display());
    println!("Topics: {}", report.topics);
    println!("Pending messages: {}", report.total_messages);
    if report.queues.is_empty() {
        println!("no queues found");
        return;
    }
    println!("{:<40} {:<10}", "queue", "messages");
    for queue in &report.queues {
        println!("{:<40} {:<10}", queue.queue, queue.messages);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
