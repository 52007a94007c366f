//! `todosync diff`: what an app-to-file sync would write.

use anyhow::{Context, Result};
use clap::Args;

use todosync_daemon::DaemonRequest;
use todosync_sync::Preview;

use super::{call, home};

#[derive(Args, Debug)]
pub struct DiffArgs {}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let (data, _) = call(&home, &DaemonRequest::new("diff")).context("diff failed")?;
        let preview: Preview = serde_json::from_value(data).context("unexpected diff response")?;

        match preview.unified_diff {
            None => println!("No differences for '{}'.", preview.path.display()),
            Some(diff) => {
                print!("{diff}");
                if !diff.ends_with('\n') {
                    println!();
                }
            }
        }
        Ok(())
    }
}
