//! `keeper status` and `keeper stop`, addressed through the possession record.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use keeper_core::{possession::read_record, PossessionRecord};
use keeper_daemon::{paths, request_status, request_stop};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

fn current_record() -> Result<Option<PossessionRecord>> {
    let lock_path = paths::lock_path();
    read_record(&lock_path).with_context(|| format!("failed to read {}", lock_path.display()))
}

pub fn status() -> Result<ExitCode> {
    let payload = match current_record()? {
        None => json!({ "running": false }),
        Some(record) => match request_status(record.port, record.key.as_str(), REQUEST_TIMEOUT) {
            Ok(mut status) => {
                if let Value::Object(map) = &mut status {
                    map.insert("port".to_string(), json!(record.port));
                    map.insert("owner".to_string(), json!(record.owner.to_string()));
                }
                status
            }
            Err(_) => json!({ "running": false, "port": record.port }),
        },
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
    );
    Ok(ExitCode::SUCCESS)
}

pub fn stop() -> Result<ExitCode> {
    let Some(record) = current_record()? else {
        println!("daemon is not running");
        return Ok(ExitCode::SUCCESS);
    };
    match request_stop(record.port, record.key.as_str(), REQUEST_TIMEOUT) {
        Ok(_) => println!("daemon stop requested"),
        Err(_) => println!("daemon is not running"),
    }
    Ok(ExitCode::SUCCESS)
}
