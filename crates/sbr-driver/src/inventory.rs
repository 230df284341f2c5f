// SPDX-License-Identifier: AGPL-3.0-only

//! System inventory for the run log
//!
//! Records which machine a run happened on (`dmidecode -t 1`, the system
//! information table). Inventory is best effort; a failure becomes a log
//! line, never an error.

use crate::access::Credential;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Run log lines describing the system.
///
/// Goes through `sudo -S` when `credential` holds a password, since
/// `dmidecode` reads firmware tables that need root.
pub fn system_inventory(credential: &Credential) -> Vec<String> {
    inventory_with("dmidecode", credential)
}

fn inventory_with(tool: &str, credential: &Credential) -> Vec<String> {
    match run_tool(tool, credential) {
        Ok(output) => {
            debug!("{tool}: {} line(s)", output.lines().count());
            let mut lines = vec!["DMIDecode Output:".to_string()];
            lines.extend(output.lines().map(str::to_string));
            lines
        }
        Err(reason) => {
            warn!("System inventory unavailable: {reason}");
            vec![format!("Error running dmidecode: {reason}")]
        }
    }
}

fn run_tool(tool: &str, credential: &Credential) -> Result<String, String> {
    let mut command = match credential.expose() {
        Some(_) => {
            let mut c = Command::new("sudo");
            c.args(["-S", "-p", ""]).arg(tool);
            c
        }
        None => Command::new(tool),
    };
    command
        .args(["-t", "1"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| format!("cannot run {tool}: {e}"))?;

    if let (Some(secret), Some(mut stdin)) = (credential.expose(), child.stdin.take()) {
        stdin
            .write_all(secret.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .map_err(|e| format!("credential pipe: {e}"))?;
    }

    let output = child.wait_with_output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!(
            "{tool} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
