//! Password acquisition for encrypted inputs.
//!
//! The orchestrator races every request against the configured timeout, so
//! an implementation may block internally as long as the returned future is
//! safe to drop.

use std::io::{BufRead, Write};
use std::path::Path;

use async_trait::async_trait;

/// Answers one password request per encrypted work item. `None` means the
/// user declined (empty line or closed input).
#[async_trait]
pub trait PasswordSource: Send + Sync {
    async fn request(&self, input: &Path) -> Option<String>;
}

/// Interactive prompt on the controlling terminal. The blocking stdin read
/// runs on the blocking pool; when the orchestrator's timeout fires first,
/// the task is abandoned rather than joined.
pub struct TerminalPrompt;

#[async_trait]
impl PasswordSource for TerminalPrompt {
    async fn request(&self, input: &Path) -> Option<String> {
        let name = input.display().to_string();
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            write!(stderr, "password for {name}: ").ok()?;
            stderr.flush().ok()?;

            let mut line = String::new();
            let stdin = std::io::stdin();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    let entered = line.trim_end_matches(['\r', '\n']);
                    if entered.is_empty() {
                        None
                    } else {
                        Some(entered.to_string())
                    }
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}
