//! Automation driver: the narrow seam between the flow and whatever
//! actually operates the target web application.
//!
//! The flow only ever talks to [`AutomationDriver`]. Two implementations ship:
//! - [`CommandDriver`] shells out to an external helper, one verb per call
//! - [`DryRunDriver`] logs every step and reports success

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use punchclock_core::error::{PunchError, Result};

use crate::notify::redact_url;

/// URL fragments that indicate a sign-in page from any identity provider.
const SIGN_IN_MARKERS: [&str; 4] = ["login", "signin", "sso", "auth"];

/// Whether the driver landed on an authentication screen.
pub fn looks_like_sign_in(url: &str) -> bool {
    let url = url.to_lowercase();
    SIGN_IN_MARKERS.iter().any(|m| url.contains(m))
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Start (or reuse) a browser session from the stored session artifact.
    async fn open_session(&self, artifact: &Path) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Close cookie banners and location prompts.
    async fn dismiss_interstitials(&self) -> Result<()>;

    /// Fill the identifier field of a sign-in form.
    async fn prefill_identity(&self, identifier: &str) -> Result<()>;

    /// Press a logical control; with `confirm`, wait until that control shows up.
    async fn click(&self, button: &str, confirm: Option<&str>) -> Result<()>;

    /// Whether `control` is currently shown on the page.
    async fn is_visible(&self, control: &str) -> Result<bool>;

    /// Forensic capture into `dir`. Returns the written file, if any.
    async fn snapshot(&self, tag: &str, dir: &Path) -> Result<Option<PathBuf>>;

    async fn current_url(&self) -> Result<String>;

    /// Write the current session back to the artifact.
    async fn save_session(&self, artifact: &Path) -> Result<()>;
}

/// Runs `<command> <verb> [args..]` for every step.
/// Exit status 0 is success; stdout carries the result of query verbs.
pub struct CommandDriver {
    command: String,
    timeout: Duration,
}

impl CommandDriver {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(&self, verb: &str, args: &[&str]) -> Result<String> {
        tracing::debug!("🖱️ driver {verb}");
        let run = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.command)
                .arg(verb)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match run {
            Ok(Ok(out)) if out.status.success() => {
                Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let stderr: String = stderr.trim().chars().take(2000).collect();
                Err(PunchError::Action(format!(
                    "driver '{verb}' exited with {}: {stderr}",
                    out.status.code().unwrap_or(-1)
                )))
            }
            Ok(Err(e)) => Err(PunchError::Action(format!(
                "driver '{}' not found or not executable: {e}",
                self.command
            ))),
            Err(_) => Err(PunchError::Action(format!(
                "driver '{verb}' timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl AutomationDriver for CommandDriver {
    fn name(&self) -> &str {
        "command"
    }

    async fn open_session(&self, artifact: &Path) -> Result<()> {
        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.invoke("open-session", &[&artifact.to_string_lossy()]).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        tracing::info!("🌐 Opening {}", redact_url(url));
        self.invoke("navigate", &[url]).await?;
        Ok(())
    }

    async fn dismiss_interstitials(&self) -> Result<()> {
        self.invoke("dismiss", &[]).await?;
        Ok(())
    }

    async fn prefill_identity(&self, identifier: &str) -> Result<()> {
        self.invoke("prefill-identity", &[identifier]).await?;
        Ok(())
    }

    async fn click(&self, button: &str, confirm: Option<&str>) -> Result<()> {
        match confirm {
            Some(next) => self.invoke("click", &[button, "--confirm", next]).await?,
            None => self.invoke("click", &[button]).await?,
        };
        Ok(())
    }

    async fn is_visible(&self, control: &str) -> Result<bool> {
        let out = self.invoke("is-visible", &[control]).await?;
        parse_visibility(&out)
    }

    async fn snapshot(&self, tag: &str, dir: &Path) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let out = self.invoke("snapshot", &[tag, &dir.to_string_lossy()]).await?;
        Ok((!out.is_empty()).then(|| PathBuf::from(out)))
    }

    async fn current_url(&self) -> Result<String> {
        self.invoke("current-url", &[]).await
    }

    async fn save_session(&self, artifact: &Path) -> Result<()> {
        self.invoke("save-session", &[&artifact.to_string_lossy()]).await?;
        Ok(())
    }
}

/// Answer of the `is-visible` verb: `true`/`false`, case-insensitive.
fn parse_visibility(out: &str) -> Result<bool> {
    match out.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(PunchError::Action(format!(
            "driver 'is-visible' returned unexpected output: {other}"
        ))),
    }
}

/// Logs each step and reports success. `current_url` echoes the last navigation.
#[derive(Default)]
pub struct DryRunDriver {
    last_url: std::sync::Mutex<String>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AutomationDriver for DryRunDriver {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn open_session(&self, artifact: &Path) -> Result<()> {
        tracing::info!("🧪 [dry-run] open session from {}", artifact.display());
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        tracing::info!("🧪 [dry-run] navigate {}", redact_url(url));
        *self.last_url.lock().unwrap_or_else(|p| p.into_inner()) = url.to_string();
        Ok(())
    }

    async fn dismiss_interstitials(&self) -> Result<()> {
        Ok(())
    }

    async fn prefill_identity(&self, _identifier: &str) -> Result<()> {
        tracing::info!("🧪 [dry-run] prefill sign-in identifier");
        Ok(())
    }

    async fn click(&self, button: &str, confirm: Option<&str>) -> Result<()> {
        tracing::info!("🧪 [dry-run] click {button} (expect {confirm:?})");
        Ok(())
    }

    async fn is_visible(&self, _control: &str) -> Result<bool> {
        Ok(false)
    }

    async fn snapshot(&self, tag: &str, _dir: &Path) -> Result<Option<PathBuf>> {
        tracing::info!("🧪 [dry-run] snapshot {tag}");
        Ok(None)
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.last_url.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn save_session(&self, _artifact: &Path) -> Result<()> {
        Ok(())
    }
}
