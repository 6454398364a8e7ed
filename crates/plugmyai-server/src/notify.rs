//! Human-approval surfaces shown when an app asks to pair.

use tracing::{info, warn};

use crate::pairing::DecisionHandle;

/// Presents a pending pairing request to the person running the daemon.
///
/// Implementations may open `approve_url` for the dashboard to decide, or
/// call `decision.approve(..)` / `decision.deny()` themselves from any task.
pub trait ApprovalSurface: Send + Sync {
    fn present(&self, app_name: &str, approve_url: &str, decision: DecisionHandle);
}

/// Opens the approval page in the default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserApproval;

impl ApprovalSurface for BrowserApproval {
    fn present(&self, app_name: &str, approve_url: &str, decision: DecisionHandle) {
        info!(app = app_name, request_id = decision.request_id(), "opening approval page");
        let url = approve_url.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = webbrowser::open(&url) {
                warn!(error = %e, url = %url, "failed to open browser, approve from the dashboard");
            }
        });
    }
}

/// Only logs the approval URL; used headless and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyApproval;

impl ApprovalSurface for LogOnlyApproval {
    fn present(&self, app_name: &str, approve_url: &str, decision: DecisionHandle) {
        info!(
            app = app_name,
            request_id = decision.request_id(),
            approve_url,
            "pairing request awaiting approval"
        );
    }
}
