//! One-line rendering of the merged health record.

use statusline_core::health::SessionHealth;

/// Printed when there is nothing to render from (empty or invalid stdin).
pub const FALLBACK_LINE: &str = "statusline: waiting for session";

const SEPARATOR: &str = " | ";

pub fn render_line(health: &SessionHealth) -> String {
    let mut parts: Vec<String> = Vec::new();

    let mut head = String::new();
    if let Some(model) = &health.model {
        if let Some(name) = model.display_name.as_ref().or(model.id.as_ref()) {
            head.push_str(&format!("[{}]", name));
        }
    }
    if let Some(project) = health
        .workspace
        .as_ref()
        .and_then(|w| w.project_dir.as_deref())
        .and_then(|p| p.rsplit('/').find(|s| !s.is_empty()))
    {
        if !head.is_empty() {
            head.push(' ');
        }
        head.push_str(project);
    }
    if let Some(git) = &health.git {
        if let Some(branch) = &git.branch {
            head.push_str(&format!(" ({}{})", branch, if git.is_dirty() { "*" } else { "" }));
        }
    }
    if !head.is_empty() {
        parts.push(head);
    }

    if let Some(cost) = &health.cost {
        parts.push(format!("${:.2}", cost.total_cost_usd));
    }
    if let Some(pct) = health.context.as_ref().and_then(|c| c.used_percentage) {
        parts.push(format!("ctx {:.0}%", pct));
    }
    if let Some(billing) = &health.billing {
        let mut block = format!("block ${:.2}", billing.block_cost_usd);
        if let Some(reset) = billing.resets_at.as_deref().and_then(reset_clock) {
            block.push_str(&format!(" until {}", reset));
        }
        parts.push(block);
    }
    if let Some(email) = health.auth.as_ref().and_then(|a| a.email.as_deref()) {
        parts.push(email.to_string());
    }
    if let Some(transcript) = &health.transcript {
        match transcript.secrets.len() {
            0 => {}
            1 => parts.push("1 secret exposed".to_string()),
            n => parts.push(format!("{} secrets exposed", n)),
        }
    }

    if parts.is_empty() {
        FALLBACK_LINE.to_string()
    } else {
        parts.join(SEPARATOR)
    }
}

/// Local HH:MM for an RFC 3339 timestamp.
fn reset_clock(rfc3339: &str) -> Option<String> {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M").to_string())
}
