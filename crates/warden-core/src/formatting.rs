//! Formatting utilities (Telegram HTML, byte sizes, durations, event messages).

use chrono::{DateTime, Utc};

use crate::{
    domain::Panel,
    events::EngineEvent,
    limits::{self, LimitCheckResult},
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0usize;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", UNITS[unit])
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        return format!("{days}d {hours}h");
    }
    if hours > 0 {
        return format!("{hours}h {mins}m");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

fn limit_text(used: String, limit: u64, render: impl Fn(u64) -> String) -> String {
    if limit == 0 {
        format!("{used} / unlimited")
    } else {
        format!("{used} / {}", render(limit))
    }
}

/// Multi-line HTML status block for one panel.
pub fn panel_status_html(panel: &Panel, check: &LimitCheckResult, now: DateTime<Utc>) -> String {
    let q = &panel.quotas;
    let state = if panel.is_active() {
        "✅ active".to_string()
    } else {
        let why = panel
            .deactivation
            .as_ref()
            .map(|d| format!(" ({})", escape_html(&d.reason)))
            .unwrap_or_default();
        format!("⛔ deactivated{why}")
    };

    let mut lines = vec![
        format!(
            "<b>{}</b> <code>{}</code>",
            escape_html(&panel.label()),
            panel.id
        ),
        format!("State: {state}"),
        format!(
            "Users: {}",
            limit_text(check.user_count.to_string(), q.max_users as u64, |v| v
                .to_string())
        ),
        format!(
            "Traffic: {}",
            limit_text(format_bytes(check.effective_traffic), q.max_traffic, format_bytes)
        ),
        format!(
            "Time: {}",
            limit_text(
                format_duration(check.elapsed_seconds as i64),
                q.max_total_time,
                |v| format_duration(v as i64)
            )
        ),
        format!(
            "Expires: {} ({} days left)",
            limits::expires_at(panel).format("%Y-%m-%d %H:%M UTC"),
            check.remaining_days
        ),
    ];

    if !check.warnings.is_empty() && panel.is_active() {
        let w = check
            .warnings
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("⚠️ {}", escape_html(&w)));
    }
    if panel.is_active() && check.is_breached() {
        let cause = check.cause().unwrap_or_default();
        lines.push(format!(
            "🚨 over limit: {} (checked {})",
            escape_html(&cause),
            now.format("%H:%M")
        ));
    }

    lines.join("\n")
}

/// Telegram HTML rendering of an engine event.
pub fn event_html(event: &EngineEvent) -> String {
    let p = event.panel();
    let who = format!(
        "<b>{}</b> <code>{}</code>",
        escape_html(&p.label),
        p.id
    );
    match event {
        EngineEvent::LimitWarning {
            warnings,
            remaining_days,
            ..
        } => {
            let items = warnings
                .iter()
                .map(|w| format!("• {}", escape_html(&w.to_string())))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "⚠️ <b>Approaching limits</b>\n\nPanel: {who}\n{items}\nDays left: {remaining_days}"
            )
        }
        EngineEvent::Deactivated(r) => {
            let title = if r.repaired {
                "🔁 <b>Deactivation re-applied</b>"
            } else {
                "⛔ <b>Panel deactivated</b>"
            };
            format!(
                "{title}\n\nPanel: {who}\nReason: {}\nSub-accounts: {}",
                escape_html(&r.reason.to_string()),
                escape_html(&r.sub_accounts.summary())
            )
        }
        EngineEvent::Reactivated(r) => format!(
            "✅ <b>Panel reactivated</b>\n\nPanel: {who}\nSub-accounts: {}",
            escape_html(&r.sub_accounts.summary())
        ),
        EngineEvent::Deleted(r) => format!(
            "🗑 <b>Panel deleted</b>\n\nPanel: {who}\nSub-accounts: {}\nPreserved traffic: {}",
            escape_html(&r.sub_accounts.summary()),
            format_bytes(r.preserved_traffic)
        ),
        EngineEvent::SubAccountDeleted {
            sub_account,
            preserved_traffic,
            ..
        } => format!(
            "🗑 <b>Sub-account deleted</b>\n\nPanel: {who}\nSub-account: <code>{}</code>\nPreserved traffic: {}",
            escape_html(sub_account),
            format_bytes(*preserved_traffic)
        ),
        EngineEvent::TransitionFailed { action, error, .. } => format!(
            "❌ <b>{} failed</b>\n\nPanel: {who}\n<code>{}</code>",
            escape_html(action),
            escape_html(error)
        ),
        EngineEvent::InconsistentState { detail, .. } => format!(
            "🚨 <b>Inconsistent panel state</b>\n\nPanel: {who}\n{}\nManual attention required.",
            escape_html(detail)
        ),
    }
}

/// Split on line boundaries so each chunk fits `limit` bytes.
pub fn split_lines(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for line in text.split('\n') {
        if !cur.is_empty() && cur.len() + 1 + line.len() > limit {
            out.push(std::mem::take(&mut cur));
        }
        if !cur.is_empty() {
            cur.push('\n');
        }
        cur.push_str(line);
        while cur.len() > limit {
            let mut cut = limit;
            while !cur.is_char_boundary(cut) {
                cut -= 1;
            }
            let rest = cur.split_off(cut);
            out.push(std::mem::replace(&mut cur, rest));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}
