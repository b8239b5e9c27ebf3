use chrono::Utc;

use warden_core::{
    domain::{Panel, PanelId, UserId},
    errors::Error,
    events::{DeactivationReason, PanelRef},
    formatting::{escape_html, format_bytes, panel_status_html},
    messaging::types::Command,
    security::Role,
    Result,
};

use super::args;
use crate::router::AppState;

const SUDO_COMMANDS: &[&str] = &[
    "panels",
    "check",
    "deactivate",
    "reactivate",
    "reactivate_operator",
    "delete",
    "quotas",
    "unuser",
    "newpanel",
    "register",
];

/// Commands that touch the store or the remote service.
pub fn is_metered(name: &str) -> bool {
    !matches!(name, "start" | "help")
}

fn help(role: Role) -> String {
    let mut out = String::from(
        "🛡 <b>Panel warden</b>\n\n\
<b>Commands:</b>\n\
/help - Show this message\n\
/mypanels - Your panels and their usage\n\
/status &lt;id&gt; - Usage of one of your panels\n",
    );
    if role == Role::Sudo {
        out.push_str(
            "\n<b>Sudo:</b>\n\
/panels - List every panel\n\
/status - Monitor status\n\
/check - Run a monitor pass now\n\
/deactivate &lt;id&gt; [reason]\n\
/reactivate &lt;id&gt;\n\
/reactivate_operator &lt;telegram_id&gt;\n\
/delete &lt;id&gt; confirm\n\
/quotas &lt;id&gt; &lt;users&gt; &lt;traffic_gb&gt; &lt;time_days&gt; &lt;validity_days&gt;\n\
/unuser &lt;id&gt; &lt;sub_account&gt;\n\
/newpanel &lt;telegram_id&gt; &lt;username&gt; &lt;password&gt; &lt;users&gt; &lt;traffic_gb&gt; &lt;time_days&gt; &lt;validity_days&gt; [name]\n\
/register &lt;telegram_id&gt; &lt;username&gt; &lt;password&gt; [name]\n\n\
Zero in users, traffic or time means unlimited.",
        );
    }
    out
}

fn panel_line(p: &Panel) -> String {
    let state = if p.is_active() { "✅" } else { "⛔" };
    format!(
        "{state} <code>{}</code> {} · operator <code>{}</code>",
        p.id,
        escape_html(&p.label()),
        p.operator.0
    )
}

fn who(p: &PanelRef) -> String {
    format!("{} <code>{}</code>", escape_html(&p.label), p.id)
}

/// Load a panel the caller may see. Operators only see their own panels;
/// anything else reads as missing.
async fn visible_panel(state: &AppState, role: Role, caller: UserId, id: PanelId) -> Result<Panel> {
    let panel = state
        .engine
        .store()
        .panel(id)
        .await?
        .filter(|p| role == Role::Sudo || p.operator == caller)
        .ok_or_else(|| Error::NotFound(format!("panel {id}")))?;
    Ok(panel)
}

async fn status_of(state: &AppState, panel: &Panel) -> Result<String> {
    let inspection = state.engine.monitor().inspect(panel.id).await?;
    let mut html = panel_status_html(&inspection.panel, &inspection.check, Utc::now());
    if !inspection.live {
        html.push_str("\n<i>Panel service unreachable; stored values shown.</i>");
    }
    Ok(html)
}

/// Run one command and return the HTML reply.
pub async fn execute(state: &AppState, role: Role, cmd: &Command) -> Result<String> {
    if role != Role::Sudo && SUDO_COMMANDS.contains(&cmd.name.as_str()) {
        return Ok("⛔ This command is for sudo admins.".to_string());
    }
    let caller = cmd.user_id;
    let actor = Some(caller);
    let parts = cmd.arg_list();

    match cmd.name.as_str() {
        "start" | "help" => Ok(help(role)),

        "panels" => {
            let panels = state.engine.all_panels().await?;
            if panels.is_empty() {
                return Ok("No panels registered.".to_string());
            }
            let mut lines = vec![format!("<b>Panels</b> ({})", panels.len())];
            lines.extend(panels.iter().map(panel_line));
            Ok(lines.join("\n"))
        }

        "mypanels" => my_panels(state, caller).await,

        "status" => match parts.first() {
            Some(raw) => {
                let panel = visible_panel(state, role, caller, args::panel_id(raw)?).await?;
                status_of(state, &panel).await
            }
            None if role == Role::Sudo => {
                let all = state.engine.all_panels().await?;
                let active = all.iter().filter(|p| p.is_active()).count();
                Ok(format!(
                    "{}\nPanels: {} ({} active, {} deactivated)",
                    state.engine.monitor().status_html().await,
                    all.len(),
                    active,
                    all.len() - active
                ))
            }
            None => my_panels(state, caller).await,
        },

        "check" => match state.engine.run_check_now().await? {
            Some(summary) => Ok(format!("🔍 Pass finished: {}", escape_html(&summary.line()))),
            None => Ok("⏳ A monitor pass is already running.".to_string()),
        },

        "deactivate" => {
            let Some(raw) = parts.first() else {
                return Err(Error::InvalidInput("usage: /deactivate <id> [reason]".to_string()));
            };
            let id = args::panel_id(raw)?;
            let note = cmd
                .args
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim().to_string())
                .filter(|s| !s.is_empty());
            let report = state
                .engine
                .executor()
                .deactivate(id, DeactivationReason::Manual { by: caller, note }, actor)
                .await?;
            let mut out = format!(
                "⛔ Deactivated {}\nSub-accounts: {}",
                who(&report.panel),
                escape_html(&report.sub_accounts.summary())
            );
            if report.repaired {
                out.push_str("\nStored credential was re-applied to the panel service.");
            }
            Ok(out)
        }

        "reactivate" => {
            let Some(raw) = parts.first() else {
                return Err(Error::InvalidInput("usage: /reactivate <id>".to_string()));
            };
            let report = state
                .engine
                .executor()
                .reactivate(args::panel_id(raw)?, actor)
                .await?;
            if report.already_active {
                return Ok(format!("{} is already active.", who(&report.panel)));
            }
            Ok(format!(
                "✅ Reactivated {}\nSub-accounts: {}",
                who(&report.panel),
                escape_html(&report.sub_accounts.summary())
            ))
        }

        "reactivate_operator" => {
            let Some(raw) = parts.first() else {
                return Err(Error::InvalidInput(
                    "usage: /reactivate_operator <telegram_id>".to_string(),
                ));
            };
            let operator = args::telegram_id(raw)?;
            let out = state
                .engine
                .executor()
                .reactivate_operator(operator, actor)
                .await?;
            let mut lines = vec![format!(
                "Operator <code>{}</code>: {} reactivated, {} failed",
                operator.0,
                out.reactivated.len(),
                out.failed.len()
            )];
            lines.extend(out.reactivated.iter().map(|r| format!("✅ {}", who(&r.panel))));
            lines.extend(
                out.failed
                    .iter()
                    .map(|(p, e)| format!("❌ {}: {}", who(p), escape_html(e))),
            );
            Ok(lines.join("\n"))
        }

        "delete" => {
            let (Some(raw), confirm) = (parts.first(), parts.get(1)) else {
                return Err(Error::InvalidInput("usage: /delete <id> confirm".to_string()));
            };
            let id = args::panel_id(raw)?;
            if confirm.copied() != Some("confirm") {
                let panel = visible_panel(state, role, caller, id).await?;
                return Ok(format!(
                    "⚠️ This deletes {} <code>{}</code> and every sub-account on the panel service.\n\
Send <code>/delete {} confirm</code> to proceed.",
                    escape_html(&panel.label()),
                    panel.id,
                    panel.id.0
                ));
            }
            let report = state.engine.executor().delete_panel(id, actor).await?;
            Ok(format!(
                "🗑 Deleted {}\nSub-accounts: {}\nPreserved traffic: {}",
                who(&report.panel),
                escape_html(&report.sub_accounts.summary()),
                format_bytes(report.preserved_traffic)
            ))
        }

        "quotas" => {
            let Some((raw, rest)) = parts.split_first() else {
                return Err(Error::InvalidInput(
                    "usage: /quotas <id> <users> <traffic_gb> <time_days> <validity_days>"
                        .to_string(),
                ));
            };
            let id = args::panel_id(raw)?;
            let quotas = args::quotas(rest)?;
            let panel = state
                .engine
                .provisioning()
                .update_quotas(id, quotas, actor)
                .await?;
            Ok(format!("📝 Quotas updated\n\n{}", status_of(state, &panel).await?))
        }

        "unuser" => {
            let [raw, sub] = parts.as_slice() else {
                return Err(Error::InvalidInput(
                    "usage: /unuser <id> <sub_account>".to_string(),
                ));
            };
            let preserved = state
                .engine
                .executor()
                .delete_sub_account(args::panel_id(raw)?, sub, actor)
                .await?;
            Ok(format!(
                "🗑 Sub-account <code>{}</code> deleted. Preserved traffic: {}",
                escape_html(sub),
                format_bytes(preserved)
            ))
        }

        "newpanel" => {
            let req = args::new_panel(&parts)?;
            let panel = state.engine.provisioning().create_panel(req, actor).await?;
            Ok(format!("🆕 Created\n{}", panel_line(&panel)))
        }

        "register" => {
            let req = args::existing_panel(&parts)?;
            let panel = state
                .engine
                .provisioning()
                .register_existing_panel(req, actor)
                .await?;
            Ok(format!(
                "📥 Registered with default quotas\n{}\nUse /quotas to adjust.",
                panel_line(&panel)
            ))
        }

        other => Ok(format!(
            "Unknown command /{}. Send /help for the list.",
            escape_html(other)
        )),
    }
}

async fn my_panels(state: &AppState, caller: UserId) -> Result<String> {
    let panels = state.engine.operator_panels(caller).await?;
    if panels.is_empty() {
        return Ok("You have no panels.".to_string());
    }
    let mut blocks = Vec::with_capacity(panels.len());
    for p in &panels {
        match status_of(state, p).await {
            Ok(html) => blocks.push(html),
            Err(e) => blocks.push(format!(
                "{}\n❌ {}",
                panel_line(p),
                escape_html(&e.to_string())
            )),
        }
    }
    Ok(blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_hides_sudo_commands_from_operators() {
        let op = help(Role::Operator);
        assert!(op.contains("/mypanels"));
        assert!(!op.contains("/deactivate"));

        let sudo = help(Role::Sudo);
        assert!(sudo.contains("/deactivate"));
        assert!(sudo.contains("/newpanel"));
    }

    #[test]
    fn only_help_is_unmetered() {
        assert!(!is_metered("help"));
        assert!(!is_metered("start"));
        assert!(is_metered("status"));
        assert!(is_metered("delete"));
    }

    #[test]
    fn every_sudo_command_is_in_help() {
        let sudo = help(Role::Sudo);
        for name in SUDO_COMMANDS {
            assert!(sudo.contains(&format!("/{name}")), "{name} missing from help");
        }
    }
}
