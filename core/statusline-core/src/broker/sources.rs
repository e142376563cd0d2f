//! Built-in data sources.
//!
//! | id           | tier    | input                                   |
//! |--------------|---------|-----------------------------------------|
//! | `model`      | instant | host JSON `model`                       |
//! | `workspace`  | instant | host JSON `workspace` / `cwd`           |
//! | `cost`       | instant | host JSON `cost`                        |
//! | `context`    | instant | host JSON `context_window`              |
//! | `transcript` | session | incremental transcript scan             |
//! | `auth`       | session | `~/.claude.json` `oauthAccount`         |
//! | `git`        | session | `git status --porcelain=v2 --branch`    |
//! | `billing`    | global  | configured command (ccusage by default) |
//! | `quota`      | global  | configured command, opaque JSON         |

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::context::GatherContext;
use super::registry::{DataSourceDescriptor, DataSourceRegistry, Tier};
use crate::config::Config;
use crate::error::{FetchError, Result, StatuslineError};
use crate::freshness::FreshnessCategory;
use crate::health::{AuthInfo, BillingInfo, ContextUsage, CostInfo, GitStatus, ModelInfo, WorkspaceInfo};
use crate::scanner::{ScanResult, Scanner};

pub const MODEL: &str = "model";
pub const WORKSPACE: &str = "workspace";
pub const COST: &str = "cost";
pub const CONTEXT: &str = "context";
pub const TRANSCRIPT: &str = "transcript";
pub const AUTH: &str = "auth";
pub const GIT: &str = "git";
pub const BILLING: &str = "billing";
pub const QUOTA: &str = "quota";

const TRANSCRIPT_TIMEOUT: Duration = Duration::from_secs(2);
const AUTH_TIMEOUT: Duration = Duration::from_millis(500);
const GIT_TIMEOUT: Duration = Duration::from_secs(1);
const BILLING_TIMEOUT: Duration = Duration::from_secs(35);
const QUOTA_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn register_builtin(registry: &mut DataSourceRegistry, config: &Config) -> Result<()> {
    registry.register(DataSourceDescriptor::new(MODEL, Tier::Instant, fetch_model, |h, v| {
        h.model = Some(v)
    }))?;
    registry.register(DataSourceDescriptor::new(
        WORKSPACE,
        Tier::Instant,
        fetch_workspace,
        |h, v| h.workspace = Some(v),
    ))?;
    registry.register(DataSourceDescriptor::new(COST, Tier::Instant, fetch_cost, |h, v| {
        h.cost = Some(v)
    }))?;
    registry.register(DataSourceDescriptor::new(CONTEXT, Tier::Instant, fetch_context, |h, v| {
        h.context = Some(v)
    }))?;

    registry.register(
        DataSourceDescriptor::new(TRANSCRIPT, Tier::Session, fetch_transcript, |h, v| {
            h.transcript = Some(v)
        })
        .with_timeout(TRANSCRIPT_TIMEOUT),
    )?;
    registry.register(
        DataSourceDescriptor::new(AUTH, Tier::Session, fetch_auth, |h, v| h.auth = Some(v))
            .with_timeout(AUTH_TIMEOUT),
    )?;
    if config.git_enabled {
        registry.register(
            DataSourceDescriptor::new(GIT, Tier::Session, fetch_git, |h, v| h.git = Some(v))
                .with_timeout(GIT_TIMEOUT)
                .depends_on(WORKSPACE),
        )?;
    }

    if let Some(argv) = config.billing_command.clone().filter(|a| !a.is_empty()) {
        registry.register(
            DataSourceDescriptor::new(
                BILLING,
                Tier::Global,
                move |ctx: &GatherContext| {
                    let stdout = run_command(&argv, None, BILLING_TIMEOUT.min(ctx.remaining()))?;
                    parse_billing(&stdout)
                },
                |h, v| h.billing = Some(v),
            )
            .with_freshness(FreshnessCategory::Billing)
            .with_timeout(BILLING_TIMEOUT),
        )?;
    }
    if let Some(argv) = config.quota_command.clone().filter(|a| !a.is_empty()) {
        registry.register(
            DataSourceDescriptor::new(
                QUOTA,
                Tier::Global,
                move |ctx: &GatherContext| {
                    let stdout = run_command(&argv, None, QUOTA_TIMEOUT.min(ctx.remaining()))?;
                    serde_json::from_str::<Value>(stdout.trim())
                        .map_err(|e| FetchError::Shape(format!("quota output is not JSON: {}", e)))
                },
                |h, v| h.quota = Some(v),
            )
            .with_freshness(FreshnessCategory::Quota)
            .with_timeout(QUOTA_TIMEOUT),
        )?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tier 1: host input
// ═══════════════════════════════════════════════════════════════════════════════

fn missing(field: &str) -> FetchError {
    FetchError::Failed(format!("host input has no {}", field))
}

fn fetch_model(ctx: &GatherContext) -> std::result::Result<ModelInfo, FetchError> {
    let info = ModelInfo {
        id: ctx.input_str(&["model", "id"]).map(str::to_string),
        display_name: ctx.input_str(&["model", "display_name"]).map(str::to_string),
    };
    if info.id.is_none() && info.display_name.is_none() {
        return Err(missing("model"));
    }
    Ok(info)
}

fn fetch_workspace(ctx: &GatherContext) -> std::result::Result<WorkspaceInfo, FetchError> {
    let current_dir = ctx
        .input_str(&["workspace", "current_dir"])
        .or_else(|| ctx.input_str(&["cwd"]))
        .map(str::to_string);
    let project_dir = ctx
        .input_str(&["workspace", "project_dir"])
        .map(str::to_string)
        .or_else(|| current_dir.clone());
    if project_dir.is_none() {
        return Err(missing("workspace"));
    }
    Ok(WorkspaceInfo {
        project_dir,
        current_dir,
    })
}

fn fetch_cost(ctx: &GatherContext) -> std::result::Result<CostInfo, FetchError> {
    let cost = ctx.raw_input.get("cost").ok_or_else(|| missing("cost"))?;
    let num = |key: &str| cost.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    Ok(CostInfo {
        total_cost_usd: num("total_cost_usd"),
        total_duration_ms: num("total_duration_ms") as u64,
        lines_added: num("total_lines_added") as u64,
        lines_removed: num("total_lines_removed") as u64,
    })
}

fn fetch_context(ctx: &GatherContext) -> std::result::Result<ContextUsage, FetchError> {
    let window = ctx
        .raw_input
        .get("context_window")
        .ok_or_else(|| missing("context_window"))?;
    let uint = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64);

    let used_tokens = match window.get("current_usage").filter(|u| u.is_object()) {
        Some(usage) => ["input_tokens", "cache_creation_input_tokens", "cache_read_input_tokens"]
            .iter()
            .filter_map(|k| uint(usage, k))
            .sum(),
        None => uint(window, "total_input_tokens").unwrap_or(0),
    };
    let window_size = uint(window, "context_window_size").filter(|s| *s > 0);
    let used_percentage = window
        .get("used_percentage")
        .and_then(Value::as_f64)
        .or_else(|| window_size.map(|size| used_tokens as f64 * 100.0 / size as f64));

    Ok(ContextUsage {
        used_tokens,
        window_size,
        used_percentage,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tier 2: per session
// ═══════════════════════════════════════════════════════════════════════════════

fn fetch_transcript(ctx: &GatherContext) -> std::result::Result<ScanResult, FetchError> {
    let path = ctx
        .transcript_path
        .as_deref()
        .ok_or_else(|| missing("transcript_path"))?;
    let scanner = Scanner::new(ctx.storage.clone(), &ctx.config);
    match scanner.scan(&ctx.session_id, path) {
        Ok(result) => Ok(result),
        // A session that has not written its transcript yet is healthy and empty.
        Err(StatuslineError::NotFound(_)) => Ok(ScanResult::default()),
        Err(e) => Err(e.into()),
    }
}

fn fetch_auth(ctx: &GatherContext) -> std::result::Result<AuthInfo, FetchError> {
    let path = ctx.storage.claude_account_file();
    let content = fs_err::read_to_string(&path)
        .map_err(|e| FetchError::from(StatuslineError::io("read account file", e)))?;
    let json: Value = serde_json::from_str(&content)
        .map_err(|e| FetchError::from(StatuslineError::json("parse account file", e)))?;
    Ok(parse_account(&json))
}

pub fn parse_account(json: &Value) -> AuthInfo {
    let account = json.get("oauthAccount");
    let field = |key: &str| {
        account
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    AuthInfo {
        email: field("emailAddress"),
        organization: field("organizationName"),
    }
}

fn fetch_git(ctx: &GatherContext) -> std::result::Result<GitStatus, FetchError> {
    let dir = ctx
        .project_path
        .as_deref()
        .ok_or_else(|| missing("project path"))?;
    let argv: Vec<String> = ["git", "status", "--porcelain=v2", "--branch"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let stdout = run_command(&argv, Some(dir), GIT_TIMEOUT.min(ctx.remaining()))?;
    Ok(parse_git_status(&stdout))
}

/// Parses `git status --porcelain=v2 --branch`.
pub fn parse_git_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();
    for line in output.lines() {
        if let Some(head) = line.strip_prefix("# branch.head ") {
            if head != "(detached)" {
                status.branch = Some(head.to_string());
            }
        } else if let Some(ab) = line.strip_prefix("# branch.ab ") {
            for part in ab.split_whitespace() {
                if let Some(n) = part.strip_prefix('+') {
                    status.ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix('-') {
                    status.behind = n.parse().unwrap_or(0);
                }
            }
        } else if line.starts_with("1 ") || line.starts_with("2 ") {
            let xy = line.get(2..4).unwrap_or("..");
            let mut flags = xy.chars();
            if flags.next().is_some_and(|c| c != '.') {
                status.staged += 1;
            }
            if flags.next().is_some_and(|c| c != '.') {
                status.unstaged += 1;
            }
        } else if line.starts_with("u ") {
            status.unstaged += 1;
        } else if line.starts_with("? ") {
            status.untracked += 1;
        }
    }
    status
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tier 3: global
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses `ccusage blocks --active --json`: the active block's cost, hourly
/// burn rate, and end time.
pub fn parse_billing(output: &str) -> std::result::Result<BillingInfo, FetchError> {
    let json: Value = serde_json::from_str(output.trim())
        .map_err(|e| FetchError::Shape(format!("billing output is not JSON: {}", e)))?;
    let blocks = json
        .get("blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Shape("billing output has no blocks".to_string()))?;

    let Some(block) = blocks
        .iter()
        .find(|b| b.get("isActive").and_then(Value::as_bool).unwrap_or(false))
        .or_else(|| blocks.first())
    else {
        return Ok(BillingInfo::default());
    };

    Ok(BillingInfo {
        block_cost_usd: block.get("costUSD").and_then(Value::as_f64).unwrap_or(0.0),
        burn_rate_per_hour: block
            .get("burnRate")
            .and_then(|r| r.get("costPerHour"))
            .and_then(Value::as_f64),
        resets_at: block
            .get("endTime")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command helper
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs `argv` and returns its stdout, killing the child once `timeout` elapses.
pub fn run_command(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> std::result::Result<String, FetchError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FetchError::Failed("empty command".to_string()))?;
    if timeout.is_zero() {
        return Err(FetchError::DeadlineExceeded);
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let mut child = command
        .spawn()
        .map_err(|e| FetchError::Failed(format!("spawn {}: {}", program, e)))?;

    // Drain stdout concurrently so a chatty child cannot block on a full pipe.
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| FetchError::Failed("child stdout unavailable".to_string()))?;
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::debug!(program = %program, "Killed command at timeout");
                    return Err(FetchError::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                return Err(FetchError::Failed(format!("wait {}: {}", program, e)));
            }
        }
    };

    let output = reader.join().unwrap_or_default();
    if !status.success() {
        return Err(FetchError::Failed(format!("{} exited with {}", program, status)));
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}
