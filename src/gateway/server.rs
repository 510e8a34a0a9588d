use anyhow::{Context, Result, bail};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{GatewayRequest, GatewayResult, process};
use crate::config::{GatewaySection, expand_user};

pub const MAX_CONTENT_LENGTH: usize = 1_048_576;
pub const MAX_TIMEOUT: u64 = 600;

/// A named, allowlisted binding from a logical capability to permitted
/// command basenames and working-directory prefixes. Prefixes are resolved
/// to real paths once, at load time.
#[derive(Debug, Clone)]
pub struct BridgeDefinition {
    pub allowed_commands: HashSet<String>,
    pub allowed_cwd: Vec<PathBuf>,
}

impl BridgeDefinition {
    pub fn resolve(section: &crate::config::BridgeSection) -> Self {
        let mut allowed_cwd = Vec::new();
        for raw in &section.allowed_cwd {
            let expanded = expand_user(raw);
            match std::fs::canonicalize(&expanded) {
                Ok(real) => allowed_cwd.push(real),
                Err(e) => warn!("Skipping unresolvable allowed_cwd '{}': {}", raw, e),
            }
        }
        Self {
            allowed_commands: section.allowed_commands.iter().cloned().collect(),
            allowed_cwd,
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    token: Arc<str>,
    bridges: Arc<HashMap<String, BridgeDefinition>>,
    default_timeout: u64,
    strip_env: Arc<Vec<String>>,
}

/// Authenticated HTTP command executor. No business logic beyond allowlist
/// enforcement: authenticate, validate, spawn, respond.
pub struct GatewayServer {
    state: GatewayState,
    port: u16,
}

impl GatewayServer {
    /// Build the server from config. A missing token is a startup error —
    /// the gateway never serves unauthenticated.
    pub fn from_config(section: &GatewaySection) -> Result<Self> {
        let token = match &section.token {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => bail!(
                "gateway.token is not set. The gateway requires authentication \
                 to prevent unauthorized access."
            ),
        };
        let bridges: HashMap<String, BridgeDefinition> = section
            .bridges
            .iter()
            .map(|(name, b)| (name.clone(), BridgeDefinition::resolve(b)))
            .collect();
        Ok(Self {
            state: GatewayState {
                token: token.into(),
                bridges: Arc::new(bridges),
                default_timeout: section.default_timeout,
                strip_env: Arc::new(section.strip_env.clone()),
            },
            port: section.port,
        })
    }

    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let execute_routes = Router::new()
            .route("/execute", post(execute_endpoint))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .layer(DefaultBodyLimit::max(MAX_CONTENT_LENGTH));
        Router::new()
            .route("/health", get(health_endpoint))
            .merge(execute_routes)
            .with_state(state)
    }

    pub async fn serve(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let mut names: Vec<&str> = self.state.bridges.keys().map(String::as_str).collect();
        names.sort_unstable();
        info!("Host gateway on {}", addr);
        info!("Bridges: {}", if names.is_empty() { "(none)".to_string() } else { names.join(", ") });
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding gateway on {}", addr))?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down gateway...");
            })
            .await
            .context("gateway server error")?;
        Ok(())
    }
}

/// Hash both sides before comparing so the equality check's timing does not
/// depend on where the strings diverge.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

async fn require_auth(
    State(state): State<GatewayState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = format!("Bearer {}", state.token);
    if constant_time_eq(provided, &expected) {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

fn error_response(status: StatusCode, message: impl AsRef<str>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.as_ref() })),
    )
        .into_response()
}

async fn health_endpoint(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let mut names: Vec<&str> = state.bridges.keys().map(String::as_str).collect();
    names.sort_unstable();
    Json(serde_json::json!({ "status": "ok", "bridges": names }))
}

/// Validate bridge and command basename. Returns the bridge definition on
/// success, or the HTTP status and error message to send back.
pub fn validate_request<'a>(
    req: &GatewayRequest,
    bridges: &'a HashMap<String, BridgeDefinition>,
) -> Result<&'a BridgeDefinition, (StatusCode, String)> {
    if req.bridge.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing 'bridge' field".into()));
    }
    let Some(bridge) = bridges.get(&req.bridge) else {
        let mut known: Vec<&str> = bridges.keys().map(String::as_str).collect();
        known.sort_unstable();
        return Err((
            StatusCode::FORBIDDEN,
            format!("unknown bridge: {} (known: {})", req.bridge, known.join(", ")),
        ));
    };
    let Some(first) = req.cmd.first() else {
        return Err((StatusCode::BAD_REQUEST, "missing cmd".into()));
    };
    // Basename-only check: "foo/../bar/evil" is judged as "evil".
    let basename = Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if basename.is_empty() || !bridge.allowed_commands.contains(&basename) {
        return Err((
            StatusCode::FORBIDDEN,
            format!(
                "command '{}' not allowed for bridge '{}'",
                basename, req.bridge
            ),
        ));
    }
    Ok(bridge)
}

/// Resolve and check a requested working directory. `None` means no check.
/// A supplied cwd must real-path-resolve to a descendant of (or equal to)
/// one of the bridge's allowed prefixes; an empty prefix list forbids any
/// supplied cwd.
pub fn validate_cwd(
    cwd: Option<&str>,
    bridge_name: &str,
    bridge: &BridgeDefinition,
) -> Result<Option<PathBuf>, String> {
    let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if bridge.allowed_cwd.is_empty() {
        return Err(format!(
            "cwd not allowed for bridge '{}' (no allowed_cwd configured)",
            bridge_name
        ));
    }
    let real = std::fs::canonicalize(expand_user(cwd))
        .map_err(|_| format!("cwd not allowed for bridge '{}'", bridge_name))?;
    if bridge.allowed_cwd.iter().any(|p| real.starts_with(p)) {
        Ok(Some(real))
    } else {
        Err(format!(
            "cwd not allowed for bridge '{}': '{}' is outside every allowed directory",
            bridge_name, cwd
        ))
    }
}

/// Clamp the requested timeout: absent falls back to the configured default,
/// 0 means no limit, positive values cap at [`MAX_TIMEOUT`].
pub fn clamp_timeout(requested: Option<u64>, default: u64) -> u64 {
    match requested {
        None => default,
        Some(0) => 0,
        Some(secs) => secs.min(MAX_TIMEOUT),
    }
}

async fn execute_endpoint(State(state): State<GatewayState>, body: Bytes) -> Response {
    let req: GatewayRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON"),
    };

    let bridge = match validate_request(&req, &state.bridges) {
        Ok(bridge) => bridge,
        Err((status, message)) => {
            info!("Rejected execute for bridge '{}': {}", req.bridge, message);
            return error_response(status, message);
        }
    };

    let cwd = match validate_cwd(req.cwd.as_deref(), &req.bridge, bridge) {
        Ok(cwd) => cwd,
        Err(message) => {
            info!("Rejected execute for bridge '{}': {}", req.bridge, message);
            return error_response(StatusCode::FORBIDDEN, message);
        }
    };

    let timeout = clamp_timeout(req.timeout, state.default_timeout);

    match process::run_command(&req.cmd, cwd.as_deref(), timeout, &state.strip_env).await {
        Ok(outcome) => Json(GatewayResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            returncode: outcome.returncode,
            error: String::new(),
        })
        .into_response(),
        Err(e) => {
            warn!("Subprocess spawn failed for bridge '{}': {:#}", req.bridge, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridges_with(name: &str, commands: &[&str], cwd: Vec<PathBuf>) -> HashMap<String, BridgeDefinition> {
        let mut map = HashMap::new();
        map.insert(
            name.to_string(),
            BridgeDefinition {
                allowed_commands: commands.iter().map(|s| s.to_string()).collect(),
                allowed_cwd: cwd,
            },
        );
        map
    }

    fn request(bridge: &str, cmd: &[&str]) -> GatewayRequest {
        GatewayRequest {
            bridge: bridge.to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            timeout: None,
        }
    }

    #[test]
    fn unknown_bridge_is_forbidden() {
        let bridges = bridges_with("notes", &["memo"], vec![]);
        let err = validate_request(&request("spotify", &["spogo"]), &bridges).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
        assert!(err.1.contains("unknown bridge"));
        assert!(err.1.contains("notes"));
    }

    #[test]
    fn empty_cmd_is_bad_request() {
        let bridges = bridges_with("notes", &["memo"], vec![]);
        let err = validate_request(&request("notes", &[]), &bridges).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn traversal_path_is_judged_by_basename() {
        let bridges = bridges_with("notes", &["memo"], vec![]);
        assert!(validate_request(&request("notes", &["foo/../bar/evil"]), &bridges).is_err());
        assert!(validate_request(&request("notes", &["/usr/local/bin/memo"]), &bridges).is_ok());
    }

    #[test]
    fn supplied_cwd_with_empty_allowlist_is_rejected() {
        let bridge = BridgeDefinition {
            allowed_commands: HashSet::new(),
            allowed_cwd: vec![],
        };
        assert!(validate_cwd(Some("/tmp"), "notes", &bridge).is_err());
        assert_eq!(validate_cwd(None, "notes", &bridge).unwrap(), None);
    }

    #[test]
    fn symlinked_cwd_outside_prefix_is_rejected() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let allowed_real = std::fs::canonicalize(allowed.path()).unwrap();
        let link = allowed.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let bridge = BridgeDefinition {
            allowed_commands: HashSet::new(),
            allowed_cwd: vec![allowed_real.clone()],
        };
        let err = validate_cwd(Some(link.to_str().unwrap()), "code", &bridge).unwrap_err();
        assert!(err.contains("cwd not allowed"));

        let inside = allowed.path().join("project");
        std::fs::create_dir(&inside).unwrap();
        let ok = validate_cwd(Some(inside.to_str().unwrap()), "code", &bridge).unwrap();
        assert_eq!(ok.unwrap(), allowed_real.join("project"));
    }

    #[test]
    fn dotdot_cwd_resolves_before_the_check() {
        let allowed = tempfile::tempdir().unwrap();
        let allowed_real = std::fs::canonicalize(allowed.path()).unwrap();
        let bridge = BridgeDefinition {
            allowed_commands: HashSet::new(),
            allowed_cwd: vec![allowed_real.clone()],
        };
        let sneaky = format!("{}/../..", allowed.path().display());
        assert!(validate_cwd(Some(&sneaky), "code", &bridge).is_err());
    }

    #[test]
    fn timeout_clamping_rules() {
        assert_eq!(clamp_timeout(None, 30), 30);
        assert_eq!(clamp_timeout(Some(0), 30), 0);
        assert_eq!(clamp_timeout(Some(601), 30), 600);
        assert_eq!(clamp_timeout(Some(600), 30), 600);
        assert_eq!(clamp_timeout(Some(5), 30), 5);
    }

    #[test]
    fn token_comparison_accepts_exact_match_only() {
        assert!(constant_time_eq("Bearer abc", "Bearer abc"));
        assert!(!constant_time_eq("Bearer abc", "Bearer abd"));
        assert!(!constant_time_eq("", "Bearer abc"));
    }
}
