//! Static operation registry used for `help` and the service version.

use pody_common::error::{PodyError, Result};
use pody_common::types::Version;
use serde::Serialize;

/// One parameter of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamHelp {
    /// Parameter name.
    pub name: &'static str,
    /// Whether the parameter may be omitted.
    pub optional: bool,
}

/// One operation exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteHelp {
    /// Operation path, e.g. `/pod/create`.
    pub path: &'static str,
    /// Accepted methods.
    pub methods: &'static [&'static str],
    /// Parameters.
    pub params: &'static [ParamHelp],
}

const fn req(name: &'static str) -> ParamHelp {
    ParamHelp { name, optional: false }
}

const fn opt(name: &'static str) -> ParamHelp {
    ParamHelp { name, optional: true }
}

const GET: &[&str] = &["GET"];
const POST: &[&str] = &["POST"];

/// Every operation, ordered by path.
pub const ROUTES: &[RouteHelp] = &[
    RouteHelp { path: "/help", methods: GET, params: &[opt("path")] },
    RouteHelp { path: "/host/gpu-ps", methods: GET, params: &[opt("id")] },
    RouteHelp { path: "/host/spec", methods: GET, params: &[] },
    RouteHelp { path: "/image/delete", methods: POST, params: &[req("image")] },
    RouteHelp { path: "/image/inspect", methods: GET, params: &[req("image")] },
    RouteHelp { path: "/image/list", methods: GET, params: &[] },
    RouteHelp { path: "/pod/commit", methods: POST, params: &[req("ins"), opt("tag"), opt("msg")] },
    RouteHelp {
        path: "/pod/create",
        methods: POST,
        params: &[req("ins"), req("image"), opt("gpus"), opt("memory"), opt("shm"), opt("storage")],
    },
    RouteHelp { path: "/pod/delete", methods: POST, params: &[req("ins")] },
    RouteHelp { path: "/pod/exec", methods: POST, params: &[req("ins"), req("cmd"), opt("timeout")] },
    RouteHelp { path: "/pod/inspect", methods: GET, params: &[req("ins")] },
    RouteHelp { path: "/pod/list", methods: GET, params: &[opt("user")] },
    RouteHelp { path: "/pod/restart", methods: POST, params: &[req("ins")] },
    RouteHelp { path: "/pod/start", methods: POST, params: &[req("ins")] },
    RouteHelp { path: "/pod/stop", methods: POST, params: &[req("ins")] },
    RouteHelp { path: "/stat/cputime", methods: GET, params: &[opt("users"), opt("since")] },
    RouteHelp { path: "/stat/gputime", methods: GET, params: &[opt("users"), opt("since")] },
    RouteHelp { path: "/user/ch-passwd", methods: POST, params: &[req("passwd")] },
    RouteHelp { path: "/user/info", methods: GET, params: &[opt("user")] },
    RouteHelp { path: "/user/list", methods: GET, params: &[] },
    RouteHelp { path: "/user/usage", methods: GET, params: &[opt("user")] },
    RouteHelp { path: "/version", methods: GET, params: &[] },
];

/// Operations whose path starts with `path`. An empty path or `/` lists
/// everything.
///
/// # Errors
///
/// Returns `NotFound` when no operation matches.
pub fn help(path: &str) -> Result<Vec<RouteHelp>> {
    let path = path.trim();
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let matches: Vec<RouteHelp> = ROUTES
        .iter()
        .filter(|r| r.path.starts_with(normalized.as_str()))
        .copied()
        .collect();
    if matches.is_empty() {
        return Err(PodyError::NotFound {
            kind: "route",
            id: normalized,
        });
    }
    Ok(matches)
}

/// Version of this build.
#[must_use]
pub fn version() -> Version {
    let part = |s: &str| -> u32 { s.parse().unwrap_or(0) };
    Version {
        major: part(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: part(env!("CARGO_PKG_VERSION_MINOR")),
        patch: part(env!("CARGO_PKG_VERSION_PATCH")),
    }
}
