//! Managed pluggable transport configuration (pt-spec v1, client side).
//!
//! The parent Tor process speaks to us through environment variables and
//! reads single-line replies from stdout: `VERSION`, `CMETHOD`,
//! `CMETHOD-ERROR`, `CMETHODS DONE`, `ENV-ERROR`, `VERSION-ERROR`.  Input
//! is environment only; there is nothing to read from stdin.

use std::env;
use std::fs::DirBuilder;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use tracing::debug;

use crate::transport::Transport;
use crate::{Error, Result};

const MANAGED_VER: &str = "1";

/// Client-side PT configuration read from the environment.
///
/// To decide whether a program should run as a PT client or server, check
/// `TOR_PT_CLIENT_TRANSPORTS`; this dispatcher only supports the client
/// role and treats a server request as a configuration error.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    /// Transport method names the parent asked for, unfiltered.
    pub methods: Vec<String>,
    /// Writable state directory, created `0700` if absent.
    pub state_dir: PathBuf,
}

impl ClientInfo {
    /// Interprets the PT environment, emitting the protocol error lines on
    /// stdout before returning failure.
    pub fn from_env() -> Result<Self> {
        let is_client = env::var_os("TOR_PT_CLIENT_TRANSPORTS").is_some();
        let is_server = env::var_os("TOR_PT_SERVER_TRANSPORTS").is_some();
        match (is_client, is_server) {
            (true, true) => {
                return Err(env_error(
                    "TOR_PT_[CLIENT,SERVER]_TRANSPORTS both set",
                ))
            }
            (false, true) => return Err(env_error("server role not supported")),
            (false, false) => {
                return Err(env_error("not launched as a managed transport"))
            }
            (true, false) => {}
        }

        let ver = env::var("TOR_PT_MANAGED_TRANSPORT_VER").unwrap_or_default();
        if !ver.split(',').any(|v| v == MANAGED_VER) {
            emit("VERSION-ERROR no-version");
            return Err(Error::Config(format!(
                "no compatible managed transport version in '{ver}'"
            )));
        }
        emit(&format!("VERSION {MANAGED_VER}"));

        let raw_methods = env::var("TOR_PT_CLIENT_TRANSPORTS")
            .map_err(|_| env_error("TOR_PT_CLIENT_TRANSPORTS unreadable"))?;
        let methods: Vec<String> = if raw_methods == "*" {
            Transport::supported()
                .iter()
                .map(|t| t.name().to_string())
                .collect()
        } else {
            raw_methods
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        };
        if methods.is_empty() {
            return Err(env_error("no transports requested"));
        }

        let state_dir = match env::var("TOR_PT_STATE_LOCATION") {
            Ok(p) => PathBuf::from(p),
            Err(_) => return Err(env_error("missing TOR_PT_STATE_LOCATION")),
        };
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&state_dir)
            .map_err(|e| env_error(&format!("cannot create state directory: {e}")))?;

        debug!("managed transport config: {methods:?}");

        Ok(ClientInfo { methods, state_dir })
    }
}

fn env_error(reason: &str) -> Error {
    emit(&format!("ENV-ERROR {reason}"));
    Error::Config(reason.to_string())
}

/// Reports a successfully bound listener for `name`.
pub fn report_cmethod(name: &str, addr: SocketAddr) {
    emit(&format!("CMETHOD {name} socks5 {addr}"));
}

/// Reports a method that could not be set up; the remaining methods are
/// unaffected.
pub fn report_cmethod_error(name: &str, reason: &str) {
    emit(&format!("CMETHOD-ERROR {name} {reason}"));
}

/// Signals that every requested method has been reported one way or the
/// other.
pub fn report_methods_done() {
    emit("CMETHODS DONE");
}

// The parent reads stdout line-wise; flush so lines are not sat on by the
// stdio buffering when stdout is a pipe.
fn emit(line: &str) {
    let mut out = std::io::stdout();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so every combination lives in
    // one test body.
    #[test]
    fn env_combinations() {
        let statedir = std::env::temp_dir().join("obfsclient-pt-test");

        // Missing everything: not a managed launch.
        env::remove_var("TOR_PT_CLIENT_TRANSPORTS");
        env::remove_var("TOR_PT_SERVER_TRANSPORTS");
        env::remove_var("TOR_PT_MANAGED_TRANSPORT_VER");
        env::remove_var("TOR_PT_STATE_LOCATION");
        assert!(matches!(ClientInfo::from_env(), Err(Error::Config(_))));

        // Server role is refused.
        env::set_var("TOR_PT_SERVER_TRANSPORTS", "obfs2");
        assert!(ClientInfo::from_env().is_err());
        env::remove_var("TOR_PT_SERVER_TRANSPORTS");

        // Unsupported managed version.
        env::set_var("TOR_PT_CLIENT_TRANSPORTS", "obfs2");
        env::set_var("TOR_PT_MANAGED_TRANSPORT_VER", "2");
        assert!(ClientInfo::from_env().is_err());

        // Missing state dir.
        env::set_var("TOR_PT_MANAGED_TRANSPORT_VER", "1,2");
        assert!(ClientInfo::from_env().is_err());

        // Fully specified.
        env::set_var("TOR_PT_STATE_LOCATION", &statedir);
        let info = ClientInfo::from_env().unwrap();
        assert_eq!(info.methods, vec!["obfs2".to_string()]);
        assert!(info.state_dir.is_dir());

        // Wildcard expands to every supported transport.
        env::set_var("TOR_PT_CLIENT_TRANSPORTS", "*");
        let info = ClientInfo::from_env().unwrap();
        assert_eq!(info.methods, vec!["obfs2", "obfs3", "scramblesuit"]);

        // Unknown methods pass through for per-method error reporting.
        env::set_var("TOR_PT_CLIENT_TRANSPORTS", "obfs2,trebuchet");
        let info = ClientInfo::from_env().unwrap();
        assert_eq!(info.methods, vec!["obfs2", "trebuchet"]);

        env::remove_var("TOR_PT_CLIENT_TRANSPORTS");
        env::remove_var("TOR_PT_MANAGED_TRANSPORT_VER");
        env::remove_var("TOR_PT_STATE_LOCATION");
    }
}
