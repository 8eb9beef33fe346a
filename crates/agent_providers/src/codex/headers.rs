use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

pub const HEADER_SESSION_ID: &str = "session_id";
pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_ACCOUNT_ID: &str = "chatgpt-account-id";
pub const HEADER_OPENAI_BETA: &str = "OpenAI-Beta";
pub const HEADER_ORIGINATOR: &str = "originator";
pub const HEADER_USER_AGENT: &str = "User-Agent";

pub const ORIGINATOR: &str = "pi";
pub const RESPONSES_BETA: &str = "responses=experimental";
/// Beta flag the socket handshake sends in place of [`RESPONSES_BETA`].
pub const WEBSOCKET_BETA: &str = "responses_websockets=2026-02-06";

/// Header map for one Codex request.
///
/// `extra` is applied after the fixed headers and may replace them; the
/// session header is always last so it reflects the call's session.
pub fn build_headers(
    token: &str,
    account_id: &str,
    session_id: Option<&str>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        HEADER_AUTHORIZATION.to_owned(),
        format!("Bearer {}", token.trim()),
    );
    headers.insert(HEADER_ACCOUNT_ID.to_owned(), account_id.to_owned());
    headers.insert(HEADER_OPENAI_BETA.to_owned(), RESPONSES_BETA.to_owned());
    headers.insert(HEADER_ORIGINATOR.to_owned(), ORIGINATOR.to_owned());
    headers.insert(HEADER_USER_AGENT.to_owned(), default_pi_user_agent());
    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    for (key, value) in extra {
        headers.retain(|name, _| !name.eq_ignore_ascii_case(key));
        headers.insert(key.clone(), value.trim().to_owned());
    }

    if let Some(session_id) = session_id.map(str::trim).filter(|id| !id.is_empty()) {
        headers.insert(HEADER_SESSION_ID.to_owned(), session_id.to_owned());
    }

    headers
}

/// Reads the ChatGPT account id from the token's JWT claims.
pub fn extract_account_id(token: &str) -> Option<String> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return None;
    };

    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| general_purpose::URL_SAFE.decode(payload))
        .ok()?;
    let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
    let account = claims.openai_auth?.chatgpt_account_id?;
    let account = account.trim();
    (!account.is_empty()).then(|| account.to_owned())
}

/// `pi (<platform> <release>; <arch>)`, or `pi (browser)` when the host is unknown.
pub fn default_pi_user_agent() -> String {
    host_identity().map_or_else(
        || "pi (browser)".to_owned(),
        |host| format!("pi ({} {}; {})", host.platform, host.release, host.arch),
    )
}

struct HostIdentity {
    platform: String,
    release: String,
    arch: String,
}

/// Node-style architecture name.
fn node_arch(machine: &str) -> String {
    let machine = machine.to_ascii_lowercase();
    let mapped = match machine.as_str() {
        "x86_64" | "amd64" => "x64",
        "x86" | "i386" | "i686" => "ia32",
        "aarch64" => "arm64",
        other => other,
    };
    mapped.to_owned()
}

#[cfg(unix)]
fn host_identity() -> Option<HostIdentity> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    fn field(raw: &[libc::c_char]) -> String {
        // SAFETY: utsname fields are NUL-terminated within their fixed buffers.
        unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    let mut uts = MaybeUninit::<libc::utsname>::uninit();
    // SAFETY: uname fills the struct when it returns 0, checked before reading.
    if unsafe { libc::uname(uts.as_mut_ptr()) } != 0 {
        return None;
    }
    // SAFETY: initialized by the successful call above.
    let uts = unsafe { uts.assume_init() };

    let host = HostIdentity {
        platform: field(&uts.sysname).to_lowercase(),
        release: field(&uts.release),
        arch: node_arch(&field(&uts.machine)),
    };
    let complete = [&host.platform, &host.release, &host.arch]
        .iter()
        .all(|part| !part.is_empty());
    complete.then_some(host)
}

#[cfg(not(unix))]
fn host_identity() -> Option<HostIdentity> {
    None
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "https://api.openai.com/auth")]
    openai_auth: Option<OpenAiAuthClaims>,
}

#[derive(Debug, Deserialize)]
struct OpenAiAuthClaims {
    #[serde(default)]
    chatgpt_account_id: Option<String>,
}
