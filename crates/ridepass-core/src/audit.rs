//! Security audit trail
//!
//! Events go to the `audit` tracing target so deployments can route them
//! separately. Client addresses are coarsened and user agents truncated before
//! they are logged; tokens and credentials never are.

use ridepass_db::ClientMeta;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::info;
use uuid::Uuid;

/// Longest user agent prefix kept in the audit trail, in characters
pub const MAX_USER_AGENT_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Register,
    Login,
    Refresh,
    Logout,
    LogoutEverywhere,
    ConfirmEmail,
    PasswordResetRequest,
    PasswordReset,
    PasswordChange,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Register => "register",
            AuditEvent::Login => "login",
            AuditEvent::Refresh => "refresh",
            AuditEvent::Logout => "logout",
            AuditEvent::LogoutEverywhere => "logout_everywhere",
            AuditEvent::ConfirmEmail => "confirm_email",
            AuditEvent::PasswordResetRequest => "password_reset_request",
            AuditEvent::PasswordReset => "password_reset",
            AuditEvent::PasswordChange => "password_change",
        }
    }
}

/// Zero the host part of an address: last octet for IPv4, last 80 bits for IPv6
pub fn redact_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            IpAddr::V6(Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0))
        }
    }
}

pub fn truncate_user_agent(user_agent: &str) -> &str {
    match user_agent.char_indices().nth(MAX_USER_AGENT_CHARS) {
        Some((idx, _)) => &user_agent[..idx],
        None => user_agent,
    }
}

/// Emit one audit event
pub fn record(event: AuditEvent, user_id: Option<Uuid>, success: bool, meta: &ClientMeta) {
    let user_id = user_id.map(|id| id.to_string()).unwrap_or_default();
    let ip = meta
        .ip
        .map(|ip| redact_ip(ip).to_string())
        .unwrap_or_default();
    let user_agent = meta
        .user_agent
        .as_deref()
        .map(truncate_user_agent)
        .unwrap_or_default();

    info!(
        target: "audit",
        event = event.as_str(),
        user_id = %user_id,
        success,
        ip = %ip,
        user_agent = %user_agent,
        "security event"
    );
}
