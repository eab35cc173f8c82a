//! Subject grammar and wildcard matching.
//!
//! Subjects are dot-separated token lists. Patterns may use `*` to match
//! exactly one token and a trailing `>` to match one or more remaining
//! tokens.

use skiff_common::VmId;

/// Check whether `subject` matches `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check that a subject or pattern is well-formed: non-empty tokens,
/// `>` only in the final position.
pub fn valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return false;
        }
        if *token == ">" && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

/// True if one of the subject's tokens is the given VM ID.
pub(crate) fn contains_vm_id(subject: &str, vm_id: &VmId) -> bool {
    let id = vm_id.to_string();
    subject.split('.').any(|token| token == id)
}

/// Scope check for guest publishes: per-VM subjects, the handshake
/// broadcast, and reply inboxes (unguessable, request-scoped).
pub(crate) fn guest_may_publish(vm_id: &VmId, subject: &str) -> bool {
    subject == crate::HANDSHAKE_SUBJECT
        || subject.starts_with(crate::INBOX_PREFIX)
        || contains_vm_id(subject, vm_id)
}

/// Scope check for guest subscriptions: per-VM subjects and the
/// handshake broadcast only.
pub(crate) fn guest_may_subscribe(vm_id: &VmId, pattern: &str) -> bool {
    pattern == crate::HANDSHAKE_SUBJECT || contains_vm_id(pattern, vm_id)
}
