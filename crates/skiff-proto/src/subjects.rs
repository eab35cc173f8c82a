//! Subject grammar for the internal bus.
//!
//! Every per-VM subject embeds the `vm_id`; the bus rejects traffic on
//! subjects whose embedded ID does not match the publisher's credential.

use skiff_common::VmId;

/// Broadcast subject a guest may publish on before it has a VM-scoped
/// identity.
pub const HANDSHAKE_BROADCAST: &str = "agentint.handshake";

/// Targeted handshake subject for one VM.
pub fn handshake(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.handshake")
}

/// Node→guest workload deploy request subject.
pub fn deploy(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.deploy")
}

/// Node→guest undeploy request subject.
pub fn undeploy(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.undeploy")
}

/// Node→guest trigger invocation subject.
pub fn trigger(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.trigger")
}

/// Guest→node log stream subject.
pub fn logs(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.logs")
}

/// Guest→node event subject for one event type.
pub fn event(vm_id: &VmId, event_type: &str) -> String {
    format!("agentint.{vm_id}.events.{event_type}")
}

/// Node-side wildcard over one VM's events.
pub fn events_wildcard(vm_id: &VmId) -> String {
    format!("agentint.{vm_id}.events.*")
}

/// Extract the `vm_id` token from a per-VM subject.
///
/// Returns `None` for the broadcast handshake subject or anything that
/// does not parse as a UUID.
pub fn vm_id_of(subject: &str) -> Option<VmId> {
    let token = subject.split('.').nth(1)?;
    token.parse().ok()
}

/// Extract the event type from an `agentint.<vm_id>.events.<type>` subject.
pub fn event_type_of(subject: &str) -> Option<&str> {
    let mut tokens = subject.split('.');
    if tokens.next() != Some("agentint") {
        return None;
    }
    let _vm_id = tokens.next()?;
    if tokens.next() != Some("events") {
        return None;
    }
    tokens.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_shapes() {
        let id = VmId::new();
        assert_eq!(deploy(&id), format!("agentint.{id}.deploy"));
        assert_eq!(logs(&id), format!("agentint.{id}.logs"));
        assert_eq!(event(&id, "workload_exited"), format!("agentint.{id}.events.workload_exited"));
        assert_eq!(events_wildcard(&id), format!("agentint.{id}.events.*"));
    }

    #[test]
    fn test_vm_id_of() {
        let id = VmId::new();
        assert_eq!(vm_id_of(&logs(&id)), Some(id));
        assert_eq!(vm_id_of(HANDSHAKE_BROADCAST), None);
        assert_eq!(vm_id_of("agentint.not-a-uuid.logs"), None);
    }

    #[test]
    fn test_event_type_of() {
        let id = VmId::new();
        assert_eq!(
            event_type_of(&event(&id, "workload_deployed")),
            Some("workload_deployed")
        );
        assert_eq!(event_type_of(&logs(&id)), None);
        assert_eq!(event_type_of("other.subject"), None);
    }
}
