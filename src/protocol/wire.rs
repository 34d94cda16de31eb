//! Wire vocabulary: roles, routing, handshake and command tokens
//!
//! The wire format is deliberately unframed. A connection's first read is the
//! identity token, every later read is one opaque payload, and message
//! boundaries are whatever a single read call returns. That holds only for
//! short, infrequent exchanges and is an explicit invariant of this protocol,
//! not an accident; payloads are bounded by [`MAX_PAYLOAD`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on a single wire payload (and the receive buffer size)
pub const MAX_PAYLOAD: usize = 4096;

/// Literal acknowledgement sent by the broker after a successful handshake
pub const ACK: &str = "CONNECTED";

// ─────────────────────────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────────────────────────

/// A fixed logical participant identity, bound to at most one live
/// connection at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Weather source: fetches reports and answers city queries
    Provider,
    /// Operator terminal: sends city updates, receives reports
    Console,
    /// Field endpoint: receives reports and actuator commands
    Device,
}

impl Role {
    /// All roles, in presence-notice order (Console before Device)
    pub const ALL: [Role; 3] = [Role::Provider, Role::Console, Role::Device];

    /// The identity token this role sends during the handshake
    pub fn token(&self) -> &'static str {
        match self {
            Role::Provider => "PROVIDER",
            Role::Console => "CONSOLE",
            Role::Device => "DEVICE",
        }
    }

    /// Match a handshake payload to a role by substring, mirroring the
    /// relaxed matching clients have historically relied on (extra bytes
    /// around the token are tolerated).
    pub fn from_token(payload: &str) -> Option<Role> {
        // Presence notices contain role tokens too; a handshake payload is
        // never a notice, so plain substring match is safe here.
        Role::ALL
            .iter()
            .copied()
            .find(|role| payload.contains(role.token()))
    }

    /// The presence notice the broker sends to the provider for this role
    pub fn presence_notice(&self) -> String {
        format!("{}_CONNECTED", self.token())
    }

    /// Parse an exact presence-notice payload back to the role it announces
    pub fn from_presence_notice(payload: &str) -> Option<Role> {
        let token = payload.trim().strip_suffix("_CONNECTED")?;
        Role::ALL.iter().copied().find(|role| role.token() == token)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

// ─────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────

/// Static routing graph: which roles receive a sender's payloads.
///
/// Directional and asymmetric; never mutated at runtime. The provider's
/// reports fan out to console and device, the console's queries go to the
/// provider, and the device's messages reach the console.
pub struct RoutingTable;

impl RoutingTable {
    /// Forwarding targets for payloads originating at `from`
    pub fn targets(from: Role) -> &'static [Role] {
        match from {
            Role::Provider => &[Role::Console, Role::Device],
            Role::Console => &[Role::Provider],
            Role::Device => &[Role::Console],
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Actuator Commands
// ─────────────────────────────────────────────────────────────────

/// Recognized actuator control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorCommand {
    LedOn,
    LedOff,
    BuzzerOn,
    BuzzerOff,
}

impl ActuatorCommand {
    /// Canonical wire token for this command
    pub fn token(&self) -> &'static str {
        match self {
            ActuatorCommand::LedOn => "LED_ON",
            ActuatorCommand::LedOff => "LED_OFF",
            ActuatorCommand::BuzzerOn => "BUZZER_ON",
            ActuatorCommand::BuzzerOff => "BUZZER_OFF",
        }
    }

    /// Match a payload to a command by substring, upper or lower case.
    ///
    /// The OFF variants are checked before the ON variants: "LED_OFF"
    /// contains no "LED_ON", but checking ON first would still be wrong for
    /// payloads carrying both, and OFF-first matches the safer action.
    pub fn from_payload(payload: &str) -> Option<ActuatorCommand> {
        const VOCABULARY: [(ActuatorCommand, &str, &str); 4] = [
            (ActuatorCommand::LedOff, "LED_OFF", "led_off"),
            (ActuatorCommand::LedOn, "LED_ON", "led_on"),
            (ActuatorCommand::BuzzerOff, "BUZZER_OFF", "buzzer_off"),
            (ActuatorCommand::BuzzerOn, "BUZZER_ON", "buzzer_on"),
        ];

        VOCABULARY
            .iter()
            .find(|(_, upper, lower)| payload.contains(upper) || payload.contains(lower))
            .map(|(cmd, _, _)| *cmd)
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_token_roundtrip() {
        for role in Role::ALL {
            assert_eq!(Role::from_token(role.token()), Some(role));
        }
    }

    #[test]
    fn test_role_substring_match() {
        assert_eq!(Role::from_token("DEVICE v2\n"), Some(Role::Device));
        assert_eq!(Role::from_token("hello PROVIDER"), Some(Role::Provider));
        assert_eq!(Role::from_token("CLIENT_X"), None);
        assert_eq!(Role::from_token(""), None);
    }

    #[test]
    fn test_presence_notice_roundtrip() {
        assert_eq!(Role::Console.presence_notice(), "CONSOLE_CONNECTED");
        assert_eq!(
            Role::from_presence_notice("DEVICE_CONNECTED"),
            Some(Role::Device)
        );
        // The bare ack is not a presence notice
        assert_eq!(Role::from_presence_notice(ACK), None);
        assert_eq!(Role::from_presence_notice("SOMETHING_CONNECTED"), None);
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(
            RoutingTable::targets(Role::Provider),
            &[Role::Console, Role::Device]
        );
        assert_eq!(RoutingTable::targets(Role::Console), &[Role::Provider]);
        assert_eq!(RoutingTable::targets(Role::Device), &[Role::Console]);
    }

    #[test]
    fn test_routing_is_asymmetric() {
        // Device sends to console but console never sends to device directly
        assert!(RoutingTable::targets(Role::Device).contains(&Role::Console));
        assert!(!RoutingTable::targets(Role::Console).contains(&Role::Device));
    }

    #[test]
    fn test_command_vocabulary() {
        assert_eq!(
            ActuatorCommand::from_payload("LED_ON"),
            Some(ActuatorCommand::LedOn)
        );
        assert_eq!(
            ActuatorCommand::from_payload("please led_off now"),
            Some(ActuatorCommand::LedOff)
        );
        assert_eq!(
            ActuatorCommand::from_payload("BUZZER_OFF\n"),
            Some(ActuatorCommand::BuzzerOff)
        );
        assert_eq!(ActuatorCommand::from_payload("VALVE_ON"), None);
    }

    #[test]
    fn test_command_off_takes_priority() {
        // LED_OFF does not contain LED_ON, but a combined payload resolves
        // to the OFF action
        assert_eq!(
            ActuatorCommand::from_payload("LED_ON LED_OFF"),
            Some(ActuatorCommand::LedOff)
        );
    }
}
