//! Event log parsing and RTMR replay.
//!
//! An event log is an ordered JSON sequence of measurement events. Replaying
//! the log reconstructs the expected value of each Runtime Measurement
//! Register: starting from 48 zero bytes, each event extends its register
//! with `rtmr = SHA384(rtmr || digest)`, the same chain a TDX module applies
//! in hardware. Order within a register is significant and not reorderable.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::error::VerificationError;

/// Number of runtime measurement registers.
pub const RTMR_COUNT: usize = 4;
/// Size of an RTMR / SHA-384 digest in bytes.
pub const DIGEST_SIZE: usize = 48;

/// Well-known RTMR3 event names recorded by the measured environment.
pub const EVENT_APP_ID: &str = "app-id";
pub const EVENT_COMPOSE_HASH: &str = "compose-hash";
pub const EVENT_INSTANCE_ID: &str = "instance-id";
pub const EVENT_KEY_PROVIDER: &str = "key-provider";
pub const EVENT_OS_IMAGE_HASH: &str = "os-image-hash";
/// Marker event: payloads after this are no longer trusted boot-time facts.
pub const EVENT_SYSTEM_READY: &str = "system-ready";

/// One entry of the measured event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Register index this event extends, 0..=3.
    pub imr: u32,
    /// Raw event type tag from the measured environment.
    pub event_type: u32,
    /// Hex-encoded SHA-384 digest extended into the register.
    pub digest: String,
    /// Event name; empty for firmware/boot events.
    #[serde(default)]
    pub event: String,
    /// Hex-encoded event payload.
    #[serde(default)]
    pub event_payload: String,
}

/// The replayed expected values of all four registers.
pub type ReplayedRtmrs = [[u8; DIGEST_SIZE]; RTMR_COUNT];

/// Parse a JSON event log blob.
pub fn parse_event_log(bytes: &[u8]) -> Result<Vec<EventLogEntry>, VerificationError> {
    serde_json::from_slice(bytes).map_err(|e| VerificationError::EventLogParse(e.to_string()))
}

/// Replay the event log, reconstructing the expected value of each register.
///
/// Registers are independent: entries are grouped by `imr` and chained in
/// log order. A register with no entries replays to 48 zero bytes. Entries
/// with an out-of-range register index or a digest that is not 48 bytes of
/// hex are malformed input, not a verification failure.
pub fn replay_rtmrs(entries: &[EventLogEntry]) -> Result<ReplayedRtmrs, VerificationError> {
    let mut rtmrs: ReplayedRtmrs = [[0u8; DIGEST_SIZE]; RTMR_COUNT];
    for (pos, entry) in entries.iter().enumerate() {
        let index = entry.imr as usize;
        if index >= RTMR_COUNT {
            return Err(VerificationError::EventLogParse(format!(
                "entry {pos}: register index {} out of range",
                entry.imr
            )));
        }
        let digest = hex::decode(&entry.digest).map_err(|e| {
            VerificationError::EventLogParse(format!("entry {pos}: bad digest hex: {e}"))
        })?;
        if digest.len() != DIGEST_SIZE {
            return Err(VerificationError::EventLogParse(format!(
                "entry {pos}: digest is {} bytes, expected {DIGEST_SIZE}",
                digest.len()
            )));
        }
        let mut hasher = Sha384::new();
        hasher.update(rtmrs[index]);
        hasher.update(&digest);
        rtmrs[index] = hasher.finalize().into();
    }
    Ok(rtmrs)
}

/// Find the payload of a named runtime event.
///
/// Only events recorded before `system-ready` count: anything measured after
/// that point was extended by the running application, not the boot chain.
/// Returns the hex-decoded payload of the first match.
pub fn find_event_payload(
    entries: &[EventLogEntry],
    name: &str,
) -> Result<Option<Vec<u8>>, VerificationError> {
    for entry in entries {
        if entry.event == EVENT_SYSTEM_READY {
            break;
        }
        if entry.event == name {
            let payload = hex::decode(&entry.event_payload).map_err(|e| {
                VerificationError::EventLogParse(format!("{name} payload is not hex: {e}"))
            })?;
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

/// Digest a runtime event the way the measured environment does before
/// extending RTMR3: `SHA384(event_type_le || ":" || event || ":" || payload)`.
pub fn runtime_event_digest(event_type: u32, event: &str, payload: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha384::new();
    hasher.update(event_type.to_le_bytes());
    hasher.update(b":");
    hasher.update(event.as_bytes());
    hasher.update(b":");
    hasher.update(payload);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_entry(imr: u32, digest: [u8; DIGEST_SIZE]) -> EventLogEntry {
        EventLogEntry {
            imr,
            event_type: 0,
            digest: hex::encode(digest),
            event: String::new(),
            event_payload: String::new(),
        }
    }

    fn runtime_entry(event: &str, payload: &[u8]) -> EventLogEntry {
        EventLogEntry {
            imr: 3,
            event_type: 0x0800_0001,
            digest: hex::encode(runtime_event_digest(0x0800_0001, event, payload)),
            event: event.to_string(),
            event_payload: hex::encode(payload),
        }
    }

    #[test]
    fn test_empty_log_replays_to_zero_registers() {
        let rtmrs = replay_rtmrs(&[]).unwrap();
        for rtmr in rtmrs {
            assert_eq!(rtmr, [0u8; DIGEST_SIZE]);
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let entries = vec![
            boot_entry(0, [1; 48]),
            boot_entry(1, [2; 48]),
            boot_entry(0, [3; 48]),
            runtime_entry(EVENT_APP_ID, b"\x01\x02"),
        ];
        assert_eq!(
            replay_rtmrs(&entries).unwrap(),
            replay_rtmrs(&entries).unwrap()
        );
    }

    #[test]
    fn test_replay_order_matters() {
        let forward = vec![boot_entry(2, [1; 48]), boot_entry(2, [2; 48])];
        let reversed = vec![boot_entry(2, [2; 48]), boot_entry(2, [1; 48])];
        assert_ne!(
            replay_rtmrs(&forward).unwrap()[2],
            replay_rtmrs(&reversed).unwrap()[2]
        );
    }

    #[test]
    fn test_single_bit_flip_changes_register() {
        for imr in 0..RTMR_COUNT as u32 {
            let entries = vec![boot_entry(imr, [0x55; 48])];
            let baseline = replay_rtmrs(&entries).unwrap();

            let mut digest = [0x55u8; 48];
            digest[7] ^= 0x01;
            let tampered = vec![boot_entry(imr, digest)];
            let replayed = replay_rtmrs(&tampered).unwrap();

            assert_ne!(baseline[imr as usize], replayed[imr as usize]);
            // Other registers are untouched.
            for other in 0..RTMR_COUNT {
                if other != imr as usize {
                    assert_eq!(replayed[other], [0u8; DIGEST_SIZE]);
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_register_rejected() {
        let entries = vec![boot_entry(4, [0; 48])];
        assert!(matches!(
            replay_rtmrs(&entries).unwrap_err(),
            VerificationError::EventLogParse(_)
        ));
    }

    #[test]
    fn test_short_digest_rejected() {
        let entries = vec![EventLogEntry {
            imr: 0,
            event_type: 0,
            digest: "aabb".into(),
            event: String::new(),
            event_payload: String::new(),
        }];
        assert!(matches!(
            replay_rtmrs(&entries).unwrap_err(),
            VerificationError::EventLogParse(_)
        ));
    }

    #[test]
    fn test_find_event_payload_stops_at_system_ready() {
        let entries = vec![
            runtime_entry(EVENT_APP_ID, b"\xaa\xbb"),
            runtime_entry(EVENT_SYSTEM_READY, b""),
            runtime_entry(EVENT_COMPOSE_HASH, b"\xcc"),
        ];
        assert_eq!(
            find_event_payload(&entries, EVENT_APP_ID).unwrap(),
            Some(vec![0xaa, 0xbb])
        );
        // Recorded after system-ready: not trusted, not found.
        assert_eq!(
            find_event_payload(&entries, EVENT_COMPOSE_HASH).unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_event_log_json() {
        let json = r#"[
            {"imr": 0, "event_type": 1, "digest": "00", "event": "", "event_payload": ""},
            {"imr": 3, "event_type": 134217729, "digest": "ff", "event": "app-id", "event_payload": "aabb"}
        ]"#;
        let entries = parse_event_log(json.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, "app-id");

        assert!(parse_event_log(b"not json").is_err());
    }
}
