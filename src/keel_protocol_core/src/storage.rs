//! CBOR persistence of the event log.

use crate::event::Event;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    Encode(String),
    Decode(String),
}

pub fn encode_event_log(events: &[Event]) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(&events, &mut buffer)
        .map_err(|e| StorageError::Encode(e.to_string()))?;
    Ok(buffer)
}

pub fn decode_event_log(bytes: &[u8]) -> Result<Vec<Event>, StorageError> {
    ciborium::de::from_reader(bytes).map_err(|e| StorageError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::numeric::{Collateral, KUSD, E18};
    use candid::Principal;

    #[test]
    fn event_log_round_trips_through_cbor() {
        let events = vec![
            Event::SetMode {
                mode: crate::state::Mode::GeneralAvailability,
            },
            Event::OpenVault {
                vault_id: 7,
                owner: Principal::from_slice(&[1, 2, 3]),
                collateral_type: Principal::from_slice(&[9; 4]),
                composite_debt: KUSD::new(2_200 * E18),
                collateral: Collateral::new(3 * E18),
                prev_hint: None,
                next_hint: Some(4),
                timestamp: 1_000,
            },
        ];
        let bytes = encode_event_log(&events).unwrap();
        assert_eq!(decode_event_log(&bytes).unwrap(), events);
    }
}
