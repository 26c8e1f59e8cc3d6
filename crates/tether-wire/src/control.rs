//! Control actions every exported object answers, handled by the
//! connection rather than by the object's own dispatch table.
//!
//! Their ids live below [`tether_types::FIRST_USER_ID`] so they never
//! collide with user actions.

use tether_types::{ActionId, Signature};

/// `subscribe(member: u32) -> link: u64`
pub const SUBSCRIBE: ActionId = 1;
/// `unsubscribe(link: u64)`
pub const UNSUBSCRIBE: ActionId = 2;
/// `property(id: u32) -> m`
pub const GET_PROPERTY: ActionId = 3;
/// `setProperty(id: u32, value: m)`
pub const SET_PROPERTY: ActionId = 4;
/// `emit(signal: u32, payload: [m])`
pub const EMIT: ActionId = 5;

/// Parameter and return signatures of a control action.
pub fn signatures(action: ActionId) -> Option<(Signature, Signature)> {
    let (params, returns) = match action {
        SUBSCRIBE => (vec![Signature::UInt32], Signature::UInt64),
        UNSUBSCRIBE => (vec![Signature::UInt64], Signature::Void),
        GET_PROPERTY => (vec![Signature::UInt32], Signature::Dynamic),
        SET_PROPERTY => (vec![Signature::UInt32, Signature::Dynamic], Signature::Void),
        EMIT => (
            vec![Signature::UInt32, Signature::list(Signature::Dynamic)],
            Signature::Void,
        ),
        _ => return None,
    };
    Some((Signature::Tuple(params), returns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::FIRST_USER_ID;

    #[test]
    fn test_control_ids_are_reserved() {
        for id in [SUBSCRIBE, UNSUBSCRIBE, GET_PROPERTY, SET_PROPERTY, EMIT] {
            assert!(id < FIRST_USER_ID);
            assert!(signatures(id).is_some());
        }
        assert!(signatures(0).is_none());
        assert!(signatures(FIRST_USER_ID).is_none());
    }

    #[test]
    fn test_emit_signature() {
        let (params, returns) = signatures(EMIT).unwrap();
        assert_eq!(params.to_string(), "(I[m])");
        assert!(returns.is_void());
    }
}
