//! Meta objects: the immutable description of an object's callable surface.
//!
//! Actions, signals and properties share one id space so a subscription id
//! can name either a signal or a property. Ids below [`FIRST_USER_ID`] are
//! reserved for control actions handled by the endpoint itself.

use crate::error::{Error, Result};
use crate::signature::Signature;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id of an action.
pub type ActionId = u32;
/// Numeric id of a signal.
pub type SignalId = u32;
/// Numeric id of a property.
pub type PropertyId = u32;

/// First id handed out to user-declared members.
pub const FIRST_USER_ID: u32 = 100;

/// One callable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAction {
    pub id: ActionId,
    pub name: String,
    /// Tuple signature of the arguments.
    pub parameters: Signature,
    pub returns: Signature,
}

impl fmt::Display for MetaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}->{}", self.name, self.parameters, self.returns)
    }
}

/// One signal an object can fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaSignal {
    pub id: SignalId,
    pub name: String,
    /// Tuple signature of the payload.
    pub payload: Signature,
}

/// One property, readable, writable and observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaProperty {
    pub id: PropertyId,
    pub name: String,
    pub signature: Signature,
}

/// Immutable description of actions, signals and properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaObject {
    actions: Vec<MetaAction>,
    signals: Vec<MetaSignal>,
    properties: Vec<MetaProperty>,
}

impl MetaObject {
    /// All actions in declaration order.
    pub fn actions(&self) -> &[MetaAction] {
        &self.actions
    }

    /// All signals in declaration order.
    pub fn signals(&self) -> &[MetaSignal] {
        &self.signals
    }

    /// All properties in declaration order.
    pub fn properties(&self) -> &[MetaProperty] {
        &self.properties
    }

    pub fn action(&self, id: ActionId) -> Option<&MetaAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn signal(&self, id: SignalId) -> Option<&MetaSignal> {
        self.signals.iter().find(|s| s.id == id)
    }

    pub fn property(&self, id: PropertyId) -> Option<&MetaProperty> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// Resolve an action by name and exact parameter signature.
    ///
    /// Overloads are told apart by signature only; a name with no matching
    /// signature is an error, never a best guess.
    pub fn find_action(&self, name: &str, parameters: &Signature) -> Result<ActionId> {
        let mut matches = self
            .actions
            .iter()
            .filter(|a| a.name == name && &a.parameters == parameters);
        match (matches.next(), matches.next()) {
            (Some(action), None) => Ok(action.id),
            (None, _) => Err(Error::NoSuchAction(format!("{name}::{parameters}"))),
            (Some(_), Some(_)) => Err(Error::AmbiguousAction(format!("{name}::{parameters}"))),
        }
    }

    /// Resolve an action by name alone; fails when the name is overloaded.
    pub fn find_action_by_name(&self, name: &str) -> Result<ActionId> {
        let mut matches = self.actions.iter().filter(|a| a.name == name);
        match (matches.next(), matches.next()) {
            (Some(action), None) => Ok(action.id),
            (None, _) => Err(Error::NoSuchAction(name.to_string())),
            (Some(_), Some(_)) => Err(Error::AmbiguousAction(format!(
                "{name} is overloaded, a parameter signature is required"
            ))),
        }
    }

    pub fn find_signal(&self, name: &str) -> Result<SignalId> {
        self.signals
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.id)
            .ok_or_else(|| Error::NoSuchSignal(name.to_string()))
    }

    pub fn find_property(&self, name: &str) -> Result<PropertyId> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| Error::NoSuchProperty(name.to_string()))
    }

    /// Payload signature delivered to subscribers of `id`.
    ///
    /// Signals deliver their declared payload; properties deliver a
    /// one-element tuple holding the new value.
    pub fn subscription_payload(&self, id: u32) -> Option<Signature> {
        if let Some(signal) = self.signal(id) {
            return Some(signal.payload.clone());
        }
        self.property(id)
            .map(|p| Signature::tuple([p.signature.clone()]))
    }
}

/// Append-only construction of a [`MetaObject`].
#[derive(Debug)]
pub struct MetaObjectBuilder {
    meta: MetaObject,
    next_id: u32,
}

impl MetaObjectBuilder {
    pub fn new() -> Self {
        Self {
            meta: MetaObject::default(),
            next_id: FIRST_USER_ID,
        }
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn name_taken(&self, name: &str) -> bool {
        self.meta.signals.iter().any(|s| s.name == name)
            || self.meta.properties.iter().any(|p| p.name == name)
    }

    /// Declare an action. `parameters` must be a tuple signature.
    pub fn add_action(
        &mut self,
        name: &str,
        parameters: Signature,
        returns: Signature,
    ) -> Result<ActionId> {
        if !matches!(parameters, Signature::Tuple(_)) {
            return Err(Error::InvalidSignature(format!(
                "parameters of {name} must be a tuple, got {parameters}"
            )));
        }
        if self.meta.find_action(name, &parameters).is_ok() {
            return Err(Error::AmbiguousAction(format!(
                "{name}::{parameters} declared twice"
            )));
        }
        let id = self.fresh_id();
        self.meta.actions.push(MetaAction {
            id,
            name: name.to_string(),
            parameters,
            returns,
        });
        Ok(id)
    }

    /// Declare a signal. `payload` must be a tuple signature.
    pub fn add_signal(&mut self, name: &str, payload: Signature) -> Result<SignalId> {
        if !matches!(payload, Signature::Tuple(_)) {
            return Err(Error::InvalidSignature(format!(
                "payload of {name} must be a tuple, got {payload}"
            )));
        }
        if self.name_taken(name) {
            return Err(Error::DuplicateMember(format!("{name} declared twice")));
        }
        let id = self.fresh_id();
        self.meta.signals.push(MetaSignal {
            id,
            name: name.to_string(),
            payload,
        });
        Ok(id)
    }

    /// Declare a property holding values of `signature`.
    pub fn add_property(&mut self, name: &str, signature: Signature) -> Result<PropertyId> {
        if self.name_taken(name) {
            return Err(Error::DuplicateMember(format!("{name} declared twice")));
        }
        let id = self.fresh_id();
        self.meta.properties.push(MetaProperty {
            id,
            name: name.to_string(),
            signature,
        });
        Ok(id)
    }

    pub fn build(self) -> MetaObject {
        self.meta
    }
}

impl Default for MetaObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(text: &str) -> Signature {
        Signature::parse(text).unwrap()
    }

    fn overloaded() -> (MetaObject, ActionId, ActionId) {
        let mut b = MetaObjectBuilder::new();
        let a = b.add_action("echo", sig("(i)"), sig("i")).unwrap();
        let c = b.add_action("echo", sig("(s)"), sig("s")).unwrap();
        b.add_signal("fired", sig("(s)")).unwrap();
        b.add_property("level", sig("i")).unwrap();
        (b.build(), a, c)
    }

    #[test]
    fn test_overload_resolution_by_signature() {
        let (meta, int_echo, str_echo) = overloaded();
        assert_eq!(meta.find_action("echo", &sig("(i)")).unwrap(), int_echo);
        assert_eq!(meta.find_action("echo", &sig("(s)")).unwrap(), str_echo);
        assert!(matches!(
            meta.find_action("echo", &sig("(d)")),
            Err(Error::NoSuchAction(_))
        ));
        assert!(matches!(
            meta.find_action_by_name("echo"),
            Err(Error::AmbiguousAction(_))
        ));
    }

    #[test]
    fn test_ids_are_unique_and_user_range() {
        let (meta, _, _) = overloaded();
        let mut ids: Vec<u32> = meta.actions().iter().map(|a| a.id).collect();
        ids.extend(meta.signals().iter().map(|s| s.id));
        ids.extend(meta.properties().iter().map(|p| p.id));
        let len = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), len);
        assert!(ids.iter().all(|id| *id >= FIRST_USER_ID));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let mut b = MetaObjectBuilder::new();
        b.add_action("give", sig("(o)"), sig("v")).unwrap();
        assert!(matches!(
            b.add_action("give", sig("(o)"), sig("v")),
            Err(Error::AmbiguousAction(_))
        ));
        assert!(matches!(
            b.add_action("bad", sig("i"), sig("v")),
            Err(Error::InvalidSignature(_))
        ));
        b.add_signal("moved", sig("(d)")).unwrap();
        assert!(matches!(
            b.add_signal("moved", sig("(d)")),
            Err(Error::DuplicateMember(_))
        ));
        assert!(matches!(
            b.add_property("moved", sig("d")),
            Err(Error::DuplicateMember(_))
        ));
    }

    #[test]
    fn test_duplicate_overload_in_received_meta_is_ambiguous() {
        let (meta, int_echo, _) = overloaded();
        let mut twin = meta.action(int_echo).unwrap().clone();
        twin.id = 900;
        let mut forged = meta.clone();
        forged.actions.push(twin);
        let bytes = rmp_serde::to_vec(&forged).unwrap();
        let received: MetaObject = rmp_serde::from_slice(&bytes).unwrap();
        assert!(matches!(
            received.find_action("echo", &sig("(i)")),
            Err(Error::AmbiguousAction(_))
        ));
        assert!(received.find_action("echo", &sig("(s)")).is_ok());
    }

    #[test]
    fn test_subscription_payload() {
        let (meta, _, _) = overloaded();
        let fired = meta.find_signal("fired").unwrap();
        let level = meta.find_property("level").unwrap();
        assert_eq!(meta.subscription_payload(fired), Some(sig("(s)")));
        assert_eq!(meta.subscription_payload(level), Some(sig("(i)")));
        assert!(matches!(meta.find_signal("nope"), Err(Error::NoSuchSignal(_))));
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let (meta, _, _) = overloaded();
        let bytes = rmp_serde::to_vec(&meta).unwrap();
        let back: MetaObject = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, meta);
    }
}
