//! Negotiated presentation context bookkeeping.

use std::collections::{BTreeMap, HashMap};

/// Which side proposed the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    /// We proposed it and the peer accepted.
    Requestor,
    /// The peer proposed it and we accepted.
    Acceptor,
}

/// One accepted presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    /// Odd context identifier from the association negotiation.
    pub id: u8,
    pub abstract_syntax: String,
    /// The single transfer syntax settled on during negotiation.
    pub transfer_syntax: String,
    pub role: ContextRole,
}

/// The set of presentation contexts accepted on an association.
///
/// Contexts are indexed both by identifier and by the (abstract
/// syntax, transfer syntax) pair, so command routing never scans.
/// When the peer accepted the same pair under several identifiers,
/// the one negotiated first is used for sending.
#[derive(Debug, Clone, Default)]
pub struct PresentationContextTable {
    by_id: BTreeMap<u8, NegotiatedContext>,
    by_pair: HashMap<(String, String), u8>,
}

impl PresentationContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted context. Identifiers are unique on the wire;
    /// inserting a duplicate identifier replaces the earlier entry.
    pub fn insert(&mut self, context: NegotiatedContext) {
        let pair = (
            context.abstract_syntax.clone(),
            context.transfer_syntax.clone(),
        );
        // first context negotiated for a pair wins for lookup
        self.by_pair.entry(pair).or_insert(context.id);
        self.by_id.insert(context.id, context);
    }

    pub fn get(&self, id: u8) -> Option<&NegotiatedContext> {
        self.by_id.get(&id)
    }

    /// Finds a context for an abstract syntax. With a transfer syntax
    /// given, only an exact pair matches; without one, the context with
    /// the lowest identifier for that abstract syntax is returned.
    pub fn find(&self, abstract_syntax: &str, transfer_syntax: Option<&str>) -> Option<&NegotiatedContext> {
        match transfer_syntax {
            Some(ts) => {
                let id = self
                    .by_pair
                    .get(&(abstract_syntax.to_string(), ts.to_string()))?;
                self.by_id.get(id)
            }
            None => self
                .by_id
                .values()
                .find(|c| c.abstract_syntax == abstract_syntax),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NegotiatedContext> {
        self.by_id.values()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_pair.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: u8, abs: &str, ts: &str) -> NegotiatedContext {
        NegotiatedContext {
            id,
            abstract_syntax: abs.to_string(),
            transfer_syntax: ts.to_string(),
            role: ContextRole::Acceptor,
        }
    }

    #[test]
    fn lookup_by_id_and_pair() {
        let mut table = PresentationContextTable::new();
        table.insert(ctx(1, "1.2.840.10008.1.1", "1.2.840.10008.1.2"));
        table.insert(ctx(3, "1.2.840.10008.3.1.2.3.3", "1.2.840.10008.1.2.1"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(3).unwrap().abstract_syntax, "1.2.840.10008.3.1.2.3.3");
        assert!(table.get(5).is_none());

        let found = table
            .find("1.2.840.10008.1.1", Some("1.2.840.10008.1.2"))
            .unwrap();
        assert_eq!(found.id, 1);
        assert!(table
            .find("1.2.840.10008.1.1", Some("1.2.840.10008.1.2.1"))
            .is_none());
    }

    #[test]
    fn find_without_transfer_syntax_prefers_lowest_id() {
        let mut table = PresentationContextTable::new();
        table.insert(ctx(5, "1.2.840.10008.1.20.1", "1.2.840.10008.1.2"));
        table.insert(ctx(3, "1.2.840.10008.1.20.1", "1.2.840.10008.1.2.1"));

        let found = table.find("1.2.840.10008.1.20.1", None).unwrap();
        assert_eq!(found.id, 3);
    }

    #[test]
    fn duplicate_pair_keeps_first_negotiated_id() {
        let mut table = PresentationContextTable::new();
        table.insert(ctx(1, "1.2.840.10008.1.1", "1.2.840.10008.1.2"));
        table.insert(ctx(3, "1.2.840.10008.1.1", "1.2.840.10008.1.2"));

        let found = table
            .find("1.2.840.10008.1.1", Some("1.2.840.10008.1.2"))
            .unwrap();
        assert_eq!(found.id, 1);
        // both remain addressable by id
        assert!(table.get(3).is_some());
    }
}
