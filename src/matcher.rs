//! External contact → local contact matching.
//!
//! Primary: exact match on normalized email.
//! Fallback: exact match on normalized name (trimmed, whitespace collapsed,
//! casefolded). The matcher is a snapshot; rebuild it before each import batch.

use std::collections::HashMap;

use crate::db::{CrmDb, DbContact, DbError};
use crate::util::{normalize_email, normalize_name};

/// How the match was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Email,
    Name,
}

/// A local contact matched to an external `(name, email)` pair.
#[derive(Debug, Clone)]
pub struct ContactMatch {
    pub contact: DbContact,
    pub method: MatchMethod,
    /// More than one local contact shares the matched name. The first by
    /// insertion order was returned.
    pub ambiguous: bool,
}

#[derive(Debug, Default)]
pub struct IdentityMatcher {
    contacts: Vec<DbContact>,
    by_email: HashMap<String, usize>,
    /// Indices in insertion order.
    by_name: HashMap<String, Vec<usize>>,
}

impl IdentityMatcher {
    /// Build from a contact snapshot given in insertion order.
    pub fn from_contacts(contacts: Vec<DbContact>) -> Self {
        let mut by_email = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, contact) in contacts.iter().enumerate() {
            let email = normalize_email(&contact.email);
            if !email.is_empty() {
                by_email.entry(email).or_insert(idx);
            }
            let name = normalize_name(&contact.name);
            if !name.is_empty() {
                by_name.entry(name).or_default().push(idx);
            }
        }
        Self {
            contacts,
            by_email,
            by_name,
        }
    }

    /// Build from the current contents of the store.
    pub fn load(db: &CrmDb) -> Result<Self, DbError> {
        Ok(Self::from_contacts(db.list_contacts()?))
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Find the local contact for an external `(name, email)`.
    ///
    /// An email hit always wins over a name hit. An ambiguous name match is
    /// logged and still returned.
    pub fn find(&self, name: &str, email: &str) -> Option<ContactMatch> {
        let email = normalize_email(email);
        if !email.is_empty() {
            if let Some(&idx) = self.by_email.get(&email) {
                return Some(ContactMatch {
                    contact: self.contacts[idx].clone(),
                    method: MatchMethod::Email,
                    ambiguous: false,
                });
            }
        }

        let key = normalize_name(name);
        if key.is_empty() {
            return None;
        }
        let candidates = self.by_name.get(&key)?;
        let first = *candidates.first()?;
        let ambiguous = candidates.len() > 1;
        if ambiguous {
            log::warn!(
                "Name '{}' matches {} local contacts; using {}",
                key,
                candidates.len(),
                self.contacts[first].id
            );
        }
        Some(ContactMatch {
            contact: self.contacts[first].clone(),
            method: MatchMethod::Name,
            ambiguous,
        })
    }
}
