//! The address book.
//!
//! The server's contact list is authoritative: a refresh replaces whatever
//! was cached. Imports only report counts; the list itself is re-fetched.

use std::collections::HashSet;

use shared::{
    domain::{EntityKind, UserId},
    protocol::{ContactRecord, InputContact, ProtocolRequest, UserRecord},
};
use tracing::{debug, info};

use crate::{
    entities::Contact,
    entity_store::{Provenance, UpsertOutcome},
    requests::RequestPurpose,
    Mirror, MirrorEvent, TimerKind,
};

impl Mirror {
    pub fn contact(&self, user: &UserId) -> Option<&Contact> {
        self.contacts.lookup(user)
    }

    pub fn is_contact(&self, user: &UserId) -> bool {
        self.contacts.contains(user)
    }

    /// Every cached contact, ordered by user id.
    pub fn contact_list(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts.iter().map(|(_, c)| *c).collect();
        contacts.sort_by_key(|contact| contact.user);
        contacts
    }

    /// Debounced: a burst of calls ends in one request.
    pub fn schedule_contact_refresh(&mut self) {
        let delay = self.settings.contact_refresh();
        self.timers.arm(TimerKind::ContactRefresh, delay);
    }

    /// Fetches the contact list unless a fetch is already in flight.
    pub fn refresh_contacts(&mut self) {
        if self
            .requests
            .find(|purpose| *purpose == RequestPurpose::Contacts)
            .is_some()
        {
            debug!("contacts: refresh already in flight");
            return;
        }
        self.issue(ProtocolRequest::GetContacts, RequestPurpose::Contacts);
    }

    /// Offers phone book entries to the server. Empty input sends nothing.
    pub fn add_contacts(&mut self, contacts: Vec<InputContact>) {
        if contacts.is_empty() {
            return;
        }
        info!(count = contacts.len(), "contacts: importing");
        self.issue(
            ProtocolRequest::ImportContacts {
                contacts,
                replace: false,
            },
            RequestPurpose::ImportContacts,
        );
    }

    pub(crate) fn apply_contacts(&mut self, contacts: &[ContactRecord], users: &[UserRecord]) {
        self.apply_users(users, Provenance::PullResponse);

        let listed: HashSet<UserId> = contacts.iter().map(|record| record.user_id).collect();
        let mut dropped: Vec<UserId> = self
            .contacts
            .keys()
            .filter(|user| !listed.contains(*user))
            .copied()
            .collect();
        dropped.sort();
        let mut changed = !dropped.is_empty();
        for user in dropped {
            self.contacts.retire(&user);
            self.store.delete(EntityKind::Contact, user.0.to_string());
        }
        if changed {
            self.arm_graveyard();
        }

        for record in contacts {
            self.ensure_user(record.user_id);
            let contact = Contact::from(record);
            let outcome = self
                .contacts
                .upsert(contact.user, contact, Provenance::PullResponse);
            if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Updated) {
                self.store.upsert(
                    EntityKind::Contact,
                    contact.user.0.to_string(),
                    String::new(),
                    &contact,
                );
                changed = true;
            }
        }

        info!(contacts = contacts.len(), "contacts: list refreshed");
        if changed {
            self.emit(MirrorEvent::ContactsChanged);
        }
    }

    /// New contacts may come with new conversations; both lists are re-read soon.
    pub(crate) fn apply_imported(&mut self, imported: i32, retry: i32, users: &[UserRecord]) {
        self.apply_users(users, Provenance::PullResponse);
        self.schedule_dialog_refresh();
        self.schedule_contact_refresh();
        info!(imported, retry, "contacts: import finished");
        self.emit(MirrorEvent::ContactsImported { imported, retry });
    }
}
