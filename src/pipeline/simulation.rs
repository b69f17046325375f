//! A reconciler wired to in-memory collaborators built from a [`World`].

use std::sync::Arc;

use crate::assignment::PrincipalType;
use crate::catalog::{
    MemoryLinkStore, MemoryPermissionSetCatalog, MemoryPrincipalCache, PrincipalCache,
    PrincipalCacheEntry,
};
use crate::clients::memory::{MemoryAssignmentApi, MemoryDirectory, MemoryOrganization, World};
use crate::error::Result;
use crate::notify::{ErrorSink, FanoutSink, LogSink, MemorySink};
use crate::triggers::{Event, OrgEvent, PrincipalEvent};

use super::Collaborators;

pub struct SimulatedWorld {
    root_id: String,
    pub organization: Arc<MemoryOrganization>,
    pub directory: Arc<MemoryDirectory>,
    pub assignment: Arc<MemoryAssignmentApi>,
    pub links: Arc<MemoryLinkStore>,
    pub principals: Arc<MemoryPrincipalCache>,
    pub permission_sets: Arc<MemoryPermissionSetCatalog>,
    pub notifications: Arc<MemorySink>,
}

impl SimulatedWorld {
    /// Build the collaborators. The principal cache starts out holding
    /// every principal in the directory layout, as if its creation events
    /// had already been seen.
    pub fn new(world: &World) -> Result<Self> {
        let organization = Arc::new(MemoryOrganization::new(
            &world.organization,
            world.management_account_id.as_deref(),
        ));
        let directory = Arc::new(MemoryDirectory::new(
            &world.instance.identity_store_id,
            &world.directory,
        ));
        let assignment = Arc::new(MemoryAssignmentApi::new(
            world.instance.clone(),
            world.polls_until_complete,
        ));

        let principals = Arc::new(MemoryPrincipalCache::new());
        let seeded = world
            .directory
            .groups
            .iter()
            .map(|(name, id)| (PrincipalType::Group, name, id))
            .chain(
                world
                    .directory
                    .users
                    .iter()
                    .map(|(name, id)| (PrincipalType::User, name, id)),
            );
        for (principal_type, name, id) in seeded {
            principals.upsert(PrincipalCacheEntry {
                principal_name: name.clone(),
                principal_type,
                principal_id: id.clone(),
            })?;
        }

        let permission_sets = Arc::new(MemoryPermissionSetCatalog::new());
        permission_sets.load_from(world.permission_sets.clone());

        tracing::debug!(
            accounts = world.organization.accounts.len(),
            permission_sets = world.permission_sets.len(),
            "simulated world built"
        );

        Ok(Self {
            root_id: world.organization.root_id.clone(),
            organization,
            directory,
            assignment,
            links: Arc::new(MemoryLinkStore::new()),
            principals,
            permission_sets,
            notifications: Arc::new(MemorySink::new()),
        })
    }

    /// Collaborators for a reconciler. Error notifications are logged and
    /// also kept in [`SimulatedWorld::notifications`].
    pub fn collaborators(&self) -> Collaborators {
        let sinks: Vec<Arc<dyn ErrorSink>> = vec![Arc::new(LogSink), self.notifications.clone()];
        Collaborators {
            assignment: self.assignment.clone(),
            directory: self.directory.clone(),
            organization: self.organization.clone(),
            links: self.links.clone(),
            principals: self.principals.clone(),
            permission_sets: self.permission_sets.clone(),
            sink: Arc::new(FanoutSink::new(sinks)),
        }
    }

    /// Make the simulated services reflect an event before it is submitted,
    /// the way the real services change before they emit one. Account
    /// creations land under the root.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::Org(OrgEvent::AccountCreated { account_id }) => {
                self.organization.add_account(account_id, &self.root_id);
            }
            Event::Org(OrgEvent::AccountMoved {
                account_id,
                destination_parent_id,
                ..
            }) => self.organization.move_account(account_id, destination_parent_id),
            Event::Org(OrgEvent::TagsChanged {
                account_id,
                changed_keys,
                tags,
            }) => {
                for key in changed_keys {
                    match tags.get(key) {
                        Some(value) => self.organization.set_tag(account_id, key, value),
                        None => self.organization.remove_tag(account_id, key),
                    }
                }
            }
            Event::Principal(PrincipalEvent::GroupCreated {
                group_id,
                display_name,
            }) => self
                .directory
                .add_principal(PrincipalType::Group, display_name, group_id),
            Event::Principal(PrincipalEvent::GroupDeleted { group_id, .. }) => self
                .directory
                .remove_principal(PrincipalType::Group, group_id),
            Event::Principal(PrincipalEvent::UserDeleted { user_id, .. }) => self
                .directory
                .remove_principal(PrincipalType::User, user_id),
            Event::Principal(PrincipalEvent::UserCreated { .. })
            | Event::Link(_)
            | Event::PermissionSet(_) => {}
        }
    }
}
