//! Contact list membership, as seen by list nodes.

use async_trait::async_trait;

use crate::automation::ListStatus;
use crate::error::Result;
use crate::storage::SqliteStorage;

/// Read and write list memberships.
///
/// Both calls fail with [`Error::Configuration`](crate::error::Error) when
/// the list does not exist in the workspace.
#[async_trait]
pub trait ContactLists: Send + Sync {
    /// `Ok(None)` when the contact is not on the list.
    async fn get_status(
        &self,
        workspace_id: &str,
        contact_email: &str,
        list_id: &str,
    ) -> Result<Option<ListStatus>>;

    /// Upsert, last writer wins.
    async fn set_status(
        &self,
        workspace_id: &str,
        contact_email: &str,
        list_id: &str,
        status: ListStatus,
    ) -> Result<()>;
}

#[async_trait]
impl ContactLists for SqliteStorage {
    async fn get_status(
        &self,
        workspace_id: &str,
        contact_email: &str,
        list_id: &str,
    ) -> Result<Option<ListStatus>> {
        self.get_membership(workspace_id, list_id, contact_email).await
    }

    async fn set_status(
        &self,
        workspace_id: &str,
        contact_email: &str,
        list_id: &str,
        status: ListStatus,
    ) -> Result<()> {
        self.set_membership(workspace_id, list_id, contact_email, status)
            .await
    }
}
