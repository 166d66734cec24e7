// src/core/haproxy/transaction.rs

//! Scoped Dataplane transactions: read the configuration version, open a
//! transaction, and commit or abort on every control path.

use super::dataplane::DataplaneClient;
use crate::core::errors::DiscoveryError;
use tracing::{debug, info};

/// A Dataplane transaction in progress.
///
/// Begin with [`Transaction::begin`], record modifications with
/// [`Transaction::mark_changed`], and close with [`Transaction::finish`]
/// (commits if changed, deletes the empty transaction otherwise) or
/// [`Transaction::abort`] on an error path.
pub struct Transaction<'a> {
    client: &'a DataplaneClient,
    id: String,
    changed: bool,
}

impl<'a> Transaction<'a> {
    pub async fn begin(client: &'a DataplaneClient) -> Result<Transaction<'a>, DiscoveryError> {
        let version = client.configuration_version().await?;
        let id = client.create_transaction(version).await?;
        debug!(transaction = %id, version, "Transaction started");
        Ok(Self {
            client,
            id,
            changed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signal that this transaction has modifications and should be
    /// committed.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Commit when modifications were recorded; otherwise delete the empty
    /// transaction so no empty configuration version is created.
    pub async fn finish(self) -> Result<(), DiscoveryError> {
        if self.changed {
            info!(transaction = %self.id, "Committing transaction");
            self.client.commit_transaction(&self.id).await
        } else {
            debug!(transaction = %self.id, "No changes in transaction, deleting");
            self.abort().await;
            Ok(())
        }
    }

    /// Best-effort deletion, used on the no-op and error paths.
    pub async fn abort(self) {
        if let Err(e) = self.client.delete_transaction(&self.id).await {
            debug!(
                transaction = %self.id,
                error = %e,
                "Could not delete transaction (may already be gone)"
            );
        }
    }
}
