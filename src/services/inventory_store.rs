//! Inventory store - single writer, concurrent readers
//!
//! All mutations are commands processed one at a time by the writer task,
//! which also rewrites the snapshot after each change. Readers take a read
//! lock on the shared `Inventory`; only the writer ever takes the write lock.

use crate::domain::error::StoreError;
use crate::domain::inventory::{
    Inventory, InventoryItem, ItemDescriptor, Recommendation, TakeReason,
};
use crate::domain::types::SessionId;
use crate::infra::metrics::Metrics;
use crate::io::snapshot::SnapshotFile;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const COMMAND_QUEUE: usize = 64;

enum StoreCommand {
    Place {
        descriptor: ItemDescriptor,
        session_id: SessionId,
        reply: oneshot::Sender<Result<InventoryItem, StoreError>>,
    },
    Take {
        category: String,
        reply: oneshot::Sender<Option<(InventoryItem, TakeReason)>>,
    },
}

/// Cloneable access to the store: mutations go through the writer queue
#[derive(Clone)]
pub struct InventoryHandle {
    tx: mpsc::Sender<StoreCommand>,
    view: Arc<RwLock<Inventory>>,
    expiring_soon: chrono::Duration,
}

impl InventoryHandle {
    /// Create an item from a recognition result; fails with
    /// [`StoreError::Full`] when every section is occupied
    pub async fn place(
        &self,
        descriptor: ItemDescriptor,
        session_id: SessionId,
    ) -> Result<InventoryItem, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Place { descriptor, session_id, reply })
            .await
            .map_err(|_| StoreError::WriterStopped)?;
        rx.await.map_err(|_| StoreError::WriterStopped)?
    }

    /// Remove the best match for `category`; `None` when the fridge is empty
    pub async fn take(
        &self,
        category: &str,
    ) -> Result<Option<(InventoryItem, TakeReason)>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Take { category: category.to_string(), reply })
            .await
            .map_err(|_| StoreError::WriterStopped)?;
        rx.await.map_err(|_| StoreError::WriterStopped)
    }

    pub fn items(&self) -> Vec<InventoryItem> {
        self.view.read().items()
    }

    pub fn len(&self) -> usize {
        self.view.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.read().is_empty()
    }

    pub fn recommend(&self, now: DateTime<Utc>) -> Vec<Recommendation> {
        self.view.read().recommend(now, self.expiring_soon)
    }
}

pub struct InventoryStore {
    rx: mpsc::Receiver<StoreCommand>,
    inventory: Arc<RwLock<Inventory>>,
    snapshot: Option<SnapshotFile>,
    metrics: Arc<Metrics>,
}

impl InventoryStore {
    /// Seed from `snapshot` (if any) and return the store plus its handle
    pub fn new(
        snapshot: Option<SnapshotFile>,
        expiring_soon: chrono::Duration,
        metrics: Arc<Metrics>,
    ) -> (Self, InventoryHandle) {
        let items = snapshot.as_ref().map(SnapshotFile::load_or_empty).unwrap_or_default();
        let inventory = Inventory::from_items(items);
        metrics.set_items_present(inventory.len() as u64);
        info!(items = %inventory.len(), "inventory_seeded");

        let view = Arc::new(RwLock::new(inventory));
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = InventoryHandle { tx, view: view.clone(), expiring_soon };
        (Self { rx, inventory: view, snapshot, metrics }, handle)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Process commands until every handle is gone or shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("inventory_writer_started");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(cmd) => self.apply(cmd),
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Finish whatever was already queued
                        self.rx.close();
                        while let Some(cmd) = self.rx.recv().await {
                            self.apply(cmd);
                        }
                        break;
                    }
                }
            }
        }
        info!("inventory_writer_stopped");
    }

    fn apply(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::Place { descriptor, session_id, reply } => {
                let placed = self.inventory.write().place(&descriptor, &session_id, Utc::now());
                match &placed {
                    Ok(item) => {
                        info!(
                            item_id = %item.id,
                            category = %item.category,
                            expires_at = %item.expires_at.to_rfc3339(),
                            zone = ?item.temperature_zone,
                            section = %item.section,
                            "inventory_item_placed"
                        );
                        self.persist();
                    }
                    Err(e) => {
                        warn!(category = %descriptor.category, session_id = %session_id, error = %e, "inventory_place_rejected");
                    }
                }
                let _ = reply.send(placed);
            }
            StoreCommand::Take { category, reply } => {
                let taken = self.inventory.write().take_best_match(&category);
                if let Some((item, reason)) = &taken {
                    info!(
                        item_id = %item.id,
                        category = %item.category,
                        requested = %category,
                        reason = ?reason,
                        "inventory_item_taken"
                    );
                    self.persist();
                }
                let _ = reply.send(taken);
            }
        }
    }

    fn persist(&self) {
        let items = self.inventory.read().items();
        self.metrics.set_items_present(items.len() as u64);

        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.write(&items) {
                self.metrics.record_snapshot_failure();
                error!(error = %format!("{e:#}"), "snapshot_write_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::inventory::{ItemId, FRIDGE_CAPACITY, LONG_TERM_SHELF_LIFE_DAYS};
    use tempfile::tempdir;

    fn start(snapshot: Option<SnapshotFile>) -> (InventoryHandle, watch::Sender<bool>, JoinHandle<()>) {
        let (store, handle) =
            InventoryStore::new(snapshot, chrono::Duration::days(2), Arc::new(Metrics::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = store.spawn(shutdown_rx);
        (handle, shutdown_tx, join)
    }

    #[tokio::test]
    async fn test_place_and_take() {
        let (handle, _shutdown, _join) = start(None);

        let milk = handle.place(ItemDescriptor::new("milk", 0.9, 2), SessionId::new()).await.unwrap();
        handle.place(ItemDescriptor::new("cheese", 0.9, 10), SessionId::new()).await.unwrap();
        assert_eq!(handle.len(), 2);

        let (taken, reason) = handle.take("unknown").await.unwrap().unwrap();
        assert_eq!(taken.id, milk.id);
        assert_eq!(reason, TakeReason::SoonestExpiry);
        assert_eq!(handle.len(), 1);
    }

    #[tokio::test]
    async fn test_take_from_empty_store() {
        let (handle, _shutdown, _join) = start(None);
        assert!(handle.take("milk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_takes_never_remove_same_item() {
        let (handle, _shutdown, _join) = start(None);
        for _ in 0..5 {
            handle.place(ItemDescriptor::new("yogurt", 0.9, 5), SessionId::new()).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.take("yogurt").await.unwrap() }));
        }

        let mut taken: Vec<ItemId> = Vec::new();
        for task in tasks {
            if let Some((item, _)) = task.await.unwrap() {
                taken.push(item.id);
            }
        }
        taken.sort();
        taken.dedup();
        assert_eq!(taken.len(), 5);
        assert!(handle.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_persisted_and_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inventory.json");

        {
            let (handle, shutdown, join) = start(Some(SnapshotFile::new(&path)));
            handle.place(ItemDescriptor::new("milk", 0.9, 7), SessionId::new()).await.unwrap();
            handle.place(ItemDescriptor::new("eggs", 0.9, 14), SessionId::new()).await.unwrap();
            handle.take("milk").await.unwrap();
            shutdown.send(true).unwrap();
            join.await.unwrap();
        }

        let (handle, _shutdown, _join) = start(Some(SnapshotFile::new(&path)));
        let items = handle.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, "eggs");

        // Ids continue after the highest persisted id
        let next = handle.place(ItemDescriptor::new("butter", 0.9, 30), SessionId::new()).await.unwrap();
        assert_eq!(next.id, ItemId(3));
    }

    #[tokio::test]
    async fn test_writer_stopped_error() {
        let (handle, shutdown, join) = start(None);
        shutdown.send(true).unwrap();
        join.await.unwrap();

        let result = handle.place(ItemDescriptor::new("milk", 0.9, 7), SessionId::new()).await;
        assert_eq!(result, Err(StoreError::WriterStopped));
    }

    #[tokio::test]
    async fn test_unbounded_shelf_life_keeps_writer_alive() {
        let (handle, _shutdown, join) = start(None);

        let jam = handle.place(ItemDescriptor::new("jam", 0.9, u32::MAX), SessionId::new()).await.unwrap();
        let lifetime = jam.expires_at - jam.placed_at;
        assert_eq!(lifetime.num_days(), i64::from(LONG_TERM_SHELF_LIFE_DAYS));

        handle.place(ItemDescriptor::new("milk", 0.9, 7), SessionId::new()).await.unwrap();
        assert_eq!(handle.len(), 2);
        assert!(!join.is_finished());
    }

    #[tokio::test]
    async fn test_full_fridge_rejects_place_without_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let (handle, _shutdown, _join) = start(Some(SnapshotFile::new(&path)));
        for _ in 0..FRIDGE_CAPACITY {
            handle.place(ItemDescriptor::new("soda", 0.9, 90), SessionId::new()).await.unwrap();
        }

        let result = handle.place(ItemDescriptor::new("milk", 0.9, 7), SessionId::new()).await;
        assert_eq!(result, Err(StoreError::Full { capacity: FRIDGE_CAPACITY }));
        assert_eq!(handle.len(), FRIDGE_CAPACITY);
        assert_eq!(SnapshotFile::new(&path).load_or_empty().len(), FRIDGE_CAPACITY);

        // TAKE frees a section for the next PLACE
        let (taken, _) = handle.take("soda").await.unwrap().unwrap();
        let milk = handle.place(ItemDescriptor::new("milk", 0.9, 7), SessionId::new()).await.unwrap();
        assert_eq!((milk.temperature_zone, milk.section), (taken.temperature_zone, taken.section));
    }

    #[tokio::test]
    async fn test_recommend_reads_current_state() {
        let (handle, _shutdown, _join) = start(None);
        handle.place(ItemDescriptor::new("cheese", 0.9, 10), SessionId::new()).await.unwrap();
        handle.place(ItemDescriptor::new("milk", 0.9, 1), SessionId::new()).await.unwrap();

        let ranked = handle.recommend(Utc::now());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].item.category, "milk");
    }
}
