//! Mint submission: idempotency and single-flight exclusivity

use async_trait::async_trait;
use poi_node::mint::{
    BroadcastError, MintAction, MintBroadcaster, MintReceipt, MintService, DEFAULT_MINT_CACHE_TTL,
};
use poi_node::MerkleRoot;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts calls and records whether two broadcasts ever overlapped
#[derive(Default)]
struct RecordingBroadcaster {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    order: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl MintBroadcaster for RecordingBroadcaster {
    async fn broadcast_mint(
        &self,
        merkle_root: &MerkleRoot,
    ) -> Result<MintReceipt, BroadcastError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.order.lock().push(merkle_root.to_string());

        tokio::time::sleep(Duration::from_millis(25)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(MintReceipt {
            txid: format!("tx-{}", &merkle_root.as_str()[..8]),
            amount: 100,
        })
    }
}

fn root(c: char) -> MerkleRoot {
    MerkleRoot::new(c.to_string().repeat(64)).unwrap()
}

#[tokio::test]
async fn test_duplicate_submission_uses_cache() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let service = MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL);

    let first = service.submit(root('a')).await.unwrap();
    let second = service.submit(root('a')).await.unwrap();

    assert_eq!(first, second);
    assert!(first.success);
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.status().dedup_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_never_overlap() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let service = Arc::new(MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL));

    let roots = ['a', 'b', 'c', 'd', 'e', 'f'];
    let handles: Vec<_> = roots
        .iter()
        .map(|&c| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(root(c)).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.success);
    }

    assert!(!broadcaster.overlapped.load(Ordering::SeqCst));
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), roots.len());
    assert_eq!(service.status().total_mints, roots.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_broadcast_once() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let service = Arc::new(MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(root('9')).await })
        })
        .collect();

    let mut txids = Vec::new();
    for handle in handles {
        txids.push(handle.await.unwrap().unwrap().txid);
    }

    // Queued duplicates hit the cache once the first broadcast lands.
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), 1);
    assert!(txids.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_fifo_order() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let service = Arc::new(MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL));

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.submit(root('1')).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.submit(root('2')).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let order = broadcaster.order.lock().clone();
    assert_eq!(order, vec!["1".repeat(64), "2".repeat(64)]);
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let service = Arc::new(MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL));

    let pending: Vec<_> = ['7', '8']
        .iter()
        .map(|&c| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(root(c)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(5)).await;

    service.shutdown().await;

    for handle in pending {
        assert!(handle.await.unwrap().unwrap().success);
    }
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), 2);
}

/// Fails with contention until `failures` calls have been made
struct ContendedBroadcaster {
    calls: AtomicUsize,
    failures: usize,
}

#[async_trait]
impl MintBroadcaster for ContendedBroadcaster {
    async fn broadcast_mint(
        &self,
        _merkle_root: &MerkleRoot,
    ) -> Result<MintReceipt, BroadcastError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(BroadcastError::from_message("txn-mempool-conflict"))
        } else {
            Ok(MintReceipt {
                txid: "won".to_string(),
                amount: 1,
            })
        }
    }
}

#[tokio::test]
async fn test_resubmit_after_contention() {
    let broadcaster = Arc::new(ContendedBroadcaster {
        calls: AtomicUsize::new(0),
        failures: 1,
    });
    let service = MintService::new(broadcaster.clone(), DEFAULT_MINT_CACHE_TTL);

    let first = service.submit(root('5')).await.unwrap();
    assert_eq!(first.action, MintAction::Retry);

    // A plain submit returns the cached retry outcome.
    let cached = service.submit(root('5')).await.unwrap();
    assert_eq!(cached, first);
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), 1);

    let retried = service.resubmit(root('5')).await.unwrap();
    assert!(retried.success);
    assert_eq!(retried.txid.as_deref(), Some("won"));
    assert_eq!(broadcaster.calls.load(Ordering::SeqCst), 2);
}
