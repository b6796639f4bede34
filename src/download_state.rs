use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use protocol::bitfield::Bitfield;
use protocol::piece::Piece;

/// Shared download bookkeeping: which pieces are done, which are queued
/// and which are claimed by a connection. A piece is never queued and
/// claimed at the same time.
///
/// When several locks are needed they are always taken in the order
/// bitfield, queue, assigned.
#[derive(Debug)]
pub struct DownloadState {
    pieces_map: HashMap<u32, Piece>,
    pub bitfield: Mutex<Bitfield>,
    pub pieces_queue: Mutex<VecDeque<Piece>>,
    assigned_pieces: Mutex<HashSet<u32>>,
    idle_peers: Mutex<HashSet<String>>,
    downloaded_bytes: AtomicU64,
}

impl DownloadState {
    pub fn new(pieces_map: HashMap<u32, Piece>) -> Self {
        let pieces_amount = pieces_map.len();

        Self {
            pieces_map,
            bitfield: Mutex::new(Bitfield::new(pieces_amount)),
            pieces_queue: Mutex::new(VecDeque::new()),
            assigned_pieces: Mutex::new(HashSet::new()),
            idle_peers: Mutex::new(HashSet::new()),
            downloaded_bytes: AtomicU64::new(0),
        }
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces_map.len()
    }

    /// Expected size of every piece, in index order.
    pub fn piece_sizes(&self) -> Vec<u64> {
        (0..self.total_pieces() as u32)
            .filter_map(|index| self.pieces_map.get(&index))
            .map(|piece| piece.size() as u64)
            .collect()
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        let bitfield = self.bitfield.lock().await;
        bitfield.has_piece(index)
    }

    pub async fn mark_piece_downloaded(&self, index: u32) {
        let mut bitfield = self.bitfield.lock().await;
        bitfield.set_piece(index as usize);
    }

    /// True when the peer advertises at least one piece we do not hold yet.
    pub async fn has_missing_pieces(&self, peer_bitfield: &Bitfield) -> bool {
        let client_bitfield = self.bitfield.lock().await;

        (0..peer_bitfield.total_pieces).any(|piece_index| {
            peer_bitfield.has_piece(piece_index) && !client_bitfield.has_piece(piece_index)
        })
    }

    /// Pushes a fresh copy of every piece that is neither downloaded nor
    /// queued, in ascending index order, revoking stale claims as it goes.
    /// Serves both initial queue population and stall recovery.
    pub async fn requeue_missing_pieces(&self) -> usize {
        let bitfield = self.bitfield.lock().await;
        let mut queue = self.pieces_queue.lock().await;
        let mut assigned = self.assigned_pieces.lock().await;

        let queued: HashSet<u32> = queue.iter().map(|piece| piece.index()).collect();
        let mut indices: Vec<u32> = self.pieces_map.keys().copied().collect();
        indices.sort_unstable();

        let mut requeued = 0;
        for index in indices {
            if bitfield.has_piece(index as usize) || queued.contains(&index) {
                continue;
            }
            assigned.remove(&index);
            if let Some(piece) = self.pieces_map.get(&index) {
                queue.push_back(piece.clone());
                requeued += 1;
            }
        }

        requeued
    }

    /// Claims the first queued piece the peer can serve. A single scan over
    /// the queue: pieces already claimed, already downloaded or not
    /// advertised by the peer are skipped, and `None` is returned when the
    /// scan finds nothing.
    pub async fn assign_piece(&self, peer_bitfield: &Bitfield) -> Option<Piece> {
        let bitfield = self.bitfield.lock().await;
        let mut queue = self.pieces_queue.lock().await;
        let mut assigned = self.assigned_pieces.lock().await;

        let pos = queue.iter().position(|piece| {
            let index = piece.index();
            !assigned.contains(&index)
                && !bitfield.has_piece(index as usize)
                && peer_bitfield.has_piece(index as usize)
        })?;

        let piece = queue.remove(pos)?;
        assigned.insert(piece.index());

        Some(piece)
    }

    /// Marks a verified piece as downloaded and releases its claim.
    pub async fn complete_piece(&self, index: u32) {
        let mut bitfield = self.bitfield.lock().await;
        let mut assigned = self.assigned_pieces.lock().await;

        bitfield.set_piece(index as usize);
        assigned.remove(&index);
    }

    /// Returns pieces to the queue with fresh assembly state, releasing
    /// their claims. Each distinct index is requeued at most once, and
    /// pieces already downloaded or already queued are left alone.
    pub async fn redistribute_pieces(&self, indices: &[u32]) -> usize {
        let bitfield = self.bitfield.lock().await;
        let mut queue = self.pieces_queue.lock().await;
        let mut assigned = self.assigned_pieces.lock().await;

        let queued: HashSet<u32> = queue.iter().map(|piece| piece.index()).collect();
        let distinct: BTreeSet<u32> = indices.iter().copied().collect();

        let mut requeued = 0;
        for index in distinct {
            assigned.remove(&index);
            if bitfield.has_piece(index as usize) || queued.contains(&index) {
                continue;
            }
            if let Some(piece) = self.pieces_map.get(&index) {
                queue.push_back(piece.clone());
                requeued += 1;
            }
        }

        requeued
    }

    pub async fn is_complete(&self) -> bool {
        let bitfield = self.bitfield.lock().await;
        bitfield.has_all_pieces()
    }

    pub async fn downloaded_pieces_count(&self) -> usize {
        let bitfield = self.bitfield.lock().await;
        bitfield.count()
    }

    pub async fn queue_is_empty(&self) -> bool {
        let queue = self.pieces_queue.lock().await;
        queue.is_empty()
    }

    pub async fn is_assigned(&self, index: u32) -> bool {
        let assigned = self.assigned_pieces.lock().await;
        assigned.contains(&index)
    }

    /// True while any piece is still queued or claimed by a connection.
    pub async fn has_remaining_work(&self) -> bool {
        let queue = self.pieces_queue.lock().await;
        let assigned = self.assigned_pieces.lock().await;

        !queue.is_empty() || !assigned.is_empty()
    }

    pub async fn set_peer_idle(&self, session_id: &str, is_idle: bool) {
        let mut idle_peers = self.idle_peers.lock().await;
        if is_idle {
            idle_peers.insert(session_id.to_string());
        } else {
            idle_peers.remove(session_id);
        }
    }

    pub async fn idle_peers_count(&self) -> usize {
        let idle_peers = self.idle_peers.lock().await;
        idle_peers.len()
    }

    pub fn add_downloaded_bytes(&self, amount: u64) {
        self.downloaded_bytes.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;

    use protocol::bitfield::Bitfield;
    use protocol::piece::Piece;

    use super::DownloadState;

    fn create_pieces_hashmap(total_pieces: u32) -> HashMap<u32, Piece> {
        let mut pieces_map = HashMap::new();
        for index in 0..total_pieces {
            pieces_map.insert(index, Piece::new(index, 16384, [index as u8; 20]));
        }
        pieces_map
    }

    fn full_peer_bitfield(total_pieces: usize) -> Bitfield {
        let mut bitfield = Bitfield::new(total_pieces);
        for index in 0..total_pieces {
            bitfield.set_piece(index);
        }
        bitfield
    }

    #[tokio::test]
    async fn test_requeue_missing_pieces_seeds_queue_in_index_order() {
        let state = DownloadState::new(create_pieces_hashmap(4));
        state.mark_piece_downloaded(1).await;

        let requeued = state.requeue_missing_pieces().await;

        assert_eq!(requeued, 3);
        let queue = state.pieces_queue.lock().await;
        let indices: Vec<u32> = queue.iter().map(|piece| piece.index()).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn test_requeue_missing_pieces_skips_already_queued() {
        let state = DownloadState::new(create_pieces_hashmap(3));
        state.requeue_missing_pieces().await;

        let requeued = state.requeue_missing_pieces().await;

        assert_eq!(requeued, 0);
        assert_eq!(state.pieces_queue.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_assign_piece_claims_first_eligible() {
        let state = DownloadState::new(create_pieces_hashmap(3));
        state.requeue_missing_pieces().await;

        let piece = state.assign_piece(&full_peer_bitfield(3)).await.unwrap();

        assert_eq!(piece.index(), 0);
        assert!(state.is_assigned(0).await);
        assert_eq!(state.pieces_queue.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_assign_piece_skips_pieces_peer_lacks() {
        let state = DownloadState::new(create_pieces_hashmap(3));
        state.requeue_missing_pieces().await;

        let mut peer_bitfield = Bitfield::new(3);
        peer_bitfield.set_piece(2);

        let piece = state.assign_piece(&peer_bitfield).await.unwrap();
        assert_eq!(piece.index(), 2);

        // The scan found nothing else the peer can serve
        assert!(state.assign_piece(&peer_bitfield).await.is_none());
    }

    #[tokio::test]
    async fn test_assign_piece_returns_none_for_empty_peer() {
        let state = DownloadState::new(create_pieces_hashmap(3));
        state.requeue_missing_pieces().await;

        assert!(state.assign_piece(&Bitfield::new(3)).await.is_none());
    }

    #[tokio::test]
    async fn test_assign_piece_skips_downloaded_pieces() {
        let state = DownloadState::new(create_pieces_hashmap(2));
        state.requeue_missing_pieces().await;
        state.mark_piece_downloaded(0).await;

        let piece = state.assign_piece(&full_peer_bitfield(2)).await.unwrap();

        assert_eq!(piece.index(), 1);
    }

    #[tokio::test]
    async fn test_no_double_claim_under_contention() {
        let state = Arc::new(DownloadState::new(create_pieces_hashmap(1)));
        state.requeue_missing_pieces().await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                state.assign_piece(&full_peer_bitfield(1)).await
            }));
        }

        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claims += 1;
            }
        }

        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn test_complete_piece_sets_bit_and_releases_claim() {
        let state = DownloadState::new(create_pieces_hashmap(2));
        state.requeue_missing_pieces().await;
        let piece = state.assign_piece(&full_peer_bitfield(2)).await.unwrap();

        state.complete_piece(piece.index()).await;

        assert!(state.has_piece(0).await);
        assert!(!state.is_assigned(0).await);
        assert!(!state.is_complete().await);

        let piece = state.assign_piece(&full_peer_bitfield(2)).await.unwrap();
        state.complete_piece(piece.index()).await;
        assert!(state.is_complete().await);
    }

    #[tokio::test]
    async fn test_redistribute_pieces_requeues_each_distinct_index_once() {
        let state = DownloadState::new(create_pieces_hashmap(12));
        state.requeue_missing_pieces().await;

        let peer_bitfield = full_peer_bitfield(12);
        let first = state.assign_piece(&peer_bitfield).await.unwrap();
        let second = state.assign_piece(&peer_bitfield).await.unwrap();
        let queue_len = state.pieces_queue.lock().await.len();

        // Three outstanding block requests spread over two pieces
        let outstanding = vec![first.index(), first.index(), second.index()];
        let requeued = state.redistribute_pieces(&outstanding).await;

        assert_eq!(requeued, 2);
        assert_eq!(state.pieces_queue.lock().await.len(), queue_len + 2);
        assert!(!state.is_assigned(first.index()).await);
        assert!(!state.is_assigned(second.index()).await);
    }

    #[tokio::test]
    async fn test_redistribute_pieces_skips_downloaded() {
        let state = DownloadState::new(create_pieces_hashmap(2));
        state.requeue_missing_pieces().await;
        let piece = state.assign_piece(&full_peer_bitfield(2)).await.unwrap();
        state.complete_piece(piece.index()).await;

        let requeued = state.redistribute_pieces(&[piece.index()]).await;

        assert_eq!(requeued, 0);
    }

    #[tokio::test]
    async fn test_requeue_missing_pieces_revokes_stale_claims() {
        let state = DownloadState::new(create_pieces_hashmap(2));
        state.requeue_missing_pieces().await;
        let piece = state.assign_piece(&full_peer_bitfield(2)).await.unwrap();
        assert!(state.is_assigned(piece.index()).await);

        let requeued = state.requeue_missing_pieces().await;

        assert_eq!(requeued, 1);
        assert!(!state.is_assigned(piece.index()).await);
        assert_eq!(state.pieces_queue.lock().await.len(), 2);
    }

    #[test]
    fn test_piece_sizes_follow_index_order() {
        let mut pieces_map = HashMap::new();
        pieces_map.insert(0, Piece::new(0, 16384, [0u8; 20]));
        pieces_map.insert(1, Piece::new(1, 16384, [1u8; 20]));
        pieces_map.insert(2, Piece::new(2, 4096, [2u8; 20]));
        let state = DownloadState::new(pieces_map);

        assert_eq!(state.piece_sizes(), vec![16384, 16384, 4096]);
    }

    #[tokio::test]
    async fn test_has_missing_pieces() {
        let state = DownloadState::new(create_pieces_hashmap(3));
        state.mark_piece_downloaded(0).await;

        let mut peer_bitfield = Bitfield::new(3);
        peer_bitfield.set_piece(0);
        assert!(!state.has_missing_pieces(&peer_bitfield).await);

        peer_bitfield.set_piece(2);
        assert!(state.has_missing_pieces(&peer_bitfield).await);
    }

    #[tokio::test]
    async fn test_idle_peer_tracking() {
        let state = DownloadState::new(create_pieces_hashmap(1));

        state.set_peer_idle("peer-a", true).await;
        state.set_peer_idle("peer-b", true).await;
        state.set_peer_idle("peer-a", true).await;
        assert_eq!(state.idle_peers_count().await, 2);

        state.set_peer_idle("peer-a", false).await;
        assert_eq!(state.idle_peers_count().await, 1);
    }

    #[tokio::test]
    async fn test_downloaded_bytes_accumulate() {
        let state = DownloadState::new(create_pieces_hashmap(1));

        state.add_downloaded_bytes(16384);
        state.add_downloaded_bytes(4096);

        assert_eq!(state.downloaded_bytes(), 20480);
    }

    #[tokio::test]
    async fn test_has_remaining_work() {
        let state = DownloadState::new(create_pieces_hashmap(1));
        assert!(!state.has_remaining_work().await);

        state.requeue_missing_pieces().await;
        assert!(state.has_remaining_work().await);

        let piece = state.assign_piece(&full_peer_bitfield(1)).await.unwrap();
        assert!(state.has_remaining_work().await);

        state.complete_piece(piece.index()).await;
        assert!(!state.has_remaining_work().await);
    }
}
