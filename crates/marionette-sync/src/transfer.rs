//! Chunked Transfer Engine.
//!
//! Moves one binary asset over a channel with bounded message size. The
//! sender paces chunks out on [`TransferEngine::tick`] and keeps the source
//! around to answer `chunk-request`s. The receiver reassembles in index
//! order, re-requests missing indices in bounded rounds, and supersedes a
//! buffer when a new transfer announces a different chunk count.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use marionette_net::{AssetKind, Chunk, ChunkRequest, Message, PeerId, TransferComplete};

use crate::error::TransferError;

/// Number of chunks needed for `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Byte range of chunk `index`. The last chunk may be short.
pub fn chunk_range(index: usize, chunk_size: usize, len: usize) -> Range<usize> {
    let chunk_size = chunk_size.max(1);
    let start = (index * chunk_size).min(len);
    let end = (start + chunk_size).min(len);
    start..end
}

/// Pacing and retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Maximum payload bytes per chunk.
    pub chunk_size: usize,
    /// Delay between consecutive chunks of one transfer.
    pub chunk_delay: Duration,
    /// Request rounds before a receive fails.
    pub max_retries: u32,
    /// Spacing of request rounds after the first.
    pub retry_interval: Duration,
    /// How long a sender keeps a finished source for re-requests.
    pub source_retention: Duration,
    /// Largest `total_chunks` accepted in either direction.
    pub max_chunks: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 16_000,
            chunk_delay: Duration::from_millis(20),
            max_retries: 5,
            retry_interval: Duration::from_secs(2),
            source_retention: Duration::from_secs(60),
            max_chunks: 4_096,
        }
    }
}

impl From<&marionette_config::TransferConfig> for TransferOptions {
    fn from(config: &marionette_config::TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            max_retries: config.max_retries,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            source_retention: Duration::from_millis(config.source_retention_ms),
            max_chunks: config.max_chunks.max(1),
        }
    }
}

/// Which way an asset is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We are the source.
    Send,
    /// We are reassembling.
    Receive,
}

/// Stage reported to the progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Chunks are moving.
    Transferring,
    /// Reassembled; the asset loader is working on it.
    Loading,
    /// Done.
    Complete,
    /// Failed; the transfer is discarded.
    Error,
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Remote side of the transfer.
    pub peer_id: PeerId,
    /// Asset class.
    pub asset: AssetKind,
    /// Which way it moves.
    pub direction: Direction,
    /// Chunks sent or received so far.
    pub chunks_complete: usize,
    /// Chunks in the whole asset.
    pub total_chunks: usize,
    /// Stage.
    pub status: TransferStatus,
}

/// A message the engine wants delivered to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Addressee.
    pub to: PeerId,
    /// Message.
    pub message: Message,
}

/// A fully received asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledAsset {
    /// Sender.
    pub peer_id: PeerId,
    /// Asset class.
    pub asset: AssetKind,
    /// Chunks the asset arrived in.
    pub total_chunks: usize,
    /// Bytes in original order.
    pub bytes: Vec<u8>,
}

/// A receive that ended in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    /// Sender.
    pub peer_id: PeerId,
    /// Asset class.
    pub asset: AssetKind,
    /// Cause.
    pub error: TransferError,
}

/// Everything one engine call produced.
#[derive(Debug, Default)]
pub struct TransferOutput {
    /// Messages to send.
    pub outgoing: Vec<OutgoingMessage>,
    /// Progress reports in order.
    pub progress: Vec<TransferProgress>,
    /// Assets ready for the loader.
    pub reassembled: Vec<ReassembledAsset>,
    /// Receives that failed.
    pub failed: Vec<FailedTransfer>,
}

impl TransferOutput {
    /// Whether the call produced nothing.
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty()
            && self.progress.is_empty()
            && self.reassembled.is_empty()
            && self.failed.is_empty()
    }

    fn merge(&mut self, other: TransferOutput) {
        self.outgoing.extend(other.outgoing);
        self.progress.extend(other.progress);
        self.reassembled.extend(other.reassembled);
        self.failed.extend(other.failed);
    }
}

/// Receive-side reassembly state.
#[derive(Debug, Clone)]
pub struct TransferBuffer {
    chunks: Vec<Option<Vec<u8>>>,
    received_count: usize,
    retries: u32,
    expected_size: Option<u64>,
    next_retry_at: Option<u64>,
}

impl TransferBuffer {
    fn new(total_chunks: usize) -> Self {
        Self {
            chunks: vec![None; total_chunks],
            received_count: 0,
            retries: 0,
            expected_size: None,
            next_retry_at: None,
        }
    }

    /// Chunks in the transfer.
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Distinct chunks received.
    pub fn received_count(&self) -> usize {
        self.received_count
    }

    /// Request rounds issued so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether every index is filled.
    pub fn is_complete(&self) -> bool {
        self.received_count == self.chunks.len() && self.chunks.iter().all(Option::is_some)
    }

    /// Indices still empty, ascending.
    pub fn missing(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.is_none().then_some(i))
            .collect()
    }

    /// Store chunk `index`. Returns `false` for a duplicate.
    fn fill(&mut self, index: usize, bytes: Vec<u8>) -> bool {
        match self.chunks.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(bytes);
                self.received_count += 1;
                true
            }
            _ => false,
        }
    }

    fn concat(self) -> Vec<u8> {
        self.chunks.into_iter().flatten().flatten().collect()
    }
}

#[derive(Debug, Clone)]
struct OutboundTransfer {
    source: Arc<[u8]>,
    total_chunks: usize,
    next_index: usize,
    next_due_at: u64,
    completed_at: Option<u64>,
}

impl OutboundTransfer {
    fn is_pacing(&self) -> bool {
        self.next_index < self.total_chunks
    }
}

type TransferKey = (PeerId, AssetKind);

/// Send and receive state for every transfer of one session.
#[derive(Debug)]
pub struct TransferEngine {
    local: PeerId,
    options: TransferOptions,
    outbound: HashMap<TransferKey, OutboundTransfer>,
    inbound: HashMap<TransferKey, TransferBuffer>,
}

impl TransferEngine {
    /// Engine for `local`.
    pub fn new(local: PeerId, options: TransferOptions) -> Self {
        Self {
            local,
            options,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    /// Options in use.
    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    // -- send ---------------------------------------------------------------

    /// Queue `source` for `to`. Chunks go out on subsequent ticks.
    ///
    /// A second request for the same peer and asset is rejected while the
    /// first is still pacing chunks out.
    pub fn start_send(
        &mut self,
        to: &PeerId,
        asset: AssetKind,
        source: Arc<[u8]>,
        now: u64,
    ) -> Result<TransferProgress, TransferError> {
        if source.is_empty() {
            return Err(TransferError::EmptyAsset);
        }
        let key = (to.clone(), asset);
        if self.outbound.get(&key).is_some_and(OutboundTransfer::is_pacing) {
            return Err(TransferError::AlreadyInFlight {
                peer: to.clone(),
                asset,
            });
        }
        let total_chunks = chunk_count(source.len(), self.options.chunk_size);
        if total_chunks > self.options.max_chunks {
            return Err(TransferError::TooLarge {
                chunks: total_chunks,
                limit: self.options.max_chunks,
            });
        }
        tracing::info!(
            "Sending {:?} to {} ({} bytes, {} chunks)",
            asset,
            to,
            source.len(),
            total_chunks
        );
        self.outbound.insert(
            key,
            OutboundTransfer {
                source,
                total_chunks,
                next_index: 0,
                next_due_at: now,
                completed_at: None,
            },
        );
        Ok(TransferProgress {
            peer_id: to.clone(),
            asset,
            direction: Direction::Send,
            chunks_complete: 0,
            total_chunks,
            status: TransferStatus::Transferring,
        })
    }

    /// Whether chunks of `asset` are still being paced out to `to`.
    pub fn is_sending(&self, to: &PeerId, asset: AssetKind) -> bool {
        self.outbound
            .get(&(to.clone(), asset))
            .is_some_and(OutboundTransfer::is_pacing)
    }

    /// Answer a `chunk-request` from `from` by re-slicing the held source.
    pub fn on_chunk_request(&self, from: &PeerId, request: &ChunkRequest) -> Option<OutgoingMessage> {
        let Some(transfer) = self.outbound.get(&(from.clone(), request.asset)) else {
            tracing::warn!(
                "{}",
                TransferError::UnknownTransfer {
                    peer: from.clone(),
                    asset: request.asset,
                }
            );
            return None;
        };
        let index = request.index as usize;
        if index >= transfer.total_chunks {
            tracing::warn!("Chunk request for index {} out of {} from {}", index, transfer.total_chunks, from);
            return None;
        }
        tracing::debug!("Resending {:?} chunk {} to {}", request.asset, index, from);
        Some(self.chunk_message(from, request.asset, transfer, index))
    }

    fn chunk_message(&self, to: &PeerId, asset: AssetKind, transfer: &OutboundTransfer, index: usize) -> OutgoingMessage {
        let range = chunk_range(index, self.options.chunk_size, transfer.source.len());
        OutgoingMessage {
            to: to.clone(),
            message: Message::Chunk(Chunk {
                target: to.clone(),
                asset,
                index: index as u32,
                total_chunks: transfer.total_chunks as u32,
                bytes: transfer.source[range].to_vec(),
            }),
        }
    }

    // -- receive ------------------------------------------------------------

    /// Store a chunk from `from`.
    pub fn on_chunk(&mut self, from: &PeerId, chunk: Chunk) -> TransferOutput {
        let mut output = TransferOutput::default();
        let total = chunk.total_chunks as usize;
        let index = chunk.index as usize;
        if total == 0 || index >= total || total > self.options.max_chunks {
            tracing::warn!("Dropping chunk {} of {} from {}", index, total, from);
            return output;
        }

        let key = (from.clone(), chunk.asset);
        if self.inbound.get(&key).is_some_and(|b| b.total_chunks() != total) {
            tracing::debug!("New {:?} transfer from {} supersedes the previous one", chunk.asset, from);
            self.inbound.remove(&key);
        }
        let buffer = self
            .inbound
            .entry(key.clone())
            .or_insert_with(|| TransferBuffer::new(total));

        if !buffer.fill(index, chunk.bytes) {
            tracing::trace!("Duplicate chunk {} from {}", index, from);
            return output;
        }
        output.progress.push(TransferProgress {
            peer_id: from.clone(),
            asset: chunk.asset,
            direction: Direction::Receive,
            chunks_complete: buffer.received_count(),
            total_chunks: total,
            status: TransferStatus::Transferring,
        });
        if buffer.expected_size.is_some() && buffer.is_complete() {
            output.merge(self.finish(key));
        }
        output
    }

    /// The sender announced the end of a transfer.
    ///
    /// Finishes it when complete, otherwise issues the first request round.
    pub fn on_transfer_complete(&mut self, from: &PeerId, complete: &TransferComplete, now: u64) -> TransferOutput {
        let key = (from.clone(), complete.asset);
        let Some(buffer) = self.inbound.get_mut(&key) else {
            tracing::warn!(
                "{}",
                TransferError::UnknownTransfer {
                    peer: from.clone(),
                    asset: complete.asset,
                }
            );
            return TransferOutput::default();
        };
        buffer.expected_size = Some(complete.file_size);
        if buffer.is_complete() {
            return self.finish(key);
        }
        self.request_round(key, now)
    }

    /// Issue the next request round for `key`, or fail it if the rounds
    /// are used up.
    fn request_round(&mut self, key: TransferKey, now: u64) -> TransferOutput {
        let mut output = TransferOutput::default();
        let max_retries = self.options.max_retries;
        let Some(buffer) = self.inbound.get_mut(&key) else {
            return output;
        };
        if buffer.retries >= max_retries {
            let missing = buffer.missing().len();
            let rounds = buffer.retries;
            let total = buffer.total_chunks();
            let received = buffer.received_count();
            self.inbound.remove(&key);
            let (peer_id, asset) = key;
            let error = TransferError::MissingChunks { missing, rounds };
            tracing::warn!("{:?} transfer from {} failed: {}", asset, peer_id, error);
            output.progress.push(TransferProgress {
                peer_id: peer_id.clone(),
                asset,
                direction: Direction::Receive,
                chunks_complete: received,
                total_chunks: total,
                status: TransferStatus::Error,
            });
            output.failed.push(FailedTransfer { peer_id, asset, error });
            return output;
        }

        buffer.retries += 1;
        buffer.next_retry_at = Some(now + self.options.retry_interval.as_millis() as u64);
        let missing = buffer.missing();
        tracing::debug!(
            "Requesting {} missing {:?} chunks from {} (round {})",
            missing.len(),
            key.1,
            key.0,
            buffer.retries
        );
        for index in missing {
            output.outgoing.push(OutgoingMessage {
                to: key.0.clone(),
                message: Message::ChunkRequest(ChunkRequest {
                    target: key.0.clone(),
                    asset: key.1,
                    index: index as u32,
                }),
            });
        }
        output
    }

    fn finish(&mut self, key: TransferKey) -> TransferOutput {
        let mut output = TransferOutput::default();
        let Some(buffer) = self.inbound.remove(&key) else {
            return output;
        };
        let (peer_id, asset) = key;
        let total_chunks = buffer.total_chunks();
        let expected = buffer.expected_size;
        let bytes = buffer.concat();
        let actual = bytes.len() as u64;

        if let Some(expected) = expected.filter(|expected| *expected != actual) {
            let error = TransferError::SizeMismatch { expected, actual };
            tracing::warn!("{:?} transfer from {} failed: {}", asset, peer_id, error);
            output.progress.push(TransferProgress {
                peer_id: peer_id.clone(),
                asset,
                direction: Direction::Receive,
                chunks_complete: total_chunks,
                total_chunks,
                status: TransferStatus::Error,
            });
            output.failed.push(FailedTransfer { peer_id, asset, error });
            return output;
        }

        tracing::info!("Received {:?} from {} ({} bytes)", asset, peer_id, actual);
        output.progress.push(TransferProgress {
            peer_id: peer_id.clone(),
            asset,
            direction: Direction::Receive,
            chunks_complete: total_chunks,
            total_chunks,
            status: TransferStatus::Loading,
        });
        output.reassembled.push(ReassembledAsset {
            peer_id,
            asset,
            total_chunks,
            bytes,
        });
        output
    }

    /// Inbound buffer from `from`, if one is in flight.
    pub fn buffer(&self, from: &PeerId, asset: AssetKind) -> Option<&TransferBuffer> {
        self.inbound.get(&(from.clone(), asset))
    }

    // -- timers -------------------------------------------------------------

    /// Advance pacing, retention and retry timers to `now`.
    pub fn tick(&mut self, now: u64) -> TransferOutput {
        let mut output = TransferOutput::default();
        let chunk_delay = self.options.chunk_delay.as_millis() as u64;
        let retention = self.options.source_retention.as_millis() as u64;

        let due: Vec<TransferKey> = self
            .outbound
            .iter()
            .filter(|(_, t)| t.is_pacing() && t.next_due_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            let Some(transfer) = self.outbound.get(&key) else {
                continue;
            };
            let index = transfer.next_index;
            output.outgoing.push(self.chunk_message(&key.0, key.1, transfer, index));
            let Some(transfer) = self.outbound.get_mut(&key) else {
                continue;
            };
            transfer.next_index += 1;
            transfer.next_due_at = now + chunk_delay;
            let done = !transfer.is_pacing();
            output.progress.push(TransferProgress {
                peer_id: key.0.clone(),
                asset: key.1,
                direction: Direction::Send,
                chunks_complete: transfer.next_index,
                total_chunks: transfer.total_chunks,
                status: if done {
                    TransferStatus::Complete
                } else {
                    TransferStatus::Transferring
                },
            });
            if done {
                transfer.completed_at = Some(now);
                output.outgoing.push(OutgoingMessage {
                    to: key.0.clone(),
                    message: Message::TransferComplete(TransferComplete {
                        target: key.0.clone(),
                        asset: key.1,
                        file_size: transfer.source.len() as u64,
                    }),
                });
                tracing::debug!("Sent all {} {:?} chunks to {}", transfer.total_chunks, key.1, key.0);
            }
        }

        self.outbound
            .retain(|_, t| t.completed_at.is_none_or(|at| now < at.saturating_add(retention)));

        let retry_due: Vec<TransferKey> = self
            .inbound
            .iter()
            .filter(|(_, b)| b.next_retry_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in retry_due {
            output.merge(self.request_round(key, now));
        }
        output
    }

    /// Earliest time a tick has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        let pacing = self
            .outbound
            .values()
            .filter(|t| t.is_pacing())
            .map(|t| t.next_due_at);
        let retries = self.inbound.values().filter_map(|b| b.next_retry_at);
        pacing.chain(retries).min()
    }

    // -- teardown -----------------------------------------------------------

    /// Drop every transfer with `peer`.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.outbound.retain(|(p, _), _| p != peer);
        self.inbound.retain(|(p, _), _| p != peer);
    }

    /// Drop every transfer.
    pub fn cancel_all(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }

    /// The local peer id.
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunk_size: usize) -> TransferOptions {
        TransferOptions {
            chunk_size,
            chunk_delay: Duration::from_millis(10),
            max_retries: 3,
            retry_interval: Duration::from_millis(100),
            source_retention: Duration::from_millis(1_000),
            max_chunks: 16,
        }
    }

    fn asset(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn chunks_of(output: &TransferOutput) -> Vec<Chunk> {
        output
            .outgoing
            .iter()
            .filter_map(|m| match &m.message {
                Message::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn complete_of(output: &TransferOutput) -> Option<TransferComplete> {
        output.outgoing.iter().find_map(|m| match &m.message {
            Message::TransferComplete(c) => Some(c.clone()),
            _ => None,
        })
    }

    fn requested(output: &TransferOutput) -> Vec<u32> {
        output
            .outgoing
            .iter()
            .filter_map(|m| match &m.message {
                Message::ChunkRequest(r) => Some(r.index),
                _ => None,
            })
            .collect()
    }

    /// Drive a sender until it has emitted everything.
    fn send_all(sender: &mut TransferEngine, to: &PeerId, source: Arc<[u8]>) -> (Vec<Chunk>, TransferComplete) {
        sender.start_send(to, AssetKind::Avatar, source, 0).unwrap();
        let mut chunks = Vec::new();
        let mut now = 0;
        loop {
            let output = sender.tick(now);
            chunks.extend(chunks_of(&output));
            if let Some(done) = complete_of(&output) {
                return (chunks, done);
            }
            now += 10;
        }
    }

    #[test]
    fn test_chunk_math() {
        assert_eq!(chunk_count(25_000, 6_000), 5);
        assert_eq!(chunk_count(6_000, 6_000), 1);
        assert_eq!(chunk_count(1, 6_000), 1);
        assert_eq!(chunk_range(4, 6_000, 25_000), 24_000..25_000);
        assert_eq!(chunk_range(5, 6_000, 25_000), 25_000..25_000);
    }

    #[test]
    fn test_missing_chunk_requested_then_reassembled() {
        let host = PeerId::from("host");
        let guest = PeerId::from("guest");
        let source = asset(25_000);
        let mut sender = TransferEngine::new(host.clone(), options(6_000));
        let mut receiver = TransferEngine::new(guest.clone(), options(6_000));

        let (chunks, done) = send_all(&mut sender, &guest, source.clone());
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.iter().map(|c| c.bytes.len()).collect::<Vec<_>>(), vec![6_000, 6_000, 6_000, 6_000, 1_000]);
        assert_eq!(done.file_size, 25_000);

        for chunk in chunks.iter().filter(|c| c.index != 1) {
            receiver.on_chunk(&host, chunk.clone());
        }
        let output = receiver.on_transfer_complete(&host, &done, 1_000);
        assert_eq!(requested(&output), vec![1]);
        assert!(output.outgoing.iter().all(|m| m.to == host));

        let Message::ChunkRequest(request) = &output.outgoing[0].message else {
            panic!("expected chunk-request");
        };
        let resend = sender.on_chunk_request(&guest, request).unwrap();
        let Message::Chunk(chunk) = resend.message else {
            panic!("expected chunk");
        };
        let output = receiver.on_chunk(&host, chunk);
        assert_eq!(output.reassembled.len(), 1);
        assert_eq!(output.reassembled[0].bytes, source.to_vec());
        assert_eq!(output.progress.last().unwrap().status, TransferStatus::Loading);
        assert!(receiver.buffer(&host, AssetKind::Avatar).is_none());
    }

    #[test]
    fn test_duplicate_chunk_counted_once() {
        let host = PeerId::from("host");
        let mut receiver = TransferEngine::new(PeerId::from("g"), options(4));
        let chunk = Chunk {
            target: PeerId::from("g"),
            asset: AssetKind::Avatar,
            index: 0,
            total_chunks: 2,
            bytes: vec![1, 2, 3, 4],
        };
        receiver.on_chunk(&host, chunk.clone());
        let again = receiver.on_chunk(&host, Chunk { bytes: vec![9; 4], ..chunk });
        assert!(again.progress.is_empty());
        let buffer = receiver.buffer(&host, AssetKind::Avatar).unwrap();
        assert_eq!(buffer.received_count(), 1);
        assert_eq!(buffer.missing(), vec![1]);
    }

    #[test]
    fn test_any_arrival_order_reassembles() {
        let host = PeerId::from("host");
        let guest = PeerId::from("guest");
        let source = asset(1_003);
        let mut sender = TransferEngine::new(host.clone(), options(100));
        let mut receiver = TransferEngine::new(guest.clone(), options(100));
        let (mut chunks, done) = send_all(&mut sender, &guest, source.clone());
        chunks.reverse();
        chunks.swap(0, 5);

        for chunk in chunks {
            assert!(receiver.on_chunk(&host, chunk).reassembled.is_empty());
        }
        let output = receiver.on_transfer_complete(&host, &done, 0);
        assert_eq!(output.reassembled[0].bytes, source.to_vec());
        assert_eq!(output.reassembled[0].total_chunks, 11);
    }

    #[test]
    fn test_retry_rounds_are_bounded() {
        let host = PeerId::from("host");
        let mut receiver = TransferEngine::new(PeerId::from("g"), options(4));
        receiver.on_chunk(
            &host,
            Chunk {
                target: PeerId::from("g"),
                asset: AssetKind::Avatar,
                index: 0,
                total_chunks: 3,
                bytes: vec![0; 4],
            },
        );
        let complete = TransferComplete {
            target: PeerId::from("g"),
            asset: AssetKind::Avatar,
            file_size: 12,
        };

        let first = receiver.on_transfer_complete(&host, &complete, 0);
        assert_eq!(requested(&first), vec![1, 2]);
        assert!(requested(&receiver.tick(50)).is_empty());
        assert_eq!(requested(&receiver.tick(100)), vec![1, 2]);
        assert_eq!(requested(&receiver.tick(200)), vec![1, 2]);
        assert_eq!(receiver.buffer(&host, AssetKind::Avatar).unwrap().retries(), 3);

        let exhausted = receiver.tick(300);
        assert!(requested(&exhausted).is_empty());
        assert_eq!(exhausted.progress[0].status, TransferStatus::Error);
        assert_eq!(
            exhausted.failed[0].error,
            TransferError::MissingChunks { missing: 2, rounds: 3 }
        );
        assert!(receiver.buffer(&host, AssetKind::Avatar).is_none());
        assert!(receiver.tick(1_000).is_empty());
    }

    #[test]
    fn test_new_total_supersedes_buffer() {
        let host = PeerId::from("host");
        let mut receiver = TransferEngine::new(PeerId::from("g"), options(4));
        let chunk = |index, total| Chunk {
            target: PeerId::from("g"),
            asset: AssetKind::Avatar,
            index,
            total_chunks: total,
            bytes: vec![index as u8; 4],
        };
        receiver.on_chunk(&host, chunk(0, 3));
        receiver.on_chunk(&host, chunk(1, 3));
        receiver.on_chunk(&host, chunk(1, 2));

        let buffer = receiver.buffer(&host, AssetKind::Avatar).unwrap();
        assert_eq!(buffer.total_chunks(), 2);
        assert_eq!(buffer.received_count(), 1);
        assert_eq!(buffer.missing(), vec![0]);
    }

    #[test]
    fn test_oversized_total_is_dropped() {
        let host = PeerId::from("host");
        let mut receiver = TransferEngine::new(PeerId::from("g"), options(4));
        let output = receiver.on_chunk(
            &host,
            Chunk {
                target: PeerId::from("g"),
                asset: AssetKind::Avatar,
                index: 0,
                total_chunks: 40_000_000,
                bytes: vec![1],
            },
        );
        assert!(output.is_empty());
        assert!(receiver.buffer(&host, AssetKind::Avatar).is_none());

        // the limit itself is still accepted
        let output = receiver.on_chunk(
            &host,
            Chunk {
                target: PeerId::from("g"),
                asset: AssetKind::Avatar,
                index: 0,
                total_chunks: 16,
                bytes: vec![1; 4],
            },
        );
        assert_eq!(output.progress.len(), 1);
        assert_eq!(receiver.buffer(&host, AssetKind::Avatar).unwrap().total_chunks(), 16);
    }

    #[test]
    fn test_oversized_asset_is_not_sent() {
        let mut sender = TransferEngine::new(PeerId::from("host"), options(4));
        let guest = PeerId::from("guest");
        assert_eq!(
            sender.start_send(&guest, AssetKind::Avatar, asset(65), 0),
            Err(TransferError::TooLarge { chunks: 17, limit: 16 })
        );
        assert!(sender.start_send(&guest, AssetKind::Avatar, asset(64), 0).is_ok());
    }

    #[test]
    fn test_size_mismatch_fails_transfer() {
        let host = PeerId::from("host");
        let mut receiver = TransferEngine::new(PeerId::from("g"), options(4));
        receiver.on_chunk(
            &host,
            Chunk {
                target: PeerId::from("g"),
                asset: AssetKind::Background,
                index: 0,
                total_chunks: 1,
                bytes: vec![1, 2, 3],
            },
        );
        let output = receiver.on_transfer_complete(
            &host,
            &TransferComplete {
                target: PeerId::from("g"),
                asset: AssetKind::Background,
                file_size: 4,
            },
            0,
        );
        assert!(output.reassembled.is_empty());
        assert_eq!(
            output.failed[0].error,
            TransferError::SizeMismatch { expected: 4, actual: 3 }
        );
    }

    #[test]
    fn test_duplicate_send_rejected_while_pacing() {
        let guest = PeerId::from("guest");
        let mut sender = TransferEngine::new(PeerId::from("host"), options(4));
        sender.start_send(&guest, AssetKind::Avatar, asset(8), 0).unwrap();
        assert_eq!(
            sender.start_send(&guest, AssetKind::Avatar, asset(8), 0),
            Err(TransferError::AlreadyInFlight {
                peer: guest.clone(),
                asset: AssetKind::Avatar,
            })
        );
        assert!(sender.start_send(&guest, AssetKind::Background, asset(8), 0).is_ok());

        sender.tick(0);
        sender.tick(10);
        assert!(!sender.is_sending(&guest, AssetKind::Avatar));
        assert!(sender.start_send(&guest, AssetKind::Avatar, asset(8), 20).is_ok());
        assert_eq!(sender.start_send(&guest, AssetKind::Avatar, Arc::from(Vec::new()), 20), Err(TransferError::EmptyAsset));
    }

    #[test]
    fn test_chunks_are_paced() {
        let guest = PeerId::from("guest");
        let mut sender = TransferEngine::new(PeerId::from("host"), options(4));
        sender.start_send(&guest, AssetKind::Avatar, asset(12), 0).unwrap();
        assert_eq!(chunks_of(&sender.tick(0)).len(), 1);
        assert!(chunks_of(&sender.tick(5)).is_empty());
        assert_eq!(sender.next_deadline(), Some(10));
        assert_eq!(chunks_of(&sender.tick(10)).len(), 1);
    }

    #[test]
    fn test_source_retained_then_released() {
        let guest = PeerId::from("guest");
        let mut sender = TransferEngine::new(PeerId::from("host"), options(4));
        sender.start_send(&guest, AssetKind::Avatar, asset(4), 0).unwrap();
        sender.tick(0);
        let request = ChunkRequest {
            target: PeerId::from("host"),
            asset: AssetKind::Avatar,
            index: 0,
        };
        assert!(sender.on_chunk_request(&guest, &request).is_some());
        sender.tick(1_000);
        assert!(sender.on_chunk_request(&guest, &request).is_none());
    }
}
