// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output surface brokerage.
//!
//! The pool hands `(VideoFrame, stable id)` pairs to the decoder, backed by
//! a consumer-side producer queue reached over IPC. Buffers are tracked by a
//! stable identity that survives producer swaps: allocations are detached
//! from the old producer and re-attached to the new one with refreshed
//! generation numbers, keeping the decoder's block<->buffer-index maps
//! valid across a surface change.

use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use anyhow::anyhow;
use log::error;
use log::warn;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use remain::sorted;
use thiserror::Error;

use crate::error::DecodeError;
use crate::error::DecodeResult;
use crate::task_runner::TaskRunner;
use crate::task_runner::TaskRunnerHandle;
use crate::HalPixelFormat;
use crate::Rect;
use crate::Size;

/// Status codes of the producer IPC surface.
#[sorted]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerError {
    #[error("invalid argument")]
    BadValue,
    #[error("producer not initialized")]
    NoInit,
    #[error("allocation failed")]
    NoMemory,
    #[error("timed out")]
    TimedOut,
    #[error("transport failed")]
    TransportFailed,
    #[error("would block")]
    WouldBlock,
}

pub type ProducerResult<T> = std::result::Result<T, ProducerError>;

impl From<ProducerError> for DecodeError {
    fn from(e: ProducerError) -> DecodeError {
        match e {
            ProducerError::TimedOut => DecodeError::TimedOut,
            ProducerError::WouldBlock => DecodeError::WouldBlock,
            ProducerError::NoMemory => DecodeError::NoMemory,
            ProducerError::BadValue => DecodeError::BadValue("producer rejected call".to_string()),
            ProducerError::NoInit => DecodeError::NotInitialized,
            ProducerError::TransportFailed => {
                DecodeError::Corrupted(anyhow!("producer transport failed"))
            }
        }
    }
}

/// Vendor connection type ('A','R','C',0) that makes the producer deliver
/// buffer-release notifications to our listener.
pub const CONNECTION_API_ARC: u32 = u32::from_be_bytes([b'A', b'R', b'C', 0]);

/// The format fixed at pool configuration; fetches must match it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferFormat {
    pub size: Size,
    pub format: HalPixelFormat,
    pub usage: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub stride: u32,
}

/// How the allocation is identified across re-imports.
#[derive(Clone, Debug)]
pub enum BlockHandle {
    /// Direct graphic-buffer allocation; identity is the DMA fd's inode.
    Dmabuf { fds: Vec<Arc<OwnedFd>> },
    /// Pool-backed allocation; identity travels in attached metadata.
    BufferPool { pool_id: u64, fds: Vec<Arc<OwnedFd>> },
}

/// A graphic allocation shared with the decoder by DMA.
#[derive(Clone, Debug)]
pub struct GraphicBlock {
    pub handle: BlockHandle,
    pub size: Size,
    pub format: HalPixelFormat,
    pub usage: u64,
    pub planes: Vec<PlaneLayout>,
    pub generation: u32,
}

impl GraphicBlock {
    /// Stable identity of the underlying allocation. Never allocates or
    /// blocks: either an fstat of the first plane fd or a metadata read.
    pub fn unique_id(&self) -> DecodeResult<u64> {
        match &self.handle {
            BlockHandle::Dmabuf { fds } => {
                let fd = fds.first().ok_or_else(|| {
                    DecodeError::Corrupted(anyhow!("graphic block carries no plane fd"))
                })?;
                let stat = nix::sys::stat::fstat(fd.as_raw_fd())
                    .map_err(|e| DecodeError::Corrupted(anyhow!("fstat on plane fd: {}", e)))?;
                Ok(stat.st_ino)
            }
            BlockHandle::BufferPool { pool_id, .. } => Ok(*pool_id),
        }
    }

    pub fn plane_fds(&self) -> &[Arc<OwnedFd>] {
        match &self.handle {
            BlockHandle::Dmabuf { fds } => fds,
            BlockHandle::BufferPool { fds, .. } => fds,
        }
    }
}

/// A sync fence guarding a dequeued slot. Bounded wait; a timeout is
/// reported as TimedOut and retried by the pool, never escalated.
pub struct Fence(pub OwnedFd);

pub const FENCE_WAIT_TIMEOUT: Duration = Duration::from_millis(16);

impl Fence {
    pub fn wait(&self, timeout: Duration) -> DecodeResult<()> {
        let mut fds = [PollFd::new(self.0.as_fd(), PollFlags::POLLIN)];
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Err(DecodeError::TimedOut),
            Ok(_) => Ok(()),
            Err(e) => Err(DecodeError::Corrupted(anyhow!("fence wait failed: {}", e))),
        }
    }
}

/// Receives producer-side notifications.
pub trait ProducerListener: Send + Sync {
    fn on_buffer_released(&self);
}

/// The consumer-side buffer queue, reached over IPC. Calls may block on the
/// remote end; the pool only touches it from its fetch worker.
pub trait ProducerQueue: Send {
    fn connect(
        &mut self,
        listener: Arc<dyn ProducerListener>,
        api: u32,
        controlled_by_app: bool,
    ) -> ProducerResult<()>;
    fn set_dequeue_timeout(&mut self, timeout_ns: i64) -> ProducerResult<()>;
    fn request_buffer(&mut self, slot: i32) -> ProducerResult<GraphicBlock>;
    fn set_max_dequeued_count(&mut self, count: usize) -> ProducerResult<()>;
    fn dequeue_buffer(&mut self, format: &BufferFormat) -> ProducerResult<(i32, Option<Fence>)>;
    fn detach_buffer(&mut self, slot: i32) -> ProducerResult<()>;
    fn attach_buffer(&mut self, block: &GraphicBlock) -> ProducerResult<i32>;
    fn cancel_buffer(&mut self, slot: i32) -> ProducerResult<()>;
    fn allow_allocation(&mut self, allow: bool) -> ProducerResult<()>;
    fn query(&self, what: u32) -> ProducerResult<i32>;
    fn get_unique_id(&self) -> ProducerResult<u64>;
}

/// A decoded-picture holder around a graphic block. Owned by the pool while
/// free, by the decoder while queued to the kernel, and released to the
/// client once dequeued with payload.
pub struct VideoFrame {
    block: GraphicBlock,
    bitstream_id: Option<i32>,
    visible_rect: Option<Rect>,
    pool_data: Option<PoolData>,
}

impl VideoFrame {
    pub fn block(&self) -> &GraphicBlock {
        &self.block
    }

    pub fn set_bitstream_id(&mut self, id: i32) {
        self.bitstream_id = Some(id);
    }

    pub fn bitstream_id(&self) -> Option<i32> {
        self.bitstream_id
    }

    pub fn set_visible_rect(&mut self, rect: Rect) {
        self.visible_rect = Some(rect);
    }

    pub fn visible_rect(&self) -> Option<Rect> {
        self.visible_rect
    }

    /// Marks the frame as handed across the IPC boundary; a shared frame is
    /// not cancelled back to the producer on drop.
    pub fn mark_shared(&self) {
        if let Some(data) = &self.pool_data {
            data.shared.store(true, Ordering::Release);
        }
    }

    #[cfg(test)]
    fn with_block(block: GraphicBlock) -> VideoFrame {
        VideoFrame { block, bitstream_id: None, visible_rect: None, pool_data: None }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        let Some(data) = self.pool_data.take() else {
            return;
        };
        if data.shared.load(Ordering::Acquire) {
            return;
        }
        let slot = data.slot;
        let shared = Arc::clone(&data.pool);
        data.worker.post(move || {
            let mut state = shared.state.lock().unwrap();
            if let Some(producer) = state.producer.as_mut() {
                if let Err(e) = producer.cancel_buffer(slot) {
                    warn!("failed to cancel slot {} on frame drop: {}", slot, e);
                }
            }
        });
    }
}

/// Keeps a strong handle back to the pool so a dropped frame can return its
/// producer slot even while the pool owner is tearing down.
struct PoolData {
    pool: Arc<PoolShared>,
    worker: TaskRunnerHandle,
    slot: i32,
    shared: AtomicBool,
}

pub type FetchCallback = Box<dyn FnOnce(DecodeResult<(VideoFrame, u64)>) + Send>;

struct TrackedBuffer {
    slot: i32,
    block: GraphicBlock,
}

const INITIAL_BACKOFF: Duration = Duration::from_micros(256);
const MAX_BACKOFF: Duration = Duration::from_millis(16);
const STALL_WARN_INTERVAL: u32 = 64;

struct PoolState {
    producer: Option<Box<dyn ProducerQueue>>,
    /// unique id -> tracked allocation; bijective with `slots` while stable.
    tracked: BTreeMap<u64, TrackedBuffer>,
    slots: BTreeMap<i32, u64>,
    target_count: usize,
    format: Option<BufferFormat>,
    reconfigure_pending: bool,
    /// Saved allocations awaiting re-attach after a producer swap.
    migrating: Vec<GraphicBlock>,
    generation: u32,
    armed_fetch: Option<FetchCallback>,
    backoff: Duration,
    consecutive_stalls: u32,
    dead: bool,
}

struct ReleaseSignal {
    released: bool,
    notify: Option<Box<dyn FnOnce() + Send>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    release: Mutex<ReleaseSignal>,
    worker: TaskRunnerHandle,
    client: TaskRunnerHandle,
}

struct ReleaseListener {
    shared: Weak<PoolShared>,
}

impl ProducerListener for ReleaseListener {
    fn on_buffer_released(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Take the closure under the lock, invoke it outside.
        let notify = {
            let mut signal = shared.release.lock().unwrap();
            match signal.notify.take() {
                Some(notify) => Some(notify),
                None => {
                    signal.released = true;
                    None
                }
            }
        };
        if let Some(notify) = notify {
            notify();
        }
    }
}

/// Brokers graphic blocks between the producer queue and the decoder.
pub struct SurfacePool {
    shared: Arc<PoolShared>,
    _worker: TaskRunner,
}

impl SurfacePool {
    /// `client` is the runner fetch callbacks are delivered on (the decoder
    /// runner); blocking producer calls run on an internal worker.
    pub fn new(client: TaskRunnerHandle) -> SurfacePool {
        let worker = TaskRunner::new("surface_pool");
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                producer: None,
                tracked: BTreeMap::new(),
                slots: BTreeMap::new(),
                target_count: 0,
                format: None,
                reconfigure_pending: false,
                migrating: Vec::new(),
                generation: 0,
                armed_fetch: None,
                backoff: INITIAL_BACKOFF,
                consecutive_stalls: 0,
                dead: false,
            }),
            release: Mutex::new(ReleaseSignal { released: false, notify: None }),
            worker: worker.handle(),
            client,
        });
        SurfacePool { shared, _worker: worker }
    }

    /// Switches the underlying producer. Tracked buffers are detached from
    /// the old producer and re-attached to the new one across subsequent
    /// fetches; `None` drops all tracking.
    pub fn configure_producer(&self, producer: Option<Box<dyn ProducerQueue>>) {
        let shared = Arc::clone(&self.shared);
        let weak = Arc::downgrade(&self.shared);
        self.shared.worker.post(move || {
            let mut state = shared.state.lock().unwrap();
            if state.dead {
                return;
            }
            let mut new_producer = match producer {
                Some(producer) => producer,
                None => {
                    state.producer = None;
                    state.tracked.clear();
                    state.slots.clear();
                    state.migrating.clear();
                    return;
                }
            };

            let listener = Arc::new(ReleaseListener { shared: weak });
            if let Err(e) = new_producer.connect(listener, CONNECTION_API_ARC, true) {
                error!("connecting new producer failed: {}", e);
                return;
            }
            if let Err(e) = new_producer.set_dequeue_timeout(0) {
                warn!("producer rejected dequeue timeout: {}", e);
            }

            // Detach every tracked buffer from the old producer and save the
            // allocations for migration.
            let entries: Vec<i32> = state.tracked.values().map(|t| t.slot).collect();
            if let Some(old) = state.producer.as_mut() {
                for slot in entries {
                    if let Err(e) = old.detach_buffer(slot) {
                        warn!("detach of slot {} from old producer failed: {}", slot, e);
                    }
                }
                let blocks: Vec<GraphicBlock> =
                    state.tracked.values().map(|t| t.block.clone()).collect();
                state.migrating = blocks;
                state.tracked.clear();
                state.slots.clear();
            }

            if let Err(e) = new_producer.allow_allocation(true) {
                warn!("allow_allocation on new producer failed: {}", e);
            }

            // Probe generation and usage with one temporary dequeue.
            if let Some(format) = state.format {
                match new_producer.dequeue_buffer(&format) {
                    Ok((slot, _fence)) => {
                        match new_producer.request_buffer(slot) {
                            Ok(block) => state.generation = block.generation,
                            Err(e) => warn!("probe request_buffer failed: {}", e),
                        }
                        if let Err(e) = new_producer.detach_buffer(slot) {
                            warn!("probe detach failed: {}", e);
                        }
                    }
                    Err(e) => warn!("probe dequeue failed: {}", e),
                }
            }

            state.producer = Some(new_producer);
        });
    }

    /// Stores the target buffer set; applied lazily by the next fetch.
    pub fn request_buffer_set(&self, count: usize, format: BufferFormat) {
        let shared = Arc::clone(&self.shared);
        self.shared.worker.post(move || {
            let mut state = shared.state.lock().unwrap();
            if state.dead {
                return;
            }
            state.target_count = count;
            state.format = Some(format);
            state.reconfigure_pending = true;
            if let Some(producer) = state.producer.as_mut() {
                if let Err(e) = producer.allow_allocation(true) {
                    warn!("allow_allocation failed: {}", e);
                }
            }
        });
    }

    /// Requests one free frame. At most one fetch may be outstanding; the
    /// callback runs on the client runner.
    pub fn fetch(&self, callback: FetchCallback) {
        let shared = Arc::clone(&self.shared);
        self.shared.worker.post(move || {
            {
                let mut state = shared.state.lock().unwrap();
                if state.dead {
                    return;
                }
                if state.armed_fetch.is_some() {
                    drop(state);
                    shared
                        .client
                        .post(move || callback(Err(DecodeError::BadValue(
                            "a fetch is already outstanding".to_string(),
                        ))));
                    return;
                }
                state.armed_fetch = Some(callback);
            }
            run_fetch(&shared);
        });
    }

    /// One-shot: fires when the producer signals a buffer release. Fires
    /// immediately if a release arrived while nothing was armed.
    pub fn notify_on_release(&self, callback: Box<dyn FnOnce() + Send>) {
        let pending = {
            let mut signal = self.shared.release.lock().unwrap();
            if signal.released {
                signal.released = false;
                Some(callback)
            } else {
                signal.notify = Some(callback);
                None
            }
        };
        if let Some(callback) = pending {
            // Invoked outside the signal lock.
            callback();
        }
    }

    /// Number of buffers currently tracked. Test and telemetry hook.
    pub fn tracked_buffers(&self) -> usize {
        self.shared.state.lock().unwrap().tracked.len()
    }

    /// Relinquishes the producer so a replacement pool can take it over
    /// (the pool itself is replaced wholesale on a resolution change).
    /// Blocks briefly on the fetch worker; tracking is left to die with
    /// this pool.
    pub fn detach_producer(&self) -> Option<Box<dyn ProducerQueue>> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .worker
            .post_and_wait(move || shared.state.lock().unwrap().producer.take())
            .flatten()
    }
}

impl Drop for SurfacePool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.dead = true;
        state.armed_fetch = None;
        state.producer = None;
    }
}

enum FetchStep {
    Deliver(VideoFrame, u64),
    Retry,
    WaitForRelease,
    Fail(DecodeError),
}

/// One pass of the fetch algorithm; reschedules itself on back-pressure.
fn run_fetch(shared: &Arc<PoolShared>) {
    let step = {
        let mut state = shared.state.lock().unwrap();
        if state.dead || state.armed_fetch.is_none() {
            return;
        }
        fetch_step(shared, &mut state)
    };

    match step {
        FetchStep::Deliver(frame, unique_id) => {
            let mut state = shared.state.lock().unwrap();
            state.backoff = INITIAL_BACKOFF;
            state.consecutive_stalls = 0;
            let Some(callback) = state.armed_fetch.take() else {
                return;
            };
            drop(state);
            shared.client.post(move || callback(Ok((frame, unique_id))));
        }
        FetchStep::Retry => {
            let mut state = shared.state.lock().unwrap();
            let backoff = state.backoff;
            state.backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            state.consecutive_stalls += 1;
            if state.consecutive_stalls % STALL_WARN_INTERVAL == 0 {
                warn!(
                    "surface fetch stalled for {} consecutive attempts",
                    state.consecutive_stalls
                );
            }
            drop(state);
            let weak = Arc::downgrade(shared);
            shared.worker.post_delayed(
                move || {
                    if let Some(shared) = weak.upgrade() {
                        run_fetch(&shared);
                    }
                },
                backoff,
            );
        }
        FetchStep::WaitForRelease => {
            let weak = Arc::downgrade(shared);
            let resume: Box<dyn FnOnce() + Send> = Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let worker = shared.worker.clone();
                    let inner = Arc::downgrade(&shared);
                    worker.post(move || {
                        if let Some(shared) = inner.upgrade() {
                            run_fetch(&shared);
                        }
                    });
                }
            });
            let fire_now = {
                let mut signal = shared.release.lock().unwrap();
                if signal.released {
                    signal.released = false;
                    true
                } else {
                    signal.notify = Some(resume);
                    false
                }
            };
            if fire_now {
                run_fetch(shared);
            }
        }
        FetchStep::Fail(error) => {
            let mut state = shared.state.lock().unwrap();
            let Some(callback) = state.armed_fetch.take() else {
                return;
            };
            drop(state);
            shared.client.post(move || callback(Err(error)));
        }
    }
}

fn fetch_step(shared: &Arc<PoolShared>, state: &mut PoolState) -> FetchStep {
    let Some(format) = state.format else {
        return FetchStep::Fail(DecodeError::NotInitialized);
    };
    let generation = state.generation;
    let target_count = state.target_count;

    // Migration pass: re-attach one saved allocation per fetch.
    if let Some(mut block) = state.migrating.pop() {
        let Some(producer) = state.producer.as_mut() else {
            return FetchStep::Fail(DecodeError::NotInitialized);
        };
        block.generation = generation;
        match producer.attach_buffer(&block) {
            Ok(slot) => {
                let unique_id = match block.unique_id() {
                    Ok(id) => id,
                    Err(e) => return FetchStep::Fail(e),
                };
                state.slots.insert(slot, unique_id);
                state
                    .tracked
                    .insert(unique_id, TrackedBuffer { slot, block: block.clone() });
                return deliver(shared, slot, block, unique_id);
            }
            Err(ProducerError::WouldBlock) | Err(ProducerError::TimedOut) => {
                // No free slot on the new producer yet; put the block back
                // and wait for the consumer to release one.
                state.migrating.push(block);
                return FetchStep::WaitForRelease;
            }
            Err(e) => return FetchStep::Fail(e.into()),
        }
    }

    let Some(producer) = state.producer.as_mut() else {
        return FetchStep::Fail(DecodeError::NotInitialized);
    };

    if state.reconfigure_pending {
        match producer.set_max_dequeued_count(target_count) {
            Ok(()) => state.reconfigure_pending = false,
            Err(ProducerError::WouldBlock) => return FetchStep::Retry,
            Err(e) => return FetchStep::Fail(e.into()),
        }
    }

    let (slot, fence) = match producer.dequeue_buffer(&format) {
        Ok(dequeued) => dequeued,
        Err(ProducerError::TimedOut) | Err(ProducerError::WouldBlock) => return FetchStep::Retry,
        Err(e) => return FetchStep::Fail(e.into()),
    };

    if let Some(fence) = fence {
        match fence.wait(FENCE_WAIT_TIMEOUT) {
            Ok(()) => {}
            Err(DecodeError::TimedOut) => {
                if let Err(e) = producer.cancel_buffer(slot) {
                    warn!("cancel after fence timeout failed: {}", e);
                }
                return FetchStep::Retry;
            }
            Err(e) => {
                let _ = producer.cancel_buffer(slot);
                return FetchStep::Fail(e);
            }
        }
    }

    if let Some(&unique_id) = state.slots.get(&slot) {
        // Known slot: reuse the tracked allocation, identity unchanged.
        let block = state.tracked[&unique_id].block.clone();
        return deliver(shared, slot, block, unique_id);
    }

    if state.tracked.len() >= target_count {
        // More buffers exist than needed; shed this one and throttle.
        if let Err(e) = producer.detach_buffer(slot) {
            warn!("detach of surplus slot {} failed: {}", slot, e);
        }
        return FetchStep::Retry;
    }

    let block = match producer.request_buffer(slot) {
        Ok(block) => block,
        Err(e) => return FetchStep::Fail(e.into()),
    };
    let unique_id = match block.unique_id() {
        Ok(id) => id,
        Err(e) => return FetchStep::Fail(e),
    };
    state.slots.insert(slot, unique_id);
    state
        .tracked
        .insert(unique_id, TrackedBuffer { slot, block: block.clone() });

    if state.tracked.len() == target_count {
        if let Err(e) = state.producer.as_mut().unwrap().allow_allocation(false) {
            warn!("disabling allocation failed: {}", e);
        }
    }

    deliver(shared, slot, block, unique_id)
}

fn deliver(
    shared: &Arc<PoolShared>,
    slot: i32,
    block: GraphicBlock,
    unique_id: u64,
) -> FetchStep {
    let frame = VideoFrame {
        block,
        bitstream_id: None,
        visible_rect: None,
        pool_data: Some(PoolData {
            pool: Arc::clone(shared),
            worker: shared.worker.clone(),
            slot,
            shared: AtomicBool::new(false),
        }),
    };
    FetchStep::Deliver(frame, unique_id)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeProducerState {
        pub listener: Option<Arc<dyn ProducerListener>>,
        pub generation: u32,
        pub max_dequeued: usize,
        pub next_slot: i32,
        pub next_pool_id: u64,
        pub free: Vec<i32>,
        pub dequeued: Vec<i32>,
        pub attached: BTreeMap<i32, GraphicBlock>,
        pub allow_allocation: bool,
        pub max_dequeued_blocks: bool,
        pub detach_count: usize,
        pub attach_count: usize,
        pub cancel_count: usize,
    }

    /// In-process stand-in for the consumer-side buffer queue.
    #[derive(Clone)]
    pub struct FakeProducer {
        pub state: Arc<Mutex<FakeProducerState>>,
    }

    impl FakeProducer {
        pub fn new(generation: u32) -> FakeProducer {
            FakeProducer {
                state: Arc::new(Mutex::new(FakeProducerState {
                    generation,
                    next_pool_id: 1000 * u64::from(generation),
                    ..Default::default()
                })),
            }
        }

        /// Simulates the consumer releasing one slot back to the producer.
        pub fn release_slot(&self, slot: i32) {
            let listener = {
                let mut state = self.state.lock().unwrap();
                state.dequeued.retain(|&s| s != slot);
                state.free.push(slot);
                state.listener.clone()
            };
            if let Some(listener) = listener {
                listener.on_buffer_released();
            }
        }

        pub fn dequeued_slots(&self) -> Vec<i32> {
            self.state.lock().unwrap().dequeued.clone()
        }
    }

    impl ProducerQueue for FakeProducer {
        fn connect(
            &mut self,
            listener: Arc<dyn ProducerListener>,
            api: u32,
            _controlled_by_app: bool,
        ) -> ProducerResult<()> {
            assert_eq!(api, CONNECTION_API_ARC);
            self.state.lock().unwrap().listener = Some(listener);
            Ok(())
        }

        fn set_dequeue_timeout(&mut self, _timeout_ns: i64) -> ProducerResult<()> {
            Ok(())
        }

        fn request_buffer(&mut self, slot: i32) -> ProducerResult<GraphicBlock> {
            let mut state = self.state.lock().unwrap();
            if let Some(block) = state.attached.get(&slot) {
                return Ok(block.clone());
            }
            let pool_id = state.next_pool_id;
            state.next_pool_id += 1;
            let block = GraphicBlock {
                handle: BlockHandle::BufferPool { pool_id, fds: Vec::new() },
                size: Size::new(320, 240),
                format: HalPixelFormat::Ycbcr420_888,
                usage: 0,
                planes: vec![PlaneLayout::default()],
                generation: state.generation,
            };
            state.attached.insert(slot, block.clone());
            Ok(block)
        }

        fn set_max_dequeued_count(&mut self, count: usize) -> ProducerResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.max_dequeued_blocks {
                return Err(ProducerError::WouldBlock);
            }
            state.max_dequeued = count;
            Ok(())
        }

        fn dequeue_buffer(
            &mut self,
            _format: &BufferFormat,
        ) -> ProducerResult<(i32, Option<Fence>)> {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.free.pop() {
                state.dequeued.push(slot);
                return Ok((slot, None));
            }
            if state.dequeued.len() >= state.max_dequeued || !state.allow_allocation {
                return Err(ProducerError::TimedOut);
            }
            let slot = state.next_slot;
            state.next_slot += 1;
            state.dequeued.push(slot);
            Ok((slot, None))
        }

        fn detach_buffer(&mut self, slot: i32) -> ProducerResult<()> {
            let mut state = self.state.lock().unwrap();
            state.detach_count += 1;
            state.attached.remove(&slot);
            state.dequeued.retain(|&s| s != slot);
            state.free.retain(|&s| s != slot);
            Ok(())
        }

        fn attach_buffer(&mut self, block: &GraphicBlock) -> ProducerResult<i32> {
            let mut state = self.state.lock().unwrap();
            if state.attached.len() + state.dequeued.len() >= state.max_dequeued {
                return Err(ProducerError::WouldBlock);
            }
            state.attach_count += 1;
            let slot = state.next_slot;
            state.next_slot += 1;
            state.attached.insert(slot, block.clone());
            state.dequeued.push(slot);
            Ok(slot)
        }

        fn cancel_buffer(&mut self, slot: i32) -> ProducerResult<()> {
            let mut state = self.state.lock().unwrap();
            state.cancel_count += 1;
            state.dequeued.retain(|&s| s != slot);
            state.free.push(slot);
            Ok(())
        }

        fn allow_allocation(&mut self, allow: bool) -> ProducerResult<()> {
            self.state.lock().unwrap().allow_allocation = allow;
            Ok(())
        }

        fn query(&self, _what: u32) -> ProducerResult<i32> {
            Ok(0)
        }

        fn get_unique_id(&self) -> ProducerResult<u64> {
            Ok(1)
        }
    }

    pub fn test_format() -> BufferFormat {
        BufferFormat {
            size: Size::new(320, 240),
            format: HalPixelFormat::Ycbcr420_888,
            usage: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::test_support::*;
    use super::*;

    fn fetch_blocking(
        pool: &SurfacePool,
        timeout: Duration,
    ) -> Option<DecodeResult<(VideoFrame, u64)>> {
        let (tx, rx) = mpsc::channel();
        pool.fetch(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv_timeout(timeout).ok()
    }

    fn client_runner() -> TaskRunner {
        let _ = env_logger::builder().is_test(true).try_init();
        TaskRunner::new("pool_client")
    }

    #[test]
    fn fetch_without_configuration_fails() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let result = fetch_blocking(&pool, Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(DecodeError::NotInitialized)));
    }

    #[test]
    fn fetches_track_up_to_target_count() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let producer = FakeProducer::new(1);
        pool.configure_producer(Some(Box::new(producer.clone())));
        pool.request_buffer_set(3, test_format());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (frame, id) = fetch_blocking(&pool, Duration::from_secs(2))
                .unwrap()
                .unwrap();
            frame.mark_shared();
            ids.push(id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "stable ids must be distinct");
        assert_eq!(pool.tracked_buffers(), 3);

        // All buffers are out; the next fetch must stall until a release.
        let (tx, rx) = mpsc::channel();
        pool.fetch(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        producer.release_slot(0);
        let (frame, id) = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        frame.mark_shared();
        assert!(ids.contains(&id), "released buffer keeps its identity");
    }

    #[test]
    fn unconfigured_producer_drops_tracking() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let producer = FakeProducer::new(1);
        pool.configure_producer(Some(Box::new(producer)));
        pool.request_buffer_set(2, test_format());
        for _ in 0..2 {
            fetch_blocking(&pool, Duration::from_secs(2))
                .unwrap()
                .unwrap()
                .0
                .mark_shared();
        }
        assert_eq!(pool.tracked_buffers(), 2);

        pool.configure_producer(None);
        // Wait for the worker to process the drop.
        while pool.tracked_buffers() != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn producer_swap_migrates_buffers_with_stable_ids() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let first = FakeProducer::new(1);
        pool.configure_producer(Some(Box::new(first.clone())));
        pool.request_buffer_set(8, test_format());

        let mut ids = Vec::new();
        for _ in 0..8 {
            let (frame, id) = fetch_blocking(&pool, Duration::from_secs(2))
                .unwrap()
                .unwrap();
            frame.mark_shared();
            ids.push(id);
        }

        let second = FakeProducer::new(2);
        {
            // The new producer must accept attaches and the probe dequeue.
            let mut state = second.state.lock().unwrap();
            state.max_dequeued = 16;
            state.allow_allocation = true;
        }
        pool.configure_producer(Some(Box::new(second.clone())));

        let mut migrated = Vec::new();
        for _ in 0..8 {
            let (frame, id) = fetch_blocking(&pool, Duration::from_secs(2))
                .unwrap()
                .unwrap();
            frame.mark_shared();
            migrated.push(id);
        }
        ids.sort_unstable();
        migrated.sort_unstable();
        assert_eq!(ids, migrated, "migration must preserve stable unique ids");
        assert!(first.state.lock().unwrap().detach_count >= 8);
        assert!(second.state.lock().unwrap().attach_count >= 8);
    }

    #[test]
    fn dropped_frame_cancels_slot_unless_shared() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let producer = FakeProducer::new(1);
        pool.configure_producer(Some(Box::new(producer.clone())));
        pool.request_buffer_set(1, test_format());

        let (frame, _) = fetch_blocking(&pool, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        drop(frame);
        // Cancellation is posted to the worker; wait for it.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while producer.state.lock().unwrap().cancel_count == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        let (frame, _) = fetch_blocking(&pool, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        frame.mark_shared();
        let cancels = producer.state.lock().unwrap().cancel_count;
        drop(frame);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(producer.state.lock().unwrap().cancel_count, cancels);
    }

    #[test]
    fn second_outstanding_fetch_is_rejected() {
        let client = client_runner();
        let pool = SurfacePool::new(client.handle());
        let producer = FakeProducer::new(1);
        pool.configure_producer(Some(Box::new(producer)));
        pool.request_buffer_set(1, test_format());

        // Exhaust the pool so the first fetch stays armed.
        fetch_blocking(&pool, Duration::from_secs(2))
            .unwrap()
            .unwrap()
            .0
            .mark_shared();
        let (tx, _rx) = mpsc::channel();
        pool.fetch(Box::new(move |result| {
            let _ = tx.send(result);
        }));

        let result = fetch_blocking(&pool, Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(DecodeError::BadValue(_))));
    }

    #[test]
    fn block_unique_id_uses_pool_metadata() {
        let block = GraphicBlock {
            handle: BlockHandle::BufferPool { pool_id: 42, fds: Vec::new() },
            size: Size::new(64, 64),
            format: HalPixelFormat::Ycbcr420_888,
            usage: 0,
            planes: Vec::new(),
            generation: 0,
        };
        assert_eq!(block.unique_id().unwrap(), 42);
        let frame = VideoFrame::with_block(block);
        assert!(frame.bitstream_id().is_none());
    }
}
