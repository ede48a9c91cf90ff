// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder state machine.
//!
//! Owns the M2M device and both queues, pumps the request FIFO into the
//! input queue, routes decoded pictures outward, and handles mid-stream
//! resolution changes, end-of-stream draining, and flush. Every method runs
//! on the decoder task runner; the device poller and the surface pool post
//! back onto it.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use anyhow::anyhow;
use log::error;
use log::info;
use log::warn;
use v4l2_sys::*;

use crate::device::DevicePoller;
use crate::device::V4l2Device;
use crate::device::DECODER_DEVICE_PATH;
use crate::error::DecodeError;
use crate::error::DecodeResult;
use crate::nal::contains_keyframe;
use crate::queue::BitstreamBuffer;
use crate::queue::InputQueue;
use crate::queue::OutputEvent;
use crate::queue::OutputQueue;
use crate::surface_pool::BufferFormat;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::VideoFrame;
use crate::task_runner::TaskRunnerHandle;
use crate::HalPixelFormat;
use crate::Rect;
use crate::Size;
use crate::VideoCodec;

/// Capture buffers allocated beyond the driver's advertised minimum.
pub const NUM_EXTRA_OUTPUT_BUFFERS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Decoding,
    Draining,
    Error,
}

pub type DecodeDoneCb = Box<dyn FnOnce(DecodeResult<()>) + Send>;
pub type OutputCb = Box<dyn FnMut(VideoFrame) + Send>;
pub type ErrorCb = Box<dyn FnMut(DecodeError) + Send>;
pub type PoolRequestCb =
    Box<dyn FnMut(usize, Size, HalPixelFormat) -> DecodeResult<SurfacePool> + Send>;

enum DecodeRequest {
    Decode {
        buffer: BitstreamBuffer,
        done: DecodeDoneCb,
    },
    Drain {
        done: DecodeDoneCb,
    },
}

pub struct DecoderOptions {
    pub codec: VideoCodec,
    pub secure: bool,
    pub input_buffer_size: u32,
    pub min_num_output_buffers: u32,
    pub device_path: PathBuf,
}

impl DecoderOptions {
    pub fn new(codec: VideoCodec) -> DecoderOptions {
        DecoderOptions {
            codec,
            secure: false,
            input_buffer_size: 1 << 20,
            min_num_output_buffers: 0,
            device_path: PathBuf::from(DECODER_DEVICE_PATH),
        }
    }
}

pub struct DecoderCallbacks {
    pub output_cb: OutputCb,
    pub error_cb: ErrorCb,
    pub pool_request_cb: PoolRequestCb,
}

/// Shared slot the runner tasks, the poller, and pool callbacks reach the
/// decoder through. Only ever locked from the decoder runner.
pub type DecoderCell = Arc<Mutex<Option<Decoder>>>;

pub struct Decoder {
    // Dropped first: polling stops before the queues and device go away.
    poller: DevicePoller,
    codec: VideoCodec,
    secure: bool,
    device: Arc<V4l2Device>,
    input: InputQueue,
    output: OutputQueue,
    cell: Weak<Mutex<Option<Decoder>>>,
    state: DecoderState,
    requests: VecDeque<DecodeRequest>,
    /// Callback per in-flight bitstream id; resolved on input dequeue.
    pending_decode_cbs: BTreeMap<i32, DecodeDoneCb>,
    drain_cb: Option<DecodeDoneCb>,
    output_cb: OutputCb,
    error_cb: Option<ErrorCb>,
    pool_request_cb: PoolRequestCb,
    pool: Option<SurfacePool>,
    /// Stable block id -> kernel capture buffer index.
    block_index: BTreeMap<u64, usize>,
    /// Frames reclaimed by flush, re-queued before fetching new ones so the
    /// block<->index mapping survives (the producer cannot return them all).
    reuse_frames: VecDeque<(u64, VideoFrame)>,
    /// The sentinel capture buffer is still armed; no resolution change yet.
    initial_eos_present: bool,
    /// A decodable unit was seen while the sentinel was armed.
    pending_drc: bool,
    fetch_in_flight: bool,
    min_num_output_buffers: u32,
    coded_size: Size,
    visible_rect: Rect,
}

impl Decoder {
    /// Opens and configures the device, then parks the decoder in `cell`.
    /// Must run on the decoder runner.
    pub fn start(
        options: DecoderOptions,
        callbacks: DecoderCallbacks,
        cell: &DecoderCell,
        runner: TaskRunnerHandle,
    ) -> DecodeResult<()> {
        let device = Arc::new(V4l2Device::open(&options.device_path)?);
        device.check_decoding_capability()?;
        device.verify_flush_support()?;
        device.subscribe_source_change()?;

        let input = InputQueue::configure(
            Arc::clone(&device),
            options.codec.v4l2_pix_fmt(),
            options.input_buffer_size,
        )?;

        let mut output = OutputQueue::configure(
            Arc::clone(&device),
            Size::default(),
            1,
            V4L2_MEMORY_MMAP,
        )?;
        output.stream_on()?;
        // The initial EOS carrier: guarantees a drain notification before
        // the first resolution change.
        output.queue_sentinel()?;

        let weak = Arc::downgrade(cell);
        let service_weak = weak.clone();
        let poller = DevicePoller::start(
            Arc::clone(&device),
            runner.clone(),
            Arc::new(move || {
                if let Some(cell) = service_weak.upgrade() {
                    if let Some(decoder) = cell.lock().unwrap().as_mut() {
                        decoder.service();
                    }
                }
            }),
        )?;

        let coded_size = output.coded_size();
        let decoder = Decoder {
            poller,
            codec: options.codec,
            secure: options.secure,
            device,
            input,
            output,
            cell: weak,
            state: DecoderState::Idle,
            requests: VecDeque::new(),
            pending_decode_cbs: BTreeMap::new(),
            drain_cb: None,
            output_cb: callbacks.output_cb,
            error_cb: Some(callbacks.error_cb),
            pool_request_cb: callbacks.pool_request_cb,
            pool: None,
            block_index: BTreeMap::new(),
            reuse_frames: VecDeque::new(),
            initial_eos_present: true,
            pending_drc: false,
            fetch_in_flight: false,
            min_num_output_buffers: options.min_num_output_buffers,
            coded_size,
            visible_rect: Rect::from_size(coded_size),
        };
        decoder.poller.schedule_poll();
        *cell.lock().unwrap() = Some(decoder);
        Ok(())
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn decode(&mut self, buffer: BitstreamBuffer, done: DecodeDoneCb) {
        if self.state == DecoderState::Error {
            done(Err(DecodeError::Corrupted(anyhow!("decoder is in error state"))));
            return;
        }

        // While only the sentinel is armed, look for a decodable unit; a
        // drain issued before one arrives completes without touching the
        // device.
        if !self.secure && self.initial_eos_present && !self.pending_drc {
            match buffer.map_payload() {
                Ok(payload) => {
                    if contains_keyframe(self.codec, &payload) {
                        self.pending_drc = true;
                    }
                }
                Err(e) => warn!("could not inspect bitstream buffer: {}", e),
            }
        }

        self.requests.push_back(DecodeRequest::Decode { buffer, done });
        self.pump();
    }

    pub fn drain(&mut self, done: DecodeDoneCb) {
        if self.state == DecoderState::Error {
            done(Err(DecodeError::Corrupted(anyhow!("decoder is in error state"))));
            return;
        }
        self.requests.push_back(DecodeRequest::Drain { done });
        self.pump();
    }

    /// Drains the request FIFO until it blocks.
    fn pump(&mut self) {
        if matches!(self.state, DecoderState::Error | DecoderState::Draining) {
            return;
        }

        while let Some(request) = self.requests.pop_front() {
            match request {
                DecodeRequest::Drain { done } => {
                    if self.input.queued_count() > 0 {
                        // Come back once the input queue drains.
                        self.requests.push_front(DecodeRequest::Drain { done });
                        break;
                    }
                    if !self.output.is_streaming() {
                        self.requests.push_front(DecodeRequest::Drain { done });
                        break;
                    }
                    if self.initial_eos_present && !self.pending_drc {
                        // Nothing decodable was ever queued; the kernel has
                        // nothing to flush.
                        done(Ok(()));
                        break;
                    }
                    if let Err(e) = self.device.send_decoder_command(V4L2_DEC_CMD_STOP) {
                        self.enter_error_state(e);
                        done(Err(DecodeError::Aborted));
                        return;
                    }
                    info!("drain started");
                    self.state = DecoderState::Draining;
                    self.drain_cb = Some(done);
                    break;
                }
                DecodeRequest::Decode { buffer, done } => {
                    let bitstream_id = buffer.bitstream_id;
                    match self.input.queue(&buffer) {
                        Ok(true) => {
                            self.pending_decode_cbs.insert(bitstream_id, done);
                            if self.state == DecoderState::Idle {
                                self.state = DecoderState::Decoding;
                            }
                        }
                        Ok(false) => {
                            // No free slot; resume on the next input dequeue.
                            self.requests.push_front(DecodeRequest::Decode { buffer, done });
                            break;
                        }
                        Err(e) => {
                            done(Err(DecodeError::Aborted));
                            self.enter_error_state(e);
                            return;
                        }
                    }
                }
            }
        }

        if self.input.queued_count() > 0 || self.output.queued_count() > 0 {
            self.poller.schedule_poll();
        }
    }

    /// Handles device progress. Runs on the decoder runner, posted by the
    /// poller thread.
    pub fn service(&mut self) {
        if self.state == DecoderState::Error {
            return;
        }

        let mut input_freed = false;
        loop {
            match self.input.dequeue() {
                Ok(Some(bitstream_id)) => {
                    input_freed = true;
                    match self.pending_decode_cbs.remove(&bitstream_id) {
                        Some(done) => done(Ok(())),
                        None => warn!("input dequeue for unknown bitstream id {}", bitstream_id),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.enter_error_state(e);
                    return;
                }
            }
        }

        let mut output_freed = false;
        loop {
            match self.output.dequeue() {
                Ok(Some(OutputEvent::Picture { mut frame, bitstream_id, is_last })) => {
                    output_freed = true;
                    frame.set_bitstream_id(bitstream_id);
                    frame.set_visible_rect(self.visible_rect);
                    frame.mark_shared();
                    (self.output_cb)(frame);
                    if is_last {
                        self.on_drain_complete();
                    }
                }
                Ok(Some(OutputEvent::Recycle { index, frame, is_last })) => {
                    // Dropping this buffer instead of re-queuing it makes
                    // some stateful drivers (pre-5.x MTK/RK) lose the EOS
                    // notification entirely.
                    if let Err(e) = self.output.queue_frame(index, frame) {
                        self.enter_error_state(e);
                        return;
                    }
                    if is_last {
                        self.on_drain_complete();
                    }
                }
                Ok(Some(OutputEvent::Sentinel { is_last })) => {
                    if self.initial_eos_present {
                        if let Err(e) = self.output.queue_sentinel() {
                            self.enter_error_state(e);
                            return;
                        }
                    }
                    if is_last {
                        self.on_drain_complete();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.enter_error_state(e);
                    return;
                }
            }
        }

        match self.device.dequeue_source_change() {
            Ok(true) => {
                if let Err(e) = self.on_resolution_change() {
                    self.enter_error_state(e);
                    return;
                }
            }
            Ok(false) => {}
            Err(e) => {
                self.enter_error_state(e);
                return;
            }
        }

        if input_freed {
            self.pump();
        }
        if output_freed {
            self.try_fetch_frame();
        }
        if self.input.queued_count() > 0 || self.output.queued_count() > 0 {
            self.poller.schedule_poll();
        }
    }

    fn on_drain_complete(&mut self) {
        if self.state != DecoderState::Draining {
            return;
        }
        if let Err(e) = self.device.send_decoder_command(V4L2_DEC_CMD_START) {
            self.enter_error_state(e);
            return;
        }
        info!("drain complete");
        self.state = DecoderState::Idle;
        if let Some(done) = self.drain_cb.take() {
            done(Ok(()));
        }
        self.pump();
    }

    /// Reacts to a dequeued source-change event: renegotiates the capture
    /// format, swaps the buffer set, and requests a fresh surface pool.
    fn on_resolution_change(&mut self) -> DecodeResult<()> {
        self.initial_eos_present = false;
        self.pending_drc = false;

        let format = self.device.get_format(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE)?;
        let coded_size = Size::new({ format.width }, { format.height });
        let driver_min = self.device.min_output_buffers().unwrap_or_else(|| {
            warn!("driver does not report a minimum capture buffer count");
            0
        });
        let buffer_count =
            std::cmp::max(driver_min + NUM_EXTRA_OUTPUT_BUFFERS, self.min_num_output_buffers);
        info!(
            "resolution change: {}x{}, {} capture buffers",
            coded_size.width, coded_size.height, buffer_count
        );

        self.output.stream_off()?;
        self.output.deallocate()?;
        self.block_index.clear();
        self.reuse_frames.clear();
        self.fetch_in_flight = false;

        let mut output = OutputQueue::configure(
            Arc::clone(&self.device),
            coded_size,
            buffer_count,
            V4L2_MEMORY_DMABUF,
        )?;
        output.stream_on()?;
        let allocated = output.num_buffers();
        self.output = output;
        self.coded_size = self.output.coded_size();
        self.visible_rect = self.device.visible_rect(self.coded_size);

        // The old pool is replaced wholesale; its frames die with it, but
        // the producer connection moves to the replacement.
        let producer = self.pool.take().and_then(|pool| pool.detach_producer());
        let pool = (self.pool_request_cb)(
            allocated,
            self.coded_size,
            HalPixelFormat::Ycbcr420_888,
        )?;
        if let Some(producer) = producer {
            pool.configure_producer(Some(producer));
        }
        pool.request_buffer_set(
            allocated,
            BufferFormat {
                size: self.coded_size,
                format: HalPixelFormat::Ycbcr420_888,
                usage: 0,
            },
        );
        self.pool = Some(pool);
        self.try_fetch_frame();

        if matches!(self.requests.front(), Some(DecodeRequest::Drain { .. })) {
            self.pump();
        }
        Ok(())
    }

    /// Keeps the capture queue fed: re-queues frames preserved across flush
    /// first, then fetches from the pool, one fetch in flight at a time.
    fn try_fetch_frame(&mut self) {
        if self.state == DecoderState::Error || !self.output.is_streaming() {
            return;
        }

        while let Some((block_id, frame)) = self.reuse_frames.pop_front() {
            let Some(&index) = self.block_index.get(&block_id) else {
                warn!("reuse frame with unknown block id {}", block_id);
                continue;
            };
            if let Err(e) = self.output.queue_frame(index, frame) {
                self.enter_error_state(e);
                return;
            }
        }

        if self.fetch_in_flight || self.pool.is_none() || !self.output.has_free_index() {
            return;
        }

        self.fetch_in_flight = true;
        let cell = self.cell.clone();
        self.pool.as_ref().unwrap().fetch(Box::new(move |result| {
            // Delivered on the decoder runner (the pool's client runner).
            if let Some(cell) = cell.upgrade() {
                if let Some(decoder) = cell.lock().unwrap().as_mut() {
                    decoder.on_frame_fetched(result);
                }
            }
        }));
    }

    fn on_frame_fetched(&mut self, result: DecodeResult<(VideoFrame, u64)>) {
        self.fetch_in_flight = false;
        if self.state == DecoderState::Error {
            return;
        }
        let (frame, block_id) = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                self.enter_error_state(e);
                return;
            }
        };

        let index = match self.block_index.get(&block_id) {
            Some(&index) => index,
            None => {
                let taken: Vec<usize> = self.block_index.values().copied().collect();
                match self.output.unused_index(|i| taken.contains(&i)) {
                    Some(index) => {
                        self.block_index.insert(block_id, index);
                        index
                    }
                    None => {
                        // More blocks than capture buffers; shed this one.
                        warn!("no capture index left for block {}", block_id);
                        drop(frame);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.output.queue_frame(index, frame) {
            self.enter_error_state(e);
            return;
        }
        self.poller.schedule_poll();
        self.try_fetch_frame();
    }

    /// Hands the consumer-side surface to the active pool. Returns the
    /// producer when no pool exists yet so the caller can stash it for the
    /// first pool creation.
    pub fn set_output_surface(
        &mut self,
        producer: Box<dyn crate::surface_pool::ProducerQueue>,
    ) -> Option<Box<dyn crate::surface_pool::ProducerQueue>> {
        match &self.pool {
            Some(pool) => {
                pool.configure_producer(Some(producer));
                None
            }
            None => Some(producer),
        }
    }

    /// Aborts every in-flight request and returns to Idle. The frames
    /// queued to the device are preserved for reuse so the block<->index
    /// mapping survives.
    pub fn flush(&mut self) -> DecodeResult<()> {
        if self.state == DecoderState::Error {
            return Err(DecodeError::Corrupted(anyhow!("decoder is in error state")));
        }

        for (_, done) in std::mem::take(&mut self.pending_decode_cbs) {
            done(Err(DecodeError::Aborted));
        }
        for request in std::mem::take(&mut self.requests) {
            match request {
                DecodeRequest::Decode { done, .. } => done(Err(DecodeError::Aborted)),
                DecodeRequest::Drain { done } => done(Err(DecodeError::Aborted)),
            }
        }
        if let Some(done) = self.drain_cb.take() {
            done(Err(DecodeError::Aborted));
        }

        self.input.stream_off()?;
        let output_was_streaming = self.output.is_streaming();
        if output_was_streaming {
            self.output.stream_off()?;
            // Not every frame can be returned through the producer after a
            // surface swap; keep them for direct re-queue instead.
            let index_to_block: BTreeMap<usize, u64> =
                self.block_index.iter().map(|(&b, &i)| (i, b)).collect();
            for (index, frame) in self.output.take_queued_frames() {
                match index_to_block.get(&index) {
                    Some(&block_id) => self.reuse_frames.push_back((block_id, frame)),
                    None => warn!("queued frame on index {} has no block mapping", index),
                }
            }
        }

        self.input.stream_on()?;
        if output_was_streaming {
            self.output.stream_on()?;
            if self.initial_eos_present {
                self.output.queue_sentinel()?;
            }
            self.try_fetch_frame();
        }
        self.state = DecoderState::Idle;
        self.poller.schedule_poll();
        Ok(())
    }

    /// Trips the terminal error state; the error callback fires exactly
    /// once and in-flight requests are aborted.
    fn enter_error_state(&mut self, error: DecodeError) {
        if self.state == DecoderState::Error {
            return;
        }
        error!("decoder entering error state: {}", error);
        self.state = DecoderState::Error;

        for (_, done) in std::mem::take(&mut self.pending_decode_cbs) {
            done(Err(DecodeError::Aborted));
        }
        for request in std::mem::take(&mut self.requests) {
            match request {
                DecodeRequest::Decode { done, .. } => done(Err(DecodeError::Aborted)),
                DecodeRequest::Drain { done } => done(Err(DecodeError::Aborted)),
            }
        }
        if let Some(done) = self.drain_cb.take() {
            done(Err(DecodeError::Aborted));
        }
        if let Some(mut error_cb) = self.error_cb.take() {
            error_cb(error);
        }
    }

    /// Streams off and releases kernel buffers. Polling stops in the field
    /// drop order before the device handle is released.
    pub fn stop(&mut self) {
        let _ = self.input.stream_off();
        let _ = self.input.deallocate();
        if self.output.is_streaming() {
            let _ = self.output.stream_off();
        }
        let _ = self.output.deallocate();
        self.pool = None;
        self.reuse_frames.clear();
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::task_runner::TaskRunner;

    fn test_callbacks(frame_tx: mpsc::Sender<VideoFrame>) -> DecoderCallbacks {
        let _ = env_logger::builder().is_test(true).try_init();
        DecoderCallbacks {
            output_cb: Box::new(move |frame| {
                let _ = frame_tx.send(frame);
            }),
            error_cb: Box::new(|e| panic!("decoder error: {}", e)),
            pool_request_cb: Box::new(|_, _, _| {
                Err(DecodeError::Corrupted(anyhow!("no pool in this test")))
            }),
        }
    }

    // Exercises the full start sequence against the stateful decoder node.
    #[test]
    // Ignore by default: requires /dev/video-dec0 on a ChromeOS device.
    #[ignore]
    fn start_and_stop_on_hardware() {
        let runner = TaskRunner::new("decoder_test");
        let cell: DecoderCell = Arc::new(Mutex::new(None));
        let (tx, _rx) = mpsc::channel();

        let start_cell = Arc::clone(&cell);
        let handle = runner.handle();
        let result = runner
            .handle()
            .post_and_wait(move || {
                Decoder::start(
                    DecoderOptions::new(VideoCodec::H264),
                    test_callbacks(tx),
                    &start_cell,
                    handle,
                )
            })
            .unwrap();
        result.unwrap();

        let stop_cell = Arc::clone(&cell);
        runner
            .handle()
            .post_and_wait(move || {
                *stop_cell.lock().unwrap() = None;
            })
            .unwrap();
    }

    // Drain with no decodable content must complete without device traffic
    // beyond the start sequence.
    #[test]
    // Ignore by default: requires /dev/video-dec0 on a ChromeOS device.
    #[ignore]
    fn empty_drain_completes_immediately_on_hardware() {
        let runner = TaskRunner::new("decoder_test");
        let cell: DecoderCell = Arc::new(Mutex::new(None));
        let (tx, _rx) = mpsc::channel();

        let start_cell = Arc::clone(&cell);
        let handle = runner.handle();
        runner
            .handle()
            .post_and_wait(move || {
                Decoder::start(
                    DecoderOptions::new(VideoCodec::H264),
                    test_callbacks(tx),
                    &start_cell,
                    handle,
                )
            })
            .unwrap()
            .unwrap();

        let (drain_tx, drain_rx) = mpsc::channel();
        let drain_cell = Arc::clone(&cell);
        runner.handle().post(move || {
            if let Some(decoder) = drain_cell.lock().unwrap().as_mut() {
                decoder.drain(Box::new(move |result| {
                    let _ = drain_tx.send(result);
                }));
            }
        });
        let result = drain_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_ok());

        let stop_cell = Arc::clone(&cell);
        runner
            .handle()
            .post_and_wait(move || {
                *stop_cell.lock().unwrap() = None;
            })
            .unwrap();
    }
}
