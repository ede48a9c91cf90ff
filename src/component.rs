// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The public decode façade.
//!
//! All state-bearing work is posted onto one serial task runner owned by
//! the component; a short-held lock serializes the public entry points
//! against concurrent framework threads. `start`, `stop`, `flush` and
//! `set_listener` block on a one-shot wait event; `queue` and `drain`
//! return after posting.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use log::info;
use log::warn;
use once_cell::sync::Lazy;

use crate::decoder::Decoder;
use crate::decoder::DecoderCallbacks;
use crate::decoder::DecoderCell;
use crate::decoder::DecoderOptions;
use crate::device::DECODER_DEVICE_PATH;
use crate::error::DecodeError;
use crate::error::DecodeResult;
use crate::interface::ColorAspects;
use crate::interface::DecodeInterface;
use crate::nal::h264;
use crate::nal::hevc;
use crate::nal::NalWalker;
use crate::queue::BitstreamBuffer;
use crate::surface_pool::ProducerQueue;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::VideoFrame;
use crate::task_runner::TaskRunner;
use crate::VideoCodec;

/// Receives completed work and error signals from the component.
pub trait ComponentListener: Send + Sync {
    /// The input buffer for `bitstream_id` has been consumed, aborted, or
    /// failed.
    fn on_work_done(&self, bitstream_id: i32, status: DecodeResult<()>);
    /// A decoded picture, carrying its bitstream id and visible rectangle.
    fn on_frame_decoded(&self, frame: VideoFrame);
    /// A previously requested drain finished or was aborted.
    fn on_drain_done(&self, status: DecodeResult<()>);
    /// The component entered its terminal error state.
    fn on_tripped(&self, error: DecodeError);
}

/// The component names the framework may instantiate, and the codec each
/// drives. The only process-wide mutable state in the pipeline.
static CODECS_BY_NAME: Lazy<Mutex<BTreeMap<&'static str, VideoCodec>>> = Lazy::new(|| {
    Mutex::new(BTreeMap::from([
        ("c2.v4l2.avc.decoder", VideoCodec::H264),
        ("c2.v4l2.avc.decoder.secure", VideoCodec::H264),
        ("c2.v4l2.hevc.decoder", VideoCodec::Hevc),
        ("c2.v4l2.hevc.decoder.secure", VideoCodec::Hevc),
        ("c2.v4l2.vp8.decoder", VideoCodec::Vp8),
        ("c2.v4l2.vp8.decoder.secure", VideoCodec::Vp8),
        ("c2.v4l2.vp9.decoder", VideoCodec::Vp9),
        ("c2.v4l2.vp9.decoder.secure", VideoCodec::Vp9),
    ]))
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ComponentState {
    Stopped,
    Running,
    Released,
}

type SharedListener = Arc<Mutex<Option<Arc<dyn ComponentListener>>>>;

pub struct DecodeComponent {
    /// Doubles as the short-held entry-point lock.
    state: Mutex<ComponentState>,
    interface: Arc<Mutex<DecodeInterface>>,
    codec: VideoCodec,
    device_path: PathBuf,
    runner: TaskRunner,
    decoder: DecoderCell,
    listener: SharedListener,
    /// Set by the decoder's error callback; entry points reject afterwards.
    tripped: Arc<std::sync::atomic::AtomicBool>,
    /// Surface announced before the first pool exists.
    pending_producer: Arc<Mutex<Option<Box<dyn ProducerQueue>>>>,
}

impl DecodeComponent {
    /// Instantiates a component by its registered framework name.
    pub fn create(name: &str) -> Option<DecodeComponent> {
        let codec = *CODECS_BY_NAME.lock().unwrap().get(name)?;
        Some(DecodeComponent::new(name, codec))
    }

    /// Builds the component and its capability interface. The device is
    /// probed once for profile/level menus and released again.
    pub fn new(name: &str, codec: VideoCodec) -> DecodeComponent {
        Self::with_device_path(name, codec, PathBuf::from(DECODER_DEVICE_PATH))
    }

    pub fn with_device_path(name: &str, codec: VideoCodec, device_path: PathBuf) -> DecodeComponent {
        let probe = crate::device::V4l2Device::open(&device_path).ok();
        let interface = DecodeInterface::new(name, codec, probe.as_ref());
        DecodeComponent {
            state: Mutex::new(ComponentState::Stopped),
            interface: Arc::new(Mutex::new(interface)),
            codec,
            device_path,
            runner: TaskRunner::new("decode_component"),
            decoder: Arc::new(Mutex::new(None)),
            listener: Arc::new(Mutex::new(None)),
            tripped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            pending_producer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interface(&self) -> Arc<Mutex<DecodeInterface>> {
        Arc::clone(&self.interface)
    }

    /// Blocks until the listener is installed on the runner.
    pub fn set_listener(&self, listener: Arc<dyn ComponentListener>) -> DecodeResult<()> {
        let _state = self.state.lock().unwrap();
        let shared = Arc::clone(&self.listener);
        self.runner
            .handle()
            .post_and_wait(move || {
                *shared.lock().unwrap() = Some(listener);
            })
            .ok_or_else(|| DecodeError::Corrupted(anyhow!("component runner unavailable")))
    }

    /// Starts the decoder on the serial runner; blocks until it is up.
    pub fn start(&self) -> DecodeResult<()> {
        let mut state = self.state.lock().unwrap();
        if self.tripped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(DecodeError::BadValue("component tripped".to_string()));
        }
        match *state {
            ComponentState::Stopped => {}
            ComponentState::Running => return Ok(()),
            ComponentState::Released => {
                return Err(DecodeError::BadValue("component cannot start".to_string()))
            }
        }

        let options = {
            let interface = self.interface.lock().unwrap();
            DecoderOptions {
                codec: self.codec,
                secure: interface.secure_mode(),
                input_buffer_size: DecodeInterface::input_buffer_size(interface.picture_size()),
                min_num_output_buffers: interface.output_delay(),
                device_path: self.device_path.clone(),
            }
        };

        let cell = Arc::clone(&self.decoder);
        let pending_producer = Arc::clone(&self.pending_producer);
        let runner_handle = self.runner.handle();
        let callbacks_listener = Arc::clone(&self.listener);
        let tripped = Arc::clone(&self.tripped);
        let result = self
            .runner
            .handle()
            .post_and_wait(move || {
                let frame_listener = Arc::clone(&callbacks_listener);
                let error_listener = Arc::clone(&callbacks_listener);
                let pool_runner = runner_handle.clone();
                let callbacks = DecoderCallbacks {
                    output_cb: Box::new(move |frame| {
                        if let Some(listener) = frame_listener.lock().unwrap().as_ref() {
                            listener.on_frame_decoded(frame);
                        }
                    }),
                    error_cb: Box::new(move |error| {
                        tripped.store(true, std::sync::atomic::Ordering::Release);
                        if let Some(listener) = error_listener.lock().unwrap().as_ref() {
                            listener.on_tripped(error);
                        }
                    }),
                    pool_request_cb: Box::new(move |_count, _size, _format| {
                        let pool = SurfacePool::new(pool_runner.clone());
                        if let Some(producer) = pending_producer.lock().unwrap().take() {
                            pool.configure_producer(Some(producer));
                        }
                        Ok(pool)
                    }),
                };
                Decoder::start(options, callbacks, &cell, runner_handle)
            })
            .ok_or_else(|| DecodeError::Corrupted(anyhow!("component runner unavailable")))?;

        match result {
            Ok(()) => {
                info!("component started");
                *state = ComponentState::Running;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Tears the decoder down on the runner; blocks until done.
    pub fn stop(&self) -> DecodeResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state == ComponentState::Released {
            return Err(DecodeError::BadValue("component released".to_string()));
        }
        self.teardown_decoder()?;
        *state = ComponentState::Stopped;
        info!("component stopped");
        Ok(())
    }

    /// Stop plus state reset; the component can start again afterwards.
    pub fn reset(&self) -> DecodeResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state == ComponentState::Released {
            return Err(DecodeError::BadValue("component released".to_string()));
        }
        self.teardown_decoder()?;
        *state = ComponentState::Stopped;
        Ok(())
    }

    /// Final teardown; the component is unusable afterwards.
    pub fn release(&self) -> DecodeResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state == ComponentState::Released {
            return Ok(());
        }
        self.teardown_decoder()?;
        *state = ComponentState::Released;
        Ok(())
    }

    fn teardown_decoder(&self) -> DecodeResult<()> {
        let cell = Arc::clone(&self.decoder);
        self.runner
            .handle()
            .post_and_wait(move || {
                // Dropped on the runner, where it was created.
                *cell.lock().unwrap() = None;
            })
            .ok_or_else(|| DecodeError::Corrupted(anyhow!("component runner unavailable")))
    }

    /// Submits one compressed buffer. Non-blocking: completion arrives at
    /// the listener as work-done for the buffer's bitstream id.
    pub fn queue(&self, buffer: BitstreamBuffer) -> DecodeResult<()> {
        let state = self.state.lock().unwrap();
        if *state != ComponentState::Running {
            return Err(DecodeError::NotInitialized);
        }
        drop(state);

        let cell = Arc::clone(&self.decoder);
        let listener = Arc::clone(&self.listener);
        let interface = Arc::clone(&self.interface);
        let codec = self.codec;
        self.runner.handle().post(move || {
            update_coded_aspects(&interface, codec, &buffer);

            let bitstream_id = buffer.bitstream_id;
            let done_listener = Arc::clone(&listener);
            let mut guard = cell.lock().unwrap();
            match guard.as_mut() {
                Some(decoder) => decoder.decode(
                    buffer,
                    Box::new(move |status| {
                        if let Some(listener) = done_listener.lock().unwrap().as_ref() {
                            listener.on_work_done(bitstream_id, status);
                        }
                    }),
                ),
                None => {
                    if let Some(listener) = listener.lock().unwrap().as_ref() {
                        listener.on_work_done(bitstream_id, Err(DecodeError::NotInitialized));
                    }
                }
            }
        });
        Ok(())
    }

    /// Requests end-of-stream draining. Non-blocking: completion arrives at
    /// the listener as drain-done.
    pub fn drain(&self) -> DecodeResult<()> {
        let state = self.state.lock().unwrap();
        if *state != ComponentState::Running {
            return Err(DecodeError::NotInitialized);
        }
        drop(state);

        let cell = Arc::clone(&self.decoder);
        let listener = Arc::clone(&self.listener);
        self.runner.handle().post(move || {
            let done_listener = Arc::clone(&listener);
            let mut guard = cell.lock().unwrap();
            match guard.as_mut() {
                Some(decoder) => decoder.drain(Box::new(move |status| {
                    if let Some(listener) = done_listener.lock().unwrap().as_ref() {
                        listener.on_drain_done(status);
                    }
                })),
                None => {
                    if let Some(listener) = listener.lock().unwrap().as_ref() {
                        listener.on_drain_done(Err(DecodeError::NotInitialized));
                    }
                }
            }
        });
        Ok(())
    }

    /// Aborts all in-flight work; blocks until the decoder is idle again.
    pub fn flush(&self) -> DecodeResult<()> {
        let state = self.state.lock().unwrap();
        if *state != ComponentState::Running {
            return Err(DecodeError::NotInitialized);
        }
        drop(state);

        let cell = Arc::clone(&self.decoder);
        self.runner
            .handle()
            .post_and_wait(move || match cell.lock().unwrap().as_mut() {
                Some(decoder) => decoder.flush(),
                None => Err(DecodeError::NotInitialized),
            })
            .ok_or_else(|| DecodeError::Corrupted(anyhow!("component runner unavailable")))?
    }

    /// Announces the consumer-side surface the decoded pictures go to.
    pub fn set_output_surface(&self, producer: Box<dyn ProducerQueue>) -> DecodeResult<()> {
        let _state = self.state.lock().unwrap();
        let cell = Arc::clone(&self.decoder);
        let pending = Arc::clone(&self.pending_producer);
        self.runner.handle().post(move || {
            let mut guard = cell.lock().unwrap();
            let leftover = match guard.as_mut() {
                Some(decoder) => decoder.set_output_surface(producer),
                None => Some(producer),
            };
            if let Some(producer) = leftover {
                *pending.lock().unwrap() = Some(producer);
            }
        });
        Ok(())
    }
}

/// Extracts VUI color aspects from an SPS in `buffer`, if one is present,
/// and records them on the interface.
fn update_coded_aspects(
    interface: &Arc<Mutex<DecodeInterface>>,
    codec: VideoCodec,
    buffer: &BitstreamBuffer,
) {
    if !matches!(codec, VideoCodec::H264 | VideoCodec::Hevc) {
        return;
    }
    if interface.lock().unwrap().secure_mode() {
        return;
    }
    let payload = match buffer.map_payload() {
        Ok(payload) => payload,
        Err(_) => return,
    };

    let parsed = match codec {
        VideoCodec::H264 => {
            let mut walker = NalWalker::h264(&payload);
            if !walker.locate_sps() {
                return;
            }
            walker.current().map(h264::parse_sps_color_aspects)
        }
        VideoCodec::Hevc => {
            let mut walker = NalWalker::hevc(&payload);
            if !walker.locate_sps() {
                return;
            }
            walker.current().map(hevc::parse_sps_color_aspects)
        }
        _ => unreachable!(),
    };

    match parsed {
        Some(Ok(aspects)) => {
            interface
                .lock()
                .unwrap()
                .set_coded_color_aspects(ColorAspects::from_coded(aspects));
        }
        Some(Err(e)) => warn!("SPS color-aspect extraction failed: {}", e),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    struct RecordingListener {
        work: Mutex<mpsc::Sender<(i32, DecodeResult<()>)>>,
    }

    impl ComponentListener for RecordingListener {
        fn on_work_done(&self, bitstream_id: i32, status: DecodeResult<()>) {
            let _ = self.work.lock().unwrap().send((bitstream_id, status));
        }

        fn on_frame_decoded(&self, _frame: VideoFrame) {}

        fn on_drain_done(&self, _status: DecodeResult<()>) {}

        fn on_tripped(&self, _error: DecodeError) {}
    }

    fn component() -> DecodeComponent {
        DecodeComponent::with_device_path(
            "c2.v4l2.avc.decoder",
            VideoCodec::H264,
            PathBuf::from("/nonexistent/video-dec"),
        )
    }

    #[test]
    fn create_resolves_registered_names() {
        let component = DecodeComponent::create("c2.v4l2.vp9.decoder").unwrap();
        assert_eq!(component.interface().lock().unwrap().codec(), VideoCodec::Vp9);
        assert!(DecodeComponent::create("c2.v4l2.av1.decoder").is_none());
    }

    #[test]
    fn start_fails_without_device() {
        let component = component();
        assert!(component.start().is_err());
        // A failed start leaves the component restartable.
        assert!(component.start().is_err());
    }

    #[test]
    fn queue_rejected_while_stopped() {
        let component = component();
        let buffer = BitstreamBuffer {
            fd: Arc::new(std::os::fd::OwnedFd::from(tempfile::tempfile().unwrap())),
            offset: 0,
            size: 4,
            bitstream_id: 7,
        };
        assert!(matches!(component.queue(buffer), Err(DecodeError::NotInitialized)));
        assert!(matches!(component.drain(), Err(DecodeError::NotInitialized)));
        assert!(matches!(component.flush(), Err(DecodeError::NotInitialized)));
    }

    #[test]
    fn listener_installation_round_trips() {
        let component = component();
        let (tx, _rx) = mpsc::channel();
        let listener = Arc::new(RecordingListener { work: Mutex::new(tx) });
        component.set_listener(listener).unwrap();
    }

    #[test]
    fn stop_and_release_are_idempotent_enough() {
        let component = component();
        component.stop().unwrap();
        component.reset().unwrap();
        component.release().unwrap();
        assert!(component.stop().is_err());
        assert!(component.start().is_err());
        component.release().unwrap();
    }

    #[test]
    fn interface_reflects_component_name() {
        let secure = DecodeComponent::with_device_path(
            "c2.v4l2.hevc.decoder.secure",
            VideoCodec::Hevc,
            PathBuf::from("/nonexistent/video-dec"),
        );
        let interface = secure.interface();
        let interface = interface.lock().unwrap();
        assert!(interface.secure_mode());
        assert_eq!(interface.codec(), VideoCodec::Hevc);
        assert_eq!(interface.output_delay(), 16);
    }

    #[test]
    fn coded_aspects_update_from_queued_sps() {
        use std::io::Write;

        // A stream with one H.264 SPS carrying BT.709 VUI signalling.
        let mut w = crate::nal::test_support::BitWriter::new();
        w.put_bits(0, 1);
        w.put_bits(3, 2);
        w.put_bits(7, 5); // SPS
        w.put_bits(66, 8);
        w.put_bits(0, 8);
        w.put_bits(30, 8);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(2);
        w.put_ue(1);
        w.put_bit(false);
        w.put_ue(19);
        w.put_ue(14);
        w.put_bit(true);
        w.put_bit(false);
        w.put_bit(false);
        w.put_bit(true); // vui_parameters_present_flag
        w.put_bit(false);
        w.put_bit(false);
        w.put_bit(true); // video_signal_type_present_flag
        w.put_bits(5, 3);
        w.put_bit(false); // limited range
        w.put_bit(true);
        w.put_bits(1, 8);
        w.put_bits(1, 8);
        w.put_bits(1, 8);
        let sps = w.finish();

        let mut stream = vec![0, 0, 1];
        stream.extend_from_slice(&sps);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&stream).unwrap();

        let component = component();
        let interface = component.interface();
        let buffer = BitstreamBuffer {
            fd: Arc::new(std::os::fd::OwnedFd::from(file)),
            offset: 0,
            size: stream.len() as u32,
            bitstream_id: 0,
        };
        update_coded_aspects(&interface, VideoCodec::H264, &buffer);

        let merged = interface.lock().unwrap().merged_color_aspects();
        assert_eq!(merged.range, crate::interface::ColorRange::Limited);
        assert_eq!(merged.primaries, crate::interface::ColorPrimaries::Bt709);
        assert_eq!(merged.matrix, crate::interface::ColorMatrix::Bt709);
    }
}
