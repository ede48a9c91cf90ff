// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The kernel M2M decoder device: open, capability checks, ioctl wrappers,
//! and the polling thread that drives the service callback.

use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;

use anyhow::anyhow;
use log::error;
use log::warn;
use nix::fcntl::open;
use nix::fcntl::OFlag;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::eventfd::EventFd;
use nix::sys::stat::Mode;
use v4l2_sys::*;

use crate::error::DecodeError;
use crate::error::DecodeResult;
use crate::task_runner::TaskRunnerHandle;
use crate::Rect;
use crate::Size;

/// Path the stateful decoder node is registered under on ChromeOS boards.
pub const DECODER_DEVICE_PATH: &str = "/dev/video-dec0";

/// The flexible 4:2:0 formats the capture queue may be negotiated to, in
/// preference order.
pub const FLEXIBLE_420_FORMATS: [u32; 8] = [
    V4L2_PIX_FMT_YUV420,
    V4L2_PIX_FMT_YVU420,
    V4L2_PIX_FMT_YUV420M,
    V4L2_PIX_FMT_YVU420M,
    V4L2_PIX_FMT_NV12,
    V4L2_PIX_FMT_NV21,
    V4L2_PIX_FMT_NV12M,
    V4L2_PIX_FMT_NV21M,
];

/// A completed buffer pulled off one of the device queues.
pub struct DequeuedBuffer {
    pub index: usize,
    pub bitstream_id: i32,
    pub bytesused: u32,
    pub is_last: bool,
}

pub struct V4l2Device {
    fd: OwnedFd,
}

impl V4l2Device {
    pub fn open(path: &Path) -> DecodeResult<V4l2Device> {
        let fd = open(
            path,
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| DecodeError::Corrupted(anyhow!("failed to open {}: {}", path.display(), e)))?;
        // SAFETY: `fd` was just returned by `open` above and is not owned
        // anywhere else, so it is safe to take ownership of it here.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(V4l2Device { fd })
    }

    fn raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    /// The device must be a streaming multi-planar M2M decoder.
    pub fn check_decoding_capability(&self) -> DecodeResult<()> {
        let mut cap = v4l2_capability::default();
        // SAFETY: the fd is a valid V4L2 device node and the struct outlives
        // the call.
        unsafe { vidioc_querycap(self.raw_fd(), &mut cap) }?;
        let required = V4L2_CAP_VIDEO_M2M_MPLANE | V4L2_CAP_STREAMING;
        if cap.capabilities & required != required {
            return Err(DecodeError::Corrupted(anyhow!(
                "device capabilities {:#x} lack M2M mplane streaming",
                cap.capabilities
            )));
        }
        Ok(())
    }

    /// Probes V4L2_DEC_CMD_STOP without executing it; drain needs it.
    pub fn verify_flush_support(&self) -> DecodeResult<()> {
        let mut cmd = v4l2_decoder_cmd {
            cmd: V4L2_DEC_CMD_STOP,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_try_decoder_cmd(self.raw_fd(), &mut cmd) }
            .map_err(|e| DecodeError::Corrupted(anyhow!("driver does not support flush: {}", e)))?;
        Ok(())
    }

    pub fn send_decoder_command(&self, command: u32) -> DecodeResult<()> {
        let mut cmd = v4l2_decoder_cmd {
            cmd: command,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_decoder_cmd(self.raw_fd(), &mut cmd) }?;
        Ok(())
    }

    pub fn subscribe_source_change(&self) -> DecodeResult<()> {
        let sub = v4l2_event_subscription {
            type_: V4L2_EVENT_SOURCE_CHANGE,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_subscribe_event(self.raw_fd(), &sub) }?;
        Ok(())
    }

    /// Dequeues one pending event; true when it is a resolution change.
    pub fn dequeue_source_change(&self) -> DecodeResult<bool> {
        let mut event = v4l2_event::default();
        // SAFETY: valid fd, struct outlives the call.
        match unsafe { vidioc_dqevent(self.raw_fd(), &mut event) } {
            Ok(_) => {}
            Err(nix::errno::Errno::ENOENT) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if event.type_ != V4L2_EVENT_SOURCE_CHANGE {
            return Ok(false);
        }
        // SAFETY: the kernel filled the src_change member for this event type.
        let changes = unsafe { event.u.src_change.changes };
        Ok(changes & V4L2_EVENT_SRC_CH_RESOLUTION != 0)
    }

    /// Sets the format on one queue and returns what the driver settled on.
    pub fn set_format(
        &self,
        buf_type: u32,
        pixelformat: u32,
        size: Size,
        sizeimage: u32,
    ) -> DecodeResult<v4l2_pix_format_mplane> {
        let mut pix_mp = v4l2_pix_format_mplane {
            width: size.width,
            height: size.height,
            pixelformat,
            field: V4L2_FIELD_NONE,
            num_planes: 1,
            ..Default::default()
        };
        pix_mp.plane_fmt[0].sizeimage = sizeimage;
        let mut format = v4l2_format {
            type_: buf_type,
            ..Default::default()
        };
        format.fmt.pix_mp = pix_mp;
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_s_fmt(self.raw_fd(), &mut format) }?;
        // SAFETY: S_FMT filled pix_mp for an mplane buffer type.
        let pix_mp = unsafe { format.fmt.pix_mp };
        if pix_mp.pixelformat != pixelformat {
            return Err(DecodeError::BadValue(format!(
                "driver substituted format {:#x} for {:#x}",
                { pix_mp.pixelformat },
                pixelformat
            )));
        }
        Ok(pix_mp)
    }

    pub fn get_format(&self, buf_type: u32) -> DecodeResult<v4l2_pix_format_mplane> {
        let mut format = v4l2_format {
            type_: buf_type,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_g_fmt(self.raw_fd(), &mut format) }?;
        // SAFETY: G_FMT filled pix_mp for an mplane buffer type.
        Ok(unsafe { format.fmt.pix_mp })
    }

    /// Enumerates the capture-side pixel formats the device can produce.
    pub fn enum_capture_formats(&self) -> DecodeResult<Vec<u32>> {
        let mut formats = Vec::new();
        for index in 0.. {
            let mut desc = v4l2_fmtdesc {
                index,
                type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
                ..Default::default()
            };
            // SAFETY: valid fd, struct outlives the call.
            match unsafe { vidioc_enum_fmt(self.raw_fd(), &mut desc) } {
                Ok(_) => formats.push(desc.pixelformat),
                Err(nix::errno::Errno::EINVAL) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(formats)
    }

    /// REQBUFS; returns the count actually allocated.
    pub fn request_buffers(&self, buf_type: u32, memory: u32, count: u32) -> DecodeResult<u32> {
        let mut reqbufs = v4l2_requestbuffers {
            count,
            type_: buf_type,
            memory,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_reqbufs(self.raw_fd(), &mut reqbufs) }?;
        if count > 0 && reqbufs.count == 0 {
            return Err(DecodeError::NoMemory);
        }
        Ok(reqbufs.count)
    }

    pub fn queue_buffer(
        &self,
        buffer: &mut v4l2_buffer,
        planes: &mut [v4l2_plane],
    ) -> DecodeResult<()> {
        buffer.length = planes.len() as u32;
        buffer.m.planes = planes.as_mut_ptr();
        // SAFETY: valid fd; buffer and its plane array outlive the call.
        unsafe { vidioc_qbuf(self.raw_fd(), buffer) }?;
        Ok(())
    }

    /// Non-blocking DQBUF. `Ok(None)` when no buffer is ready.
    pub fn dequeue_buffer(
        &self,
        buf_type: u32,
        memory: u32,
        num_planes: usize,
    ) -> DecodeResult<Option<DequeuedBuffer>> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buffer = v4l2_buffer {
            type_: buf_type,
            memory,
            ..Default::default()
        };
        buffer.length = num_planes as u32;
        buffer.m.planes = planes.as_mut_ptr();
        // SAFETY: valid fd; buffer and its plane array outlive the call.
        match unsafe { vidioc_dqbuf(self.raw_fd(), &mut buffer) } {
            Ok(_) => {}
            Err(nix::errno::Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(DequeuedBuffer {
            index: buffer.index as usize,
            bitstream_id: buffer.timestamp.tv_sec as i32,
            bytesused: planes[..num_planes].iter().map(|p| p.bytesused).sum(),
            is_last: buffer.flags & V4L2_BUF_FLAG_LAST != 0,
        }))
    }

    pub fn stream_on(&self, buf_type: u32) -> DecodeResult<()> {
        let type_ = buf_type as libc::c_int;
        // SAFETY: valid fd; the int outlives the call.
        unsafe { vidioc_streamon(self.raw_fd(), &type_) }?;
        Ok(())
    }

    pub fn stream_off(&self, buf_type: u32) -> DecodeResult<()> {
        let type_ = buf_type as libc::c_int;
        // SAFETY: valid fd; the int outlives the call.
        unsafe { vidioc_streamoff(self.raw_fd(), &type_) }?;
        Ok(())
    }

    /// Reads the visible rectangle via G_SELECTION, falling back to G_CROP.
    /// An empty or out-of-range rectangle is substituted with `coded`.
    pub fn visible_rect(&self, coded: Size) -> Rect {
        let rect = self
            .selection_rect()
            .or_else(|| self.crop_rect())
            .unwrap_or_else(|| Rect::from_size(coded));
        if rect.is_empty() || !rect.contained_in(coded) {
            warn!(
                "visible rectangle {:?} invalid for coded size {:?}, using coded size",
                rect, coded
            );
            return Rect::from_size(coded);
        }
        rect
    }

    fn selection_rect(&self) -> Option<Rect> {
        let mut selection = v4l2_selection {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            target: V4L2_SEL_TGT_COMPOSE,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_g_selection(self.raw_fd(), &mut selection) }.ok()?;
        Some(Rect {
            left: selection.r.left,
            top: selection.r.top,
            width: selection.r.width,
            height: selection.r.height,
        })
    }

    fn crop_rect(&self) -> Option<Rect> {
        let mut crop = v4l2_crop {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_g_crop(self.raw_fd(), &mut crop) }.ok()?;
        Some(Rect {
            left: crop.c.left,
            top: crop.c.top,
            width: crop.c.width,
            height: crop.c.height,
        })
    }

    /// The driver's minimum capture buffer count, when it advertises one.
    pub fn min_output_buffers(&self) -> Option<u32> {
        let mut ctrl = v4l2_control {
            id: V4L2_CID_MIN_BUFFERS_FOR_CAPTURE,
            value: 0,
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_g_ctrl(self.raw_fd(), &mut ctrl) }.ok()?;
        u32::try_from(ctrl.value).ok()
    }

    /// Menu entries of a profile/level control, or None when the control is
    /// not implemented by the driver.
    pub fn query_control_menu(&self, id: u32) -> Option<Vec<i64>> {
        let mut queryctrl = v4l2_queryctrl {
            id,
            ..Default::default()
        };
        // SAFETY: valid fd, struct outlives the call.
        unsafe { vidioc_queryctrl(self.raw_fd(), &mut queryctrl) }.ok()?;

        let mut values = Vec::new();
        for index in queryctrl.minimum..=queryctrl.maximum {
            let mut menu = v4l2_querymenu {
                id,
                index: index as u32,
                ..Default::default()
            };
            // SAFETY: valid fd, struct outlives the call.
            if unsafe { vidioc_querymenu(self.raw_fd(), &mut menu) }.is_ok() {
                values.push(index as i64);
            }
        }
        Some(values)
    }
}

enum PollerState {
    Idle,
    Armed,
    Stopping,
}

/// Polls the device on its own thread and posts the service callback onto
/// the decoder runner. Never touches decoder state itself.
pub struct DevicePoller {
    shared: Arc<(Mutex<PollerState>, Condvar)>,
    interrupt: Arc<EventFd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DevicePoller {
    pub fn start(
        device: Arc<V4l2Device>,
        runner: TaskRunnerHandle,
        service: Arc<dyn Fn() + Send + Sync>,
    ) -> DecodeResult<DevicePoller> {
        let interrupt = Arc::new(
            EventFd::new().map_err(|e| DecodeError::Corrupted(anyhow!("eventfd: {}", e)))?,
        );
        let shared = Arc::new((Mutex::new(PollerState::Idle), Condvar::new()));

        let thread_shared = Arc::clone(&shared);
        let thread_interrupt = Arc::clone(&interrupt);
        let thread = thread::Builder::new()
            .name("v4l2_poller".to_string())
            .spawn(move || {
                poll_loop(device, runner, service, thread_shared, thread_interrupt)
            })
            .map_err(|e| DecodeError::Corrupted(anyhow!("spawning poller: {}", e)))?;

        Ok(DevicePoller {
            shared,
            interrupt,
            thread: Some(thread),
        })
    }

    /// Arms one poll pass; the service callback is posted when the device
    /// reports progress. Idempotent while armed.
    pub fn schedule_poll(&self) {
        let (state, cond) = &*self.shared;
        let mut guard = state.lock().unwrap();
        if matches!(*guard, PollerState::Idle) {
            *guard = PollerState::Armed;
            cond.notify_one();
        }
    }

    fn stop(&mut self) {
        {
            let (state, cond) = &*self.shared;
            *state.lock().unwrap() = PollerState::Stopping;
            cond.notify_one();
        }
        // Break a poll that is already waiting on the device.
        if let Err(e) = self.interrupt.write(1) {
            error!("failed to interrupt device poller: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    device: Arc<V4l2Device>,
    runner: TaskRunnerHandle,
    service: Arc<dyn Fn() + Send + Sync>,
    shared: Arc<(Mutex<PollerState>, Condvar)>,
    interrupt: Arc<EventFd>,
) {
    let (state, cond) = &*shared;
    loop {
        {
            let mut guard = state.lock().unwrap();
            loop {
                match *guard {
                    PollerState::Stopping => return,
                    PollerState::Armed => break,
                    PollerState::Idle => guard = cond.wait(guard).unwrap(),
                }
            }
        }

        let mut fds = [
            PollFd::new(device.fd.as_fd(), PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLPRI),
            PollFd::new(interrupt.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("device poll failed: {}", e);
                return;
            }
        }

        if fds[1].any().unwrap_or(false) {
            let _ = interrupt.read();
        }

        let device_ready = fds[0].any().unwrap_or(false);
        let mut guard = state.lock().unwrap();
        if matches!(*guard, PollerState::Stopping) {
            return;
        }
        if device_ready {
            *guard = PollerState::Idle;
            drop(guard);
            let service = Arc::clone(&service);
            runner.post(move || service());
        }
    }
}
