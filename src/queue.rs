// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wrappers for the device's OUTPUT (compressed) and CAPTURE (picture)
//! queues, and the ring that tracks which DMA payload last used each input
//! slot so re-submitted buffers land on the slot that already imported them.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::anyhow;
use log::warn;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use v4l2_sys::*;

use crate::device::DequeuedBuffer;
use crate::device::V4l2Device;
use crate::device::FLEXIBLE_420_FORMATS;
use crate::error::DecodeError;
use crate::error::DecodeResult;
use crate::surface_pool::VideoFrame;
use crate::Size;

/// Fixed depth of the compressed input queue.
pub const NUM_INPUT_BUFFERS: usize = 16;

/// A compressed bitstream unit submitted by the client. The id is the
/// client-supplied monotonically increasing identifier used to correlate
/// completion with submission.
pub struct BitstreamBuffer {
    pub fd: Arc<OwnedFd>,
    pub offset: u32,
    pub size: u32,
    pub bitstream_id: i32,
}

impl BitstreamBuffer {
    /// Kernel identity of the backing DMA buffer.
    pub fn dma_id(&self) -> DecodeResult<u64> {
        let stat = nix::sys::stat::fstat(self.fd.as_raw_fd())
            .map_err(|e| DecodeError::Corrupted(anyhow!("fstat on bitstream fd: {}", e)))?;
        Ok(stat.st_ino)
    }

    /// Maps the payload for read access (key-frame and SPS inspection).
    pub fn map_payload(&self) -> DecodeResult<MappedPayload> {
        if self.size == 0 {
            return Err(DecodeError::BadValue("empty bitstream buffer".to_string()));
        }
        // The mapping offset must be page aligned; the payload offset
        // usually is not.
        // SAFETY: trivially safe.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let aligned = (u64::from(self.offset) / page) * page;
        let delta = (u64::from(self.offset) - aligned) as usize;
        let len = NonZeroUsize::new(self.size as usize + delta)
            .ok_or_else(|| DecodeError::BadValue("empty bitstream buffer".to_string()))?;
        // SAFETY: mapping a range the fd owner handed us read-only; the
        // mapping is unmapped by MappedPayload::drop.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                self.fd.as_fd(),
                aligned as libc::off_t,
            )
        }
        .map_err(|e| DecodeError::Corrupted(anyhow!("mmap of bitstream buffer: {}", e)))?;
        Ok(MappedPayload {
            ptr,
            len: len.get(),
            delta,
            size: self.size as usize,
        })
    }
}

/// Read-only view of a bitstream payload; unmapped on drop.
pub struct MappedPayload {
    ptr: NonNull<libc::c_void>,
    len: usize,
    delta: usize,
    size: usize,
}

impl Deref for MappedPayload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping covers delta + size readable bytes and lives
        // until drop.
        unsafe {
            std::slice::from_raw_parts((self.ptr.as_ptr() as *const u8).add(self.delta), self.size)
        }
    }
}

impl Drop for MappedPayload {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap of bitstream payload failed: {}", e);
        }
    }
}

/// Tracks, per input slot, the identity of the last DMA payload queued on
/// it. Valid iff the slot has ever been used; re-queuing the same payload on
/// the same slot lets the driver skip re-importing the buffer.
pub struct BitstreamRing {
    last_dma_id: [Option<u64>; NUM_INPUT_BUFFERS],
}

impl BitstreamRing {
    pub fn new() -> BitstreamRing {
        BitstreamRing { last_dma_id: [None; NUM_INPUT_BUFFERS] }
    }

    /// Picks a slot from `free`: one whose last payload matches `dma_id`,
    /// else a never-used slot, else any free slot.
    pub fn choose_slot(&self, dma_id: u64, free: &[usize]) -> Option<usize> {
        free.iter()
            .copied()
            .find(|&slot| self.last_dma_id[slot] == Some(dma_id))
            .or_else(|| {
                free.iter()
                    .copied()
                    .find(|&slot| self.last_dma_id[slot].is_none())
            })
            .or_else(|| free.first().copied())
    }

    pub fn record(&mut self, slot: usize, dma_id: u64) {
        self.last_dma_id[slot] = Some(dma_id);
    }

    pub fn last_id(&self, slot: usize) -> Option<u64> {
        self.last_dma_id[slot]
    }
}

impl Default for BitstreamRing {
    fn default() -> BitstreamRing {
        BitstreamRing::new()
    }
}

/// The compressed OUTPUT_MPLANE queue, fed with client DMA buffers.
pub struct InputQueue {
    device: Arc<V4l2Device>,
    ring: BitstreamRing,
    free_slots: Vec<usize>,
    buffer_size: u32,
    streaming: bool,
}

impl InputQueue {
    /// Sets the compressed format sized to `input_buffer_size`, allocates
    /// the DMA-fd slots, and starts streaming.
    pub fn configure(
        device: Arc<V4l2Device>,
        pixelformat: u32,
        input_buffer_size: u32,
    ) -> DecodeResult<InputQueue> {
        let format = device.set_format(
            V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            pixelformat,
            Size::default(),
            input_buffer_size,
        )?;
        let buffer_size = { format.plane_fmt[0].sizeimage };

        let count = device.request_buffers(
            V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            V4L2_MEMORY_DMABUF,
            NUM_INPUT_BUFFERS as u32,
        )?;
        if (count as usize) < NUM_INPUT_BUFFERS {
            return Err(DecodeError::Corrupted(anyhow!(
                "driver granted {} of {} input buffers",
                count,
                NUM_INPUT_BUFFERS
            )));
        }
        device.stream_on(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)?;

        Ok(InputQueue {
            device,
            ring: BitstreamRing::new(),
            free_slots: (0..NUM_INPUT_BUFFERS).collect(),
            buffer_size,
            streaming: true,
        })
    }

    pub fn queued_count(&self) -> usize {
        NUM_INPUT_BUFFERS - self.free_slots.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free_slots.is_empty()
    }

    /// Queues one bitstream buffer. Returns false when every slot is in
    /// flight; the caller resumes on the next input dequeue.
    pub fn queue(&mut self, buffer: &BitstreamBuffer) -> DecodeResult<bool> {
        let bytesused = buffer
            .offset
            .checked_add(buffer.size)
            .ok_or_else(|| DecodeError::BadValue("bitstream buffer range overflows".to_string()))?;
        if self.buffer_size < bytesused {
            return Err(DecodeError::Corrupted(anyhow!(
                "plane size {} smaller than declared bytes used {}",
                self.buffer_size,
                bytesused
            )));
        }

        let dma_id = buffer.dma_id()?;
        let Some(slot) = self.ring.choose_slot(dma_id, &self.free_slots) else {
            return Ok(false);
        };

        let mut planes = [v4l2_plane::default(); 1];
        planes[0].bytesused = bytesused;
        planes[0].length = self.buffer_size;
        planes[0].data_offset = buffer.offset;
        planes[0].m.fd = buffer.fd.as_raw_fd();

        let mut v4l2_buf = v4l2_buffer {
            index: slot as u32,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            memory: V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        // Completion is correlated by timestamp: the kernel echoes it on the
        // capture side.
        v4l2_buf.timestamp.tv_sec = buffer.bitstream_id as libc::time_t;

        self.device.queue_buffer(&mut v4l2_buf, &mut planes)?;
        self.free_slots.retain(|&s| s != slot);
        self.ring.record(slot, dma_id);
        Ok(true)
    }

    /// Reaps one completed input buffer; returns its bitstream id.
    pub fn dequeue(&mut self) -> DecodeResult<Option<i32>> {
        let Some(dequeued) =
            self.device
                .dequeue_buffer(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, V4L2_MEMORY_DMABUF, 1)?
        else {
            return Ok(None);
        };
        if dequeued.index < NUM_INPUT_BUFFERS && !self.free_slots.contains(&dequeued.index) {
            self.free_slots.push(dequeued.index);
        }
        Ok(Some(dequeued.bitstream_id))
    }

    pub fn stream_on(&mut self) -> DecodeResult<()> {
        self.device.stream_on(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)?;
        self.streaming = true;
        Ok(())
    }

    /// STREAMOFF returns every queued slot.
    pub fn stream_off(&mut self) -> DecodeResult<()> {
        self.device.stream_off(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)?;
        self.streaming = false;
        self.free_slots = (0..NUM_INPUT_BUFFERS).collect();
        Ok(())
    }

    pub fn deallocate(&mut self) -> DecodeResult<()> {
        self.device
            .request_buffers(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, V4L2_MEMORY_DMABUF, 0)?;
        Ok(())
    }
}

/// What came off the CAPTURE queue.
pub enum OutputEvent {
    /// A picture with payload, carrying the frame that was queued on it.
    Picture {
        frame: VideoFrame,
        bitstream_id: i32,
        is_last: bool,
    },
    /// An empty dequeue on a frame-backed slot; the frame must be re-queued
    /// immediately (driver EOS-notification workaround).
    Recycle {
        index: usize,
        frame: VideoFrame,
        is_last: bool,
    },
    /// The sentinel MMAP buffer came back.
    Sentinel { is_last: bool },
}

/// The CAPTURE_MPLANE queue. Picture buffers are imported DMA frames from
/// the surface pool; before the first resolution change a single MMAP
/// sentinel guarantees a drain notification.
pub struct OutputQueue {
    device: Arc<V4l2Device>,
    pixelformat: u32,
    coded_size: Size,
    num_buffers: usize,
    num_planes: usize,
    plane_sizes: Vec<u32>,
    memory: u32,
    /// Every frame queued to the device, by kernel buffer index. An entry is
    /// removed only when that index is dequeued.
    frames: BTreeMap<usize, VideoFrame>,
    sentinel_queued: bool,
    streaming: bool,
}

impl OutputQueue {
    /// Picks a supported flexible 4:2:0 format and allocates `count` buffers
    /// of `memory` type. Does not start streaming.
    pub fn configure(
        device: Arc<V4l2Device>,
        coded_size: Size,
        count: u32,
        memory: u32,
    ) -> DecodeResult<OutputQueue> {
        let supported = device.enum_capture_formats()?;
        let pixelformat = FLEXIBLE_420_FORMATS
            .iter()
            .copied()
            .find(|f| supported.contains(f))
            .ok_or_else(|| {
                DecodeError::Corrupted(anyhow!("no flexible 4:2:0 capture format supported"))
            })?;

        let format =
            device.set_format(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, pixelformat, coded_size, 0)?;
        let coded_size = Size::new({ format.width }, { format.height });
        let num_planes = usize::from(format.num_planes);
        let plane_sizes: Vec<u32> = (0..num_planes)
            .map(|i| {
                let plane = format.plane_fmt[i];
                { plane.sizeimage }
            })
            .collect();

        let granted =
            device.request_buffers(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, memory, count)?;
        if granted < count {
            warn!("driver granted {} of {} capture buffers", granted, count);
        }

        Ok(OutputQueue {
            device,
            pixelformat,
            coded_size,
            num_buffers: granted as usize,
            num_planes,
            plane_sizes,
            memory,
            frames: BTreeMap::new(),
            sentinel_queued: false,
            streaming: false,
        })
    }

    pub fn coded_size(&self) -> Size {
        self.coded_size
    }

    pub fn pixelformat(&self) -> u32 {
        self.pixelformat
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn queued_count(&self) -> usize {
        self.frames.len() + usize::from(self.sentinel_queued)
    }

    pub fn has_free_index(&self) -> bool {
        self.frames.len() < self.num_buffers
    }

    /// An index no frame is currently queued on.
    pub fn unused_index(&self, taken: impl Fn(usize) -> bool) -> Option<usize> {
        (0..self.num_buffers).find(|&i| !self.frames.contains_key(&i) && !taken(i))
    }

    pub fn stream_on(&mut self) -> DecodeResult<()> {
        self.device.stream_on(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE)?;
        self.streaming = true;
        Ok(())
    }

    pub fn stream_off(&mut self) -> DecodeResult<()> {
        self.device.stream_off(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE)?;
        self.streaming = false;
        self.sentinel_queued = false;
        Ok(())
    }

    /// STREAMOFF reclaims all queued frames; hand them back to the caller
    /// paired with their indices so block<->index mappings survive.
    pub fn take_queued_frames(&mut self) -> Vec<(usize, VideoFrame)> {
        std::mem::take(&mut self.frames).into_iter().collect()
    }

    pub fn deallocate(&mut self) -> DecodeResult<()> {
        self.frames.clear();
        self.device
            .request_buffers(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, self.memory, 0)?;
        Ok(())
    }

    /// Queues the MMAP sentinel (the initial EOS carrier).
    pub fn queue_sentinel(&mut self) -> DecodeResult<()> {
        let mut planes = vec![v4l2_plane::default(); self.num_planes];
        let mut v4l2_buf = v4l2_buffer {
            index: 0,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        self.device.queue_buffer(&mut v4l2_buf, &mut planes)?;
        self.sentinel_queued = true;
        Ok(())
    }

    /// Imports `frame`'s DMA planes on buffer `index` and queues it.
    pub fn queue_frame(&mut self, index: usize, frame: VideoFrame) -> DecodeResult<()> {
        if self.frames.contains_key(&index) {
            return Err(DecodeError::Corrupted(anyhow!(
                "capture index {} queued twice",
                index
            )));
        }

        let fds = frame.block().plane_fds();
        let mut planes = vec![v4l2_plane::default(); self.num_planes];
        for (i, plane) in planes.iter_mut().enumerate() {
            plane.length = self.plane_sizes.get(i).copied().unwrap_or(0);
            // Single-fd blocks carry all planes in one buffer.
            let fd = fds.get(i).or_else(|| fds.first()).ok_or_else(|| {
                DecodeError::Corrupted(anyhow!("frame carries no plane fds"))
            })?;
            plane.m.fd = fd.as_raw_fd();
        }

        let mut v4l2_buf = v4l2_buffer {
            index: index as u32,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            memory: V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        self.device.queue_buffer(&mut v4l2_buf, &mut planes)?;
        self.frames.insert(index, frame);
        Ok(())
    }

    /// Reaps one completed capture buffer.
    pub fn dequeue(&mut self) -> DecodeResult<Option<OutputEvent>> {
        let Some(DequeuedBuffer { index, bitstream_id, bytesused, is_last }) = self
            .device
            .dequeue_buffer(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, self.memory, self.num_planes)?
        else {
            return Ok(None);
        };

        match self.frames.remove(&index) {
            Some(frame) => {
                if bytesused == 0 {
                    Ok(Some(OutputEvent::Recycle { index, frame, is_last }))
                } else {
                    Ok(Some(OutputEvent::Picture { frame, bitstream_id, is_last }))
                }
            }
            None if self.memory == V4L2_MEMORY_MMAP => {
                self.sentinel_queued = false;
                Ok(Some(OutputEvent::Sentinel { is_last }))
            }
            None => Err(DecodeError::Corrupted(anyhow!(
                "capture index {} dequeued with no queued frame",
                index
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_prefers_matching_dma_id() {
        let mut ring = BitstreamRing::new();
        let free: Vec<usize> = (0..NUM_INPUT_BUFFERS).collect();

        // Fresh ring: a never-used slot is chosen first.
        assert_eq!(ring.choose_slot(0xAA, &free), Some(0));
        ring.record(0, 0xAA);
        assert_eq!(ring.last_id(0), Some(0xAA));

        // The same payload goes back to its slot.
        assert_eq!(ring.choose_slot(0xAA, &free), Some(0));

        // A new payload prefers an unused slot over stealing slot 0.
        assert_eq!(ring.choose_slot(0xBB, &free), Some(1));
        ring.record(1, 0xBB);

        // With only used slots free, any free slot is stolen.
        let free = vec![1usize];
        assert_eq!(ring.choose_slot(0xCC, &free), Some(1));

        // No free slot at all.
        assert_eq!(ring.choose_slot(0xCC, &[]), None);
    }

    #[test]
    fn map_payload_respects_offset_and_size() {
        use std::io::Write;

        let mut file = tempfile::tempfile().unwrap();
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut contents = vec![0u8; page + 16];
        contents[page + 3..page + 8].copy_from_slice(&[1, 2, 3, 4, 5]);
        file.write_all(&contents).unwrap();

        let buffer = BitstreamBuffer {
            fd: Arc::new(OwnedFd::from(file)),
            offset: (page + 3) as u32,
            size: 5,
            bitstream_id: 0,
        };
        let payload = buffer.map_payload().unwrap();
        assert_eq!(&payload[..], &[1, 2, 3, 4, 5]);

        let empty = BitstreamBuffer {
            fd: Arc::clone(&buffer.fd),
            offset: 0,
            size: 0,
            bitstream_id: 1,
        };
        assert!(matches!(empty.map_payload(), Err(DecodeError::BadValue(_))));
    }

    #[test]
    fn ring_id_valid_iff_used() {
        let mut ring = BitstreamRing::new();
        for slot in 0..NUM_INPUT_BUFFERS {
            assert_eq!(ring.last_id(slot), None);
        }
        ring.record(3, 7);
        for slot in 0..NUM_INPUT_BUFFERS {
            assert_eq!(ring.last_id(slot).is_some(), slot == 3);
        }
    }
}
