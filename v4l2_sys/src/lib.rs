// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-maintained V4L2 kernel ABI declarations for the decode pipeline.
//!
//! Only the subset of `videodev2.h` the memory-to-memory decoder touches is
//! declared here. Values must match the kernel headers bit-for-bit; the
//! layout tests at the bottom pin the struct sizes for 64-bit targets.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

pub const fn v4l2_fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

// Compressed formats.
pub const V4L2_PIX_FMT_H264: u32 = v4l2_fourcc(b'H', b'2', b'6', b'4');
pub const V4L2_PIX_FMT_HEVC: u32 = v4l2_fourcc(b'H', b'E', b'V', b'C');
pub const V4L2_PIX_FMT_VP8: u32 = v4l2_fourcc(b'V', b'P', b'8', b'0');
pub const V4L2_PIX_FMT_VP9: u32 = v4l2_fourcc(b'V', b'P', b'9', b'0');

// Raw 4:2:0 formats the capture queue may produce.
pub const V4L2_PIX_FMT_YUV420: u32 = v4l2_fourcc(b'Y', b'U', b'1', b'2');
pub const V4L2_PIX_FMT_YVU420: u32 = v4l2_fourcc(b'Y', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_YUV420M: u32 = v4l2_fourcc(b'Y', b'M', b'1', b'2');
pub const V4L2_PIX_FMT_YVU420M: u32 = v4l2_fourcc(b'Y', b'M', b'2', b'1');
pub const V4L2_PIX_FMT_NV12: u32 = v4l2_fourcc(b'N', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_NV21: u32 = v4l2_fourcc(b'N', b'V', b'2', b'1');
pub const V4L2_PIX_FMT_NV12M: u32 = v4l2_fourcc(b'N', b'M', b'1', b'2');
pub const V4L2_PIX_FMT_NV21M: u32 = v4l2_fourcc(b'N', b'M', b'2', b'1');

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_USERPTR: u32 = 2;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

pub const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;

pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
pub const V4L2_EVENT_SRC_CH_RESOLUTION: u32 = 0x0001;

pub const V4L2_DEC_CMD_START: u32 = 0;
pub const V4L2_DEC_CMD_STOP: u32 = 1;

pub const V4L2_SEL_TGT_COMPOSE: u32 = 0x0100;

pub const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
pub const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
pub const V4L2_CID_MIN_BUFFERS_FOR_CAPTURE: u32 = V4L2_CID_BASE + 63;

pub const V4L2_CTRL_CLASS_CODEC: u32 = 0x0099_0000;
pub const V4L2_CID_CODEC_BASE: u32 = V4L2_CTRL_CLASS_CODEC | 0x900;
pub const V4L2_CID_MPEG_VIDEO_H264_LEVEL: u32 = V4L2_CID_CODEC_BASE + 359;
pub const V4L2_CID_MPEG_VIDEO_H264_PROFILE: u32 = V4L2_CID_CODEC_BASE + 363;
pub const V4L2_CID_MPEG_VIDEO_VP8_PROFILE: u32 = V4L2_CID_CODEC_BASE + 510;
pub const V4L2_CID_MPEG_VIDEO_VP9_PROFILE: u32 = V4L2_CID_CODEC_BASE + 511;
pub const V4L2_CID_MPEG_VIDEO_HEVC_PROFILE: u32 = V4L2_CID_CODEC_BASE + 615;
pub const V4L2_CID_MPEG_VIDEO_HEVC_LEVEL: u32 = V4L2_CID_CODEC_BASE + 616;

pub const VIDEO_MAX_PLANES: usize = 8;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_fmtdesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_format_fmt {
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u8; 200],
    _bindgen_union_align: [u64; 25],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_plane_m {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_m,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_event_src_change {
    pub changes: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_event_u {
    pub src_change: v4l2_event_src_change,
    pub data: [u8; 64],
    _bindgen_union_align: [u64; 8],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_event {
    pub type_: u32,
    pub u: v4l2_event_u,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_selection {
    pub type_: u32,
    pub target: u32,
    pub flags: u32,
    pub r: v4l2_rect,
    pub reserved: [u32; 9],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_crop {
    pub type_: u32,
    pub c: v4l2_rect,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_decoder_cmd_stop {
    pub pts: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_decoder_cmd_start {
    pub speed: i32,
    pub format: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_decoder_cmd_u {
    pub stop: v4l2_decoder_cmd_stop,
    pub start: v4l2_decoder_cmd_start,
    pub raw: [u32; 16],
    _bindgen_union_align: [u64; 8],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_decoder_cmd {
    pub cmd: u32,
    pub flags: u32,
    pub u: v4l2_decoder_cmd_u,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes, FromZeroes)]
pub struct v4l2_queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub union v4l2_querymenu_u {
    pub name: [u8; 32],
    pub value: i64,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct v4l2_querymenu {
    pub id: u32,
    pub index: u32,
    pub u: v4l2_querymenu_u,
    pub reserved: u32,
}

macro_rules! zeroed_default {
    ($($t:ty),+ $(,)?) => {
        $(
            impl Default for $t {
                fn default() -> Self {
                    // SAFETY: all-zero bytes are a valid representation of
                    // these kernel POD structs.
                    unsafe { std::mem::zeroed() }
                }
            }
        )+
    };
}

zeroed_default!(
    v4l2_format,
    v4l2_plane,
    v4l2_buffer,
    v4l2_event,
    v4l2_decoder_cmd,
    v4l2_querymenu,
);

nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_enum_fmt, b'V', 2, v4l2_fmtdesc);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
nix::ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, v4l2_control);
nix::ioctl_readwrite!(vidioc_queryctrl, b'V', 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_querymenu, b'V', 37, v4l2_querymenu);
nix::ioctl_readwrite!(vidioc_g_crop, b'V', 59, v4l2_crop);
nix::ioctl_read!(vidioc_dqevent, b'V', 89, v4l2_event);
nix::ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, v4l2_event_subscription);
nix::ioctl_readwrite!(vidioc_g_selection, b'V', 94, v4l2_selection);
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', 96, v4l2_decoder_cmd);
nix::ioctl_readwrite!(vidioc_try_decoder_cmd, b'V', 97, v4l2_decoder_cmd);

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn layout_matches_kernel_abi() {
        assert_eq!(size_of::<v4l2_capability>(), 104);
        assert_eq!(size_of::<v4l2_fmtdesc>(), 64);
        assert_eq!(size_of::<v4l2_plane_pix_format>(), 20);
        assert_eq!(size_of::<v4l2_pix_format_mplane>(), 192);
        assert_eq!(size_of::<v4l2_format>(), 208);
        assert_eq!(size_of::<v4l2_plane>(), 64);
        assert_eq!(size_of::<v4l2_buffer>(), 88);
        assert_eq!(size_of::<v4l2_event>(), 136);
        assert_eq!(size_of::<v4l2_selection>(), 64);
        assert_eq!(size_of::<v4l2_decoder_cmd>(), 72);
        assert_eq!(size_of::<v4l2_querymenu>(), 44);
    }

    #[test]
    fn fourcc_encoding() {
        assert_eq!(V4L2_PIX_FMT_H264, 0x3436_3248);
        assert_eq!(V4L2_PIX_FMT_NV12, 0x3231_564e);
    }
}
