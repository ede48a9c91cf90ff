// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The passive parameter/capability object computed at component creation:
//! codec identity, profile and level lists, delays, input-buffer sizing,
//! and color-aspect merging.

use log::warn;
use v4l2_sys::*;

use crate::device::V4l2Device;
use crate::nal::SpsColorAspects;
use crate::Size;
use crate::VideoCodec;

/// Base compressed-buffer size; boards carrying high-bitrate streams select
/// the larger variant at build time.
#[cfg(not(feature = "large-input-buffers"))]
pub const BASE_INPUT_BUFFER_SIZE: u32 = 1 << 20;
#[cfg(feature = "large-input-buffers")]
pub const BASE_INPUT_BUFFER_SIZE: u32 = 2 << 20;

/// Streams wider than 4K get the quadrupled input buffer.
const LARGE_STREAM_AREA: u64 = 3840 * 2160;

const DEFAULT_MAX_RESOLUTION: Size = Size { width: 4096, height: 4096 };

/// Picture dimensions advertised to the framework step by this.
pub const PICTURE_SIZE_STEP: u32 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    Bt709,
    Bt470M,
    Bt601_625,
    Bt601_525,
    GenericFilm,
    Bt2020,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    Linear,
    Srgb,
    Smpte170M,
    Gamma22,
    Gamma28,
    St2084,
    Hlg,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Bt709,
    Bt601,
    Smpte240M,
    Bt2020,
    Bt2020Constant,
    Other,
}

/// The four-tuple the framework reflects for signal characteristics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
}

impl ColorAspects {
    /// Maps the raw ISO/IEC 23091-2 code points extracted from an SPS.
    pub fn from_coded(sps: SpsColorAspects) -> ColorAspects {
        let range = match sps.full_range {
            None => ColorRange::Unspecified,
            Some(true) => ColorRange::Full,
            Some(false) => ColorRange::Limited,
        };
        let primaries = match sps.primaries {
            2 => ColorPrimaries::Unspecified,
            1 => ColorPrimaries::Bt709,
            4 => ColorPrimaries::Bt470M,
            5 => ColorPrimaries::Bt601_625,
            6 | 7 => ColorPrimaries::Bt601_525,
            8 => ColorPrimaries::GenericFilm,
            9 => ColorPrimaries::Bt2020,
            _ => ColorPrimaries::Other,
        };
        let transfer = match sps.transfer {
            2 => ColorTransfer::Unspecified,
            1 | 6 | 14 | 15 => ColorTransfer::Smpte170M,
            4 => ColorTransfer::Gamma22,
            5 => ColorTransfer::Gamma28,
            8 => ColorTransfer::Linear,
            13 => ColorTransfer::Srgb,
            16 => ColorTransfer::St2084,
            18 => ColorTransfer::Hlg,
            _ => ColorTransfer::Other,
        };
        let matrix = match sps.matrix {
            2 => ColorMatrix::Unspecified,
            1 => ColorMatrix::Bt709,
            5 | 6 => ColorMatrix::Bt601,
            7 => ColorMatrix::Smpte240M,
            9 => ColorMatrix::Bt2020,
            10 => ColorMatrix::Bt2020Constant,
            _ => ColorMatrix::Other,
        };
        ColorAspects { range, primaries, transfer, matrix }
    }

    /// Per-field merge: the coded value wins unless it is UNSPECIFIED, in
    /// which case the default tuning is substituted.
    pub fn merge(default: &ColorAspects, coded: &ColorAspects) -> ColorAspects {
        ColorAspects {
            range: if coded.range == ColorRange::Unspecified {
                default.range
            } else {
                coded.range
            },
            primaries: if coded.primaries == ColorPrimaries::Unspecified {
                default.primaries
            } else {
                coded.primaries
            },
            transfer: if coded.transfer == ColorTransfer::Unspecified {
                default.transfer
            } else {
                coded.transfer
            },
            matrix: if coded.matrix == ColorMatrix::Unspecified {
                default.matrix
            } else {
                coded.matrix
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    H264Baseline,
    H264ConstrainedBaseline,
    H264Main,
    H264Extended,
    H264High,
    HevcMain,
    HevcMainStillPicture,
    HevcMain10,
    Vp8Profile0,
    Vp8Profile1,
    Vp8Profile2,
    Vp8Profile3,
    Vp9Profile0,
    Vp9Profile1,
    Vp9Profile2,
    Vp9Profile3,
}

/// A level as the index of the driver's level-control menu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Level(pub u8);

fn profile_from_menu(codec: VideoCodec, index: i64) -> Option<Profile> {
    match codec {
        VideoCodec::H264 => match index {
            0 => Some(Profile::H264Baseline),
            1 => Some(Profile::H264ConstrainedBaseline),
            2 => Some(Profile::H264Main),
            3 => Some(Profile::H264Extended),
            4 => Some(Profile::H264High),
            _ => None,
        },
        VideoCodec::Hevc => match index {
            0 => Some(Profile::HevcMain),
            1 => Some(Profile::HevcMainStillPicture),
            2 => Some(Profile::HevcMain10),
            _ => None,
        },
        VideoCodec::Vp8 => match index {
            0 => Some(Profile::Vp8Profile0),
            1 => Some(Profile::Vp8Profile1),
            2 => Some(Profile::Vp8Profile2),
            3 => Some(Profile::Vp8Profile3),
            _ => None,
        },
        VideoCodec::Vp9 => match index {
            0 => Some(Profile::Vp9Profile0),
            1 => Some(Profile::Vp9Profile1),
            2 => Some(Profile::Vp9Profile2),
            3 => Some(Profile::Vp9Profile3),
            _ => None,
        },
    }
}

fn default_profiles(codec: VideoCodec) -> Vec<Profile> {
    match codec {
        VideoCodec::H264 => vec![
            Profile::H264Baseline,
            Profile::H264ConstrainedBaseline,
            Profile::H264Main,
            Profile::H264High,
        ],
        VideoCodec::Hevc => vec![Profile::HevcMain],
        VideoCodec::Vp8 => vec![Profile::Vp8Profile0],
        VideoCodec::Vp9 => vec![Profile::Vp9Profile0],
    }
}

fn default_levels(codec: VideoCodec) -> Vec<Level> {
    match codec {
        // Up to 5.1 in the H.264 menu, up to 5.1 main tier for HEVC.
        VideoCodec::H264 => (0..=15).map(Level).collect(),
        VideoCodec::Hevc => (0..=8).map(Level).collect(),
        VideoCodec::Vp8 | VideoCodec::Vp9 => Vec::new(),
    }
}

fn profile_control(codec: VideoCodec) -> u32 {
    match codec {
        VideoCodec::H264 => V4L2_CID_MPEG_VIDEO_H264_PROFILE,
        VideoCodec::Hevc => V4L2_CID_MPEG_VIDEO_HEVC_PROFILE,
        VideoCodec::Vp8 => V4L2_CID_MPEG_VIDEO_VP8_PROFILE,
        VideoCodec::Vp9 => V4L2_CID_MPEG_VIDEO_VP9_PROFILE,
    }
}

fn level_control(codec: VideoCodec) -> Option<u32> {
    match codec {
        VideoCodec::H264 => Some(V4L2_CID_MPEG_VIDEO_H264_LEVEL),
        VideoCodec::Hevc => Some(V4L2_CID_MPEG_VIDEO_HEVC_LEVEL),
        VideoCodec::Vp8 | VideoCodec::Vp9 => None,
    }
}

/// Passive capability/configuration object handed to the framework.
pub struct DecodeInterface {
    name: String,
    codec: VideoCodec,
    secure: bool,
    supported_profiles: Vec<Profile>,
    supported_levels: Vec<Level>,
    max_resolution: Size,
    picture_size: Size,
    output_delay: u32,
    pipeline_delay: u32,
    default_color_aspects: ColorAspects,
    coded_color_aspects: ColorAspects,
}

impl DecodeInterface {
    /// Computes the capability set. `device` is queried for profile and
    /// level menus when available; codec-appropriate defaults fill in when
    /// the query is unsupported.
    pub fn new(name: &str, codec: VideoCodec, device: Option<&V4l2Device>) -> DecodeInterface {
        let supported_profiles = device
            .and_then(|d| d.query_control_menu(profile_control(codec)))
            .map(|menu| {
                menu.iter()
                    .filter_map(|&index| profile_from_menu(codec, index))
                    .collect::<Vec<_>>()
            })
            .filter(|profiles| !profiles.is_empty())
            .unwrap_or_else(|| {
                warn!("profile query unsupported for {:?}, using defaults", codec);
                default_profiles(codec)
            });

        let supported_levels = level_control(codec)
            .and_then(|id| device.and_then(|d| d.query_control_menu(id)))
            .map(|menu| menu.iter().map(|&i| Level(i as u8)).collect::<Vec<_>>())
            .filter(|levels| !levels.is_empty())
            .unwrap_or_else(|| default_levels(codec));

        DecodeInterface {
            name: name.to_string(),
            codec,
            secure: name.ends_with(".secure"),
            supported_profiles,
            supported_levels,
            max_resolution: DEFAULT_MAX_RESOLUTION,
            picture_size: Size::new(320, 240),
            output_delay: match codec {
                VideoCodec::H264 | VideoCodec::Hevc => 16,
                VideoCodec::Vp8 => 3,
                VideoCodec::Vp9 => 8,
            },
            pipeline_delay: 3,
            default_color_aspects: ColorAspects::default(),
            coded_color_aspects: ColorAspects::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn secure_mode(&self) -> bool {
        self.secure
    }

    pub fn supported_profiles(&self) -> &[Profile] {
        &self.supported_profiles
    }

    pub fn supported_levels(&self) -> &[Level] {
        &self.supported_levels
    }

    pub fn max_resolution(&self) -> Size {
        self.max_resolution
    }

    pub fn picture_size(&self) -> Size {
        self.picture_size
    }

    /// Framework-configured stream dimensions, stepped to the advertised
    /// granularity.
    pub fn set_picture_size(&mut self, size: Size) {
        self.picture_size = Self::align_picture_size(size);
    }

    pub fn output_delay(&self) -> u32 {
        self.output_delay
    }

    pub fn pipeline_delay(&self) -> u32 {
        self.pipeline_delay
    }

    /// Compressed-buffer size for a stream of `size`: quadrupled beyond 4K.
    pub fn input_buffer_size(size: Size) -> u32 {
        if size.area() > LARGE_STREAM_AREA {
            4 * BASE_INPUT_BUFFER_SIZE
        } else {
            BASE_INPUT_BUFFER_SIZE
        }
    }

    /// Rounds picture dimensions up to the advertised step.
    pub fn align_picture_size(size: Size) -> Size {
        let step = PICTURE_SIZE_STEP;
        Size {
            width: size.width.div_ceil(step) * step,
            height: size.height.div_ceil(step) * step,
        }
    }

    pub fn set_default_color_aspects(&mut self, aspects: ColorAspects) {
        self.default_color_aspects = aspects;
    }

    /// Records the aspects extracted from the bitstream's SPS VUI.
    pub fn set_coded_color_aspects(&mut self, aspects: ColorAspects) {
        self.coded_color_aspects = aspects;
    }

    /// The merged aspects the framework reflects: coded values with
    /// defaults substituted per-field where the stream is silent.
    pub fn merged_color_aspects(&self) -> ColorAspects {
        ColorAspects::merge(&self.default_color_aspects, &self.coded_color_aspects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::SpsColorAspects;

    #[test]
    fn secure_suffix_detection() {
        let iface = DecodeInterface::new("c2.v4l2.avc.decoder.secure", VideoCodec::H264, None);
        assert!(iface.secure_mode());
        let iface = DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264, None);
        assert!(!iface.secure_mode());
    }

    #[test]
    fn output_delay_per_codec() {
        for (codec, delay) in [
            (VideoCodec::H264, 16),
            (VideoCodec::Hevc, 16),
            (VideoCodec::Vp8, 3),
            (VideoCodec::Vp9, 8),
        ] {
            let iface = DecodeInterface::new("c2.v4l2.decoder", codec, None);
            assert_eq!(iface.output_delay(), delay);
            assert_eq!(iface.pipeline_delay(), 3);
        }
    }

    #[test]
    fn input_buffer_size_by_area() {
        assert_eq!(
            DecodeInterface::input_buffer_size(Size::new(1920, 1080)),
            BASE_INPUT_BUFFER_SIZE
        );
        assert_eq!(
            DecodeInterface::input_buffer_size(Size::new(3840, 2160)),
            BASE_INPUT_BUFFER_SIZE
        );
        assert_eq!(
            DecodeInterface::input_buffer_size(Size::new(4096, 2160)),
            4 * BASE_INPUT_BUFFER_SIZE
        );
    }

    #[test]
    fn picture_size_steps_by_16() {
        assert_eq!(
            DecodeInterface::align_picture_size(Size::new(321, 241)),
            Size::new(336, 256)
        );
        assert_eq!(
            DecodeInterface::align_picture_size(Size::new(320, 240)),
            Size::new(320, 240)
        );
    }

    #[test]
    fn picture_size_is_stepped_on_set() {
        let mut iface = DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264, None);
        assert_eq!(iface.picture_size(), Size::new(320, 240));
        iface.set_picture_size(Size::new(1919, 1081));
        assert_eq!(iface.picture_size(), Size::new(1920, 1088));
    }

    #[test]
    fn defaults_when_device_query_unsupported() {
        let iface = DecodeInterface::new("c2.v4l2.vp9.decoder", VideoCodec::Vp9, None);
        assert_eq!(iface.supported_profiles(), &[Profile::Vp9Profile0]);
        assert!(iface.supported_levels().is_empty());
        assert_eq!(iface.max_resolution(), Size::new(4096, 4096));
    }

    #[test]
    fn merged_aspects_substitute_only_unspecified_fields() {
        let mut iface = DecodeInterface::new("c2.v4l2.hevc.decoder", VideoCodec::Hevc, None);
        iface.set_default_color_aspects(ColorAspects {
            range: ColorRange::Limited,
            primaries: ColorPrimaries::Bt709,
            transfer: ColorTransfer::Smpte170M,
            matrix: ColorMatrix::Bt709,
        });

        // Stream carries full VUI signalling (BT.2020 + PQ, full range).
        iface.set_coded_color_aspects(ColorAspects::from_coded(SpsColorAspects {
            full_range: Some(true),
            primaries: 9,
            transfer: 16,
            matrix: 9,
        }));
        let merged = iface.merged_color_aspects();
        assert_eq!(merged.range, ColorRange::Full);
        assert_eq!(merged.primaries, ColorPrimaries::Bt2020);
        assert_eq!(merged.transfer, ColorTransfer::St2084);
        assert_eq!(merged.matrix, ColorMatrix::Bt2020);

        // VUI absent: defaults substitute per-field.
        iface.set_coded_color_aspects(ColorAspects::from_coded(SpsColorAspects::default()));
        let merged = iface.merged_color_aspects();
        assert_eq!(merged.range, ColorRange::Limited);
        assert_eq!(merged.primaries, ColorPrimaries::Bt709);
        assert_eq!(merged.transfer, ColorTransfer::Smpte170M);
        assert_eq!(merged.matrix, ColorMatrix::Bt709);

        // Partially specified: only the silent fields fall back.
        iface.set_coded_color_aspects(ColorAspects {
            range: ColorRange::Unspecified,
            primaries: ColorPrimaries::Bt601_625,
            transfer: ColorTransfer::Unspecified,
            matrix: ColorMatrix::Bt601,
        });
        let merged = iface.merged_color_aspects();
        assert_eq!(merged.range, ColorRange::Limited);
        assert_eq!(merged.primaries, ColorPrimaries::Bt601_625);
        assert_eq!(merged.transfer, ColorTransfer::Smpte170M);
        assert_eq!(merged.matrix, ColorMatrix::Bt601);
    }
}
