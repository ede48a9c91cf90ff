// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 SPS walking, following the syntax order of ITU-T H.264 7.3.2.1.

use super::BitReader;
use super::NalError;
use super::NalResult;
use super::SpsColorAspects;

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> NalResult<()> {
    let mut last_scale = 8i64;
    let mut next_scale = 8i64;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = i64::from(reader.read_se()?);
            next_scale = (last_scale + delta).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Extracts the VUI color aspects from an SPS NAL unit (header byte first,
/// start code already stripped by the walker).
pub fn parse_sps_color_aspects(nal: &[u8]) -> NalResult<SpsColorAspects> {
    let rbsp = super::strip_emulation_prevention(nal);
    let mut r = BitReader::new(&rbsp);

    r.skip(1)?; // forbidden_zero_bit
    r.skip(2)?; // nal_ref_idc
    if r.read_bits(5)? != 7 {
        return Err(NalError::MalformedStream("not an SPS NAL"));
    }

    let profile_idc = r.read_bits(8)?;
    r.skip(8)?; // constraint_set flags + reserved_zero_2bits
    r.skip(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? {
            // seq_scaling_matrix_present_flag
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.skip(1)?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycle = r.read_ue()?;
        if cycle > 255 {
            return Err(NalError::MalformedStream("num_ref_frames_in_pic_order_cnt_cycle"));
        }
        for _ in 0..cycle {
            r.read_se()?; // offset_for_ref_frame
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.skip(1)?; // gaps_in_frame_num_value_allowed_flag
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    let frame_mbs_only = r.read_bit()?;
    if !frame_mbs_only {
        r.skip(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip(1)?; // direct_8x8_inference_flag
    if r.read_bit()? {
        // frame_cropping_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }

    let mut aspects = SpsColorAspects::default();
    if !r.read_bit()? {
        // vui_parameters_present_flag
        return Ok(aspects);
    }

    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = r.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            r.skip(32)?; // sar_width + sar_height
        }
    }
    if r.read_bit()? {
        // overscan_info_present_flag
        r.skip(1)?;
    }
    if r.read_bit()? {
        // video_signal_type_present_flag
        r.skip(3)?; // video_format
        aspects.full_range = Some(r.read_bit()?);
        if r.read_bit()? {
            // colour_description_present_flag
            aspects.primaries = r.read_bits(8)? as u8;
            aspects.transfer = r.read_bits(8)? as u8;
            aspects.matrix = r.read_bits(8)? as u8;
        }
    }
    Ok(aspects)
}
