// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC SPS walking, following the syntax order of ITU-T H.265 7.3.2.2.
//!
//! Only the fields needed to stay bit-aligned up to the VUI are decoded;
//! everything else is skipped. Bounded syntax elements are checked so a
//! hostile stream fails with MalformedStream instead of looping.

use super::BitReader;
use super::NalError;
use super::NalResult;
use super::SpsColorAspects;

const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
const MAX_REF_PICS: u32 = 32;
const MAX_LONG_TERM_REF_PICS: u32 = 32;

fn skip_profile_tier_level(r: &mut BitReader, max_sub_layers_minus1: u32) -> NalResult<()> {
    r.skip(88)?; // general profile space/tier/idc, compat flags, constraints
    r.skip(8)?; // general_level_idc

    let mut profile_present = [false; 7];
    let mut level_present = [false; 7];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_bit()?;
        level_present[i] = r.read_bit()?;
    }
    if max_sub_layers_minus1 > 0 {
        r.skip(2 * (8 - max_sub_layers_minus1))?; // reserved_zero_2bits
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip(88)?;
        }
        if level_present[i] {
            r.skip(8)?;
        }
    }
    Ok(())
}

fn skip_scaling_list_data(r: &mut BitReader) -> NalResult<()> {
    for size_id in 0..4u32 {
        let matrices = if size_id == 3 { 2 } else { 6 };
        for _ in 0..matrices {
            if !r.read_bit()? {
                // scaling_list_pred_mode_flag == 0: inferred from another list
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                let coefs = std::cmp::min(64, 1u32 << (4 + (size_id << 1)));
                for _ in 0..coefs {
                    r.read_se()?; // scaling_list_delta_coef
                }
            }
        }
    }
    Ok(())
}

/// The delta-POC sets of one short-term reference picture set, kept only so
/// that later predicted sets can be walked with the right flag counts.
struct StRefPicSet {
    s0: Vec<i64>,
    s1: Vec<i64>,
}

fn parse_st_ref_pic_set(
    r: &mut BitReader,
    idx: usize,
    sets: &[StRefPicSet],
) -> NalResult<StRefPicSet> {
    let predicted = idx != 0 && r.read_bit()?;
    if !predicted {
        let num_negative = r.read_ue()?;
        let num_positive = r.read_ue()?;
        if num_negative > MAX_REF_PICS || num_positive > MAX_REF_PICS {
            return Err(NalError::MalformedStream("short-term ref pic count"));
        }
        let mut s0 = Vec::with_capacity(num_negative as usize);
        let mut poc = 0i64;
        for _ in 0..num_negative {
            poc -= i64::from(r.read_ue()?) + 1; // delta_poc_s0_minus1
            r.skip(1)?; // used_by_curr_pic_s0_flag
            s0.push(poc);
        }
        let mut s1 = Vec::with_capacity(num_positive as usize);
        let mut poc = 0i64;
        for _ in 0..num_positive {
            poc += i64::from(r.read_ue()?) + 1; // delta_poc_s1_minus1
            r.skip(1)?; // used_by_curr_pic_s1_flag
            s1.push(poc);
        }
        return Ok(StRefPicSet { s0, s1 });
    }

    // Within an SPS the reference set is always the previous one;
    // delta_idx_minus1 only appears in slice headers.
    let reference = &sets[idx - 1];
    let sign = r.read_bit()?;
    let abs_delta_rps_minus1 = r.read_ue()?;
    let delta_rps = (1 - 2 * i64::from(sign)) * (i64::from(abs_delta_rps_minus1) + 1);

    let num_delta_pocs = reference.s0.len() + reference.s1.len();
    let mut use_delta = vec![true; num_delta_pocs + 1];
    for flag in use_delta.iter_mut() {
        if !r.read_bit()? {
            // used_by_curr_pic_flag
            *flag = r.read_bit()?;
        }
    }

    // Derivation of DeltaPocS0/DeltaPocS1 per H.265 7.4.8.
    let mut s0 = Vec::new();
    for j in (0..reference.s1.len()).rev() {
        let poc = reference.s1[j] + delta_rps;
        if poc < 0 && use_delta[reference.s0.len() + j] {
            s0.push(poc);
        }
    }
    if delta_rps < 0 && use_delta[num_delta_pocs] {
        s0.push(delta_rps);
    }
    for j in 0..reference.s0.len() {
        let poc = reference.s0[j] + delta_rps;
        if poc < 0 && use_delta[j] {
            s0.push(poc);
        }
    }

    let mut s1 = Vec::new();
    for j in (0..reference.s0.len()).rev() {
        let poc = reference.s0[j] + delta_rps;
        if poc > 0 && use_delta[j] {
            s1.push(poc);
        }
    }
    if delta_rps > 0 && use_delta[num_delta_pocs] {
        s1.push(delta_rps);
    }
    for j in 0..reference.s1.len() {
        let poc = reference.s1[j] + delta_rps;
        if poc > 0 && use_delta[reference.s0.len() + j] {
            s1.push(poc);
        }
    }

    Ok(StRefPicSet { s0, s1 })
}

/// Extracts the VUI color aspects from an HEVC SPS NAL unit (two-byte NAL
/// header first, start code already stripped by the walker).
pub fn parse_sps_color_aspects(nal: &[u8]) -> NalResult<SpsColorAspects> {
    let rbsp = super::strip_emulation_prevention(nal);
    let mut r = BitReader::new(&rbsp);

    r.skip(1)?; // forbidden_zero_bit
    if r.read_bits(6)? != 33 {
        return Err(NalError::MalformedStream("not an SPS NAL"));
    }
    r.skip(9)?; // nuh_layer_id + nuh_temporal_id_plus1

    r.skip(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)?;
    if max_sub_layers_minus1 > 6 {
        return Err(NalError::MalformedStream("sps_max_sub_layers_minus1"));
    }
    r.skip(1)?; // sps_temporal_id_nesting_flag
    skip_profile_tier_level(&mut r, max_sub_layers_minus1)?;

    r.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc == 3 {
        r.skip(1)?; // separate_colour_plane_flag
    }
    r.read_ue()?; // pic_width_in_luma_samples
    r.read_ue()?; // pic_height_in_luma_samples
    if r.read_bit()? {
        // conformance_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    r.read_ue()?; // bit_depth_luma_minus8
    r.read_ue()?; // bit_depth_chroma_minus8

    let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
    if log2_max_pic_order_cnt_lsb_minus4 > 12 {
        return Err(NalError::MalformedStream("log2_max_pic_order_cnt_lsb_minus4"));
    }

    let ordering_info_present = r.read_bit()?;
    let first = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
    for _ in first..=max_sub_layers_minus1 {
        r.read_ue()?; // sps_max_dec_pic_buffering_minus1
        r.read_ue()?; // sps_max_num_reorder_pics
        r.read_ue()?; // sps_max_latency_increase_plus1
    }

    r.read_ue()?; // log2_min_luma_coding_block_size_minus3
    r.read_ue()?; // log2_diff_max_min_luma_coding_block_size
    r.read_ue()?; // log2_min_luma_transform_block_size_minus2
    r.read_ue()?; // log2_diff_max_min_luma_transform_block_size
    r.read_ue()?; // max_transform_hierarchy_depth_inter
    r.read_ue()?; // max_transform_hierarchy_depth_intra

    if r.read_bit()? {
        // scaling_list_enabled_flag
        if r.read_bit()? {
            // sps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut r)?;
        }
    }

    r.skip(2)?; // amp_enabled_flag + sample_adaptive_offset_enabled_flag

    if r.read_bit()? {
        // pcm_enabled_flag
        r.skip(8)?; // pcm bit depths
        r.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        r.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        r.skip(1)?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_ref_pic_sets = r.read_ue()?;
    if num_short_term_ref_pic_sets > MAX_SHORT_TERM_REF_PIC_SETS {
        return Err(NalError::MalformedStream("num_short_term_ref_pic_sets"));
    }
    let mut sets = Vec::with_capacity(num_short_term_ref_pic_sets as usize);
    for idx in 0..num_short_term_ref_pic_sets as usize {
        let set = parse_st_ref_pic_set(&mut r, idx, &sets)?;
        sets.push(set);
    }

    if r.read_bit()? {
        // long_term_ref_pics_present_flag
        let count = r.read_ue()?;
        if count > MAX_LONG_TERM_REF_PICS {
            return Err(NalError::MalformedStream("num_long_term_ref_pics_sps"));
        }
        for _ in 0..count {
            r.skip(log2_max_pic_order_cnt_lsb_minus4 + 4)?; // lt_ref_pic_poc_lsb_sps
            r.skip(1)?; // used_by_curr_pic_lt_sps_flag
        }
    }

    r.skip(2)?; // sps_temporal_mvp_enabled_flag + strong_intra_smoothing_enabled_flag

    let mut aspects = SpsColorAspects::default();
    if !r.read_bit()? {
        // vui_parameters_present_flag
        return Ok(aspects);
    }

    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        if r.read_bits(8)? == 255 {
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

#[cfg(test)]
mod tests {
    use super::super::test_support::BitWriter;
    use super::*;

    struct SpsParams {
        max_sub_layers_minus1: u32,
        num_short_term_ref_pic_sets: u32,
        vui: Option<(bool, u8, u8, u8)>,
    }

    impl Default for SpsParams {
        fn default() -> SpsParams {
            SpsParams {
                max_sub_layers_minus1: 0,
                num_short_term_ref_pic_sets: 0,
                vui: None,
            }
        }
    }

    fn build_sps(params: SpsParams) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bit(false); // forbidden_zero_bit
        w.put_bits(33, 6); // nal_unit_type = SPS_NUT
        w.put_bits(0, 6); // nuh_layer_id
        w.put_bits(1, 3); // nuh_temporal_id_plus1

        w.put_bits(0, 4); // sps_video_parameter_set_id
        w.put_bits(params.max_sub_layers_minus1, 3);
        w.put_bit(true); // sps_temporal_id_nesting_flag

        // profile_tier_level: general block + level.
        w.put_bits(0, 32);
        w.put_bits(0, 32);
        w.put_bits(0, 24);
        w.put_bits(93, 8); // general_level_idc
        for _ in 0..params.max_sub_layers_minus1 {
            w.put_bit(false); // sub_layer_profile_present_flag
            w.put_bit(false); // sub_layer_level_present_flag
        }
        if params.max_sub_layers_minus1 > 0 {
            w.put_bits(0, 2 * (8 - params.max_sub_layers_minus1));
        }

        w.put_ue(0); // sps_seq_parameter_set_id
        w.put_ue(1); // chroma_format_idc
        w.put_ue(1920); // pic_width_in_luma_samples
        w.put_ue(1080); // pic_height_in_luma_samples
        w.put_bit(false); // conformance_window_flag
        w.put_ue(0); // bit_depth_luma_minus8
        w.put_ue(0); // bit_depth_chroma_minus8
        w.put_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.put_bit(false); // sps_sub_layer_ordering_info_present_flag
        for _ in 0..1 {
            w.put_ue(4);
            w.put_ue(0);
            w.put_ue(0);
        }
        w.put_ue(0); // log2_min_luma_coding_block_size_minus3
        w.put_ue(3); // log2_diff_max_min_luma_coding_block_size
        w.put_ue(0); // log2_min_luma_transform_block_size_minus2
        w.put_ue(3); // log2_diff_max_min_luma_transform_block_size
        w.put_ue(0); // max_transform_hierarchy_depth_inter
        w.put_ue(0); // max_transform_hierarchy_depth_intra
        w.put_bit(false); // scaling_list_enabled_flag
        w.put_bit(false); // amp_enabled_flag
        w.put_bit(false); // sample_adaptive_offset_enabled_flag
        w.put_bit(false); // pcm_enabled_flag

        w.put_ue(params.num_short_term_ref_pic_sets);
        for idx in 0..params.num_short_term_ref_pic_sets {
            if idx != 0 {
                w.put_bit(false); // inter_ref_pic_set_prediction_flag
            }
            w.put_ue(1); // num_negative_pics
            w.put_ue(0); // num_positive_pics
            w.put_ue(0); // delta_poc_s0_minus1
            w.put_bit(true); // used_by_curr_pic_s0_flag
        }

        w.put_bit(false); // long_term_ref_pics_present_flag
        w.put_bit(true); // sps_temporal_mvp_enabled_flag
        w.put_bit(true); // strong_intra_smoothing_enabled_flag

        match params.vui {
            None => w.put_bit(false),
            Some((full_range, primaries, transfer, matrix)) => {
                w.put_bit(true); // vui_parameters_present_flag
                w.put_bit(false); // aspect_ratio_info_present_flag
                w.put_bit(false); // overscan_info_present_flag
                w.put_bit(true); // video_signal_type_present_flag
                w.put_bits(5, 3); // video_format = unspecified
                w.put_bit(full_range);
                w.put_bit(true); // colour_description_present_flag
                w.put_bits(primaries.into(), 8);
                w.put_bits(transfer.into(), 8);
                w.put_bits(matrix.into(), 8);
            }
        }
        w.finish()
    }

    #[test]
    fn sps_with_bt2020_pq_vui() {
        let sps = build_sps(SpsParams {
            vui: Some((true, 9, 16, 9)),
            ..Default::default()
        });
        let aspects = parse_sps_color_aspects(&sps).unwrap();
        assert_eq!(aspects.full_range, Some(true));
        assert_eq!((aspects.primaries, aspects.transfer, aspects.matrix), (9, 16, 9));
    }

    #[test]
    fn sps_without_vui_yields_unspecified() {
        let aspects = parse_sps_color_aspects(&build_sps(SpsParams::default())).unwrap();
        assert_eq!(aspects, SpsColorAspects::default());
    }

    #[test]
    fn sps_with_sub_layers_and_ref_pic_sets() {
        let sps = build_sps(SpsParams {
            max_sub_layers_minus1: 2,
            num_short_term_ref_pic_sets: 3,
            vui: Some((false, 1, 1, 1)),
        });
        let aspects = parse_sps_color_aspects(&sps).unwrap();
        assert_eq!((aspects.primaries, aspects.transfer, aspects.matrix), (1, 1, 1));
    }

    #[test]
    fn too_many_sub_layers_is_malformed() {
        let mut w = BitWriter::new();
        w.put_bit(false);
        w.put_bits(33, 6);
        w.put_bits(0, 6);
        w.put_bits(1, 3);
        w.put_bits(0, 4);
        w.put_bits(7, 3); // sps_max_sub_layers_minus1 = 7
        let sps = w.finish();
        assert_eq!(
            parse_sps_color_aspects(&sps),
            Err(NalError::MalformedStream("sps_max_sub_layers_minus1"))
        );
    }

    #[test]
    fn too_many_ref_pic_sets_is_malformed() {
        // Splice an oversized set count into an otherwise valid SPS by
        // rebuilding with the boundary value.
        let sps = build_sps(SpsParams {
            num_short_term_ref_pic_sets: 64,
            ..Default::default()
        });
        assert!(parse_sps_color_aspects(&sps).is_ok());

        let sps = build_sps(SpsParams {
            num_short_term_ref_pic_sets: 65,
            ..Default::default()
        });
        assert_eq!(
            parse_sps_color_aspects(&sps),
            Err(NalError::MalformedStream("num_short_term_ref_pic_sets"))
        );
    }

    #[test]
    fn truncated_sps_is_insufficient_data() {
        let sps = build_sps(SpsParams {
            vui: Some((true, 9, 16, 9)),
            ..Default::default()
        });
        assert_eq!(
            parse_sps_color_aspects(&sps[..10]),
            Err(NalError::InsufficientData)
        );
    }
}
