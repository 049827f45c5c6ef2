//! MCS and Transport Block Size Tables
//!
//! Implements the MCS index tables of 3GPP TS 38.214 §5.1.3.1 and the TBS
//! determination of §5.1.3.2.

use common::types::ModulationScheme;

/// Which MCS index table a BWP uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McsTable {
    /// Table 5.1.3.1-1 (up to 64QAM)
    Qam64,
    /// Table 5.1.3.1-2 (up to 256QAM)
    Qam256,
}

/// (Qm, R x 1024 x 10) for Table 5.1.3.1-1
const MCS_TABLE_QAM64: [(u8, u16); 29] = [
    (2, 1200), (2, 1570), (2, 1930), (2, 2510), (2, 3080), (2, 3790), (2, 4490), (2, 5260),
    (2, 6020), (2, 6790), (4, 3400), (4, 3780), (4, 4340), (4, 4900), (4, 5530), (4, 6160),
    (4, 6580), (6, 4380), (6, 4660), (6, 5170), (6, 5670), (6, 6160), (6, 6660), (6, 7190),
    (6, 7720), (6, 8220), (6, 8730), (6, 9100), (6, 9480),
];

/// (Qm, R x 1024 x 10) for Table 5.1.3.1-2
const MCS_TABLE_QAM256: [(u8, u16); 28] = [
    (2, 1200), (2, 1930), (2, 3080), (2, 4490), (2, 6020), (4, 3780), (4, 4340), (4, 4900),
    (4, 5530), (4, 6160), (4, 6580), (6, 4660), (6, 5170), (6, 5670), (6, 6160), (6, 6660),
    (6, 7190), (6, 7720), (6, 8220), (6, 8730), (8, 6825), (8, 7110), (8, 7540), (8, 7970),
    (8, 8410), (8, 8850), (8, 9165), (8, 9480),
];

/// Table 5.1.3.2-1: TBS for N_info <= 3824
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168, 176,
    184, 192, 208, 224, 240, 256, 272, 288, 304, 320, 336, 352, 368, 384, 408, 432, 456, 480,
    504, 528, 552, 576, 608, 640, 672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064,
    1128, 1160, 1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736, 1800,
    1864, 1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600, 2664, 2728, 2792, 2856,
    2976, 3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

/// Highest MCS index reachable per CQI for CQI table 1 / MCS table 1
const CQI_TO_MCS_QAM64: [u8; 16] = [0, 0, 0, 2, 4, 6, 8, 11, 13, 15, 18, 20, 22, 24, 26, 28];

/// Highest MCS index reachable per CQI for CQI table 2 / MCS table 2
const CQI_TO_MCS_QAM256: [u8; 16] = [0, 0, 1, 3, 5, 7, 9, 11, 13, 15, 17, 19, 21, 23, 25, 27];

/// Redundancy version for each HARQ round
const RV_ROUND_MAP: [u8; 4] = [0, 2, 3, 1];

impl McsTable {
    /// Highest valid MCS index of the table
    pub fn max_mcs(&self) -> u8 {
        match self {
            McsTable::Qam64 => (MCS_TABLE_QAM64.len() - 1) as u8,
            McsTable::Qam256 => (MCS_TABLE_QAM256.len() - 1) as u8,
        }
    }

    fn entry(&self, mcs: u8) -> (u8, u16) {
        let mcs = mcs.min(self.max_mcs()) as usize;
        match self {
            McsTable::Qam64 => MCS_TABLE_QAM64[mcs],
            McsTable::Qam256 => MCS_TABLE_QAM256[mcs],
        }
    }

    /// Modulation order Qm
    pub fn modulation_order(&self, mcs: u8) -> u8 {
        self.entry(mcs).0
    }

    /// Modulation scheme for an MCS index
    pub fn modulation(&self, mcs: u8) -> ModulationScheme {
        ModulationScheme::from_order(self.modulation_order(mcs)).unwrap_or(ModulationScheme::Qpsk)
    }

    /// Target code rate R x 1024 x 10
    pub fn code_rate_x10(&self, mcs: u8) -> u16 {
        self.entry(mcs).1
    }

    /// Highest MCS a wideband CQI allows
    pub fn mcs_from_cqi(&self, cqi: u8) -> u8 {
        let cqi = cqi.min(15) as usize;
        match self {
            McsTable::Qam64 => CQI_TO_MCS_QAM64[cqi],
            McsTable::Qam256 => CQI_TO_MCS_QAM256[cqi],
        }
    }
}

/// Redundancy version used for a HARQ round
pub fn rv_for_round(round: u8) -> u8 {
    RV_ROUND_MAP[round as usize % RV_ROUND_MAP.len()]
}

/// Inputs of the TBS computation
#[derive(Debug, Clone, Copy)]
pub struct TbsParams {
    pub table: McsTable,
    pub mcs: u8,
    pub nb_rb: u16,
    pub nb_symb: u8,
    /// DMRS resource elements per PRB
    pub dmrs_re_per_prb: u16,
    pub nr_of_layers: u8,
}

/// Transport block size in bits (38.214 §5.1.3.2)
pub fn compute_tbs_bits(params: &TbsParams) -> u32 {
    if params.nb_rb == 0 || params.nb_symb == 0 {
        return 0;
    }

    let (qm, r_x10) = params.table.entry(params.mcs);
    let re_per_prb = (12 * params.nb_symb as u32).saturating_sub(params.dmrs_re_per_prb as u32);
    let n_re = re_per_prb.min(156) * params.nb_rb as u32;
    // R is given as x1024 x10
    let n_info = n_re as u64 * r_x10 as u64 * qm as u64 * params.nr_of_layers.max(1) as u64 / 10240;
    let n_info = n_info as u32;

    if n_info == 0 {
        return 0;
    }

    if n_info <= 3824 {
        let n = (ilog2(n_info) as i32 - 6).max(3) as u32;
        let n_info_q = (1u32 << n) * (n_info >> n);
        let n_info_q = n_info_q.max(24);
        return TBS_TABLE
            .iter()
            .copied()
            .find(|&tbs| tbs >= n_info_q)
            .unwrap_or(3824);
    }

    let n = ilog2(n_info - 24) - 5;
    let step = 1u32 << n;
    // round((n_info - 24) / 2^n)
    let n_info_q = (step * ((n_info - 24 + step / 2) / step)).max(3840);

    if r_x10 <= 2560 {
        let c = (n_info_q + 24).div_ceil(3816);
        8 * c * (n_info_q + 24).div_ceil(8 * c) - 24
    } else if n_info_q > 8424 {
        let c = (n_info_q + 24).div_ceil(8424);
        8 * c * (n_info_q + 24).div_ceil(8 * c) - 24
    } else {
        8 * (n_info_q + 24).div_ceil(8) - 24
    }
}

/// Transport block size in bytes
pub fn compute_tbs_bytes(params: &TbsParams) -> u32 {
    compute_tbs_bits(params) / 8
}

fn ilog2(v: u32) -> u32 {
    31 - v.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mcs: u8, nb_rb: u16) -> TbsParams {
        TbsParams {
            table: McsTable::Qam64,
            mcs,
            nb_rb,
            nb_symb: 12,
            dmrs_re_per_prb: 12,
            nr_of_layers: 1,
        }
    }

    #[test]
    fn test_mcs_table_lookup() {
        assert_eq!(McsTable::Qam64.max_mcs(), 28);
        assert_eq!(McsTable::Qam256.max_mcs(), 27);
        assert_eq!(McsTable::Qam64.modulation(9), ModulationScheme::Qpsk);
        assert_eq!(McsTable::Qam64.modulation(10), ModulationScheme::Qam16);
        assert_eq!(McsTable::Qam256.modulation(20), ModulationScheme::Qam256);
        // Out-of-range MCS saturates at the table end
        assert_eq!(McsTable::Qam64.code_rate_x10(40), 9480);
    }

    #[test]
    fn test_rv_sequence() {
        assert_eq!((0..4).map(rv_for_round).collect::<Vec<_>>(), vec![0, 2, 3, 1]);
        assert_eq!(rv_for_round(4), 0);
    }

    #[test]
    fn test_small_tbs_uses_quantised_table() {
        // 1 PRB, MCS 0: 132 RE * 120/1024 * 2 = 30 bits, quantised to 24
        let tbs = compute_tbs_bits(&params(0, 1));
        assert_eq!(tbs, 24);
        assert!(TBS_TABLE.contains(&compute_tbs_bits(&params(5, 3))));
    }

    #[test]
    fn test_large_tbs_is_byte_aligned_and_monotonic() {
        let mut last = 0;
        for nb_rb in [10u16, 25, 50, 100, 273] {
            let tbs = compute_tbs_bits(&params(27, nb_rb));
            assert_eq!((tbs + 24) % 8, 0);
            assert!(tbs > last);
            last = tbs;
        }
    }

    #[test]
    fn test_zero_allocation() {
        assert_eq!(compute_tbs_bits(&params(10, 0)), 0);
    }

    #[test]
    fn test_cqi_mapping() {
        assert_eq!(McsTable::Qam64.mcs_from_cqi(15), 28);
        assert_eq!(McsTable::Qam64.mcs_from_cqi(0), 0);
        assert_eq!(McsTable::Qam256.mcs_from_cqi(20), 27);
    }
}
