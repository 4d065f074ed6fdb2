//! Aligned reads and the low-quality base masker.
//!
//! Before assembly, reads with weak evidence are softened: match bases below
//! the quality threshold are overwritten with the reference base (so they
//! cannot seed spurious k-mers) and low-quality soft-clipped flanks are
//! trimmed away. A read where nothing was masked is left untouched.

use crate::cigar::{expand_cigar, sequence_length, CigarFlag, CigarOp};
use crate::region::GenomicRegion;

/// Immutable aligned read: mapped interval, bases, per-base qualities and
/// CIGAR. The mapped interval covers the reference footprint of the
/// alignment (clips excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedRead {
    region: GenomicRegion,
    sequence: Vec<u8>,
    base_qualities: Vec<u8>,
    cigar: Vec<CigarOp>,
}

impl AlignedRead {
    pub fn new(
        region: GenomicRegion,
        sequence: Vec<u8>,
        base_qualities: Vec<u8>,
        cigar: Vec<CigarOp>,
    ) -> Self {
        assert_eq!(
            sequence.len(),
            base_qualities.len(),
            "read base qualities must cover the sequence"
        );
        assert_eq!(
            sequence.len(),
            sequence_length(&cigar),
            "CIGAR sequence footprint must equal the sequence length"
        );
        AlignedRead {
            region,
            sequence,
            base_qualities,
            cigar,
        }
    }

    pub fn region(&self) -> &GenomicRegion {
        &self.region
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn base_qualities(&self) -> &[u8] {
        &self.base_qualities
    }

    pub fn cigar(&self) -> &[CigarOp] {
        &self.cigar
    }

    pub fn sequence_size(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_front_soft_clipped(&self) -> bool {
        matches!(self.cigar.first(), Some(op) if op.flag() == CigarFlag::SoftClip)
    }

    pub fn is_back_soft_clipped(&self) -> bool {
        matches!(self.cigar.last(), Some(op) if op.flag() == CigarFlag::SoftClip)
    }

    pub fn is_soft_clipped(&self) -> bool {
        self.is_front_soft_clipped() || self.is_back_soft_clipped()
    }

    /// (front, back) soft clip lengths.
    pub fn soft_clipped_sizes(&self) -> (usize, usize) {
        let front = if self.is_front_soft_clipped() {
            self.cigar.first().unwrap().len() as usize
        } else {
            0
        };
        let back = if self.is_back_soft_clipped() {
            self.cigar.last().unwrap().len() as usize
        } else {
            0
        };
        (front, back)
    }
}

fn has_low_quality_flank(read: &AlignedRead, good_quality: u8) -> bool {
    if read.is_soft_clipped() {
        if read.is_front_soft_clipped() && read.base_qualities().first() < Some(&good_quality) {
            true
        } else {
            read.is_back_soft_clipped() && read.base_qualities().last() < Some(&good_quality)
        }
    } else {
        false
    }
}

fn has_low_quality_match(read: &AlignedRead, good_quality: u8) -> bool {
    if good_quality == 0 {
        return false;
    }
    let mut offset = 0;
    for op in read.cigar() {
        let size = op.len() as usize;
        if op.is_match() {
            if read.base_qualities()[offset..offset + size]
                .iter()
                .any(|&q| q < good_quality)
            {
                return true;
            }
            offset += size;
        } else if op.advances_sequence() {
            offset += size;
        }
    }
    false
}

/// Whether [`mask`] could change this read at all.
pub fn requires_masking(read: &AlignedRead, good_quality: u8) -> bool {
    has_low_quality_flank(read, good_quality) || has_low_quality_match(read, good_quality)
}

fn transform_low_quality_matches_to_reference(
    read: &AlignedRead,
    min_quality: u8,
    reference: &[u8],
) -> Option<Vec<u8>> {
    let cigar = expand_cigar(read.cigar(), read.sequence_size());
    let mut result = read.sequence().to_vec();
    let mut has_masked = false;
    let mut cigar_itr = cigar
        .iter()
        .skip_while(|&&flag| flag == CigarFlag::HardClip);
    let mut ref_offset = 0usize;
    for (base, &quality) in result.iter_mut().zip(read.base_qualities()) {
        // Deletions and skips are excess reference; drain them before
        // consuming the next read base.
        let flag = loop {
            match cigar_itr.next() {
                Some(&flag) if !flag.advances_sequence() => {
                    if flag.advances_reference() {
                        ref_offset += 1;
                    }
                }
                Some(&flag) => break flag,
                None => return if has_masked { Some(result) } else { None },
            }
        };
        if flag.is_match() {
            let ref_base = reference[ref_offset];
            ref_offset += 1;
            if quality < min_quality {
                has_masked = true;
                *base = ref_base;
            }
        }
        // Insertions and soft clips consume no reference and keep their base.
    }
    if has_masked {
        Some(result)
    } else {
        None
    }
}

fn removable_flank_sizes(read: &AlignedRead, min_quality: u8) -> (usize, usize) {
    let (front_clip, back_clip) = read.soft_clipped_sizes();
    let qualities = read.base_qualities();
    let front = qualities[..front_clip]
        .iter()
        .take_while(|&&q| q < min_quality)
        .count();
    let back = qualities[qualities.len() - back_clip..]
        .iter()
        .rev()
        .take_while(|&&q| q < min_quality)
        .count();
    (front, back)
}

/// Mask low-quality match bases with the reference and trim low-quality
/// soft-clipped flanks. `reference` holds the bases for `read.region()`.
/// Returns `None` when no match base was below threshold.
pub fn mask(read: &AlignedRead, min_quality: u8, reference: &[u8]) -> Option<Vec<u8>> {
    let mut result = transform_low_quality_matches_to_reference(read, min_quality, reference)?;
    if has_low_quality_flank(read, min_quality) {
        let (front, back) = removable_flank_sizes(read, min_quality);
        debug_assert!(front + back < read.sequence_size());
        result.truncate(result.len() - back);
        result.drain(..front);
    }
    Some(result)
}
