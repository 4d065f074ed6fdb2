//! Variant records and post-processing of raw assembler output.
//!
//! Raw bubble variants come out of the graph unnormalized: padded with
//! reference context, sometimes describing several primitive events at once.
//! The pipeline here trims them, splits multi-nucleotide substitutions,
//! realigns complex ref/alt pairs into primitive ops, and enforces the
//! global sort/unique/size/region contract.

use crate::align::{align, Model};
use crate::cigar::{CigarFlag, CigarOp};
use crate::region::GenomicRegion;
use crate::sequence::{are_reverse_complements, is_homopolymer};
use std::cmp::Ordering;

/// A variant relative to an assemble window: `begin_pos` is the offset of the
/// first reference base, `ref`/`alt` may each be empty but not both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerVariant {
    pub begin_pos: usize,
    pub ref_allele: Vec<u8>,
    pub alt_allele: Vec<u8>,
}

impl AssemblerVariant {
    pub fn new(begin_pos: usize, ref_allele: impl Into<Vec<u8>>, alt_allele: impl Into<Vec<u8>>) -> Self {
        AssemblerVariant {
            begin_pos,
            ref_allele: ref_allele.into(),
            alt_allele: alt_allele.into(),
        }
    }
}

/// Total order `(begin_pos, ref length, alt)` used for sort/unique.
fn variant_order(lhs: &AssemblerVariant, rhs: &AssemblerVariant) -> Ordering {
    lhs.begin_pos
        .cmp(&rhs.begin_pos)
        .then(lhs.ref_allele.len().cmp(&rhs.ref_allele.len()))
        .then_with(|| lhs.alt_allele.cmp(&rhs.alt_allele))
}

/// A genomic candidate variant. The region spans the replaced reference
/// bases; insertions have an empty region at the insertion point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub region: GenomicRegion,
    pub ref_allele: Vec<u8>,
    pub alt_allele: Vec<u8>,
}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.region
            .cmp(&other.region)
            .then_with(|| self.alt_allele.cmp(&other.alt_allele))
    }
}

/// Receiver for candidate variants.
pub trait VariantSink {
    fn append(&mut self, variant: Variant);
}

impl VariantSink for Vec<Variant> {
    fn append(&mut self, variant: Variant) {
        self.push(variant);
    }
}

/// Knobs for the complex-alignment heuristic. An alignment judged complex is
/// kept as one whole variant rather than decomposed into noise.
#[derive(Debug, Clone, Copy)]
pub struct DecompositionLimits {
    /// Alleles longer than this are kept whole when the alignment carries
    /// roughly one op per allele base.
    pub max_dense_allele: usize,
    /// Alleles longer than this are kept whole when the alignment mixes
    /// several variant kinds at high op density.
    pub max_mixed_allele: usize,
}

impl Default for DecompositionLimits {
    fn default() -> Self {
        DecompositionLimits {
            max_dense_allele: 5,
            max_mixed_allele: 8,
        }
    }
}

/// Strip the common suffix, then the common prefix, advancing `begin_pos`.
pub fn trim_reference(v: &mut AssemblerVariant) {
    let suffix = v
        .ref_allele
        .iter()
        .rev()
        .zip(v.alt_allele.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    v.ref_allele.truncate(v.ref_allele.len() - suffix);
    v.alt_allele.truncate(v.alt_allele.len() - suffix);
    let prefix = v
        .ref_allele
        .iter()
        .zip(v.alt_allele.iter())
        .take_while(|(a, b)| a == b)
        .count();
    v.ref_allele.drain(..prefix);
    v.alt_allele.drain(..prefix);
    v.begin_pos += prefix;
}

fn is_complex(v: &AssemblerVariant) -> bool {
    (v.ref_allele.len() > 1 && !v.alt_allele.is_empty())
        || (v.alt_allele.len() > 1 && !v.ref_allele.is_empty())
}

fn is_inversion(v: &AssemblerVariant) -> bool {
    v.ref_allele.len() > 2
        && are_reverse_complements(&v.ref_allele, &v.alt_allele)
        && !is_homopolymer(&v.ref_allele)
        && v.ref_allele[1..v.ref_allele.len() - 1] != v.alt_allele[1..v.alt_allele.len() - 1]
}

fn is_decomposable(v: &AssemblerVariant) -> bool {
    is_complex(v) && !is_inversion(v)
}

fn is_mnv(v: &AssemblerVariant) -> bool {
    v.ref_allele.len() == v.alt_allele.len()
        && (v.ref_allele.len() <= 2
            || v.ref_allele[1..v.ref_allele.len() - 1] == v.alt_allele[1..v.alt_allele.len() - 1])
}

/// Split a trimmed MNV into one SNV per differing position. Trimming
/// guarantees the first and last positions differ.
fn split_mnv(mnv: AssemblerVariant) -> Vec<AssemblerVariant> {
    debug_assert!(mnv.ref_allele.len() > 1 && mnv.alt_allele.len() > 1);
    debug_assert!(mnv.ref_allele.first() != mnv.alt_allele.first());
    debug_assert!(mnv.ref_allele.last() != mnv.alt_allele.last());
    let mut result = Vec::with_capacity(4);
    let last = mnv.ref_allele.len() - 1;
    result.push(AssemblerVariant::new(
        mnv.begin_pos,
        vec![mnv.ref_allele[0]],
        vec![mnv.alt_allele[0]],
    ));
    for offset in 1..last {
        if mnv.ref_allele[offset] != mnv.alt_allele[offset] {
            result.push(AssemblerVariant::new(
                mnv.begin_pos + offset,
                vec![mnv.ref_allele[offset]],
                vec![mnv.alt_allele[offset]],
            ));
        }
    }
    result.push(AssemblerVariant::new(
        mnv.begin_pos + last,
        vec![mnv.ref_allele[last]],
        vec![mnv.alt_allele[last]],
    ));
    result
}

/// One variant per non-match op of an alignment of `ref` against `alt`.
fn extract_from_alignment(v: &AssemblerVariant, cigar: &[CigarOp]) -> Vec<AssemblerVariant> {
    let mut result = Vec::with_capacity(cigar.len());
    let mut ref_offset = v.begin_pos;
    let mut ref_itr = 0usize;
    let mut alt_itr = 0usize;
    for op in cigar {
        let size = op.len() as usize;
        match op.flag() {
            CigarFlag::SeqMatch => {
                ref_offset += size;
                ref_itr += size;
                alt_itr += size;
            }
            CigarFlag::Substitution => {
                for k in 0..size {
                    result.push(AssemblerVariant::new(
                        ref_offset + k,
                        vec![v.ref_allele[ref_itr + k]],
                        vec![v.alt_allele[alt_itr + k]],
                    ));
                }
                ref_offset += size;
                ref_itr += size;
                alt_itr += size;
            }
            CigarFlag::Insertion => {
                result.push(AssemblerVariant::new(
                    ref_offset,
                    Vec::new(),
                    v.alt_allele[alt_itr..alt_itr + size].to_vec(),
                ));
                alt_itr += size;
            }
            CigarFlag::Deletion => {
                result.push(AssemblerVariant::new(
                    ref_offset,
                    v.ref_allele[ref_itr..ref_itr + size].to_vec(),
                    Vec::new(),
                ));
                ref_offset += size;
                ref_itr += size;
            }
            _ => unreachable!("global alignment emits only =, X, I and D"),
        }
    }
    result
}

fn count_variant_kinds(cigar: &[CigarOp]) -> usize {
    let mut has_snv = false;
    let mut has_insertion = false;
    let mut has_deletion = false;
    for op in cigar {
        match op.flag() {
            CigarFlag::Substitution => has_snv = true,
            CigarFlag::Insertion => has_insertion = true,
            CigarFlag::Deletion => has_deletion = true,
            _ => {}
        }
    }
    has_snv as usize + has_insertion as usize + has_deletion as usize
}

fn is_complex_alignment(
    cigar: &[CigarOp],
    v: &AssemblerVariant,
    limits: &DecompositionLimits,
) -> bool {
    let min_allele_size = v.ref_allele.len().min(v.alt_allele.len());
    (min_allele_size > limits.max_dense_allele && cigar.len() >= min_allele_size)
        || (min_allele_size > limits.max_mixed_allele
            && cigar.len() > 2 * min_allele_size / 3
            && count_variant_kinds(cigar) > 1)
}

fn decompose_one(v: AssemblerVariant, limits: &DecompositionLimits) -> Vec<AssemblerVariant> {
    if is_mnv(&v) {
        split_mnv(v)
    } else {
        let cigar = align(&v.ref_allele, &v.alt_allele, Model::default());
        if is_complex_alignment(&cigar, &v, limits) {
            vec![v]
        } else {
            extract_from_alignment(&v, &cigar)
        }
    }
}

/// Full window-local normalization: trim, drop no-ops, sort, unique,
/// decompose, and merge the decomposed block back in order.
pub fn normalise(variants: &mut Vec<AssemblerVariant>, limits: &DecompositionLimits) {
    for v in variants.iter_mut() {
        trim_reference(v);
    }
    variants.retain(|v| !(v.ref_allele.is_empty() && v.alt_allele.is_empty()));
    variants.sort_by(variant_order);
    variants.dedup();

    // Stable split: plain variants stay put, decomposables are re-expressed
    // as primitives and merged back in
    let (keep, decomposable): (Vec<_>, Vec<_>) =
        std::mem::take(variants).into_iter().partition(|v| !is_decomposable(v));
    if decomposable.is_empty() {
        *variants = keep;
        return;
    }
    let mut decomposed: Vec<AssemblerVariant> = decomposable
        .into_iter()
        .flat_map(|v| decompose_one(v, limits))
        .collect();
    decomposed.sort_by(variant_order);
    decomposed.dedup();

    *variants = merge_sorted(keep, decomposed);
}

fn merge_sorted(lhs: Vec<AssemblerVariant>, rhs: Vec<AssemblerVariant>) -> Vec<AssemblerVariant> {
    let mut result = Vec::with_capacity(lhs.len() + rhs.len());
    let mut lhs = lhs.into_iter().peekable();
    let mut rhs = rhs.into_iter().peekable();
    loop {
        match (lhs.peek(), rhs.peek()) {
            (Some(a), Some(b)) => {
                if variant_order(a, b) != Ordering::Greater {
                    result.push(lhs.next().unwrap());
                } else {
                    result.push(rhs.next().unwrap());
                }
            }
            (Some(_), None) => result.push(lhs.next().unwrap()),
            (None, Some(_)) => result.push(rhs.next().unwrap()),
            (None, None) => break,
        }
    }
    result
}

/// Drop deletions at least `max_size` long; small-k partial assemblies are
/// prone to fabricating them.
pub fn remove_large_deletions(variants: &mut Vec<AssemblerVariant>, max_size: usize) {
    variants.retain(|v| !(v.ref_allele.len() >= max_size && v.alt_allele.is_empty()));
}

/// Map window-relative variants onto the genome through the assemble
/// region's begin.
pub fn map_to_genomic(
    variants: Vec<AssemblerVariant>,
    assemble_region: &GenomicRegion,
) -> impl Iterator<Item = Variant> + '_ {
    variants.into_iter().map(move |v| {
        let begin = assemble_region.begin + v.begin_pos as i32;
        Variant {
            region: GenomicRegion::new(
                assemble_region.contig_id,
                begin,
                begin + v.ref_allele.len() as i32,
            ),
            ref_allele: v.ref_allele,
            alt_allele: v.alt_allele,
        }
    })
}

/// Cross-bin final pass: sort, unique, drop oversized, drop variants not
/// overlapping the requested region (bin expansion may have widened it).
pub fn extract_final(
    mut variants: Vec<Variant>,
    extract_region: &GenomicRegion,
    max_variant_size: usize,
) -> Vec<Variant> {
    variants.sort();
    variants.dedup();
    variants.retain(|v| v.region.size() as usize <= max_variant_size);
    variants.retain(|v| overlaps_window(v, extract_region));
    variants
}

fn overlaps_window(v: &Variant, window: &GenomicRegion) -> bool {
    if v.region.contig_id != window.contig_id {
        return false;
    }
    if v.region.is_empty() {
        // Insertion point inside the window
        window.begin <= v.region.begin && v.region.begin < window.end
    } else {
        v.region.overlaps(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_reference() {
        let mut v = AssemblerVariant::new(3, *b"TACGT", *b"TAGGT");
        trim_reference(&mut v);
        assert_eq!(v, AssemblerVariant::new(5, *b"C", *b"G"));

        let mut v = AssemblerVariant::new(3, *b"TA", *b"T");
        trim_reference(&mut v);
        assert_eq!(v, AssemblerVariant::new(4, *b"A", *b""));

        let mut v = AssemblerVariant::new(0, *b"ACGT", *b"ACGT");
        trim_reference(&mut v);
        assert!(v.ref_allele.is_empty() && v.alt_allele.is_empty());
    }

    #[test]
    fn test_mnv_splits_into_snvs() {
        let mut variants = vec![AssemblerVariant::new(4, *b"AC", *b"TT")];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(
            variants,
            vec![
                AssemblerVariant::new(4, *b"A", *b"T"),
                AssemblerVariant::new(5, *b"C", *b"T"),
            ]
        );
    }

    #[test]
    fn test_mnv_snv_count_matches_differing_positions() {
        // 4-long substitution with 3 differing positions decomposes to 3 SNVs
        let mut variants = vec![AssemblerVariant::new(0, *b"ACGT", *b"TCGA")];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(variants.len(), 2);
        let mut variants = vec![AssemblerVariant::new(0, *b"ACGT", *b"TGGA")];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(variants.len(), 3);
    }

    #[test]
    fn test_complex_decomposes_through_alignment() {
        // Deletion still padded with matching context on both sides
        let mut variants = vec![AssemblerVariant::new(0, *b"TACGA", *b"TCGA")];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(variants, vec![AssemblerVariant::new(1, *b"A", *b"")]);
    }

    #[test]
    fn test_inversion_is_kept_whole() {
        // ACG / CGT after trimming: exact reverse complements with a
        // mismatching core, so decomposition must leave them alone
        let mut variants = vec![AssemblerVariant::new(0, *b"AACGT", *b"ACGTT")];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].begin_pos, 1);
        assert_eq!(variants[0].ref_allele, b"ACG".to_vec());
        assert_eq!(variants[0].alt_allele, b"CGT".to_vec());
    }

    #[test]
    fn test_sort_unique() {
        let mut variants = vec![
            AssemblerVariant::new(7, *b"A", *b"G"),
            AssemblerVariant::new(2, *b"C", *b"T"),
            AssemblerVariant::new(2, *b"C", *b"T"),
        ];
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(
            variants,
            vec![
                AssemblerVariant::new(2, *b"C", *b"T"),
                AssemblerVariant::new(7, *b"A", *b"G"),
            ]
        );
    }

    #[test]
    fn test_remove_large_deletions() {
        let mut variants = vec![
            AssemblerVariant::new(0, vec![b'A'; 120], Vec::new()),
            AssemblerVariant::new(0, vec![b'A'; 120], vec![b'C']),
            AssemblerVariant::new(5, *b"AT", *b""),
        ];
        remove_large_deletions(&mut variants, 100);
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn test_extract_final_filters_region_and_size() {
        let window = GenomicRegion::new(0, 100, 200);
        let variants = vec![
            AssemblerVariant::new(10, *b"A", *b"C"),
            AssemblerVariant::new(100, *b"G", *b"T"),
            AssemblerVariant::new(110, vec![b'A'; 120], *b"C"),
        ];
        let mapped: Vec<_> = map_to_genomic(variants, &GenomicRegion::new(0, 50, 300)).collect();
        let kept = extract_final(mapped, &window, 100);
        // The variant at genomic position 60 is outside the request and the
        // 120 bp deletion is oversized
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].region, GenomicRegion::new(0, 150, 151));
    }

    #[test]
    fn test_complex_alignment_heuristic() {
        use crate::cigar::parse_cigar;
        let v = AssemblerVariant::new(0, vec![b'A'; 10], vec![b'C'; 9]);
        // About one op per allele base: too messy to decompose
        let dense = parse_cigar("1X1I1X1D1X1I1X1D1X1I").unwrap();
        assert!(is_complex_alignment(&dense, &v, &DecompositionLimits::default()));
        let simple = parse_cigar("4=1D5=").unwrap();
        assert!(!is_complex_alignment(
            &simple,
            &v,
            &DecompositionLimits::default()
        ));
    }
}
