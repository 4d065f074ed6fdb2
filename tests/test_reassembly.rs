//! End-to-end reassembly scenarios against an in-memory reference.

use reasm::cigar::parse_cigar;
use reasm::read::AlignedRead;
use reasm::reassembler::{CancellationToken, ExecutionPolicy, LocalReassembler, Options};
use reasm::reference::BufferedReference;
use reasm::region::GenomicRegion;
use reasm::variant::Variant;

// Every 4-mer of this contig is unique, so k=4 assemblies are clean.
const CONTIG: &[u8] = b"ACGGTCAGTTGCATCCATGG";

fn reference() -> (BufferedReference, u32) {
    let mut reference = BufferedReference::new();
    let contig_id = reference.add_contig("ctg1", CONTIG);
    (reference, contig_id)
}

fn options() -> Options {
    Options {
        kmer_sizes: vec![4],
        num_fallbacks: 2,
        fallback_interval_size: 2,
        bin_size: 100,
        bin_overlap: 10,
        mask_threshold: 0,
        min_kmer_observations: 2,
        max_bubbles: 10,
        min_bubble_score: 2.0,
        max_variant_size: 100,
        execution_policy: ExecutionPolicy::Sequential,
        ..Options::default()
    }
}

fn read_at(contig_id: u32, begin: i32, sequence: &[u8], cigar: &str) -> AlignedRead {
    let cigar = parse_cigar(cigar).unwrap();
    let end = begin + reasm::cigar::reference_length(&cigar) as i32;
    AlignedRead::new(
        GenomicRegion::new(contig_id, begin, end),
        sequence.to_vec(),
        vec![30; sequence.len()],
        cigar,
    )
}

fn variant(contig_id: u32, begin: i32, ref_allele: &[u8], alt_allele: &[u8]) -> Variant {
    Variant {
        region: GenomicRegion::new(contig_id, begin, begin + ref_allele.len() as i32),
        ref_allele: ref_allele.to_vec(),
        alt_allele: alt_allele.to_vec(),
    }
}

#[test]
fn test_reference_only_reads_produce_no_variants() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, &CONTIG[..12], "12M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_snv_is_called() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    // C -> A at position 5
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert_eq!(variants, vec![variant(contig_id, 5, b"C", b"A")]);
}

#[test]
fn test_deletion_is_called() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    // C at position 5 deleted
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAGTTGC", "5M1D6M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert_eq!(variants, vec![variant(contig_id, 5, b"C", b"")]);
}

#[test]
fn test_insertion_is_called() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    // A inserted after position 5
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTCAAGTTGC", "6M1I6M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert_eq!(variants, vec![variant(contig_id, 7, b"", b"A")]);
}

#[test]
fn test_mnv_splits_into_snvs() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    // CA -> TT at positions 5..7
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTTTGTTGC", "12M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert_eq!(
        variants,
        vec![
            variant(contig_id, 5, b"C", b"T"),
            variant(contig_id, 6, b"A", b"T"),
        ]
    );
}

#[test]
fn test_deletion_straddling_bin_boundary_is_reported_once() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(Options {
        bin_size: 8,
        bin_overlap: 4,
        ..options()
    })
    .unwrap();
    // TTG at positions 8..11 deleted; the active region tiles into several
    // overlapping bins and the deletion crosses a bin boundary
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTCAGCATCCATGG", "8M3D9M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert_eq!(variants, vec![variant(contig_id, 8, b"TTG", b"")]);
}

#[test]
fn test_parallel_policy_matches_sequential() {
    let run = |policy: ExecutionPolicy| {
        let (reference, contig_id) = reference();
        let mut reassembler = LocalReassembler::new(Options {
            bin_size: 8,
            bin_overlap: 4,
            execution_policy: policy,
            ..options()
        })
        .unwrap();
        for _ in 0..20 {
            // C -> A at 5 and T -> G at 13, in separate read clusters
            reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
            reassembler.add_read("s1", read_at(contig_id, 8, b"TTGCAGCCATGG", "12M"));
        }
        reassembler
            .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
            .unwrap()
    };
    let sequential = run(ExecutionPolicy::Sequential);
    let parallel = run(ExecutionPolicy::Parallel);
    assert_eq!(sequential, parallel);
    let (_, contig_id) = reference();
    assert_eq!(
        sequential,
        vec![
            variant(contig_id, 5, b"C", b"A"),
            variant(contig_id, 13, b"T", b"G"),
        ]
    );
}

#[test]
fn test_low_quality_mismatches_are_masked_away() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(Options {
        mask_threshold: 20,
        ..options()
    })
    .unwrap();
    // The only evidence for the SNV at position 5 has base quality 2
    for _ in 0..20 {
        let mut qualities = vec![30u8; 12];
        qualities[5] = 2;
        let read = AlignedRead::new(
            GenomicRegion::new(contig_id, 0, 12),
            b"ACGGTAAGTTGC".to_vec(),
            qualities,
            parse_cigar("12M").unwrap(),
        );
        reassembler.add_read("s1", read);
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_region_without_reads_is_empty() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_empty_kmer_sizes_disable_reassembly() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(Options {
        kmer_sizes: Vec::new(),
        ..options()
    })
    .unwrap();
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_cancelled_token_short_circuits() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
    }
    let token = CancellationToken::new();
    token.cancel();
    let variants = reassembler
        .generate_cancellable(&reference, &GenomicRegion::new(contig_id, 0, 20), &token)
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_variants_outside_requested_region_are_dropped() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(options()).unwrap();
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
    }
    // The SNV at 5 falls outside the requested slice
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 10, 20))
        .unwrap();
    assert!(variants.is_empty());
}

#[test]
fn test_output_is_sorted_and_unique() {
    let (reference, contig_id) = reference();
    let mut reassembler = LocalReassembler::new(Options {
        bin_size: 8,
        bin_overlap: 4,
        ..options()
    })
    .unwrap();
    for _ in 0..20 {
        reassembler.add_read("s1", read_at(contig_id, 0, b"ACGGTAAGTTGC", "12M"));
        reassembler.add_read("s2", read_at(contig_id, 8, b"TTGCAGCCATGG", "12M"));
    }
    let variants = reassembler
        .generate(&reference, &GenomicRegion::new(contig_id, 0, 20))
        .unwrap();
    // Overlapping bins rediscover the same variants; the final pass must
    // deduplicate and sort
    let mut expected = variants.clone();
    expected.sort();
    expected.dedup();
    assert_eq!(variants, expected);
    assert!(!variants.is_empty());
}
