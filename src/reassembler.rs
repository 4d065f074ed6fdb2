//! The local reassembly driver.
//!
//! A region is reassembled in fixed-size overlapping bins: reads are masked
//! and folded into every bin they overlap, each bin is assembled at every
//! default k-mer size (falling back to larger sizes when the defaults fail),
//! and the per-bin variant lists are concatenated in bin order and
//! post-processed into one sorted, unique candidate list.

use crate::assembler::Assembler;
use crate::error::ReasmError;
use crate::read::{mask, requires_masking, AlignedRead};
use crate::reference::ReferenceSource;
use crate::region::GenomicRegion;
use crate::sequence::is_canonical_dna;
use crate::variant::{
    extract_final, map_to_genomic, normalise, remove_large_deletions, DecompositionLimits, Variant,
};
use coitrees::{BasicCOITree, Interval, IntervalTree};
use log::{debug, warn};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    Sequential,
    Parallel,
}

/// Number of bin tasks in flight at once under the parallel policy.
const BIN_BATCH_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct Options {
    /// K-mer sizes attempted for every bin, deduped and sorted ascending.
    /// Empty disables reassembly entirely.
    pub kmer_sizes: Vec<usize>,
    /// Number of fallback sizes derived past the last default.
    pub num_fallbacks: usize,
    pub fallback_interval_size: usize,
    pub bin_size: i32,
    /// Clamped to `bin_size - 1`.
    pub bin_overlap: i32,
    /// Base quality below which match bases are masked with the reference;
    /// zero disables masking.
    pub mask_threshold: u8,
    /// Minimum observations for a read edge to survive pruning.
    pub min_kmer_observations: u32,
    pub max_bubbles: u32,
    /// Minimum mean read support for an extracted bubble.
    pub min_bubble_score: f64,
    pub max_variant_size: usize,
    pub execution_policy: ExecutionPolicy,
    pub decomposition: DecompositionLimits,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            kmer_sizes: vec![10, 25],
            num_fallbacks: 6,
            fallback_interval_size: 10,
            bin_size: 1000,
            bin_overlap: 200,
            mask_threshold: 3,
            min_kmer_observations: 2,
            max_bubbles: 10,
            min_bubble_score: 2.0,
            max_variant_size: 2000,
            execution_policy: ExecutionPolicy::Sequential,
            decomposition: DecompositionLimits::default(),
        }
    }
}

/// Shared cancel flag, checked between bins and between k-mer attempts.
/// In-flight assemblies run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblerStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Where a bin sequence lives: the read buffer, or the masked arena.
#[derive(Debug, Clone, Copy)]
enum SequenceHandle {
    Read { sample: u32, read: u32 },
    Masked(u32),
}

#[derive(Debug)]
struct Bin {
    region: GenomicRegion,
    /// Hull of the folded reads; the bin shrinks to it before assembly.
    read_region: Option<GenomicRegion>,
    sequences: Vec<SequenceHandle>,
}

impl Bin {
    fn new(region: GenomicRegion) -> Self {
        Bin {
            region,
            read_region: None,
            sequences: Vec::new(),
        }
    }

    fn add(&mut self, read_region: &GenomicRegion, handle: SequenceHandle) {
        self.read_region = Some(match self.read_region {
            Some(hull) => hull.encompassing(read_region),
            None => *read_region,
        });
        self.sequences.push(handle);
    }

    fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Prefetched reference bytes covering every assemble window a bin can ask
/// for, so bin tasks never touch the reference source.
struct BinWindow {
    region: GenomicRegion,
    bytes: Vec<u8>,
    contig_size: i32,
}

/// Proposes the read-covered sub-intervals of a query region worth
/// reassembling. Coverage is tracked as sorted merged ranges per contig.
#[derive(Debug, Default)]
pub struct ActiveRegionGenerator {
    merge_distance: i32,
    ranges: FxHashMap<u32, Vec<(i32, i32)>>,
}

impl ActiveRegionGenerator {
    pub fn new(merge_distance: i32) -> Self {
        ActiveRegionGenerator {
            merge_distance,
            ranges: FxHashMap::default(),
        }
    }

    pub fn add(&mut self, region: &GenomicRegion) {
        if region.is_empty() {
            return;
        }
        let ranges = self.ranges.entry(region.contig_id).or_default();
        let (mut start, mut end) = (region.begin, region.end);
        let mut i = ranges
            .binary_search_by_key(&start, |&(s, _)| s)
            .unwrap_or_else(|position| position);
        if i > 0 && ranges[i - 1].1 + self.merge_distance >= start {
            i -= 1;
        }
        let mut j = i;
        while j < ranges.len() && ranges[j].0 <= end + self.merge_distance {
            start = start.min(ranges[j].0);
            end = end.max(ranges[j].1);
            j += 1;
        }
        ranges.splice(i..j, [(start, end)]);
    }

    pub fn generate(&self, region: &GenomicRegion) -> Vec<GenomicRegion> {
        match self.ranges.get(&region.contig_id) {
            Some(ranges) => ranges
                .iter()
                .filter(|&&(start, end)| start < region.end && region.begin < end)
                .map(|&(start, end)| {
                    GenomicRegion::new(
                        region.contig_id,
                        start.max(region.begin),
                        end.min(region.end),
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

struct SampleReads {
    sample: String,
    reads: Vec<AlignedRead>,
}

pub struct LocalReassembler {
    execution_policy: ExecutionPolicy,
    default_kmer_sizes: Vec<usize>,
    fallback_kmer_sizes: Vec<usize>,
    read_buffer: Vec<SampleReads>,
    max_bin_size: i32,
    max_bin_overlap: i32,
    bins: Vec<Bin>,
    masked_sequences: Vec<Box<[u8]>>,
    mask_threshold: u8,
    min_kmer_observations: u32,
    max_bubbles: u32,
    min_bubble_score: f64,
    max_variant_size: usize,
    decomposition: DecompositionLimits,
    active_region_generator: ActiveRegionGenerator,
}

impl LocalReassembler {
    pub fn new(options: Options) -> Result<Self, ReasmError> {
        if options.bin_size <= 0 {
            return Err(ReasmError::Config(
                "bin size must be greater than zero".to_string(),
            ));
        }
        if options.fallback_interval_size == 0 {
            return Err(ReasmError::Config(
                "fallback interval size must be greater than zero".to_string(),
            ));
        }
        if options.min_bubble_score < 0.0 {
            return Err(ReasmError::Config(
                "min bubble score must not be negative".to_string(),
            ));
        }
        if options.kmer_sizes.iter().any(|&k| k < 2) {
            return Err(ReasmError::Config(
                "kmer sizes must be at least 2".to_string(),
            ));
        }
        let mut default_kmer_sizes = options.kmer_sizes;
        default_kmer_sizes.sort_unstable();
        default_kmer_sizes.dedup();
        let fallback_kmer_sizes = match default_kmer_sizes.last() {
            Some(&last) => (1..=options.num_fallbacks)
                .map(|i| last + i * options.fallback_interval_size)
                .collect(),
            None => Vec::new(),
        };
        Ok(LocalReassembler {
            execution_policy: options.execution_policy,
            default_kmer_sizes,
            fallback_kmer_sizes,
            read_buffer: Vec::new(),
            max_bin_size: options.bin_size,
            max_bin_overlap: options.bin_overlap.clamp(0, options.bin_size - 1),
            bins: Vec::new(),
            masked_sequences: Vec::new(),
            mask_threshold: options.mask_threshold,
            min_kmer_observations: options.min_kmer_observations,
            max_bubbles: options.max_bubbles,
            min_bubble_score: options.min_bubble_score,
            max_variant_size: options.max_variant_size,
            decomposition: options.decomposition,
            active_region_generator: ActiveRegionGenerator::new(0),
        })
    }

    pub fn add_read(&mut self, sample: &str, read: AlignedRead) {
        self.active_region_generator.add(read.region());
        match self
            .read_buffer
            .iter_mut()
            .find(|entry| entry.sample == sample)
        {
            Some(entry) => entry.reads.push(read),
            None => self.read_buffer.push(SampleReads {
                sample: sample.to_string(),
                reads: vec![read],
            }),
        }
    }

    pub fn add_reads(&mut self, sample: &str, reads: impl IntoIterator<Item = AlignedRead>) {
        for read in reads {
            self.add_read(sample, read);
        }
    }

    /// Reset all per-region and buffered state.
    pub fn clear(&mut self) {
        self.clear_region_state();
        self.active_region_generator.clear();
    }

    pub fn generate<R: ReferenceSource>(
        &mut self,
        reference: &R,
        region: &GenomicRegion,
    ) -> Result<Vec<Variant>, ReasmError> {
        self.generate_cancellable(reference, region, &CancellationToken::new())
    }

    pub fn generate_cancellable<R: ReferenceSource>(
        &mut self,
        reference: &R,
        region: &GenomicRegion,
        token: &CancellationToken,
    ) -> Result<Vec<Variant>, ReasmError> {
        if self.default_kmer_sizes.is_empty() {
            return Ok(Vec::new());
        }
        let active_regions = self.active_region_generator.generate(region);
        debug!(
            "Assembler active regions in {}..{}: {:?}",
            region.begin, region.end, active_regions
        );
        if active_regions.is_empty() {
            warn!(
                "Nothing to reassemble in {}..{} on contig {}",
                region.begin, region.end, region.contig_id
            );
            self.clear_region_state();
            return Ok(Vec::new());
        }
        let mut region_bins = Vec::with_capacity(active_regions.len());
        for active_region in &active_regions {
            let first_bin = self.bins.len();
            self.prepare_bins(active_region);
            region_bins.push(first_bin..self.bins.len());
        }
        self.fold_reads(reference, &active_regions, &region_bins)?;
        self.finalise_bins();
        if self.bins.is_empty() {
            self.clear_region_state();
            return Ok(Vec::new());
        }

        // Prefetch one reference window per bin, wide enough for the
        // largest k, so bin tasks stay free of reference I/O
        let max_kmer_size = self
            .fallback_kmer_sizes
            .last()
            .or(self.default_kmer_sizes.last())
            .copied()
            .expect("kmer sizes are non-empty");
        let mut tasks: Vec<(usize, BinWindow)> = Vec::new();
        for (bin_idx, bin) in self.bins.iter().enumerate() {
            if bin.is_empty() || !bin.region.overlaps(region) {
                continue;
            }
            let contig_size = reference.contig_size(bin.region.contig_id).ok_or_else(|| {
                ReasmError::Reference(format!("unknown contig id {}", bin.region.contig_id))
            })? as i32;
            let window_region = propose_assembler_region(&bin.region, max_kmer_size, contig_size);
            let bytes = reference.fetch(&window_region)?;
            tasks.push((
                bin_idx,
                BinWindow {
                    region: window_region,
                    bytes,
                    contig_size,
                },
            ));
        }

        let mut candidates = Vec::new();
        if self.execution_policy == ExecutionPolicy::Parallel && tasks.len() >= 2 {
            for batch in tasks.chunks(BIN_BATCH_SIZE) {
                if token.is_cancelled() {
                    break;
                }
                let batch_results: Vec<Result<Vec<Variant>, ReasmError>> = batch
                    .par_iter()
                    .map(|(bin_idx, window)| self.assemble_bin(&self.bins[*bin_idx], window, token))
                    .collect();
                for result in batch_results {
                    candidates.extend(result?);
                }
            }
        } else {
            for (bin_idx, window) in &tasks {
                if token.is_cancelled() {
                    break;
                }
                candidates.extend(self.assemble_bin(&self.bins[*bin_idx], window, token)?);
            }
        }
        self.clear_region_state();
        Ok(extract_final(candidates, region, self.max_variant_size))
    }

    fn clear_region_state(&mut self) {
        self.bins.clear();
        self.masked_sequences.clear();
        self.read_buffer.clear();
    }

    /// Tile an active region with bins of `max_bin_size`, shifted by
    /// `max_bin_size - max_bin_overlap`, plus a trailing remainder bin.
    fn prepare_bins(&mut self, region: &GenomicRegion) {
        debug_assert!(self
            .bins
            .last()
            .map_or(true, |bin| bin.region.begin <= region.begin));
        if region.size() > self.max_bin_size {
            let stride = self.max_bin_size - self.max_bin_overlap;
            let mut bin_region = GenomicRegion::new(
                region.contig_id,
                region.begin,
                region.begin + self.max_bin_size,
            );
            while bin_region.end < region.end {
                self.bins.push(Bin::new(bin_region));
                bin_region = GenomicRegion::new(
                    region.contig_id,
                    bin_region.begin + stride,
                    bin_region.end + stride,
                );
            }
            if bin_region.begin < region.end {
                self.bins.push(Bin::new(GenomicRegion::new(
                    region.contig_id,
                    bin_region.begin,
                    region.end,
                )));
            }
        } else {
            self.bins.push(Bin::new(*region));
        }
    }

    /// Fold every read overlapping an active region into that region's
    /// overlapping bins, masking low-quality reads into the arena first.
    fn fold_reads<R: ReferenceSource>(
        &mut self,
        reference: &R,
        active_regions: &[GenomicRegion],
        region_bins: &[std::ops::Range<usize>],
    ) -> Result<(), ReasmError> {
        let mask_threshold = self.mask_threshold;
        let read_buffer = &self.read_buffer;
        let bins = &mut self.bins;
        let arena = &mut self.masked_sequences;
        for (sample_idx, sample) in read_buffer.iter().enumerate() {
            let intervals: Vec<Interval<u32>> = sample
                .reads
                .iter()
                .enumerate()
                .filter(|(_, read)| {
                    read.region().contig_id == active_regions[0].contig_id
                        && !read.region().is_empty()
                })
                .map(|(read_idx, read)| Interval {
                    first: read.region().begin,
                    last: read.region().end - 1,
                    metadata: read_idx as u32,
                })
                .collect();
            if intervals.is_empty() {
                continue;
            }
            let tree: BasicCOITree<u32, u32> = BasicCOITree::new(intervals.as_slice());
            for (active_region, bin_range) in active_regions.iter().zip(region_bins) {
                let mut hits: Vec<u32> = Vec::new();
                tree.query(active_region.begin, active_region.end - 1, |interval| {
                    hits.push(interval.metadata);
                });
                hits.sort_unstable();
                for read_idx in hits {
                    let read = &sample.reads[read_idx as usize];
                    let handle = if mask_threshold > 0 && requires_masking(read, mask_threshold) {
                        let read_reference = reference.fetch(read.region())?;
                        match mask(read, mask_threshold, &read_reference) {
                            Some(masked) => {
                                arena.push(masked.into_boxed_slice());
                                Some(SequenceHandle::Masked(arena.len() as u32 - 1))
                            }
                            // Nothing was salvageable from this read
                            None => None,
                        }
                    } else {
                        Some(SequenceHandle::Read {
                            sample: sample_idx as u32,
                            read: read_idx,
                        })
                    };
                    if let Some(handle) = handle {
                        for bin in &mut bins[bin_range.clone()] {
                            if bin.region.overlaps(read.region()) {
                                bin.add(read.region(), handle);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop read-less bins, shrink the rest to their read hulls, and keep
    /// only the largest of any bins sharing a starting position.
    fn finalise_bins(&mut self) {
        self.bins.retain(|bin| !bin.is_empty());
        for bin in &mut self.bins {
            if let Some(hull) = bin.read_region {
                bin.region = hull;
            }
        }
        self.bins
            .sort_by_key(|bin| (bin.region.begin, bin.region.end));
        let mut finalised: Vec<Bin> = Vec::with_capacity(self.bins.len());
        for bin in self.bins.drain(..) {
            match finalised.last_mut() {
                Some(last) if last.region.begin == bin.region.begin => *last = bin,
                _ => finalised.push(bin),
            }
        }
        self.bins = finalised;
    }

    fn resolve_sequence(&self, handle: SequenceHandle) -> &[u8] {
        match handle {
            SequenceHandle::Read { sample, read } => {
                self.read_buffer[sample as usize].reads[read as usize].sequence()
            }
            SequenceHandle::Masked(index) => &self.masked_sequences[index as usize],
        }
    }

    fn assemble_bin(
        &self,
        bin: &Bin,
        window: &BinWindow,
        token: &CancellationToken,
    ) -> Result<Vec<Variant>, ReasmError> {
        let mut result = Vec::new();
        debug!(
            "Assembling {} reads in bin {}..{}",
            bin.sequences.len(),
            bin.region.begin,
            bin.region.end
        );
        let mut num_failures = 0;
        for &kmer_size in &self.default_kmer_sizes {
            if token.is_cancelled() {
                return Ok(result);
            }
            match self.assemble_bin_with_kmer_size(kmer_size, bin, window, &mut result)? {
                AssemblerStatus::Success => {
                    debug!("Default assembler with kmer size {} completed", kmer_size);
                }
                AssemblerStatus::PartialSuccess => {
                    debug!(
                        "Default assembler with kmer size {} partially completed",
                        kmer_size
                    );
                    num_failures += 1;
                }
                AssemblerStatus::Failed => {
                    debug!("Default assembler with kmer size {} failed", kmer_size);
                    num_failures += 1;
                }
            }
        }
        if num_failures == self.default_kmer_sizes.len() {
            for &kmer_size in &self.fallback_kmer_sizes {
                if token.is_cancelled() {
                    return Ok(result);
                }
                match self.assemble_bin_with_kmer_size(kmer_size, bin, window, &mut result)? {
                    AssemblerStatus::Success => {
                        debug!("Fallback assembler with kmer size {} completed", kmer_size);
                        break;
                    }
                    AssemblerStatus::PartialSuccess => {
                        debug!(
                            "Fallback assembler with kmer size {} partially completed",
                            kmer_size
                        );
                    }
                    AssemblerStatus::Failed => {
                        debug!("Fallback assembler with kmer size {} failed", kmer_size);
                    }
                }
            }
        }
        Ok(result)
    }

    fn assemble_bin_with_kmer_size(
        &self,
        kmer_size: usize,
        bin: &Bin,
        window: &BinWindow,
        result: &mut Vec<Variant>,
    ) -> Result<AssemblerStatus, ReasmError> {
        let assemble_region =
            propose_assembler_region(&bin.region, kmer_size, window.contig_size);
        if (assemble_region.size() as usize) < kmer_size {
            return Ok(AssemblerStatus::Failed);
        }
        debug_assert!(window.region.contains(&assemble_region));
        let offset = (assemble_region.begin - window.region.begin) as usize;
        let reference_sequence = &window.bytes[offset..offset + assemble_region.size() as usize];
        if !is_canonical_dna(reference_sequence) {
            return Ok(AssemblerStatus::Failed);
        }
        let mut assembler = Assembler::new(kmer_size);
        assembler.insert_reference(reference_sequence);
        if !assembler.is_unique_reference() {
            return Ok(AssemblerStatus::Failed);
        }
        for &handle in &bin.sequences {
            assembler.insert_read(self.resolve_sequence(handle));
        }
        self.try_assemble_region(&mut assembler, &assemble_region, result)
    }

    fn try_assemble_region(
        &self,
        assembler: &mut Assembler<'_>,
        assemble_region: &GenomicRegion,
        result: &mut Vec<Variant>,
    ) -> Result<AssemblerStatus, ReasmError> {
        debug_assert!(assembler.is_unique_reference());
        assembler.try_recover_dangling_branches();
        assembler.prune(self.min_kmer_observations);
        let mut status = AssemblerStatus::Success;
        if !assembler.is_acyclic() {
            assembler.remove_nonreference_cycles();
            status = AssemblerStatus::PartialSuccess;
        }
        assembler.cleanup();
        if assembler.is_empty() || assembler.is_all_reference() {
            return Ok(status);
        }
        let mut variants = assembler.extract_variants(self.max_bubbles, self.min_bubble_score)?;
        if !variants.is_empty() {
            normalise(&mut variants, &self.decomposition);
            if status == AssemblerStatus::PartialSuccess {
                // Small-k assemblies that needed cycle removal fabricate
                // large deletions; filter by the producing kmer size
                let kmer_size = assembler.kmer_size();
                if kmer_size <= 10 {
                    remove_large_deletions(&mut variants, 100);
                } else if kmer_size <= 15 {
                    remove_large_deletions(&mut variants, 150);
                } else if kmer_size <= 20 {
                    remove_large_deletions(&mut variants, 200);
                } else if kmer_size <= 30 {
                    remove_large_deletions(&mut variants, 250);
                }
            }
            result.extend(map_to_genomic(variants, assemble_region));
        }
        Ok(status)
    }
}

/// The assemble window: the bin expanded by `kmer_size` on each side,
/// clipped to the contig.
fn propose_assembler_region(
    bin_region: &GenomicRegion,
    kmer_size: usize,
    contig_size: i32,
) -> GenomicRegion {
    let kmer_size = kmer_size as i32;
    if bin_region.begin < kmer_size {
        let end = if contig_size >= kmer_size {
            (bin_region.end + kmer_size).min(contig_size)
        } else {
            contig_size
        };
        GenomicRegion::new(bin_region.contig_id, 0, end)
    } else {
        GenomicRegion::new(
            bin_region.contig_id,
            bin_region.begin - kmer_size,
            (bin_region.end + kmer_size).min(contig_size),
        )
    }
}
