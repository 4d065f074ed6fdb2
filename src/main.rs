use clap::Parser;
use log::info;
use rayon::ThreadPoolBuilder;
use reasm::cigar::{reference_length, CigarFlag, CigarOp};
use reasm::read::AlignedRead;
use reasm::reassembler::{ExecutionPolicy, LocalReassembler, Options};
use reasm::reference::{FastaReference, ReferenceSource};
use reasm::region::GenomicRegion;
use reasm::variant::{Variant, VariantSink};
use rust_htslib::bam::{self, Read as BamRead};
use std::io::{self, Write};
use std::num::NonZeroUsize;

/// Candidate variant discovery by local de Bruijn reassembly of aligned reads.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Indexed FASTA reference genome.
    #[clap(short = 'r', long, value_parser)]
    reference: String,

    /// Indexed BAM file of aligned reads.
    #[clap(short = 'a', long, value_parser)]
    alignments: String,

    /// Region to reassemble, `contig` or `contig:start-end` (0-based, half-open).
    #[clap(short = 'R', long, value_parser)]
    region: String,

    /// Sample label attached to the reads.
    #[clap(short = 's', long, value_parser, default_value = "SAMPLE")]
    sample: String,

    /// Default k-mer sizes to assemble with.
    #[clap(short = 'k', long, value_parser, value_delimiter = ',', default_values_t = [10usize, 25])]
    kmer_sizes: Vec<usize>,

    /// Number of fallback k-mer sizes tried when every default fails.
    #[clap(long, value_parser, default_value_t = 6)]
    num_fallbacks: usize,

    /// Spacing between fallback k-mer sizes.
    #[clap(long, value_parser, default_value_t = 10)]
    fallback_interval: usize,

    /// Maximum bin size in bp.
    #[clap(long, value_parser, default_value_t = 1000)]
    bin_size: i32,

    /// Overlap between adjacent bins in bp.
    #[clap(long, value_parser, default_value_t = 200)]
    bin_overlap: i32,

    /// Mask match bases below this quality with the reference; 0 disables.
    #[clap(long, value_parser, default_value_t = 3)]
    mask_threshold: u8,

    /// Minimum k-mer observations for an edge to survive pruning.
    #[clap(long, value_parser, default_value_t = 2)]
    min_kmer_observations: u32,

    /// Maximum bubbles extracted per independent subgraph.
    #[clap(long, value_parser, default_value_t = 10)]
    max_bubbles: u32,

    /// Minimum mean read support for an extracted bubble.
    #[clap(long, value_parser, default_value_t = 2.0)]
    min_bubble_score: f64,

    /// Drop candidate variants larger than this.
    #[clap(long, value_parser, default_value_t = 2000)]
    max_variant_size: usize,

    /// Number of threads for parallel bin assembly.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(1).unwrap())]
    threads: NonZeroUsize,

    /// Verbosity (-v info, -vv debug).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    ThreadPoolBuilder::new()
        .num_threads(args.threads.into())
        .build_global()
        .unwrap();

    let reference = FastaReference::open(&args.reference)?;
    let (contig_name, region) = parse_region(&args.region, &reference)?;

    let options = Options {
        kmer_sizes: args.kmer_sizes.clone(),
        num_fallbacks: args.num_fallbacks,
        fallback_interval_size: args.fallback_interval,
        bin_size: args.bin_size,
        bin_overlap: args.bin_overlap,
        mask_threshold: args.mask_threshold,
        min_kmer_observations: args.min_kmer_observations,
        max_bubbles: args.max_bubbles,
        min_bubble_score: args.min_bubble_score,
        max_variant_size: args.max_variant_size,
        execution_policy: if args.threads.get() > 1 {
            ExecutionPolicy::Parallel
        } else {
            ExecutionPolicy::Sequential
        },
        ..Options::default()
    };
    let mut reassembler = LocalReassembler::new(options)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let num_reads = load_reads(
        &args.alignments,
        &args.sample,
        &contig_name,
        &region,
        &mut reassembler,
    )?;
    info!(
        "Loaded {} reads overlapping {} from {}",
        num_reads, args.region, args.alignments
    );

    let variants = reassembler
        .generate(&reference, &region)
        .map_err(|e| io::Error::other(e.to_string()))?;
    info!("Found {} candidate variants", variants.len());

    let stdout = io::stdout();
    let mut sink = TsvSink {
        out: stdout.lock(),
        contig_name: &contig_name,
    };
    for variant in variants {
        sink.append(variant);
    }
    Ok(())
}

/// Tab-separated `contig  pos  ref  alt` writer; empty alleles print as `.`.
struct TsvSink<'a, W: Write> {
    out: W,
    contig_name: &'a str,
}

impl<W: Write> VariantSink for TsvSink<'_, W> {
    fn append(&mut self, variant: Variant) {
        let _ = writeln!(
            self.out,
            "{}\t{}\t{}\t{}",
            self.contig_name,
            variant.region.begin,
            allele_text(&variant.ref_allele),
            allele_text(&variant.alt_allele)
        );
    }
}

fn allele_text(allele: &[u8]) -> &str {
    if allele.is_empty() {
        "."
    } else {
        std::str::from_utf8(allele).unwrap_or(".")
    }
}

/// Parse `contig` or `contig:start-end` against the reference index.
fn parse_region(text: &str, reference: &FastaReference) -> io::Result<(String, GenomicRegion)> {
    let (contig_name, range) = match text.split_once(':') {
        Some((name, range)) => (name, Some(range)),
        None => (text, None),
    };
    let contig_id = reference.contig_index().id_of(contig_name).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Contig '{}' not found in the reference", contig_name),
        )
    })?;
    let contig_size = reference.contig_size(contig_id).unwrap() as i32;
    let region = match range {
        None => GenomicRegion::new(contig_id, 0, contig_size),
        Some(range) => {
            let (start, end) = range.split_once('-').ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Region format should be `contig:start-end`",
                )
            })?;
            let start = start
                .parse::<i32>()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid region start"))?;
            let end = end
                .parse::<i32>()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid region end"))?;
            if start >= end || start < 0 || end > contig_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Region {}-{} is not within '{}'", start, end, contig_name),
                ));
            }
            GenomicRegion::new(contig_id, start, end)
        }
    };
    Ok((contig_name.to_string(), region))
}

fn load_reads(
    bam_path: &str,
    sample: &str,
    contig_name: &str,
    region: &GenomicRegion,
    reassembler: &mut LocalReassembler,
) -> io::Result<usize> {
    let mut bam = bam::IndexedReader::from_path(bam_path).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to open BAM '{}': {}", bam_path, e),
        )
    })?;
    // The BAM may order contigs differently from the FASTA, so resolve the
    // target by name
    let tid = bam.header().tid(contig_name.as_bytes()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Contig '{}' not found in '{}'", contig_name, bam_path),
        )
    })?;
    bam.fetch((tid, region.begin as i64, region.end as i64))
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to fetch region from '{}': {}", bam_path, e),
            )
        })?;

    let mut num_reads = 0;
    let mut record = bam::Record::new();
    while let Some(result) = bam.read(&mut record) {
        result.map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to read BAM record: {}", e),
            )
        })?;
        if record.is_unmapped()
            || record.is_secondary()
            || record.is_supplementary()
            || record.is_duplicate()
            || record.is_quality_check_failed()
        {
            continue;
        }
        let Some(read) = convert_record(&record, region.contig_id) else {
            continue;
        };
        reassembler.add_read(sample, read);
        num_reads += 1;
    }
    Ok(num_reads)
}

fn convert_record(record: &bam::Record, contig_id: u32) -> Option<AlignedRead> {
    use rust_htslib::bam::record::Cigar;
    let cigar_view = record.cigar();
    let mut cigar: Vec<CigarOp> = Vec::with_capacity(cigar_view.len());
    for op in cigar_view.iter() {
        let converted = match *op {
            Cigar::Match(len) => CigarOp::new(CigarFlag::AlignMatch, len),
            Cigar::Equal(len) => CigarOp::new(CigarFlag::SeqMatch, len),
            Cigar::Diff(len) => CigarOp::new(CigarFlag::Substitution, len),
            Cigar::Ins(len) => CigarOp::new(CigarFlag::Insertion, len),
            Cigar::Del(len) => CigarOp::new(CigarFlag::Deletion, len),
            Cigar::SoftClip(len) => CigarOp::new(CigarFlag::SoftClip, len),
            Cigar::HardClip(len) => CigarOp::new(CigarFlag::HardClip, len),
            Cigar::Pad(len) => CigarOp::new(CigarFlag::Pad, len),
            Cigar::RefSkip(len) => CigarOp::new(CigarFlag::Skip, len),
        };
        cigar.push(converted);
    }
    let sequence = record.seq().as_bytes();
    let qualities = record.qual().to_vec();
    if sequence.is_empty()
        || sequence.len() != qualities.len()
        || sequence.len() != reasm::cigar::sequence_length(&cigar)
    {
        return None;
    }
    let begin = record.pos() as i32;
    let end = begin + reference_length(&cigar) as i32;
    Some(AlignedRead::new(
        GenomicRegion::new(contig_id, begin, end),
        sequence,
        qualities,
        cigar,
    ))
}
