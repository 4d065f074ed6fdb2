//! Reference genome access.
//!
//! The assembly engine only ever needs byte ranges of uppercase bases by
//! contig interval, so the reference is abstracted behind a small trait with
//! one on-disk implementation (indexed FASTA via htslib) and one in-memory
//! implementation used by tests.

use crate::region::{ContigIndex, GenomicRegion};
use rust_htslib::faidx;
use rustc_hash::FxHashMap;
use std::io;

pub trait ReferenceSource {
    /// Bases for `region`, uppercased. `N`s are permitted.
    fn fetch(&self, region: &GenomicRegion) -> io::Result<Vec<u8>>;

    fn contig_size(&self, contig_id: u32) -> Option<usize>;

    /// Contig name <-> id registry shared with reads and emitted variants.
    fn contig_index(&self) -> &ContigIndex;

    fn contig_region(&self, contig_id: u32) -> Option<GenomicRegion> {
        self.contig_size(contig_id)
            .map(|size| GenomicRegion::new(contig_id, 0, size as i32))
    }

    fn contains(&self, region: &GenomicRegion) -> bool {
        match self.contig_size(region.contig_id) {
            Some(size) => region.begin >= 0 && region.end as usize <= size,
            None => false,
        }
    }
}

/// Indexed FASTA reference. The `.fai` index is created on open when absent.
pub struct FastaReference {
    reader: faidx::Reader,
    index: ContigIndex,
}

impl FastaReference {
    pub fn open(fasta_path: &str) -> io::Result<Self> {
        // Read the .fai to get names and lengths, creating it if needed
        let fai_path = format!("{}.fai", fasta_path);
        let fai_content = match std::fs::read_to_string(&fai_path) {
            Ok(content) => content,
            Err(_) => match faidx::Reader::from_path(fasta_path) {
                Ok(_) => std::fs::read_to_string(&fai_path)?,
                Err(e) => {
                    return Err(io::Error::other(format!(
                        "Failed to create FASTA index for '{}': {}",
                        fasta_path, e
                    )));
                }
            },
        };

        let mut index = ContigIndex::new();
        for line in fai_content.lines() {
            let mut fields = line.split('\t');
            if let (Some(name), Some(len)) = (fields.next(), fields.next()) {
                let len = len.parse::<usize>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Malformed FASTA index line in '{}': {}", fai_path, line),
                    )
                })?;
                index.intern(name, Some(len));
            }
        }

        let reader = faidx::Reader::from_path(fasta_path).map_err(|e| {
            io::Error::other(format!("Failed to open FASTA file '{}': {}", fasta_path, e))
        })?;

        Ok(FastaReference { reader, index })
    }
}

impl ReferenceSource for FastaReference {
    fn fetch(&self, region: &GenomicRegion) -> io::Result<Vec<u8>> {
        if region.is_empty() {
            return Ok(Vec::new());
        }
        let name = self.index.name_of(region.contig_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Unknown contig id {}", region.contig_id),
            )
        })?;
        // fetch_seq takes a 0-based inclusive end coordinate
        let sequence = self
            .reader
            .fetch_seq(name, region.begin as usize, region.end as usize - 1)
            .map_err(|e| {
                io::Error::other(format!(
                    "Failed to fetch sequence '{}:{}-{}': {}",
                    name, region.begin, region.end, e
                ))
            })?;
        Ok(sequence.iter().map(|b| b.to_ascii_uppercase()).collect())
    }

    fn contig_size(&self, contig_id: u32) -> Option<usize> {
        self.index.size_of(contig_id)
    }

    fn contig_index(&self) -> &ContigIndex {
        &self.index
    }
}

/// In-memory reference over a handful of contigs; the test double for
/// [`FastaReference`].
#[derive(Debug, Default)]
pub struct BufferedReference {
    contigs: FxHashMap<u32, Vec<u8>>,
    index: ContigIndex,
}

impl BufferedReference {
    pub fn new() -> Self {
        BufferedReference::default()
    }

    pub fn add_contig(&mut self, name: &str, sequence: &[u8]) -> u32 {
        let id = self.index.intern(name, Some(sequence.len()));
        self.contigs
            .insert(id, sequence.to_ascii_uppercase().to_vec());
        id
    }
}

impl ReferenceSource for BufferedReference {
    fn fetch(&self, region: &GenomicRegion) -> io::Result<Vec<u8>> {
        let contig = self.contigs.get(&region.contig_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Unknown contig id {}", region.contig_id),
            )
        })?;
        if region.begin < 0 || region.end as usize > contig.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Region {}-{} outside contig of length {}",
                    region.begin,
                    region.end,
                    contig.len()
                ),
            ));
        }
        Ok(contig[region.begin as usize..region.end as usize].to_vec())
    }

    fn contig_size(&self, contig_id: u32) -> Option<usize> {
        self.contigs.get(&contig_id).map(|c| c.len())
    }

    fn contig_index(&self) -> &ContigIndex {
        &self.index
    }
}
