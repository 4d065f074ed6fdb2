//! CIGAR operations for aligned reads.
//!
//! Ops are packed into a single `u32`: flag in the top four bits, length in
//! the low 28. A read's CIGAR is a plain `Vec<CigarOp>`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CigarFlag {
    /// `M`: match or mismatch against the reference.
    AlignMatch = 0,
    /// `=`: exact sequence match.
    SeqMatch = 1,
    /// `X`: substitution.
    Substitution = 2,
    /// `I`: bases present in the read but not the reference.
    Insertion = 3,
    /// `D`: reference bases absent from the read.
    Deletion = 4,
    /// `S`: clipped bases kept in the read sequence.
    SoftClip = 5,
    /// `H`: clipped bases absent from the read sequence.
    HardClip = 6,
    /// `P`: silent padding.
    Pad = 7,
    /// `N`: skipped reference bases (spliced alignments).
    Skip = 8,
}

impl CigarFlag {
    /// Whether this op consumes read sequence.
    pub fn advances_sequence(self) -> bool {
        matches!(
            self,
            CigarFlag::AlignMatch
                | CigarFlag::SeqMatch
                | CigarFlag::Substitution
                | CigarFlag::Insertion
                | CigarFlag::SoftClip
        )
    }

    /// Whether this op consumes reference sequence.
    pub fn advances_reference(self) -> bool {
        matches!(
            self,
            CigarFlag::AlignMatch
                | CigarFlag::SeqMatch
                | CigarFlag::Substitution
                | CigarFlag::Deletion
                | CigarFlag::Skip
        )
    }

    pub fn is_match(self) -> bool {
        matches!(
            self,
            CigarFlag::AlignMatch | CigarFlag::SeqMatch | CigarFlag::Substitution
        )
    }

    pub fn to_char(self) -> char {
        match self {
            CigarFlag::AlignMatch => 'M',
            CigarFlag::SeqMatch => '=',
            CigarFlag::Substitution => 'X',
            CigarFlag::Insertion => 'I',
            CigarFlag::Deletion => 'D',
            CigarFlag::SoftClip => 'S',
            CigarFlag::HardClip => 'H',
            CigarFlag::Pad => 'P',
            CigarFlag::Skip => 'N',
        }
    }

    pub fn from_char(op: char) -> Option<CigarFlag> {
        match op {
            'M' => Some(CigarFlag::AlignMatch),
            '=' => Some(CigarFlag::SeqMatch),
            'X' => Some(CigarFlag::Substitution),
            'I' => Some(CigarFlag::Insertion),
            'D' => Some(CigarFlag::Deletion),
            'S' => Some(CigarFlag::SoftClip),
            'H' => Some(CigarFlag::HardClip),
            'P' => Some(CigarFlag::Pad),
            'N' => Some(CigarFlag::Skip),
            _ => None,
        }
    }
}

const LEN_BITS: u32 = 28;
const LEN_MASK: u32 = (1 << LEN_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CigarOp {
    val: u32,
}

impl CigarOp {
    pub fn new(flag: CigarFlag, len: u32) -> Self {
        assert!(len <= LEN_MASK, "CIGAR op length {} too large", len);
        Self {
            val: ((flag as u32) << LEN_BITS) | len,
        }
    }

    pub fn flag(&self) -> CigarFlag {
        match self.val >> LEN_BITS {
            0 => CigarFlag::AlignMatch,
            1 => CigarFlag::SeqMatch,
            2 => CigarFlag::Substitution,
            3 => CigarFlag::Insertion,
            4 => CigarFlag::Deletion,
            5 => CigarFlag::SoftClip,
            6 => CigarFlag::HardClip,
            7 => CigarFlag::Pad,
            _ => CigarFlag::Skip,
        }
    }

    pub fn len(&self) -> u32 {
        self.val & LEN_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn advances_sequence(&self) -> bool {
        self.flag().advances_sequence()
    }

    pub fn advances_reference(&self) -> bool {
        self.flag().advances_reference()
    }

    pub fn is_match(&self) -> bool {
        self.flag().is_match()
    }
}

impl std::fmt::Display for CigarOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.len(), self.flag().to_char())
    }
}

/// Number of read bases the CIGAR consumes.
pub fn sequence_length(cigar: &[CigarOp]) -> usize {
    cigar
        .iter()
        .filter(|op| op.advances_sequence())
        .map(|op| op.len() as usize)
        .sum()
}

/// Number of reference bases the CIGAR consumes.
pub fn reference_length(cigar: &[CigarOp]) -> usize {
    cigar
        .iter()
        .filter(|op| op.advances_reference())
        .map(|op| op.len() as usize)
        .sum()
}

/// Flatten a CIGAR into one flag per base of its footprint.
pub fn expand_cigar(cigar: &[CigarOp], size_hint: usize) -> Vec<CigarFlag> {
    let mut result = Vec::with_capacity(size_hint);
    for op in cigar {
        result.extend(std::iter::repeat(op.flag()).take(op.len() as usize));
    }
    result
}

/// Parse a CIGAR string such as `3=1X4S`. Returns `None` on any malformed
/// length or unknown op character.
pub fn parse_cigar(text: &str) -> Option<Vec<CigarOp>> {
    let mut ops = Vec::new();
    let mut len: u32 = 0;
    let mut saw_digit = false;
    for c in text.chars() {
        if let Some(digit) = c.to_digit(10) {
            len = len.checked_mul(10)?.checked_add(digit)?;
            saw_digit = true;
        } else {
            let flag = CigarFlag::from_char(c)?;
            if !saw_digit {
                return None;
            }
            ops.push(CigarOp::new(flag, len));
            len = 0;
            saw_digit = false;
        }
    }
    if saw_digit {
        return None;
    }
    Some(ops)
}

/// Append an op, coalescing with the tail when the flags agree.
pub fn push_op(cigar: &mut Vec<CigarOp>, flag: CigarFlag, len: u32) {
    if len == 0 {
        return;
    }
    if let Some(last) = cigar.last_mut() {
        if last.flag() == flag {
            *last = CigarOp::new(flag, last.len() + len);
            return;
        }
    }
    cigar.push(CigarOp::new(flag, len));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        for flag in [
            CigarFlag::AlignMatch,
            CigarFlag::SeqMatch,
            CigarFlag::Substitution,
            CigarFlag::Insertion,
            CigarFlag::Deletion,
            CigarFlag::SoftClip,
            CigarFlag::HardClip,
            CigarFlag::Pad,
            CigarFlag::Skip,
        ] {
            let op = CigarOp::new(flag, 1234);
            assert_eq!(op.flag(), flag);
            assert_eq!(op.len(), 1234);
        }
    }

    #[test]
    fn test_parse_and_format() {
        let ops = parse_cigar("3=1X2I4D5S").unwrap();
        let text: String = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(text, "3=1X2I4D5S");
        assert!(parse_cigar("3Q").is_none());
        assert!(parse_cigar("=3").is_none());
        assert!(parse_cigar("12").is_none());
    }

    #[test]
    fn test_lengths() {
        let ops = parse_cigar("2S3=1X1I2D1N").unwrap();
        // S + = + X + I consume sequence
        assert_eq!(sequence_length(&ops), 7);
        // = + X + D + N consume reference
        assert_eq!(reference_length(&ops), 8);
    }

    #[test]
    fn test_expand() {
        let ops = parse_cigar("2=1D1I").unwrap();
        let expanded = expand_cigar(&ops, 4);
        assert_eq!(
            expanded,
            vec![
                CigarFlag::SeqMatch,
                CigarFlag::SeqMatch,
                CigarFlag::Deletion,
                CigarFlag::Insertion,
            ]
        );
    }

    #[test]
    fn test_push_op_coalesces() {
        let mut ops = Vec::new();
        push_op(&mut ops, CigarFlag::SeqMatch, 2);
        push_op(&mut ops, CigarFlag::SeqMatch, 3);
        push_op(&mut ops, CigarFlag::Deletion, 1);
        push_op(&mut ops, CigarFlag::Insertion, 0);
        let text: String = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(text, "5=1D");
    }
}
