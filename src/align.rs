//! Global alignment with affine gap penalties (Gotoh, 1982), used to
//! decompose complex assembled variants into primitive ones.
//!
//! Three matrices are filled: `H` (best score ending in match/mismatch),
//! `E` (gap in the reference, i.e. insertion) and `F` (gap in the alternate,
//! i.e. deletion). The traceback emits a reference-vs-alternate CIGAR using
//! `=`/`X`/`I`/`D` ops.

use crate::cigar::{push_op, CigarFlag, CigarOp};

/// Scoring model: `{match, mismatch, gap_open, gap_extend}`.
/// The gap-open score already includes the first extension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Model {
    pub match_score: i32,
    pub mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
}

impl Default for Model {
    fn default() -> Self {
        Model {
            match_score: 1,
            mismatch: -4,
            gap_open: -6,
            gap_extend: -1,
        }
    }
}

const NEG_INF: i32 = i32::MIN / 2;

#[derive(Clone, Copy, PartialEq)]
enum State {
    H,
    E,
    F,
}

/// Globally align `alt` against `reference` and return the CIGAR in
/// reference coordinates (`D` consumes reference, `I` consumes alt).
pub fn align(reference: &[u8], alt: &[u8], model: Model) -> Vec<CigarOp> {
    let m = reference.len();
    let n = alt.len();
    if m == 0 {
        let mut cigar = Vec::new();
        push_op(&mut cigar, CigarFlag::Insertion, n as u32);
        return cigar;
    }
    if n == 0 {
        let mut cigar = Vec::new();
        push_op(&mut cigar, CigarFlag::Deletion, m as u32);
        return cigar;
    }

    let rows = m + 1;
    let cols = n + 1;
    let idx = |i: usize, j: usize| -> usize { i * cols + j };

    let mut h = vec![NEG_INF; rows * cols];
    let mut e = vec![NEG_INF; rows * cols];
    let mut f = vec![NEG_INF; rows * cols];

    h[idx(0, 0)] = 0;
    for i in 1..rows {
        h[idx(i, 0)] = model.gap_open + (i as i32 - 1) * model.gap_extend;
        f[idx(i, 0)] = h[idx(i, 0)];
    }
    for j in 1..cols {
        h[idx(0, j)] = model.gap_open + (j as i32 - 1) * model.gap_extend;
        e[idx(0, j)] = h[idx(0, j)];
    }

    for i in 1..rows {
        for j in 1..cols {
            e[idx(i, j)] = (h[idx(i, j - 1)] + model.gap_open).max(e[idx(i, j - 1)] + model.gap_extend);
            f[idx(i, j)] = (h[idx(i - 1, j)] + model.gap_open).max(f[idx(i - 1, j)] + model.gap_extend);
            let sub = if reference[i - 1] == alt[j - 1] {
                model.match_score
            } else {
                model.mismatch
            };
            let diag = h[idx(i - 1, j - 1)] + sub;
            h[idx(i, j)] = diag.max(e[idx(i, j)]).max(f[idx(i, j)]);
        }
    }

    // Traceback, building the CIGAR back to front
    let mut ops_reversed: Vec<CigarOp> = Vec::new();
    let mut i = m;
    let mut j = n;
    let mut state = State::H;
    while i > 0 || j > 0 {
        match state {
            State::H => {
                if i > 0 && j > 0 {
                    let sub = if reference[i - 1] == alt[j - 1] {
                        model.match_score
                    } else {
                        model.mismatch
                    };
                    if h[idx(i, j)] == h[idx(i - 1, j - 1)] + sub {
                        let flag = if reference[i - 1] == alt[j - 1] {
                            CigarFlag::SeqMatch
                        } else {
                            CigarFlag::Substitution
                        };
                        push_op(&mut ops_reversed, flag, 1);
                        i -= 1;
                        j -= 1;
                        continue;
                    }
                }
                if j > 0 && h[idx(i, j)] == e[idx(i, j)] {
                    state = State::E;
                } else {
                    state = State::F;
                }
            }
            State::E => {
                push_op(&mut ops_reversed, CigarFlag::Insertion, 1);
                if h[idx(i, j - 1)] + model.gap_open >= e[idx(i, j - 1)] + model.gap_extend {
                    state = State::H;
                }
                j -= 1;
            }
            State::F => {
                push_op(&mut ops_reversed, CigarFlag::Deletion, 1);
                if h[idx(i - 1, j)] + model.gap_open >= f[idx(i - 1, j)] + model.gap_extend {
                    state = State::H;
                }
                i -= 1;
            }
        }
    }

    let mut cigar = Vec::with_capacity(ops_reversed.len());
    for op in ops_reversed.into_iter().rev() {
        push_op(&mut cigar, op.flag(), op.len());
    }
    cigar
}
