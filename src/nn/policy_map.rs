//! Fixed remapping from attention logits to the engine's 1858 move indices.
//!
//! Regular moves are every queen-line or knight move on an empty board, indexed
//! by from-square then ascending to-square. A plain move onto the last rank is
//! the knight promotion. Queen, rook and bishop promotions follow, ordered by
//! from-file, to-file and piece.

use candle_core::{Device, Result, Tensor};

pub const POLICY_OUTPUTS: usize = REGULAR_MOVES + PROMOTIONS;
pub const SQUARE_LOGITS: usize = 64 * 64;
pub const PROMOTION_LOGITS: usize = 8 * 24;
pub const ATTENTION_ROWS: usize = SQUARE_LOGITS + PROMOTION_LOGITS;

const REGULAR_MOVES: usize = OFFSETS[64];
const PROMOTIONS: usize = 22 * 3;

const PROMO_PIECES: [char; 3] = ['q', 'r', 'b'];

/// Policy index of a non-promotion (or knight promotion) move.
pub fn move_index(from: usize, to: usize) -> Option<usize> {
    if from >= 64 || to >= 64 || ALL_DESTINATIONS[from] & (1 << to) == 0 {
        return None;
    }

    let below = ALL_DESTINATIONS[from] & ((1 << to) - 1);
    Some(OFFSETS[from] + below.count_ones() as usize)
}

/// Policy index of a 7th to 8th rank promotion to queen (0), rook (1) or bishop (2).
pub fn promotion_index(from_file: usize, to_file: usize, piece: usize) -> Option<usize> {
    if from_file >= 8 || to_file >= 8 || piece >= 3 || from_file.abs_diff(to_file) > 1 {
        return None;
    }

    let before = if from_file == 0 { 0 } else { 2 + 3 * (from_file - 1) };
    let within = to_file + 1 - from_file.max(1);
    Some(REGULAR_MOVES + 3 * (before + within) + piece)
}

/// For each policy output, the attention logit row it reads.
pub fn attention_sources() -> Vec<u32> {
    let mut sources = vec![u32::MAX; POLICY_OUTPUTS];

    for from in 0..64 {
        for to in 0..64 {
            if let Some(idx) = move_index(from, to) {
                sources[idx] = (from * 64 + to) as u32;
            }
        }
    }

    for from_file in 0..8 {
        for to_file in 0..8 {
            for piece in 0..3 {
                if let Some(idx) = promotion_index(from_file, to_file, piece) {
                    sources[idx] = (SQUARE_LOGITS + from_file * 24 + to_file * 3 + piece) as u32;
                }
            }
        }
    }

    sources
}

/// UCI-style name of a policy index, e.g. `a1b1` or `a7a8q`.
pub fn move_name(index: usize) -> Option<String> {
    let square = |sq: usize| format!("{}{}", (b'a' + (sq % 8) as u8) as char, sq / 8 + 1);

    if index < REGULAR_MOVES {
        let from = OFFSETS.partition_point(|&o| o <= index) - 1;
        let to = (0..64).find(|&to| move_index(from, to) == Some(index))?;
        return Some(format!("{}{}", square(from), square(to)));
    }

    let offset = index.checked_sub(REGULAR_MOVES).filter(|&o| o < PROMOTIONS)?;
    let (pair, piece) = (offset / 3, offset % 3);
    let (from_file, to_file) = (0..8)
        .flat_map(|f: usize| (f.saturating_sub(1)..=(f + 1).min(7)).map(move |t| (f, t)))
        .nth(pair)?;

    Some(format!("{}{}{}", square(48 + from_file), square(56 + to_file), PROMO_PIECES[piece]))
}

/// Gathers `[B, 4096]` square logits and `[B, 192]` promotion logits into `[B, 1858]`.
pub struct AttentionPolicyMap {
    sources: Tensor,
}

impl AttentionPolicyMap {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self { sources: Tensor::from_vec(attention_sources(), POLICY_OUTPUTS, device)? })
    }

    pub fn apply(&self, square_logits: &Tensor, promotion_logits: &Tensor) -> Result<Tensor> {
        let batch = square_logits.dim(0)?;
        let logits =
            Tensor::cat(&[square_logits.reshape((batch, SQUARE_LOGITS))?, promotion_logits.reshape((batch, PROMOTION_LOGITS))?], 1)?;
        logits.index_select(&self.sources, 1)
    }
}

macro_rules! init {
    (|$sq:ident, $size:literal | $($rest:tt)+) => {{
        let mut $sq = 0;
        let mut res = [{$($rest)+}; $size];
        while $sq < $size {
            res[$sq] = {$($rest)+};
            $sq += 1;
        }
        res
    }};
}

const OFFSETS: [usize; 65] = {
    let mut offsets = [0; 65];

    let mut curr = 0;
    let mut sq = 0;

    while sq < 64 {
        offsets[sq] = curr;
        curr += ALL_DESTINATIONS[sq].count_ones() as usize;
        sq += 1;
    }

    offsets[64] = curr;

    offsets
};

const ALL_DESTINATIONS: [u64; 64] = init!(|sq, 64| {
    let rank = sq / 8;
    let file = sq % 8;

    let rooks = (0xFF << (rank * 8)) ^ (A << file);
    let bishops = DIAGS[file + rank].swap_bytes() ^ DIAGS[7 + file - rank];

    rooks | bishops | KNIGHT[sq]
});

const A: u64 = 0x0101_0101_0101_0101;

const DIAGS: [u64; 15] = [
    0x0100_0000_0000_0000,
    0x0201_0000_0000_0000,
    0x0402_0100_0000_0000,
    0x0804_0201_0000_0000,
    0x1008_0402_0100_0000,
    0x2010_0804_0201_0000,
    0x4020_1008_0402_0100,
    0x8040_2010_0804_0201,
    0x0080_4020_1008_0402,
    0x0000_8040_2010_0804,
    0x0000_0080_4020_1008,
    0x0000_0000_8040_2010,
    0x0000_0000_0080_4020,
    0x0000_0000_0000_8040,
    0x0000_0000_0000_0080,
];

const KNIGHT: [u64; 64] = init!(|sq, 64| {
    let n = 1 << sq;
    let h1 = ((n >> 1) & 0x7f7f_7f7f_7f7f_7f7f) | ((n << 1) & 0xfefe_fefe_fefe_fefe);
    let h2 = ((n >> 2) & 0x3f3f_3f3f_3f3f_3f3f) | ((n << 2) & 0xfcfc_fcfc_fcfc_fcfc);
    (h1 << 16) | (h1 >> 16) | (h2 << 8) | (h2 >> 8)
});
